//! LRU cache of plaintext nodes, keyed by physical node number.
//!
//! The cache itself is unbounded; the file object enforces the soft cap and
//! the eviction policy (clean victims are dropped, a dirty victim forces an
//! internal flush first). Evicted nodes scrub their plaintext on drop.

use lru::LruCache;
use sealfs_types::NodeNumber;

use crate::node::CachedNode;

/// Soft cap on resident plaintext nodes: covers the deepest MHT parent
/// chain plus a small working set.
pub(crate) const DEFAULT_CACHE_CAP: usize = 48;

pub(crate) struct NodeCache {
    inner: LruCache<u64, CachedNode>,
}

impl NodeCache {
    pub(crate) fn new() -> Self {
        Self {
            inner: LruCache::unbounded(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    pub(crate) fn contains(&self, physical: NodeNumber) -> bool {
        self.inner.contains(&physical.get())
    }

    /// Look up a node and bump it to most-recently-used.
    pub(crate) fn get(&mut self, physical: NodeNumber) -> Option<&mut CachedNode> {
        self.inner.get_mut(&physical.get())
    }

    /// Look up a node without affecting recency.
    pub(crate) fn find(&self, physical: NodeNumber) -> Option<&CachedNode> {
        self.inner.peek(&physical.get())
    }

    /// Look up a node mutably without affecting recency.
    pub(crate) fn find_mut(&mut self, physical: NodeNumber) -> Option<&mut CachedNode> {
        self.inner.peek_mut(&physical.get())
    }

    pub(crate) fn insert(&mut self, node: CachedNode) {
        self.inner.put(node.physical.get(), node);
    }

    /// The least-recently-used entry, if any.
    pub(crate) fn peek_lru(&self) -> Option<&CachedNode> {
        self.inner.peek_lru().map(|(_, node)| node)
    }

    /// Drop the least-recently-used entry (plaintext is scrubbed on drop).
    pub(crate) fn pop_lru(&mut self) -> Option<CachedNode> {
        self.inner.pop_lru().map(|(_, node)| node)
    }

    /// Physical numbers of every cached node for which `pred` holds,
    /// in no particular order.
    pub(crate) fn physicals_where(&self, pred: impl Fn(&CachedNode) -> bool) -> Vec<NodeNumber> {
        self.inner
            .iter()
            .filter(|(_, node)| pred(node))
            .map(|(_, node)| node.physical)
            .collect()
    }

    /// Drop every cached node.
    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }
}
