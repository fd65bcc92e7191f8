//! MHT engine: parent-chain traversal and node fetch.
//!
//! Bringing a node into the cache means walking from the root MHT down to
//! the node's parent, decrypting each level with the `(key, gmac)` stored
//! one level up. GCM authentication *is* the tree verification — there is
//! no separate hash check, and a tag mismatch anywhere is terminal.

use sealfs_crypto::{aead_decrypt, EMPTY_IV};
use sealfs_error::Result;
use sealfs_types::address::{
    data_slot_in_mht, mht_of_data, mht_slot_in_parent, parent_of_mht, physical_of_data,
    physical_of_mht,
};
use sealfs_types::{MhtNode, NodeCrypto, NODE_SIZE};
use sealfs_vfs::Vfs;
use tracing::trace;
use zeroize::Zeroize;

use crate::cache::DEFAULT_CACHE_CAP;
use crate::file::{read_node_raw, FileInner};
use crate::node::CachedNode;

impl<V: Vfs> FileInner<V> {
    /// Whether the container already holds an image of this node.
    fn node_on_disk(&self, physical: sealfs_types::NodeNumber) -> bool {
        physical.byte_offset() + NODE_SIZE as u64 <= self.real_file_size
    }

    /// Bring MHT node `m` into the cache (0 is the root), fetching and
    /// authenticating the parent chain as needed.
    pub(crate) fn ensure_mht_node(&mut self, m: u64) -> Result<()> {
        let physical = physical_of_mht(m);
        if self.cache.get(physical).is_some() {
            return Ok(());
        }

        if !self.node_on_disk(physical) {
            // Appending: materialize the (possibly also new) parent first.
            if m > 0 {
                self.ensure_mht_node(parent_of_mht(m))?;
            }
            trace!(mht = m, physical = %physical, "appending empty MHT node");
            self.cache.insert(CachedNode::mht_new(physical, m));
            return Ok(());
        }

        let slot = if m == 0 {
            // The root's crypto material lives in the sealed metadata.
            NodeCrypto {
                key: self.meta_encrypted.mht_key,
                gmac: self.meta_encrypted.mht_gmac,
            }
        } else {
            let parent = parent_of_mht(m);
            self.ensure_mht_node(parent)?;
            let parent_node = self
                .cache
                .find(physical_of_mht(parent))
                .expect("parent was just ensured");
            *parent_node.mht().mht_slot(mht_slot_in_parent(m))
        };

        let cipher = read_node_raw(self.host_mut()?, physical)?;
        let mut plain = Box::new([0u8; NODE_SIZE]);
        aead_decrypt(
            &slot.key,
            &EMPTY_IV,
            b"",
            &cipher[..],
            &slot.gmac,
            &mut plain[..],
        )?;
        let node = MhtNode::from_bytes(&plain);
        plain.zeroize();

        trace!(mht = m, physical = %physical, "fetched MHT node");
        self.cache
            .insert(CachedNode::mht_from_disk(physical, m, node, cipher));
        Ok(())
    }

    /// Bring logical data node `index` into the cache and return it.
    pub(crate) fn get_data_node(&mut self, index: u64) -> Result<&mut CachedNode> {
        let physical = physical_of_data(index);
        if !self.cache.contains(physical) {
            self.shrink_cache()?;
            let mht = mht_of_data(index);
            self.ensure_mht_node(mht)?;

            if self.node_on_disk(physical) {
                let parent = self
                    .cache
                    .find(physical_of_mht(mht))
                    .expect("parent was just ensured");
                let slot = *parent.mht().data_slot(data_slot_in_mht(index));

                let cipher = read_node_raw(self.host_mut()?, physical)?;
                let mut plain = Box::new([0u8; NODE_SIZE]);
                aead_decrypt(
                    &slot.key,
                    &EMPTY_IV,
                    b"",
                    &cipher[..],
                    &slot.gmac,
                    &mut plain[..],
                )?;
                self.cache
                    .insert(CachedNode::data_from_disk(physical, index, plain, cipher));
            } else {
                trace!(index, physical = %physical, "appending empty data node");
                self.cache.insert(CachedNode::data_new(physical, index));
            }
        }
        Ok(self.cache.get(physical).expect("node was just ensured"))
    }

    /// Enforce the cache's soft cap.
    ///
    /// Clean LRU victims are dropped (their plaintext is scrubbed); a dirty
    /// victim forces an internal flush first, after which everything is
    /// clean and evictable. The eviction-triggered flush does not sync.
    pub(crate) fn shrink_cache(&mut self) -> Result<()> {
        while self.cache.len() >= DEFAULT_CACHE_CAP {
            let victim_is_dirty = match self.cache.peek_lru() {
                Some(node) => node.dirty,
                None => break,
            };
            if victim_is_dirty {
                trace!("dirty LRU victim; flushing before eviction");
                self.internal_flush(false)?;
            } else {
                drop(self.cache.pop_lru());
            }
        }
        Ok(())
    }
}
