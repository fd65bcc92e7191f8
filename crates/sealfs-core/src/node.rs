//! In-memory node objects held by the cache.
//!
//! A cached node is a tagged variant over the two plaintext shapes (MHT,
//! data) with a common header: its physical number, its logical ordinal,
//! and the dirty flag. Each node also retains a ciphertext buffer holding
//! its current on-disk image; during a flush the pre-image is journaled
//! from that buffer and then overwritten in place by the re-encryption.
//!
//! Nodes never point at their parents — parent lookups go through the
//! cache by physical number, which keeps the cache the single owner.

use sealfs_types::{MhtNode, NodeNumber, NODE_SIZE};
use zeroize::Zeroize;

/// Plaintext payload of a cached node.
pub(crate) enum NodePayload {
    /// Crypto slots for child nodes; no user bytes.
    Mht(MhtNode),
    /// 4096 bytes of user data.
    Data(Box<[u8; NODE_SIZE]>),
}

/// One plaintext node resident in the cache.
pub(crate) struct CachedNode {
    /// Physical node number in the container.
    pub physical: NodeNumber,
    /// Data-node index or MHT ordinal, depending on the payload.
    pub logical: u64,
    /// Whether the plaintext has diverged from the on-disk image.
    pub dirty: bool,
    /// Whether the container already holds an image of this node.
    pub on_disk: bool,
    /// Plaintext payload.
    pub payload: NodePayload,
    /// Current on-disk image (pre-image until re-encrypted at flush).
    pub cipher: Box<[u8; NODE_SIZE]>,
}

impl CachedNode {
    /// A data node fetched from disk.
    pub(crate) fn data_from_disk(
        physical: NodeNumber,
        logical: u64,
        plain: Box<[u8; NODE_SIZE]>,
        cipher: Box<[u8; NODE_SIZE]>,
    ) -> Self {
        Self {
            physical,
            logical,
            dirty: false,
            on_disk: true,
            payload: NodePayload::Data(plain),
            cipher,
        }
    }

    /// A freshly appended, zero-filled data node with no on-disk image.
    pub(crate) fn data_new(physical: NodeNumber, logical: u64) -> Self {
        Self {
            physical,
            logical,
            dirty: false,
            on_disk: false,
            payload: NodePayload::Data(Box::new([0; NODE_SIZE])),
            cipher: Box::new([0; NODE_SIZE]),
        }
    }

    /// An MHT node fetched from disk.
    pub(crate) fn mht_from_disk(
        physical: NodeNumber,
        logical: u64,
        plain: MhtNode,
        cipher: Box<[u8; NODE_SIZE]>,
    ) -> Self {
        Self {
            physical,
            logical,
            dirty: false,
            on_disk: true,
            payload: NodePayload::Mht(plain),
            cipher,
        }
    }

    /// A freshly appended, empty MHT node with no on-disk image.
    pub(crate) fn mht_new(physical: NodeNumber, logical: u64) -> Self {
        Self {
            physical,
            logical,
            dirty: false,
            on_disk: false,
            payload: NodePayload::Mht(MhtNode::default()),
            cipher: Box::new([0; NODE_SIZE]),
        }
    }

    /// Whether this is an MHT node.
    pub(crate) fn is_mht(&self) -> bool {
        matches!(self.payload, NodePayload::Mht(_))
    }

    /// Data payload; panics if this is an MHT node.
    pub(crate) fn data(&self) -> &[u8; NODE_SIZE] {
        match &self.payload {
            NodePayload::Data(d) => d,
            NodePayload::Mht(_) => unreachable!("data access on MHT node"),
        }
    }

    /// Mutable data payload; panics if this is an MHT node.
    pub(crate) fn data_mut(&mut self) -> &mut [u8; NODE_SIZE] {
        match &mut self.payload {
            NodePayload::Data(d) => d,
            NodePayload::Mht(_) => unreachable!("data access on MHT node"),
        }
    }

    /// MHT payload; panics if this is a data node.
    pub(crate) fn mht(&self) -> &MhtNode {
        match &self.payload {
            NodePayload::Mht(m) => m,
            NodePayload::Data(_) => unreachable!("MHT access on data node"),
        }
    }

    /// Mutable MHT payload; panics if this is a data node.
    pub(crate) fn mht_mut(&mut self) -> &mut MhtNode {
        match &mut self.payload {
            NodePayload::Mht(m) => m,
            NodePayload::Data(_) => unreachable!("MHT access on data node"),
        }
    }
}

impl Drop for CachedNode {
    fn drop(&mut self) {
        // Scrub the plaintext before the allocation is freed.
        match &mut self.payload {
            NodePayload::Mht(m) => m.zeroize(),
            NodePayload::Data(d) => d.zeroize(),
        }
    }
}
