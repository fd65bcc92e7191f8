//! Core types shared across the sealfs crates: the frozen 4096-byte node
//! layouts, physical node addressing, and open-mode parsing.
//!
//! The container format is fixed. Every on-disk unit is a [`NODE_SIZE`]-byte
//! node; node 0 is the metadata node, node 1 the root MHT node, and data
//! nodes follow in blocks of 96 behind their parent MHT node. Any deviation
//! from the layouts or the addressing arithmetic in this crate breaks the
//! parent-child authentication chain.

pub mod address;
pub mod layout;
pub mod mode;

pub use address::NodeNumber;
pub use layout::{
    MetaEncrypted, MetaPlain, MhtNode, NodeCrypto, RecoveryRecord, FILENAME_MAX_LEN,
    MD_USER_DATA_SIZE, META_ENCRYPTED_SIZE, META_PLAIN_SIZE, RECOVERY_RECORD_SIZE,
    SEALFS_MAJOR_VERSION, SEALFS_MAGIC, SEALFS_MINOR_VERSION,
};
pub use mode::OpenMode;

/// Size of every on-disk node in bytes.
pub const NODE_SIZE: usize = 4096;

/// Number of data-node crypto slots in an MHT node (3/4 of the node).
pub const ATTACHED_DATA_NODES_COUNT: u64 = 96;

/// Number of child-MHT crypto slots in an MHT node (1/4 of the node).
pub const CHILD_MHT_NODES_COUNT: u64 = 32;

/// Suffix appended to the data-file path to form the recovery-journal path.
pub const RECOVERY_FILE_SUFFIX: &str = "_recovery";

/// AES-128 key size in bytes.
pub const KEY_SIZE: usize = 16;

/// GCM tag / CMAC tag size in bytes.
pub const MAC_SIZE: usize = 16;

/// GCM IV size in bytes.
pub const IV_SIZE: usize = 12;
