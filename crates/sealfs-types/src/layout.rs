//! On-disk node layouts.
//!
//! All layouts are little-endian and packed; offsets are frozen. The
//! metadata node is:
//!
//! ```text
//! ┌────────────────┬──────────────────────────┬─────────────┐
//! │ plain part     │ encrypted part (sealed)  │ zero pad    │
//! │ 94 bytes       │ 3392 bytes               │ 610 bytes   │
//! └────────────────┴──────────────────────────┴─────────────┘
//! ```
//!
//! The encrypted part seals the canonical filename, the logical size, the
//! root MHT key/GMAC, and a 3072-byte inline user-data region that lets
//! small files live entirely inside node 0.
//!
//! An MHT node is 96 data-node crypto slots followed by 32 child-MHT crypto
//! slots, each slot a `(key, gmac)` pair: `96·32 + 32·32 = 4096`.

use sealfs_error::{Result, SealError};
use zeroize::Zeroize;

use crate::{KEY_SIZE, MAC_SIZE, NODE_SIZE};

/// File magic stored in the metadata plain part ("`SGX_FILE`").
pub const SEALFS_MAGIC: u64 = 0x5347_585F_4649_4C45;

/// Current major format version.
pub const SEALFS_MAJOR_VERSION: u8 = 1;

/// Current minor format version.
pub const SEALFS_MINOR_VERSION: u8 = 0;

/// Maximum stored filename length, including the terminating NUL.
pub const FILENAME_MAX_LEN: usize = 260;

/// Size of the inline user-data region in the encrypted metadata part.
pub const MD_USER_DATA_SIZE: usize = NODE_SIZE * 3 / 4;

/// Serialized size of the metadata plain part.
pub const META_PLAIN_SIZE: usize = 94;

/// Serialized size of the metadata encrypted part.
pub const META_ENCRYPTED_SIZE: usize = FILENAME_MAX_LEN + 8 + 16 + 4 + KEY_SIZE + MAC_SIZE + MD_USER_DATA_SIZE;

/// Serialized size of one recovery-journal record.
pub const RECOVERY_RECORD_SIZE: usize = 8 + NODE_SIZE;

// ---------------------------------------------------------------------------
// Metadata plain part
// ---------------------------------------------------------------------------

/// The authenticated-but-not-encrypted head of the metadata node.
///
/// `cpu_svn`, `isv_svn`, and `attribute_mask` are reserved for platform
/// key-policy data: written as zero on create and preserved byte-for-byte
/// on rewrite.
#[derive(Debug, Clone)]
pub struct MetaPlain {
    /// File magic; must equal [`SEALFS_MAGIC`].
    pub file_id: u64,
    /// Major format version.
    pub major_version: u8,
    /// Minor format version.
    pub minor_version: u8,
    /// Nonce from which the metadata key is re-derived on reopen.
    pub meta_data_key_id: [u8; 32],
    /// Reserved platform field.
    pub cpu_svn: [u8; 16],
    /// Reserved platform field.
    pub isv_svn: u16,
    /// 1 if the metadata key derives from a caller-supplied KDK.
    pub use_user_kdk_key: u8,
    /// Reserved platform field (flags, xfrm).
    pub attribute_mask: (u64, u64),
    /// GCM tag over the encrypted metadata part.
    pub meta_data_gmac: [u8; MAC_SIZE],
    /// Set to 1 for the duration of a flush commit; 1 on disk means a crash
    /// happened mid-update and the recovery journal must be replayed.
    pub update_flag: u8,
}

impl Default for MetaPlain {
    fn default() -> Self {
        Self {
            file_id: SEALFS_MAGIC,
            major_version: SEALFS_MAJOR_VERSION,
            minor_version: SEALFS_MINOR_VERSION,
            meta_data_key_id: [0; 32],
            cpu_svn: [0; 16],
            isv_svn: 0,
            use_user_kdk_key: 0,
            attribute_mask: (0, 0),
            meta_data_gmac: [0; MAC_SIZE],
            update_flag: 0,
        }
    }
}

impl MetaPlain {
    /// Serialize into the head of a metadata node buffer.
    pub fn encode(&self, node: &mut [u8; NODE_SIZE]) {
        node[0..8].copy_from_slice(&self.file_id.to_le_bytes());
        node[8] = self.major_version;
        node[9] = self.minor_version;
        node[10..42].copy_from_slice(&self.meta_data_key_id);
        node[42..58].copy_from_slice(&self.cpu_svn);
        node[58..60].copy_from_slice(&self.isv_svn.to_le_bytes());
        node[60] = self.use_user_kdk_key;
        node[61..69].copy_from_slice(&self.attribute_mask.0.to_le_bytes());
        node[69..77].copy_from_slice(&self.attribute_mask.1.to_le_bytes());
        node[77..93].copy_from_slice(&self.meta_data_gmac);
        node[93] = self.update_flag;
    }

    /// Parse the head of a metadata node buffer.
    ///
    /// This is a pure shape decode; magic/version checks are the caller's.
    #[must_use]
    pub fn decode(node: &[u8; NODE_SIZE]) -> Self {
        let mut meta_data_key_id = [0u8; 32];
        meta_data_key_id.copy_from_slice(&node[10..42]);
        let mut cpu_svn = [0u8; 16];
        cpu_svn.copy_from_slice(&node[42..58]);
        let mut meta_data_gmac = [0u8; MAC_SIZE];
        meta_data_gmac.copy_from_slice(&node[77..93]);
        Self {
            file_id: u64::from_le_bytes(node[0..8].try_into().expect("8-byte slice")),
            major_version: node[8],
            minor_version: node[9],
            meta_data_key_id,
            cpu_svn,
            isv_svn: u16::from_le_bytes(node[58..60].try_into().expect("2-byte slice")),
            use_user_kdk_key: node[60],
            attribute_mask: (
                u64::from_le_bytes(node[61..69].try_into().expect("8-byte slice")),
                u64::from_le_bytes(node[69..77].try_into().expect("8-byte slice")),
            ),
            meta_data_gmac,
            update_flag: node[93],
        }
    }
}

// ---------------------------------------------------------------------------
// Metadata encrypted part
// ---------------------------------------------------------------------------

/// The sealed body of the metadata node (plaintext form).
///
/// Holds the only copy of the root MHT key, so authenticating the metadata
/// transitively authenticates the whole tree. `mc_uuid` / `mc_value` are
/// reserved monotonic-counter fields, always zero.
#[derive(Clone, Zeroize)]
pub struct MetaEncrypted {
    /// Canonical basename, NUL-terminated.
    pub clean_filename: [u8; FILENAME_MAX_LEN],
    /// Logical file size in bytes.
    pub size: i64,
    /// Reserved, zero.
    pub mc_uuid: [u8; 16],
    /// Reserved, zero.
    pub mc_value: u32,
    /// Key that decrypts the root MHT node.
    pub mht_key: [u8; KEY_SIZE],
    /// GCM tag over the root MHT node.
    pub mht_gmac: [u8; MAC_SIZE],
    /// Inline user data; files up to this size need no MHT at all.
    pub data: [u8; MD_USER_DATA_SIZE],
}

impl Default for MetaEncrypted {
    fn default() -> Self {
        Self {
            clean_filename: [0; FILENAME_MAX_LEN],
            size: 0,
            mc_uuid: [0; 16],
            mc_value: 0,
            mht_key: [0; KEY_SIZE],
            mht_gmac: [0; MAC_SIZE],
            data: [0; MD_USER_DATA_SIZE],
        }
    }
}

impl std::fmt::Debug for MetaEncrypted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaEncrypted")
            .field("clean_filename", &self.filename())
            .field("size", &self.size)
            .field("mht_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl MetaEncrypted {
    /// Store the canonical basename.
    ///
    /// Fails if the name is empty or does not fit with its terminating NUL.
    pub fn set_filename(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= FILENAME_MAX_LEN || bytes.contains(&0) {
            return Err(SealError::InvalidPath { path: name.into() });
        }
        self.clean_filename = [0; FILENAME_MAX_LEN];
        self.clean_filename[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// The stored basename, up to the first NUL.
    #[must_use]
    pub fn filename(&self) -> String {
        let end = self
            .clean_filename
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_MAX_LEN);
        String::from_utf8_lossy(&self.clean_filename[..end]).into_owned()
    }

    /// Serialize to the fixed wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; META_ENCRYPTED_SIZE] {
        let mut out = [0u8; META_ENCRYPTED_SIZE];
        out[0..260].copy_from_slice(&self.clean_filename);
        out[260..268].copy_from_slice(&self.size.to_le_bytes());
        out[268..284].copy_from_slice(&self.mc_uuid);
        out[284..288].copy_from_slice(&self.mc_value.to_le_bytes());
        out[288..304].copy_from_slice(&self.mht_key);
        out[304..320].copy_from_slice(&self.mht_gmac);
        out[320..].copy_from_slice(&self.data);
        out
    }

    /// Parse from the fixed wire form.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; META_ENCRYPTED_SIZE]) -> Self {
        let mut out = Self::default();
        out.clean_filename.copy_from_slice(&bytes[0..260]);
        out.size = i64::from_le_bytes(bytes[260..268].try_into().expect("8-byte slice"));
        out.mc_uuid.copy_from_slice(&bytes[268..284]);
        out.mc_value = u32::from_le_bytes(bytes[284..288].try_into().expect("4-byte slice"));
        out.mht_key.copy_from_slice(&bytes[288..304]);
        out.mht_gmac.copy_from_slice(&bytes[304..320]);
        out.data.copy_from_slice(&bytes[320..]);
        out
    }
}

// ---------------------------------------------------------------------------
// MHT node
// ---------------------------------------------------------------------------

/// One `(key, gmac)` crypto slot for a child node.
#[derive(Clone, Copy, PartialEq, Eq, Zeroize)]
pub struct NodeCrypto {
    /// Key that decrypts the child.
    pub key: [u8; KEY_SIZE],
    /// GCM tag over the child's ciphertext.
    pub gmac: [u8; MAC_SIZE],
}

impl NodeCrypto {
    /// An all-zero slot (no child written yet).
    pub const ZEROED: Self = Self {
        key: [0; KEY_SIZE],
        gmac: [0; MAC_SIZE],
    };
}

impl std::fmt::Debug for NodeCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCrypto")
            .field("key", &"[REDACTED]")
            .field("gmac", &self.gmac)
            .finish()
    }
}

/// An MHT node in plaintext form: crypto slots for up to 96 attached data
/// nodes and 32 child MHT nodes. Contains no user bytes.
#[derive(Clone, Zeroize)]
pub struct MhtNode {
    data_slots: [NodeCrypto; 96],
    mht_slots: [NodeCrypto; 32],
}

impl Default for MhtNode {
    fn default() -> Self {
        Self {
            data_slots: [NodeCrypto::ZEROED; 96],
            mht_slots: [NodeCrypto::ZEROED; 32],
        }
    }
}

impl std::fmt::Debug for MhtNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MhtNode").finish_non_exhaustive()
    }
}

impl MhtNode {
    /// Crypto slot for attached data node `slot`.
    #[must_use]
    pub fn data_slot(&self, slot: usize) -> &NodeCrypto {
        &self.data_slots[slot]
    }

    /// Mutable crypto slot for attached data node `slot`.
    pub fn data_slot_mut(&mut self, slot: usize) -> &mut NodeCrypto {
        &mut self.data_slots[slot]
    }

    /// Crypto slot for child MHT node `slot`.
    #[must_use]
    pub fn mht_slot(&self, slot: usize) -> &NodeCrypto {
        &self.mht_slots[slot]
    }

    /// Mutable crypto slot for child MHT node `slot`.
    pub fn mht_slot_mut(&mut self, slot: usize) -> &mut NodeCrypto {
        &mut self.mht_slots[slot]
    }

    /// Serialize to a full node buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Box<[u8; NODE_SIZE]> {
        let mut out = Box::new([0u8; NODE_SIZE]);
        for (i, slot) in self.data_slots.iter().chain(self.mht_slots.iter()).enumerate() {
            let off = i * 32;
            out[off..off + 16].copy_from_slice(&slot.key);
            out[off + 16..off + 32].copy_from_slice(&slot.gmac);
        }
        out
    }

    /// Parse from a full node buffer.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; NODE_SIZE]) -> Self {
        let mut node = Self::default();
        for (i, slot) in node
            .data_slots
            .iter_mut()
            .chain(node.mht_slots.iter_mut())
            .enumerate()
        {
            let off = i * 32;
            slot.key.copy_from_slice(&bytes[off..off + 16]);
            slot.gmac.copy_from_slice(&bytes[off + 16..off + 32]);
        }
        node
    }
}

// ---------------------------------------------------------------------------
// Recovery record
// ---------------------------------------------------------------------------

/// One pre-image record in the recovery journal: the physical node number
/// followed by the node's original on-disk bytes.
pub struct RecoveryRecord {
    /// Physical node number the pre-image belongs to.
    pub physical_node_number: u64,
    /// The node's bytes as they were on disk before the flush.
    pub bytes: Box<[u8; NODE_SIZE]>,
}

impl RecoveryRecord {
    /// Serialize to the fixed wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECOVERY_RECORD_SIZE);
        out.extend_from_slice(&self.physical_node_number.to_le_bytes());
        out.extend_from_slice(&self.bytes[..]);
        out
    }

    /// Parse from the fixed wire form.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != RECOVERY_RECORD_SIZE {
            return Err(SealError::RecoveryCorrupt {
                size: raw.len() as u64,
            });
        }
        let physical_node_number = u64::from_le_bytes(raw[0..8].try_into().expect("8-byte slice"));
        let mut bytes = Box::new([0u8; NODE_SIZE]);
        bytes.copy_from_slice(&raw[8..]);
        Ok(Self {
            physical_node_number,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_sizes() {
        assert_eq!(META_PLAIN_SIZE, 94);
        assert_eq!(META_ENCRYPTED_SIZE, 3392);
        assert_eq!(MD_USER_DATA_SIZE, 3072);
        assert_eq!(META_PLAIN_SIZE + META_ENCRYPTED_SIZE + 610, NODE_SIZE);
        assert_eq!(RECOVERY_RECORD_SIZE, 4104);
    }

    #[test]
    fn meta_plain_roundtrip() {
        let mut plain = MetaPlain::default();
        plain.meta_data_key_id = [0xAB; 32];
        plain.isv_svn = 7;
        plain.use_user_kdk_key = 1;
        plain.attribute_mask = (0x1122_3344, 0x5566);
        plain.meta_data_gmac = [0xCD; 16];
        plain.update_flag = 1;

        let mut node = [0u8; NODE_SIZE];
        plain.encode(&mut node);
        let back = MetaPlain::decode(&node);

        assert_eq!(back.file_id, SEALFS_MAGIC);
        assert_eq!(back.major_version, SEALFS_MAJOR_VERSION);
        assert_eq!(back.minor_version, SEALFS_MINOR_VERSION);
        assert_eq!(back.meta_data_key_id, [0xAB; 32]);
        assert_eq!(back.isv_svn, 7);
        assert_eq!(back.use_user_kdk_key, 1);
        assert_eq!(back.attribute_mask, (0x1122_3344, 0x5566));
        assert_eq!(back.meta_data_gmac, [0xCD; 16]);
        assert_eq!(back.update_flag, 1);
    }

    #[test]
    fn meta_plain_field_offsets() {
        // The byte positions are frozen; spot-check the load-bearing ones.
        let mut plain = MetaPlain::default();
        plain.update_flag = 1;
        plain.meta_data_gmac = [0xEE; 16];
        let mut node = [0u8; NODE_SIZE];
        plain.encode(&mut node);

        assert_eq!(&node[0..8], &SEALFS_MAGIC.to_le_bytes());
        assert_eq!(node[8], 1);
        assert_eq!(node[93], 1);
        assert!(node[77..93].iter().all(|&b| b == 0xEE));
        // Padding beyond the plain part stays untouched by encode.
        assert!(node[94..].iter().all(|&b| b == 0));
    }

    #[test]
    fn meta_encrypted_roundtrip() {
        let mut enc = MetaEncrypted::default();
        enc.set_filename("secrets.db").unwrap();
        enc.size = 123_456;
        enc.mht_key = [0x11; 16];
        enc.mht_gmac = [0x22; 16];
        enc.data[0] = 0xAA;
        enc.data[MD_USER_DATA_SIZE - 1] = 0xBB;

        let bytes = enc.to_bytes();
        let back = MetaEncrypted::from_bytes(&bytes);
        assert_eq!(back.filename(), "secrets.db");
        assert_eq!(back.size, 123_456);
        assert_eq!(back.mht_key, [0x11; 16]);
        assert_eq!(back.mht_gmac, [0x22; 16]);
        assert_eq!(back.data[0], 0xAA);
        assert_eq!(back.data[MD_USER_DATA_SIZE - 1], 0xBB);
    }

    #[test]
    fn filename_limits() {
        let mut enc = MetaEncrypted::default();
        assert!(enc.set_filename("").is_err());
        let long = "x".repeat(FILENAME_MAX_LEN);
        assert!(enc.set_filename(&long).is_err());
        let just_fits = "x".repeat(FILENAME_MAX_LEN - 1);
        assert!(enc.set_filename(&just_fits).is_ok());
        assert_eq!(enc.filename(), just_fits);
    }

    #[test]
    fn mht_node_roundtrip() {
        let mut node = MhtNode::default();
        node.data_slot_mut(0).key = [1; 16];
        node.data_slot_mut(95).gmac = [2; 16];
        node.mht_slot_mut(0).key = [3; 16];
        node.mht_slot_mut(31).gmac = [4; 16];

        let bytes = node.to_bytes();
        // Data slots occupy the first 3072 bytes, MHT slots the last 1024.
        assert_eq!(&bytes[0..16], &[1; 16]);
        assert_eq!(&bytes[95 * 32 + 16..96 * 32], &[2; 16]);
        assert_eq!(&bytes[96 * 32..96 * 32 + 16], &[3; 16]);
        assert_eq!(&bytes[NODE_SIZE - 16..], &[4; 16]);

        let back = MhtNode::from_bytes(&bytes);
        assert_eq!(back.data_slot(0).key, [1; 16]);
        assert_eq!(back.data_slot(95).gmac, [2; 16]);
        assert_eq!(back.mht_slot(0).key, [3; 16]);
        assert_eq!(back.mht_slot(31).gmac, [4; 16]);
    }

    #[test]
    fn recovery_record_roundtrip() {
        let rec = RecoveryRecord {
            physical_node_number: 42,
            bytes: Box::new([0x5A; NODE_SIZE]),
        };
        let wire = rec.encode();
        assert_eq!(wire.len(), RECOVERY_RECORD_SIZE);

        let back = RecoveryRecord::decode(&wire).unwrap();
        assert_eq!(back.physical_node_number, 42);
        assert_eq!(back.bytes[..], [0x5A; NODE_SIZE][..]);

        assert!(RecoveryRecord::decode(&wire[..wire.len() - 1]).is_err());
    }
}
