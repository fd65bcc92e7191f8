//! SP800-108 counter-mode key derivation with AES-128-CMAC as the PRF.
//!
//! A single iteration produces the full 128-bit output. The PRF input is a
//! fixed 112-byte block, little-endian, packed as:
//!
//! ```text
//! counter:u32 = 1 ‖ label[64] (NUL-padded) ‖ node_number:u64
//!             ‖ nonce[32] (16-byte flavour zero-padded) ‖ output_len:u32 = 0x80
//! ```
//!
//! Two nonce flavours exist: per-node keys draw a fresh 16-byte nonce on
//! every derivation (the key is used once and then only its ciphertext
//! survives), while the metadata key uses a 32-byte nonce persisted in the
//! metadata plain part so the same key can be re-derived on reopen.

use sealfs_error::{Result, SealError};
use sealfs_types::KEY_SIZE;
use zeroize::Zeroizing;

use crate::mac::cmac_128;
use crate::platform::Platform;
use crate::Key128;

/// Label for the per-session master key.
pub const MASTER_KEY_LABEL: &str = "SGX-PROTECTED-FS-MASTER-KEY";

/// Label for per-node random keys.
pub const RANDOM_KEY_LABEL: &str = "SGX-PROTECTED-FS-RANDOM-KEY";

/// Label for the metadata key derived from a user KDK.
pub const METADATA_KEY_LABEL: &str = "SGX-PROTECTED-FS-METADATA-KEY";

/// The session master key is rotated after this many derivations.
pub const MAX_MASTER_KEY_USAGES: u32 = 65536;

const MAX_LABEL_LEN: usize = 64;
const KDF_INPUT_SIZE: usize = 4 + MAX_LABEL_LEN + 8 + 32 + 4;

/// Pack the fixed PRF input block.
///
/// `nonce` must be 16 or 32 bytes; the 16-byte flavour occupies the first
/// half of the nonce area and the rest stays zero.
fn pack_kdf_input(
    label: &str,
    node_number: u64,
    nonce: &[u8],
) -> Result<Zeroizing<[u8; KDF_INPUT_SIZE]>> {
    let label_bytes = label.as_bytes();
    if label_bytes.is_empty() || label_bytes.len() > MAX_LABEL_LEN {
        return Err(SealError::invalid_argument("KDF label length"));
    }
    if nonce.len() != 16 && nonce.len() != 32 {
        return Err(SealError::invalid_argument("KDF nonce length"));
    }

    let mut buf = Zeroizing::new([0u8; KDF_INPUT_SIZE]);
    buf[0..4].copy_from_slice(&1u32.to_le_bytes());
    buf[4..4 + label_bytes.len()].copy_from_slice(label_bytes);
    buf[68..76].copy_from_slice(&node_number.to_le_bytes());
    buf[76..76 + nonce.len()].copy_from_slice(nonce);
    buf[108..112].copy_from_slice(&0x80u32.to_le_bytes());
    Ok(buf)
}

/// One SP800-108 derivation: CMAC the packed input block under `key`.
fn derive(key: &[u8; KEY_SIZE], label: &str, node_number: u64, nonce: &[u8]) -> Result<Key128> {
    let input = pack_kdf_input(label, node_number, nonce)?;
    Ok(Key128::from_bytes(cmac_128(key, input.as_ref())))
}

/// Re-derive the metadata key from a user KDK and the stored 32-byte key-id.
pub fn derive_metadata_key(kdk: &Key128, key_id: &[u8; 32]) -> Result<Key128> {
    derive(kdk.as_bytes(), METADATA_KEY_LABEL, 0, key_id)
}

/// Derive a fresh metadata key from a user KDK under a newly drawn 32-byte
/// key-id, returning both; the key-id must be persisted in the metadata
/// plain part so the key can be re-derived on reopen.
pub fn fresh_metadata_key(kdk: &Key128, platform: &dyn Platform) -> Result<(Key128, [u8; 32])> {
    let mut key_id = [0u8; 32];
    platform.fill_random(&mut key_id)?;
    let key = derive_metadata_key(kdk, &key_id)?;
    Ok((key, key_id))
}

/// The per-session master key from which per-node keys are derived.
///
/// Re-derived from the zero key under a fresh nonce at construction and
/// again after [`MAX_MASTER_KEY_USAGES`] derivations.
pub struct SessionMasterKey {
    key: Key128,
    uses: u32,
}

impl SessionMasterKey {
    /// Draw a fresh session master key.
    pub fn new(platform: &dyn Platform) -> Result<Self> {
        let mut key = Self {
            key: Key128::from_bytes([0; KEY_SIZE]),
            uses: 0,
        };
        key.rotate(platform)?;
        Ok(key)
    }

    fn rotate(&mut self, platform: &dyn Platform) -> Result<()> {
        let mut nonce = [0u8; 16];
        platform.fill_random(&mut nonce)?;
        self.key = derive(&[0; KEY_SIZE], MASTER_KEY_LABEL, 0, &nonce)?;
        self.uses = 0;
        Ok(())
    }

    /// Derive a single-use key for the node at `physical_node_number`.
    pub fn derive_node_key(
        &mut self,
        platform: &dyn Platform,
        physical_node_number: u64,
    ) -> Result<Key128> {
        if self.uses >= MAX_MASTER_KEY_USAGES {
            self.rotate(platform)?;
        }
        self.uses += 1;

        let mut nonce = [0u8; 16];
        platform.fill_random(&mut nonce)?;
        derive(self.key.as_bytes(), RANDOM_KEY_LABEL, physical_node_number, &nonce)
    }
}
