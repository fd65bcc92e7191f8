//! Cryptographic primitives for sealfs.
//!
//! Everything is AES-128: GCM for node sealing (12-byte IV, 16-byte tag),
//! CMAC as the SP800-108 PRF. Key material lives in [`Key128`], which wipes
//! itself on drop and never appears in `Debug` output.

pub mod aead;
pub mod kdf;
pub mod mac;
pub mod platform;

pub use aead::{aead_decrypt, aead_encrypt, EMPTY_IV};
pub use kdf::{
    derive_metadata_key, fresh_metadata_key, SessionMasterKey, MASTER_KEY_LABEL,
    MAX_MASTER_KEY_USAGES, METADATA_KEY_LABEL, RANDOM_KEY_LABEL,
};
pub use mac::{cmac_128, ct_eq};
pub use platform::{OsPlatform, Platform};

use sealfs_types::KEY_SIZE;
use zeroize::Zeroize;

/// A 128-bit secret key.
///
/// Zeroized on drop so key material does not linger in freed memory.
#[derive(Clone)]
pub struct Key128 {
    bytes: [u8; KEY_SIZE],
}

impl Key128 {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// The raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Key128 {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Key128 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key128").field("bytes", &"[REDACTED]").finish()
    }
}
