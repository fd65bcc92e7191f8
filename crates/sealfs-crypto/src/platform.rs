//! Platform backend: the process-wide CSPRNG and the optional sealing key.
//!
//! The sealing key is what a trusted-hardware backend would provide for
//! auto-key files. The default OS backend has none, so auto-key mode is
//! unavailable and callers must supply a KDK; a sealing-capable backend can
//! be plugged in without touching the core.

use rand::rngs::OsRng;
use rand::RngCore;
use sealfs_error::{Result, SealError};
use sealfs_types::KEY_SIZE;

/// Access to platform primitives the core cannot provide itself.
///
/// Implementations must be thread-safe; the CSPRNG is the only process-wide
/// resource in the stack.
pub trait Platform: Send + Sync {
    /// Fill `buf` with cryptographically secure random bytes.
    fn fill_random(&self, buf: &mut [u8]) -> Result<()>;

    /// Derive the platform sealing key for the given key-id.
    ///
    /// The default implementation reports the capability as absent.
    fn sealing_key(&self, key_id: &[u8; 32]) -> Result<[u8; KEY_SIZE]> {
        let _ = key_id;
        Err(SealError::Unsupported)
    }
}

/// The default backend: OS randomness, no sealing key.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPlatform;

impl Platform for OsPlatform {
    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        OsRng
            .try_fill_bytes(buf)
            .map_err(|e| SealError::Io(std::io::Error::other(e)))
    }
}
