//! AES-128-GCM with detached tags.
//!
//! Nodes are sealed with a fresh single-use key each time they are written,
//! so the IV is the all-zero 12 bytes; the `(key, gmac)` pair stored in the
//! parent node is the only material needed to open a child.
//!
//! [`aead_decrypt`] is the sole authentication authority in the stack: a tag
//! mismatch at any tree level surfaces as `AuthFailed`, and the output
//! buffer is wiped before returning so unauthenticated plaintext can never
//! be observed.

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes128Gcm, KeyInit, Nonce, Tag};
use sealfs_error::{Result, SealError};
use sealfs_types::{IV_SIZE, KEY_SIZE, MAC_SIZE};
use zeroize::Zeroize;

/// The all-zero IV used for every node seal (keys are single-use).
pub const EMPTY_IV: [u8; IV_SIZE] = [0; IV_SIZE];

/// Encrypt `plaintext` into `ciphertext` and return the 16-byte GCM tag.
///
/// `ciphertext` must be the same length as `plaintext`.
pub fn aead_encrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    aad: &[u8],
    plaintext: &[u8],
    ciphertext: &mut [u8],
) -> Result<[u8; MAC_SIZE]> {
    debug_assert_eq!(plaintext.len(), ciphertext.len());
    ciphertext.copy_from_slice(plaintext);

    let cipher = Aes128Gcm::new(key.into());
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), aad, ciphertext)
        .map_err(|_| SealError::invalid_argument("plaintext too large for GCM"))?;
    Ok(tag.into())
}

/// Decrypt `ciphertext` into `plaintext`, verifying the detached tag.
///
/// On tag mismatch the output buffer is zeroized and `AuthFailed` is
/// returned; no unauthenticated bytes escape.
pub fn aead_decrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    aad: &[u8],
    ciphertext: &[u8],
    tag: &[u8; MAC_SIZE],
    plaintext: &mut [u8],
) -> Result<()> {
    debug_assert_eq!(plaintext.len(), ciphertext.len());
    plaintext.copy_from_slice(ciphertext);

    let cipher = Aes128Gcm::new(key.into());
    match cipher.decrypt_in_place_detached(
        Nonce::from_slice(iv),
        aad,
        plaintext,
        Tag::from_slice(tag),
    ) {
        Ok(()) => Ok(()),
        Err(_) => {
            plaintext.zeroize();
            Err(SealError::AuthFailed)
        }
    }
}
