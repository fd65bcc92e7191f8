//! AES-128-CMAC and constant-time comparison.

use aes::Aes128;
use cmac::{Cmac, Mac};
use sealfs_types::{KEY_SIZE, MAC_SIZE};
use subtle::ConstantTimeEq;

/// Compute the AES-128-CMAC tag of `msg` under `key`.
#[must_use]
pub fn cmac_128(key: &[u8; KEY_SIZE], msg: &[u8]) -> [u8; MAC_SIZE] {
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key).expect("AES-128 CMAC accepts 16-byte keys");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Compare two byte strings in constant time.
///
/// Returns `false` for length mismatches without inspecting contents.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
