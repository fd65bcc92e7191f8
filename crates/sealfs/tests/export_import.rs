//! Key-supply conversions between platform-sealed and KDK-mode files.
//!
//! The default OS backend has no sealing key, so these flows run against a
//! software backend that derives sealing keys deterministically — the same
//! shape a trusted-hardware backend would have.

use std::io::{Read, Write};
use std::sync::Arc;

use sealfs::{export_auto_key_with, import_auto_key_with, OpenOptions, ProtectedFile};
use sealfs_crypto::{cmac_128, OsPlatform, Platform};

/// Deterministic stand-in for a hardware sealing backend.
struct SoftSealing;

impl Platform for SoftSealing {
    fn fill_random(&self, buf: &mut [u8]) -> sealfs_error::Result<()> {
        OsPlatform.fill_random(buf)
    }

    fn sealing_key(&self, key_id: &[u8; 32]) -> sealfs_error::Result<[u8; 16]> {
        Ok(cmac_128(&[0x5E; 16], key_id))
    }
}

fn soft() -> Arc<dyn Platform> {
    Arc::new(SoftSealing)
}

#[test]
fn auto_key_files_work_with_a_sealing_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("auto");

    let mut file = OpenOptions::new()
        .write(true)
        .platform(soft())
        .open(&path)
        .unwrap();
    file.write_all(b"sealed without a caller key").unwrap();
    file.close().unwrap();

    let mut file = OpenOptions::new()
        .read(true)
        .platform(soft())
        .open(&path)
        .unwrap();
    let mut back = String::new();
    file.read_to_string(&mut back).unwrap();
    assert_eq!(back, "sealed without a caller key");
    file.close().unwrap();
}

#[test]
fn auto_mode_fails_without_a_sealing_backend() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noseal");
    assert!(ProtectedFile::create(&path).is_err());
}

#[test]
fn export_converts_to_kdk_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("migrate");

    let mut file = OpenOptions::new()
        .write(true)
        .platform(soft())
        .open(&path)
        .unwrap();
    file.write_all(b"take me elsewhere").unwrap();
    file.close().unwrap();

    let key = export_auto_key_with(&path, soft()).unwrap();

    // The file is now a KDK-mode file: the returned key opens it with no
    // sealing backend at all, and the sealing backend alone no longer does.
    let mut file = ProtectedFile::open_ex(&path, &key).unwrap();
    let mut back = String::new();
    file.read_to_string(&mut back).unwrap();
    assert_eq!(back, "take me elsewhere");
    file.close().unwrap();

    assert!(OpenOptions::new()
        .read(true)
        .platform(soft())
        .open(&path)
        .is_err());
}

#[test]
fn import_is_the_inverse_of_export() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("roundtrip");

    let mut file = OpenOptions::new()
        .write(true)
        .platform(soft())
        .open(&path)
        .unwrap();
    file.write_all(b"home again").unwrap();
    file.close().unwrap();

    let key = export_auto_key_with(&path, soft()).unwrap();
    import_auto_key_with(&path, &key, soft()).unwrap();

    // Back to auto mode: the sealing backend opens it, the old key does not.
    let mut file = OpenOptions::new()
        .read(true)
        .platform(soft())
        .open(&path)
        .unwrap();
    let mut back = String::new();
    file.read_to_string(&mut back).unwrap();
    assert_eq!(back, "home again");
    file.close().unwrap();

    assert!(ProtectedFile::open_ex(&path, &key).is_err());
}

#[test]
fn export_of_a_kdk_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kdk");
    let key = [0x77u8; 16];

    let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
    file.write_all(b"x").unwrap();
    file.close().unwrap();

    // A KDK-mode file cannot be opened in auto mode at all.
    assert!(export_auto_key_with(&path, soft()).is_err());
}
