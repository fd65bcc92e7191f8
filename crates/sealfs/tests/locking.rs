//! Advisory lock exclusion between simultaneous opens.
//!
//! `flock` locks attach to the open file description, so two handles in
//! one process contend exactly like two processes do.

use std::io::{Read, Write};

use sealfs::{OpenOptions, ProtectedFile};

#[test]
fn second_writer_gets_busy() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h");
    let key = [0x66u8; 16];

    let first = ProtectedFile::create_ex(&path, &key).unwrap();
    let err = ProtectedFile::create_ex(&path, &key).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    first.close().unwrap();

    // The lock dies with the owner; a new writer succeeds.
    let again = ProtectedFile::create_ex(&path, &key).unwrap();
    again.close().unwrap();
}

#[test]
fn readers_share_while_no_writer_holds_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h");
    let key = [0x66u8; 16];

    let mut writer = ProtectedFile::create_ex(&path, &key).unwrap();
    writer.write_all(b"shared content").unwrap();
    writer.close().unwrap();

    let mut readers: Vec<ProtectedFile> = (0..4)
        .map(|_| ProtectedFile::open_ex(&path, &key).unwrap())
        .collect();
    for reader in &mut readers {
        let mut back = String::new();
        reader.read_to_string(&mut back).unwrap();
        assert_eq!(back, "shared content");
    }

    // A writer cannot enter while readers hold shared locks.
    let err = OpenOptions::new()
        .read(true)
        .update(true)
        .open_ex(&path, &key)
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

    for reader in readers {
        reader.close().unwrap();
    }
    let writer = OpenOptions::new()
        .read(true)
        .update(true)
        .open_ex(&path, &key)
        .unwrap();
    writer.close().unwrap();
}

#[test]
fn writer_blocks_readers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("h");
    let key = [0x66u8; 16];

    let mut writer = ProtectedFile::create_ex(&path, &key).unwrap();
    writer.write_all(b"x").unwrap();

    let err = ProtectedFile::open_ex(&path, &key).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    writer.close().unwrap();

    ProtectedFile::open_ex(&path, &key).unwrap().close().unwrap();
}
