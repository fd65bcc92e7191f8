//! Stream-level round-trip scenarios over real files.

use std::io::{Read, Seek, SeekFrom, Write};

use proptest::prelude::*;
use sealfs::{remove_protected_file, OpenOptions, ProtectedFile};

const NODE: u64 = 4096;

fn temp_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
    dir.path().join(name)
}

#[test]
fn sixty_four_kib_of_0x90() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "f");
    let key = [0u8; 16];

    let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
    file.write_all(&[0x90; 65536]).unwrap();
    file.close().unwrap();

    let mut file = ProtectedFile::open_ex(&path, &key).unwrap();
    let mut back = vec![0u8; 65536];
    file.read_exact(&mut back).unwrap();
    assert!(back.iter().all(|&b| b == 0x90));
    file.close().unwrap();

    // 3072 bytes ride inline in the metadata; the remaining 62464 fill 16
    // data nodes under a single root MHT: 18 nodes total.
    let on_disk = std::fs::metadata(&path).unwrap().len();
    assert_eq!(on_disk, 18 * NODE);
}

#[test]
fn tiny_file_is_one_node() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "g");
    let key = [0x4B; 16];

    let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
    file.write_all(b"hello").unwrap();
    file.close().unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), NODE);
}

#[test]
fn inline_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let key = [1u8; 16];

    // Exactly the inline capacity: no MHT, no data nodes.
    let path = temp_path(&dir, "exact");
    let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
    file.write_all(&vec![7u8; 3072]).unwrap();
    file.flush().unwrap();
    file.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), NODE);

    // One byte more: metadata + root MHT + one data node.
    let path = temp_path(&dir, "spill");
    let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
    file.write_all(&vec![7u8; 3073]).unwrap();
    file.flush().unwrap();
    file.close().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * NODE);
}

#[test]
fn read_write_seek_through_io_traits() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "io");
    let key = [9u8; 16];

    let mut file = OpenOptions::new()
        .write(true)
        .update(true)
        .open_ex(&path, &key)
        .unwrap();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
    file.write_all(&payload).unwrap();

    file.seek(SeekFrom::Start(0)).unwrap();
    let mut back = Vec::new();
    file.read_to_end(&mut back).unwrap();
    assert_eq!(back, payload);
    assert!(file.is_eof());

    file.seek(SeekFrom::Start(50_000)).unwrap();
    assert!(!file.is_eof());
    let mut mid = [0u8; 16];
    file.read_exact(&mut mid).unwrap();
    assert_eq!(&mid[..], &payload[50_000..50_016]);
    file.close().unwrap();
}

#[test]
fn append_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "log");
    let key = [3u8; 16];

    let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
    file.write_all(b"one").unwrap();
    file.close().unwrap();

    let mut file = OpenOptions::new().append(true).open_ex(&path, &key).unwrap();
    file.write_all(b"-two").unwrap();
    file.close().unwrap();

    let mut file = ProtectedFile::open_ex(&path, &key).unwrap();
    let mut back = String::new();
    file.read_to_string(&mut back).unwrap();
    assert_eq!(back, "one-two");
    file.close().unwrap();
}

#[test]
fn reopen_without_writes_preserves_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "stable");
    let key = [5u8; 16];

    let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
    file.write_all(&[0xED; 30_000]).unwrap();
    file.close().unwrap();
    let first = std::fs::read(&path).unwrap();

    // Read-only open rewrites nothing.
    let mut file = ProtectedFile::open_ex(&path, &key).unwrap();
    let mut back = vec![0u8; 30_000];
    file.read_exact(&mut back).unwrap();
    file.close().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), first);
    assert!(back.iter().all(|&b| b == 0xED));
}

#[test]
fn shared_reference_io() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "byref");
    let key = [8u8; 16];

    let file = ProtectedFile::create_ex(&path, &key).unwrap();
    (&file).write_all(b"via reference").unwrap();
    (&file).seek(SeekFrom::Start(0)).unwrap();
    let mut back = String::new();
    (&file).read_to_string(&mut back).unwrap();
    assert_eq!(back, "via reference");
    file.close().unwrap();
}

#[test]
fn remove_deletes_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "doomed");
    let key = [2u8; 16];

    let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
    file.write_all(b"x").unwrap();
    file.close().unwrap();
    assert!(path.exists());

    remove_protected_file(&path).unwrap();
    assert!(!path.exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Writing any byte sequence and reading it back yields it exactly,
    /// for any chunking of the writes.
    #[test]
    fn roundtrip_any_content(
        payload in proptest::collection::vec(any::<u8>(), 0..60_000),
        chunk in 1usize..10_000,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prop");
        let key = [0xA5u8; 16];

        let mut file = ProtectedFile::create_ex(&path, &key).unwrap();
        for piece in payload.chunks(chunk) {
            file.write_all(piece).unwrap();
        }
        file.close().unwrap();

        let mut file = ProtectedFile::open_ex(&path, &key).unwrap();
        let mut back = Vec::new();
        file.read_to_end(&mut back).unwrap();
        prop_assert_eq!(back, payload);
        file.close().unwrap();
    }
}
