//! In-memory VFS for hermetic tests.
//!
//! Files are byte vectors shared behind `Arc<Mutex<..>>` and keyed by path,
//! so several handles (and several simulated "processes") can address the
//! same storage. The advisory lock protocol is simulated per path with a
//! readers/writer count, which lets lock-exclusion tests run without
//! touching the real filesystem.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sealfs_error::{Result, SealError};

use crate::traits::{Vfs, VfsFile};

#[derive(Debug, Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

#[derive(Debug, Clone, Copy)]
struct FaultWindow {
    skip: u32,
    fail: u32,
}

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<PathBuf, Arc<Mutex<Vec<u8>>>>,
    locks: HashMap<PathBuf, LockState>,
    write_faults: HashMap<PathBuf, FaultWindow>,
}

/// An in-memory VFS; clones share the same file namespace.
#[derive(Debug, Clone, Default)]
pub struct MemoryVfs {
    inner: Arc<Mutex<MemoryVfsInner>>,
}

fn lock_err() -> SealError {
    SealError::invalid_argument("MemoryVfs lock poisoned")
}

impl MemoryVfs {
    /// Create a new empty in-memory VFS.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw bytes of a stored file; test hook for corruption and crash
    /// simulation.
    pub fn raw_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = inner.files.get(path).ok_or_else(|| {
            SealError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such memory file",
            ))
        })?;
        let bytes = storage.lock().map_err(|_| lock_err())?.clone();
        Ok(bytes)
    }

    /// After the next `skip` writes to `path`, fail the following `fail`
    /// writes with an I/O error; test hook for the flush error states.
    pub fn inject_write_faults(&self, path: &Path, skip: u32, fail: u32) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        inner
            .write_faults
            .insert(path.to_owned(), FaultWindow { skip, fail });
        Ok(())
    }

    /// Replace the raw bytes of a stored file, creating it if absent; test
    /// hook for corruption and crash simulation.
    pub fn set_raw_bytes(&self, path: &Path, bytes: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = inner
            .files
            .entry(path.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        *storage.lock().map_err(|_| lock_err())? = bytes;
        Ok(())
    }
}

/// A file handle opened by [`MemoryVfs`].
#[derive(Debug)]
pub struct MemoryFile {
    path: PathBuf,
    storage: Arc<Mutex<Vec<u8>>>,
    vfs: Arc<Mutex<MemoryVfsInner>>,
    holds_lock: Option<bool>, // Some(true) = exclusive, Some(false) = shared
}

impl MemoryFile {
    fn release_lock(&mut self) {
        let Some(exclusive) = self.holds_lock.take() else {
            return;
        };
        if let Ok(mut inner) = self.vfs.lock() {
            if let Some(state) = inner.locks.get_mut(&self.path) {
                if exclusive {
                    state.writer = false;
                } else {
                    state.readers = state.readers.saturating_sub(1);
                }
            }
        }
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        self.release_lock();
    }
}

impl Vfs for MemoryVfs {
    type File = MemoryFile;

    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_exclusive(&self, path: &Path, read_only: bool) -> Result<(Self::File, u64)> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;

        let storage = if let Some(existing) = inner.files.get(path) {
            Arc::clone(existing)
        } else if read_only {
            return Err(SealError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such memory file",
            )));
        } else {
            let storage = Arc::new(Mutex::new(Vec::new()));
            inner.files.insert(path.to_owned(), Arc::clone(&storage));
            storage
        };

        let state = inner.locks.entry(path.to_owned()).or_default();
        if state.writer || (!read_only && state.readers > 0) {
            return Err(SealError::Busy {
                path: path.to_owned(),
            });
        }
        if read_only {
            state.readers += 1;
        } else {
            state.writer = true;
        }
        drop(inner);

        let size = storage.lock().map_err(|_| lock_err())?.len() as u64;
        Ok((
            MemoryFile {
                path: path.to_owned(),
                storage,
                vfs: Arc::clone(&self.inner),
                holds_lock: Some(!read_only),
            },
            size,
        ))
    }

    fn create_recovery(&self, path: &Path) -> Result<Self::File> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = inner
            .files
            .entry(path.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())));
        storage.lock().map_err(|_| lock_err())?.clear();
        let storage = Arc::clone(storage);
        drop(inner);

        Ok(MemoryFile {
            path: path.to_owned(),
            storage,
            vfs: Arc::clone(&self.inner),
            holds_lock: None,
        })
    }

    fn open_read(&self, path: &Path) -> Result<Self::File> {
        let inner = self.inner.lock().map_err(|_| lock_err())?;
        let storage = inner.files.get(path).ok_or_else(|| {
            SealError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such memory file",
            ))
        })?;
        let storage = Arc::clone(storage);
        drop(inner);

        Ok(MemoryFile {
            path: path.to_owned(),
            storage,
            vfs: Arc::clone(&self.inner),
            holds_lock: None,
        })
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| lock_err())?
            .files
            .contains_key(path))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| lock_err())?;
        if inner.files.remove(path).is_none() {
            return Err(SealError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no such memory file",
            )));
        }
        Ok(())
    }
}

impl VfsFile for MemoryFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.storage.lock().map_err(|_| lock_err())?;
        let offset = usize::try_from(offset)
            .map_err(|_| SealError::invalid_argument("offset exceeds memory file bounds"))?;
        let available = data.len().saturating_sub(offset);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        buf[n..].fill(0);
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        {
            let mut inner = self.vfs.lock().map_err(|_| lock_err())?;
            if let Some(window) = inner.write_faults.get_mut(&self.path) {
                if window.skip > 0 {
                    window.skip -= 1;
                } else if window.fail > 0 {
                    window.fail -= 1;
                    if window.fail == 0 {
                        inner.write_faults.remove(&self.path);
                    }
                    return Err(SealError::Io(std::io::Error::other("injected write fault")));
                } else {
                    inner.write_faults.remove(&self.path);
                }
            }
        }
        let mut data = self.storage.lock().map_err(|_| lock_err())?;
        let offset = usize::try_from(offset)
            .map_err(|_| SealError::invalid_argument("offset exceeds memory file bounds"))?;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let mut data = self.storage.lock().map_err(|_| lock_err())?;
        let size = usize::try_from(size)
            .map_err(|_| SealError::invalid_argument("size exceeds memory file bounds"))?;
        data.resize(size, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.storage.lock().map_err(|_| lock_err())?.len() as u64)
    }

    fn close(&mut self) -> Result<()> {
        self.release_lock();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let vfs = MemoryVfs::new();
        let path = Path::new("a.pfs");

        let (mut file, size) = vfs.open_exclusive(path, false).unwrap();
        assert_eq!(size, 0);
        file.write_at(&[1, 2, 3, 4], 8).unwrap();
        assert_eq!(file.size().unwrap(), 12);

        let mut buf = [0xFF_u8; 16];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 12);
        assert_eq!(&buf[..8], &[0; 8]);
        assert_eq!(&buf[8..12], &[1, 2, 3, 4]);
        assert_eq!(&buf[12..], &[0; 4], "short read zero-fills");
    }

    #[test]
    fn lock_protocol() {
        let vfs = MemoryVfs::new();
        let path = Path::new("locked.pfs");

        let (mut w, _) = vfs.open_exclusive(path, false).unwrap();
        assert!(matches!(
            vfs.open_exclusive(path, false).unwrap_err(),
            SealError::Busy { .. }
        ));
        assert!(matches!(
            vfs.open_exclusive(path, true).unwrap_err(),
            SealError::Busy { .. }
        ));
        w.close().unwrap();

        let (r1, _) = vfs.open_exclusive(path, true).unwrap();
        let (r2, _) = vfs.open_exclusive(path, true).unwrap();
        assert!(matches!(
            vfs.open_exclusive(path, false).unwrap_err(),
            SealError::Busy { .. }
        ));
        drop(r1);
        drop(r2);
        let (mut w, _) = vfs.open_exclusive(path, false).unwrap();
        w.close().unwrap();
    }

    #[test]
    fn lock_released_on_drop_without_close() {
        let vfs = MemoryVfs::new();
        let path = Path::new("dropped.pfs");
        {
            let _file = vfs.open_exclusive(path, false).unwrap();
        }
        assert!(vfs.open_exclusive(path, false).is_ok());
    }

    #[test]
    fn clones_share_namespace() {
        let vfs = MemoryVfs::new();
        let clone = vfs.clone();
        let path = Path::new("shared.pfs");

        let (mut file, _) = vfs.open_exclusive(path, false).unwrap();
        file.write_at(b"xyz", 0).unwrap();
        file.close().unwrap();

        assert!(clone.exists(path).unwrap());
        assert_eq!(clone.raw_bytes(path).unwrap(), b"xyz");
    }

    #[test]
    fn recovery_create_truncates() {
        let vfs = MemoryVfs::new();
        let path = Path::new("journal");

        let mut j = vfs.create_recovery(path).unwrap();
        j.write_at(&[9; 8], 0).unwrap();
        j.close().unwrap();

        let mut j = vfs.create_recovery(path).unwrap();
        assert_eq!(j.size().unwrap(), 0);
        j.close().unwrap();
    }

    #[test]
    fn raw_byte_hooks() {
        let vfs = MemoryVfs::new();
        let path = Path::new("raw.pfs");
        vfs.set_raw_bytes(path, vec![5; 10]).unwrap();
        let mut got = vfs.raw_bytes(path).unwrap();
        assert_eq!(got, vec![5; 10]);
        got[0] = 6;
        vfs.set_raw_bytes(path, got).unwrap();
        assert_eq!(vfs.raw_bytes(path).unwrap()[0], 6);
    }
}
