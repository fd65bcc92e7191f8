//! Protected files with a standard stream API.
//!
//! A [`ProtectedFile`] looks like an ordinary file — it implements
//! [`Read`], [`Write`], and [`Seek`], both for the file and for `&file` —
//! but every byte on disk is AES-128-GCM encrypted and authenticated
//! through a hash tree rooted in a sealed metadata node. Files are opened
//! through [`OpenOptions`] or the convenience constructors, keyed either by
//! a caller-supplied 16-byte KDK or by the platform sealing key.
//!
//! ```no_run
//! # fn main() -> std::io::Result<()> {
//! use std::io::{Read, Seek, SeekFrom, Write};
//! use sealfs::ProtectedFile;
//!
//! let key = [7u8; 16];
//! let mut file = ProtectedFile::create_ex("vault.pfs", &key)?;
//! file.write_all(b"secret payload")?;
//! file.seek(SeekFrom::Start(0))?;
//! let mut back = String::new();
//! file.read_to_string(&mut back)?;
//! # Ok(())
//! # }
//! ```

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use sealfs_core::SealedFile;
use sealfs_crypto::{OsPlatform, Platform};
use sealfs_error::SealError;
use sealfs_vfs::UnixVfs;

pub use sealfs_error::{ErrorCode, FileStatus};
pub use sealfs_types::KEY_SIZE;

/// A reference to an open protected file.
///
/// Instances can be read and/or written depending on the options they were
/// opened with, and are flushed and closed automatically when dropped.
pub struct ProtectedFile {
    inner: SealedFile<UnixVfs>,
}

impl std::fmt::Debug for ProtectedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedFile").finish_non_exhaustive()
    }
}

/// Options which configure how a protected file is opened.
#[derive(Clone)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    append: bool,
    update: bool,
    binary: bool,
    platform: Option<Arc<dyn Platform>>,
}

fn into_io(err: SealError) -> io::Error {
    match err {
        SealError::Io(e) => e,
        SealError::Busy { .. } => io::Error::new(io::ErrorKind::WouldBlock, err),
        SealError::InvalidPath { .. }
        | SealError::InvalidMode { .. }
        | SealError::InvalidArgument { .. }
        | SealError::SeekOutOfRange { .. }
        | SealError::ReadOnly => io::Error::new(io::ErrorKind::InvalidInput, err),
        other => io::Error::other(other),
    }
}

impl ProtectedFile {
    /// Open an existing file for reading with the platform sealing key.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<ProtectedFile> {
        OpenOptions::new().read(true).open(path.as_ref())
    }

    /// Create a file for writing with the platform sealing key.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<ProtectedFile> {
        OpenOptions::new().write(true).open(path.as_ref())
    }

    /// Open an existing file for reading with a caller-supplied KDK.
    pub fn open_ex<P: AsRef<Path>>(path: P, key: &[u8; KEY_SIZE]) -> io::Result<ProtectedFile> {
        OpenOptions::new().read(true).open_ex(path.as_ref(), key)
    }

    /// Create a file for writing with a caller-supplied KDK.
    pub fn create_ex<P: AsRef<Path>>(path: P, key: &[u8; KEY_SIZE]) -> io::Result<ProtectedFile> {
        OpenOptions::new().write(true).open_ex(path.as_ref(), key)
    }

    /// Whether a read has reached end-of-file.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.inner.get_eof()
    }

    /// The last recorded error code.
    #[must_use]
    pub fn get_error(&self) -> ErrorCode {
        self.inner.get_error()
    }

    /// Retry a recoverable failure and clear the sticky error state.
    pub fn clearerr(&self) {
        self.inner.clear_error();
    }

    /// Flush and drop all cached plaintext nodes.
    pub fn clear_cache(&self) -> io::Result<()> {
        self.inner.clear_cache().map_err(into_io)
    }

    /// The GMAC currently authenticating the file's metadata.
    pub fn get_current_meta_gmac(&self) -> io::Result<[u8; 16]> {
        self.inner.current_meta_gmac().map_err(into_io)
    }

    /// Flush, wipe plaintext, and release the advisory lock.
    ///
    /// Dropping the file does the same; `close` surfaces the result.
    pub fn close(self) -> io::Result<()> {
        self.inner.close().map_err(into_io)
    }
}

impl OpenOptions {
    /// Creates a blank new set of options ready for configuration.
    #[must_use]
    pub fn new() -> OpenOptions {
        OpenOptions {
            read: false,
            write: false,
            append: false,
            update: false,
            binary: false,
            platform: None,
        }
    }

    /// Sets the option for read access.
    pub fn read(&mut self, read: bool) -> &mut OpenOptions {
        self.read = read;
        self
    }

    /// Sets the option for write access (truncates an existing file).
    pub fn write(&mut self, write: bool) -> &mut OpenOptions {
        self.write = write;
        self
    }

    /// Sets the option for append mode: every write lands at the end.
    pub fn append(&mut self, append: bool) -> &mut OpenOptions {
        self.append = append;
        self
    }

    /// Sets the option for updating a previous file (read and write).
    pub fn update(&mut self, update: bool) -> &mut OpenOptions {
        self.update = update;
        self
    }

    /// Sets the binary option; accepted and ignored.
    pub fn binary(&mut self, binary: bool) -> &mut OpenOptions {
        self.binary = binary;
        self
    }

    /// Use a custom platform backend (CSPRNG and sealing key).
    pub fn platform(&mut self, platform: Arc<dyn Platform>) -> &mut OpenOptions {
        self.platform = Some(platform);
        self
    }

    fn mode_string(&self) -> io::Result<String> {
        let base = match (self.read, self.write, self.append) {
            (true, false, false) => "r",
            (false, true, false) => "w",
            (false, false, true) => "a",
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "exactly one of read/write/append must be set",
                ))
            }
        };
        let mut mode = String::from(base);
        if self.update {
            mode.push('+');
        }
        if self.binary {
            mode.push('b');
        }
        Ok(mode)
    }

    fn resolved_platform(&self) -> Arc<dyn Platform> {
        self.platform
            .clone()
            .unwrap_or_else(|| Arc::new(OsPlatform))
    }

    /// Open a file at `path` with the platform sealing key.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> io::Result<ProtectedFile> {
        let mode = self.mode_string()?;
        let inner = SealedFile::open(
            Arc::new(UnixVfs::new()),
            self.resolved_platform(),
            path.as_ref(),
            &mode,
            None,
        )
        .map_err(into_io)?;
        Ok(ProtectedFile { inner })
    }

    /// Open a file at `path` with a caller-supplied KDK.
    pub fn open_ex<P: AsRef<Path>>(
        &self,
        path: P,
        key: &[u8; KEY_SIZE],
    ) -> io::Result<ProtectedFile> {
        let mode = self.mode_string()?;
        let inner = SealedFile::open(
            Arc::new(UnixVfs::new()),
            self.resolved_platform(),
            path.as_ref(),
            &mode,
            Some(key),
        )
        .map_err(into_io)?;
        Ok(ProtectedFile { inner })
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl Read for ProtectedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(into_io)
    }
}

impl Write for ProtectedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).map_err(into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(into_io)
    }
}

impl Seek for ProtectedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos).map_err(into_io)
    }
}

impl Read for &ProtectedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(into_io)
    }
}

impl Write for &ProtectedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).map_err(into_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(into_io)
    }
}

impl Seek for &ProtectedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos).map_err(into_io)
    }
}

/// Delete a protected file and any recovery journal it left behind.
pub fn remove_protected_file<P: AsRef<Path>>(path: P) -> io::Result<()> {
    sealfs_core::remove(&UnixVfs::new(), path.as_ref()).map_err(into_io)
}

/// Convert an auto-key (platform-sealed) file into a KDK-mode file sealed
/// under a freshly drawn key, which is returned to the caller.
pub fn export_auto_key<P: AsRef<Path>>(path: P) -> io::Result<[u8; KEY_SIZE]> {
    export_auto_key_with(path, Arc::new(OsPlatform))
}

/// [`export_auto_key`] with an explicit platform backend.
pub fn export_auto_key_with<P: AsRef<Path>>(
    path: P,
    platform: Arc<dyn Platform>,
) -> io::Result<[u8; KEY_SIZE]> {
    let file = SealedFile::open(
        Arc::new(UnixVfs::new()),
        platform,
        path.as_ref(),
        "r+",
        None,
    )
    .map_err(into_io)?;
    let key = file.rekey_to_user_kdk().map_err(into_io)?;
    file.close().map_err(into_io)?;
    Ok(key)
}

/// Convert a KDK-mode file back into an auto-key file sealed under the
/// platform sealing key. Inverse of [`export_auto_key`].
pub fn import_auto_key<P: AsRef<Path>>(path: P, key: &[u8; KEY_SIZE]) -> io::Result<()> {
    import_auto_key_with(path, key, Arc::new(OsPlatform))
}

/// [`import_auto_key`] with an explicit platform backend.
pub fn import_auto_key_with<P: AsRef<Path>>(
    path: P,
    key: &[u8; KEY_SIZE],
    platform: Arc<dyn Platform>,
) -> io::Result<()> {
    let file = SealedFile::open(
        Arc::new(UnixVfs::new()),
        platform,
        path.as_ref(),
        "r+",
        Some(key),
    )
    .map_err(into_io)?;
    file.rekey_to_auto().map_err(into_io)?;
    file.close().map_err(into_io)
}
