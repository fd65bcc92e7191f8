//! Unix VFS backed by real files with `flock` advisory locking.
//!
//! The lock is whole-file and per open description: a read-only open takes
//! `LOCK_SH`, a writable open `LOCK_EX`, both with `LOCK_NB` so contention
//! fails fast with `Busy`. The lock is advisory only — it keeps cooperating
//! openers honest, it does not stop a privileged process from touching the
//! file (any such tampering is caught by authentication, not by the lock).
//!
//! All syscalls go through `std` and `nix`; no `unsafe` anywhere.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::fcntl::{Flock, FlockArg};
use sealfs_error::{Result, SealError};
use tracing::debug;

use crate::traits::{Vfs, VfsFile};

/// Attempts made to create the recovery journal before giving up.
const RECOVERY_OPEN_RETRIES: u32 = 10;

/// Back-off between recovery-journal creation attempts.
const RECOVERY_OPEN_BACKOFF: Duration = Duration::from_millis(10);

/// A VFS over the real Unix filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixVfs;

impl UnixVfs {
    /// Create a new Unix VFS instance.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// A file handle opened by [`UnixVfs`].
///
/// Locked handles own their `Flock` guard so dropping the handle releases
/// the advisory lock even without an explicit `close`.
#[derive(Debug)]
pub struct UnixFile {
    inner: Option<Handle>,
}

#[derive(Debug)]
enum Handle {
    Locked(Flock<File>),
    Plain(File),
}

impl Handle {
    fn file(&self) -> &File {
        match self {
            Self::Locked(lock) => lock,
            Self::Plain(file) => file,
        }
    }
}

impl UnixFile {
    fn file(&self) -> Result<&File> {
        self.inner
            .as_ref()
            .map(Handle::file)
            .ok_or_else(|| SealError::invalid_argument("file handle is closed"))
    }
}

impl Vfs for UnixVfs {
    type File = UnixFile;

    fn name(&self) -> &'static str {
        "unix"
    }

    fn open_exclusive(&self, path: &Path, read_only: bool) -> Result<(Self::File, u64)> {
        if path.as_os_str().is_empty() {
            return Err(SealError::InvalidPath {
                path: PathBuf::new(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)
            .map_err(SealError::Io)?;

        let arg = if read_only {
            FlockArg::LockSharedNonblock
        } else {
            FlockArg::LockExclusiveNonblock
        };
        let lock = match Flock::lock(file, arg) {
            Ok(lock) => lock,
            Err((_, nix::errno::Errno::EAGAIN)) => {
                debug!(path = %path.display(), read_only, "advisory lock contended");
                return Err(SealError::Busy {
                    path: path.to_owned(),
                });
            }
            Err((_, errno)) => return Err(SealError::Io(errno.into())),
        };

        let size = lock.metadata().map_err(SealError::Io)?.len();
        Ok((
            UnixFile {
                inner: Some(Handle::Locked(lock)),
            },
            size,
        ))
    }

    fn create_recovery(&self, path: &Path) -> Result<Self::File> {
        let mut last_err = None;
        for attempt in 0..RECOVERY_OPEN_RETRIES {
            match OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
            {
                Ok(file) => {
                    return Ok(UnixFile {
                        inner: Some(Handle::Plain(file)),
                    })
                }
                Err(e) => {
                    debug!(path = %path.display(), attempt, error = %e, "recovery create retry");
                    last_err = Some(e);
                    std::thread::sleep(RECOVERY_OPEN_BACKOFF);
                }
            }
        }
        Err(SealError::Io(last_err.expect("retry loop ran at least once")))
    }

    fn open_read(&self, path: &Path) -> Result<Self::File> {
        let file = File::open(path).map_err(SealError::Io)?;
        Ok(UnixFile {
            inner: Some(Handle::Plain(file)),
        })
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        match std::fs::metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SealError::Io(e)),
        }
    }

    fn remove(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(SealError::Io)
    }
}

impl VfsFile for UnixFile {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file()?;
        let mut total = 0_usize;
        while total < buf.len() {
            let off = offset + total as u64;
            let n = file.read_at(&mut buf[total..], off).map_err(SealError::Io)?;
            if n == 0 {
                break; // EOF
            }
            total += n;
        }

        if total < buf.len() {
            buf[total..].fill(0);
        }
        Ok(total)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let file = self.file()?;
        let mut total = 0_usize;
        while total < buf.len() {
            let off = offset + total as u64;
            let n = file.write_at(&buf[total..], off).map_err(SealError::Io)?;
            if n == 0 {
                return Err(SealError::Io(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write_at returned 0",
                )));
            }
            total += n;
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.file()?.set_len(size).map_err(SealError::Io)
    }

    fn sync(&mut self) -> Result<()> {
        self.file()?.sync_all().map_err(SealError::Io)
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file()?.metadata().map_err(SealError::Io)?.len())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the Flock guard releases the advisory lock.
        self.inner = None;
        Ok(())
    }
}
