//! The protected file object.
//!
//! One [`SealedFile`] owns everything for a single open container: the
//! locked host handle, the authenticated metadata, the node cache, and the
//! sticky status machine. The entire public surface is serialized behind a
//! single mutex; there is no finer-grained locking and no suspension point
//! inside any operation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use sealfs_crypto::{aead_decrypt, derive_metadata_key, Key128, Platform, SessionMasterKey, EMPTY_IV};
use sealfs_error::{ErrorCode, FileStatus, Result, SealError};
use sealfs_types::{
    MetaEncrypted, MetaPlain, MhtNode, NodeNumber, OpenMode, META_ENCRYPTED_SIZE, META_PLAIN_SIZE,
    NODE_SIZE, RECOVERY_FILE_SUFFIX, SEALFS_MAGIC, SEALFS_MAJOR_VERSION,
};
use sealfs_types::address::{physical_of_data, NodeRole};
use sealfs_types::layout::{FILENAME_MAX_LEN, MD_USER_DATA_SIZE};
use sealfs_vfs::{replay_recovery, Vfs, VfsFile};
use tracing::{debug, warn};
use zeroize::Zeroize;

use crate::cache::NodeCache;
use crate::node::CachedNode;

/// How the metadata key is obtained.
pub(crate) enum KeyPolicy {
    /// Derived from a caller-supplied KDK under a stored 32-byte key-id.
    UserKdk(Key128),
    /// Obtained from the platform sealing key.
    Auto,
}

/// A transparently encrypted, integrity-authenticated random-access file.
pub struct SealedFile<V: Vfs> {
    inner: Mutex<FileInner<V>>,
}

impl<V: Vfs> std::fmt::Debug for SealedFile<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedFile").finish_non_exhaustive()
    }
}

pub(crate) struct FileInner<V: Vfs> {
    pub(crate) vfs: Arc<V>,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) path: PathBuf,
    pub(crate) recovery_path: PathBuf,
    pub(crate) mode: OpenMode,
    pub(crate) read_only: bool,
    pub(crate) status: FileStatus,
    pub(crate) last_error: ErrorCode,
    pub(crate) eof: bool,
    pub(crate) offset: u64,
    pub(crate) host: Option<V::File>,
    /// Size of the backing file in bytes (always node-aligned).
    pub(crate) real_file_size: u64,
    pub(crate) meta_plain: MetaPlain,
    pub(crate) meta_encrypted: MetaEncrypted,
    /// Node 0 as it currently exists on disk; journaled as the pre-image.
    pub(crate) meta_disk_image: Box<[u8; NODE_SIZE]>,
    /// Re-sealed node 0 staged by the encrypt phase, written by the commit.
    pub(crate) staged_meta: Option<Box<[u8; NODE_SIZE]>>,
    pub(crate) key_policy: KeyPolicy,
    pub(crate) session: SessionMasterKey,
    pub(crate) cache: NodeCache,
    pub(crate) need_writing: bool,
}

/// Derive the recovery-journal path from the container path.
pub(crate) fn recovery_path_for(path: &Path) -> PathBuf {
    let mut rp = path.as_os_str().to_owned();
    rp.push(RECOVERY_FILE_SUFFIX);
    PathBuf::from(rp)
}

/// Extract and validate the canonical basename stored in the metadata.
fn canonical_basename(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SealError::InvalidPath {
            path: path.to_owned(),
        })?;
    if name.is_empty() || name.len() >= FILENAME_MAX_LEN {
        return Err(SealError::InvalidPath {
            path: path.to_owned(),
        });
    }
    Ok(name.to_owned())
}

/// Read one whole node, failing on a short transfer.
pub(crate) fn read_node_raw<F: VfsFile>(
    host: &mut F,
    physical: NodeNumber,
) -> Result<Box<[u8; NODE_SIZE]>> {
    let mut buf = Box::new([0u8; NODE_SIZE]);
    let n = host.read_at(&mut buf[..], physical.byte_offset())?;
    if n < NODE_SIZE {
        return Err(SealError::ShortRead {
            node: physical.get(),
            expected: NODE_SIZE,
            actual: n,
        });
    }
    Ok(buf)
}

/// Delete a protected file and any recovery journal it left behind.
pub fn remove<V: Vfs>(vfs: &V, path: &Path) -> Result<()> {
    vfs.remove(path)?;
    let recovery = recovery_path_for(path);
    if vfs.exists(&recovery).unwrap_or(false) {
        let _ = vfs.remove(&recovery);
    }
    Ok(())
}

impl<V: Vfs> SealedFile<V> {
    /// Open a protected file.
    ///
    /// `kdk` selects the key-supply variant: `Some` derives the metadata key
    /// from the 16-byte user KDK, `None` uses the platform sealing key
    /// (failing with `Unsupported` when the backend has none).
    pub fn open(
        vfs: Arc<V>,
        platform: Arc<dyn Platform>,
        path: &Path,
        mode: &str,
        kdk: Option<&[u8; 16]>,
    ) -> Result<Self> {
        let mode = OpenMode::parse(mode)?;
        let filename = canonical_basename(path)?;
        let read_only = mode.is_read_only();
        let recovery_path = recovery_path_for(path);

        let (mut host, mut size) = vfs.open_exclusive(path, read_only)?;

        if mode.truncates() && size > 0 {
            host.truncate(0)?;
            size = 0;
            // A journal of the discarded content must not outlive it.
            if vfs.exists(&recovery_path)? {
                let _ = vfs.remove(&recovery_path);
            }
        }

        let session = SessionMasterKey::new(platform.as_ref())?;
        let mut inner = FileInner {
            vfs: Arc::clone(&vfs),
            platform,
            path: path.to_owned(),
            recovery_path,
            mode,
            read_only,
            status: FileStatus::NotInitialized,
            last_error: ErrorCode::Ok,
            eof: false,
            offset: 0,
            host: None,
            real_file_size: size,
            meta_plain: MetaPlain::default(),
            meta_encrypted: MetaEncrypted::default(),
            meta_disk_image: Box::new([0; NODE_SIZE]),
            staged_meta: None,
            key_policy: KeyPolicy::Auto,
            session,
            cache: NodeCache::new(),
            need_writing: false,
        };

        if size == 0 {
            if read_only {
                return Err(SealError::invalid_argument(
                    "cannot open an empty file read-only",
                ));
            }
            inner.host = Some(host);
            inner.init_new(&filename, kdk.map(|k| Key128::from_bytes(*k)))?;
        } else {
            if size % NODE_SIZE as u64 != 0 {
                return Err(SealError::corrupted("backing file size is not node aligned"));
            }
            if inner.vfs.exists(&inner.recovery_path)? {
                debug!(path = %path.display(), "recovery journal present; replaying before open");
                replay_recovery(inner.vfs.as_ref(), &mut host, &inner.recovery_path).map_err(
                    |e| match e {
                        SealError::RecoveryCorrupt { .. } => SealError::RecoveryNeeded {
                            path: path.to_owned(),
                        },
                        other => other,
                    },
                )?;
            }
            inner.host = Some(host);
            inner.init_existing(&filename, kdk.map(|k| Key128::from_bytes(*k)))?;
        }

        inner.status = FileStatus::Ok;
        if inner.mode.append {
            inner.offset = inner.logical_size();
        }
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, FileInner<V>>> {
        self.inner
            .lock()
            .map_err(|_| SealError::corrupted("file mutex poisoned"))
    }

    /// Run an operation under the mutex with the status guard applied.
    fn with_inner<T>(&self, op: impl FnOnce(&mut FileInner<V>) -> Result<T>) -> Result<T> {
        let mut inner = self.lock()?;
        if inner.status != FileStatus::Ok {
            return Err(SealError::BadStatus {
                status: inner.status,
            });
        }
        let result = op(&mut inner);
        if let Err(err) = &result {
            inner.note_error(err);
        }
        result
    }

    /// Read from the current offset; returns 0 at EOF.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.with_inner(|inner| inner.read(buf))
    }

    /// Write at the current offset (at the end, in append mode).
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.with_inner(|inner| inner.write(buf))
    }

    /// Reposition the stream offset. Only in-range seeks succeed.
    pub fn seek(&self, pos: std::io::SeekFrom) -> Result<u64> {
        self.with_inner(|inner| inner.seek(pos))
    }

    /// The current stream offset.
    pub fn tell(&self) -> Result<u64> {
        self.with_inner(|inner| Ok(inner.offset))
    }

    /// Flush all dirty state through the two-phase protocol and sync.
    pub fn flush(&self) -> Result<()> {
        self.with_inner(|inner| inner.internal_flush(true))
    }

    /// The last recorded error code, or `BadStatus` if the file left the
    /// `Ok` state without one.
    pub fn get_error(&self) -> ErrorCode {
        let Ok(inner) = self.inner.lock() else {
            return ErrorCode::BadStatus;
        };
        if inner.last_error != ErrorCode::Ok {
            inner.last_error
        } else if inner.status == FileStatus::Ok {
            ErrorCode::Ok
        } else {
            ErrorCode::BadStatus
        }
    }

    /// Whether a read has reached end-of-file.
    pub fn get_eof(&self) -> bool {
        self.inner.lock().map(|inner| inner.eof).unwrap_or(false)
    }

    /// Retry a recoverable failure and clear the sticky error state.
    ///
    /// Terminal states (crypto/corruption) are not clearable.
    pub fn clear_error(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match inner.status {
            FileStatus::FlushError => {
                if inner.internal_flush(true).is_ok() {
                    inner.status = FileStatus::Ok;
                }
            }
            FileStatus::WriteToDiskFailed => {
                if inner.commit(true).is_ok() {
                    inner.status = FileStatus::Ok;
                }
            }
            FileStatus::Ok => {}
            _ => return, // terminal, not initialized, or closed
        }
        if inner.status == FileStatus::Ok {
            inner.last_error = ErrorCode::Ok;
            inner.eof = false;
        }
    }

    /// Flush, then drop every plaintext node from the cache.
    pub fn clear_cache(&self) -> Result<()> {
        self.with_inner(|inner| {
            inner.internal_flush(true)?;
            debug_assert!(inner.cache.physicals_where(|n| n.dirty).is_empty());
            inner.cache.clear();
            Ok(())
        })
    }

    /// The GMAC currently authenticating the metadata node.
    pub fn current_meta_gmac(&self) -> Result<[u8; 16]> {
        self.with_inner(|inner| Ok(inner.meta_plain.meta_data_gmac))
    }

    /// Re-seal an auto-key file under a freshly drawn KDK and return it.
    ///
    /// After this returns, the file on disk is a KDK-mode file openable
    /// with the returned key on any host.
    pub fn rekey_to_user_kdk(&self) -> Result<[u8; 16]> {
        self.with_inner(|inner| {
            if inner.read_only {
                return Err(SealError::ReadOnly);
            }
            if matches!(inner.key_policy, KeyPolicy::UserKdk(_)) {
                return Err(SealError::invalid_argument(
                    "file is already sealed with a user key",
                ));
            }
            let mut key = [0u8; 16];
            inner.platform.fill_random(&mut key)?;
            inner.key_policy = KeyPolicy::UserKdk(Key128::from_bytes(key));
            inner.meta_plain.use_user_kdk_key = 1;
            inner.need_writing = true;
            inner.internal_flush(true)?;
            Ok(key)
        })
    }

    /// Re-seal a KDK-mode file under the platform sealing key.
    pub fn rekey_to_auto(&self) -> Result<()> {
        self.with_inner(|inner| {
            if inner.read_only {
                return Err(SealError::ReadOnly);
            }
            if matches!(inner.key_policy, KeyPolicy::Auto) {
                return Err(SealError::invalid_argument(
                    "file is already sealed with the platform key",
                ));
            }
            // Fail before touching anything if the platform cannot seal.
            let mut probe = [0u8; 32];
            inner.platform.fill_random(&mut probe)?;
            inner.platform.sealing_key(&probe)?;

            inner.key_policy = KeyPolicy::Auto;
            inner.meta_plain.use_user_kdk_key = 0;
            inner.need_writing = true;
            inner.internal_flush(true)
        })
    }

    /// Flush (when healthy), wipe all plaintext, and release the lock.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.status == FileStatus::Closed {
            return Ok(());
        }
        let flush_result = if inner.status == FileStatus::Ok && !inner.read_only {
            inner.internal_flush(true)
        } else {
            Ok(())
        };

        inner.cache.clear();
        inner.meta_encrypted.zeroize();
        if let Some(mut host) = inner.host.take() {
            let _ = host.close();
        }
        inner.status = FileStatus::Closed;
        flush_result
    }
}

impl<V: Vfs> Drop for SealedFile<V> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<V: Vfs> FileInner<V> {
    pub(crate) fn host_mut(&mut self) -> Result<&mut V::File> {
        self.host.as_mut().ok_or(SealError::BadStatus {
            status: FileStatus::Closed,
        })
    }

    pub(crate) fn logical_size(&self) -> u64 {
        u64::try_from(self.meta_encrypted.size).unwrap_or(0)
    }

    /// Record an error code and apply the terminal status transitions.
    pub(crate) fn note_error(&mut self, err: &SealError) {
        self.last_error = err.error_code();
        if err.is_terminal() {
            let next = if matches!(err, SealError::AuthFailed) {
                FileStatus::CryptoError
            } else {
                FileStatus::Corrupted
            };
            warn!(path = %self.path.display(), error = %err, status = %next, "terminal failure");
            self.status = next;
        }
    }

    /// Initialize state for a freshly created container.
    fn init_new(&mut self, filename: &str, kdk: Option<Key128>) -> Result<()> {
        self.meta_encrypted.set_filename(filename)?;
        match kdk {
            Some(kdk) => {
                self.meta_plain.use_user_kdk_key = 1;
                self.key_policy = KeyPolicy::UserKdk(kdk);
            }
            None => {
                // Probe the sealing capability so auto-mode opens fail fast
                // rather than at the first flush.
                let mut probe = [0u8; 32];
                self.platform.fill_random(&mut probe)?;
                self.platform.sealing_key(&probe)?;
                self.key_policy = KeyPolicy::Auto;
            }
        }
        // Even an untouched new file persists its metadata node on close.
        self.need_writing = true;
        Ok(())
    }

    /// Authenticate and load an existing container.
    fn init_existing(&mut self, filename: &str, kdk: Option<Key128>) -> Result<()> {
        let image = read_node_raw(self.host_mut()?, NodeNumber::METADATA)?;
        self.meta_plain = MetaPlain::decode(&image);

        if self.meta_plain.file_id != SEALFS_MAGIC {
            return Err(SealError::BadMagic {
                found: self.meta_plain.file_id,
            });
        }
        if self.meta_plain.major_version != SEALFS_MAJOR_VERSION {
            return Err(SealError::BadVersion {
                major: self.meta_plain.major_version,
                minor: self.meta_plain.minor_version,
            });
        }
        if self.meta_plain.update_flag == 1 {
            // The journal was already replayed (or never existed); a set
            // flag at this point means the update cannot be rolled back.
            return Err(SealError::RecoveryNeeded {
                path: self.path.clone(),
            });
        }

        let meta_key = match (self.meta_plain.use_user_kdk_key, kdk) {
            (1, Some(kdk)) => {
                if self.meta_plain.meta_data_key_id == [0u8; 32] {
                    return Err(SealError::NoKeyId);
                }
                let key = derive_metadata_key(&kdk, &self.meta_plain.meta_data_key_id)?;
                self.key_policy = KeyPolicy::UserKdk(kdk);
                key
            }
            (1, None) => {
                return Err(SealError::invalid_argument(
                    "file is sealed with a user key; none was supplied",
                ))
            }
            (0, Some(_)) => {
                return Err(SealError::invalid_argument(
                    "file is not sealed with a user key",
                ))
            }
            (0, None) => {
                if self.meta_plain.meta_data_key_id == [0u8; 32] {
                    return Err(SealError::NoKeyId);
                }
                self.key_policy = KeyPolicy::Auto;
                Key128::from_bytes(
                    self.platform
                        .sealing_key(&self.meta_plain.meta_data_key_id)?,
                )
            }
            _ => {
                return Err(SealError::corrupted(
                    "metadata key-policy flag is out of range",
                ))
            }
        };

        let mut enc_bytes = [0u8; META_ENCRYPTED_SIZE];
        aead_decrypt(
            meta_key.as_bytes(),
            &EMPTY_IV,
            b"",
            &image[META_PLAIN_SIZE..META_PLAIN_SIZE + META_ENCRYPTED_SIZE],
            &self.meta_plain.meta_data_gmac,
            &mut enc_bytes,
        )?;
        self.meta_encrypted = MetaEncrypted::from_bytes(&enc_bytes);
        enc_bytes.zeroize();

        if self.meta_encrypted.filename() != filename {
            return Err(SealError::NameMismatch {
                stored: self.meta_encrypted.filename(),
                opened: filename.to_owned(),
            });
        }
        if self.meta_encrypted.size < 0 {
            return Err(SealError::corrupted("negative logical size"));
        }

        let size = self.logical_size();
        if size > MD_USER_DATA_SIZE as u64 {
            // Every byte beyond the inline region must map to a node that
            // actually exists in the backing file.
            let last_index = (size - MD_USER_DATA_SIZE as u64 - 1) / NODE_SIZE as u64;
            let needed = physical_of_data(last_index).byte_offset() + NODE_SIZE as u64;
            if needed > self.real_file_size {
                return Err(SealError::corrupted(
                    "logical size exceeds the reachable data nodes",
                ));
            }

            let cipher = read_node_raw(self.host_mut()?, NodeNumber::ROOT_MHT)?;
            let mut plain = Box::new([0u8; NODE_SIZE]);
            aead_decrypt(
                &self.meta_encrypted.mht_key,
                &EMPTY_IV,
                b"",
                &cipher[..],
                &self.meta_encrypted.mht_gmac,
                &mut plain[..],
            )?;
            let root = MhtNode::from_bytes(&plain);
            plain.zeroize();
            self.cache
                .insert(CachedNode::mht_from_disk(NodeNumber::ROOT_MHT, 0, root, cipher));
        }

        self.meta_disk_image = image;
        Ok(())
    }

    pub(crate) fn data_index_of(&self, physical: NodeNumber) -> u64 {
        match sealfs_types::address::role_of_physical(physical) {
            NodeRole::Data(index) => index,
            NodeRole::Metadata | NodeRole::Mht(_) => {
                unreachable!("physical {physical} is not a data node")
            }
        }
    }
}
