use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for sealfs operations.
///
/// Structured variants for the failure classes a protected file can hit:
/// caller mistakes, lock contention, host I/O, and the terminal
/// cryptographic/structural failures that poison the file object.
#[derive(Error, Debug)]
pub enum SealError {
    // === Caller errors ===
    /// Path is empty, not valid UTF-8, or its basename exceeds the stored
    /// filename limit.
    #[error("invalid path: '{}'", path.display())]
    InvalidPath { path: PathBuf },

    /// Open-mode string is not one of r/r+/w/w+/a/a+ (with optional b).
    #[error("invalid open mode: '{mode}'")]
    InvalidMode { mode: String },

    /// Generic invalid argument (zero-length buffer, bad combination of
    /// options, missing key for a keyed file).
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// Seek target is outside [0, size]; sparse growth is not supported.
    #[error("seek out of range: {offset}")]
    SeekOutOfRange { offset: i64 },

    /// Write attempted on a file opened read-only.
    #[error("file is opened read-only")]
    ReadOnly,

    // === Contention ===
    /// Advisory file lock is held by another opener.
    #[error("file is locked: '{}'", path.display())]
    Busy { path: PathBuf },

    // === Host I/O ===
    /// Underlying host filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Short transfer reading a node.
    #[error("short read at node {node}: got {actual} of {expected}")]
    ShortRead {
        node: u64,
        expected: usize,
        actual: usize,
    },

    // === Terminal cryptographic/structural failures ===
    /// GCM tag mismatch — anywhere in the tree, this is fatal.
    #[error("authentication failed (tag mismatch)")]
    AuthFailed,

    /// Metadata node does not carry the file magic.
    #[error("bad file magic: {found:#018x}")]
    BadMagic { found: u64 },

    /// Metadata node carries an unsupported format version.
    #[error("unsupported file version {major}.{minor}")]
    BadVersion { major: u8, minor: u8 },

    /// A structural invariant does not hold on the persisted state.
    #[error("file is corrupted: {detail}")]
    Corrupted { detail: String },

    /// Stored canonical filename does not match the path being opened.
    #[error("filename mismatch: stored '{stored}', opened '{opened}'")]
    NameMismatch { stored: String, opened: String },

    // === Recovery ===
    /// A recovery journal exists but replay failed; the file cannot be
    /// opened until externally repaired.
    #[error("recovery needed: '{}'", path.display())]
    RecoveryNeeded { path: PathBuf },

    /// Recovery journal has invalid record granularity.
    #[error("recovery file size {size} is not a whole number of records")]
    RecoveryCorrupt { size: u64 },

    // === Keys ===
    /// KDK-mode file has no stored key-id, so the metadata key cannot be
    /// re-derived.
    #[error("no key id stored in metadata")]
    NoKeyId,

    /// Requested key source is not available (no platform sealing key).
    #[error("unsupported operation")]
    Unsupported,

    // === Resources / lifecycle ===
    /// Allocation failure.
    #[error("out of memory")]
    OutOfMemory,

    /// Operation attempted while the file is not in the `Ok` status.
    #[error("operation not permitted in status {status}")]
    BadStatus { status: FileStatus },
}

/// Numeric error codes surfaced through `get_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// No error.
    Ok = 0,
    /// Invalid argument, path, mode, or seek target.
    InvalidArgument = 1,
    /// Advisory lock contended.
    Busy = 2,
    /// Host filesystem error.
    Io = 3,
    /// GCM authentication failure.
    AuthFailed = 4,
    /// Bad file magic.
    BadMagic = 5,
    /// Unsupported format version.
    BadVersion = 6,
    /// Structural invariant violated.
    Corrupted = 7,
    /// Recovery required and failed.
    RecoveryNeeded = 8,
    /// Recovery journal format rejected.
    NotSupported = 9,
    /// Allocation failure.
    OutOfMemory = 10,
    /// KDK mode without a stored key-id.
    NoKeyId = 11,
    /// Operation in a non-Ok file status.
    BadStatus = 12,
    /// Operation unavailable on this platform backend.
    Unsupported = 13,
}

/// Lifecycle status of an open protected file.
///
/// ```text
/// NotInitialized → Ok → {FlushError, WriteToDiskFailed}  (recoverable)
///                     → {CryptoError, Corrupted, MemoryCorrupted}  (terminal)
///                     → Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Construction has not completed.
    NotInitialized,
    /// File is healthy; all operations permitted.
    Ok,
    /// Writing the recovery journal failed; `clear_error` retries the full
    /// two-phase flush.
    FlushError,
    /// Committing dirty nodes failed after the journal was durable;
    /// `clear_error` retries the commit.
    WriteToDiskFailed,
    /// Authentication failed somewhere in the tree. Terminal.
    CryptoError,
    /// A structural invariant was violated. Terminal.
    Corrupted,
    /// In-memory state failed an internal consistency check. Terminal.
    MemoryCorrupted,
    /// File was closed.
    Closed,
}

impl FileStatus {
    /// Whether `clear_error` can bring the file back to `Ok`.
    #[must_use]
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::FlushError | Self::WriteToDiskFailed)
    }

    /// Whether this status permanently poisons the file object.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::CryptoError | Self::Corrupted | Self::MemoryCorrupted
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotInitialized => "not-initialized",
            Self::Ok => "ok",
            Self::FlushError => "flush-error",
            Self::WriteToDiskFailed => "write-to-disk-failed",
            Self::CryptoError => "crypto-error",
            Self::Corrupted => "corrupted",
            Self::MemoryCorrupted => "memory-corrupted",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl SealError {
    /// Map this error to the numeric code reported by `get_error`.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidPath { .. }
            | Self::InvalidMode { .. }
            | Self::InvalidArgument { .. }
            | Self::SeekOutOfRange { .. }
            | Self::ReadOnly => ErrorCode::InvalidArgument,
            Self::Busy { .. } => ErrorCode::Busy,
            Self::Io(_) | Self::ShortRead { .. } => ErrorCode::Io,
            Self::AuthFailed => ErrorCode::AuthFailed,
            Self::BadMagic { .. } => ErrorCode::BadMagic,
            Self::BadVersion { .. } => ErrorCode::BadVersion,
            Self::Corrupted { .. } | Self::NameMismatch { .. } => ErrorCode::Corrupted,
            Self::RecoveryNeeded { .. } => ErrorCode::RecoveryNeeded,
            Self::RecoveryCorrupt { .. } => ErrorCode::NotSupported,
            Self::NoKeyId => ErrorCode::NoKeyId,
            Self::Unsupported => ErrorCode::Unsupported,
            Self::OutOfMemory => ErrorCode::OutOfMemory,
            Self::BadStatus { .. } => ErrorCode::BadStatus,
        }
    }

    /// Whether this failure permanently poisons the file object.
    ///
    /// Terminal errors transition the file to `CryptoError` or `Corrupted`;
    /// only `get_error`, `get_eof`, and `close` remain legal afterwards.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AuthFailed
                | Self::BadMagic { .. }
                | Self::BadVersion { .. }
                | Self::Corrupted { .. }
                | Self::NameMismatch { .. }
        )
    }

    /// Whether a retry may succeed without any other change.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Io(_))
    }

    /// Create a corruption error.
    pub fn corrupted(detail: impl Into<String>) -> Self {
        Self::Corrupted {
            detail: detail.into(),
        }
    }

    /// Create an invalid-argument error.
    pub fn invalid_argument(detail: impl Into<String>) -> Self {
        Self::InvalidArgument {
            detail: detail.into(),
        }
    }
}

/// Result type alias using `SealError`.
pub type Result<T> = std::result::Result<T, SealError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = SealError::corrupted("size field exceeds reachable nodes");
        assert_eq!(
            err.to_string(),
            "file is corrupted: size field exceeds reachable nodes"
        );

        let err = SealError::BadVersion { major: 2, minor: 0 };
        assert_eq!(err.to_string(), "unsupported file version 2.0");

        let err = SealError::BadMagic { found: 0x1122 };
        assert_eq!(err.to_string(), "bad file magic: 0x0000000000001122");
    }

    #[test]
    fn error_code_mapping() {
        assert_eq!(
            SealError::invalid_argument("x").error_code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            SealError::Busy {
                path: PathBuf::from("f")
            }
            .error_code(),
            ErrorCode::Busy
        );
        assert_eq!(SealError::AuthFailed.error_code(), ErrorCode::AuthFailed);
        assert_eq!(
            SealError::RecoveryCorrupt { size: 17 }.error_code(),
            ErrorCode::NotSupported
        );
        assert_eq!(
            SealError::NameMismatch {
                stored: "a".to_owned(),
                opened: "b".to_owned()
            }
            .error_code(),
            ErrorCode::Corrupted
        );
        assert_eq!(SealError::NoKeyId.error_code(), ErrorCode::NoKeyId);
    }

    #[test]
    fn terminal_classification() {
        assert!(SealError::AuthFailed.is_terminal());
        assert!(SealError::BadMagic { found: 0 }.is_terminal());
        assert!(SealError::corrupted("x").is_terminal());
        assert!(!SealError::ReadOnly.is_terminal());
        assert!(
            !SealError::Busy {
                path: PathBuf::from("f")
            }
            .is_terminal()
        );
        assert!(!SealError::OutOfMemory.is_terminal());
    }

    #[test]
    fn transient_classification() {
        assert!(
            SealError::Busy {
                path: PathBuf::from("f")
            }
            .is_transient()
        );
        let io = std::io::Error::new(std::io::ErrorKind::Interrupted, "eintr");
        assert!(SealError::Io(io).is_transient());
        assert!(!SealError::AuthFailed.is_transient());
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SealError = io_err.into();
        assert!(matches!(err, SealError::Io(_)));
        assert_eq!(err.error_code(), ErrorCode::Io);
    }

    #[test]
    fn status_machine_classification() {
        assert!(FileStatus::FlushError.is_recoverable());
        assert!(FileStatus::WriteToDiskFailed.is_recoverable());
        assert!(!FileStatus::CryptoError.is_recoverable());
        assert!(FileStatus::CryptoError.is_terminal());
        assert!(FileStatus::Corrupted.is_terminal());
        assert!(FileStatus::MemoryCorrupted.is_terminal());
        assert!(!FileStatus::Ok.is_terminal());
        assert!(!FileStatus::Closed.is_recoverable());
    }

    #[test]
    fn status_display() {
        assert_eq!(FileStatus::Ok.to_string(), "ok");
        assert_eq!(
            FileStatus::WriteToDiskFailed.to_string(),
            "write-to-disk-failed"
        );
        let err = SealError::BadStatus {
            status: FileStatus::CryptoError,
        };
        assert_eq!(
            err.to_string(),
            "operation not permitted in status crypto-error"
        );
    }

    #[test]
    fn error_code_values() {
        assert_eq!(ErrorCode::Ok as u32, 0);
        assert_eq!(ErrorCode::InvalidArgument as u32, 1);
        assert_eq!(ErrorCode::Busy as u32, 2);
        assert_eq!(ErrorCode::AuthFailed as u32, 4);
        assert_eq!(ErrorCode::BadStatus as u32, 12);
    }
}
