//! Open-mode string parsing.
//!
//! Modes follow the C stream conventions: `r`, `r+`, `w`, `w+`, `a`, `a+`,
//! each optionally carrying a `b` which is accepted and ignored (there is no
//! text/binary distinction for an encrypted container).

use sealfs_error::{Result, SealError};

/// Parsed open mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    /// First character was `r`.
    pub read: bool,
    /// First character was `w` (implies truncation).
    pub write: bool,
    /// First character was `a`.
    pub append: bool,
    /// `+` was present.
    pub update: bool,
    /// `b` was present.
    pub binary: bool,
}

impl OpenMode {
    /// Parse a mode string.
    pub fn parse(mode: &str) -> Result<Self> {
        let invalid = || SealError::InvalidMode {
            mode: mode.to_owned(),
        };

        let mut chars = mode.chars();
        let mut parsed = match chars.next() {
            Some('r') => Self {
                read: true,
                write: false,
                append: false,
                update: false,
                binary: false,
            },
            Some('w') => Self {
                read: false,
                write: true,
                append: false,
                update: false,
                binary: false,
            },
            Some('a') => Self {
                read: false,
                write: false,
                append: true,
                update: false,
                binary: false,
            },
            _ => return Err(invalid()),
        };

        for c in chars {
            match c {
                '+' if !parsed.update => parsed.update = true,
                'b' if !parsed.binary => parsed.binary = true,
                _ => return Err(invalid()),
            }
        }

        Ok(parsed)
    }

    /// Whether the file may only be read.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        self.read && !self.update
    }

    /// Whether opening truncates an existing file to zero length.
    #[must_use]
    pub const fn truncates(self) -> bool {
        self.write
    }
}
