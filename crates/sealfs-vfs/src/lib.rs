//! Raw node I/O for sealfs.
//!
//! This crate knows nothing about encryption or the MHT; it moves whole
//! 4096-byte nodes between memory and a backing file, enforces the advisory
//! lock protocol at open, and replays recovery journals. Two backends are
//! provided: [`UnixVfs`] over real files with `flock`, and [`MemoryVfs`]
//! for hermetic tests.

pub mod memory;
pub mod recovery;
pub mod traits;
#[cfg(unix)]
pub mod unix;

pub use memory::MemoryVfs;
pub use recovery::replay_recovery;
pub use traits::{Vfs, VfsFile};
#[cfg(unix)]
pub use unix::UnixVfs;
