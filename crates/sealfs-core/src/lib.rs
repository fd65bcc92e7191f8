//! Protected file core.
//!
//! A [`SealedFile`] is a single-file container of 4096-byte nodes arranged
//! in a Merkle-like hash tree: every data node is AES-128-GCM sealed under
//! a single-use derived key, every parent stores its children's `(key,
//! gmac)` pairs, and the root of trust is the metadata node sealed under a
//! key derived from a caller KDK or the platform sealing key. All logical
//! I/O flows through a bounded LRU cache of plaintext nodes; multi-node
//! updates are made crash-atomic by a pre-image recovery journal.

mod cache;
mod file;
mod flush;
mod mht;
mod node;
mod rw;

pub use file::{remove, SealedFile};
