//! # Dedupfs
//!
//! Layered persistent storage. From the bottom up:
//!
//! - [`KvLog`] — an append-only keyed record log with per-id history and
//!   CRC-checked records;
//! - [`RadixTree`] — a persistent radix tree over a log, mapping string
//!   keys to bytes with prefix enumeration;
//! - [`DedupStore`] — a content-addressed, reference-counted blob store
//!   composed from logs and radix trees;
//! - [`Vfs`] — a hierarchical filesystem contract with log-backed,
//!   host-backed and prefix-mounted composite implementations.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod dedup;
mod error;
mod kvlog;
mod radix;
mod vfs;

pub use dedup::{DedupStore, Reference, MAX_BLOB_SIZE};
pub use error::{Result, StoreError};
pub use kvlog::{KeySize, KvLog, Location, LogConfig, Lookup};
pub use radix::RadixTree;
pub use vfs::{
    copy_tree, DirEntry, Entry, FileEntry, FileHandle, FileType, LocalVfs, LogVfs, Metadata,
    NestedVfs, OpenMode, SymlinkEntry, Vfs,
};
