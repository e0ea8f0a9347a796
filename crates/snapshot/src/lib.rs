#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `snapshot` is the in-memory content side of the read-only rsync daemon:
//! it consumes immutable file trees from a repository scanner and serves
//! prebuilt, immutable [`FileList`] values to the session layer. All the
//! expensive work (MD5 checksums and sync-flushed deflate blocks for every
//! file, one listing per requestable path) happens once per rebuild, so
//! the serving path does no hashing, no compression, and no tree walks.
//!
//! # Design
//!
//! - [`Node`], [`Repository`], and [`Watcher`] form the seam to the
//!   external scanner.
//! - [`CachedFileBuilder`] materializes a scanned tree into
//!   [`CachedFile`] records.
//! - [`FileListBuilder`] flattens those records into [`FileList`] values,
//!   recursively or one level deep.
//! - [`MemoryCachedModule`] indexes a listing under every path a client
//!   could request (directories both with and without a trailing slash)
//!   and publishes each rebuild by swapping two reference-counted maps.
//!
//! # Invariants
//!
//! - Every path present in the recursive map is present in the
//!   non-recursive map with the same root.
//! - After a rebuild completes, looking up the module name itself (or the
//!   name plus `/`) succeeds.
//! - Readers never observe a half-built snapshot: a lookup resolves
//!   against whichever complete map pair was published last, and a listing
//!   already handed out survives later swaps unchanged.
//!
//! # Errors
//!
//! Lookups outside the module or against missing paths return
//! [`NoSuchPath`]. Rebuild failures ([`SnapshotError`]) abort the rebuild
//! and leave the previous snapshot in place; they are never visible to
//! readers.

mod cache;
mod error;
mod file;
mod list;
mod repository;

pub use cache::{MemoryCachedModule, Module};
pub use error::{NoSuchPath, SnapshotError};
pub use file::{CachedFile, CachedFileBuilder, SYNC_MARKER};
pub use list::{FileList, FileListBuilder};
pub use repository::{Node, Repository, Watcher};
