//! Materialized file records.
//!
//! A snapshot build copies the scanned tree into [`CachedFile`] records
//! with everything the serving path needs precomputed: the raw bytes, the
//! 16-byte MD5 checksum, and a deflate block flushed with a sync marker
//! and stripped of it, so a client-side inflater can continue statefully
//! after each block. Serving a file afterwards costs no CPU at all.

use std::sync::Arc;

use flate2::{Compress, Compression, FlushCompress, Status};
use md5::{Digest, Md5};

use crate::error::SnapshotError;
use crate::repository::Node;

/// Trailer zlib appends on a sync flush; stripped for transport and
/// re-appended by the receiving inflater.
pub const SYNC_MARKER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// Compression level applied to every cached content block.
const DEFLATE_LEVEL: u32 = 6;

/// One immutable entry of a materialized snapshot.
///
/// Directories carry children (in source order) and nothing else; files
/// carry contents, the compressed block, and the checksum.
#[derive(Debug)]
pub struct CachedFile {
    name: String,
    size: u64,
    contents: Option<Vec<u8>>,
    compressed: Option<Vec<u8>>,
    checksum: Option<[u8; 16]>,
    last_modified: u64,
    children: Option<Vec<Arc<CachedFile>>>,
}

impl CachedFile {
    /// Module-relative path of this entry.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Content size in bytes; zero for directories.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Raw contents; absent for directories.
    #[must_use]
    pub fn contents(&self) -> Option<&[u8]> {
        self.contents.as_deref()
    }

    /// Deflated contents with the sync marker stripped; absent for
    /// directories.
    #[must_use]
    pub fn compressed_contents(&self) -> Option<&[u8]> {
        self.compressed.as_deref()
    }

    /// MD5 digest of the raw contents; absent for directories.
    #[must_use]
    pub const fn checksum(&self) -> Option<&[u8; 16]> {
        self.checksum.as_ref()
    }

    /// Modification time in seconds since the epoch.
    #[must_use]
    pub const fn last_modified(&self) -> u64 {
        self.last_modified
    }

    /// True for directory entries.
    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.children.is_some()
    }

    /// Children in source order; present iff this is a directory.
    #[must_use]
    pub fn children(&self) -> Option<&[Arc<CachedFile>]> {
        self.children.as_deref()
    }
}

/// Builds [`CachedFile`] trees from scanned nodes.
///
/// One digest context is reused (reset per file) across a whole build; the
/// builder must therefore stay on the build's own thread.
#[derive(Default)]
pub struct CachedFileBuilder {
    digest: Md5,
}

impl CachedFileBuilder {
    /// Creates a builder with a fresh digest context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Materializes `node` and everything below it.
    ///
    /// # Errors
    ///
    /// [`SnapshotError`] when a content block cannot be deflated.
    pub fn build(&mut self, node: &Node) -> Result<Arc<CachedFile>, SnapshotError> {
        let compressed = match node.content() {
            Some(raw) => Some(deflate_block(raw)?),
            None => None,
        };
        let checksum = node.content().map(|raw| {
            self.digest.update(raw);
            self.digest.finalize_reset().into()
        });
        let children = if node.is_directory() {
            let mut built = Vec::with_capacity(node.children().len());
            for child in node.children() {
                built.push(self.build(child)?);
            }
            Some(built)
        } else {
            None
        };
        Ok(Arc::new(CachedFile {
            name: node.name().to_owned(),
            size: node.size(),
            contents: node.content().map(<[u8]>::to_vec),
            compressed,
            checksum,
            last_modified: node.last_modified(),
            children,
        }))
    }
}

/// Deflates `input` with a sync flush and strips the trailing marker.
///
/// Raw deflate without a zlib header, matching a window of −15 bits on the
/// peer's inflate side.
fn deflate_block(input: &[u8]) -> Result<Vec<u8>, SnapshotError> {
    let mut deflate = Compress::new(Compression::new(DEFLATE_LEVEL), false);
    let mut out = Vec::with_capacity(input.len() / 2 + 64);
    loop {
        let consumed = deflate.total_in() as usize;
        let status = deflate.compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)?;
        let drained = deflate.total_in() as usize == input.len();
        // Spare output capacity after the call means the flush completed.
        let starved = out.len() == out.capacity();
        match status {
            Status::Ok | Status::BufError if drained && !starved => break,
            Status::Ok | Status::BufError => out.reserve(out.capacity().max(64)),
            Status::StreamEnd => break,
        }
    }
    if out.len() < SYNC_MARKER.len() || out[out.len() - SYNC_MARKER.len()..] != SYNC_MARKER {
        return Err(SnapshotError::MissingSyncMarker);
    }
    out.truncate(out.len() - SYNC_MARKER.len());
    Ok(out)
}
