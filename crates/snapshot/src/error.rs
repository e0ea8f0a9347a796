//! Snapshot error taxonomy.

use thiserror::Error;

/// Returned when a requested path has no entry in the published snapshot.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Error)]
#[error("no such path")]
pub struct NoSuchPath;

/// Errors raised while materializing a snapshot.
///
/// A failed build aborts the rebuild; the previously published snapshot
/// stays authoritative.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The deflate stream could not be produced.
    #[error("deflate failed: {0}")]
    Deflate(#[from] flate2::CompressError),
    /// The deflated output was too short to carry the sync marker.
    #[error("deflated output doesn't have sync marker bytes")]
    MissingSyncMarker,
}
