//! Fatal error kinds for the build pipeline.
//!
//! Only conditions that abort the whole build get a typed variant here.
//! Record-level data defects are logged at the point of detection and the
//! offending record is skipped; they never become errors.

use std::path::PathBuf;

/// Errors that abort the build.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    /// A required configuration key is missing or unusable.
    #[error("configuration: {0}")]
    Config(String),

    /// An OSM id in the extract exceeds the configured maximum. The build
    /// must be re-run with a raised `max_osm_id`.
    #[error("OSM id {id} exceeds configured maximum {max}")]
    OsmIdOutOfRange { id: u64, max: u64 },

    /// The tag transform raised on input it must be total over.
    #[error("tag transform failed: {0}")]
    Transform(String),

    /// A tile file could not be created or read back.
    #[error("tile I/O on {path}: {reason}")]
    TileIo { path: PathBuf, reason: String },

    /// A worker thread died; surfaced when the pool is joined.
    #[error("worker thread panicked during {stage}")]
    WorkerPanic { stage: &'static str },
}
