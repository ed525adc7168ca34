//! Tilewright: compiles OSM extracts and transit schedules into tiled
//! binary routing graphs.
//!
//! Pipeline:
//! - Ingest: two streaming passes over the extract; tag transform, way
//!   table, node map, presence bitsets
//! - Splice: ways split at intersection nodes into edges with shapes
//! - Sort: per-node edge ordering (driveable first, then importance)
//! - Tile: nodes assigned graph ids on the fixed-pitch global grid
//! - Emit: parallel tile writers producing node and directed-edge records
//! - Validate: cross-tile opposing-edge resolution, defect detection,
//!   statistics
//! - Transit: schedule documents spliced into the emitted tiles
//!
//! Stages communicate only through the tables built by earlier stages and
//! the tile files on disk; no stage mutates a predecessor's output.

pub mod config;
pub mod emit;
pub mod error;
pub mod formats;
pub mod geo;
pub mod graph;
pub mod graphid;
pub mod idtable;
pub mod ingest;
pub mod osm;
pub mod servicedays;
pub mod stats;
pub mod tilecache;
pub mod tiles;
pub mod timezones;
pub mod transform;
pub mod transit;
pub mod validate;

pub use config::Config;
pub use error::FatalError;
pub use formats::GraphTile;
pub use graphid::GraphId;
pub use tiles::TileGrid;
pub use transform::{BuiltinTransform, Transform};
