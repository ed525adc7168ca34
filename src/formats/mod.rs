//! On-disk artifact formats.

pub mod crc;
pub mod tile;

pub use tile::{
    AdminRecord, DirectedEdgeRecord, EdgeInfoRecord, GraphTile, NodeRecord, SignRecord, SignType,
    TileHeader, TransitDepartureRecord, TransitRouteRecord, TransitStopRecord,
};
