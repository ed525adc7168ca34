//! The graph tile: the unit the emitter writes, the validator reopens and
//! the transit splicer extends.
//!
//! On disk a tile is a small fixed header (magic, version, body length)
//! followed by the bincode-serialized `GraphTile` and a CRC-64-ISO footer
//! over everything before it. Readers verify the checksum before trusting
//! the body, so a torn write surfaces as a checksum error, not garbage
//! records.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::crc;
use crate::error::FatalError;
use crate::geo::LatLng;
use crate::graphid::GraphId;
use crate::osm::{CycleLane, EdgeUse, NodeType, RoadClass, SpeedType};
use crate::tiles::tile_path;

const MAGIC: u32 = 0x47_50_48_54; // "GPHT"
const VERSION: u16 = 3;

/// Sentinel local index recorded when no opposing edge could be resolved.
pub const NO_OPPOSING_INDEX: u32 = u32::MAX;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TileHeader {
    pub graphid: GraphId,
    pub node_count: u32,
    pub directededge_count: u32,
    pub sign_count: u32,
    pub admin_count: u32,
    pub transit_stop_count: u32,
    pub transit_route_count: u32,
    pub transit_departure_count: u32,
    /// (min_lat, min_lng, max_lat, max_lng)
    pub bbox: (f64, f64, f64, f64),
    /// Road kilometers per square kilometer, filled by the validator.
    pub density: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    pub ll: LatLng,
    /// Index of the first outbound directed edge within this tile.
    pub edge_index: u32,
    pub edge_count: u32,
    pub best_class: RoadClass,
    pub node_type: NodeType,
    pub access: u16,
    pub admin_index: u16,
    pub timezone: u16,
    /// Transit stop key; zero on ordinary nodes.
    pub stop_id: u32,
    pub mode_change: bool,
    pub parent: bool,
    pub child: bool,
    pub traffic_signal: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectedEdgeRecord {
    /// Graph id of the end node, possibly in another tile.
    pub end_node: GraphId,
    /// Length in meters.
    pub length: f32,
    pub speed: u8,
    pub truck_speed: u8,
    pub use_: EdgeUse,
    pub class: RoadClass,
    pub unpaved: bool,
    pub cyclelane: CycleLane,
    pub bridge: bool,
    pub tunnel: bool,
    pub roundabout: bool,
    pub link: bool,
    pub ferry: bool,
    pub rail_ferry: bool,
    pub toll: bool,
    pub destination_only: bool,
    pub truck_route: bool,
    pub bike_network: u8,
    /// True when this record traverses the way in its digitised direction.
    pub forward: bool,
    pub forward_access: u16,
    pub reverse_access: u16,
    pub traffic_signal: bool,
    pub speed_type: SpeedType,
    /// This edge's position within its owning node's edge list.
    pub local_edge_index: u32,
    /// The opposing edge's position within the end node's edge list.
    pub opp_index: u32,
    pub restrictions: u32,
    pub not_thru: bool,
    pub internal: bool,
    pub country_crossing: bool,
    pub shortcut: bool,
    pub exit_sign: bool,
    /// Index into the tile's edge-info table.
    pub edge_info_offset: u32,
    /// Transit line id; zero on road edges.
    pub line_id: u32,
}

impl Default for DirectedEdgeRecord {
    fn default() -> Self {
        Self {
            end_node: GraphId::INVALID,
            length: 0.0,
            speed: 0,
            truck_speed: 0,
            use_: EdgeUse::None,
            class: RoadClass::Other,
            unpaved: false,
            cyclelane: CycleLane::None,
            bridge: false,
            tunnel: false,
            roundabout: false,
            link: false,
            ferry: false,
            rail_ferry: false,
            toll: false,
            destination_only: false,
            truck_route: false,
            bike_network: 0,
            forward: true,
            forward_access: 0,
            reverse_access: 0,
            traffic_signal: false,
            speed_type: SpeedType::Classified,
            local_edge_index: 0,
            opp_index: NO_OPPOSING_INDEX,
            restrictions: 0,
            not_thru: false,
            internal: false,
            country_crossing: false,
            shortcut: false,
            exit_sign: false,
            edge_info_offset: 0,
            line_id: 0,
        }
    }
}

/// Shared polyline and names for the two directed edges of a segment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeInfoRecord {
    pub way_id: u64,
    pub shape: Vec<LatLng>,
    /// Offsets into the tile name table.
    pub name_offsets: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignType {
    ExitNumber,
    ExitBranch,
    ExitToward,
    ExitName,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignRecord {
    pub edge_index: u32,
    pub sign_type: SignType,
    pub text_offset: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminRecord {
    pub country_iso: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitStopRecord {
    pub stop_key: u32,
    pub onestop_offset: u32,
    pub name_offset: u32,
    pub desc_offset: u32,
    pub parent: u32,
    pub wheelchair_boarding: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitRouteRecord {
    pub route_key: u32,
    pub route_type: u8,
    pub onestop_offset: u32,
    pub operated_by_onestop_offset: u32,
    pub operated_by_name_offset: u32,
    pub color: u32,
    pub text_color: u32,
    pub short_name_offset: u32,
    pub long_name_offset: u32,
    pub desc_offset: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitDepartureRecord {
    pub line_id: u32,
    pub trip: u32,
    pub route: u32,
    pub block: u32,
    pub headsign_offset: u32,
    /// Seconds from midnight.
    pub departure_time: u32,
    pub elapsed_time: u32,
    /// Days from the fixed pivot date.
    pub start_date: u32,
    pub end_date: u32,
    pub dow_mask: u8,
    pub days: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphTile {
    pub header: TileHeader,
    pub nodes: Vec<NodeRecord>,
    pub directededges: Vec<DirectedEdgeRecord>,
    pub edgeinfo: Vec<EdgeInfoRecord>,
    pub names: Vec<String>,
    pub signs: Vec<SignRecord>,
    pub admins: Vec<AdminRecord>,
    pub transit_stops: Vec<TransitStopRecord>,
    pub transit_routes: Vec<TransitRouteRecord>,
    pub transit_departures: Vec<TransitDepartureRecord>,

    #[serde(skip)]
    name_index: HashMap<String, u32>,
    #[serde(skip)]
    edgeinfo_index: HashMap<u64, u32>,
}

impl GraphTile {
    pub fn new(graphid: GraphId) -> Self {
        let mut tile = GraphTile::default();
        tile.header.graphid = graphid;
        // Admin index 0 is the "unknown" entry so node records can always
        // point somewhere.
        tile.admins.push(AdminRecord::default());
        tile
    }

    pub fn graphid(&self) -> GraphId {
        self.header.graphid
    }

    pub fn node(&self, index: u32) -> &NodeRecord {
        &self.nodes[index as usize]
    }

    pub fn directededge(&self, index: u32) -> &DirectedEdgeRecord {
        &self.directededges[index as usize]
    }

    pub fn edge_info(&self, offset: u32) -> &EdgeInfoRecord {
        &self.edgeinfo[offset as usize]
    }

    pub fn admin(&self, index: u16) -> &AdminRecord {
        self.admins
            .get(index as usize)
            .unwrap_or_else(|| &self.admins[0])
    }

    pub fn name(&self, offset: u32) -> &str {
        &self.names[offset as usize]
    }

    /// Intern a string in the name table, deduplicated.
    pub fn add_name(&mut self, name: &str) -> u32 {
        if let Some(&off) = self.name_index.get(name) {
            return off;
        }
        let off = self.names.len() as u32;
        self.names.push(name.to_string());
        self.name_index.insert(name.to_string(), off);
        off
    }

    /// Add (or find) the edge-info record for a physical edge. `edge_key`
    /// identifies the segment, so the two directed edges of one segment
    /// share a record.
    pub fn add_edge_info(
        &mut self,
        edge_key: u64,
        way_id: u64,
        shape: &[LatLng],
        names: &[String],
    ) -> u32 {
        if let Some(&off) = self.edgeinfo_index.get(&edge_key) {
            return off;
        }
        let name_offsets = names.iter().map(|n| self.add_name(n)).collect();
        let off = self.edgeinfo.len() as u32;
        self.edgeinfo.push(EdgeInfoRecord {
            way_id,
            shape: shape.to_vec(),
            name_offsets,
        });
        self.edgeinfo_index.insert(edge_key, off);
        off
    }

    pub fn add_admin(&mut self, country_iso: &str, name: &str) -> u16 {
        let index = self.admins.len() as u16;
        self.admins.push(AdminRecord {
            country_iso: country_iso.to_string(),
            name: name.to_string(),
        });
        index
    }

    fn sync_header(&mut self) {
        self.header.node_count = self.nodes.len() as u32;
        self.header.directededge_count = self.directededges.len() as u32;
        self.header.sign_count = self.signs.len() as u32;
        self.header.admin_count = self.admins.len() as u32;
        self.header.transit_stop_count = self.transit_stops.len() as u32;
        self.header.transit_route_count = self.transit_routes.len() as u32;
        self.header.transit_departure_count = self.transit_departures.len() as u32;
    }

    /// Rebuild the interning indexes after a read, so a reopened tile can
    /// keep adding names and edge info.
    fn rebuild_indexes(&mut self) {
        self.name_index = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.clone(), i as u32))
            .collect();
        // Edge-info keys are only meaningful during one emission; reopened
        // tiles append fresh records keyed from a high range.
        self.edgeinfo_index.clear();
    }

    /// Serialize and write to `<tile_dir>/<level>/<tileid>.gph`. Returns the
    /// number of bytes written.
    pub fn write(&mut self, tile_dir: &Path) -> Result<u64> {
        self.sync_header();
        let id = self.header.graphid;
        let path = tile_path(tile_dir, id.level(), id.tile());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let body = bincode::serialize(self)
            .with_context(|| format!("failed to serialize tile {}", id))?;

        let mut out = Vec::with_capacity(body.len() + 18);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(body.len() as u64).to_le_bytes());
        out.extend_from_slice(&body);
        let footer = crc::checksum(&out);
        out.extend_from_slice(&footer.to_le_bytes());

        let mut file = File::create(&path).map_err(|e| FatalError::TileIo {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        file.write_all(&out)?;
        Ok(out.len() as u64)
    }

    pub fn read_path(path: &Path) -> Result<GraphTile> {
        let mut file = File::open(path).map_err(|e| FatalError::TileIo {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if data.len() < 22 {
            bail!("tile file {} is truncated", path.display());
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != MAGIC {
            bail!("tile file {} has bad magic", path.display());
        }
        let version = u16::from_le_bytes(data[4..6].try_into().unwrap());
        if version != VERSION {
            bail!(
                "tile file {} has version {} (expected {})",
                path.display(),
                version,
                VERSION
            );
        }
        let body_len = u64::from_le_bytes(data[6..14].try_into().unwrap()) as usize;
        if data.len() != 14 + body_len + 8 {
            bail!("tile file {} has inconsistent length", path.display());
        }
        let stored = u64::from_le_bytes(data[14 + body_len..].try_into().unwrap());
        let computed = crc::checksum(&data[..14 + body_len]);
        if stored != computed {
            bail!(
                "tile file {} CRC mismatch: stored {:016x}, computed {:016x}",
                path.display(),
                stored,
                computed
            );
        }

        let mut tile: GraphTile = bincode::deserialize(&data[14..14 + body_len])
            .with_context(|| format!("failed to deserialize tile {}", path.display()))?;
        tile.rebuild_indexes();
        Ok(tile)
    }

    pub fn read(tile_dir: &Path, id: GraphId) -> Result<GraphTile> {
        Self::read_path(&tile_path(tile_dir, id.level(), id.tile()))
    }

    pub fn file_path(&self, tile_dir: &Path) -> PathBuf {
        let id = self.header.graphid;
        tile_path(tile_dir, id.level(), id.tile())
    }
}
