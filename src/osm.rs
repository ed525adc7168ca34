//! The in-memory OSM model: typed way and node records produced by ingest,
//! plus the enums and access masks shared with the tile format.

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::FatalError;
use crate::geo::LatLng;
use crate::graphid::GraphId;
use crate::transform::TagMap;

/// Road classification, ordered by importance (lower = more important).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum RoadClass {
    Motorway = 0,
    Trunk = 1,
    Primary = 2,
    Secondary = 3,
    TertiaryUnclassified = 4,
    Residential = 5,
    Service = 6,
    Track = 7,
    #[default]
    Other = 8,
}

impl RoadClass {
    pub fn from_u8(v: u8) -> RoadClass {
        match v {
            0 => RoadClass::Motorway,
            1 => RoadClass::Trunk,
            2 => RoadClass::Primary,
            3 => RoadClass::Secondary,
            4 => RoadClass::TertiaryUnclassified,
            5 => RoadClass::Residential,
            6 => RoadClass::Service,
            7 => RoadClass::Track,
            _ => RoadClass::Other,
        }
    }

    pub fn importance(&self) -> u8 {
        *self as u8
    }

    pub const ALL: [RoadClass; 9] = [
        RoadClass::Motorway,
        RoadClass::Trunk,
        RoadClass::Primary,
        RoadClass::Secondary,
        RoadClass::TertiaryUnclassified,
        RoadClass::Residential,
        RoadClass::Service,
        RoadClass::Track,
        RoadClass::Other,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RoadClass::Motorway => "motorway",
            RoadClass::Trunk => "trunk",
            RoadClass::Primary => "primary",
            RoadClass::Secondary => "secondary",
            RoadClass::TertiaryUnclassified => "tertiary_unclassified",
            RoadClass::Residential => "residential",
            RoadClass::Service => "service",
            RoadClass::Track => "track",
            RoadClass::Other => "other",
        }
    }
}

/// Specialized use of a way or edge. Values at `Rail` and above only occur
/// on transit-spliced edges.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum EdgeUse {
    #[default]
    None = 0,
    Cycleway = 1,
    Footway = 2,
    Driveway = 3,
    Alley = 4,
    ParkingAisle = 5,
    EmergencyAccess = 6,
    DriveThru = 7,
    Steps = 8,
    Other = 9,
    Ferry = 10,
    RailFerry = 11,
    Rail = 12,
    Bus = 13,
    TransitConnection = 14,
}

impl EdgeUse {
    pub fn from_u8(v: u8) -> EdgeUse {
        match v {
            1 => EdgeUse::Cycleway,
            2 => EdgeUse::Footway,
            3 => EdgeUse::Driveway,
            4 => EdgeUse::Alley,
            5 => EdgeUse::ParkingAisle,
            6 => EdgeUse::EmergencyAccess,
            7 => EdgeUse::DriveThru,
            8 => EdgeUse::Steps,
            9 => EdgeUse::Other,
            10 => EdgeUse::Ferry,
            11 => EdgeUse::RailFerry,
            12 => EdgeUse::Rail,
            13 => EdgeUse::Bus,
            14 => EdgeUse::TransitConnection,
            _ => EdgeUse::None,
        }
    }

    /// Transit uses have no opposing road edge requirement.
    pub fn is_transit(&self) -> bool {
        *self >= EdgeUse::Rail
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum CycleLane {
    #[default]
    None = 0,
    Shared = 1,
    Dedicated = 2,
    Separated = 3,
}

impl CycleLane {
    pub fn from_u8(v: u8) -> CycleLane {
        match v {
            1 => CycleLane::Shared,
            2 => CycleLane::Dedicated,
            3 => CycleLane::Separated,
            _ => CycleLane::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum NodeType {
    #[default]
    Ordinary = 0,
    MultiUseTransitStop = 1,
    ParentStation = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[repr(u8)]
pub enum SpeedType {
    /// Speed came from an explicit maxspeed tag.
    Tagged = 0,
    /// Speed was assigned from the road classification default.
    #[default]
    Classified = 1,
}

/// Travel mode access bits, shared between way flags, node modes masks and
/// directed-edge access masks.
pub mod access {
    pub const AUTO: u16 = 1;
    pub const PEDESTRIAN: u16 = 2;
    pub const BICYCLE: u16 = 4;
    pub const TRUCK: u16 = 8;
    pub const EMERGENCY: u16 = 16;
    pub const BUS: u16 = 32;
    pub const HOV: u16 = 64;
    pub const ALL: u16 = AUTO | PEDESTRIAN | BICYCLE | TRUCK | EMERGENCY | BUS | HOV;
}

/// Truck restriction bits carried on directed edges.
pub mod restriction {
    pub const HEIGHT: u32 = 1;
    pub const WIDTH: u32 = 2;
    pub const LENGTH: u32 = 4;
    pub const WEIGHT: u32 = 8;
    pub const AXLE_LOAD: u32 = 16;
    pub const HAZMAT: u32 = 32;
}

fn tag_bool(tags: &TagMap, key: &str) -> bool {
    tags.get(key).map(|v| v == "true").unwrap_or(false)
}

fn tag_num<T: std::str::FromStr>(tags: &TagMap, key: &str) -> Result<Option<T>> {
    match tags.get(key) {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| FatalError::Transform(format!("unparseable value {:?} for {}", v, key)).into()),
    }
}

fn tag_string(tags: &TagMap, key: &str) -> String {
    tags.get(key).cloned().unwrap_or_default()
}

/// A routable way, immutable once pass 1 completes.
#[derive(Debug, Clone, Default)]
pub struct OsmWay {
    pub osm_id: u64,
    pub nodes: Vec<u64>,

    pub road_class: RoadClass,
    pub use_: EdgeUse,
    pub speed: u8,
    pub truck_speed: u8,

    pub auto_forward: bool,
    pub auto_backward: bool,
    pub truck_forward: bool,
    pub truck_backward: bool,
    pub bus_forward: bool,
    pub bus_backward: bool,
    pub bike_forward: bool,
    pub bike_backward: bool,
    pub emergency_forward: bool,
    pub emergency_backward: bool,
    pub hov_forward: bool,
    pub hov_backward: bool,
    pub pedestrian: bool,

    pub destination_only: bool,
    pub no_thru_traffic: bool,
    pub oneway: bool,
    pub roundabout: bool,
    pub link: bool,
    pub ferry: bool,
    pub rail: bool,
    pub toll: bool,
    pub tunnel: bool,
    pub bridge: bool,
    pub unpaved: bool,
    pub truck_route: bool,
    pub restrictions: u32,

    pub cyclelane: CycleLane,
    pub bike_network: u8,
    pub lanes: u8,

    pub name: String,
    pub name_en: String,
    pub alt_name: String,
    pub official_name: String,
    pub ref_: String,
    pub int_ref: String,
    pub bike_national_ref: String,
    pub bike_regional_ref: String,
    pub bike_local_ref: String,
    pub destination: String,
    pub destination_ref: String,
    pub destination_ref_to: String,
    pub junction_ref: String,

    /// Whether the speed came from an explicit tag rather than the
    /// class default.
    pub tagged_speed: bool,
}

impl OsmWay {
    /// Build a way from the normalised tag map the transform produced.
    /// Returns the way; the caller is responsible for bitset marking. An
    /// unparseable numeric value is a transform failure, which is fatal.
    pub fn from_tags(osm_id: u64, nodes: Vec<u64>, tags: &TagMap) -> Result<OsmWay> {
        let mut w = OsmWay {
            osm_id,
            nodes,
            ..Default::default()
        };

        if let Some(rc) = tag_num::<u8>(tags, "road_class")? {
            w.road_class = RoadClass::from_u8(rc);
        }
        if let Some(u) = tag_num::<u8>(tags, "use")? {
            w.use_ = EdgeUse::from_u8(u);
        }

        w.auto_forward = tag_bool(tags, "auto_forward");
        w.auto_backward = tag_bool(tags, "auto_backward");
        w.bike_forward = tag_bool(tags, "bike_forward");
        w.bike_backward = tag_bool(tags, "bike_backward");
        w.pedestrian = tag_bool(tags, "pedestrian");

        // Truck and bus follow auto unless the transform refines them.
        w.truck_forward = tags
            .get("truck_forward")
            .map(|v| v == "true")
            .unwrap_or(w.auto_forward);
        w.truck_backward = tags
            .get("truck_backward")
            .map(|v| v == "true")
            .unwrap_or(w.auto_backward);
        w.bus_forward = tags
            .get("bus_forward")
            .map(|v| v == "true")
            .unwrap_or(w.auto_forward);
        w.bus_backward = tags
            .get("bus_backward")
            .map(|v| v == "true")
            .unwrap_or(w.auto_backward);
        w.emergency_forward = tag_bool(tags, "emergency_forward");
        w.emergency_backward = tag_bool(tags, "emergency_backward");
        w.hov_forward = tag_bool(tags, "hov_forward");
        w.hov_backward = tag_bool(tags, "hov_backward");

        w.destination_only = tag_bool(tags, "private");
        w.no_thru_traffic = tag_bool(tags, "no_thru_traffic");
        w.oneway = tag_bool(tags, "oneway");
        w.roundabout = tag_bool(tags, "roundabout");
        w.link = tag_bool(tags, "link");
        w.ferry = tag_bool(tags, "ferry");
        w.rail = tag_bool(tags, "rail");
        w.toll = tag_bool(tags, "toll");
        w.tunnel = tag_bool(tags, "tunnel");
        w.bridge = tag_bool(tags, "bridge");
        w.unpaved = tag_bool(tags, "surface");
        w.truck_route = tag_bool(tags, "truck_route");

        if tag_bool(tags, "hazmat") {
            w.restrictions |= restriction::HAZMAT;
        }
        if tags.contains_key("maxheight") {
            w.restrictions |= restriction::HEIGHT;
        }
        if tags.contains_key("maxwidth") {
            w.restrictions |= restriction::WIDTH;
        }
        if tags.contains_key("maxlength") {
            w.restrictions |= restriction::LENGTH;
        }
        if tags.contains_key("maxweight") {
            w.restrictions |= restriction::WEIGHT;
        }
        if tags.contains_key("maxaxleload") {
            w.restrictions |= restriction::AXLE_LOAD;
        }

        if let Some(speed) = tag_num::<f64>(tags, "speed")? {
            w.speed = speed.round().clamp(0.0, 255.0) as u8;
            w.tagged_speed = true;
        }
        if let Some(ts) = tag_num::<f64>(tags, "truck_speed")? {
            w.truck_speed = ts.round().clamp(0.0, 255.0) as u8;
        }
        if let Some(cl) = tag_num::<u8>(tags, "cycle_lane")? {
            w.cyclelane = CycleLane::from_u8(cl);
        }
        if let Some(mask) = tag_num::<u8>(tags, "bike_network_mask")? {
            w.bike_network = mask;
        }
        if let Some(lanes) = tag_num::<u8>(tags, "lanes")? {
            w.lanes = lanes;
        }

        w.name = tag_string(tags, "name");
        w.name_en = tag_string(tags, "name:en");
        w.alt_name = tag_string(tags, "alt_name");
        w.official_name = tag_string(tags, "official_name");
        w.ref_ = tag_string(tags, "ref");
        w.int_ref = tag_string(tags, "int_ref");
        w.bike_national_ref = tag_string(tags, "bike_national_ref");
        w.bike_regional_ref = tag_string(tags, "bike_regional_ref");
        w.bike_local_ref = tag_string(tags, "bike_local_ref");
        w.destination = tag_string(tags, "destination");
        w.destination_ref = tag_string(tags, "destination:ref");
        w.destination_ref_to = tag_string(tags, "destination:ref:to");
        w.junction_ref = tag_string(tags, "junction_ref");

        Ok(w)
    }

    /// Assign the class-default speed when no maxspeed tag was present.
    pub fn apply_default_speed(&mut self, tags: &TagMap) -> Result<bool> {
        if self.tagged_speed {
            return Ok(false);
        }
        if let Some(default) = tag_num::<f64>(tags, "default_speed")? {
            self.speed = default.round().clamp(0.0, 255.0) as u8;
        }
        Ok(true)
    }

    /// Name strings in the order they go into the edge-info blob.
    pub fn names(&self) -> Vec<String> {
        let mut out = Vec::new();
        for s in [&self.ref_, &self.name, &self.alt_name, &self.official_name, &self.name_en] {
            if !s.is_empty() {
                out.push(s.clone());
            }
        }
        out
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// A graph-relevant node, built in pass 2.
#[derive(Debug, Clone)]
pub struct OsmNode {
    pub ll: LatLng,
    pub exit_to: bool,
    pub ref_: bool,
    pub gate: bool,
    pub bollard: bool,
    pub traffic_signal: bool,
    pub modes_mask: u16,
    pub graphid: GraphId,
    /// Outbound edge indices, sorted by driveability/importance after
    /// splicing.
    pub edges: Vec<u32>,
}

impl OsmNode {
    pub fn new(ll: LatLng) -> Self {
        Self {
            ll,
            exit_to: false,
            ref_: false,
            gate: false,
            bollard: false,
            traffic_signal: false,
            modes_mask: access::ALL,
            graphid: GraphId::INVALID,
            edges: Vec::new(),
        }
    }

    pub fn add_edge(&mut self, edge_index: u32) {
        self.edges.push(edge_index);
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

/// Exit-to and ref strings captured during pass 2, keyed by OSM id, used
/// when building the sign table.
#[derive(Debug, Default)]
pub struct NodeStrings {
    pub exit_to: HashMap<u64, String>,
    pub refs: HashMap<u64, String>,
}
