//! Transit splicing: reads per-tile schedule documents and stitches stops,
//! connection edges, transit lines and departures into the emitted road
//! tiles.
//!
//! Two passes. The first walks every schedule document, admits the stops
//! inside the tile and assigns each a graph id after the tile's existing
//! nodes. The second runs tile ranges in parallel: it snaps each stop to the
//! closest point on its hinted way, rebuilds the tile's node and edge arrays
//! with the connection edges inserted, appends the stop nodes with their
//! connection/intra-station/line edges, and records the departures table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::config::Config;
use crate::formats::{
    DirectedEdgeRecord, GraphTile, NodeRecord, TransitDepartureRecord, TransitRouteRecord,
    TransitStopRecord,
};
use crate::geo::{closest_point, haversine_distance, polyline_length, LatLng};
use crate::graphid::GraphId;
use crate::osm::{access, EdgeUse, NodeType, RoadClass};
use crate::servicedays::{
    add_service_day, days_from_pivot, get_service_days, parse_date, remove_service_day,
    seconds_from_midnight,
};
use crate::tiles::{tile_exists, TileGrid};
use crate::timezones;

/// Speed assigned to connection and line edges, kph.
const TRANSIT_EDGE_SPEED: u8 = 5;

#[derive(Debug, Deserialize, Default)]
struct TransitTileJson {
    #[serde(default)]
    stops: Vec<StopJson>,
    #[serde(default)]
    schedule_stop_pairs: Vec<StopPairJson>,
    #[serde(default)]
    routes: Vec<RouteJson>,
}

#[derive(Debug, Deserialize)]
struct GeometryJson {
    /// GeoJSON order: [lng, lat].
    coordinates: [f64; 2],
}

#[derive(Debug, Deserialize, Default)]
struct StopTagsJson {
    #[serde(default)]
    onestop_id: Option<String>,
    #[serde(default)]
    stop_desc: Option<String>,
    #[serde(default)]
    osm_way_id: Option<u64>,
    #[serde(default)]
    wheelchair_boarding: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct StopJson {
    #[serde(default)]
    key: u32,
    #[serde(default)]
    name: Option<String>,
    geometry: GeometryJson,
    #[serde(default)]
    timezone: Option<String>,
    #[serde(default)]
    tags: Option<StopTagsJson>,
    #[serde(default, rename = "type")]
    type_: u32,
    #[serde(default)]
    parent: u32,
}

#[derive(Debug, Deserialize)]
struct StopPairJson {
    origin_key: Option<u32>,
    destination_key: Option<u32>,
    #[serde(default)]
    route_key: u32,
    #[serde(default)]
    trip_key: u32,
    #[serde(default)]
    block_key: u32,
    #[serde(default)]
    origin_departure_time: Option<String>,
    #[serde(default)]
    destination_arrival_time: Option<String>,
    #[serde(default)]
    service_start_date: Option<String>,
    #[serde(default)]
    service_end_date: Option<String>,
    #[serde(default)]
    service_days_of_week: Vec<bool>,
    #[serde(default)]
    service_except_dates: Vec<String>,
    #[serde(default)]
    service_added_dates: Vec<String>,
    #[serde(default)]
    trip_headsign: Option<String>,
    #[serde(default)]
    bikes_allowed: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RouteTagsJson {
    #[serde(default)]
    route_long_name: Option<String>,
    #[serde(default)]
    route_desc: Option<String>,
    #[serde(default)]
    vehicle_type: Option<String>,
    #[serde(default)]
    route_color: Option<String>,
    #[serde(default)]
    route_text_color: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RouteJson {
    #[serde(default)]
    key: u32,
    #[serde(default)]
    onestop_id: Option<String>,
    #[serde(default)]
    operated_by_onestop_id: Option<String>,
    #[serde(default)]
    operated_by_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    tags: Option<RouteTagsJson>,
}

#[derive(Debug, Clone)]
pub struct Stop {
    pub graphid: GraphId,
    pub way_id: u64,
    pub key: u32,
    pub type_: u32,
    pub parent: u32,
    pub conn_count: u32,
    pub wheelchair: bool,
    pub timezone: u16,
    pub ll: LatLng,
    pub onestop_id: String,
    pub name: String,
    pub desc: String,
}

#[derive(Debug, Clone)]
struct Departure {
    days: u64,
    dest_stop: u32,
    trip: u32,
    route: u32,
    block: u32,
    dep_time: u32,
    arr_time: u32,
    start_date: u32,
    end_date: u32,
    dow: u8,
    headsign: String,
}

#[derive(Debug, Clone, Copy)]
struct TransitLine {
    line_id: u32,
    route_key: u32,
    dest_stop_key: u32,
}

#[derive(Debug, Default)]
struct StopEdges {
    stop_key: u32,
    intrastation: Vec<u32>,
    lines: Vec<TransitLine>,
}

#[derive(Debug, Clone)]
struct OsmConnectionEdge {
    osm_node: GraphId,
    stop_node: GraphId,
    stop_key: u32,
    length: f32,
    /// Walked from the OSM node to the stop.
    shape: Vec<LatLng>,
}

#[derive(Debug, Clone)]
struct RouteInfo {
    key: u32,
    route_type: u8,
    onestop_id: String,
    operated_by_onestop_id: String,
    operated_by_name: String,
    short_name: String,
    long_name: String,
    desc: String,
    color: u32,
    text_color: u32,
}

fn vehicle_type(name: &str) -> Option<u8> {
    match name {
        "tram" => Some(0),
        "metro" => Some(1),
        "rail" => Some(2),
        "bus" => Some(3),
        "ferry" => Some(4),
        "cablecar" => Some(5),
        "gondola" => Some(6),
        "funicular" => Some(7),
        _ => None,
    }
}

/// Edge use for a line of the given route type: buses stay buses, rail and
/// everything cable-drawn routes as rail.
fn transit_use(route_type: u8) -> EdgeUse {
    match route_type {
        3 => EdgeUse::Bus,
        _ => EdgeUse::Rail,
    }
}

fn null_blank(s: Option<String>) -> String {
    match s {
        Some(v) if v != "null" => v,
        _ => String::new(),
    }
}

fn parse_color(s: Option<String>, default: u32) -> u32 {
    let v = null_blank(s);
    if v.is_empty() {
        return default;
    }
    u32::from_str_radix(v.trim(), 16).unwrap_or(default)
}

fn read_schedule(path: &Path) -> Result<TransitTileJson> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schedule {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("malformed schedule json {}", path.display()))
}

/// Pass 1: admit the stops of one schedule document and assign graph ids
/// after the tile's existing nodes.
fn collect_stops(
    doc: &TransitTileJson,
    tile_index: u32,
    level: u8,
    node_count: u32,
    grid: &TileGrid,
) -> Vec<Stop> {
    let bounds = grid.bounds(tile_index);
    let mut stops = Vec::new();
    for s in &doc.stops {
        let ll = LatLng::new(s.geometry.coordinates[1], s.geometry.coordinates[0]);
        if !bounds.contains(ll) {
            log::error!("stop {} is outside its tile {}", s.key, tile_index);
        }
        if s.key == 0 {
            log::error!(
                "key missing for stop ({}) in tile {}",
                s.name.as_deref().unwrap_or("None"),
                tile_index
            );
            continue;
        }

        let tags = s.tags.as_ref();
        let timezone = match &s.timezone {
            Some(name) => match timezones::region_index(name) {
                Some(idx) => idx,
                None => {
                    log::warn!("timezone not found for {}", name);
                    0
                }
            },
            None => {
                log::warn!("timezone not found for stop {}", s.key);
                0
            }
        };

        stops.push(Stop {
            graphid: GraphId::new(tile_index, level, node_count + stops.len() as u32),
            way_id: tags.and_then(|t| t.osm_way_id).unwrap_or(0),
            key: s.key,
            type_: s.type_,
            parent: s.parent,
            conn_count: 0,
            wheelchair: tags.and_then(|t| t.wheelchair_boarding).unwrap_or(false),
            timezone,
            ll,
            onestop_id: null_blank(tags.and_then(|t| t.onestop_id.clone())),
            name: null_blank(s.name.clone()),
            desc: null_blank(tags.and_then(|t| t.stop_desc.clone())),
        });
    }
    stops
}

/// Scheduled departures keyed by origin stop, plus per-stop bicycle access.
fn process_stop_pairs(
    doc: &TransitTileJson,
    route_types: &HashMap<u32, u8>,
    anchor: NaiveDate,
) -> (BTreeMap<u32, Vec<Departure>>, HashMap<u32, bool>) {
    let mut departures: BTreeMap<u32, Vec<Departure>> = BTreeMap::new();
    let mut stop_access: HashMap<u32, bool> = HashMap::new();

    for pair in &doc.schedule_stop_pairs {
        let (Some(orig), Some(dest)) = (pair.origin_key, pair.destination_key) else {
            log::error!("schedule pair missing origin_key or destination_key");
            continue;
        };
        if pair.trip_key == 0 {
            log::error!("trip does not exist for route {}", pair.route_key);
            continue;
        }
        if pair.route_key == 0 {
            log::error!("route does not exist for trip {}", pair.trip_key);
            continue;
        }
        if !route_types.contains_key(&pair.route_key) {
            log::warn!(
                "dropping departure on route {} (unsupported or missing route)",
                pair.route_key
            );
            continue;
        }

        let (Some(dep_str), Some(arr_str)) = (
            pair.origin_departure_time.as_deref(),
            pair.destination_arrival_time.as_deref(),
        ) else {
            continue;
        };
        let (Some(dep_time), Some(arr_time)) = (
            seconds_from_midnight(dep_str),
            seconds_from_midnight(arr_str),
        ) else {
            log::error!("unparseable departure times {} / {}", dep_str, arr_str);
            continue;
        };

        let (Some(start), Some(end)) = (
            pair.service_start_date.as_deref().and_then(parse_date),
            pair.service_end_date.as_deref().and_then(parse_date),
        ) else {
            log::error!("unparseable service dates for trip {}", pair.trip_key);
            continue;
        };

        let mut dow_mask = 0u8;
        for (i, &on) in pair.service_days_of_week.iter().take(7).enumerate() {
            if on {
                dow_mask |= 1 << i;
            }
        }

        let mut days = get_service_days(anchor, start, end, dow_mask);
        for d in pair.service_except_dates.iter().filter_map(|d| parse_date(d)) {
            days = remove_service_day(days, anchor, start, end, d);
        }
        for d in pair.service_added_dates.iter().filter_map(|d| parse_date(d)) {
            days = add_service_day(days, anchor, start, end, d);
        }

        let bikes = pair.bikes_allowed.as_deref() == Some("1");
        *stop_access.entry(orig).or_insert(false) |= bikes;
        *stop_access.entry(dest).or_insert(false) |= bikes;

        departures.entry(orig).or_default().push(Departure {
            days,
            dest_stop: dest,
            trip: pair.trip_key,
            route: pair.route_key,
            block: pair.block_key,
            dep_time,
            arr_time,
            start_date: days_from_pivot(start),
            end_date: days_from_pivot(end),
            dow: dow_mask,
            headsign: null_blank(pair.trip_headsign.clone()),
        });
    }

    (departures, stop_access)
}

/// Parse the document's routes, dropping unsupported vehicle types.
fn parse_routes(doc: &TransitTileJson) -> HashMap<u32, RouteInfo> {
    let mut routes = HashMap::new();
    for r in &doc.routes {
        if r.key == 0 {
            log::error!("route key missing in schedule document");
            continue;
        }
        let tags = r.tags.as_ref();
        let vt = null_blank(tags.and_then(|t| t.vehicle_type.clone()));
        let Some(route_type) = vehicle_type(&vt) else {
            log::warn!("unsupported vehicle_type: {}", vt);
            continue;
        };
        routes.insert(
            r.key,
            RouteInfo {
                key: r.key,
                route_type,
                onestop_id: null_blank(r.onestop_id.clone()),
                operated_by_onestop_id: null_blank(r.operated_by_onestop_id.clone()),
                operated_by_name: null_blank(r.operated_by_name.clone()),
                short_name: null_blank(r.name.clone()),
                long_name: null_blank(tags.and_then(|t| t.route_long_name.clone())),
                desc: null_blank(tags.and_then(|t| t.route_desc.clone())),
                color: parse_color(tags.and_then(|t| t.route_color.clone()), 0xFFFFFF),
                text_color: parse_color(tags.and_then(|t| t.route_text_color.clone()), 0x000000),
            },
        );
    }
    routes
}

/// Snap a stop to the closest point on the road edge matching its way-id
/// hint, producing up to two connection edges (one per edge endpoint in the
/// stop's tile).
fn add_osm_connection(
    stop: &mut Stop,
    tile: &GraphTile,
    connection_edges: &mut Vec<OsmConnectionEdge>,
) {
    let mut min_dist = f64::MAX;
    let mut start_node = GraphId::INVALID;
    let mut end_node = GraphId::INVALID;
    let mut closest: Option<(LatLng, f64, usize)> = None;
    let mut closest_shape: Vec<LatLng> = Vec::new();
    let mut edge_length = 0f32;

    for node_index in 0..tile.nodes.len() as u32 {
        let node = tile.node(node_index);
        for j in 0..node.edge_count {
            let de = tile.directededge(node.edge_index + j);
            let info = tile.edge_info(de.edge_info_offset);
            if info.way_id != stop.way_id {
                continue;
            }
            let mut shape = info.shape.clone();
            // Walk the shape in this edge's direction of travel.
            if !de.forward {
                shape.reverse();
            }
            let Some(this_closest) = closest_point(stop.ll, &shape) else {
                continue;
            };
            if this_closest.1 < min_dist {
                min_dist = this_closest.1;
                start_node = tile.graphid().with_index(node_index);
                end_node = de.end_node;
                closest = Some(this_closest);
                closest_shape = shape;
                edge_length = de.length;
            }
        }
    }

    if !start_node.is_valid() && !end_node.is_valid() {
        stop.conn_count = 0;
        log::error!(
            "no closest edge found for stop {} (way id {})",
            stop.key,
            stop.way_id
        );
        return;
    }
    let (closest_ll, _, closest_index) = closest.unwrap();

    stop.conn_count = 0;
    let mut length = 0f64;
    if stop.graphid.tile_base() == start_node.tile_base() {
        // Shape from the start node along the edge to the closest point,
        // then straight to the stop.
        let mut shape: Vec<LatLng> = closest_shape[..=closest_index].to_vec();
        shape.push(closest_ll);
        shape.push(stop.ll);
        length = polyline_length(&shape).max(1.0);
        connection_edges.push(OsmConnectionEdge {
            osm_node: start_node,
            stop_node: stop.graphid,
            stop_key: stop.key,
            length: length as f32,
            shape,
        });
        stop.conn_count += 1;
    }

    let mut length2 = 0f64;
    if stop.graphid.tile_base() == end_node.tile_base() && start_node.tile() == end_node.tile() {
        // Mirrored: from the far end backwards to the closest point.
        let mut shape: Vec<LatLng> = closest_shape[closest_index + 1..].to_vec();
        shape.reverse();
        shape.push(closest_ll);
        shape.push(stop.ll);
        length2 = polyline_length(&shape).max(1.0);
        connection_edges.push(OsmConnectionEdge {
            osm_node: end_node,
            stop_node: stop.graphid,
            stop_key: stop.key,
            length: length2 as f32,
            shape,
        });
        stop.conn_count += 1;
    }

    if length != 0.0 && length2 != 0.0 && (length + length2) < (edge_length as f64) - 1.0 {
        log::error!(
            "edge length {} exceeds connection lengths {} + {} at stop {}",
            edge_length,
            length,
            length2,
            stop.key
        );
    }
    if stop.conn_count == 0 {
        log::error!(
            "stop {} has no connection to the road network (tile {}, start {}, end {})",
            stop.key,
            stop.graphid.tile(),
            start_node,
            end_node
        );
    }
}

fn transit_connection_edge(end_node: GraphId, length: f32, local_index: u32) -> DirectedEdgeRecord {
    DirectedEdgeRecord {
        end_node,
        length,
        use_: EdgeUse::TransitConnection,
        speed: TRANSIT_EDGE_SPEED,
        class: RoadClass::Service,
        local_edge_index: local_index,
        forward_access: access::PEDESTRIAN,
        reverse_access: access::PEDESTRIAN,
        ..Default::default()
    }
}

/// Rebuild the tile's node/edge arrays with connection edges inserted at
/// their OSM nodes, then append the stop nodes with all of their edges.
#[allow(clippy::too_many_arguments)]
fn add_to_graph(
    tile: &mut GraphTile,
    stop_edge_map: &BTreeMap<GraphId, StopEdges>,
    stops_by_key: &HashMap<u32, Stop>,
    global_stops: &HashMap<u32, (GraphId, LatLng)>,
    stop_access: &HashMap<u32, bool>,
    connection_edges: &[OsmConnectionEdge],
    route_types: &HashMap<u32, u8>,
) {
    let current_nodes = std::mem::take(&mut tile.nodes);
    let current_edges = std::mem::take(&mut tile.directededges);

    // Shared edge info between the two directions of a connection/line.
    let mut info_offsets: HashMap<(u64, u64, u32), u32> = HashMap::new();
    let mut info_key = u32::MAX as u64; // above any road edge key
    let mut shared_info = |tile: &mut GraphTile,
                           a: GraphId,
                           b: GraphId,
                           route: u32,
                           shape: &[LatLng]|
     -> (u32, bool) {
        let key = if a.value() < b.value() {
            (a.value(), b.value(), route)
        } else {
            (b.value(), a.value(), route)
        };
        if let Some(&off) = info_offsets.get(&key) {
            return (off, false);
        }
        info_key += 1;
        let off = tile.add_edge_info(info_key, 0, shape, &[]);
        info_offsets.insert(key, off);
        (off, true)
    };

    // Copy existing nodes and edges, inserting OSM->stop connections at
    // their owning node and remapping edge indices as we go.
    let mut index_map: HashMap<u32, u32> = HashMap::new();
    let mut added_edges = 0usize;
    for (node_id, mut node) in current_nodes.into_iter().enumerate() {
        let new_edge_index = tile.directededges.len() as u32;
        for idx in node.edge_index..node.edge_index + node.edge_count {
            index_map.insert(idx, tile.directededges.len() as u32);
            tile.directededges.push(current_edges[idx as usize].clone());
        }

        while added_edges < connection_edges.len()
            && connection_edges[added_edges].osm_node.index() == node_id as u32
        {
            let conn = &connection_edges[added_edges];
            let local = tile.directededges.len() as u32 - new_edge_index;
            let mut de = transit_connection_edge(conn.stop_node, conn.length, local);
            let (off, added) = shared_info(tile, conn.osm_node, conn.stop_node, 0, &conn.shape);
            de.edge_info_offset = off;
            de.forward = added;
            tile.directededges.push(de);
            added_edges += 1;
        }

        node.edge_index = new_edge_index;
        node.edge_count = tile.directededges.len() as u32 - new_edge_index;
        tile.nodes.push(node);
    }
    if added_edges != connection_edges.len() {
        log::error!(
            "inserted {} of {} connection edges",
            added_edges,
            connection_edges.len()
        );
    }
    for sign in &mut tile.signs {
        if let Some(&new_index) = index_map.get(&sign.edge_index) {
            sign.edge_index = new_index;
        }
    }

    // Append the stop nodes in graph-id order.
    for (graphid, stop_edges) in stop_edge_map {
        let stop = &stops_by_key[&stop_edges.stop_key];
        debug_assert_eq!(*graphid, stop.graphid);

        let mut node_access = access::PEDESTRIAN;
        if stop_access.get(&stop.key).copied().unwrap_or(false) {
            node_access |= access::BICYCLE;
        }
        let parent = stop.type_ == 1;
        let mut node = NodeRecord {
            ll: stop.ll,
            edge_index: tile.directededges.len() as u32,
            edge_count: 0,
            best_class: RoadClass::Service,
            node_type: if parent {
                NodeType::ParentStation
            } else {
                NodeType::MultiUseTransitStop
            },
            access: node_access,
            timezone: stop.timezone,
            stop_id: stop.key,
            mode_change: true,
            parent,
            child: stop.parent != 0,
            ..Default::default()
        };

        // Stop -> OSM connections, mirroring the inserted edges.
        for conn in connection_edges.iter().filter(|c| c.stop_key == stop.key) {
            let local = tile.directededges.len() as u32 - node.edge_index;
            let mut de = transit_connection_edge(conn.osm_node, conn.length, local);
            let (off, added) = shared_info(tile, conn.stop_node, conn.osm_node, 0, &conn.shape);
            de.edge_info_offset = off;
            de.forward = added;
            tile.directededges.push(de);
        }

        // Intra-station connections to parents/children.
        for &end_key in &stop_edges.intrastation {
            let Some(&(end_gid, end_ll)) = global_stops.get(&end_key) else {
                log::error!("intrastation end stop {} unknown", end_key);
                continue;
            };
            let length = haversine_distance(stop.ll, end_ll).max(1.0) as f32;
            let local = tile.directededges.len() as u32 - node.edge_index;
            let mut de = transit_connection_edge(end_gid, length, local);
            let shape = [stop.ll, end_ll];
            let (off, added) = shared_info(tile, stop.graphid, end_gid, 0, &shape);
            de.edge_info_offset = off;
            de.forward = added;
            tile.directededges.push(de);
        }

        // Transit line edges, one per unique (route, destination stop).
        for line in &stop_edges.lines {
            let Some(&(end_gid, end_ll)) = global_stops.get(&line.dest_stop_key) else {
                log::error!("line {} destination stop {} unknown", line.line_id, line.dest_stop_key);
                continue;
            };
            let Some(&route_type) = route_types.get(&line.route_key) else {
                continue;
            };
            let local = tile.directededges.len() as u32 - node.edge_index;
            let mut de = transit_connection_edge(end_gid, haversine_distance(stop.ll, end_ll) as f32, local);
            de.use_ = transit_use(route_type);
            de.line_id = line.line_id;
            let shape = [stop.ll, end_ll];
            let (off, added) = shared_info(tile, stop.graphid, end_gid, line.route_key, &shape);
            de.edge_info_offset = off;
            de.forward = added;
            tile.directededges.push(de);
        }

        node.edge_count = tile.directededges.len() as u32 - node.edge_index;
        if node.edge_count == 0 {
            log::error!("no directed edges from stop {}", stop.key);
        }
        tile.nodes.push(node);
    }
}

/// Splice one tile: connections, departures, routes, graph extension.
#[allow(clippy::too_many_arguments)]
fn build_tile_transit(
    tile_dir: &Path,
    tile_index: u32,
    level: u8,
    schedule_path: &Path,
    stops: &mut [Stop],
    global_stops: &HashMap<u32, (GraphId, LatLng)>,
    anchor: NaiveDate,
    io_lock: &Mutex<()>,
) -> Result<u32> {
    let tile_id = GraphId::new(tile_index, level, 0);
    let mut tile = {
        let _guard = io_lock.lock().unwrap();
        GraphTile::read(tile_dir, tile_id)?
    };
    let doc = match read_schedule(schedule_path) {
        Ok(doc) => doc,
        Err(e) => {
            log::error!("{:#}; skipping tile {}", e, tile_index);
            return Ok(0);
        }
    };

    // Snap stops to the road network.
    let mut connection_edges: Vec<OsmConnectionEdge> = Vec::new();
    let mut children: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
    let mut stops_by_key: HashMap<u32, Stop> = HashMap::new();
    for stop in stops.iter_mut() {
        if stop.parent == 0 {
            add_osm_connection(stop, &tile, &mut connection_edges);
        }
        if stop.type_ == 0 && stop.parent != 0 {
            children.entry(stop.parent).or_default().push(stop.key);
        }
        stops_by_key.insert(stop.key, stop.clone());
    }
    connection_edges.sort_by_key(|c| (c.osm_node.tile(), c.osm_node.index()));
    log::info!("tile {}: {} connection edges", tile_index, connection_edges.len());

    let route_infos = parse_routes(&doc);
    let route_types: HashMap<u32, u8> =
        route_infos.iter().map(|(&k, r)| (k, r.route_type)).collect();
    let (departures, stop_access) = process_stop_pairs(&doc, &route_types, anchor);

    // Build per-stop edge lists and the departures table.
    let mut stop_edge_map: BTreeMap<GraphId, StopEdges> = BTreeMap::new();
    let mut used_routes: HashSet<u32> = HashSet::new();
    let mut next_line_id = 1u32;
    for stop in stops.iter() {
        // A stop the road network never accepted is skipped whole.
        if stop.parent == 0 && stop.conn_count == 0 {
            log::warn!("skipping unconnected stop {}", stop.key);
            continue;
        }
        let mut stop_edges = StopEdges {
            stop_key: stop.key,
            ..Default::default()
        };
        // Unique (route, destination) pairs from this stop share a line id.
        let mut unique_lines: BTreeMap<(u32, u32), u32> = BTreeMap::new();

        if stop.type_ == 1 {
            if let Some(kids) = children.get(&stop.key) {
                stop_edges.intrastation.extend(kids.iter().copied());
            }
        } else if stop.parent != 0 {
            stop_edges.intrastation.push(stop.parent);
        }

        if let Some(deps) = departures.get(&stop.key) {
            for dep in deps {
                used_routes.insert(dep.route);
                let line_id = *unique_lines
                    .entry((dep.route, dep.dest_stop))
                    .or_insert_with(|| {
                        let id = next_line_id;
                        next_line_id += 1;
                        stop_edges.lines.push(TransitLine {
                            line_id: id,
                            route_key: dep.route,
                            dest_stop_key: dep.dest_stop,
                        });
                        id
                    });

                let headsign_offset = tile.add_name(&dep.headsign);
                tile.transit_departures.push(TransitDepartureRecord {
                    line_id,
                    trip: dep.trip,
                    route: dep.route,
                    block: dep.block,
                    headsign_offset,
                    departure_time: dep.dep_time,
                    elapsed_time: dep.arr_time.saturating_sub(dep.dep_time),
                    start_date: dep.start_date,
                    end_date: dep.end_date,
                    dow_mask: dep.dow,
                    days: dep.days,
                });
            }
        }

        let onestop_offset = tile.add_name(&stop.onestop_id);
        let name_offset = tile.add_name(&stop.name);
        let desc_offset = tile.add_name(&stop.desc);
        tile.transit_stops.push(TransitStopRecord {
            stop_key: stop.key,
            onestop_offset,
            name_offset,
            desc_offset,
            parent: stop.parent,
            wheelchair_boarding: stop.wheelchair,
        });

        stop_edge_map.insert(stop.graphid, stop_edges);
    }

    // Routes referenced by at least one accepted departure.
    let mut admitted: Vec<&RouteInfo> = route_infos
        .values()
        .filter(|r| used_routes.contains(&r.key))
        .collect();
    admitted.sort_by_key(|r| r.key);
    for r in admitted {
        let onestop_offset = tile.add_name(&r.onestop_id);
        let operated_by_onestop_offset = tile.add_name(&r.operated_by_onestop_id);
        let operated_by_name_offset = tile.add_name(&r.operated_by_name);
        let short_name_offset = tile.add_name(&r.short_name);
        let long_name_offset = tile.add_name(&r.long_name);
        let desc_offset = tile.add_name(&r.desc);
        tile.transit_routes.push(TransitRouteRecord {
            route_key: r.key,
            route_type: r.route_type,
            onestop_offset,
            operated_by_onestop_offset,
            operated_by_name_offset,
            color: r.color,
            text_color: r.text_color,
            short_name_offset,
            long_name_offset,
            desc_offset,
        });
    }

    let spliced = stop_edge_map.len() as u32;
    add_to_graph(
        &mut tile,
        &stop_edge_map,
        &stops_by_key,
        global_stops,
        &stop_access,
        &connection_edges,
        &route_types,
    );

    {
        let _guard = io_lock.lock().unwrap();
        tile.write(tile_dir)?;
    }
    Ok(spliced)
}

/// Splice transit into all emitted tiles that have a schedule document.
pub fn build_transit(
    config: &Config,
    grid: &TileGrid,
    level: u8,
    anchor: NaiveDate,
) -> Result<()> {
    let Some(transit_dir) = &config.mjolnir.transit_dir else {
        println!("Transit directory not configured, transit will not be added");
        return Ok(());
    };
    let level_dir = transit_dir.join(level.to_string());
    if !level_dir.is_dir() {
        println!("Transit directory not found, transit will not be added");
        return Ok(());
    }
    let tile_dir = config.tile_dir();

    // Schedule documents whose graph tile exists.
    let mut schedules: BTreeMap<u32, PathBuf> = BTreeMap::new();
    for entry in std::fs::read_dir(&level_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Some(tile_index) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            log::warn!("ignoring schedule file {}", path.display());
            continue;
        };
        if tile_exists(tile_dir, level, tile_index) {
            schedules.insert(tile_index, path);
        }
    }
    if schedules.is_empty() {
        println!("No matching schedule documents, transit will not be added");
        return Ok(());
    }

    // Pass 1: assign graph ids to every stop.
    println!("Assigning graph ids to transit stops...");
    let mut stops_by_tile: BTreeMap<u32, Vec<Stop>> = BTreeMap::new();
    let mut global_stops: HashMap<u32, (GraphId, LatLng)> = HashMap::new();
    for (&tile_index, path) in &schedules {
        let doc = match read_schedule(path) {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("{:#}; skipping tile {}", e, tile_index);
                continue;
            }
        };
        let node_count = GraphTile::read(tile_dir, GraphId::new(tile_index, level, 0))?
            .header
            .node_count;
        let stops = collect_stops(&doc, tile_index, level, node_count, grid);
        for stop in &stops {
            global_stops.insert(stop.key, (stop.graphid, stop.ll));
        }
        if !stops.is_empty() {
            stops_by_tile.insert(tile_index, stops);
        }
    }
    let total: usize = stops_by_tile.values().map(|v| v.len()).sum();
    println!("  ✓ {} transit stops in {} tiles", total, stops_by_tile.len());
    if total == 0 {
        return Ok(());
    }

    // Pass 2: splice, tiles partitioned across workers.
    println!("Adding transit to the local graph...");
    let work: Vec<(u32, PathBuf, Vec<Stop>)> = stops_by_tile
        .into_iter()
        .map(|(tile_index, stops)| (tile_index, schedules[&tile_index].clone(), stops))
        .collect();
    let threads = config.concurrency().max(1).min(work.len());
    let floor = work.len() / threads;
    let at_ceiling = work.len() - threads * floor;
    let io_lock = Mutex::new(());

    let mut chunks: Vec<Vec<(u32, PathBuf, Vec<Stop>)>> = Vec::with_capacity(threads);
    let mut iter = work.into_iter();
    for i in 0..threads {
        let count = if i < at_ceiling { floor + 1 } else { floor };
        chunks.push(iter.by_ref().take(count).collect());
    }

    let spliced = std::thread::scope(|scope| -> Result<u32> {
        let mut handles = Vec::with_capacity(threads);
        for chunk in &mut chunks {
            let global_stops = &global_stops;
            let io_lock = &io_lock;
            handles.push(scope.spawn(move || -> Result<u32> {
                let mut spliced = 0u32;
                for (tile_index, schedule_path, stops) in chunk.iter_mut() {
                    spliced += build_tile_transit(
                        tile_dir,
                        *tile_index,
                        level,
                        schedule_path,
                        stops,
                        global_stops,
                        anchor,
                        io_lock,
                    )?;
                }
                Ok(spliced)
            }));
        }
        let mut total = 0u32;
        for handle in handles {
            total += handle
                .join()
                .map_err(|_| crate::error::FatalError::WorkerPanic { stage: "transit" })??;
        }
        Ok(total)
    })?;

    println!("  ✓ spliced {} stops", spliced);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn road_tile(dir: &Path, tile_index: u32, shape: &[LatLng]) -> GraphTile {
        // A single way (id 100) between two nodes with the given shape.
        let mut tile = GraphTile::new(GraphId::new(tile_index, 2, 0));
        let length = polyline_length(shape) as f32;
        tile.nodes.push(NodeRecord {
            ll: shape[0],
            edge_index: 0,
            edge_count: 1,
            access: access::ALL,
            ..Default::default()
        });
        tile.nodes.push(NodeRecord {
            ll: *shape.last().unwrap(),
            edge_index: 1,
            edge_count: 1,
            access: access::ALL,
            ..Default::default()
        });
        let info = tile.add_edge_info(0, 100, shape, &[]);
        tile.directededges.push(DirectedEdgeRecord {
            end_node: GraphId::new(tile_index, 2, 1),
            length,
            forward: true,
            forward_access: access::ALL,
            reverse_access: access::ALL,
            edge_info_offset: info,
            ..Default::default()
        });
        tile.directededges.push(DirectedEdgeRecord {
            end_node: GraphId::new(tile_index, 2, 0),
            length,
            forward: false,
            forward_access: access::ALL,
            reverse_access: access::ALL,
            local_edge_index: 0,
            opp_index: 0,
            edge_info_offset: info,
            ..Default::default()
        });
        tile.directededges[0].opp_index = 0;
        tile.write(dir).unwrap();
        GraphTile::read_path(&tile.file_path(dir)).unwrap()
    }

    fn stop_at(tile_index: u32, key: u32, index: u32, ll: LatLng, way_id: u64) -> Stop {
        Stop {
            graphid: GraphId::new(tile_index, 2, index),
            way_id,
            key,
            type_: 0,
            parent: 0,
            conn_count: 0,
            wheelchair: false,
            timezone: 0,
            ll,
            onestop_id: format!("s-{}", key),
            name: format!("Stop {}", key),
            desc: String::new(),
        }
    }

    #[test]
    fn test_connection_walks_shape_to_closest_point() {
        // Road way 100 with shape (0,0)-(1,0)-(2,0); stop just off (1,0).
        let dir = tempfile::tempdir().unwrap();
        let shape = [
            LatLng::new(0.0, 0.0),
            LatLng::new(1.0, 0.0),
            LatLng::new(2.0, 0.0),
        ];
        let grid = TileGrid::new(4.0);
        let tile_index = grid.tile_index(shape[0]);
        assert_eq!(tile_index, grid.tile_index(shape[2]));
        let tile = road_tile(dir.path(), tile_index, &shape);

        let mut stop = stop_at(tile_index, 10, 2, LatLng::new(1.0, 0.0001), 100);
        let mut conns = Vec::new();
        add_osm_connection(&mut stop, &tile, &mut conns);

        assert_eq!(stop.conn_count, 2);
        assert_eq!(conns.len(), 2);
        // First connection from the start node: walks (0,0) -> (1,0) then
        // the projected point and the stop.
        assert_eq!(conns[0].osm_node.index(), 0);
        assert_eq!(conns[0].shape.first().unwrap(), &shape[0]);
        assert_eq!(conns[0].shape.last().unwrap(), &stop.ll);
        // Second from the far node, mirrored.
        assert_eq!(conns[1].osm_node.index(), 1);
        assert_eq!(conns[1].shape.first().unwrap(), &shape[2]);
        assert_eq!(conns[1].shape.last().unwrap(), &stop.ll);
        assert!(conns[0].length >= 1.0 && conns[1].length >= 1.0);
    }

    #[test]
    fn test_connection_requires_matching_way() {
        let dir = tempfile::tempdir().unwrap();
        let shape = [LatLng::new(0.0, 0.0), LatLng::new(1.0, 0.0)];
        let grid = TileGrid::new(4.0);
        let tile_index = grid.tile_index(shape[0]);
        let tile = road_tile(dir.path(), tile_index, &shape);

        let mut stop = stop_at(tile_index, 10, 2, LatLng::new(0.5, 0.0001), 999);
        let mut conns = Vec::new();
        add_osm_connection(&mut stop, &tile, &mut conns);
        assert_eq!(stop.conn_count, 0);
        assert!(conns.is_empty());
    }

    fn schedule_json() -> String {
        serde_json::json!({
            "stops": [
                {
                    "key": 10,
                    "name": "Central",
                    "geometry": {"coordinates": [0.0001, 1.0]},
                    "timezone": "Europe/Brussels",
                    "tags": {"onestop_id": "s-abc", "osm_way_id": 100,
                             "wheelchair_boarding": true},
                },
                {
                    "key": 11,
                    "name": "Terminus",
                    "geometry": {"coordinates": [0.0002, 1.5]},
                    "timezone": "Europe/Brussels",
                    "tags": {"onestop_id": "s-def", "osm_way_id": 100},
                },
            ],
            "schedule_stop_pairs": [
                {
                    "origin_key": 10,
                    "destination_key": 11,
                    "route_key": 5,
                    "trip_key": 7,
                    "block_key": 1,
                    "origin_departure_time": "08:00:00",
                    "destination_arrival_time": "08:10:00",
                    "service_start_date": "2017-01-02",
                    "service_end_date": "2017-01-15",
                    "service_days_of_week": [true, false, true, false, true, false, false],
                    "service_added_dates": ["2017-01-07"],
                    "service_except_dates": ["2017-01-09"],
                    "bikes_allowed": "1",
                    "trip_headsign": "Terminus",
                },
            ],
            "routes": [
                {
                    "key": 5,
                    "onestop_id": "r-xyz",
                    "name": "5",
                    "tags": {"vehicle_type": "bus", "route_long_name": "Crosstown"},
                },
                {
                    "key": 6,
                    "name": "ghost",
                    "tags": {"vehicle_type": "hovercraft"},
                },
            ],
        })
        .to_string()
    }

    #[test]
    fn test_departures_and_day_bitmap() {
        let doc: TransitTileJson = serde_json::from_str(&schedule_json()).unwrap();
        let routes = parse_routes(&doc);
        // Hovercraft dropped, bus kept.
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[&5].route_type, 3);

        let route_types: HashMap<u32, u8> =
            routes.iter().map(|(&k, r)| (k, r.route_type)).collect();
        let anchor = parse_date("2016-12-31").unwrap();
        let (departures, stop_access) = process_stop_pairs(&doc, &route_types, anchor);

        let deps = &departures[&10];
        assert_eq!(deps.len(), 1);
        let dep = &deps[0];
        assert_eq!(dep.dep_time, 8 * 3600);
        assert_eq!(dep.arr_time - dep.dep_time, 600);
        let expected: u64 = [2u64, 4, 6, 7, 11, 13].iter().map(|b| 1u64 << b).sum();
        assert_eq!(dep.days, expected);
        assert_eq!(stop_access[&10], true);
        assert_eq!(stop_access[&11], true);
    }

    #[test]
    fn test_splice_full_tile() {
        let dir = tempfile::tempdir().unwrap();
        let grid = TileGrid::new(4.0);
        let shape = [
            LatLng::new(1.0, 0.0),
            LatLng::new(1.5, 0.0),
            LatLng::new(2.0, 0.0),
        ];
        let tile_index = grid.tile_index(shape[0]);
        road_tile(dir.path(), tile_index, &shape);

        let schedule = dir.path().join("schedule.json");
        std::fs::write(&schedule, schedule_json()).unwrap();

        let doc: TransitTileJson = serde_json::from_str(&schedule_json()).unwrap();
        let mut stops = collect_stops(&doc, tile_index, 2, 2, &grid);
        assert_eq!(stops.len(), 2);
        assert_eq!(stops[0].graphid.index(), 2);
        assert_eq!(stops[1].graphid.index(), 3);
        let global: HashMap<u32, (GraphId, LatLng)> = stops
            .iter()
            .map(|s| (s.key, (s.graphid, s.ll)))
            .collect();

        let io_lock = Mutex::new(());
        let anchor = parse_date("2016-12-31").unwrap();
        let spliced = build_tile_transit(
            dir.path(),
            tile_index,
            2,
            &schedule,
            &mut stops,
            &global,
            anchor,
            &io_lock,
        )
        .unwrap();
        assert_eq!(spliced, 2);

        let tile = GraphTile::read(dir.path(), GraphId::new(tile_index, 2, 0)).unwrap();
        // Two road nodes plus two stop nodes.
        assert_eq!(tile.nodes.len(), 4);

        // The road nodes gained a connection edge each (stop 10 snapped to
        // way 100 touches both endpoints).
        let road0 = &tile.nodes[0];
        assert!(road0.edge_count >= 2);
        let has_conn = (road0.edge_index..road0.edge_index + road0.edge_count)
            .any(|i| tile.directededge(i).use_ == EdgeUse::TransitConnection);
        assert!(has_conn);

        // Stop nodes: pedestrian + bicycle access (bikes allowed), mode
        // change, transit type.
        let stop_node = &tile.nodes[2];
        assert_eq!(stop_node.node_type, NodeType::MultiUseTransitStop);
        assert!(stop_node.mode_change);
        assert_ne!(stop_node.access & access::PEDESTRIAN, 0);
        assert_ne!(stop_node.access & access::BICYCLE, 0);
        assert!(stop_node.edge_count >= 1);

        // A bus line edge with a recorded line id, matching a departure.
        let line_edge = tile
            .directededges
            .iter()
            .find(|de| de.use_ == EdgeUse::Bus)
            .expect("bus line edge");
        assert_ne!(line_edge.line_id, 0);
        assert!(tile
            .transit_departures
            .iter()
            .any(|d| d.line_id == line_edge.line_id));

        // Departure fields survived.
        assert_eq!(tile.transit_departures.len(), 1);
        let dep = &tile.transit_departures[0];
        assert_eq!(dep.departure_time, 8 * 3600);
        assert_eq!(dep.elapsed_time, 600);
        assert_eq!(tile.name(dep.headsign_offset), "Terminus");

        // Stop and route tables filled; the unsupported route was dropped.
        assert_eq!(tile.transit_stops.len(), 2);
        assert_eq!(tile.transit_routes.len(), 1);
        assert_eq!(tile.transit_routes[0].route_key, 5);

        // Node edge counts stay consistent with the edge array.
        let total: u32 = tile.nodes.iter().map(|n| n.edge_count).sum();
        assert_eq!(total, tile.directededges.len() as u32);
    }
}
