//! Tile emission: turns the spliced graph into tile files.
//!
//! Tiles are partitioned contiguously across worker threads; each worker
//! owns its range and its filesystem writes, and reports bytes written (or
//! its error) through its join handle. Within a tile, nodes appear in the
//! insertion order set by the tiler and edges in each node's sorted order.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{anyhow, Result};

use crate::formats::tile::NO_OPPOSING_INDEX;
use crate::formats::{DirectedEdgeRecord, GraphTile, NodeRecord, SignRecord, SignType};
use crate::geo::polyline_length;
use crate::graph::Edge;
use crate::graphid::GraphId;
use crate::osm::{access, EdgeUse, NodeStrings, OsmNode, OsmWay, RoadClass, SpeedType};
use crate::tiles::TileGrid;

/// Expansion budget for the no-through search. Bounds worst-case cost on
/// pathological dead-end clusters while still catching residential
/// cul-de-sacs.
const MAX_NO_THRU_TRIES: u32 = 256;

/// Decide whether an edge enters a region with no exit other than itself.
/// Breadth-first from the end node, never expanding the entering edge, up to
/// `MAX_NO_THRU_TRIES` pop-expand steps. Reaching the start node again or
/// touching a road classed tertiary-unclassified or better proves an exit.
pub fn is_no_through_edge(
    start_node: u64,
    end_node: u64,
    start_edge_index: u32,
    nodes: &BTreeMap<u64, OsmNode>,
    edges: &[Edge],
) -> bool {
    let mut visited: HashSet<u64> = HashSet::new();
    let mut expand: HashSet<u64> = HashSet::new();
    expand.insert(end_node);

    for _ in 0..MAX_NO_THRU_TRIES {
        // Expansion exhausted without finding an exit: dead-end region.
        if expand.is_empty() {
            return true;
        }
        let node = *expand.iter().next().unwrap();
        expand.remove(&node);
        visited.insert(node);

        let Some(nd) = nodes.get(&node) else {
            continue;
        };
        for &edge_index in &nd.edges {
            if edge_index == start_edge_index {
                continue;
            }
            let edge = &edges[edge_index as usize];
            let neighbor = edge.opposite(node);

            if neighbor == start_node
                || edge.attributes.importance <= RoadClass::TertiaryUnclassified
            {
                return false;
            }
            if !visited.contains(&neighbor) {
                expand.insert(neighbor);
            }
        }
    }
    // Budget exhausted: not provably no-through.
    false
}

/// Local index of the edge at `end_node` that runs back to `start_node`.
pub fn opposing_index(
    end_node: u64,
    start_node: u64,
    nodes: &BTreeMap<u64, OsmNode>,
    edges: &[Edge],
) -> Option<u32> {
    let nd = nodes.get(&end_node)?;
    for (n, &edge_index) in nd.edges.iter().enumerate() {
        let e = &edges[edge_index as usize];
        if (e.source_node == end_node && e.target_node == start_node)
            || (e.target_node == end_node && e.source_node == start_node)
        {
            return Some(n as u32);
        }
    }
    None
}

/// Build one directed-edge record from a way, mirroring direction-sensitive
/// attributes for the reverse traversal.
fn build_directed_edge(
    way: &OsmWay,
    forward: bool,
    length: f32,
    local_edge_index: u32,
    traffic_signal: bool,
) -> DirectedEdgeRecord {
    let mut de = DirectedEdgeRecord {
        length,
        speed: way.speed,
        truck_speed: way.truck_speed,
        use_: way.use_,
        class: way.road_class,
        unpaved: way.unpaved,
        cyclelane: way.cyclelane,
        bridge: way.bridge,
        tunnel: way.tunnel,
        roundabout: way.roundabout,
        link: way.link,
        ferry: way.ferry,
        rail_ferry: way.rail,
        toll: way.toll,
        destination_only: way.destination_only || way.no_thru_traffic,
        truck_route: way.truck_route,
        bike_network: way.bike_network,
        forward,
        traffic_signal,
        speed_type: if way.tagged_speed {
            SpeedType::Tagged
        } else {
            SpeedType::Classified
        },
        local_edge_index,
        restrictions: way.restrictions,
        ..Default::default()
    };

    if way.ferry {
        de.use_ = EdgeUse::Ferry;
    }
    if way.rail {
        de.use_ = EdgeUse::RailFerry;
    }

    let mut fwd: u16 = 0;
    let mut rev: u16 = 0;
    let pairs: [(bool, bool, u16); 6] = [
        (way.auto_forward, way.auto_backward, access::AUTO),
        (way.truck_forward, way.truck_backward, access::TRUCK),
        (way.bus_forward, way.bus_backward, access::BUS),
        (way.bike_forward, way.bike_backward, access::BICYCLE),
        (way.emergency_forward, way.emergency_backward, access::EMERGENCY),
        (way.hov_forward, way.hov_backward, access::HOV),
    ];
    for (f, b, bit) in pairs {
        if (f && forward) || (b && !forward) {
            fwd |= bit;
        }
        if (f && !forward) || (b && forward) {
            rev |= bit;
        }
    }
    if way.pedestrian {
        fwd |= access::PEDESTRIAN;
        rev |= access::PEDESTRIAN;
    }
    de.forward_access = fwd;
    de.reverse_access = rev;
    de
}

/// Build the tile for one grid cell.
#[allow(clippy::too_many_arguments)]
fn build_tile(
    tile_index: u32,
    level: u8,
    node_ids: &[u64],
    grid: &TileGrid,
    ways: &[OsmWay],
    nodes: &BTreeMap<u64, OsmNode>,
    edges: &[Edge],
    strings: &NodeStrings,
) -> Result<GraphTile> {
    let graphid = GraphId::new(tile_index, level, 0);
    let mut tile = GraphTile::new(graphid);
    let bb = grid.bounds(tile_index);
    tile.header.bbox = (bb.min_lat, bb.min_lng, bb.max_lat, bb.max_lng);

    let mut directededge_count: u32 = 0;
    for &osm_id in node_ids {
        let node = nodes
            .get(&osm_id)
            .ok_or_else(|| anyhow!("tiled node {} missing from node map", osm_id))?;

        let mut record = NodeRecord {
            ll: node.ll,
            edge_index: directededge_count,
            access: node.modes_mask,
            traffic_signal: node.traffic_signal,
            ..Default::default()
        };

        let mut best_class = RoadClass::Other;
        for (local_index, &edge_index) in node.edges.iter().enumerate() {
            let edge = &edges[edge_index as usize];
            let way = &ways[edge.way_index as usize];
            let length = polyline_length(&edge.shape) as f32;

            // Orientation along the way: forward when this node is the
            // spliced source.
            let forward = if edge.source_node == osm_id {
                true
            } else if edge.target_node == osm_id {
                false
            } else {
                log::error!(
                    "edge {} endpoints {}..{} do not include node {} (way {})",
                    edge_index,
                    edge.source_node,
                    edge.target_node,
                    osm_id,
                    way.osm_id
                );
                continue;
            };
            let (end_osm, start_osm) = if forward {
                (edge.target_node, edge.source_node)
            } else {
                (edge.source_node, edge.target_node)
            };

            let mut de = build_directed_edge(
                way,
                forward,
                length,
                local_index as u32,
                node.traffic_signal,
            );

            let end_graphid = nodes
                .get(&end_osm)
                .map(|n| n.graphid)
                .unwrap_or(GraphId::INVALID);
            if !end_graphid.is_valid() {
                log::error!("end node {} of way {} has no graph id", end_osm, way.osm_id);
            }
            de.end_node = end_graphid;

            de.opp_index = match opposing_index(end_osm, start_osm, nodes, edges) {
                Some(idx) => idx,
                None => {
                    log::error!(
                        "no opposing edge for way {} between {} and {}",
                        way.osm_id,
                        start_osm,
                        end_osm
                    );
                    NO_OPPOSING_INDEX
                }
            };

            // Importance at or better than tertiary-unclassified can never
            // be no-through.
            de.not_thru = if de.class <= RoadClass::TertiaryUnclassified {
                false
            } else {
                is_no_through_edge(start_osm, end_osm, edge_index, nodes, edges)
            };

            de.edge_info_offset =
                tile.add_edge_info(edge_index as u64, way.osm_id, &edge.shape, &way.names());

            // Exit signage on link edges leaving this node.
            if forward && way.link {
                let mut signed = false;
                if let Some(exit_ref) = strings.refs.get(&osm_id) {
                    let off = tile.add_name(exit_ref);
                    tile.signs.push(SignRecord {
                        edge_index: directededge_count,
                        sign_type: SignType::ExitNumber,
                        text_offset: off,
                    });
                    signed = true;
                }
                if !way.destination_ref.is_empty() {
                    let off = tile.add_name(&way.destination_ref);
                    tile.signs.push(SignRecord {
                        edge_index: directededge_count,
                        sign_type: SignType::ExitBranch,
                        text_offset: off,
                    });
                    signed = true;
                }
                if !way.destination.is_empty() {
                    let off = tile.add_name(&way.destination);
                    tile.signs.push(SignRecord {
                        edge_index: directededge_count,
                        sign_type: SignType::ExitToward,
                        text_offset: off,
                    });
                    signed = true;
                }
                if let Some(exit_to) = strings.exit_to.get(&osm_id) {
                    let off = tile.add_name(exit_to);
                    tile.signs.push(SignRecord {
                        edge_index: directededge_count,
                        sign_type: SignType::ExitToward,
                        text_offset: off,
                    });
                    signed = true;
                }
                de.exit_sign = signed;
            }

            if de.class < best_class {
                best_class = de.class;
            }
            tile.directededges.push(de);
            directededge_count += 1;
        }

        record.best_class = best_class;
        record.edge_count = directededge_count - record.edge_index;
        tile.nodes.push(record);
    }

    Ok(tile)
}

/// Emit all tiles at the local level, partitioned across workers. Returns
/// total bytes written.
#[allow(clippy::too_many_arguments)]
pub fn build_local_tiles(
    tile_dir: &Path,
    grid: &TileGrid,
    level: u8,
    ways: &[OsmWay],
    nodes: &BTreeMap<u64, OsmNode>,
    edges: &[Edge],
    tiled_nodes: &BTreeMap<u32, Vec<u64>>,
    strings: &NodeStrings,
    concurrency: usize,
) -> Result<u64> {
    let tiles: Vec<(&u32, &Vec<u64>)> = tiled_nodes.iter().collect();
    println!("  {} tiles to emit", tiles.len());

    let threads = concurrency.max(1).min(tiles.len().max(1));
    let floor = tiles.len() / threads;
    let at_ceiling = tiles.len() - threads * floor;

    let written = std::thread::scope(|scope| -> Result<u64> {
        let mut handles = Vec::with_capacity(threads);
        let mut start = 0usize;
        for i in 0..threads {
            let count = if i < at_ceiling { floor + 1 } else { floor };
            let range = &tiles[start..start + count];
            start += count;

            handles.push(scope.spawn(move || -> Result<u64> {
                let mut bytes = 0u64;
                for &(tile_index, node_ids) in range {
                    let mut tile = build_tile(
                        *tile_index, level, node_ids, grid, ways, nodes, edges, strings,
                    )?;
                    bytes += tile.write(tile_dir)?;
                }
                Ok(bytes)
            }));
        }

        let mut total = 0u64;
        for handle in handles {
            let result = handle
                .join()
                .map_err(|_| crate::error::FatalError::WorkerPanic { stage: "emit" })?;
            total += result?;
        }
        Ok(total)
    })?;

    Ok(written)
}
