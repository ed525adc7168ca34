//! Second pass over emitted tiles: resolve opposing-edge indices across tile
//! boundaries, mark country crossings, detect topological defects and
//! aggregate statistics.
//!
//! Workers consume a shuffled queue of tile ids. A single mutex serialises
//! queue pops, cross-tile cache loads and tile writebacks, so readers of a
//! neighbouring tile see either the pre-update or post-update file, never a
//! torn one.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use rand::seq::SliceRandom;

use crate::formats::tile::NO_OPPOSING_INDEX;
use crate::formats::{DirectedEdgeRecord, GraphTile};
use crate::graphid::GraphId;
use crate::osm::{access, EdgeUse};
use crate::stats::{DefectKind, ValidatorStats};
use crate::tilecache::TileCache;
use crate::tiles::{tile_exists, TileGrid};

fn auto_forward(de: &DirectedEdgeRecord) -> bool {
    de.forward_access & access::AUTO != 0
}

fn auto_reverse(de: &DirectedEdgeRecord) -> bool {
    de.reverse_access & access::AUTO != 0
}

fn pedestrian_any(de: &DirectedEdgeRecord) -> bool {
    (de.forward_access | de.reverse_access) & access::PEDESTRIAN != 0
}

fn node_edges<'a>(
    tile: &'a GraphTile,
    node_index: u32,
) -> impl Iterator<Item = (u32, &'a DirectedEdgeRecord)> {
    let node = tile.node(node_index);
    (node.edge_index..node.edge_index + node.edge_count)
        .map(move |i| (i - node.edge_index, tile.directededge(i)))
}

/// Everything a defect detector may look at for one directed edge.
pub struct EdgeView<'a> {
    pub tile: &'a GraphTile,
    pub node_index: u32,
    pub local_index: u32,
    pub edge: &'a DirectedEdgeRecord,
    /// Snapshot of the tile holding the end node (may be this tile's
    /// pre-update image).
    pub end_tile: &'a GraphTile,
}

impl EdgeView<'_> {
    fn node_graphid(&self) -> GraphId {
        self.tile.graphid().with_index(self.node_index)
    }
}

/// One-way edge whose start node offers nothing but pedestrian-only escapes.
fn pedestrian_terminal(view: &EdgeView) -> Option<DefectKind> {
    let node = view.tile.node(view.node_index);
    if node.edge_count <= 1 {
        return None;
    }
    for (local, other) in node_edges(view.tile, view.node_index) {
        if local == view.local_index {
            continue;
        }
        let ped_only = pedestrian_any(other) && !auto_forward(other) && !auto_reverse(other);
        if !ped_only {
            return None;
        }
    }
    Some(DefectKind::PedestrianTerminal)
}

/// Self-loop where every auto edge at the node points the same way.
fn loop_terminal(view: &EdgeView) -> Option<DefectKind> {
    if view.edge.end_node != view.node_graphid() {
        return None;
    }
    let mut inbound = 0u32;
    let mut outbound = 0u32;
    for (_, other) in node_edges(view.tile, view.node_index) {
        if auto_forward(other) {
            outbound += 1;
        }
        if auto_reverse(other) {
            inbound += 1;
        }
    }
    if (outbound >= 2 && inbound == 0) || (inbound >= 2 && outbound == 0) {
        Some(DefectKind::LoopTerminal)
    } else {
        None
    }
}

/// One-way pointing into a node that is a sink under auto travel at both
/// endpoints: almost always a digitisation error.
fn reversed_oneway(view: &EdgeView) -> Option<DefectKind> {
    if view.edge.end_node == view.node_graphid() {
        return None;
    }

    let sink = |tile: &GraphTile, node_index: u32| {
        let mut inbound = 0u32;
        let mut outbound = 0u32;
        for (_, other) in node_edges(tile, node_index) {
            if auto_forward(other) && !auto_reverse(other) {
                outbound += 1;
            }
            if !auto_forward(other) && auto_reverse(other) {
                inbound += 1;
            }
        }
        outbound == 0 && inbound >= 1
    };

    if sink(view.tile, view.node_index) && sink(view.end_tile, view.edge.end_node.index()) {
        Some(DefectKind::ReversedOneway)
    } else {
        None
    }
}

/// Detector list; the coordinator records the first hit per edge.
const DETECTORS: [fn(&EdgeView) -> Option<DefectKind>; 3] =
    [pedestrian_terminal, loop_terminal, reversed_oneway];

/// Find the local index of the opposing edge at the end node: the unique
/// edge whose (end node, shortcut flag, length) matches back. Returns the
/// index and the country ISO at the end node.
fn opposing_edge_index(
    start_node: GraphId,
    de: &DirectedEdgeRecord,
    end_tile: &GraphTile,
    dupcount: &mut u32,
) -> (u32, String) {
    let end_node = end_tile.node(de.end_node.index());
    let end_iso = end_tile.admin(end_node.admin_index).country_iso.clone();

    let mut opp = NO_OPPOSING_INDEX;
    for (local, cand) in node_edges(end_tile, de.end_node.index()) {
        if cand.end_node == start_node && cand.shortcut == de.shortcut && cand.length == de.length {
            if opp != NO_OPPOSING_INDEX {
                *dupcount += 1;
            }
            opp = local;
        }
    }

    if opp == NO_OPPOSING_INDEX {
        if de.use_.is_transit() {
            // Stop-road connections are the only transit edges expected to
            // pair up.
            if de.use_ == EdgeUse::TransitConnection {
                log::error!(
                    "no opposing transit connection edge: end stop {} has {} edges",
                    end_node.stop_id,
                    end_node.edge_count
                );
            }
        } else {
            log::error!(
                "no opposing edge at {},{} length {} from {} to {}",
                end_node.ll.lat,
                end_node.ll.lng,
                de.length,
                start_node,
                de.end_node
            );
        }
    }
    (opp, end_iso)
}

struct WorkerContext<'a> {
    tile_dir: &'a Path,
    grid: &'a TileGrid,
    level: u8,
    queue: &'a Mutex<VecDeque<u32>>,
}

fn validate_worker(ctx: &WorkerContext) -> Result<ValidatorStats> {
    let mut stats = ValidatorStats::default();
    let mut cache = TileCache::new(ctx.tile_dir.to_path_buf());

    loop {
        let tile_index = { ctx.queue.lock().unwrap().pop_front() };
        let Some(tile_index) = tile_index else {
            break;
        };
        let tile_id = GraphId::new(tile_index, ctx.level, 0);

        let mut tile = {
            let _guard = ctx.queue.lock().unwrap();
            GraphTile::read(ctx.tile_dir, tile_id)?
        };

        let mut dupcount = 0u32;
        let mut roadlength = 0f64;

        for node_index in 0..tile.nodes.len() as u32 {
            let node = tile.node(node_index).clone();
            let node_gid = tile.graphid().with_index(node_index);
            let begin_iso = tile.admin(node.admin_index).country_iso.clone();

            for j in 0..node.edge_count {
                let de_index = (node.edge_index + j) as usize;
                let de = tile.directededges[de_index].clone();

                if !de.end_node.is_valid() {
                    log::error!("edge {} in tile {} has no end node", de_index, tile_index);
                    continue;
                }

                // Pre-update snapshot of the end tile (even when it is this
                // tile) through the shared cache, under the mutex.
                let end_tile: Arc<GraphTile> = {
                    let _guard = ctx.queue.lock().unwrap();
                    cache.get(de.end_node)?
                };

                let (opp, end_iso) = opposing_edge_index(node_gid, &de, &end_tile, &mut dupcount);
                let crossing = !begin_iso.is_empty() && !end_iso.is_empty() && begin_iso != end_iso;
                {
                    let de_mut = &mut tile.directededges[de_index];
                    de_mut.opp_index = opp;
                    if crossing {
                        de_mut.country_crossing = true;
                    }
                }

                // Transit edges and shortcuts stay out of the road totals.
                if de.shortcut || de.use_.is_transit() {
                    continue;
                }
                let full_length = de.length as f64;
                roadlength += full_length;

                if de.link {
                    continue;
                }
                let rclass = de.class;
                // Each segment is seen from both of its directed edges, and
                // a boundary edge additionally from both tiles.
                let length = if tile_index == de.end_node.tile() {
                    full_length / 2.0
                } else {
                    full_length / 4.0
                };

                let fward = auto_forward(&de);
                let bward = auto_reverse(&de);
                if (fward || bward) && (!fward || !bward) {
                    let view = EdgeView {
                        tile: &tile,
                        node_index,
                        local_index: j,
                        edge: &de,
                        end_tile: end_tile.as_ref(),
                    };
                    for detector in DETECTORS {
                        if let Some(kind) = detector(&view) {
                            let info = tile.edge_info(de.edge_info_offset);
                            stats.roulette_data.add_task(kind, node.ll, info.way_id, &info.shape);
                            break;
                        }
                    }
                    stats.add_tile_one_way(tile_index, rclass, length);
                    stats.add_country_one_way(&begin_iso, rclass, length);
                }

                if de.internal {
                    stats.add_tile_int_edge(tile_index, rclass);
                    stats.add_country_int_edge(&begin_iso, rclass);
                }
                if de.speed_type == crate::osm::SpeedType::Tagged {
                    stats.add_tile_speed_info(tile_index, rclass, length);
                    stats.add_country_speed_info(&begin_iso, rclass, length);
                }
                if !tile.edge_info(de.edge_info_offset).name_offsets.is_empty() {
                    stats.add_tile_named(tile_index, rclass, length);
                    stats.add_country_named(&begin_iso, rclass, length);
                }
                if de.truck_route {
                    stats.add_tile_truck_route(tile_index, rclass, length);
                    stats.add_country_truck_route(&begin_iso, rclass, length);
                }
                if de.restrictions & crate::osm::restriction::HAZMAT != 0 {
                    stats.add_tile_hazmat(tile_index, rclass);
                    stats.add_country_hazmat(&begin_iso, rclass);
                }
                if de.restrictions & !crate::osm::restriction::HAZMAT != 0 {
                    stats.add_tile_truck_restricted(tile_index, rclass);
                    stats.add_country_truck_restricted(&begin_iso, rclass);
                }

                stats.add_tile_road(tile_index, rclass, length);
                stats.add_country_road(&begin_iso, rclass, length);
            }
        }

        // Road density over the tile area; lengths were accumulated from
        // both directed edges, hence the half factor inside 0.0005.
        let area = ctx.grid.area_km2(tile_index);
        let density = ((roadlength * 0.0005) / area) as f32;
        tile.header.density = density;
        stats.add_density(density, ctx.level);
        stats.add_tile_area(tile_index, area);
        stats.add_tile_geom(tile_index, ctx.grid.bounds(tile_index));
        stats.add_dup(dupcount, ctx.level);

        {
            let _guard = ctx.queue.lock().unwrap();
            tile.write(ctx.tile_dir)?;
            cache.invalidate(tile_id);
        }
        if cache.over_committed() {
            cache.clear();
        }
    }

    Ok(stats)
}

/// Validate every emitted tile at the given level.
pub fn validate_tiles(
    tile_dir: &Path,
    grid: &TileGrid,
    level: u8,
    concurrency: usize,
) -> Result<ValidatorStats> {
    let mut tile_ids: Vec<u32> =
        (0..grid.tile_count()).filter(|&t| tile_exists(tile_dir, level, t)).collect();
    println!("  validating {} tiles", tile_ids.len());

    // Randomise so workers touch disjoint neighbourhoods and the caches
    // spread instead of convoying.
    tile_ids.shuffle(&mut rand::thread_rng());
    let queue = Mutex::new(VecDeque::from(tile_ids));
    let threads = concurrency.max(1);

    let merged = std::thread::scope(|scope| -> Result<ValidatorStats> {
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            let ctx = WorkerContext {
                tile_dir,
                grid,
                level,
                queue: &queue,
            };
            handles.push(scope.spawn(move || validate_worker(&ctx)));
        }

        let mut merged = ValidatorStats::default();
        for handle in handles {
            let stats = handle
                .join()
                .map_err(|_| crate::error::FatalError::WorkerPanic { stage: "validate" })??;
            merged.merge(stats);
        }
        Ok(merged)
    })?;

    for (&lvl, dups) in &merged.dup_counts {
        let total: u32 = dups.iter().sum();
        if total > 0 {
            log::warn!("possible duplicate opposing edges at level {}: {}", lvl, total);
        }
    }
    for (&lvl, densities) in &merged.densities {
        if densities.is_empty() {
            continue;
        }
        let max = densities.iter().cloned().fold(0.0f32, f32::max);
        let avg = densities.iter().sum::<f32>() / densities.len() as f32;
        println!("  level {}: average density {:.4}, max {:.4}", lvl, avg, max);
    }
    println!("  ✓ {} defect tasks", merged.roulette_data.len());

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{EdgeInfoRecord, NodeRecord};
    use crate::geo::LatLng;
    use crate::osm::RoadClass;

    /// Hand-build a tile: nodes with (lat, lng) and per-node edge lists of
    /// (end_node_index, length, fwd_auto, rev_auto).
    fn build_tile(
        tile_index: u32,
        nodes: &[(f64, f64)],
        edges: &[Vec<(u32, f32, bool, bool)>],
    ) -> GraphTile {
        let mut tile = GraphTile::new(GraphId::new(tile_index, 2, 0));
        let mut edge_index = 0u32;
        for (i, &(lat, lng)) in nodes.iter().enumerate() {
            tile.nodes.push(NodeRecord {
                ll: LatLng::new(lat, lng),
                edge_index,
                edge_count: edges[i].len() as u32,
                ..Default::default()
            });
            for &(end, length, fwd, rev) in &edges[i] {
                let mut de = DirectedEdgeRecord {
                    end_node: GraphId::new(tile_index, 2, end),
                    length,
                    class: RoadClass::Residential,
                    edge_info_offset: tile.edgeinfo.len() as u32,
                    ..Default::default()
                };
                de.forward_access = access::PEDESTRIAN | if fwd { access::AUTO } else { 0 };
                de.reverse_access = access::PEDESTRIAN | if rev { access::AUTO } else { 0 };
                tile.directededges.push(de);
                tile.edgeinfo.push(EdgeInfoRecord {
                    way_id: 1000 + edge_index as u64,
                    shape: vec![LatLng::new(lat, lng)],
                    name_offsets: vec![],
                });
                edge_index += 1;
            }
        }
        tile
    }

    #[test]
    fn test_opposing_edge_found() {
        let tile = build_tile(
            5,
            &[(0.0, 0.0), (0.0, 0.001)],
            &[
                vec![(1, 111.0, true, true)],
                vec![(0, 111.0, true, true)],
            ],
        );
        let start = GraphId::new(5, 2, 0);
        let mut dup = 0;
        let (opp, _) = opposing_edge_index(start, tile.directededge(0), &tile, &mut dup);
        assert_eq!(opp, 0);
        assert_eq!(dup, 0);
    }

    #[test]
    fn test_opposing_edge_duplicate_counted() {
        // End node has two identical edges back: one match is recorded, the
        // surplus is a duplicate.
        let tile = build_tile(
            5,
            &[(0.0, 0.0), (0.0, 0.001)],
            &[
                vec![(1, 111.0, true, true)],
                vec![(0, 111.0, true, true), (0, 111.0, true, true)],
            ],
        );
        let start = GraphId::new(5, 2, 0);
        let mut dup = 0;
        let (_, _) = opposing_edge_index(start, tile.directededge(0), &tile, &mut dup);
        assert_eq!(dup, 1);
    }

    #[test]
    fn test_opposing_edge_missing() {
        let tile = build_tile(
            5,
            &[(0.0, 0.0), (0.0, 0.001)],
            &[
                vec![(1, 111.0, true, true)],
                vec![(0, 999.0, true, true)], // wrong length, no match
            ],
        );
        let start = GraphId::new(5, 2, 0);
        let mut dup = 0;
        let (opp, _) = opposing_edge_index(start, tile.directededge(0), &tile, &mut dup);
        assert_eq!(opp, NO_OPPOSING_INDEX);
    }

    #[test]
    fn test_reversed_oneway_sink() {
        // Node 2 has two one-ways pointing at it and nothing leaving: both
        // endpoints are sinks, each incoming edge reports.
        let tile = build_tile(
            5,
            &[(0.0, 0.0), (0.0, 0.002), (0.0, 0.001)],
            &[
                vec![(2, 111.0, true, false)],
                vec![(2, 111.0, true, false)],
                vec![(0, 111.0, false, true), (1, 111.0, false, true)],
            ],
        );
        // The edge 0 -> 2 seen from node 0: node 0 has only outbound, not a
        // sink, so no defect from that side.
        let view = EdgeView {
            tile: &tile,
            node_index: 0,
            local_index: 0,
            edge: tile.directededge(0),
            end_tile: &tile,
        };
        assert_eq!(reversed_oneway(&view), None);

        // Seen from node 2, the reverse-only edge back to node 0: node 2 is
        // a sink and node 0... has outbound, not a sink. Construct the
        // classic broken pair instead: flip node 0's edge to reverse-only.
        let tile = build_tile(
            5,
            &[(0.0, 0.0), (0.0, 0.002), (0.0, 0.001)],
            &[
                vec![(2, 111.0, false, true)],
                vec![(2, 111.0, false, true)],
                vec![(0, 111.0, false, true), (1, 111.0, false, true)],
            ],
        );
        let view = EdgeView {
            tile: &tile,
            node_index: 2,
            local_index: 0,
            edge: tile.directededge(2),
            end_tile: &tile,
        };
        assert_eq!(reversed_oneway(&view), Some(DefectKind::ReversedOneway));
    }

    #[test]
    fn test_pedestrian_terminal() {
        // Node 0: a one-way auto edge plus only pedestrian edges.
        let mut tile = build_tile(
            5,
            &[(0.0, 0.0), (0.0, 0.001), (0.0, 0.002)],
            &[
                vec![(1, 111.0, true, false), (2, 111.0, false, false)],
                vec![(0, 111.0, false, true)],
                vec![(0, 111.0, false, false)],
            ],
        );
        // Make edge (0 -> 2) pedestrian-only (already no auto).
        let view = EdgeView {
            tile: &tile,
            node_index: 0,
            local_index: 0,
            edge: tile.directededge(0),
            end_tile: &tile,
        };
        assert_eq!(pedestrian_terminal(&view), Some(DefectKind::PedestrianTerminal));

        // Add an auto escape: no longer terminal.
        tile.directededges[1].forward_access |= access::AUTO;
        tile.directededges[1].reverse_access |= access::AUTO;
        let view = EdgeView {
            tile: &tile,
            node_index: 0,
            local_index: 0,
            edge: tile.directededge(0),
            end_tile: &tile,
        };
        assert_eq!(pedestrian_terminal(&view), None);
    }

    #[test]
    fn test_loop_terminal() {
        // A self-loop at node 0 where every auto edge is outbound-only.
        let tile = build_tile(
            5,
            &[(0.0, 0.0)],
            &[vec![(0, 111.0, true, false), (0, 111.0, true, false)]],
        );
        let view = EdgeView {
            tile: &tile,
            node_index: 0,
            local_index: 0,
            edge: tile.directededge(0),
            end_tile: &tile,
        };
        assert_eq!(loop_terminal(&view), Some(DefectKind::LoopTerminal));
    }

    #[test]
    fn test_validate_pass_resolves_cross_tile_opposing() {
        let dir = tempfile::tempdir().unwrap();
        let grid = TileGrid::new(0.25);
        let a = grid.tile_index(LatLng::new(0.01, 0.249));
        let b = grid.tile_index(LatLng::new(0.01, 0.251));
        assert_ne!(a, b);

        // Two tiles, one node each, an edge both ways between them.
        let mut tile_a = GraphTile::new(GraphId::new(a, 2, 0));
        tile_a.nodes.push(NodeRecord {
            ll: LatLng::new(0.01, 0.249),
            edge_index: 0,
            edge_count: 1,
            ..Default::default()
        });
        tile_a.directededges.push(DirectedEdgeRecord {
            end_node: GraphId::new(b, 2, 0),
            length: 222.0,
            forward_access: access::AUTO | access::PEDESTRIAN,
            reverse_access: access::AUTO | access::PEDESTRIAN,
            class: RoadClass::Residential,
            edge_info_offset: 0,
            ..Default::default()
        });
        tile_a.edgeinfo.push(EdgeInfoRecord {
            way_id: 77,
            shape: vec![LatLng::new(0.01, 0.249), LatLng::new(0.01, 0.251)],
            name_offsets: vec![],
        });

        let mut tile_b = GraphTile::new(GraphId::new(b, 2, 0));
        tile_b.nodes.push(NodeRecord {
            ll: LatLng::new(0.01, 0.251),
            edge_index: 0,
            edge_count: 1,
            ..Default::default()
        });
        tile_b.directededges.push(DirectedEdgeRecord {
            end_node: GraphId::new(a, 2, 0),
            length: 222.0,
            forward_access: access::AUTO | access::PEDESTRIAN,
            reverse_access: access::AUTO | access::PEDESTRIAN,
            class: RoadClass::Residential,
            edge_info_offset: 0,
            ..Default::default()
        });
        tile_b.edgeinfo.push(EdgeInfoRecord {
            way_id: 77,
            shape: vec![LatLng::new(0.01, 0.251), LatLng::new(0.01, 0.249)],
            name_offsets: vec![],
        });

        tile_a.write(dir.path()).unwrap();
        tile_b.write(dir.path()).unwrap();

        let stats = validate_tiles(dir.path(), &grid, 2, 2).unwrap();
        assert!(stats.roulette_data.is_empty());

        let back_a = GraphTile::read(dir.path(), GraphId::new(a, 2, 0)).unwrap();
        let back_b = GraphTile::read(dir.path(), GraphId::new(b, 2, 0)).unwrap();
        assert_eq!(back_a.directededges[0].opp_index, 0);
        assert_eq!(back_b.directededges[0].opp_index, 0);
        // No admin info, so no country crossing.
        assert!(!back_a.directededges[0].country_crossing);
        // Road length landed in both tiles' stats.
        assert!(stats.tile_lengths.contains_key(&a));
        assert!(stats.tile_lengths.contains_key(&b));
    }
}
