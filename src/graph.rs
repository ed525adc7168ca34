//! Way splicing, per-node edge ordering and node tiling.
//!
//! Ways become edges by splitting at intersection nodes; every surviving
//! node then sorts its outbound edge list (driveable first, then by
//! importance) and is assigned a graph id on the local tile grid. The edge
//! order is a public invariant: downstream records reference edges by their
//! position in this list.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::geo::LatLng;
use crate::graphid::GraphId;
use crate::idtable::NodeIdTable;
use crate::osm::{OsmNode, OsmWay, RoadClass};
use crate::tiles::TileGrid;

/// Attributes the splicer lifts off the way so the no-through search and the
/// sorter never chase the way table.
#[derive(Debug, Clone, Copy)]
pub struct EdgeAttributes {
    pub driveable_forward: bool,
    pub driveable_reverse: bool,
    pub importance: RoadClass,
    pub link: bool,
    pub ferry: bool,
}

/// A spliced segment of a way between two graph nodes, with its inline
/// shape. Directed-edge records are derived from these at emission.
#[derive(Debug, Clone)]
pub struct Edge {
    pub source_node: u64,
    pub target_node: u64,
    pub way_index: u32,
    pub shape: Vec<LatLng>,
    pub attributes: EdgeAttributes,
}

impl Edge {
    fn start(source_node: u64, way_index: u32, ll: LatLng, way: &OsmWay) -> Edge {
        Edge {
            source_node,
            target_node: 0,
            way_index,
            shape: vec![ll],
            attributes: EdgeAttributes {
                driveable_forward: way.auto_forward,
                driveable_reverse: way.auto_backward,
                importance: way.road_class,
                link: way.link,
                ferry: way.ferry,
            },
        }
    }

    /// The node at the other end, seen from `node`.
    pub fn opposite(&self, node: u64) -> u64 {
        if self.source_node == node {
            self.target_node
        } else {
            self.source_node
        }
    }
}

/// Walk every way and close an edge at each intersection node. Both
/// endpoints get the edge index appended to their outbound lists.
pub fn construct_edges(
    ways: &[OsmWay],
    nodes: &mut BTreeMap<u64, OsmNode>,
    intersections: &NodeIdTable,
    estimated_edges: usize,
) -> Vec<Edge> {
    let mut edges: Vec<Edge> = Vec::with_capacity(estimated_edges);

    for (way_index, way) in ways.iter().enumerate() {
        let way_index = way_index as u32;

        let first = way.nodes[0];
        let Some(node) = nodes.get_mut(&first) else {
            log::error!("way {} references unknown node {}", way.osm_id, first);
            continue;
        };
        let mut edge = Edge::start(first, way_index, node.ll, way);
        node.add_edge(edges.len() as u32);

        let last_pos = way.nodes.len() - 1;
        for (i, &node_id) in way.nodes.iter().enumerate().skip(1) {
            let Some(nd) = nodes.get_mut(&node_id) else {
                log::error!("way {} references unknown node {}", way.osm_id, node_id);
                continue;
            };
            edge.shape.push(nd.ll);

            // An intersection (or the way end, which is always marked) closes
            // the current edge.
            if intersections.is_set(node_id) {
                edge.target_node = node_id;
                nd.add_edge(edges.len() as u32);
                let closed = std::mem::replace(&mut edge, Edge::start(node_id, way_index, nd.ll, way));
                edges.push(closed);

                // Start a new edge unless this was the way's last node; the
                // replacement above is dropped in that case.
                if i < last_pos {
                    nd.add_edge(edges.len() as u32);
                }
            }
        }
    }

    edges
}

/// Comparator for a node's outbound edges: driveable (in the direction away
/// from the node) before non-driveable, then ascending importance.
fn edge_order(node_id: u64, a: &Edge, b: &Edge) -> Ordering {
    let a_forward = a.source_node == node_id;
    let b_forward = b.source_node == node_id;
    let a_drive = if a_forward {
        a.attributes.driveable_forward
    } else {
        a.attributes.driveable_reverse
    };
    let b_drive = if b_forward {
        b.attributes.driveable_forward
    } else {
        b.attributes.driveable_reverse
    };

    match (a_drive, b_drive) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.attributes.importance.cmp(&b.attributes.importance),
    }
}

/// Sort each node's edge list. Stable, so equal edges keep splice order.
pub fn sort_edges_from_nodes(nodes: &mut BTreeMap<u64, OsmNode>, edges: &[Edge]) {
    for (&node_id, node) in nodes.iter_mut() {
        node.edges
            .sort_by(|&e1, &e2| edge_order(node_id, &edges[e1 as usize], &edges[e2 as usize]));
    }
}

/// Assign every node with at least one edge to a tile and give it its graph
/// id `(tile, level, position)`. Returns the per-tile node lists in tile
/// order; within a tile, nodes appear in ascending OSM id order, which makes
/// re-emission deterministic.
pub fn tile_nodes(
    nodes: &mut BTreeMap<u64, OsmNode>,
    grid: &TileGrid,
    level: u8,
) -> BTreeMap<u32, Vec<u64>> {
    let mut tiled: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
    for (&osm_id, node) in nodes.iter_mut() {
        if node.edge_count() == 0 {
            continue;
        }
        let tile_index = grid.tile_index(node.ll);
        let list = tiled.entry(tile_index).or_default();
        node.graphid = GraphId::new(tile_index, level, list.len() as u32);
        list.push(osm_id);
    }
    tiled
}
