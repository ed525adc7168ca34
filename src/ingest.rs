//! Two streaming passes over the compressed extract.
//!
//! Pass 1 walks ways (and the relations hook), runs the way transform,
//! builds the way table and marks the `shape`/`intersection` bitsets.
//! Pass 2 walks nodes, keeps only those some routable way references, runs
//! the node transform and builds the node map. The element handlers are
//! separate from the PBF reader so tests can drive them directly.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use osmpbf::{Element, ElementReader};
use std::path::Path;

use crate::config::Config;
use crate::geo::LatLng;
use crate::idtable::NodeIdTable;
use crate::osm::{NodeStrings, OsmNode, OsmWay};
use crate::transform::{TagMap, Transform};

/// Everything the splicer and emitter need from the extract. The `shape`
/// bitset is dropped on the way out; `intersections` survives because the
/// splicer keys off it.
pub struct GraphInput {
    pub ways: Vec<OsmWay>,
    pub nodes: BTreeMap<u64, OsmNode>,
    pub strings: NodeStrings,
    pub intersections: NodeIdTable,
    /// Upper bound on the number of spliced edges, for pre-reservation.
    pub estimated_edges: usize,
}

pub struct Ingest<'a> {
    transform: &'a mut dyn Transform,
    shape: NodeIdTable,
    intersections: NodeIdTable,
    ways: Vec<OsmWay>,
    nodes: BTreeMap<u64, OsmNode>,
    strings: NodeStrings,
    estimated_edges: usize,
    estimated_nodes: usize,
    speed_assignment_count: usize,
}

impl<'a> Ingest<'a> {
    pub fn new(max_osm_id: u64, transform: &'a mut dyn Transform) -> Self {
        Self {
            transform,
            shape: NodeIdTable::new(max_osm_id),
            intersections: NodeIdTable::new(max_osm_id),
            ways: Vec::new(),
            nodes: BTreeMap::new(),
            strings: NodeStrings::default(),
            estimated_edges: 0,
            estimated_nodes: 0,
            speed_assignment_count: 0,
        }
    }

    /// Pass 1 way handler.
    pub fn handle_way(&mut self, osm_id: u64, tags: &TagMap, refs: Vec<u64>) -> Result<()> {
        // Degenerate ways cannot form an edge.
        if refs.len() < 2 {
            return Ok(());
        }

        let normalized = self.transform.transform(true, tags);
        if normalized.is_empty() {
            return Ok(());
        }

        // Mark the node ids this way touches. A node seen by a second way
        // becomes an intersection; first and last always are.
        for &r in &refs {
            if self.shape.is_set(r) {
                self.intersections.set(r)?;
                self.estimated_edges += 1;
            } else {
                self.estimated_nodes += 1;
            }
            self.shape.set(r)?;
        }
        self.intersections.set(refs[0])?;
        self.intersections.set(*refs.last().unwrap())?;
        self.estimated_edges += 2;

        let mut way = OsmWay::from_tags(osm_id, refs, &normalized)?;
        if way.apply_default_speed(&normalized)? {
            self.speed_assignment_count += 1;
        }
        self.ways.push(way);
        Ok(())
    }

    /// Relations hook. Restriction parsing will land here; for now the pass
    /// only confirms we can see them.
    pub fn handle_relation(&mut self, _osm_id: u64, _tags: &TagMap) {}

    /// Pass 2 node handler.
    pub fn handle_node(&mut self, osm_id: u64, ll: LatLng, tags: &TagMap) -> Result<()> {
        if !self.shape.is_set(osm_id) {
            return Ok(());
        }

        let normalized = self.transform.transform(false, tags);

        let mut node = OsmNode::new(ll);
        for (key, value) in &normalized {
            match key.as_str() {
                "exit_to" => {
                    node.exit_to = !value.is_empty();
                    if node.exit_to {
                        self.strings.exit_to.insert(osm_id, value.clone());
                    }
                }
                "ref" => {
                    node.ref_ = !value.is_empty();
                    if node.ref_ {
                        self.strings.refs.insert(osm_id, value.clone());
                    }
                }
                "gate" => node.gate = value == "true",
                "bollard" => node.bollard = value == "true",
                "traffic_signal" => node.traffic_signal = value == "true",
                "modes_mask" => {
                    node.modes_mask = value.parse().map_err(|_| {
                        crate::error::FatalError::Transform(format!(
                            "unparseable modes_mask {:?}",
                            value
                        ))
                    })?;
                }
                _ => {}
            }
        }

        self.nodes.insert(osm_id, node);
        if self.nodes.len() % 1_000_000 == 0 {
            println!("  processed {} nodes on ways", self.nodes.len());
        }
        Ok(())
    }

    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    /// How many nodes pass 2 is expected to keep.
    pub fn estimated_nodes(&self) -> usize {
        self.estimated_nodes
    }

    pub fn speed_assignment_percentage(&self) -> f64 {
        if self.ways.is_empty() {
            return 0.0;
        }
        self.speed_assignment_count as f64 / self.ways.len() as f64 * 100.0
    }

    /// Hand over the tables, dropping the `shape` bitset.
    pub fn into_input(self) -> GraphInput {
        GraphInput {
            ways: self.ways,
            nodes: self.nodes,
            strings: self.strings,
            intersections: self.intersections,
            estimated_edges: self.estimated_edges,
        }
    }
}

fn element_tags<'k, I: Iterator<Item = (&'k str, &'k str)>>(iter: I) -> TagMap {
    iter.map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Run both passes over a PBF extract.
pub fn run_ingest(
    input: &Path,
    config: &Config,
    transform: &mut dyn Transform,
) -> Result<GraphInput> {
    let mut ingest = Ingest::new(config.max_osm_id(), transform);

    println!("Pass 1/2: parsing ways and relations to mark nodes needed...");
    let reader = ElementReader::from_path(input)
        .with_context(|| format!("failed to open extract {}", input.display()))?;
    let mut first_error: Option<anyhow::Error> = None;
    reader
        .for_each(|element| {
            if first_error.is_some() {
                return;
            }
            match element {
                Element::Way(way) => {
                    if way.id() < 0 {
                        log::warn!("skipping way with negative id {}", way.id());
                        return;
                    }
                    let refs: Vec<u64> =
                        way.refs().filter(|r| *r >= 0).map(|r| r as u64).collect();
                    let tags = element_tags(way.tags());
                    if let Err(e) = ingest.handle_way(way.id() as u64, &tags, refs) {
                        first_error = Some(e);
                    }
                }
                Element::Relation(relation) => {
                    let tags = element_tags(relation.tags());
                    ingest.handle_relation(relation.id().max(0) as u64, &tags);
                }
                _ => {}
            }
        })
        .context("failed reading ways")?;
    if let Some(e) = first_error {
        return Err(e);
    }
    println!("  ✓ {} routable ways", ingest.way_count());
    println!(
        "  ✓ {:.2}% of ways using class-default speed",
        ingest.speed_assignment_percentage()
    );

    println!(
        "Pass 2/2: parsing nodes, keeping around {}...",
        ingest.estimated_nodes()
    );
    let reader = ElementReader::from_path(input)
        .with_context(|| format!("failed to open extract {}", input.display()))?;
    let mut first_error: Option<anyhow::Error> = None;
    reader
        .for_each(|element| {
            if first_error.is_some() {
                return;
            }
            match element {
                Element::Node(node) => {
                    if node.id() < 0 {
                        return;
                    }
                    let tags = element_tags(node.tags());
                    if let Err(e) = ingest.handle_node(
                        node.id() as u64,
                        LatLng::new(node.lat(), node.lon()),
                        &tags,
                    ) {
                        first_error = Some(e);
                    }
                }
                Element::DenseNode(node) => {
                    if node.id() < 0 {
                        return;
                    }
                    let tags = element_tags(node.tags());
                    if let Err(e) = ingest.handle_node(
                        node.id() as u64,
                        LatLng::new(node.lat(), node.lon()),
                        &tags,
                    ) {
                        first_error = Some(e);
                    }
                }
                _ => {}
            }
        })
        .context("failed reading nodes")?;
    if let Some(e) = first_error {
        return Err(e);
    }

    let input = ingest.into_input();
    println!("  ✓ {} routable nodes", input.nodes.len());
    Ok(input)
}
