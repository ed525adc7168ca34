//! Aggregated validation statistics and the defect task list.
//!
//! Each validation worker accumulates its own `ValidatorStats` and the
//! coordinator merges them after the join. Totals are keyed per tile and per
//! country ISO code, split by road class. The defect ("roulette") list
//! collects places a human should look at, deduplicated by way id, and is
//! persisted as a JSON task list.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::geo::LatLng;
use crate::osm::RoadClass;
use crate::tiles::TileBounds;

pub type ClassLengths = BTreeMap<RoadClass, f64>;
pub type ClassCounts = BTreeMap<RoadClass, u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectKind {
    PedestrianTerminal,
    LoopTerminal,
    ReversedOneway,
}

#[derive(Debug, Clone, Serialize)]
pub struct DefectTask {
    pub kind: DefectKind,
    pub lat: f64,
    pub lng: f64,
    pub way_id: u64,
    pub shape: Vec<LatLng>,
}

/// Candidate locations for manual review, one per way.
#[derive(Debug, Default)]
pub struct RouletteData {
    tasks: Vec<DefectTask>,
    way_ids: HashSet<u64>,
}

impl RouletteData {
    pub fn add_task(&mut self, kind: DefectKind, ll: LatLng, way_id: u64, shape: &[LatLng]) {
        if self.way_ids.insert(way_id) {
            self.tasks.push(DefectTask {
                kind,
                lat: ll.lat,
                lng: ll.lng,
                way_id,
                shape: shape.to_vec(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn merge(&mut self, other: RouletteData) {
        for task in other.tasks {
            if self.way_ids.insert(task.way_id) {
                self.tasks.push(task);
            }
        }
    }

    /// Persist the task list as JSON for the map-review tooling.
    pub fn write_tasks(&self, path: &Path) -> Result<()> {
        let mut tasks = self.tasks.clone();
        tasks.sort_by_key(|t| t.way_id);
        let text = serde_json::to_string_pretty(&tasks)?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write defect tasks {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ValidatorStats {
    pub tile_ids: BTreeSet<u32>,
    pub iso_codes: BTreeSet<String>,

    pub tile_lengths: BTreeMap<u32, ClassLengths>,
    pub country_lengths: BTreeMap<String, ClassLengths>,
    pub tile_one_way: BTreeMap<u32, ClassLengths>,
    pub country_one_way: BTreeMap<String, ClassLengths>,
    pub tile_speed_info: BTreeMap<u32, ClassLengths>,
    pub country_speed_info: BTreeMap<String, ClassLengths>,
    pub tile_named: BTreeMap<u32, ClassLengths>,
    pub country_named: BTreeMap<String, ClassLengths>,
    pub tile_int_edges: BTreeMap<u32, ClassCounts>,
    pub country_int_edges: BTreeMap<String, ClassCounts>,

    pub tile_truck_route: BTreeMap<u32, ClassLengths>,
    pub country_truck_route: BTreeMap<String, ClassLengths>,
    pub tile_hazmat: BTreeMap<u32, ClassCounts>,
    pub country_hazmat: BTreeMap<String, ClassCounts>,
    pub tile_truck_restricted: BTreeMap<u32, ClassCounts>,
    pub country_truck_restricted: BTreeMap<String, ClassCounts>,

    pub tile_areas: BTreeMap<u32, f64>,
    pub tile_geometries: BTreeMap<u32, TileBounds>,
    /// Duplicate opposing-edge counts, per level.
    pub dup_counts: BTreeMap<u8, Vec<u32>>,
    /// Tile densities (road km per km^2), per level.
    pub densities: BTreeMap<u8, Vec<f32>>,

    pub roulette_data: RouletteData,
}

impl ValidatorStats {
    pub fn add_tile_road(&mut self, tile_id: u32, rclass: RoadClass, length: f64) {
        self.tile_ids.insert(tile_id);
        *self
            .tile_lengths
            .entry(tile_id)
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_country_road(&mut self, iso: &str, rclass: RoadClass, length: f64) {
        if iso.is_empty() {
            return;
        }
        self.iso_codes.insert(iso.to_string());
        *self
            .country_lengths
            .entry(iso.to_string())
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_tile_one_way(&mut self, tile_id: u32, rclass: RoadClass, length: f64) {
        *self
            .tile_one_way
            .entry(tile_id)
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_country_one_way(&mut self, iso: &str, rclass: RoadClass, length: f64) {
        if iso.is_empty() {
            return;
        }
        *self
            .country_one_way
            .entry(iso.to_string())
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_tile_speed_info(&mut self, tile_id: u32, rclass: RoadClass, length: f64) {
        *self
            .tile_speed_info
            .entry(tile_id)
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_country_speed_info(&mut self, iso: &str, rclass: RoadClass, length: f64) {
        if iso.is_empty() {
            return;
        }
        *self
            .country_speed_info
            .entry(iso.to_string())
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_tile_named(&mut self, tile_id: u32, rclass: RoadClass, length: f64) {
        *self
            .tile_named
            .entry(tile_id)
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_country_named(&mut self, iso: &str, rclass: RoadClass, length: f64) {
        if iso.is_empty() {
            return;
        }
        *self
            .country_named
            .entry(iso.to_string())
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_tile_int_edge(&mut self, tile_id: u32, rclass: RoadClass) {
        *self
            .tile_int_edges
            .entry(tile_id)
            .or_default()
            .entry(rclass)
            .or_default() += 1;
    }

    pub fn add_country_int_edge(&mut self, iso: &str, rclass: RoadClass) {
        if iso.is_empty() {
            return;
        }
        *self
            .country_int_edges
            .entry(iso.to_string())
            .or_default()
            .entry(rclass)
            .or_default() += 1;
    }

    pub fn add_tile_truck_route(&mut self, tile_id: u32, rclass: RoadClass, length: f64) {
        *self
            .tile_truck_route
            .entry(tile_id)
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_country_truck_route(&mut self, iso: &str, rclass: RoadClass, length: f64) {
        if iso.is_empty() {
            return;
        }
        *self
            .country_truck_route
            .entry(iso.to_string())
            .or_default()
            .entry(rclass)
            .or_default() += length;
    }

    pub fn add_tile_hazmat(&mut self, tile_id: u32, rclass: RoadClass) {
        *self
            .tile_hazmat
            .entry(tile_id)
            .or_default()
            .entry(rclass)
            .or_default() += 1;
    }

    pub fn add_country_hazmat(&mut self, iso: &str, rclass: RoadClass) {
        if iso.is_empty() {
            return;
        }
        *self
            .country_hazmat
            .entry(iso.to_string())
            .or_default()
            .entry(rclass)
            .or_default() += 1;
    }

    pub fn add_tile_truck_restricted(&mut self, tile_id: u32, rclass: RoadClass) {
        *self
            .tile_truck_restricted
            .entry(tile_id)
            .or_default()
            .entry(rclass)
            .or_default() += 1;
    }

    pub fn add_country_truck_restricted(&mut self, iso: &str, rclass: RoadClass) {
        if iso.is_empty() {
            return;
        }
        *self
            .country_truck_restricted
            .entry(iso.to_string())
            .or_default()
            .entry(rclass)
            .or_default() += 1;
    }

    pub fn add_tile_area(&mut self, tile_id: u32, area: f64) {
        self.tile_areas.insert(tile_id, area);
    }

    pub fn add_tile_geom(&mut self, tile_id: u32, bounds: TileBounds) {
        self.tile_geometries.insert(tile_id, bounds);
    }

    pub fn add_density(&mut self, density: f32, level: u8) {
        self.densities.entry(level).or_default().push(density);
    }

    pub fn add_dup(&mut self, count: u32, level: u8) {
        self.dup_counts.entry(level).or_default().push(count);
    }

    pub fn merge(&mut self, other: ValidatorStats) {
        fn merge_lengths<K: Ord + Clone>(
            into: &mut BTreeMap<K, ClassLengths>,
            from: BTreeMap<K, ClassLengths>,
        ) {
            for (k, classes) in from {
                let entry = into.entry(k).or_default();
                for (rc, len) in classes {
                    *entry.entry(rc).or_default() += len;
                }
            }
        }
        fn merge_counts<K: Ord + Clone>(
            into: &mut BTreeMap<K, ClassCounts>,
            from: BTreeMap<K, ClassCounts>,
        ) {
            for (k, classes) in from {
                let entry = into.entry(k).or_default();
                for (rc, n) in classes {
                    *entry.entry(rc).or_default() += n;
                }
            }
        }

        self.tile_ids.extend(other.tile_ids);
        self.iso_codes.extend(other.iso_codes);
        merge_lengths(&mut self.tile_lengths, other.tile_lengths);
        merge_lengths(&mut self.country_lengths, other.country_lengths);
        merge_lengths(&mut self.tile_one_way, other.tile_one_way);
        merge_lengths(&mut self.country_one_way, other.country_one_way);
        merge_lengths(&mut self.tile_speed_info, other.tile_speed_info);
        merge_lengths(&mut self.country_speed_info, other.country_speed_info);
        merge_lengths(&mut self.tile_named, other.tile_named);
        merge_lengths(&mut self.country_named, other.country_named);
        merge_counts(&mut self.tile_int_edges, other.tile_int_edges);
        merge_counts(&mut self.country_int_edges, other.country_int_edges);
        merge_lengths(&mut self.tile_truck_route, other.tile_truck_route);
        merge_lengths(&mut self.country_truck_route, other.country_truck_route);
        merge_counts(&mut self.tile_hazmat, other.tile_hazmat);
        merge_counts(&mut self.country_hazmat, other.country_hazmat);
        merge_counts(&mut self.tile_truck_restricted, other.tile_truck_restricted);
        merge_counts(
            &mut self.country_truck_restricted,
            other.country_truck_restricted,
        );
        self.tile_areas.extend(other.tile_areas);
        self.tile_geometries.extend(other.tile_geometries);
        for (level, mut v) in other.dup_counts {
            self.dup_counts.entry(level).or_default().append(&mut v);
        }
        for (level, mut v) in other.densities {
            self.densities.entry(level).or_default().append(&mut v);
        }
        self.roulette_data.merge(other.roulette_data);
    }
}

/// Sink for the aggregated statistics. The production implementation is the
/// SpatiaLite database writer (tables `tiledata`, `rclasstiledata`,
/// `truckrclasstiledata`, `countrydata`, `rclassctrydata`,
/// `truckrclassctrydata`; `tiledata.geom` a POLYGON in SRID 4326 with a
/// spatial index), which lives outside this crate. The shipped
/// [`JsonSummaryWriter`] mirrors the same tables into a JSON document next
/// to the configured database path.
pub trait StatisticsWriter {
    fn write(&mut self, stats: &ValidatorStats) -> Result<()>;
}

pub struct JsonSummaryWriter {
    path: std::path::PathBuf,
}

impl JsonSummaryWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.with_extension("json"),
        }
    }
}

#[derive(Serialize)]
struct TileRow<'a> {
    tileid: u32,
    tilearea: f64,
    totalroadlen: f64,
    geom: Option<&'a TileBounds>,
}

#[derive(Serialize)]
struct ClassRow<'a> {
    key: String,
    class: &'a str,
    length_km: f64,
    one_way_km: f64,
    maxspeed_km: f64,
    named_km: f64,
    internal_count: u32,
}

impl StatisticsWriter for JsonSummaryWriter {
    fn write(&mut self, stats: &ValidatorStats) -> Result<()> {
        let tiledata: Vec<TileRow> = stats
            .tile_ids
            .iter()
            .map(|&tileid| TileRow {
                tileid,
                tilearea: stats.tile_areas.get(&tileid).copied().unwrap_or(0.0),
                totalroadlen: stats
                    .tile_lengths
                    .get(&tileid)
                    .map(|classes| classes.values().sum())
                    .unwrap_or(0.0),
                geom: stats.tile_geometries.get(&tileid),
            })
            .collect();

        fn class_rows<K: Ord + ToString>(
            lengths: &BTreeMap<K, ClassLengths>,
            one_way: &BTreeMap<K, ClassLengths>,
            speed: &BTreeMap<K, ClassLengths>,
            named: &BTreeMap<K, ClassLengths>,
            internal: &BTreeMap<K, ClassCounts>,
        ) -> Vec<ClassRow<'static>> {
            let mut rows = Vec::new();
            for (key, classes) in lengths {
                for rc in RoadClass::ALL {
                    let get = |m: &BTreeMap<K, ClassLengths>| {
                        m.get(key).and_then(|c| c.get(&rc)).copied().unwrap_or(0.0)
                    };
                    let length_km = classes.get(&rc).copied().unwrap_or(0.0);
                    if length_km == 0.0 {
                        continue;
                    }
                    rows.push(ClassRow {
                        key: key.to_string(),
                        class: rc.name(),
                        length_km,
                        one_way_km: get(one_way),
                        maxspeed_km: get(speed),
                        named_km: get(named),
                        internal_count: internal
                            .get(key)
                            .and_then(|c| c.get(&rc))
                            .copied()
                            .unwrap_or(0),
                    });
                }
            }
            rows
        }

        let summary = serde_json::json!({
            "tiledata": tiledata,
            "rclasstiledata": class_rows(
                &stats.tile_lengths,
                &stats.tile_one_way,
                &stats.tile_speed_info,
                &stats.tile_named,
                &stats.tile_int_edges,
            ),
            "rclassctrydata": class_rows(
                &stats.country_lengths,
                &stats.country_one_way,
                &stats.country_speed_info,
                &stats.country_named,
                &stats.country_int_edges,
            ),
            "truckrclasstiledata": class_rows(
                &stats.tile_truck_route,
                &stats.tile_one_way,
                &stats.tile_speed_info,
                &stats.tile_named,
                &stats.tile_truck_restricted,
            ),
            "truckrclassctrydata": class_rows(
                &stats.country_truck_route,
                &stats.country_one_way,
                &stats.country_speed_info,
                &stats.country_named,
                &stats.country_truck_restricted,
            ),
            "countrydata": stats.iso_codes,
        });

        let text = serde_json::to_string_pretty(&summary)?;
        std::fs::write(&self.path, text)
            .with_context(|| format!("failed to write statistics {}", self.path.display()))?;
        Ok(())
    }
}
