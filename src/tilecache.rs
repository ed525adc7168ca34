//! On-demand tile loading with a bounded per-worker cache.
//!
//! Validation and transit splicing follow end-node graph ids into other
//! tiles. Each worker keeps its own cache of read-only snapshots; when the
//! committed byte estimate crosses the limit the cache is simply cleared.
//! Callers hand out `Arc` snapshots, so a concurrent writeback of the
//! underlying file never mutates a tile a reader is holding.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use crate::formats::GraphTile;
use crate::graphid::GraphId;
use crate::tiles::tile_path;

/// Default cache budget per worker.
const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024;

pub struct TileCache {
    tile_dir: PathBuf,
    max_bytes: u64,
    committed: u64,
    tiles: HashMap<u64, Arc<GraphTile>>,
}

impl TileCache {
    pub fn new(tile_dir: PathBuf) -> Self {
        Self::with_capacity(tile_dir, DEFAULT_MAX_BYTES)
    }

    pub fn with_capacity(tile_dir: PathBuf, max_bytes: u64) -> Self {
        Self {
            tile_dir,
            max_bytes,
            committed: 0,
            tiles: HashMap::new(),
        }
    }

    /// Snapshot of the tile containing `id`, loading it if necessary.
    pub fn get(&mut self, id: GraphId) -> Result<Arc<GraphTile>> {
        let key = id.tile_base().value();
        if let Some(tile) = self.tiles.get(&key) {
            return Ok(Arc::clone(tile));
        }

        let path = tile_path(&self.tile_dir, id.level(), id.tile());
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let tile = Arc::new(GraphTile::read_path(&path)?);
        self.committed += size;
        self.tiles.insert(key, Arc::clone(&tile));
        Ok(tile)
    }

    pub fn exists(&self, id: GraphId) -> bool {
        self.tiles.contains_key(&id.tile_base().value())
            || tile_path(&self.tile_dir, id.level(), id.tile()).is_file()
    }

    /// Drop a cached snapshot, e.g. after the tile file was rewritten.
    pub fn invalidate(&mut self, id: GraphId) {
        self.tiles.remove(&id.tile_base().value());
    }

    pub fn over_committed(&self) -> bool {
        self.committed > self.max_bytes
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
        self.committed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{DirectedEdgeRecord, NodeRecord};
    use crate::geo::LatLng;

    fn write_tile(dir: &std::path::Path, tile: u32) {
        let mut t = GraphTile::new(GraphId::new(tile, 2, 0));
        t.nodes.push(NodeRecord {
            ll: LatLng::new(0.0, 0.0),
            edge_count: 1,
            ..Default::default()
        });
        t.directededges.push(DirectedEdgeRecord::default());
        t.write(dir).unwrap();
    }

    #[test]
    fn test_load_and_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        write_tile(dir.path(), 7);

        let mut cache = TileCache::new(dir.path().to_path_buf());
        let id = GraphId::new(7, 2, 0);
        assert!(cache.exists(id));
        let a = cache.get(id).unwrap();
        let b = cache.get(id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.header.node_count, 1);
    }

    #[test]
    fn test_snapshot_survives_invalidation() {
        let dir = tempfile::tempdir().unwrap();
        write_tile(dir.path(), 7);

        let mut cache = TileCache::new(dir.path().to_path_buf());
        let id = GraphId::new(7, 2, 0);
        let snapshot = cache.get(id).unwrap();
        cache.invalidate(id);
        // The held snapshot is unaffected; the next get re-reads.
        assert_eq!(snapshot.header.node_count, 1);
        let again = cache.get(id).unwrap();
        assert!(!Arc::ptr_eq(&snapshot, &again));
    }

    #[test]
    fn test_over_commit_clears() {
        let dir = tempfile::tempdir().unwrap();
        write_tile(dir.path(), 1);
        write_tile(dir.path(), 2);

        let mut cache = TileCache::with_capacity(dir.path().to_path_buf(), 1);
        cache.get(GraphId::new(1, 2, 0)).unwrap();
        cache.get(GraphId::new(2, 2, 0)).unwrap();
        assert!(cache.over_committed());
        cache.clear();
        assert!(!cache.over_committed());
    }

    #[test]
    fn test_missing_tile_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = TileCache::new(dir.path().to_path_buf());
        assert!(cache.get(GraphId::new(99, 2, 0)).is_err());
        assert!(!cache.exists(GraphId::new(99, 2, 0)));
    }
}
