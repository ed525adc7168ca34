//! Fixed-pitch lat/lng tiling of the globe.
//!
//! Tiles are square cells of `tile_size` degrees covering (-90,-180) to
//! (90,180), numbered row-major from the south-west corner. The grid exists
//! per hierarchy level; this builder only emits the finest configured level.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::geo::LatLng;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TileBounds {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl TileBounds {
    pub fn contains(&self, ll: LatLng) -> bool {
        ll.lat >= self.min_lat
            && ll.lat <= self.max_lat
            && ll.lng >= self.min_lng
            && ll.lng <= self.max_lng
    }

    pub fn center(&self) -> LatLng {
        LatLng::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }
}

#[derive(Debug, Clone)]
pub struct TileGrid {
    tile_size: f64,
    ncols: u32,
    nrows: u32,
}

impl TileGrid {
    pub fn new(tile_size: f64) -> Self {
        let ncols = (360.0 / tile_size).ceil() as u32;
        let nrows = (180.0 / tile_size).ceil() as u32;
        Self {
            tile_size,
            ncols,
            nrows,
        }
    }

    pub fn tile_size(&self) -> f64 {
        self.tile_size
    }

    pub fn tile_count(&self) -> u32 {
        self.ncols * self.nrows
    }

    /// Tile index for a coordinate, clamped to the grid.
    pub fn tile_index(&self, ll: LatLng) -> u32 {
        let col = (((ll.lng + 180.0) / self.tile_size) as i64).clamp(0, self.ncols as i64 - 1);
        let row = (((ll.lat + 90.0) / self.tile_size) as i64).clamp(0, self.nrows as i64 - 1);
        row as u32 * self.ncols + col as u32
    }

    pub fn bounds(&self, tile_index: u32) -> TileBounds {
        let row = tile_index / self.ncols;
        let col = tile_index % self.ncols;
        let min_lng = -180.0 + col as f64 * self.tile_size;
        let min_lat = -90.0 + row as f64 * self.tile_size;
        TileBounds {
            min_lat,
            min_lng,
            max_lat: (min_lat + self.tile_size).min(90.0),
            max_lng: (min_lng + self.tile_size).min(180.0),
        }
    }

    /// Approximate tile area in square kilometers.
    pub fn area_km2(&self, tile_index: u32) -> f64 {
        let bb = self.bounds(tile_index);
        let km_per_deg_lat = 110.567;
        let km_per_deg_lng = 111.321 * bb.center().lat.to_radians().cos();
        (bb.max_lat - bb.min_lat) * km_per_deg_lat * (bb.max_lng - bb.min_lng) * km_per_deg_lng
    }
}

/// Path of a tile file inside the output directory: `<level>/<tileid>.gph`.
pub fn tile_path(tile_dir: &Path, level: u8, tile_index: u32) -> PathBuf {
    tile_dir.join(level.to_string()).join(format!("{}.gph", tile_index))
}

pub fn tile_exists(tile_dir: &Path, level: u8, tile_index: u32) -> bool {
    tile_path(tile_dir, level, tile_index).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dimensions() {
        let grid = TileGrid::new(4.0);
        assert_eq!(grid.tile_count(), 90 * 45);
        let grid = TileGrid::new(0.25);
        assert_eq!(grid.tile_count(), 1440 * 720);
    }

    #[test]
    fn test_containment() {
        let grid = TileGrid::new(0.25);
        // Brussels
        let ll = LatLng::new(50.8503, 4.3517);
        let id = grid.tile_index(ll);
        assert!(grid.bounds(id).contains(ll));
        // Antipodal-ish corner cases
        for ll in [
            LatLng::new(-90.0, -180.0),
            LatLng::new(89.99, 179.99),
            LatLng::new(0.0, 0.0),
        ] {
            let id = grid.tile_index(ll);
            assert!(id < grid.tile_count());
            assert!(grid.bounds(id).contains(ll));
        }
    }

    #[test]
    fn test_neighbors_differ() {
        let grid = TileGrid::new(1.0);
        let a = grid.tile_index(LatLng::new(0.5, 0.5));
        let b = grid.tile_index(LatLng::new(0.5, 1.5));
        let c = grid.tile_index(LatLng::new(1.5, 0.5));
        assert_eq!(b, a + 1);
        assert_eq!(c, a + 360);
    }

    #[test]
    fn test_tile_path_layout() {
        let p = tile_path(Path::new("/tiles"), 2, 12345);
        assert_eq!(p, PathBuf::from("/tiles/2/12345.gph"));
    }
}
