//! Build configuration, loaded from a JSON file.

use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::FatalError;

/// The maximum OSM node id the presence bitsets are sized for. Exceeding it
/// aborts the build with instructions to raise the bound.
pub const DEFAULT_MAX_OSM_ID: u64 = 4_000_000_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mjolnir: MjolnirConfig,
    #[serde(default)]
    pub tagtransform: Option<TagTransformConfig>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub max_osm_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MjolnirConfig {
    pub hierarchy: HierarchyConfig,
    #[serde(default)]
    pub transit_dir: Option<PathBuf>,
    #[serde(default)]
    pub statistics: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HierarchyConfig {
    pub tile_dir: PathBuf,
    pub levels: Vec<LevelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LevelConfig {
    pub level: u8,
    pub tiles: TileSizeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TileSizeConfig {
    pub size: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagTransformConfig {
    #[serde(default)]
    pub way_script: Option<PathBuf>,
    #[serde(default)]
    pub way_function: Option<String>,
    #[serde(default)]
    pub node_script: Option<PathBuf>,
    #[serde(default)]
    pub node_function: Option<String>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.mjolnir.hierarchy.levels.is_empty() {
            return Err(
                FatalError::Config("mjolnir.hierarchy.levels must not be empty".into()).into(),
            );
        }
        for level in &self.mjolnir.hierarchy.levels {
            if level.tiles.size <= 0.0 {
                return Err(FatalError::Config(format!(
                    "level {} tile size must be positive",
                    level.level
                ))
                .into());
            }
        }
        if let Some(tt) = &self.tagtransform {
            for script in [&tt.way_script, &tt.node_script].into_iter().flatten() {
                if !script.is_file() {
                    return Err(FatalError::Config(format!(
                        "tagtransform script {} does not exist",
                        script.display()
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// The finest configured level, the only one this builder emits.
    pub fn local_level(&self) -> &LevelConfig {
        self.mjolnir
            .hierarchy
            .levels
            .last()
            .expect("validated non-empty")
    }

    pub fn tile_dir(&self) -> &Path {
        &self.mjolnir.hierarchy.tile_dir
    }

    pub fn max_osm_id(&self) -> u64 {
        self.max_osm_id.unwrap_or(DEFAULT_MAX_OSM_ID)
    }

    /// Worker count: configured value clamped to hardware concurrency.
    pub fn concurrency(&self) -> usize {
        let hardware = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        match self.concurrency {
            Some(n) if n > 0 => n.min(hardware),
            _ => hardware,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_config() {
        let f = write_config(
            r#"{
                "mjolnir": {
                    "hierarchy": {
                        "tile_dir": "/tmp/tiles",
                        "levels": [
                            {"level": 0, "tiles": {"size": 4.0}},
                            {"level": 2, "tiles": {"size": 0.25}}
                        ]
                    }
                }
            }"#,
        );
        let cfg = Config::from_file(f.path()).unwrap();
        assert_eq!(cfg.local_level().level, 2);
        assert_eq!(cfg.local_level().tiles.size, 0.25);
        assert_eq!(cfg.max_osm_id(), DEFAULT_MAX_OSM_ID);
        assert!(cfg.mjolnir.transit_dir.is_none());
        assert!(cfg.concurrency() >= 1);
    }

    #[test]
    fn test_missing_tile_dir_is_fatal() {
        let f = write_config(r#"{"mjolnir": {"hierarchy": {"levels": []}}}"#);
        assert!(Config::from_file(f.path()).is_err());
    }

    #[test]
    fn test_empty_levels_is_fatal() {
        let f = write_config(
            r#"{"mjolnir": {"hierarchy": {"tile_dir": "/tmp/t", "levels": []}}}"#,
        );
        assert!(Config::from_file(f.path()).is_err());
    }

    #[test]
    fn test_missing_transform_script_is_fatal() {
        let f = write_config(
            r#"{
                "mjolnir": {"hierarchy": {"tile_dir": "/tmp/t",
                    "levels": [{"level": 0, "tiles": {"size": 1.0}}]}},
                "tagtransform": {"way_script": "/nonexistent/way.lua"}
            }"#,
        );
        assert!(Config::from_file(f.path()).is_err());
    }

    #[test]
    fn test_concurrency_clamped() {
        let f = write_config(
            r#"{
                "mjolnir": {"hierarchy": {"tile_dir": "/tmp/t",
                    "levels": [{"level": 0, "tiles": {"size": 1.0}}]}},
                "concurrency": 100000
            }"#,
        );
        let cfg = Config::from_file(f.path()).unwrap();
        assert!(cfg.concurrency() <= 100000);
        assert!(cfg.concurrency() >= 1);
    }
}
