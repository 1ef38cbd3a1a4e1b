//! Runtime configuration
//!
//! Loaded from a JSON file with serde defaults, then optionally overridden by
//! `EMBER_*` environment variables.

use crate::error::{ConfigError, Error, Result};
use crate::pmem::barrier::FlushMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default number of log lanes in a new region
pub const DEFAULT_LOG_LANES: u32 = 16;

/// Default size of one log lane in bytes
pub const DEFAULT_LANE_SIZE: u32 = 16 * 1024;

/// Smallest lane that can hold a begin, one small update and a commit
pub const MIN_LANE_SIZE: u32 = 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding region files and the region table
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Number of concurrent transactions a newly created region supports
    #[serde(default = "default_log_lanes")]
    pub log_lanes: u32,

    /// Bytes of log space per transaction in a newly created region
    #[serde(default = "default_lane_size")]
    pub lane_size: u32,

    /// How stores are made durable
    #[serde(default)]
    pub flush_mode: FlushMode,
}

fn default_dir() -> PathBuf {
    PathBuf::from("ember-regions")
}

fn default_log_lanes() -> u32 {
    DEFAULT_LOG_LANES
}

fn default_lane_size() -> u32 {
    DEFAULT_LANE_SIZE
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            log_lanes: DEFAULT_LOG_LANES,
            lane_size: DEFAULT_LANE_SIZE,
            flush_mode: FlushMode::default(),
        }
    }
}

impl RuntimeConfig {
    /// Configuration rooted at `dir` with every other field defaulted
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Self::default()
        }
    }

    /// Load a JSON configuration file and apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents).map_err(ConfigError::from)?;
        config.with_env_overrides()
    }

    /// Apply `EMBER_DIR`, `EMBER_LOG_LANES`, `EMBER_LANE_SIZE` and
    /// `EMBER_FLUSH_MODE` when they are set
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(dir) = std::env::var("EMBER_DIR") {
            self.dir = PathBuf::from(dir);
        }
        if let Ok(lanes) = std::env::var("EMBER_LOG_LANES") {
            self.log_lanes = lanes
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("EMBER_LOG_LANES={}", lanes)))?;
        }
        if let Ok(size) = std::env::var("EMBER_LANE_SIZE") {
            self.lane_size = size
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("EMBER_LANE_SIZE={}", size)))?;
        }
        if let Ok(mode) = std::env::var("EMBER_FLUSH_MODE") {
            self.flush_mode = mode.parse()?;
        }
        Ok(self)
    }

    /// Check geometry and that the flush mode is usable on this host
    pub fn validate(&self) -> Result<()> {
        if self.log_lanes == 0 {
            return Err(ConfigError::Invalid("log_lanes must be at least 1".into()).into());
        }
        if self.log_lanes > 4096 {
            return Err(ConfigError::Invalid(format!(
                "log_lanes must be at most 4096, got {}",
                self.log_lanes
            ))
            .into());
        }
        if self.lane_size < MIN_LANE_SIZE || self.lane_size % 64 != 0 {
            return Err(Error::Config(ConfigError::Invalid(format!(
                "lane_size must be a multiple of 64 and at least {}, got {}",
                MIN_LANE_SIZE, self.lane_size
            ))));
        }
        self.flush_mode.ensure_supported()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.log_lanes, DEFAULT_LOG_LANES);
        assert_eq!(config.lane_size, DEFAULT_LANE_SIZE);
        assert_eq!(config.flush_mode, FlushMode::Msync);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ember.json");
        fs::write(&path, r#"{ "dir": "/tmp/regions", "log_lanes": 4 }"#)?;

        let config: RuntimeConfig =
            serde_json::from_str(&fs::read_to_string(&path)?).map_err(ConfigError::from)?;
        assert_eq!(config.dir, PathBuf::from("/tmp/regions"));
        assert_eq!(config.log_lanes, 4);
        assert_eq!(config.lane_size, DEFAULT_LANE_SIZE);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_bad_geometry() {
        let config = RuntimeConfig {
            log_lanes: 0,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());

        let config = RuntimeConfig {
            lane_size: 1000,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
