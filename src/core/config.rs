//! Engine configuration
//!
//! Loaded from JSON; every field has a default so partial files work.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Default pool-resource sizes per heap type, in bytes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSizes {
    pub upload: u64,
    pub readback: u64,
    pub default: u64,
    pub default_with_uav: u64,
    pub acceleration_structure: u64,
    pub custom_with_uav_cpu_access: u64,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            upload: 4 * 1024 * 1024,
            readback: 4 * 1024 * 1024,
            default: 4 * 1024 * 1024,
            default_with_uav: 8000,
            acceleration_structure: 1000 * 256,
            custom_with_uav_cpu_access: 4 * 1024 * 1024,
        }
    }
}

/// Configuration for the capture/replay engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // -----------------------------------------------------------------------
    // Acceleration structures
    // -----------------------------------------------------------------------
    /// Capture acceleration structures as opaque driver blobs instead of build recipes
    pub driver_as_serialisation: bool,
    /// Null AS views in replayed descriptor heaps and log TLAS children
    pub rt_auditing: bool,
    /// Minimum size of the shared AS scratch buffer
    pub min_scratch_size: u64,

    // -----------------------------------------------------------------------
    // Disk cache
    // -----------------------------------------------------------------------
    /// Directory for disk-cache files (system temp dir when unset)
    pub disk_cache_dir: Option<PathBuf>,
    /// Completed build data older than this is spilled to disk
    pub disk_cache_age_ms: u64,
    /// lz4-compress data written to the disk cache
    pub disk_cache_compression: bool,
    /// Bound of the background worker's task channel
    pub worker_queue_capacity: usize,

    // -----------------------------------------------------------------------
    // Allocator
    // -----------------------------------------------------------------------
    pub pool_sizes: PoolSizes,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            driver_as_serialisation: false,
            rt_auditing: false,
            min_scratch_size: 4 * 1024 * 1024,
            disk_cache_dir: None,
            disk_cache_age_ms: 500,
            disk_cache_compression: true,
            worker_queue_capacity: 256,
            pool_sizes: PoolSizes::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a config from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Save to a config file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.worker_queue_capacity == 0 {
            return Err(Error::Config("worker_queue_capacity must be at least 1".into()));
        }
        if self.min_scratch_size == 0 {
            return Err(Error::Config("min_scratch_size must be non-zero".into()));
        }
        Ok(())
    }
}
