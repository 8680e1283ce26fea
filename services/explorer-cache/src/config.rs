//! Configuration for the cache engine
//!
//! Every section has working defaults; a full configuration can also be
//! loaded from JSON, with missing fields falling back to those defaults.

use std::time::Duration;

use explorer_types::errors::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};

/// Facet behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacetConfig {
    /// Interval between progress heartbeats while a fetch runs.
    pub heartbeat_interval_ms: u64,
    /// Items after which the first progress event fires (one UI page).
    pub progress_first_page: usize,
    /// Items between subsequent progress events.
    pub progress_every: usize,
}

impl Default for FacetConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            progress_first_page: 15,
            progress_every: 100,
        }
    }
}

impl FacetConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }
}

/// Chart grid geometry and resource ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Blocks per bucket.
    pub bucket_size: u64,
    /// Buckets per grid row.
    pub columns: usize,
    /// Largest grid a single series may grow to.
    pub max_buckets: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            bucket_size: 100_000,
            columns: 20,
            max_buckets: 1 << 20,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub facet: FacetConfig,
    pub buckets: BucketConfig,
}

impl CacheConfig {
    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> CacheResult<Self> {
        let config: CacheConfig = serde_json::from_str(json).map_err(|e| CacheError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.buckets.bucket_size == 0 {
            return Err(CacheError::InvalidBucketSize);
        }
        if self.buckets.columns == 0 {
            return Err(CacheError::Config {
                message: "buckets.columns must be greater than zero".to_string(),
            });
        }
        if self.facet.progress_every == 0 {
            return Err(CacheError::Config {
                message: "facet.progress_every must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
