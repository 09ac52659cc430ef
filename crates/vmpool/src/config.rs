//! Pool configuration.
//!
//! Layers, later ones winning:
//! 1. Built-in defaults
//! 2. A TOML file, if one is given
//! 3. Environment variables with the `VMPOOL_` prefix (`VMPOOL_MAX_SIZE=20`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;
use crate::instance::HealthPolicy;

/// Hard upper bound on `max_size`.
pub const MAX_POOL_SIZE: usize = 100;

/// Default execution timeout for root scripts.
pub const ROOT_SCRIPT_TIMEOUT: Duration = Duration::from_millis(100);

const MB: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Instances the pool keeps ready or in flight.
    pub min_size: usize,
    /// Ceiling on live plus in-flight instances.
    pub max_size: usize,
    /// Heap ceiling handed to each engine, in bytes.
    pub heap_size_limit: usize,
    /// An instance whose total heap exceeds this is retired on release.
    pub heap_size_release: usize,
    /// An instance with less available heap than this is retired on release.
    pub heap_available_size: usize,
    /// Default execution timeout for user scripts.
    pub context_timeout_ms: u64,
    /// Default acquisition timeout used by the CLI.
    pub select_timeout_ms: u64,
    pub max_concurrent_creations: usize,
    /// Application data root; the `system` filesystem is rooted here.
    pub data_root: PathBuf,
    /// Syntax-check every registered script on each new instance.
    pub precompile: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 10,
            heap_size_limit: 1448 * MB,
            heap_size_release: 50 * MB,
            heap_available_size: 500 * MB,
            context_timeout_ms: 200,
            select_timeout_ms: 1000,
            max_concurrent_creations: 4,
            data_root: PathBuf::from("./data"),
            precompile: false,
        }
    }
}

impl PoolConfig {
    /// Load configuration from defaults, an optional TOML file and the
    /// environment, then normalize it.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(PoolConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("VMPOOL_"));

        let config: PoolConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        Ok(config.validate())
    }

    /// Normalize out-of-range values, warning about each change.
    pub fn validate(mut self) -> Self {
        let (min_size, max_size) = clamp_sizes(self.min_size, self.max_size);
        self.min_size = min_size;
        self.max_size = max_size;

        if self.max_concurrent_creations == 0 {
            warn!("max_concurrent_creations must be at least 1, using 1");
            self.max_concurrent_creations = 1;
        }
        if self.heap_size_limit > 0 && self.heap_size_release > self.heap_size_limit {
            warn!(
                heap_size_release = self.heap_size_release,
                heap_size_limit = self.heap_size_limit,
                "heap_size_release exceeds heap_size_limit; instances will only be retired when exhausted"
            );
        }
        self
    }

    pub fn health_policy(&self) -> HealthPolicy {
        HealthPolicy {
            heap_size_release: self.heap_size_release,
            heap_available_size: self.heap_available_size,
        }
    }

    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }
}

/// Clamp pool bounds: `1 <= max_size <= MAX_POOL_SIZE` and `min_size <= max_size`.
pub fn clamp_sizes(min_size: usize, max_size: usize) -> (usize, usize) {
    let mut max = max_size;
    if max > MAX_POOL_SIZE {
        warn!(requested = max, limit = MAX_POOL_SIZE, "max_size too large, clamping");
        max = MAX_POOL_SIZE;
    }
    if max == 0 {
        warn!("max_size must be at least 1, using 1");
        max = 1;
    }

    let mut min = min_size;
    if min > max {
        warn!(min_size = min, max_size = max, "min_size exceeds max_size, lowering it");
        min = max;
    }
    (min, max)
}
