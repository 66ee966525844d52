//! Runtime configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub store: StoreConfig,
    pub routing: RoutingConfig,
    pub recovery: RecoveryConfig,
    pub health: HealthConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Max cached query results before LRU eviction.
    pub cache_capacity: usize,
    /// Time-to-live of a cached query result.
    pub cache_ttl_ms: u64,
    /// Default bound on a single query or update.
    pub query_timeout_ms: u64,
    /// Append-only update log for the in-process store. None = memory only.
    pub log_path: Option<PathBuf>,
}

/// Selection strategy names accepted in config.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    #[default]
    RoundRobin,
    PerformanceBased,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub default_strategy: StrategyName,
    /// Deadline for one dispatch to one agent.
    pub dispatch_timeout_ms: u64,
    /// Bounded mailbox depth per agent.
    pub mailbox_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub timeout_max_attempts: u32,
    pub resource_exhaustion_max_attempts: u32,
    pub communication_max_attempts: u32,
    pub state_corruption_max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the exponential delay added as random jitter (0.0 - 1.0).
    pub jitter_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub sample_interval_ms: u64,
    /// Error rate above which an agent is reported degraded.
    pub degraded_error_rate: f64,
    /// Latency EMA above which an agent is reported degraded.
    pub degraded_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub default_concurrency: usize,
    pub step_timeout_ms: u64,
    /// Where definitions and run snapshots are persisted. None = memory only.
    pub state_dir: Option<PathBuf>,
}

// ============================================================
// Defaults
// ============================================================

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            routing: RoutingConfig::default(),
            recovery: RecoveryConfig::default(),
            health: HealthConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            cache_ttl_ms: 30_000,
            query_timeout_ms: 5_000,
            log_path: None,
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_strategy: StrategyName::RoundRobin,
            dispatch_timeout_ms: 30_000,
            mailbox_depth: 64,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            timeout_max_attempts: 3,
            resource_exhaustion_max_attempts: 3,
            communication_max_attempts: 3,
            state_corruption_max_attempts: 2,
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            jitter_ratio: 0.25,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            degraded_error_rate: 0.2,
            degraded_latency_ms: 5_000.0,
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 4,
            step_timeout_ms: 60_000,
            state_dir: None,
        }
    }
}

impl MeshConfig {
    /// Load config from a TOML file. Returns defaults if the file is missing or invalid.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {} - using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No config at {} - using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl StoreConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl RoutingConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }
}

impl HealthConfig {
    /// Never zero; a periodic timer cannot tick at a zero period.
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }
}

impl WorkflowConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }
}
