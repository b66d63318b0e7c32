//! Engine settings
//!
//! Loaded with the `config` crate: built-in defaults, then an optional
//! TOML/YAML/JSON file, then `KBFLOW__*` environment variables. Nested keys
//! use a double underscore, e.g. `KBFLOW__BUDGET__CPU=16`.

use crate::budget::BudgetCapacity;
use crate::error::Result;
use crate::logging::LogConfig;
use crate::models::{DEFAULT_MAX_PARALLEL_WORKERS, DEFAULT_NODE_TIMEOUT_SECS};
use crate::persist::DEFAULT_QUEUE_CAPACITY;
use crate::scheduler::CheckpointPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "KBFLOW";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// SQLite file shared by every runner
    pub database_path: PathBuf,
    pub state_ttl_secs: u64,
    pub lock_lease_secs: u64,
    pub sweep_interval_secs: u64,
    /// Per-node timeout used when neither the node nor its workflow sets one
    pub node_timeout_secs: f64,
    /// Ceiling on `max_parallel_workers` for any execution
    pub max_workers: usize,
    pub budget: BudgetCapacity,
    pub queue_capacity: usize,
    /// Default checkpoint cadence, in node runs
    pub checkpoint_every: Option<usize>,
    pub metrics_port: Option<u16>,
    pub log_level: String,
    pub log_format: String,
    /// Log busy/idle time when each execution finishes
    pub log_span_timings: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("kbflow.db"),
            state_ttl_secs: 7 * 24 * 3600,
            lock_lease_secs: 300,
            sweep_interval_secs: 3600,
            node_timeout_secs: DEFAULT_NODE_TIMEOUT_SECS,
            max_workers: DEFAULT_MAX_PARALLEL_WORKERS,
            budget: BudgetCapacity::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            checkpoint_every: None,
            metrics_port: None,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            log_span_timings: false,
        }
    }
}

impl EngineSettings {
    /// Defaults, then `path` if given, then `KBFLOW__*` variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(prefix)
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        self.checkpoint_every
            .map(CheckpointPolicy::every)
            .unwrap_or_default()
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig::parse(&self.log_level, &self.log_format).with_span_timings(self.log_span_timings)
    }
}
