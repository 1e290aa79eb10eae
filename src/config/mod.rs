//! Configuration module for camgraph
//!
//! This module handles engine configuration:
//! - Scheduler tuning (queue depth, worker count, fence mode, timeouts)
//! - Graph topology files describing nodes, links and HAL streams
//!
//! # Files
//!
//! A configuration is one TOML document with a `[scheduler]` table and a
//! `[graph]` table. Every scheduler field has a default, so a file may
//! describe the graph alone.
//!
//! # Example
//!
//! ```ignore
//! use camgraph::config::AppConfig;
//!
//! let config = AppConfig::load("configs/preview_snapshot.toml")?;
//! let (mut pipeline, bridge) = config.graph.build_pipeline(config.scheduler.clone())?;
//! pipeline.finalize(NegotiationMode::Strict)?;
//! ```

pub mod topology;

pub use topology::*;

use crate::error::{CamGraphError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default ring depth of per-request node state.
pub const DEFAULT_QUEUE_DEPTH: usize = 8;

/// Default number of scheduler worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default bound on how long `flush` waits for a running request.
pub const DEFAULT_WORST_CASE_RESPONSE_MS: u64 = 100;

/// How the scheduler learns that a fence signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FenceMode {
    /// Fence callbacks post a job to the worker pool.
    #[default]
    Interrupt,
    /// No callbacks on dependency fences; pending units are re-evaluated
    /// every `interval_ms`. Used when hardware interrupts are unavailable.
    Polling { interval_ms: u64 },
}

impl FenceMode {
    pub fn poll_interval(&self) -> Option<Duration> {
        match self {
            FenceMode::Interrupt => None,
            FenceMode::Polling { interval_ms } => Some(Duration::from_millis((*interval_ms).max(1))),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Ring size of per-request node state. Request `r` and `r + queue_depth`
    /// share a slot.
    pub queue_depth: usize,

    /// Worker threads draining the job queue. 0 runs jobs only when the
    /// caller pumps them with `Pipeline::run_until_idle`.
    pub worker_threads: usize,

    /// Buffers per output port unless the port declares its own count.
    /// Defaults to `queue_depth + 2`.
    pub default_buffer_count: Option<usize>,

    pub fence_mode: FenceMode,

    /// Fail dependency units whose fences stay unsignaled this long.
    pub fence_timeout_ms: Option<u64>,

    /// Upper bound on how long `flush` waits for a running request before a
    /// forced release.
    pub worst_case_response_time_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            worker_threads: DEFAULT_WORKER_THREADS,
            default_buffer_count: None,
            fence_mode: FenceMode::default(),
            fence_timeout_ms: None,
            worst_case_response_time_ms: DEFAULT_WORST_CASE_RESPONSE_MS,
        }
    }
}

impl SchedulerConfig {
    /// Single-threaded config for deterministic tests and tooling.
    pub fn manual() -> Self {
        Self {
            worker_threads: 0,
            ..Self::default()
        }
    }

    pub fn buffer_count(&self) -> usize {
        self.default_buffer_count
            .unwrap_or(self.queue_depth.max(1) + 2)
    }

    pub fn fence_timeout(&self) -> Option<Duration> {
        self.fence_timeout_ms.map(Duration::from_millis)
    }

    pub fn worst_case_response_time(&self) -> Duration {
        Duration::from_millis(self.worst_case_response_time_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_depth == 0 {
            return Err(CamGraphError::Config("queue_depth must be at least 1".to_string()));
        }
        if self.default_buffer_count == Some(0) {
            return Err(CamGraphError::Config(
                "default_buffer_count must be at least 1".to_string(),
            ));
        }
        if let FenceMode::Polling { interval_ms: 0 } = self.fence_mode {
            tracing::warn!("Polling interval of 0 ms raised to 1 ms");
        }
        Ok(())
    }
}

/// Complete configuration: scheduler tuning plus the graph to run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub graph: GraphConfig,
}

impl AppConfig {
    /// Load a configuration file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CamGraphError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.scheduler.validate()?;
        Ok(config)
    }

    /// Save configuration to disk as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            CamGraphError::Config(format!("Failed to write config file {:?}: {}", path, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.queue_depth, 8);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.buffer_count(), 10);
        assert_eq!(config.fence_mode, FenceMode::Interrupt);
        assert_eq!(config.worst_case_response_time(), Duration::from_millis(100));
        assert!(config.fence_timeout().is_none());
    }

    #[test]
    fn test_partial_scheduler_table() {
        let config = AppConfig::from_toml(
            r#"
            [scheduler]
            queue_depth = 4
            fence_mode = { mode = "polling", interval_ms = 5 }
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.queue_depth, 4);
        assert_eq!(config.scheduler.worker_threads, 4);
        assert_eq!(config.scheduler.buffer_count(), 6);
        assert_eq!(
            config.scheduler.fence_mode.poll_interval(),
            Some(Duration::from_millis(5))
        );
    }

    #[test]
    fn test_zero_depth_rejected() {
        let err = AppConfig::from_toml("[scheduler]\nqueue_depth = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue_depth"));
    }
}
