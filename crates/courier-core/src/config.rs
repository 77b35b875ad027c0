//! Engine configuration
//!
//! Client-level defaults that method specs fall back to, plus the knobs of
//! the worker pool, batch coordinator and delivery channel. Loadable from
//! TOML; every field has a default.

use crate::error::{Result, RpcError};
use crate::method::{FallbackMode, PersistenceLevel};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How the timeout budget of a batched transaction is derived from its members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTimeoutMode {
    /// Sum of member timeouts
    Sum,
    /// Largest member timeout
    Max,
}

/// What a cache hit hands to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// The stored value itself is shared with every reader
    Shared,
    /// Every hit returns a deep copy
    CloneOnRead,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Timeout applied to methods that declare none
    pub default_timeout_ms: u64,
    /// Number of calls or batch transactions allowed to run at once
    pub worker_threads: usize,
    /// Aggregate timeout policy for batches
    pub batch_timeout_mode: BatchTimeoutMode,
    /// Global cache switch; method policies are ignored when false
    pub cache_enabled: bool,
    /// Sharing policy for cache hits
    pub cache_mode: CacheMode,
    /// Memory TTL for methods that declare none (0 = never expires)
    pub default_cache_ttl_ms: u64,
    /// Per-method memory capacity for methods that declare none
    pub default_cache_capacity: usize,
    /// Persistence level for methods that declare none
    pub default_persistence: PersistenceLevel,
    /// Error fallback for methods that declare none
    pub default_fallback: FallbackMode,
    /// Window for automatic batching; `None` runs every call on its own
    pub auto_batch_window_ms: Option<u64>,
    /// Tick scale progress percentages are normalised against
    pub progress_ticks: u32,
    /// Number of latency samples kept per wire name
    pub latency_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
            worker_threads: 4,
            batch_timeout_mode: BatchTimeoutMode::Max,
            cache_enabled: true,
            cache_mode: CacheMode::CloneOnRead,
            default_cache_ttl_ms: 0,
            default_cache_capacity: 100,
            default_persistence: PersistenceLevel::MemoryOnly,
            default_fallback: FallbackMode::Never,
            auto_batch_window_ms: None,
            progress_ticks: 100,
            latency_window: 16,
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            RpcError::configuration(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&source).map_err(|e| e.with_context(path.display()))
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.default_timeout_ms == 0 {
            return Err(RpcError::configuration("default_timeout_ms must be positive"));
        }
        if self.worker_threads == 0 {
            return Err(RpcError::configuration("worker_threads must be at least 1"));
        }
        if self.progress_ticks == 0 {
            return Err(RpcError::configuration("progress_ticks must be at least 1"));
        }
        if self.latency_window == 0 {
            return Err(RpcError::configuration("latency_window must be at least 1"));
        }
        if self.default_cache_capacity == 0 {
            return Err(RpcError::configuration(
                "default_cache_capacity must be at least 1",
            ));
        }
        if self.auto_batch_window_ms == Some(0) {
            return Err(RpcError::configuration(
                "auto_batch_window_ms must be positive when set",
            ));
        }
        Ok(())
    }

    /// Automatic batching window, if enabled
    pub fn auto_batch_window(&self) -> Option<Duration> {
        self.auto_batch_window_ms.map(Duration::from_millis)
    }
}
