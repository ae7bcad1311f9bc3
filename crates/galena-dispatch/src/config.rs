//! Dispatcher configuration.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The built-in deadline applied to requests that carry no `timeout`
/// field: 290 seconds.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 290_000;

/// How many times a command is re-processed after a commit conflict
/// before giving up.
pub const DEFAULT_MAX_COMMIT_RETRIES: u32 = 3;

/// Configuration for a [`Dispatcher`].
///
/// [`Dispatcher`]: crate::dispatcher::Dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of worker threads to spawn.
    pub worker_count: usize,

    /// How long a worker blocks in `take` before re-checking the shutdown
    /// flag. Bounds shutdown latency.
    pub take_tick_ms: u64,

    /// Commit-conflict retry bound per command.
    pub max_commit_retries: u32,

    /// Deadline applied to requests without an explicit `timeout` field,
    /// in milliseconds from receipt.
    pub default_command_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            worker_count: thread::available_parallelism().map_or(1, std::num::NonZero::get),
            take_tick_ms: 1_000,
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            default_command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
        }
    }
}

impl DispatchConfig {
    /// Parses a configuration from TOML and validates it.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations that cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid {
                field: "worker_count",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.take_tick_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "take_tick_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.default_command_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "default_command_timeout_ms",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// The worker tick as a `Duration`.
    pub fn take_tick(&self) -> Duration {
        Duration::from_millis(self.take_tick_ms)
    }

    /// The default deadline window in microseconds.
    pub fn default_timeout_micros(&self) -> u64 {
        self.default_command_timeout_ms.saturating_mul(1_000)
    }
}
