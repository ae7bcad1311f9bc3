//! Dispatch error types.

use thiserror::Error;

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Errors surfaced by the dispatcher's public API.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request schedules execution after its own deadline.
    #[error("execute time {execute_at}us is past the deadline {deadline}us")]
    InvalidSchedule {
        /// Requested execute time, microseconds since epoch.
        execute_at: u64,
        /// Computed deadline, microseconds since epoch.
        deadline: u64,
    },

    /// `start` was called on a dispatcher whose workers are already
    /// running.
    #[error("dispatcher already started")]
    AlreadyRunning,

    /// The one-shot store upgrade failed at startup.
    #[error("store upgrade failed: {0}")]
    Upgrade(#[from] crate::plugin::HandlerFault),

    /// Configuration rejected by validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from parsing or validating a [`DispatchConfig`].
///
/// [`DispatchConfig`]: crate::config::DispatchConfig
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML deserialization error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A field failed validation.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Failure mode of [`CommandQueue::take`].
///
/// [`CommandQueue::take`]: crate::queue::CommandQueue::take
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TakeError {
    /// The timeout elapsed with no workable command.
    #[error("timed out waiting for a workable command")]
    TimedOut,
}
