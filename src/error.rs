//! Error types for the orchestration core.
//!
//! One enum per component, mirroring the component boundaries: the bus and
//! KV fabric, the task store, the model gateway, skills, channels, the MCP
//! gateway, and configuration. User-visible failure text never comes from
//! these types; they feed the audit log and the localized reply layer.

use thiserror::Error;

/// Errors raised by the event bus and the KV store behind it.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("envelope on '{topic}' is {size} bytes, cap is {limit}")]
    EnvelopeTooLarge {
        topic: String,
        size: usize,
        limit: usize,
    },

    #[error("topic '{topic}' is closed")]
    Closed { topic: String },

    #[error("kv operation failed: {reason}")]
    Kv { reason: String },

    #[error("envelope serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised by the task store.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task id '{id}' already exists")]
    Collision { id: String },

    #[error("task '{id}' not found")]
    NotFound { id: String },

    #[error("task '{id}' is not in status '{expected}'")]
    Conflict { id: String, expected: String },

    #[error(transparent)]
    Store(#[from] BusError),
}

/// Errors raised by model gateway calls.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model request to {provider} failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("model call to {provider} timed out")]
    Timeout { provider: String },

    #[error("model stream interrupted: {reason}")]
    StreamInterrupted { reason: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ModelError {
    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Timeout { .. } | ModelError::StreamInterrupted { .. } => true,
            ModelError::Http(e) => e.is_timeout() || e.is_connect(),
            ModelError::RequestFailed { reason, .. } => {
                reason.contains("500") || reason.contains("502") || reason.contains("503")
            }
            ModelError::InvalidResponse { .. } => false,
        }
    }
}

/// Errors raised by skill dispatch and the sandbox runner.
#[derive(Debug, Error)]
pub enum SkillError {
    #[error("unknown skill: {name}")]
    Unknown { name: String },

    #[error("invalid arguments for '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    #[error("denied:{reason}")]
    Denied { reason: String },

    #[error("skill '{name}' timed out")]
    Timeout { name: String },

    #[error("skill '{name}' failed: {reason}")]
    ExecutionFailed { name: String, reason: String },
}

/// Errors raised by channel adapters.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel '{name}' failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("channel '{name}' failed to send: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("stream sequence gap on task {task_id}")]
    SequenceGap { task_id: String },
}

/// Errors raised by the MCP gateway surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("unknown endpoint")]
    UnknownEndpoint,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("rate limited")]
    RateLimited,

    #[error("bus unavailable: {0}")]
    BusUnavailable(#[from] BusError),
}

/// Errors raised while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required config option: {key}")]
    Missing { key: String },

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}
