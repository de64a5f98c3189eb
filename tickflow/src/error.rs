use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `tickflow`.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum PipelineError {
    #[error("pipeline is no longer accepting ticks")]
    Closed,

    #[error("ConfigError: {0}")]
    Config(#[from] ConfigError),

    #[error("StorageError: {0}")]
    Storage(#[from] StorageError),

    #[error("SourceError: {0}")]
    Source(#[from] SourceError),
}

/// Configuration errors are fatal at load time, never at per-tick time.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("unknown alert rule: {0}")]
    UnknownRule(String),

    #[error("alert rule {rule} has invalid parameter {parameter}: {value:?}")]
    InvalidRuleParameter {
        rule: String,
        parameter: String,
        value: String,
    },
}

/// Errors surfaced by a [`Storage`](crate::storage::Storage) backend.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("storage write timed out after {0}ms")]
    Timeout(u64),

    #[error("storage rejected batch: {0}")]
    Rejected(String),

    #[error("storage writer closed")]
    WriterClosed,
}

impl StorageError {
    /// Determine if a failed write is worth retrying by the external storage collaborator.
    #[allow(clippy::match_like_matches_macro)]
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable(_) | StorageError::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Errors returned by a [`Notifier`](crate::alerting::Notifier) delivery attempt.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum NotifyError {
    #[error("notifier {notifier} failed: {reason}")]
    Delivery { notifier: String, reason: String },

    #[error("notifier {0} panicked")]
    Panicked(String),

    #[error("notifier {0} receiver dropped")]
    Disconnected(String),
}

/// Errors produced by a [`TickSource`](crate::source::TickSource).
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Serialize, Error)]
pub enum SourceError {
    #[error("source {0} lost its connection: {1}")]
    Connection(String, String),

    #[error("source {0} received malformed payload: {1}")]
    Payload(String, String),

    #[error("source {0} could not emit: pipeline closed")]
    PipelineClosed(String),

    #[error("source {0} panicked")]
    Panicked(String),
}
