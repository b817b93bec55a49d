use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a failed write, used to decide whether a retry
/// is worth attempting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Network,
    Timeout,
    Conflict,
    Storage,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Network | ErrorCategory::Timeout)
    }

    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Conflict => "CONFLICT",
            Self::Storage => "STORAGE_ERROR",
        }
    }
}

/// Caller-side mistakes: never retried, surfaced immediately.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown status: {0}")]
    UnknownStatus(String),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Failure reported by a commit attempt.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CommitError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl CommitError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CommitError::Validation(_) => ErrorCategory::Validation,
            CommitError::Network(_) => ErrorCategory::Network,
            CommitError::Timeout { .. } => ErrorCategory::Timeout,
            CommitError::Conflict(_) => ErrorCategory::Conflict,
            CommitError::Storage(_) => ErrorCategory::Storage,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("value too large: {size} bytes, max {max}")]
    ValueTooLarge { size: usize, max: usize },

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid channel name '{0}'")]
    InvalidChannel(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("receiver lagged, {0} messages dropped")]
    Lagged(u64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failure constructing a bus-connected service.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

pub(crate) fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}
