//! Normalized error types for log and status fetching.
//!
//! Transport-agnostic errors that hide reqwest/HTTP details and give the
//! tailing state machine the three categories it schedules on.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single chunk or status request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The log has not been produced yet, or the entity is unknown.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Network failure, request timeout or a 5xx response.
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// Authorization failure or a response that could not be decoded.
    #[error("fatal failure: {message}")]
    Fatal { message: String },
}

/// Coarse category of a `FetchError`, handy for matching in observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    NotFound,
    Transient,
    Fatal,
}

impl FetchError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FetchErrorKind {
        match self {
            Self::NotFound { .. } => FetchErrorKind::NotFound,
            Self::Transient { .. } => FetchErrorKind::Transient,
            Self::Fatal { .. } => FetchErrorKind::Fatal,
        }
    }

    /// Whether the tail session may reschedule on its own.
    ///
    /// Only `NotFound` qualifies; transient failures are surfaced and left
    /// to the caller to restart.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::NotFound { message } | Self::Transient { message } | Self::Fatal { message } => {
                message
            }
        }
    }
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failure of `wait_for_terminal`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out after {waited:?} waiting for {entity} (last observed {last_observed})")]
    Timeout {
        entity: String,
        waited: Duration,
        last_observed: String,
    },

    #[error("wait for {entity} cancelled (last observed {last_observed})")]
    Cancelled {
        entity: String,
        last_observed: String,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),
}
