//! Error types for the engine.
//!
//! Only [`SetupError`] ever stops the process. Everything a running consumer or
//! the reclaimer hits is a [`StoreError`] or a [`DecodeError`]; those are logged
//! and turned into a backoff delay or a discarded entry.

use std::time::Duration;
use thiserror::Error;

use crate::config::{BackoffConfig, ConfigError};
use crate::entry::ParseStreamIdError;

/// Errors returned by a [`StreamStore`](crate::store::StreamStore).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The stream key or the consumer group does not exist
    #[error("no such key: {0}")]
    MissingKey(String),

    /// The consumer group already exists
    #[error("consumer group already exists: {0}")]
    GroupExists(String),

    /// The operation timed out
    #[error("store operation timed out: {0}")]
    Timeout(String),

    /// No connection could be obtained
    #[error("connection error: {0}")]
    Connection(String),

    /// The store rejected the command
    #[error("command error: {0}")]
    Command(String),

    /// The reply did not have the expected shape
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    /// True for errors a steady-state loop should simply wait out.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::MissingKey(_) | StoreError::Timeout(_) | StoreError::Connection(_)
        )
    }

    /// Delay before retrying after this error.
    pub fn backoff(&self, config: &BackoffConfig) -> Duration {
        let ms = match self {
            StoreError::Timeout(_) | StoreError::Connection(_) => config.timeout_ms,
            StoreError::MissingKey(_) => config.missing_key_ms,
            _ => config.error_ms,
        };
        Duration::from_millis(ms)
    }
}

impl From<DecodeError> for StoreError {
    fn from(e: DecodeError) -> Self {
        StoreError::Protocol(e.to_string())
    }
}

impl From<ParseStreamIdError> for StoreError {
    fn from(e: ParseStreamIdError) -> Self {
        StoreError::Protocol(e.to_string())
    }
}

/// Errors produced while parsing a reply or decoding an entry payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("entry has no payload{}", field_suffix(.0))]
    MissingPayload(Option<String>),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a record: {0}")]
    NotARecord(String),

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid {kind} payload: {value:?}")]
    InvalidInteger { kind: &'static str, value: String },

    #[error("unsupported target shape: {0}")]
    UnsupportedShape(String),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(name) => format!(" field '{name}'"),
        None => String::new(),
    }
}

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The stream has never been written. Production is someone else's job,
    /// so the engine does not create it.
    #[error("stream '{0}' does not exist yet")]
    StreamMissing(String),

    #[error("failed to create consumer group: {0}")]
    Store(#[from] StoreError),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("startup cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_by_error_class() {
        let config = BackoffConfig::default();
        assert_eq!(
            StoreError::Timeout("read".into()).backoff(&config),
            Duration::from_millis(config.timeout_ms)
        );
        assert_eq!(
            StoreError::MissingKey("orders".into()).backoff(&config),
            Duration::from_millis(config.missing_key_ms)
        );
        assert_eq!(
            StoreError::Command("ERR".into()).backoff(&config),
            Duration::from_millis(config.error_ms)
        );
    }

    #[test]
    fn test_transient_classes() {
        assert!(StoreError::Timeout("x".into()).is_transient());
        assert!(StoreError::MissingKey("x".into()).is_transient());
        assert!(!StoreError::Command("x".into()).is_transient());
        assert!(!StoreError::GroupExists("x".into()).is_transient());
    }

    #[test]
    fn test_missing_payload_message() {
        assert_eq!(DecodeError::MissingPayload(None).to_string(), "entry has no payload");
        assert_eq!(
            DecodeError::MissingPayload(Some("data".into())).to_string(),
            "entry has no payload field 'data'"
        );
    }
}
