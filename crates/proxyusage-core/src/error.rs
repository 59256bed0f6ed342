//! Error types for ProxyUsage

use serde::Serialize;
use thiserror::Error;

/// Result type alias using ProxyUsage's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// A single rejected input field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Dotted path of the offending field (e.g. `metrics.3.name`)
    pub path: String,
    /// Human readable reason
    pub message: String,
}

impl FieldError {
    /// Create a field error
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error types for ProxyUsage operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed filter, pagination, price or beacon input
    #[error("Validation error: {}", join_fields(.0))]
    Validation(Vec<FieldError>),

    /// The upstream usage report could not be recognized at all
    #[error("Unrecognized usage payload: {0}")]
    PayloadFormat(String),

    /// A query against the rollup tables failed
    #[error("Rollup query failed: {0}")]
    RollupQuery(String),

    /// The sync transaction was rolled back
    #[error("Transaction failed: {0}")]
    Transaction(String),

    /// Missing or wrong credentials
    #[error("Unauthorized")]
    Unauthorized,

    /// Operation not permitted in this environment
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Upstream proxy answered with a non-success status
    #[error("Upstream returned {status}: {message}")]
    Upstream {
        /// HTTP status returned by the upstream
        status: u16,
        /// Status text or body excerpt
        message: String,
    },

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Not found error
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn join_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(|f| format!("{}: {}", f.path, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a not found error
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Create a validation error for a single field
    pub fn validation(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation(vec![FieldError::new(path, msg)])
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a payload format error
    pub fn payload_format(msg: impl Into<String>) -> Self {
        Self::PayloadFormat(msg.into())
    }

    /// Wrap a storage failure that happened inside the sync transaction
    pub fn transaction(err: impl std::fmt::Display) -> Self {
        Self::Transaction(err.to_string())
    }

    /// Wrap a storage failure on a rollup read so the planner can fall back
    pub fn rollup_query(err: impl std::fmt::Display) -> Self {
        Self::RollupQuery(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_fields() {
        let err = Error::Validation(vec![
            FieldError::new("start", "invalid date"),
            FieldError::new("pageSize", "must be a number"),
        ]);
        assert_eq!(
            err.to_string(),
            "Validation error: start: invalid date; pageSize: must be a number"
        );
    }

    #[test]
    fn test_upstream_message() {
        let err = Error::Upstream {
            status: 503,
            message: "Service Unavailable".to_string(),
        };
        assert_eq!(err.to_string(), "Upstream returned 503: Service Unavailable");
    }
}
