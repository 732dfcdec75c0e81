//! Error types for query and mutation operations
//!
//! This module defines the error enum shared by the cache engine. Errors
//! raised by caller-supplied operations are wrapped in an `Arc` so they can
//! be stored inside a cloneable [`QueryState`](crate::cache::QueryState).

use std::sync::Arc;
use thiserror::Error;

/// Main error type for the query cache
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// The caller-supplied fetch operation failed
    #[error("Query operation failed: {0}")]
    Operation(Arc<anyhow::Error>),

    /// The caller-supplied mutation operation failed
    #[error("Mutation failed: {0}")]
    Mutation(Arc<anyhow::Error>),

    /// The entry settled without a value for a caller that requires one
    #[error("Query {key} settled without data")]
    NoData { key: String },

    /// Suspense signal: the entry is still loading
    #[error("Query {key} is still loading")]
    Pending { key: String },

    /// Value could not be converted to or from its cached JSON form
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key could not be canonicalized
    #[error("Invalid query key: {0}")]
    InvalidKey(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, QueryError>;

impl QueryError {
    /// Wrap a failure returned by a fetch operation
    pub fn operation(error: anyhow::Error) -> Self {
        QueryError::Operation(Arc::new(error))
    }

    /// Wrap a failure returned by a mutation operation
    pub fn mutation(error: anyhow::Error) -> Self {
        QueryError::Mutation(Arc::new(error))
    }

    /// Check if this error came from a caller-supplied operation
    pub fn is_operation_failure(&self) -> bool {
        matches!(self, QueryError::Operation(_) | QueryError::Mutation(_))
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(e: serde_json::Error) -> Self {
        QueryError::Serialization(e.to_string())
    }
}
