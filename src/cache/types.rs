//! Core type definitions for the query cache

use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Lifecycle status of a query entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QueryStatus {
    /// No fetch has started yet
    #[default]
    Idle,

    /// A fetch is in flight
    Loading,

    /// The last fetch succeeded
    Success,

    /// The last fetch failed
    Error,
}

impl QueryStatus {
    /// Whether this is a settled (Success or Error) status
    pub fn is_settled(&self) -> bool {
        matches!(self, QueryStatus::Success | QueryStatus::Error)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryStatus::Idle => write!(f, "idle"),
            QueryStatus::Loading => write!(f, "loading"),
            QueryStatus::Success => write!(f, "success"),
            QueryStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of one entry's state
///
/// Data from an earlier success stays visible while a refetch is loading.
#[derive(Debug, Clone, Default)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<Value>,
    pub error: Option<QueryError>,

    /// Epoch milliseconds of the last settle; 0 means never settled
    pub updated_at: i64,
}

impl QueryState {
    /// Whether the entry is currently loading
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Deserialize the cached data into `T`
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> crate::error::Result<Option<T>> {
        match &self.data {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }
}

/// Handle returned by `subscribe`, consumed by `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub(crate) u64);

/// Zero-argument observer; current state is read back through the entry
pub type Subscriber = Arc<dyn Fn() + Send + Sync>;

/// Counters for cache behaviour
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Fetches answered from fresh data without running the operation
    pub hits: u64,

    /// Fetches that ran the operation
    pub misses: u64,

    /// Number of entries currently in the registry
    pub entries: usize,

    /// Entries evicted after `cache_time` with no subscribers
    pub evictions: u64,

    /// Entries targeted by `invalidate_queries`
    pub invalidations: u64,

    /// Entries removed explicitly or by a full clear
    pub removals: u64,
}

impl CacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, evictions: {}, invalidations: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.evictions,
            self.invalidations
        )
    }
}
