//! Bookkeeping for entries leaving the registry
//!
//! Entries leave the registry in three ways:
//! - Eviction: `cache_time` elapsed with no subscribers
//! - Removal: the caller removed matching keys
//! - Clear: the whole cache was reset

use crate::key::SerializedKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason an entry left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovalReason {
    /// Retention window elapsed with no subscribers
    Evicted,

    /// Removed by key match
    Removed,

    /// Full cache reset
    Cleared,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemovalReason::Evicted => write!(f, "cache time elapsed"),
            RemovalReason::Removed => write!(f, "removed by key"),
            RemovalReason::Cleared => write!(f, "cache cleared"),
        }
    }
}

/// Record of a removal pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalEvent {
    /// Reason for removal
    pub reason: RemovalReason,

    /// When the removal occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were removed
    pub keys: Vec<SerializedKey>,
}

impl RemovalEvent {
    /// Create a new removal event
    pub fn new(reason: RemovalReason, keys: Vec<SerializedKey>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys,
        }
    }

    /// Number of removed entries
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether nothing was removed
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
