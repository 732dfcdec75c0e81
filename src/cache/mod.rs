//! # Query Cache
//!
//! Keyed, in-memory cache of asynchronously fetched values.
//!
//! ## Features
//!
//! - **Deduplication**: concurrent fetches of one key share a single operation
//! - **Staleness**: data younger than `stale_time` is served without refetching
//! - **Deferred Eviction**: unobserved entries are dropped after `cache_time`
//! - **Batched Notifications**: subscriber callbacks are coalesced per entry
//! - **Polling**: `refetch_interval` refetches while an entry has subscribers
//!
//! ## Architecture
//!
//! - [`CacheRegistry`]: owns entries and their eviction timers
//! - [`QueryEntry`]: per-key fetch state machine and subscriber list
//! - [`QueryOptions`]: per-entry timing and retry behaviour
//!
//! ## Example
//!
//! ```rust
//! use ouroboros_query::cache::{query_fn, CacheRegistry, QueryOptions, QueryStatus};
//! use ouroboros_query::query_key;
//! use std::time::Duration;
//!
//! # async fn example() -> ouroboros_query::Result<()> {
//! let registry = CacheRegistry::default();
//! let key = query_key!["todos"].serialize();
//!
//! let options = QueryOptions::builder()
//!     .stale_time(Duration::from_secs(30))
//!     .build();
//! let entry = registry.create_entry(
//!     key.clone(),
//!     Some(query_fn(|_token| async { Ok(vec!["write docs"]) })),
//!     options,
//! );
//! registry.set(key, entry.clone());
//!
//! entry.fetch().await?;
//! assert_eq!(entry.status(), QueryStatus::Success);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod store;
pub mod types;

pub use config::{ClientConfig, ClientConfigBuilder, QueryOptions, QueryOptionsBuilder};
pub use entry::{query_fn, QueryEntry, QueryFn};
pub use invalidation::{RemovalEvent, RemovalReason};
pub use store::CacheRegistry;
pub use types::{CacheStats, QueryState, QueryStatus, Subscriber, SubscriptionId};
