//! # Ouroboros Query (ouroboros-query)
//!
//! A keyed async data cache with request deduplication, staleness control,
//! invalidation and deferred eviction.
//!
//! ## Features
//!
//! - Structured query keys with prefix matching
//! - Async-first design using tokio
//! - Deduplication of concurrent fetches per key
//! - Fixed-delay retry of failing operations
//! - Cancellation of in-flight fetches
//! - Polling while an entry is observed
//! - Mutation tracking
//!
//! ## Fetching
//!
//! ```no_run
//! use ouroboros_query::{query_key, ClientConfig, QueryClient, QueryRequest};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = QueryClient::new(ClientConfig::from_env()?);
//!
//!     let request = QueryRequest::new(query_key!["todos", {"page": 1}], |_token| async {
//!         Ok(vec!["write docs".to_string()])
//!     })
//!     .stale_time(Duration::from_secs(30));
//!
//!     let todos: Vec<String> = client.fetch(request).await?;
//!     println!("Loaded {} todos", todos.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Invalidation
//!
//! Every cached key starting with the given segments is marked stale and
//! refetched.
//!
//! ```no_run
//! use ouroboros_query::{query_key, QueryClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = QueryClient::default();
//!     client.invalidate_queries(Some(&query_key!["todos"])).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Mutations
//!
//! ```no_run
//! use ouroboros_query::{query_key, DataUpdate, MutationOptions, QueryClient};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = QueryClient::default();
//!     let cache = client.clone();
//!
//!     let options = MutationOptions::new(|title: String| async move { Ok(title) })
//!         .on_success(move |title: &String, _vars: &String| {
//!             let title = title.clone();
//!             let _ = cache.set_query_data(
//!                 query_key!["todos"],
//!                 DataUpdate::updater(move |todos: Option<Vec<String>>| {
//!                     let mut todos = todos.unwrap_or_default();
//!                     todos.push(title);
//!                     todos
//!                 }),
//!             );
//!         });
//!
//!     client.mutate(options, "write docs".to_string()).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod key;
pub mod logger;
pub mod mutation;
pub mod retry;

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}

// Re-export main types for convenience
pub use cache::{
    query_fn, CacheRegistry, CacheStats, ClientConfig, ClientConfigBuilder, QueryEntry, QueryFn,
    QueryOptions, QueryOptionsBuilder, QueryState, QueryStatus, RemovalEvent, RemovalReason,
    Subscriber, SubscriptionId,
};
pub use client::{DataUpdate, QueryClient, QueryRequest, QuerySnapshot};
pub use error::{QueryError, Result};
pub use key::{match_key, QueryKey, SerializedKey};
pub use logger::{QueryLogger, TracingLogger};
pub use mutation::{MutationOptions, MutationTicket, MutationTracker};
