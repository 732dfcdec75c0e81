//! Client-level orchestration
//!
//! [`QueryClient`] routes keyed fetches to their [`QueryEntry`], merging the
//! client's default options under each call's overrides, and implements the
//! bulk operations (invalidate, cancel, remove, enumerate) over key prefixes.
//! It also counts in-flight mutations.
//!
//! ```no_run
//! use ouroboros_query::{query_key, ClientConfig, QueryClient, QueryRequest};
//!
//! # async fn example() -> ouroboros_query::Result<()> {
//! let client = QueryClient::new(ClientConfig::default());
//!
//! let todos: Vec<String> = client
//!     .fetch(QueryRequest::new(query_key!["todos"], |_token| async {
//!         Ok(vec!["write docs".to_string()])
//!     }))
//!     .await?;
//!
//! client.invalidate_queries(Some(&query_key!["todos"])).await;
//! # Ok(())
//! # }
//! ```

use crate::cache::{
    config::{ClientConfig, QueryOptionsBuilder},
    entry::{query_fn, FetchMode, QueryEntry, QueryFn},
    invalidation::RemovalEvent,
    store::CacheRegistry,
    types::{CacheStats, QueryState, QueryStatus},
};
use crate::error::{QueryError, Result};
use crate::key::{QueryKey, SerializedKey};
use crate::mutation::{MutationOptions, MutationTracker};
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A keyed fetch: the key, its operation and per-call option overrides
#[derive(Clone)]
pub struct QueryRequest {
    key: QueryKey,
    query_fn: QueryFn,
    options: QueryOptionsBuilder,
}

impl QueryRequest {
    /// Create a request for `key` backed by `f`
    pub fn new<T, F, Fut>(key: impl Into<QueryKey>, f: F) -> Self
    where
        T: Serialize,
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            key: key.into(),
            query_fn: query_fn(f),
            options: QueryOptionsBuilder::default(),
        }
    }

    /// Replace all per-call overrides
    pub fn options(mut self, options: QueryOptionsBuilder) -> Self {
        self.options = options;
        self
    }

    pub fn stale_time(mut self, stale_time: Duration) -> Self {
        self.options = self.options.stale_time(stale_time);
        self
    }

    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.options = self.options.cache_time(cache_time);
        self
    }

    pub fn retry(mut self, retry: u32) -> Self {
        self.options = self.options.retry(retry);
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.options = self.options.retry_delay(retry_delay);
        self
    }

    pub fn refetch_interval(mut self, refetch_interval: Duration) -> Self {
        self.options = self.options.refetch_interval(refetch_interval);
        self
    }

    pub fn suspense(mut self, suspense: bool) -> Self {
        self.options = self.options.suspense(suspense);
        self
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl std::fmt::Debug for QueryRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryRequest")
            .field("key", &self.key)
            .field("options", &self.options)
            .finish()
    }
}

/// New value for `set_query_data`
pub enum DataUpdate<T> {
    /// Replace the cached value
    Value(T),

    /// Compute the new value from the previous one
    Updater(Box<dyn FnOnce(Option<T>) -> T + Send>),
}

impl<T> DataUpdate<T> {
    /// Build an updater variant from a closure
    pub fn updater<F>(f: F) -> Self
    where
        F: FnOnce(Option<T>) -> T + Send + 'static,
    {
        DataUpdate::Updater(Box::new(f))
    }
}

/// State snapshot of one cached query
#[derive(Debug, Clone)]
pub struct QuerySnapshot {
    pub key: SerializedKey,
    pub state: QueryState,
}

struct ClientInner {
    config: ClientConfig,
    registry: CacheRegistry,
    mutations: MutationTracker,
}

/// Orchestrator over a [`CacheRegistry`]
///
/// Construct one explicitly and pass it where it is needed; clones share
/// the same cache.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl QueryClient {
    /// Create a client with the given configuration
    pub fn new(config: ClientConfig) -> Self {
        info!(
            "Initializing query client with defaults: {:?}",
            config.default_options
        );
        let registry = CacheRegistry::new(config.logger.clone(), config.max_entries_warning);

        Self {
            inner: Arc::new(ClientInner {
                config,
                registry,
                mutations: MutationTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The underlying registry
    pub fn registry(&self) -> &CacheRegistry {
        &self.inner.registry
    }

    /// Look up the entry for `key` without creating it
    pub fn entry(&self, key: &QueryKey) -> Option<Arc<QueryEntry>> {
        self.registry().get(&key.serialize())
    }

    /// Look up or create the entry for a request
    ///
    /// An existing entry takes the request's operation and overrides.
    pub fn ensure_entry(&self, request: &QueryRequest) -> Arc<QueryEntry> {
        let key = request.key.serialize();
        let (entry, created) = self.registry().get_or_insert_with(&key, || {
            let options = request.options.merge_into(&self.inner.config.default_options);
            self.registry()
                .create_entry(key.clone(), Some(request.query_fn.clone()), options)
        });

        if !created {
            entry.replace_query_fn(request.query_fn.clone());
            if !request.options.is_empty() {
                entry.update_options(&request.options);
            }
        }
        entry
    }

    /// Fetch and return the value for a request
    ///
    /// Waits for an in-flight fetch of the same key instead of starting a
    /// second one. Fails with the stored error if the entry settled as
    /// Error, and with [`QueryError::NoData`] if it holds no value.
    pub async fn fetch<T: DeserializeOwned>(&self, request: QueryRequest) -> Result<T> {
        let entry = self.ensure_entry(&request);
        entry.fetch().await?;
        entry.wait_settled().await;

        let state = entry.state();
        if state.status == QueryStatus::Error {
            if let Some(error) = state.error {
                return Err(error);
            }
        }
        match state.data {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Err(QueryError::NoData {
                key: entry.key().to_string(),
            }),
        }
    }

    /// Warm the cache for a request; failures are logged, not returned
    pub async fn prefetch(&self, request: QueryRequest) {
        let entry = self.ensure_entry(&request);
        if let Err(e) = entry.fetch().await {
            debug!(key = %entry.key(), "Prefetch did not complete: {}", e);
        }
    }

    /// Mark matching entries stale and refetch them
    ///
    /// Refetches run concurrently and each failure stays local to its
    /// entry. Every matched entry still in the registry is notified once
    /// more after all refetches have completed.
    pub async fn invalidate_queries(&self, partial: Option<&QueryKey>) {
        let matched = self.registry().find(partial);
        if matched.is_empty() {
            return;
        }

        self.registry().record_invalidations(matched.len());
        info!("Invalidating {} queries", matched.len());

        let logger = self.inner.config.logger.clone();
        let refetches = matched.iter().map(|(key, entry)| {
            let logger = logger.clone();
            async move {
                if let Err(e) = entry.invalidate().await {
                    logger.warn(
                        "Refetch after invalidation failed",
                        &json!({ "key": key.as_str(), "error": e.to_string() }),
                    );
                }
            }
        });
        join_all(refetches).await;

        for (key, _) in &matched {
            if let Some(entry) = self.registry().get(key) {
                entry.notify();
            }
        }
    }

    /// Cancel in-flight fetches of matching entries
    pub fn cancel_queries(&self, partial: Option<&QueryKey>) {
        for (_, entry) in self.registry().find(partial) {
            entry.cancel();
        }
    }

    /// Refetch matching entries that currently have subscribers
    pub async fn refetch_active(&self, partial: Option<&QueryKey>) {
        let active: Vec<Arc<QueryEntry>> = self
            .registry()
            .find(partial)
            .into_iter()
            .filter(|(_, entry)| entry.subscriber_count() > 0)
            .map(|(_, entry)| entry)
            .collect();

        join_all(active.iter().map(|entry| async move {
            if let Err(e) = entry.fetch_with(FetchMode::Poll).await {
                debug!(key = %entry.key(), "Refetch reported: {}", e);
            }
        }))
        .await;
    }

    /// State snapshots of matching entries
    pub fn get_queries(&self, partial: Option<&QueryKey>) -> Vec<QuerySnapshot> {
        self.registry()
            .find(partial)
            .into_iter()
            .map(|(key, entry)| QuerySnapshot {
                key,
                state: entry.state(),
            })
            .collect()
    }

    /// Current state of one entry
    pub fn get_query_state(&self, key: &QueryKey) -> Option<QueryState> {
        self.entry(key).map(|entry| entry.state())
    }

    /// Cached data of one entry
    pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Result<Option<T>> {
        match self.entry(key) {
            Some(entry) => entry.state().data_as(),
            None => Ok(None),
        }
    }

    /// Write data for `key` directly, creating the entry if needed
    ///
    /// Never runs a fetch operation; the entry ends up in Success.
    pub fn set_query_data<T>(&self, key: impl Into<QueryKey>, update: DataUpdate<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned,
    {
        let key = key.into().serialize();
        let (entry, _) = self.registry().get_or_insert_with(&key, || {
            self.registry()
                .create_entry(key.clone(), None, self.inner.config.default_options.clone())
        });

        let value = match update {
            DataUpdate::Value(value) => value,
            DataUpdate::Updater(updater) => {
                let previous: Option<T> = entry.state().data_as()?;
                updater(previous)
            }
        };

        entry.set_data(serde_json::to_value(value)?);
        debug!(key = %key, "Query data set directly");
        Ok(())
    }

    /// Run a mutation, counting it as in flight until it finishes
    pub async fn mutate<V, D>(&self, options: MutationOptions<V, D>, variables: V) -> Result<D>
    where
        V: Clone + Send + 'static,
        D: Send + 'static,
    {
        let _ticket = self.inner.mutations.register();
        options.run(variables).await
    }

    /// Number of mutations in flight
    pub fn mutating_count(&self) -> usize {
        self.inner.mutations.in_flight()
    }

    /// Observe the number of mutations in flight
    pub fn watch_mutations(&self) -> watch::Receiver<usize> {
        self.inner.mutations.subscribe()
    }

    /// Number of matching entries currently loading
    pub fn fetching_count(&self, partial: Option<&QueryKey>) -> usize {
        self.registry()
            .find(partial)
            .iter()
            .filter(|(_, entry)| entry.status() == QueryStatus::Loading)
            .count()
    }

    /// Remove matching entries from the cache
    pub fn remove_queries(&self, partial: Option<&QueryKey>) -> RemovalEvent {
        self.registry().remove_matching(partial)
    }

    /// Remove every entry
    pub fn clear(&self) -> RemovalEvent {
        self.registry().clear()
    }

    pub fn stats(&self) -> CacheStats {
        self.registry().stats()
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("registry", self.registry())
            .field("mutations", &self.mutating_count())
            .finish()
    }
}
