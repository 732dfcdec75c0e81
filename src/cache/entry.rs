//! Per-key fetch state machine
//!
//! A [`QueryEntry`] owns everything about one cache key: its current
//! [`QueryState`], effective options, the operation that produces its data,
//! subscribers, the in-flight cancellation token and the polling task.
//!
//! Fetch transitions: `Idle -> Loading -> {Success, Error}` and back to
//! `Loading` on the next fetch. A fetch issued while already `Loading` is a
//! no-op. Each started fetch gets a new generation; a completion whose
//! generation is no longer current is discarded.

use crate::cache::config::{QueryOptions, QueryOptionsBuilder};
use crate::cache::store::RegistryShared;
use crate::cache::types::{QueryState, QueryStatus, Subscriber, SubscriptionId};
use crate::error::{QueryError, Result};
use crate::key::SerializedKey;
use crate::logger::{QueryLogger, TracingLogger};
use crate::retry;
use chrono::Utc;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Type-erased fetch operation
///
/// Receives the cancellation token of the attempt; honouring it is optional.
pub type QueryFn = Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap a typed async operation as a [`QueryFn`]
pub fn query_fn<T, F, Fut>(f: F) -> QueryFn
where
    T: Serialize,
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    Arc::new(move |token: CancellationToken| -> BoxFuture<'static, anyhow::Result<Value>> {
        let fut = f(token);
        Box::pin(async move {
            let value = fut.await?;
            Ok(serde_json::to_value(value)?)
        })
    })
}

/// How a fetch treats the dedup and freshness checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchMode {
    /// Dedup while loading, short-circuit while fresh
    Normal,

    /// Dedup while loading, ignore freshness
    Poll,

    /// Supersede any in-flight fetch, ignore freshness
    Invalidate,
}

struct EntryInner {
    state: QueryState,
    options: QueryOptions,
    query_fn: Option<QueryFn>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: u64,
    generation: u64,
    cancel_token: Option<CancellationToken>,
    status_before_fetch: QueryStatus,
    notify_pending: bool,
    poller: Option<JoinHandle<()>>,
}

impl EntryInner {
    fn is_fresh(&self, now: i64) -> bool {
        if self.state.updated_at <= 0 {
            return false;
        }
        let age = (now - self.state.updated_at).max(0) as u128;
        age < self.options.stale_time.as_millis()
    }

    /// Drop the current in-flight fetch so its result is discarded
    fn abandon_in_flight(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.generation += 1;
        if self.state.status == QueryStatus::Loading {
            self.state.status = self.status_before_fetch;
        }
    }
}

enum FetchStart {
    Skip,
    Fresh,
    Run {
        op: QueryFn,
        token: CancellationToken,
        generation: u64,
        retry: u32,
        retry_delay: std::time::Duration,
    },
}

/// Reverts an attempt whose future is dropped before it settles
///
/// Covers callers that time out or are aborted, including the poller.
struct InFlight<'a> {
    entry: &'a QueryEntry,
    generation: u64,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut inner = self.entry.lock();
            if inner.generation != self.generation {
                return;
            }
            inner.abandon_in_flight();
        }
        debug!(key = %self.entry.key, generation = self.generation, "Fetch dropped before settling");
        self.entry.notify();
        self.entry.settled.notify_waiters();
    }
}

/// Lifecycle owner of one cache key
pub struct QueryEntry {
    key: SerializedKey,
    inner: Mutex<EntryInner>,
    settled: Notify,
    logger: Arc<dyn QueryLogger>,
    registry: Weak<RegistryShared>,
    self_ref: Weak<QueryEntry>,
}

impl QueryEntry {
    pub(crate) fn new(
        key: SerializedKey,
        query_fn: Option<QueryFn>,
        options: QueryOptions,
        logger: Arc<dyn QueryLogger>,
        registry: Weak<RegistryShared>,
    ) -> Arc<Self> {
        let entry = Arc::new_cyclic(|self_ref| Self {
            key,
            inner: Mutex::new(EntryInner {
                state: QueryState::default(),
                options,
                query_fn,
                subscribers: Vec::new(),
                next_subscription: 0,
                generation: 0,
                cancel_token: None,
                status_before_fetch: QueryStatus::Idle,
                notify_pending: false,
                poller: None,
            }),
            settled: Notify::new(),
            logger,
            registry,
            self_ref: self_ref.clone(),
        });
        entry.restart_poller();
        entry
    }

    /// Create an entry that is not owned by any registry
    ///
    /// Such an entry never schedules eviction.
    pub fn detached(key: SerializedKey, query_fn: Option<QueryFn>, options: QueryOptions) -> Arc<Self> {
        Self::new(key, query_fn, options, Arc::new(TracingLogger), Weak::new())
    }

    fn lock(&self) -> MutexGuard<'_, EntryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &SerializedKey {
        &self.key
    }

    /// Snapshot of the current state
    pub fn state(&self) -> QueryState {
        self.lock().state.clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.lock().state.status
    }

    /// Effective options
    pub fn options(&self) -> QueryOptions {
        self.lock().options.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn has_query_fn(&self) -> bool {
        self.lock().query_fn.is_some()
    }

    /// Whether a polling task is running
    pub fn is_polling(&self) -> bool {
        self.lock().poller.is_some()
    }

    pub(crate) fn replace_query_fn(&self, query_fn: QueryFn) {
        self.lock().query_fn = Some(query_fn);
    }

    /// Fetch unless already loading or still fresh
    ///
    /// With `suspense` enabled, returns [`QueryError::Pending`] if the entry is
    /// still loading when this call returns, and the stored error if it
    /// settled as Error.
    pub async fn fetch(&self) -> Result<()> {
        self.fetch_with(FetchMode::Normal).await
    }

    pub(crate) async fn fetch_with(&self, mode: FetchMode) -> Result<()> {
        let start = {
            let mut inner = self.lock();
            match inner.query_fn.clone() {
                None => FetchStart::Skip,
                Some(_) if inner.state.status == QueryStatus::Loading && mode != FetchMode::Invalidate => {
                    FetchStart::Skip
                }
                Some(_) if mode == FetchMode::Normal && inner.is_fresh(now_millis()) => FetchStart::Fresh,
                Some(op) => {
                    inner.abandon_in_flight();
                    let token = CancellationToken::new();
                    inner.cancel_token = Some(token.clone());
                    inner.status_before_fetch = inner.state.status;
                    inner.state.status = QueryStatus::Loading;
                    FetchStart::Run {
                        op,
                        token,
                        generation: inner.generation,
                        retry: inner.options.retry,
                        retry_delay: inner.options.retry_delay,
                    }
                }
            }
        };

        let (op, token, generation, retry, retry_delay) = match start {
            FetchStart::Skip => return self.suspense_outcome(),
            FetchStart::Fresh => {
                if let Some(registry) = self.registry.upgrade() {
                    registry.record_hit();
                }
                debug!(key = %self.key, "Query data still fresh, skipping fetch");
                return self.suspense_outcome();
            }
            FetchStart::Run {
                op,
                token,
                generation,
                retry,
                retry_delay,
            } => (op, token, generation, retry, retry_delay),
        };

        if let Some(registry) = self.registry.upgrade() {
            registry.record_miss();
        }
        debug!(key = %self.key, generation, ?mode, "Fetching query");
        let mut in_flight = InFlight {
            entry: self,
            generation,
            armed: true,
        };
        self.notify();

        let result = if retry > 0 {
            retry::run(|| op(token.clone()), retry, retry_delay, &token).await
        } else {
            op(token.clone()).await
        };
        in_flight.disarm();

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                debug!(key = %self.key, generation, "Discarding superseded fetch result");
                drop(inner);
                return self.suspense_outcome();
            }

            inner.cancel_token = None;
            match result {
                Ok(data) => {
                    inner.state.data = Some(data);
                    inner.state.error = None;
                    inner.state.status = QueryStatus::Success;
                }
                Err(e) => {
                    debug!(key = %self.key, "Query failed: {}", e);
                    inner.state.error = Some(QueryError::operation(e));
                    inner.state.status = QueryStatus::Error;
                }
            }
            inner.state.updated_at = now_millis();
        }

        self.notify();
        self.settled.notify_waiters();
        self.suspense_outcome()
    }

    fn suspense_outcome(&self) -> Result<()> {
        let inner = self.lock();
        if !inner.options.suspense {
            return Ok(());
        }
        match inner.state.status {
            QueryStatus::Loading => Err(QueryError::Pending {
                key: self.key.to_string(),
            }),
            QueryStatus::Error => Err(inner.state.error.clone().unwrap_or_else(|| {
                QueryError::NoData {
                    key: self.key.to_string(),
                }
            })),
            _ => Ok(()),
        }
    }

    /// Resolve once the entry is no longer loading
    pub async fn wait_settled(&self) {
        loop {
            let notified = self.settled.notified();
            let loading = self.status() == QueryStatus::Loading;
            if !loading {
                return;
            }
            notified.await;
        }
    }

    /// Mark the entry stale and refetch, superseding any in-flight fetch
    pub(crate) async fn invalidate(&self) -> Result<()> {
        self.lock().state.updated_at = 0;
        let result = self.fetch_with(FetchMode::Invalidate).await;
        self.notify();
        result
    }

    /// Cancel the in-flight fetch
    ///
    /// The token is signalled and the eventual result discarded. Status
    /// reverts to what it was before the fetch started.
    pub fn cancel(&self) {
        {
            let mut inner = self.lock();
            if inner.state.status != QueryStatus::Loading {
                return;
            }
            inner.abandon_in_flight();
        }
        info!(key = %self.key, "Cancelled in-flight query");
        self.notify();
        self.settled.notify_waiters();
    }

    /// Write data directly, bypassing the fetch path
    pub fn set_data(&self, data: Value) {
        {
            let mut inner = self.lock();
            inner.state.data = Some(data);
            inner.state.error = None;
            inner.state.status = QueryStatus::Success;
            inner.state.updated_at = now_millis();
        }
        self.notify();
        self.settled.notify_waiters();
    }

    /// Merge the set fields into the current options
    ///
    /// The polling task is rebuilt only when `refetch_interval` changes.
    pub fn update_options(&self, patch: &QueryOptionsBuilder) {
        let interval_changed = {
            let mut inner = self.lock();
            let previous = inner.options.refetch_interval;
            inner.options = patch.merge_into(&inner.options);
            inner.options.refetch_interval != previous
        };
        if interval_changed {
            self.restart_poller();
        }
    }

    /// Register an observer; it is invoked once immediately
    pub fn subscribe<F>(&self, subscriber: F) -> SubscriptionId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Arc::new(subscriber);
        let id = {
            let mut inner = self.lock();
            let id = SubscriptionId(inner.next_subscription);
            inner.next_subscription += 1;
            inner.subscribers.push((id, subscriber.clone()));
            id
        };
        if let Some(registry) = self.registry.upgrade() {
            if registry.is_current(&self.key, self) {
                registry.cancel_eviction(&self.key);
            }
        }
        self.invoke(&subscriber);
        id
    }

    /// Remove an observer; the last one out starts the eviction timer
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let (removed, now_empty, cache_time) = {
            let mut inner = self.lock();
            let before = inner.subscribers.len();
            inner.subscribers.retain(|(sid, _)| *sid != id);
            let removed = inner.subscribers.len() != before;
            (removed, inner.subscribers.is_empty(), inner.options.cache_time)
        };
        if removed && now_empty {
            if let Some(registry) = self.registry.upgrade() {
                if registry.is_current(&self.key, self) {
                    registry.schedule_eviction(self.key.clone(), cache_time);
                }
            }
        }
        removed
    }

    /// Queue one coalesced notification for all subscribers
    ///
    /// Calls made before the queued flush runs are folded into it.
    pub fn notify(&self) {
        {
            let mut inner = self.lock();
            if inner.notify_pending {
                return;
            }
            inner.notify_pending = true;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let entry = self.self_ref.clone();
                handle.spawn(async move {
                    if let Some(entry) = entry.upgrade() {
                        entry.flush_notifications();
                    }
                });
            }
            Err(_) => self.flush_notifications(),
        }
    }

    fn flush_notifications(&self) {
        let subscribers: Vec<Subscriber> = {
            let mut inner = self.lock();
            inner.notify_pending = false;
            inner.subscribers.iter().map(|(_, s)| s.clone()).collect()
        };
        for subscriber in &subscribers {
            self.invoke(subscriber);
        }
    }

    fn invoke(&self, subscriber: &Subscriber) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| subscriber())) {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            self.logger.error(
                "Query subscriber panicked",
                &json!({ "key": self.key.as_str(), "reason": reason }),
            );
        }
    }

    fn restart_poller(&self) {
        let interval = {
            let mut inner = self.lock();
            if let Some(poller) = inner.poller.take() {
                poller.abort();
            }
            inner.options.refetch_interval
        };
        if interval.is_zero() {
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.logger.warn(
                    "No async runtime available, polling disabled",
                    &json!({ "key": self.key.as_str() }),
                );
                return;
            }
        };

        debug!(key = %self.key, ?interval, "Starting query polling");
        let weak = self.self_ref.clone();
        let poller = handle.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(entry) = weak.upgrade() else {
                    break;
                };
                if entry.subscriber_count() == 0 {
                    continue;
                }
                if let Err(e) = entry.fetch_with(FetchMode::Poll).await {
                    debug!(key = %entry.key, "Polling fetch reported: {}", e);
                }
            }
        });
        self.lock().poller = Some(poller);
    }

    /// Stop the polling task
    pub(crate) fn stop_polling(&self) {
        if let Some(poller) = self.lock().poller.take() {
            poller.abort();
        }
    }
}

impl Drop for QueryEntry {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(poller) = inner.poller.take() {
            poller.abort();
        }
        if let Some(token) = inner.cancel_token.take() {
            token.cancel();
        }
    }
}

impl fmt::Debug for QueryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("QueryEntry")
            .field("key", &self.key)
            .field("status", &inner.state.status)
            .field("updated_at", &inner.state.updated_at)
            .field("subscribers", &inner.subscribers.len())
            .field("generation", &inner.generation)
            .finish()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
