//! Mutation options and in-flight mutation tracking

use crate::error::{QueryError, Result};
use futures::future::BoxFuture;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

type MutationFn<V, D> = Box<dyn FnOnce(V) -> BoxFuture<'static, anyhow::Result<D>> + Send>;
type SuccessCallback<V, D> = Box<dyn FnOnce(&D, &V) + Send>;
type ErrorCallback<V> = Box<dyn FnOnce(&QueryError, &V) + Send>;

/// One mutation call: the operation plus optional outcome callbacks
pub struct MutationOptions<V, D> {
    mutation_fn: MutationFn<V, D>,
    on_success: Option<SuccessCallback<V, D>>,
    on_error: Option<ErrorCallback<V>>,
}

impl<V, D> MutationOptions<V, D>
where
    V: Clone + Send + 'static,
    D: Send + 'static,
{
    /// Create options around the mutation operation
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: FnOnce(V) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<D>> + Send + 'static,
    {
        Self {
            mutation_fn: Box::new(move |variables: V| -> BoxFuture<'static, anyhow::Result<D>> {
                Box::pin(mutation_fn(variables))
            }),
            on_success: None,
            on_error: None,
        }
    }

    /// Called with the result and the variables after a successful mutation
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&D, &V) + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Called with the error and the variables after a failed mutation
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&QueryError, &V) + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub(crate) async fn run(self, variables: V) -> Result<D> {
        match (self.mutation_fn)(variables.clone()).await {
            Ok(data) => {
                if let Some(on_success) = self.on_success {
                    on_success(&data, &variables);
                }
                Ok(data)
            }
            Err(e) => {
                let error = QueryError::mutation(e);
                if let Some(on_error) = self.on_error {
                    on_error(&error, &variables);
                }
                Err(error)
            }
        }
    }
}

#[derive(Debug)]
struct TrackerShared {
    in_flight: Mutex<HashSet<Uuid>>,
    count: watch::Sender<usize>,
}

impl TrackerShared {
    fn in_flight(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts mutations currently in flight
#[derive(Debug, Clone)]
pub struct MutationTracker {
    shared: Arc<TrackerShared>,
}

impl Default for MutationTracker {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            shared: Arc::new(TrackerShared {
                in_flight: Mutex::new(HashSet::new()),
                count,
            }),
        }
    }
}

impl MutationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mutation; it stays counted until the ticket is dropped
    pub fn register(&self) -> MutationTicket {
        let id = Uuid::new_v4();
        let count = {
            let mut in_flight = self.shared.in_flight();
            in_flight.insert(id);
            in_flight.len()
        };
        self.shared.count.send_replace(count);
        debug!(ticket = %id, in_flight = count, "Mutation started");
        MutationTicket {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Number of mutations in flight
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight().len()
    }

    /// Observe the in-flight count; updates on every start and completion
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.shared.count.subscribe()
    }
}

/// Registration of one in-flight mutation
#[derive(Debug)]
pub struct MutationTicket {
    id: Uuid,
    shared: Arc<TrackerShared>,
}

impl MutationTicket {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for MutationTicket {
    fn drop(&mut self) {
        let count = {
            let mut in_flight = self.shared.in_flight();
            in_flight.remove(&self.id);
            in_flight.len()
        };
        self.shared.count.send_replace(count);
        debug!(ticket = %self.id, in_flight = count, "Mutation finished");
    }
}
