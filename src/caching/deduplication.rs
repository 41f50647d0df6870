//! # Request Deduplication Module
//!
//! Single-flight execution: concurrent callers asking for the same key share one
//! execution of the underlying computation and all receive its outcome, value or
//! error alike.
//!
//! The check for a pending computation and the registration of a new one happen
//! under one lock, before the computation is first polled, so two callers can never
//! both start work for the same key. The entry is removed by the computation itself
//! when it finishes, still under that lock: a caller either joined before removal and
//! gets the published outcome, or arrives after it and starts a fresh execution.
//!
//! Nothing is cached here. Storing a successful value is the caller's decision.

use crate::core::error::{GatewayError, GatewayResult};
use crate::observability::metrics as gateway_metrics;
use futures::future::{BoxFuture, Shared, WeakShared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

type SharedComputation<T> = Shared<BoxFuture<'static, GatewayResult<T>>>;

/// A computation in flight for one key
struct PendingComputation<T: Clone> {
    /// Generation id, so a finished computation never removes its successor
    id: u64,
    result: WeakShared<BoxFuture<'static, GatewayResult<T>>>,
    /// Diagnostic only
    waiters: Arc<AtomicUsize>,
}

struct Inner<T: Clone> {
    pending: Mutex<HashMap<String, PendingComputation<T>>>,
    next_id: AtomicU64,
    executions: AtomicU64,
    coalesced: AtomicU64,
}

/// Deduplication statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    /// Computations actually executed
    pub executions: u64,

    /// Calls that joined an already running computation
    pub coalesced: u64,

    /// Computations currently in flight
    pub pending: usize,
}

/// Collapses concurrent identical computations into one execution
pub struct RequestDeduplicator<T: Clone> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the pending entry when the computation finishes or is dropped
struct RemoveOnDrop<T: Clone> {
    inner: Arc<Inner<T>>,
    key: String,
    id: u64,
}

impl<T: Clone> Drop for RemoveOnDrop<T> {
    fn drop(&mut self) {
        let mut pending = self.inner.pending.lock();
        if pending.get(&self.key).map(|p| p.id) == Some(self.id) {
            pending.remove(&self.key);
        }
    }
}

struct WaiterGuard(Arc<AtomicUsize>);

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                executions: AtomicU64::new(0),
                coalesced: AtomicU64::new(0),
            }),
        }
    }

    /// Run `computation` for `key`, or join the execution already in flight.
    ///
    /// `computation` is invoked at most once per call and never when another
    /// execution for `key` is pending. A panic inside it is delivered to every
    /// waiter as [`GatewayError::Internal`]. When every waiter goes away the
    /// computation is dropped.
    pub async fn run<F, Fut>(&self, key: &str, computation: F) -> GatewayResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let (result, waiters) = self.join_or_register(key, computation);

        waiters.fetch_add(1, Ordering::Relaxed);
        let _waiter = WaiterGuard(waiters);

        result.await
    }

    fn join_or_register<F, Fut>(&self, key: &str, computation: F) -> (SharedComputation<T>, Arc<AtomicUsize>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = GatewayResult<T>> + Send + 'static,
    {
        let mut pending = self.inner.pending.lock();

        if let Some(existing) = pending.get(key) {
            if let Some(result) = existing.result.upgrade() {
                self.inner.coalesced.fetch_add(1, Ordering::Relaxed);
                gateway_metrics::record_dedup_coalesced();
                debug!(key, "Joining in-flight computation");
                return (result, existing.waiters.clone());
            }
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = RemoveOnDrop {
            inner: self.inner.clone(),
            key: key.to_string(),
            id,
        };
        let inner = self.inner.clone();
        let owned_key = key.to_string();

        let result: SharedComputation<T> = async move {
            let _guard = guard;
            inner.executions.fetch_add(1, Ordering::Relaxed);
            gateway_metrics::record_dedup_execution();

            match AssertUnwindSafe(async move { computation().await })
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(key = %owned_key, panic = %message, "Deduplicated computation panicked");
                    Err(GatewayError::internal(format!("computation panicked: {}", message)))
                }
            }
        }
        .boxed()
        .shared();

        let waiters = Arc::new(AtomicUsize::new(0));
        // A freshly created Shared has not completed, so downgrade always succeeds
        if let Some(weak) = result.downgrade() {
            pending.insert(
                key.to_string(),
                PendingComputation {
                    id,
                    result: weak,
                    waiters: waiters.clone(),
                },
            );
        }
        debug!(key, "Registered new computation");

        (result, waiters)
    }

    /// Number of computations currently in flight
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Number of callers waiting on the computation for `key`
    pub fn waiter_count(&self, key: &str) -> usize {
        self.inner
            .pending
            .lock()
            .get(key)
            .map(|p| p.waiters.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            executions: self.inner.executions.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
