//! Rate-limited controller core.
//!
//! A [`RateLimitedController`] owns a [`RateLimitingQueue`], pulls items off it
//! and hands them to a pluggable [`Handler`]. After every item exactly one
//! re-queue decision is made from the handler outcome:
//!
//! 1. error: rate-limited re-add
//! 2. `requeue_after`: delayed re-add, plus a rate-limited re-add when
//!    `requeue` is also set, otherwise the backoff state is forgotten
//! 3. `requeue`: rate-limited re-add
//! 4. otherwise: forget

mod queue;

pub use queue::{QueueMetrics, RateLimitingQueue};

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// Delay before a worker loop that panicked is started again.
pub const WORKER_RESTART_INTERVAL: Duration = Duration::from_secs(10);

/// What to do with an item once its handler returned successfully.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }
}

/// Per-item business logic plugged into a [`RateLimitedController`].
///
/// The queue never runs two reconciles for the same item concurrently, but the
/// handler must re-read whatever state it acts on.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn reconcile(&self, item: T) -> Result<ReconcileResult>;
}

/// Apply the re-queue policy for one processed item.
pub fn requeue<T>(queue: &RateLimitingQueue<T>, item: T, outcome: &Result<ReconcileResult>)
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    match outcome {
        Err(_) => queue.add_rate_limited(item),
        Ok(result) => match result.requeue_after.filter(|d| !d.is_zero()) {
            Some(delay) => {
                if result.requeue {
                    queue.add_after(item.clone(), delay);
                    queue.add_rate_limited(item);
                } else {
                    queue.forget(&item);
                    queue.add_after(item, delay);
                }
            }
            None if result.requeue => queue.add_rate_limited(item),
            None => queue.forget(&item),
        },
    }
}

/// Calls `done` when dropped, so a panicking handler still releases its item.
struct InFlight<'a, T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    queue: &'a RateLimitingQueue<T>,
    item: T,
}

impl<T> Drop for InFlight<'_, T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.queue.done(&self.item);
    }
}

/// Generic queue-driven reconciliation engine.
pub struct RateLimitedController<T> {
    name: String,
    queue: RateLimitingQueue<T>,
    handler: Arc<dyn Handler<T>>,
    max_concurrent: usize,
}

impl<T> RateLimitedController<T>
where
    T: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(name: &str, handler: Arc<dyn Handler<T>>, max_concurrent: usize) -> Self {
        Self {
            name: name.to_string(),
            queue: RateLimitingQueue::default(),
            handler,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &RateLimitingQueue<T> {
        &self.queue
    }

    pub fn add(&self, item: T) {
        self.queue.add(item);
    }

    pub fn add_after(&self, item: T, delay: Duration) {
        self.queue.add_after(item, delay);
    }

    /// Start `max_concurrent` supervised workers and wait for all of them to
    /// exit. The queue is shut down when `token` is cancelled.
    pub async fn start(&self, token: CancellationToken) {
        info!(controller = %self.name, workers = self.max_concurrent, "Starting controller");
        let workers: Vec<_> = (0..self.max_concurrent)
            .map(|_| self.run(token.clone()))
            .collect();
        join_all(workers).await;
        info!(controller = %self.name, "Controller stopped");
    }

    /// One supervised worker. A worker loop that panics is restarted after
    /// [`WORKER_RESTART_INTERVAL`]; cancellation ends the supervisor.
    pub async fn run(&self, token: CancellationToken) {
        loop {
            let worker = self.spawn_worker();
            tokio::select! {
                _ = token.cancelled() => {
                    self.queue.shut_down();
                    return;
                }
                joined = worker => match joined {
                    Ok(()) => return,
                    Err(e) => {
                        error!(controller = %self.name, error = %e, "Worker loop crashed, restarting");
                    }
                },
            }
            tokio::select! {
                _ = token.cancelled() => {
                    self.queue.shut_down();
                    return;
                }
                _ = tokio::time::sleep(WORKER_RESTART_INTERVAL) => {}
            }
        }
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let handler = Arc::clone(&self.handler);
        let name = self.name.clone();
        tokio::spawn(async move {
            while let Some(item) = queue.get().await {
                let guard = InFlight {
                    queue: &queue,
                    item: item.clone(),
                };
                let outcome = handler.reconcile(item.clone()).await;
                match &outcome {
                    Ok(result) => debug!(controller = %name, ?item, ?result, "Reconciled"),
                    Err(e) => warn!(controller = %name, ?item, error = %e, "Reconcile failed"),
                }
                requeue(&queue, item, &outcome);
                drop(guard);
            }
        })
    }
}
