//! Rate-limiting work queue.
//!
//! An item is held at most once in the queue and is never handed to two
//! workers at the same time: adding an item that is being processed marks it
//! dirty, and it is re-queued when the worker calls [`RateLimitingQueue::done`].

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::retry::UnboundedBackoffRetry;

/// Operation counters of one queue.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    adds: AtomicU64,
    delayed_adds: AtomicU64,
    rate_limited_adds: AtomicU64,
    forgets: AtomicU64,
}

impl QueueMetrics {
    pub fn adds(&self) -> u64 {
        self.adds.load(Ordering::Relaxed)
    }

    pub fn delayed_adds(&self) -> u64 {
        self.delayed_adds.load(Ordering::Relaxed)
    }

    pub fn rate_limited_adds(&self) -> u64 {
        self.rate_limited_adds.load(Ordering::Relaxed)
    }

    pub fn forgets(&self) -> u64 {
        self.forgets.load(Ordering::Relaxed)
    }
}

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    rate_limiter: UnboundedBackoffRetry<T>,
    metrics: QueueMetrics,
}

/// Cloneable handle to a shared queue.
pub struct RateLimitingQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for RateLimitingQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(UnboundedBackoffRetry::default())
    }
}

impl<T> RateLimitingQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(rate_limiter: UnboundedBackoffRetry<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                rate_limiter,
                metrics: QueueMetrics::default(),
            }),
        }
    }

    pub fn add(&self, item: T) {
        self.inner.metrics.adds.fetch_add(1, Ordering::Relaxed);
        self.insert(item);
    }

    fn insert(&self, item: T) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Add `item` once `delay` has elapsed.
    pub fn add_after(&self, item: T, delay: Duration) {
        self.inner.metrics.delayed_adds.fetch_add(1, Ordering::Relaxed);
        self.schedule(item, delay);
    }

    /// Add `item` after its per-item backoff delay.
    pub fn add_rate_limited(&self, item: T) {
        self.inner
            .metrics
            .rate_limited_adds
            .fetch_add(1, Ordering::Relaxed);
        let delay = self.inner.rate_limiter.when(&item);
        self.schedule(item, delay);
    }

    fn schedule(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.insert(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.insert(item);
        });
    }

    /// Reset the backoff state of `item`.
    pub fn forget(&self, item: &T) {
        self.inner.metrics.forgets.fetch_add(1, Ordering::Relaxed);
        self.inner.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark `item` as no longer in flight, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let mut state = self.inner.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.inner.metrics
    }
}
