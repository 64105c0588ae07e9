//! Retry policies.
//!
//! Two policies coexist and are kept apart on purpose:
//!
//! - [`UnboundedBackoffRetry`] tracks per-key exponential backoff for the work
//!   queue. It never gives up; an item is retried until it succeeds or is
//!   forgotten.
//! - [`BoundedFixedDelayRetry`] runs a synchronous best-effort operation a fixed
//!   number of times with a fixed pause, e.g. waiting for a remote cluster
//!   connection to become available.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Per-key exponential backoff: `base * 2^failures`, capped at `max_delay`.
#[derive(Debug)]
pub struct UnboundedBackoffRetry<K> {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> Default for UnboundedBackoffRetry<K> {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl<K: Eq + Hash + Clone> UnboundedBackoffRetry<K> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record one more failure for `key` and return how long to wait.
    pub fn when(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);

        // 2^exp overflows long before the cap matters
        let factor = 2f64.powi(exp.min(64) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        if !delay.is_finite() || delay > self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay)
    }

    /// Reset the backoff state of `key`.
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    pub fn num_requeues(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

/// A fixed number of attempts separated by a fixed delay.
#[derive(Clone, Debug)]
pub struct BoundedFixedDelayRetry {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for BoundedFixedDelayRetry {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(200),
        }
    }
}

impl BoundedFixedDelayRetry {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Run `operation` until it succeeds, returning the last error once every
    /// attempt has failed.
    pub async fn retry<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if attempt >= self.attempts => {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed, retrying"
                    );
                    tokio::time::sleep(self.interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_per_key() {
        let retry = UnboundedBackoffRetry::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(retry.when(&"a"), Duration::from_millis(5));
        assert_eq!(retry.when(&"a"), Duration::from_millis(10));
        assert_eq!(retry.when(&"a"), Duration::from_millis(20));
        assert_eq!(retry.num_requeues(&"a"), 3);

        // Independent keys do not share state
        assert_eq!(retry.when(&"b"), Duration::from_millis(5));
    }

    #[test]
    fn test_backoff_is_capped() {
        let retry = UnboundedBackoffRetry::new(Duration::from_millis(5), Duration::from_secs(1));
        for _ in 0..100 {
            retry.when(&1);
        }
        assert_eq!(retry.when(&1), Duration::from_secs(1));
    }

    #[test]
    fn test_forget_resets() {
        let retry = UnboundedBackoffRetry::default();
        retry.when(&"a");
        retry.when(&"a");
        retry.forget(&"a");
        assert_eq!(retry.num_requeues(&"a"), 0);
        assert_eq!(retry.when(&"a"), Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_bounded_retry_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let retry = BoundedFixedDelayRetry::new(5, Duration::from_millis(1));

        let result: Result<i32, &str> = retry
            .retry("op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not ready")
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(7));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bounded_retry_exhausts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let retry = BoundedFixedDelayRetry::new(10, Duration::from_millis(1));

        let result: Result<(), &str> = retry
            .retry("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("never")
                }
            })
            .await;

        assert_eq!(result, Err("never"));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }
}
