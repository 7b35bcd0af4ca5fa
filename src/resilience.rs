//! Resilience utilities: retry with exponential backoff and rate limiting.
//!
//! This module provides the patterns that keep one flaky registry from
//! taking a whole execution down:
//!
//! - [`RetryConfig`] + [`retry_with_backoff`]: exponential backoff for
//!   transient failures, with cancellation honored during sleeps
//! - [`RateLimiter`]: token bucket gating outbound registry requests
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> registry_replicator::error::Result<()> {
//! use registry_replicator::resilience::{retry_with_backoff, RetryConfig};
//! use tokio::sync::watch;
//!
//! let (_cancel, cancel_rx) = watch::channel(false);
//! let value = retry_with_backoff(&RetryConfig::default(), cancel_rx, "fetch", || async {
//!     Ok::<_, registry_replicator::error::ReplicationError>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplicationError, Result};
use crate::metrics;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (the first try counts).
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for the backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 = double the delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Calculate the delay before a given retry (1-indexed attempt number).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return std::cmp::min(self.initial_delay, self.max_delay);
        }
        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);
        std::cmp::min(delay, self.max_delay)
    }
}

/// Execute `op` with exponential backoff on retryable failures.
///
/// The classification lives on [`ReplicationError::is_retryable()`]:
/// cancellation and protocol errors never retry, transport timeouts and
/// 429/5xx answers do, anything unknown fails closed.
///
/// A true value on `cancel_rx` aborts the wait and returns
/// [`ReplicationError::Canceled`]; the backoff sleep is the suspension
/// point, so cancellation latency is bounded by one in-flight attempt.
pub async fn retry_with_backoff<T, F, Fut>(
    config: &RetryConfig,
    mut cancel_rx: watch::Receiver<bool>,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0usize;

    loop {
        if *cancel_rx.borrow() {
            return Err(ReplicationError::Canceled);
        }

        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if matches!(err, ReplicationError::Canceled) {
            return Err(err);
        }
        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= config.max_attempts {
            return Err(ReplicationError::RetriesExhausted {
                operation: operation.to_string(),
                attempts: attempt,
                message: err.to_string(),
            });
        }

        let capped = std::cmp::min(delay, config.max_delay);
        warn!(
            operation,
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = capped.as_millis() as u64,
            error = %err,
            "Attempt failed, retrying"
        );
        metrics::record_retry(operation, attempt);

        tokio::select! {
            _ = tokio::time::sleep(capped) => {}
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return Err(ReplicationError::Canceled);
                }
            }
        }

        delay = Duration::from_secs_f64(capped.as_secs_f64() * config.backoff_factor);
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket rate limiter for outbound registry requests.
///
/// Bucket size equals the refill rate: an endpoint configured with
/// `qps = 10` may burst 10 requests and then sustains 10 per second.
/// Thread-safe and async-aware.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    qps: u32,
}

impl RateLimiter {
    /// Create a limiter for a QPS cap. Returns `None` when `qps` is zero,
    /// meaning no gate at all.
    pub fn for_qps(qps: u32) -> Option<Self> {
        let rate = NonZeroU32::new(qps)?;
        let quota = Quota::per_second(rate).allow_burst(rate);
        Some(Self {
            limiter: GovLimiter::direct(quota),
            qps,
        })
    }

    /// Acquire a permit, waiting until one is available.
    ///
    /// This method is cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Try to acquire a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// The configured queries-per-second cap.
    pub fn qps(&self) -> u32 {
        self.qps
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("qps", &self.qps).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert_eq!(config.backoff_factor, 2.0);
    }

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);

        let result = retry_with_backoff(&RetryConfig::testing(), rx, "op", move || {
            let calls = Arc::clone(&calls2);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ReplicationError>("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_transient_then_success() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);

        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
        };

        let start = std::time::Instant::now();
        let result = retry_with_backoff(&config, rx, "flaky", move || {
            let calls = Arc::clone(&calls2);
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ReplicationError::http("flaky", 503, "unavailable"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two sleeps: 20ms + 40ms.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_retry_terminal_error_no_retry() {
        let (_tx, rx) = watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);

        let result: Result<()> =
            retry_with_backoff(&RetryConfig::testing(), rx, "denied", move || {
                let calls = Arc::clone(&calls2);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ReplicationError::http("denied", 403, "forbidden"))
                }
            })
            .await;

        assert!(matches!(result, Err(ReplicationError::Http { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let (_tx, rx) = watch::channel(false);

        let result: Result<()> =
            retry_with_backoff(&RetryConfig::testing(), rx, "hopeless", || async {
                Err(ReplicationError::http("hopeless", 503, "still down"))
            })
            .await;

        match result {
            Err(ReplicationError::RetriesExhausted { attempts, operation, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(operation, "hopeless");
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_cancel_during_backoff() {
        let (tx, rx) = watch::channel(false);
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        };

        let handle = tokio::spawn(async move {
            retry_with_backoff(&config, rx, "slow", || async {
                Err::<(), _>(ReplicationError::http("slow", 503, ""))
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("cancellation must interrupt the backoff sleep")
            .unwrap();
        assert!(matches!(result, Err(ReplicationError::Canceled)));
    }

    #[tokio::test]
    async fn test_retry_already_canceled() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result: Result<()> =
            retry_with_backoff(&RetryConfig::testing(), rx, "canceled", || async {
                panic!("operation must not run when already canceled")
            })
            .await;
        assert!(matches!(result, Err(ReplicationError::Canceled)));
    }

    #[test]
    fn test_rate_limiter_disabled_for_zero() {
        assert!(RateLimiter::for_qps(0).is_none());
    }

    #[test]
    fn test_rate_limiter_burst() {
        let limiter = RateLimiter::for_qps(5).unwrap();
        assert_eq!(limiter.qps(), 5);

        for _ in 0..5 {
            assert!(limiter.try_acquire(), "should acquire within burst");
        }
        assert!(!limiter.try_acquire(), "should fail after burst exhausted");
    }

    #[tokio::test]
    async fn test_rate_limiter_refills() {
        let limiter = RateLimiter::for_qps(1000).unwrap();
        limiter.acquire().await;

        let start = std::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(100), "should refill quickly");
    }
}
