//! Bounded retry with exponential backoff.
use async_trait::async_trait;
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tracing::debug;

/// Retry bound and backoff schedule.
///
/// The delay before retry `n` (1-based) is `min(base_delay * 2^(n-1), max_delay)`.
///
/// # Examples
/// ```rust
/// use std::time::Duration;
/// use fatoora_pipeline::retry::RetryPolicy;
///
/// let policy = RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(250));
/// assert_eq!(policy.max_attempts(), 4);
/// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
/// assert_eq!(policy.delay_for(3), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn no_retries() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

/// Sleep abstraction so backoff can be exercised without real delays.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[async_trait]
impl<S: Sleeper + ?Sized> Sleeper for Arc<S> {
    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await
    }
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested delay.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

/// Final error of a [`retry`] run.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    /// `true` when the bound was reached, `false` when a permanent error stopped the run.
    pub exhausted: bool,
}

/// Run `op` until it succeeds, fails permanently, or the policy's attempt bound is hit.
///
/// `op` receives the 1-based attempt number.
///
/// # Errors
/// Returns [`RetryFailure`] carrying the last error and the number of attempts made.
pub async fn retry<T, E, F, Fut, P, S>(
    policy: &RetryPolicy,
    sleeper: &S,
    mut op: F,
    is_transient: P,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    S: Sleeper + ?Sized,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !is_transient(&error) {
            return Err(RetryFailure {
                error,
                attempts: attempt,
                exhausted: false,
            });
        }
        if attempt >= policy.max_attempts() {
            return Err(RetryFailure {
                error,
                attempts: attempt,
                exhausted: true,
            });
        }
        let delay = policy.delay_for(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "transient failure, backing off");
        sleeper.sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Fault {
        Timeout,
        Fatal,
    }

    fn is_timeout(fault: &Fault) -> bool {
        matches!(fault, Fault::Timeout)
    }

    #[test]
    fn delay_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(8));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn three_timeouts_then_success_makes_four_attempts() {
        let calls = AtomicU32::new(0);
        let sleeper = RecordingSleeper::new();
        let result = retry(
            &RetryPolicy::default(),
            &sleeper,
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { if n <= 3 { Err(Fault::Timeout) } else { Ok(n) } }
            },
            is_timeout,
        )
        .await;

        assert_eq!(result.expect("success"), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000)
            ]
        );
    }

    #[tokio::test]
    async fn exhaustion_stops_at_bound() {
        let calls = AtomicU32::new(0);
        let sleeper = RecordingSleeper::new();
        let failure = retry(
            &RetryPolicy::default(),
            &sleeper,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Fault::Timeout) }
            },
            is_timeout,
        )
        .await
        .expect_err("exhausted");

        assert!(failure.exhausted);
        assert_eq!(failure.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(sleeper.delays().len(), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let sleeper = RecordingSleeper::new();
        let failure = retry(
            &RetryPolicy::default(),
            &sleeper,
            |_| async { Err::<(), _>(Fault::Fatal) },
            is_timeout,
        )
        .await
        .expect_err("fatal");

        assert!(!failure.exhausted);
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.error, Fault::Fatal);
        assert!(sleeper.delays().is_empty());
    }
}
