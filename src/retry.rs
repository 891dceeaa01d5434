//! Bounded exponential-backoff retry, shared by metadata provisioning and
//! per-binding message handling.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// A retry policy with exponential backoff between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Coefficient applied to the backoff after every failed attempt.
    pub multiplier: u32,
    /// Cap on the backoff between any two attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1000),
            multiplier: 2,
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Terminal result of a retried delivery. Dead-lettering and propagation are
/// branches over this value, not exception paths.
#[derive(Debug)]
pub enum RetryOutcome<E> {
    Success,
    Exhausted(E),
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            ..Self::default()
        }
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff_interval(&self, attempt: u32) -> Duration {
        self.multiplier
            .checked_pow(attempt.saturating_sub(1))
            .and_then(|factor| self.initial_backoff.checked_mul(factor))
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds or `max_attempts` is reached, sleeping the
    /// backoff interval between attempts. The closure receives the 1-based
    /// attempt number. Returns the last error on exhaustion.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_attempts {
                        return Err(error);
                    }
                    let backoff = self.backoff_interval(attempt);
                    debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Like [`execute`](Self::execute) but collapses the result into a tagged
    /// outcome for callers that branch on exhaustion instead of propagating.
    pub async fn run<E, F, Fut>(&self, op: F) -> RetryOutcome<E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        match self.execute(op).await {
            Ok(()) => RetryOutcome::Success,
            Err(error) => RetryOutcome::Exhausted(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2,
            max_backoff: Duration::from_millis(1000),
        };
        assert_eq!(policy.backoff_interval(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_interval(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_interval(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_interval(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_interval(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff_interval(9), Duration::from_millis(1000));
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_interval(u32::MAX), policy.max_backoff);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_succeeds_after_transient_failures() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            multiplier: 2,
            max_backoff: Duration::from_secs(1),
        };
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<u32, &str> = policy
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("not yet")
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two backoffs: 10ms + 20ms of (virtual) time.
        assert_eq!(started.elapsed(), Duration::from_millis(30));
    }

    #[test]
    fn builders_assemble_a_full_policy() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100))
            .with_multiplier(2)
            .with_max_backoff(Duration::from_millis(1000));
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.backoff_interval(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_interval(5), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_exhaustion_with_last_error() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1))
            .with_multiplier(1)
            .with_max_backoff(Duration::from_millis(1));
        let calls = AtomicU32::new(0);

        let outcome = policy
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(format!("attempt {attempt} failed")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match outcome {
            RetryOutcome::Exhausted(error) => assert_eq!(error, "attempt 4 failed"),
            RetryOutcome::Success => panic!("expected exhaustion"),
        }
    }
}
