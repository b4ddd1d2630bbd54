//! Bounded retry with jittered backoff.
//!
//! One policy object is shared by lock-batch acquisition and by the
//! transaction coordinator's whole-transaction retry, so both back off the
//! same way and both give up after a fixed number of attempts.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tessera_config::{LockConfig, TransactionConfig};

/// Retry policy: at most `max_attempts` tries, sleeping a random delay in
/// `[0, min(base_delay * (attempt + 1), max_delay)]` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedRetry {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl BoundedRetry {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Retries without sleeping. Used by tests and by callers that do their own pacing.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    pub fn for_locks(config: &LockConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.retry_delay_ms),
            Duration::from_millis(config.max_retry_delay_ms),
        )
    }

    pub fn for_transactions(config: &TransactionConfig) -> Self {
        Self::new(
            config.max_autoretry,
            Duration::from_millis(config.autoretry_delay_ms),
            Duration::from_millis(config.max_autoretry_delay_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Upper bound of the delay slept after the given (zero-based) attempt.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.saturating_add(1))
            .min(self.max_delay)
    }

    /// Random delay to sleep after the given attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let nanos = u64::try_from(ceiling.as_nanos()).unwrap_or(u64::MAX);
        Duration::from_nanos(rand::thread_rng().gen_range(0..=nanos))
    }

    /// Runs `op` until it succeeds, fails with an error `should_retry` rejects,
    /// or the attempt budget is spent. `op` receives the zero-based attempt.
    pub fn run<T, E>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, E>,
        should_retry: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if should_retry(&err) && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn stops_after_max_attempts() {
        let policy = BoundedRetry::immediate(4);
        let mut calls = 0;
        let result: Result<(), &str> = policy.run(
            |_| {
                calls += 1;
                Err("busy")
            },
            |_| true,
        );
        assert_eq!(result, Err("busy"));
        assert_eq!(calls, 4);
    }

    #[test]
    fn returns_first_success() {
        let policy = BoundedRetry::immediate(5);
        let result: Result<u32, &str> =
            policy.run(|attempt| if attempt < 2 { Err("busy") } else { Ok(attempt) }, |_| true);
        assert_eq!(result, Ok(2));
    }

    #[test]
    fn non_retryable_errors_surface_immediately() {
        let policy = BoundedRetry::immediate(5);
        let mut calls = 0;
        let result: Result<(), &str> = policy.run(
            |_| {
                calls += 1;
                Err("fatal")
            },
            |err| *err != "fatal",
        );
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_attempts_means_one() {
        assert_eq!(BoundedRetry::immediate(0).max_attempts(), 1);
    }

    #[test]
    fn ceiling_grows_then_caps() {
        let policy = BoundedRetry::new(10, Duration::from_millis(10), Duration::from_millis(25));
        assert_eq!(policy.ceiling(0), Duration::from_millis(10));
        assert_eq!(policy.ceiling(1), Duration::from_millis(20));
        assert_eq!(policy.ceiling(5), Duration::from_millis(25));
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_ceiling(attempt in 0u32..50, base in 0u64..100, max in 0u64..500) {
            let policy = BoundedRetry::new(3, Duration::from_millis(base), Duration::from_millis(max));
            prop_assert!(policy.backoff(attempt) <= policy.ceiling(attempt));
        }
    }
}
