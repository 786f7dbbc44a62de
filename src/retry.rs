//! The one retry policy shared by the tool invoker and the oracle client.
//!
//! A policy is a capped attempt count, an exponential backoff schedule with
//! jitter, and an optional budget on the total time spent sleeping. The
//! caller supplies the retryable-error predicate, and optionally a hint
//! function for server-suggested delays; the final delay is the larger of the
//! computed one and the hint, still capped by `max_delay`.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub base_delay: Duration,
    /// Cap on a single delay
    pub max_delay: Duration,
    /// Jitter as a fraction of the delay, 0.0 to 1.0
    pub jitter: f64,
    /// Cap on the sum of all delays
    pub max_total_wait: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_total_wait: None,
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub struct RetryError<E> {
    /// The last error observed
    pub error: E,
    /// Attempts made, including the failing one
    pub attempts: u32,
    /// `true` when the error was retryable but the attempt or wait budget ran out
    pub exhausted: bool,
}

impl RetryPolicy {
    /// Retries with no delay in between.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            max_total_wait: None,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::immediate(1)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, jittered,
    /// capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = base_ms * 2f64.powi(retry.min(30) as i32);
        let capped = exp.min(max_ms);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let jittered = if jitter > 0.0 && capped > 0.0 {
            let range = capped * jitter;
            let offset = rand::rng().random_range(-range..range);
            (capped + offset).clamp(0.0, max_ms)
        } else {
            capped
        };

        Duration::from_millis(jittered as u64)
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        label: &str,
        op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_with_hint(label, op, retryable, |_| None).await
    }

    /// Like [`RetryPolicy::run`], with a per-error delay hint.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run_with_hint<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
        hint: impl Fn(&E) -> Option<Duration>,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.attempts();
        let mut waited = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !retryable(&error) {
                return Err(RetryError {
                    error,
                    attempts: attempt,
                    exhausted: false,
                });
            }
            if attempt >= max_attempts {
                warn!(label, attempts = attempt, error = %error, "retry attempts exhausted");
                return Err(RetryError {
                    error,
                    attempts: attempt,
                    exhausted: true,
                });
            }

            let computed = self.delay_for(attempt - 1);
            let delay = match hint(&error) {
                Some(h) => computed.max(h).min(self.max_delay),
                None => computed,
            };

            if let Some(budget) = self.max_total_wait
                && waited + delay > budget
            {
                warn!(
                    label,
                    attempts = attempt,
                    waited_ms = waited.as_millis() as u64,
                    "retry wait budget exhausted"
                );
                return Err(RetryError {
                    error,
                    attempts: attempt,
                    exhausted: true,
                });
            }

            warn!(
                label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retrying"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            waited += delay;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
            max_total_wait: None,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            jitter: 0.0,
            max_total_wait: None,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            jitter: 0.5,
            max_total_wait: None,
        };
        for _ in 0..50 {
            let d = policy.delay_for(0).as_millis();
            assert!((500..=1500).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_immediate_policy_has_no_delay() {
        let policy = RetryPolicy::immediate(3);
        assert_eq!(policy.delay_for(5), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<&str, RetryError<String>> = fast(5)
            .run(
                "test",
                |attempt| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 3 {
                            Err("busy".to_string())
                        } else {
                            Ok("done")
                        }
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_after_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = fast(4)
            .run(
                "test",
                |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("always".to_string()) }
                },
                |_| true,
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts, 4);
        assert!(err.exhausted);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = fast(5)
            .run(
                "test",
                |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("fatal".to_string()) }
                },
                |e: &String| e != "fatal",
            )
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!err.exhausted);
    }

    #[tokio::test]
    async fn test_total_wait_budget_stops_early() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
            max_total_wait: Some(Duration::from_millis(50)),
        };
        let err = policy
            .run(
                "test",
                |_| async { Err::<(), _>("slow".to_string()) },
                |_| true,
            )
            .await
            .unwrap_err();
        // 20 + 20 fits the budget, a third sleep would not
        assert_eq!(err.attempts, 3);
        assert!(err.exhausted);
    }

    #[tokio::test]
    async fn test_hint_raises_delay() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(200),
            jitter: 0.0,
            max_total_wait: None,
        };
        let started = std::time::Instant::now();
        let _ = policy
            .run_with_hint(
                "test",
                |_| async { Err::<(), _>("quota".to_string()) },
                |_| true,
                |_| Some(Duration::from_millis(40)),
            )
            .await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }
}
