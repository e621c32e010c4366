//! Bounded retry with exponential backoff.

use backon::{BackoffBuilder, ExponentialBuilder};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry policy for a flaky operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first call. 1 disables retrying.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f32,
    pub max_backoff: Duration,
    /// Add a random delay of up to `initial_backoff` to each wait.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    /// Waits between attempts, one per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier.max(1.0))
            .with_max_times(self.max_attempts.saturating_sub(1) as usize);
        let builder = if self.jitter { builder.with_jitter() } else { builder };
        builder.build()
    }

    /// Run `op`, retrying every failure.
    pub async fn run<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_if(name, op, |_| true).await
    }

    /// Run `op`, retrying only failures for which `retryable` returns true.
    pub async fn run_if<T, E, F, Fut, P>(&self, name: &str, mut op: F, retryable: P) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut delays = self.delays();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            operation = name,
                            retries = attempt - 1,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt >= self.max_attempts || !retryable(&e) {
                        return Err(e);
                    }
                    let delay = delays.next().unwrap_or(self.max_backoff);
                    tracing::warn!(
                        operation = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying failed operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        }
        .with_attempts(attempts)
        .with_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
            jitter: false,
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
        assert_eq!(RetryPolicy::none().delays().count(), 0);
    }

    #[test]
    fn test_jitter_only_lengthens_waits() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let first = policy.delays().next().unwrap();
            assert!(first >= Duration::from_millis(1000) && first <= Duration::from_millis(2000));
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = fast_policy(3)
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {} failed", n))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_policy(2)
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .await;
        assert_eq!(result, Err("boom".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = fast_policy(5)
            .run_if(
                "refused",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("refused".to_string())
                },
                |e| e != "refused",
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
