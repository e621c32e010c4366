//! Retry and circuit-breaker wrappers for flaky I/O.

mod circuit_breaker;
mod retry;

pub use circuit_breaker::*;
pub use retry::*;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ResilienceError<E> {
    /// The breaker rejected the call without touching the dependency.
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),
    #[error("{0}")]
    Inner(E),
}

/// Retry and breaker knobs for one protected dependency.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResilienceConfig {
    pub retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
}

/// Breaker around retry: a logical call counts once toward the failure rate,
/// however many attempts the retry loop made.
#[derive(Clone)]
pub struct Resilience {
    name: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl Resilience {
    pub fn new(name: &str, config: ResilienceConfig) -> Self {
        Self {
            name: name.to_string(),
            retry: config.retry,
            breaker: Arc::new(CircuitBreaker::new(name, config.breaker)),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, ResilienceError<E>>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.breaker.call(self.retry.run(&self.name, op)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_retry_exhaustion_counts_as_one_breaker_failure() {
        let resilience = Resilience::new(
            "store",
            ResilienceConfig {
                retry: RetryPolicy::none()
                    .with_attempts(3)
                    .with_backoff(Duration::from_millis(1)),
                breaker: CircuitBreakerConfig {
                    minimum_calls: 2,
                    ..CircuitBreakerConfig::default()
                },
            },
        );
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = resilience
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("unreachable".to_string())
            })
            .await;

        assert_eq!(result, Err(ResilienceError::Inner("unreachable".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(resilience.breaker().state(), CircuitState::Closed);

        let _ = resilience
            .call(|| async { Err::<(), _>("unreachable".to_string()) })
            .await;
        assert_eq!(resilience.breaker().state(), CircuitState::Open);
        let rejected = resilience.call(|| async { Ok::<(), String>(()) }).await;
        assert_eq!(rejected, Err(ResilienceError::CircuitOpen("store".to_string())));
    }
}
