//! Probe repository decorated with retry, circuit breaker and metrics.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

use super::models::ProbeResult;
use super::repository::ProbeRepository;
use super::DbError;
use crate::metrics::ProbeMetrics;
use crate::resilience::{Resilience, ResilienceError};

pub struct ResilientProbeRepository {
    inner: Arc<dyn ProbeRepository>,
    resilience: Resilience,
    metrics: Arc<ProbeMetrics>,
}

impl ResilientProbeRepository {
    pub fn new(inner: Arc<dyn ProbeRepository>, resilience: Resilience, metrics: Arc<ProbeMetrics>) -> Self {
        Self {
            inner,
            resilience,
            metrics,
        }
    }

    fn finish<T>(
        &self,
        operation: &str,
        started: Instant,
        outcome: Result<T, ResilienceError<DbError>>,
        context: impl Fn() -> String,
    ) -> Result<T, DbError> {
        let elapsed = started.elapsed();
        match outcome {
            Ok(value) => {
                self.metrics.record_store_operation(operation, true, elapsed);
                Ok(value)
            }
            Err(ResilienceError::CircuitOpen(name)) => {
                self.metrics.record_store_operation(operation, false, elapsed);
                Err(DbError::Unavailable(format!("{} circuit breaker is open", name)))
            }
            Err(ResilienceError::Inner(e)) => {
                self.metrics.record_store_operation(operation, false, elapsed);
                tracing::error!(operation, error = %e, "{}", context());
                Err(DbError::Repository(format!("{}: {}", context(), e)))
            }
        }
    }
}

#[async_trait]
impl ProbeRepository for ResilientProbeRepository {
    async fn save(&self, result: &ProbeResult) -> Result<(), DbError> {
        let started = Instant::now();
        let outcome = self.resilience.call(|| self.inner.save(result)).await;
        self.finish("save", started, outcome, || {
            format!("Failed to save probe result for target {}", result.target_id)
        })
    }

    async fn find_recent(&self, target_id: &str, limit: usize) -> Result<Vec<ProbeResult>, DbError> {
        let started = Instant::now();
        let outcome = self
            .resilience
            .call(|| self.inner.find_recent(target_id, limit))
            .await;
        self.finish("find_recent", started, outcome, || {
            format!("Failed to fetch recent probe results for target {}", target_id)
        })
    }

    async fn find_latest(&self) -> Result<Option<ProbeResult>, DbError> {
        let started = Instant::now();
        let outcome = self.resilience.call(|| self.inner.find_latest()).await;
        self.finish("find_latest", started, outcome, || {
            "Failed to fetch latest probe result".to_string()
        })
    }

    async fn find_between(
        &self,
        target_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProbeResult>, DbError> {
        let started = Instant::now();
        let outcome = self
            .resilience
            .call(|| self.inner.find_between(target_id, start, end))
            .await;
        self.finish("find_between", started, outcome, || {
            format!(
                "Failed to fetch history for target {} between {} - {}",
                target_id, start, end
            )
        })
    }
}
