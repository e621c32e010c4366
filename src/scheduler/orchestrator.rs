//! Probe orchestration: pick a target, probe it, record and publish the result.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use super::RoundRobinTargetSelector;
use crate::db::{DbError, ProbeRepository, ProbeRequest, ProbeResult, ProbeStatus, Target, TargetRepository};
use crate::events::ProbeResultEventPublisher;
use crate::logging::ProbeContext;
use crate::metrics::ProbeMetrics;
use crate::probe::{ProbeError, ProbeStrategyFactory};

#[derive(Error, Debug)]
pub enum ProbeServiceError {
    #[error("invalid target id: {0}")]
    InvalidTargetId(String),
    #[error(transparent)]
    Repository(#[from] DbError),
}

/// Who stores probe results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceMode {
    /// The orchestrator saves before publishing.
    #[default]
    Sync,
    /// The persistence listener saves from the event stream.
    Listener,
}

impl FromStr for PersistenceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sync" => Ok(PersistenceMode::Sync),
            "listener" => Ok(PersistenceMode::Listener),
            other => Err(format!("unknown persistence mode: {}", other)),
        }
    }
}

pub struct ProbeService {
    selector: Arc<RoundRobinTargetSelector>,
    strategies: ProbeStrategyFactory,
    probes: Arc<dyn ProbeRepository>,
    targets: Arc<dyn TargetRepository>,
    publisher: Arc<ProbeResultEventPublisher>,
    metrics: Arc<ProbeMetrics>,
    persistence: PersistenceMode,
}

impl ProbeService {
    pub fn new(
        selector: Arc<RoundRobinTargetSelector>,
        strategies: ProbeStrategyFactory,
        probes: Arc<dyn ProbeRepository>,
        targets: Arc<dyn TargetRepository>,
        publisher: Arc<ProbeResultEventPublisher>,
        metrics: Arc<ProbeMetrics>,
        persistence: PersistenceMode,
    ) -> Self {
        Self {
            selector,
            strategies,
            probes,
            targets,
            publisher,
            metrics,
            persistence,
        }
    }

    /// One scheduler tick: probe the next target in rotation.
    ///
    /// Never fails. Selection errors and empty rotations are logged and the
    /// tick ends without a result.
    pub async fn run_scheduled_probes(&self, parent: Option<&ProbeContext>) -> Option<ProbeResult> {
        let ctx = ProbeContext::resolve(parent);
        let span = ctx.span();

        async {
            tracing::debug!("Running scheduled probes");
            match self.selector.next_target().await {
                Ok(Some(target)) => Some(self.probe_target(&target, &ctx).await),
                Ok(None) => {
                    tracing::warn!("No targets configured - skipping probe tick");
                    None
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to select next target");
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Probe `target` within the cycle of `ctx` and return the recorded result.
    pub async fn probe_target(&self, target: &Target, ctx: &ProbeContext) -> ProbeResult {
        let ctx = ctx.for_target(&target.id.to_string());
        let span = ctx.span();

        async {
            tracing::debug!(host = %target.host, port = target.port, "Initiating probe for target");
            let request = ProbeRequest::for_target(target, &ctx.probe_cycle_id);

            let result = match self.execute(target, &request).await {
                Ok(result) => result.aligned_to(&ctx.probe_cycle_id),
                Err(e) => {
                    let message = match &e {
                        ProbeError::Unexpected(_) => e.to_string(),
                        other => ProbeError::Unexpected(other.to_string()).to_string(),
                    };
                    tracing::error!(
                        host = %target.host,
                        port = target.port,
                        error = %message,
                        "Unexpected error during probe"
                    );
                    ProbeResult::down(&request, target.probe_method.unwrap_or_default(), Utc::now(), message)
                }
            };

            // Previous status must be read before this result is stored.
            let event = self.publisher.prepare_event(result).await;

            if self.persistence == PersistenceMode::Sync {
                if let Err(e) = self.probes.save(&event.result).await {
                    tracing::error!(error = %e, "Failed to persist probe result");
                }
            }

            let result = event.result.clone();
            self.metrics
                .record_probe_execution(&result.target_id, result.status, result.method);
            if let (ProbeStatus::Up, Some(latency)) = (result.status, result.latency_ms) {
                self.metrics
                    .record_probe_latency(&result.target_id, result.method, latency);
            }

            tracing::info!(
                host = %target.host,
                port = target.port,
                status = %result.status,
                latency_ms = ?result.latency_ms,
                method = %result.method,
                "Probe completed for target"
            );

            self.publisher.emit(event);
            result
        }
        .instrument(span)
        .await
    }

    /// Probe a target by id, outside the schedule. A missing target is logged
    /// and produces no result.
    pub async fn probe(&self, target_id: &str) -> Result<Option<ProbeResult>, ProbeServiceError> {
        let id = Uuid::parse_str(target_id)
            .map_err(|_| ProbeServiceError::InvalidTargetId(target_id.to_string()))?;

        match self.targets.find_by_id(&id).await? {
            Some(target) => Ok(Some(self.probe_target(&target, &ProbeContext::new()).await)),
            None => {
                tracing::error!(target_id, "Cannot probe target: no target found");
                Ok(None)
            }
        }
    }

    pub async fn recent_results(&self, target_id: &str, limit: usize) -> Vec<ProbeResult> {
        match self.probes.find_recent(target_id, limit).await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(target_id, limit, error = %e, "Failed to retrieve recent results");
                Vec::new()
            }
        }
    }

    /// Results in a time range when both bounds are given, else the most recent.
    pub async fn history(
        &self,
        target_id: &str,
        limit: usize,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Vec<ProbeResult> {
        let fetched = match (start, end) {
            (Some(start), Some(end)) => self
                .probes
                .find_between(target_id, start, end)
                .await
                .map(|results| results.into_iter().take(limit).collect()),
            _ => self.probes.find_recent(target_id, limit).await,
        };
        fetched.unwrap_or_else(|e| {
            tracing::error!(target_id, limit, error = %e, "Failed to retrieve history for target");
            Vec::new()
        })
    }

    pub async fn latest_result(&self) -> Option<ProbeResult> {
        match self.probes.find_latest().await {
            Ok(latest) => latest,
            Err(e) => {
                tracing::error!(error = %e, "Failed to retrieve latest result");
                None
            }
        }
    }

    async fn execute(&self, target: &Target, request: &ProbeRequest) -> Result<ProbeResult, ProbeError> {
        let strategy = self.strategies.strategy_for(target)?;
        match AssertUnwindSafe(strategy.probe(request)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(ProbeError::Unexpected(panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "strategy panicked".to_string()
    }
}
