//! HTTP request handlers.

use super::AppState;
use crate::db::ProbeResult;
use crate::metrics::MetricsSnapshot;
use crate::scheduler::{HealthReport, HealthStatus};

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    #[serde(flatten)]
    pub scheduler: HealthReport,
    pub is_leader: bool,
    pub node_id: String,
}

/// Scheduler liveness. A follower never ticks, so it reports UP while standing by.
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let mut report = state.health.report();
    let is_leader = state.gate.is_leader();

    if !is_leader {
        report.status = HealthStatus::Up;
        report.reason = Some("Standing by: not the leader".to_string());
    }

    let code = match report.status {
        HealthStatus::Up => StatusCode::OK,
        HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
    };

    let body = HealthResponse {
        scheduler: report,
        is_leader,
        node_id: state.gate.node_id().to_string(),
    };
    (code, Json(body))
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub latest_result: Option<ProbeResult>,
    pub is_leader: bool,
    pub node_id: String,
    pub metrics: MetricsSnapshot,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        latest_result: state.service.latest_result().await,
        is_leader: state.gate.is_leader(),
        node_id: state.gate.node_id().to_string(),
        metrics: state.metrics.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{AlwaysLeader, LeadershipGate};
    use crate::db::memory::{InMemoryProbeRepository, InMemoryTargetRepository};
    use crate::db::{ProbeRepository, ProbeRequest, ProbeStatus, Target};
    use crate::events::tests::result_at;
    use crate::events::{EventBus, ProbeResultEventPublisher};
    use crate::metrics::ProbeMetrics;
    use crate::probe::ProbeStrategyFactory;
    use crate::scheduler::{PersistenceMode, ProbeService, RoundRobinTargetSelector, SchedulerHealth};
    use crate::web::router;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    struct Follower;

    impl LeadershipGate for Follower {
        fn is_leader(&self) -> bool {
            false
        }

        fn node_id(&self) -> &str {
            "node-b"
        }
    }

    fn state(
        gate: Arc<dyn LeadershipGate>,
        health: SchedulerHealth,
        probes: Arc<InMemoryProbeRepository>,
    ) -> AppState {
        let targets = Arc::new(InMemoryTargetRepository::new());
        let metrics = Arc::new(ProbeMetrics::new());
        let service = ProbeService::new(
            Arc::new(RoundRobinTargetSelector::new(targets.clone())),
            ProbeStrategyFactory::new(),
            probes.clone(),
            targets,
            Arc::new(ProbeResultEventPublisher::new(probes, EventBus::default())),
            metrics.clone(),
            PersistenceMode::Sync,
        );
        AppState {
            service: Arc::new(service),
            health: Arc::new(health),
            gate,
            metrics,
        }
    }

    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_health_up() {
        let base = serve(state(
            Arc::new(AlwaysLeader::new()),
            SchedulerHealth::new(),
            Arc::new(InMemoryProbeRepository::new()),
        ))
        .await;

        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "UP");
        assert_eq!(body["isLeader"], true);
        assert_eq!(body["successRate"], "N/A");
    }

    #[tokio::test]
    async fn test_stale_leader_is_unavailable() {
        let stale = SchedulerHealth::starting_at(Utc::now() - Duration::seconds(60));
        let base = serve(state(
            Arc::new(AlwaysLeader::new()),
            stale,
            Arc::new(InMemoryProbeRepository::new()),
        ))
        .await;

        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "DOWN");
        assert!(body["reason"].as_str().unwrap().contains("10 seconds"));
    }

    #[tokio::test]
    async fn test_stale_follower_stays_up() {
        let stale = SchedulerHealth::starting_at(Utc::now() - Duration::seconds(60));
        let base = serve(state(Arc::new(Follower), stale, Arc::new(InMemoryProbeRepository::new()))).await;

        let resp = reqwest::get(format!("{}/health", base)).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["isLeader"], false);
        assert_eq!(body["nodeId"], "node-b");
    }

    #[tokio::test]
    async fn test_status_reports_latest_result() {
        let probes = Arc::new(InMemoryProbeRepository::new());
        let target = Target::new("web", "example.org", 80);
        let req = ProbeRequest::for_target(&target, "cycle-1");
        probes.save(&result_at(&req, ProbeStatus::Down, 0)).await.unwrap();

        let base = serve(state(Arc::new(AlwaysLeader::new()), SchedulerHealth::new(), probes)).await;
        let body: serde_json::Value = reqwest::get(format!("{}/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        assert_eq!(body["latestResult"]["status"], "DOWN");
        assert_eq!(body["latestResult"]["probeCycleId"], "cycle-1");
        assert_eq!(body["isLeader"], true);
        assert!(body["metrics"]["probeExecutions"].is_array());
    }
}
