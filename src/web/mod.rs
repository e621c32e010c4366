//! Status server: health and probe status endpoints.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::coordination::LeadershipGate;
use crate::metrics::ProbeMetrics;
use crate::scheduler::{ProbeService, SchedulerHealth};

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ProbeService>,
    pub health: Arc<SchedulerHealth>,
    pub gate: Arc<dyn LeadershipGate>,
    pub metrics: Arc<ProbeMetrics>,
}

/// Web server for Vigil.
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        router(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.http_port));
        let router = self.routes();

        tracing::info!("Status server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

    Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/status", get(handlers::handle_status))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
