//! Vigil - Probe Execution Service

use vigil::cache::InMemoryCache;
use vigil::config::ServerConfig;
use vigil::coordination::{AlwaysLeader, LeaderElectionService, LeadershipGate, SqliteLockBackend};
use vigil::db::{ProbeRepository, ResilientProbeRepository, Store, Target, TargetRepository};
use vigil::events::{
    CacheInvalidationListener, EventBus, PersistenceListener, ProbeResultEventPublisher,
    StateChangeNotificationListener,
};
use vigil::logging;
use vigil::metrics::ProbeMetrics;
use vigil::notification::{NotificationService, WebhookNotificationProvider};
use vigil::pool::WorkerPool;
use vigil::probe::{IcmpProbeStrategy, ProbeStrategyFactory, TcpProbeStrategy};
use vigil::resilience::Resilience;
use vigil::scheduler::{PersistenceMode, ProbeService, RoundRobinTargetSelector, Scheduler, SchedulerHealth};
use vigil::web::{AppState, Server};

use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    logging::init_tracing()?;

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Vigil on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Store::new(&cfg.db_path)?;
    tracing::info!("Database initialized successfully");

    // Add sample target if none exist
    if store.get_targets()?.is_empty() {
        tracing::info!("Adding sample target: example.com:443");
        store.add_target(&Target::new("Example", "example.com", 443))?;
    }

    let metrics = Arc::new(ProbeMetrics::new());
    let targets: Arc<dyn TargetRepository> = Arc::new(store.clone());
    let probes: Arc<dyn ProbeRepository> = Arc::new(ResilientProbeRepository::new(
        Arc::new(store.clone()),
        Resilience::new("probe-store", cfg.store_resilience()),
        metrics.clone(),
    ));

    let strategies = ProbeStrategyFactory::new()
        .register(Arc::new(TcpProbeStrategy::new(
            cfg.tcp_timeout(),
            cfg.tcp_retry(),
            cfg.tcp_refused_log_window(),
        )))
        .register(Arc::new(IcmpProbeStrategy::new(cfg.icmp_timeout(), cfg.icmp_packet_size)));

    // Event listeners
    let bus = EventBus::default();
    if cfg.persistence_mode == PersistenceMode::Listener {
        bus.subscribe(Arc::new(PersistenceListener::new(probes.clone())));
    }
    bus.subscribe(Arc::new(CacheInvalidationListener::new(Arc::new(InMemoryCache::new()))));
    let notifications = Arc::new(NotificationService::new(
        Arc::new(WebhookNotificationProvider::new(cfg.notifications_timeout())),
        cfg.notifications_enabled,
    ));
    bus.subscribe(Arc::new(StateChangeNotificationListener::new(
        notifications,
        probes.clone(),
        cfg.notifications_default_webhook_url.clone(),
    )));
    let publisher = Arc::new(ProbeResultEventPublisher::new(probes.clone(), bus.clone()));

    let service = Arc::new(ProbeService::new(
        Arc::new(RoundRobinTargetSelector::new(targets.clone())),
        strategies,
        probes,
        targets,
        publisher,
        metrics.clone(),
        cfg.persistence_mode,
    ));

    // Leadership
    let election = if cfg.leader_election_enabled {
        let election = Arc::new(LeaderElectionService::new(
            Arc::new(SqliteLockBackend::new(store.clone())),
            &cfg.leader_lock_key,
            cfg.leader_lease(),
        ));
        election.start();
        Some(election)
    } else {
        tracing::info!("Leader election disabled, this node always schedules");
        None
    };
    let gate: Arc<dyn LeadershipGate> = match &election {
        Some(election) => election.clone() as Arc<dyn LeadershipGate>,
        None => Arc::new(AlwaysLeader::new()),
    };

    // Start scheduler
    let pool = Arc::new(WorkerPool::new("probe-exec", cfg.pool_config()));
    let health = Arc::new(SchedulerHealth::new());
    let scheduler = Arc::new(Scheduler::new(
        service.clone(),
        gate.clone(),
        pool.clone(),
        health.clone(),
        cfg.probe_interval(),
    ));
    let scheduler_task = scheduler.start();

    // Start status server
    let server = Server::new(
        cfg.clone(),
        AppState {
            service,
            health,
            gate,
            metrics,
        },
    );
    server.start(shutdown_signal()).await?;

    scheduler.stop();
    let _ = scheduler_task.await;
    if !pool.shutdown(cfg.pool_shutdown_grace()).await {
        tracing::warn!("Probe pool did not terminate gracefully");
    }
    if !bus.shutdown(cfg.pool_shutdown_grace()).await {
        tracing::warn!("Event listeners did not drain in time");
    }
    if let Some(election) = election {
        election.shutdown().await;
    }

    tracing::info!("Vigil stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}
