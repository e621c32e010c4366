//! Scheduler module: target rotation, probe orchestration and the tick driver.

mod health;
mod orchestrator;
mod selector;

pub use health::*;
pub use orchestrator::*;
pub use selector::*;

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::coordination::LeadershipGate;
use crate::pool::WorkerPool;

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(1000);

/// Fires the orchestrator on a fixed delay, on the leader only.
pub struct Scheduler {
    service: Arc<ProbeService>,
    gate: Arc<dyn LeadershipGate>,
    pool: Arc<WorkerPool>,
    health: Arc<SchedulerHealth>,
    interval: Duration,
    stop_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new(
        service: Arc<ProbeService>,
        gate: Arc<dyn LeadershipGate>,
        pool: Arc<WorkerPool>,
        health: Arc<SchedulerHealth>,
        interval: Duration,
    ) -> Self {
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            service,
            gate,
            pool,
            health,
            interval,
            stop_tx,
        }
    }

    pub fn health(&self) -> &Arc<SchedulerHealth> {
        &self.health
    }

    /// Dispatch one tick onto the pool. Returns false when skipped or rejected.
    pub fn tick(&self) -> bool {
        if !self.gate.is_leader() {
            return false;
        }

        let service = self.service.clone();
        let health = self.health.clone();
        let submitted = self.pool.submit(async move {
            let outcome = AssertUnwindSafe(service.run_scheduled_probes(None))
                .catch_unwind()
                .await;
            health.record_execution();
            if outcome.is_err() {
                tracing::error!("Scheduled probe tick panicked");
                health.record_failure();
            }
        });

        match submitted {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Error in scheduled probe execution");
                self.health.record_failure();
                false
            }
        }
    }

    /// Start the timer loop. Each tick is dispatched `interval` after the previous one.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            node_id = %self.gate.node_id(),
            "Starting probe scheduler"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = tokio::time::sleep(scheduler.interval) => {
                        scheduler.tick();
                    }
                }
            }
            tracing::info!("Probe scheduler stopped");
        })
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}
