//! Lease-based leader election.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{DistributedLockService, LockBackend};

pub const DEFAULT_LEADER_LOCK_KEY: &str = "vigil:leader-election:lock";
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

/// Decides whether this replica may run scheduled work.
pub trait LeadershipGate: Send + Sync {
    fn is_leader(&self) -> bool;

    fn node_id(&self) -> &str;
}

/// Gate used when leader election is disabled.
pub struct AlwaysLeader {
    node_id: String,
}

impl AlwaysLeader {
    pub fn new() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
        }
    }
}

impl Default for AlwaysLeader {
    fn default() -> Self {
        Self::new()
    }
}

impl LeadershipGate for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }
}

/// FOLLOWER until the lease is won, LEADER until a renewal fails.
pub struct LeaderElectionService {
    locks: DistributedLockService,
    lock_key: String,
    lease: Duration,
    node_id: String,
    leader: AtomicBool,
    stop_tx: broadcast::Sender<()>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElectionService {
    pub fn new(backend: Arc<dyn LockBackend>, lock_key: &str, lease: Duration) -> Self {
        let node_id = Uuid::new_v4().to_string();
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            locks: DistributedLockService::new(backend, &node_id),
            lock_key: lock_key.to_string(),
            lease,
            node_id,
            leader: AtomicBool::new(false),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Half the lease, so a healthy leader renews well before expiry.
    pub fn renew_interval(&self) -> Duration {
        (self.lease / 2).max(Duration::from_millis(1))
    }

    /// Acquire or renew the lease without waiting. Returns current leadership.
    pub async fn attempt_election(&self) -> bool {
        let acquired = self.locks.try_lock(&self.lock_key, Duration::ZERO, self.lease).await;
        let was_leader = self.leader.swap(acquired, Ordering::SeqCst);

        if acquired && !was_leader {
            tracing::info!(node_id = %self.node_id, "Node elected as leader");
        } else if !acquired && was_leader {
            tracing::info!(node_id = %self.node_id, "Node lost leadership");
        }
        acquired
    }

    /// Run elections on the renewal interval until [`shutdown`](Self::shutdown).
    pub fn start(self: &Arc<Self>) {
        let service = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tracing::info!(node_id = %self.node_id, "Leader election service started");

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(service.renew_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,
                    _ = interval.tick() => {
                        service.attempt_election().await;
                    }
                }
            }
        });

        match self.task.lock() {
            Ok(mut slot) => *slot = Some(task),
            Err(_) => tracing::error!("Election task slot poisoned, shutdown will not wait for it"),
        }
    }

    /// Stop renewing and give up the lease if held.
    ///
    /// Waits for an in-flight renewal to finish first, so the release cannot
    /// be overtaken by a late acquire.
    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(());
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(node_id = %self.node_id, error = %e, "Election task ended abnormally");
            }
        }
        if self.leader.swap(false, Ordering::SeqCst) {
            tracing::info!(node_id = %self.node_id, "Releasing leadership on shutdown");
            self.locks.unlock(&self.lock_key).await;
        }
    }
}

impl LeadershipGate for LeaderElectionService {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn node_id(&self) -> &str {
        &self.node_id
    }
}
