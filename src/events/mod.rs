//! Probe result events.
//!
//! Every probe produces one [`ProbeResultEvent`]. The publisher decides
//! whether the result is a state change and fans the event out over a
//! broadcast channel. Each subscribed listener runs in its own task, so
//! listeners make no ordering assumptions about one another.

mod listeners;

pub use listeners::*;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::db::{ProbeRepository, ProbeResult, ProbeStatus};

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResultEvent {
    pub result: ProbeResult,
    pub is_state_change: bool,
    /// Status of the stored result that preceded this one, if any.
    pub previous_status: Option<ProbeStatus>,
}

#[async_trait]
pub trait ProbeResultListener: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_event(&self, event: &ProbeResultEvent);
}

/// In-process publish/subscribe channel for probe result events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Arc<ProbeResultEvent>>,
    stop_tx: broadcast::Sender<()>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let (stop_tx, _) = broadcast::channel(1);
        Self {
            sender,
            stop_tx,
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run `listener` in its own task for every event published from now on.
    pub fn subscribe(&self, listener: Arc<dyn ProbeResultListener>) {
        let mut rx = self.sender.subscribe();
        let mut stop_rx = self.stop_tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    received = rx.recv() => match received {
                        Ok(event) => dispatch(listener.as_ref(), &event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(listener = listener.name(), skipped, "Listener lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = stop_rx.recv() => {
                        // Finish whatever was published before the stop.
                        loop {
                            match rx.try_recv() {
                                Ok(event) => dispatch(listener.as_ref(), &event).await,
                                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                }
            }
            tracing::debug!(listener = listener.name(), "Listener stopped");
        });

        match self.tasks.lock() {
            Ok(mut tasks) => tasks.push(task),
            Err(_) => tracing::error!("Listener registry poisoned, task will not be awaited on shutdown"),
        }
    }

    /// Stop all listeners once they have handled every event already
    /// published. Returns false if they did not finish within `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let _ = self.stop_tx.send(());
        let tasks: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain(..).collect(),
            Err(_) => return false,
        };
        tracing::info!(listeners = tasks.len(), "Draining event listeners");
        tokio::time::timeout(grace, join_all(tasks)).await.is_ok()
    }

    /// Returns how many listeners will see the event.
    pub fn publish(&self, event: ProbeResultEvent) -> usize {
        self.sender.send(Arc::new(event)).unwrap_or(0)
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

async fn dispatch(listener: &dyn ProbeResultListener, event: &ProbeResultEvent) {
    let handled = AssertUnwindSafe(listener.on_event(event)).catch_unwind().await;
    if handled.is_err() {
        tracing::error!(
            listener = listener.name(),
            target_id = %event.result.target_id,
            "Listener panicked while handling probe result event"
        );
    }
}

/// Builds events with state-change detection and emits them on the bus.
pub struct ProbeResultEventPublisher {
    repository: Arc<dyn ProbeRepository>,
    bus: EventBus,
}

impl ProbeResultEventPublisher {
    pub fn new(repository: Arc<dyn ProbeRepository>, bus: EventBus) -> Self {
        Self { repository, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Compare against the most recent stored result for the target.
    ///
    /// Must run before `result` itself is stored. Lookup failures count as
    /// "no state change".
    pub async fn detect_state_change(&self, result: &ProbeResult) -> (bool, Option<ProbeStatus>) {
        match self.repository.find_recent(&result.target_id, 1).await {
            Ok(previous) => match previous.first() {
                Some(prev) => (prev.status != result.status, Some(prev.status)),
                None => (false, None),
            },
            Err(e) => {
                tracing::warn!(
                    target_id = %result.target_id,
                    error = %e,
                    "Failed to look up previous result, assuming no state change"
                );
                (false, None)
            }
        }
    }

    pub async fn prepare_event(&self, result: ProbeResult) -> ProbeResultEvent {
        let (is_state_change, previous_status) = self.detect_state_change(&result).await;
        if is_state_change {
            tracing::info!(
                target_id = %result.target_id,
                previous_status = ?previous_status,
                current_status = %result.status,
                "State change detected"
            );
        }
        ProbeResultEvent {
            result,
            is_state_change,
            previous_status,
        }
    }

    pub fn emit(&self, event: ProbeResultEvent) {
        let delivered = self.bus.publish(event);
        tracing::debug!(listeners = delivered, "Published probe result event");
    }

    /// Detect and emit in one step.
    pub async fn publish_probe_result(&self, result: ProbeResult) {
        let event = self.prepare_event(result).await;
        self.emit(event);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::memory::InMemoryProbeRepository;
    use crate::db::{DbError, ProbeMethod, ProbeRequest, Target};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Forwards every event to a channel.
    pub(crate) struct ChannelListener(pub mpsc::UnboundedSender<ProbeResultEvent>);

    #[async_trait]
    impl ProbeResultListener for ChannelListener {
        fn name(&self) -> &'static str {
            "channel"
        }

        async fn on_event(&self, event: &ProbeResultEvent) {
            let _ = self.0.send(event.clone());
        }
    }

    struct PanickingListener;

    #[async_trait]
    impl ProbeResultListener for PanickingListener {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn on_event(&self, _event: &ProbeResultEvent) {
            panic!("listener bug");
        }
    }

    /// Takes a while over every event and counts them.
    struct SlowListener {
        handled: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl ProbeResultListener for SlowListener {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn on_event(&self, _event: &ProbeResultEvent) {
            tokio::time::sleep(self.delay).await;
            self.handled.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub(crate) struct UnavailableRepository;

    #[async_trait]
    impl ProbeRepository for UnavailableRepository {
        async fn save(&self, _: &ProbeResult) -> Result<(), DbError> {
            Err(DbError::Unavailable("store".into()))
        }

        async fn find_recent(&self, _: &str, _: usize) -> Result<Vec<ProbeResult>, DbError> {
            Err(DbError::Unavailable("store".into()))
        }

        async fn find_latest(&self) -> Result<Option<ProbeResult>, DbError> {
            Err(DbError::Unavailable("store".into()))
        }

        async fn find_between(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<ProbeResult>, DbError> {
            Err(DbError::Unavailable("store".into()))
        }
    }

    pub(crate) fn result_at(req: &ProbeRequest, status: ProbeStatus, offset: i64) -> ProbeResult {
        let at = Utc::now() + chrono::Duration::seconds(offset);
        match status {
            ProbeStatus::Up => ProbeResult::up(req, ProbeMethod::Tcp, at, Some(3)),
            ProbeStatus::Down => ProbeResult::down(req, ProbeMethod::Tcp, at, "connection refused"),
        }
    }

    #[tokio::test]
    async fn test_state_change_sequence() {
        let repo = Arc::new(InMemoryProbeRepository::new());
        let publisher = ProbeResultEventPublisher::new(repo.clone(), EventBus::default());
        let target = Target::new("web", "example.org", 80);
        let req = ProbeRequest::for_target(&target, "c");

        let statuses = [
            ProbeStatus::Up,
            ProbeStatus::Up,
            ProbeStatus::Down,
            ProbeStatus::Down,
            ProbeStatus::Up,
        ];
        let mut changes = Vec::new();
        for (i, status) in statuses.into_iter().enumerate() {
            let result = result_at(&req, status, i as i64);
            let event = publisher.prepare_event(result.clone()).await;
            changes.push(event.is_state_change);
            repo.save(&result).await.unwrap();
        }

        assert_eq!(changes, vec![false, false, true, false, true]);
    }

    #[tokio::test]
    async fn test_lookup_failure_is_not_a_state_change() {
        let publisher = ProbeResultEventPublisher::new(Arc::new(UnavailableRepository), EventBus::default());
        let target = Target::new("web", "example.org", 80);
        let req = ProbeRequest::for_target(&target, "c");

        let event = publisher.prepare_event(result_at(&req, ProbeStatus::Down, 0)).await;
        assert!(!event.is_state_change);
        assert_eq!(event.previous_status, None);
    }

    #[tokio::test]
    async fn test_fan_out_survives_panicking_listener() {
        let bus = EventBus::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(Arc::new(PanickingListener));
        bus.subscribe(Arc::new(ChannelListener(tx)));
        assert_eq!(bus.listener_count(), 2);

        let publisher = ProbeResultEventPublisher::new(Arc::new(InMemoryProbeRepository::new()), bus);
        let target = Target::new("web", "example.org", 80);
        let req = ProbeRequest::for_target(&target, "c");

        publisher.publish_probe_result(result_at(&req, ProbeStatus::Up, 0)).await;
        publisher.publish_probe_result(result_at(&req, ProbeStatus::Down, 1)).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.result.status, ProbeStatus::Up);
        assert_eq!(second.result.status, ProbeStatus::Down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_published_events() {
        let bus = EventBus::default();
        let handled = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(SlowListener {
            handled: handled.clone(),
            delay: Duration::from_millis(50),
        }));

        let target = Target::new("web", "example.org", 80);
        let req = ProbeRequest::for_target(&target, "c");
        let publisher = ProbeResultEventPublisher::new(Arc::new(InMemoryProbeRepository::new()), bus.clone());
        for i in 0..5 {
            publisher.emit(ProbeResultEvent {
                result: result_at(&req, ProbeStatus::Up, i),
                is_state_change: false,
                previous_status: None,
            });
        }

        assert!(bus.shutdown(Duration::from_secs(5)).await);
        assert_eq!(handled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_gives_up_after_grace() {
        let bus = EventBus::default();
        let handled = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Arc::new(SlowListener {
            handled: handled.clone(),
            delay: Duration::from_secs(3600),
        }));

        let target = Target::new("web", "example.org", 80);
        let req = ProbeRequest::for_target(&target, "c");
        bus.publish(ProbeResultEvent {
            result: result_at(&req, ProbeStatus::Down, 0),
            is_state_change: false,
            previous_status: None,
        });

        assert!(!bus.shutdown(Duration::from_secs(1)).await);
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }
}
