//! Built-in probe result listeners.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{ProbeResultEvent, ProbeResultListener};
use crate::cache::{Cache, RECENT_RESULTS_REGION, TARGET_STATUS_REGION};
use crate::db::{ProbeRepository, ProbeStatus};
use crate::notification::{NotificationConfig, NotificationPayload, NotificationService};

/// Stores every result. Used when persistence is delegated to the event chain.
pub struct PersistenceListener {
    repository: Arc<dyn ProbeRepository>,
}

impl PersistenceListener {
    pub fn new(repository: Arc<dyn ProbeRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl ProbeResultListener for PersistenceListener {
    fn name(&self) -> &'static str {
        "persistence"
    }

    async fn on_event(&self, event: &ProbeResultEvent) {
        let result = &event.result;
        match self.repository.save(result).await {
            Ok(()) => tracing::debug!(
                target_id = %result.target_id,
                probe_cycle_id = %result.probe_cycle_id,
                "Persisted probe result"
            ),
            Err(e) => tracing::error!(
                target_id = %result.target_id,
                probe_cycle_id = %result.probe_cycle_id,
                error = %e,
                "Failed to persist probe result"
            ),
        }
    }
}

/// Drops cached views of a target once a new result arrives.
pub struct CacheInvalidationListener {
    cache: Arc<dyn Cache>,
}

impl CacheInvalidationListener {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ProbeResultListener for CacheInvalidationListener {
    fn name(&self) -> &'static str {
        "cache-invalidation"
    }

    async fn on_event(&self, event: &ProbeResultEvent) {
        let target_id = &event.result.target_id;
        self.cache.evict(RECENT_RESULTS_REGION, target_id);
        self.cache.evict(TARGET_STATUS_REGION, target_id);
        tracing::trace!(target_id = %target_id, "Evicted cached results");
    }
}

/// Sends notifications for UP/DOWN transitions.
pub struct StateChangeNotificationListener {
    service: Arc<NotificationService>,
    repository: Arc<dyn ProbeRepository>,
    configs: RwLock<HashMap<String, NotificationConfig>>,
    default_webhook_url: Option<String>,
}

impl StateChangeNotificationListener {
    pub fn new(
        service: Arc<NotificationService>,
        repository: Arc<dyn ProbeRepository>,
        default_webhook_url: Option<String>,
    ) -> Self {
        Self {
            service,
            repository,
            configs: RwLock::new(HashMap::new()),
            default_webhook_url: default_webhook_url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn set_config(&self, config: NotificationConfig) {
        if let Ok(mut configs) = self.configs.write() {
            configs.insert(config.target_id.clone(), config);
        }
    }

    /// Per-target config, else the disabled default. A configured default
    /// webhook URL enables the default.
    pub fn config_for(&self, target_id: &str) -> NotificationConfig {
        if let Some(config) = self.configs.read().ok().and_then(|c| c.get(target_id).cloned()) {
            return config;
        }

        let mut config = NotificationConfig::default_for(target_id);
        if let Some(url) = &self.default_webhook_url {
            config.enabled = true;
            config.webhook_url = Some(url.clone());
        }
        config
    }

    /// Status before the current result. Falls back to the second most recent
    /// stored result when the event does not carry it, then to UP.
    async fn previous_status(&self, event: &ProbeResultEvent) -> ProbeStatus {
        if let Some(status) = event.previous_status {
            return status;
        }

        let target_id = &event.result.target_id;
        match self.repository.find_recent(target_id, 2).await {
            Ok(recent) => recent.get(1).map(|r| r.status).unwrap_or(ProbeStatus::Up),
            Err(e) => {
                tracing::warn!(target_id = %target_id, error = %e, "Failed to get previous status");
                ProbeStatus::Up
            }
        }
    }
}

#[async_trait]
impl ProbeResultListener for StateChangeNotificationListener {
    fn name(&self) -> &'static str {
        "state-change-notification"
    }

    async fn on_event(&self, event: &ProbeResultEvent) {
        if !self.service.is_enabled() {
            return;
        }
        let current = &event.result;
        if !event.is_state_change {
            tracing::debug!(target_id = %current.target_id, "Skipping notification, not a state change");
            return;
        }

        let previous_status = self.previous_status(event).await;
        tracing::info!(
            target_id = %current.target_id,
            previous_status = %previous_status,
            current_status = %current.status,
            "Processing state change notification"
        );

        let payload = NotificationPayload {
            target_id: current.target_id.clone(),
            target_host: current.target_host.clone(),
            timestamp: current.timestamp,
            previous_status,
            current_status: current.status,
            error_message: current.error_message.clone(),
        };
        let config = self.config_for(&current.target_id);
        self.service.send_notification(&config, &payload).await;
    }
}
