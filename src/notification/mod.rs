//! State-change notifications.
//!
//! [`NotificationService`] decides whether a transition is worth reporting
//! and hands the payload to a [`NotificationProvider`]. Delivery failures are
//! logged here and never reach the caller.

mod webhook;

pub use webhook::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::db::ProbeStatus;

pub const DEFAULT_NOTIFICATION_TIMEOUT_MS: u64 = 5000;

#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("webhook URL not configured for target {0}")]
    MissingUrl(String),
    #[error("webhook returned error: {0}")]
    Status(reqwest::StatusCode),
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Per-target notification settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationConfig {
    pub target_id: String,
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub notify_on_up_to_down: bool,
    pub notify_on_down_to_up: bool,
    pub timeout_ms: u64,
}

impl NotificationConfig {
    /// Disabled, both directions selected, 5 s timeout.
    pub fn default_for(target_id: &str) -> Self {
        Self {
            target_id: target_id.to_string(),
            enabled: false,
            webhook_url: None,
            notify_on_up_to_down: true,
            notify_on_down_to_up: true,
            timeout_ms: DEFAULT_NOTIFICATION_TIMEOUT_MS,
        }
    }
}

/// Body of a state-change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub target_id: String,
    pub target_host: String,
    pub timestamp: DateTime<Utc>,
    pub previous_status: ProbeStatus,
    pub current_status: ProbeStatus,
    pub error_message: Option<String>,
}

/// Delivery transport for notifications.
#[async_trait]
pub trait NotificationProvider: Send + Sync {
    async fn send(
        &self,
        config: &NotificationConfig,
        payload: &NotificationPayload,
    ) -> Result<(), NotificationError>;
}

pub struct NotificationService {
    provider: Arc<dyn NotificationProvider>,
    enabled: bool,
}

impl NotificationService {
    pub fn new(provider: Arc<dyn NotificationProvider>, enabled: bool) -> Self {
        Self { provider, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the payload's transition is selected by `config`.
    pub fn should_notify(&self, config: &NotificationConfig, payload: &NotificationPayload) -> bool {
        match (payload.previous_status, payload.current_status) {
            (ProbeStatus::Up, ProbeStatus::Down) => config.notify_on_up_to_down,
            (ProbeStatus::Down, ProbeStatus::Up) => config.notify_on_down_to_up,
            _ => false,
        }
    }

    pub async fn send_notification(&self, config: &NotificationConfig, payload: &NotificationPayload) {
        if !self.enabled {
            tracing::debug!("Notifications globally disabled, skipping notification");
            return;
        }
        if !config.enabled {
            tracing::debug!(target_id = %config.target_id, "Notifications disabled for target");
            return;
        }
        if !self.should_notify(config, payload) {
            tracing::debug!(
                target_id = %config.target_id,
                previous_status = %payload.previous_status,
                current_status = %payload.current_status,
                "Notification filtered out by config"
            );
            return;
        }

        match self.provider.send(config, payload).await {
            Ok(()) => tracing::info!(
                target_id = %payload.target_id,
                transition = %format!("{} -> {}", payload.previous_status, payload.current_status),
                "Notification sent"
            ),
            Err(e) => tracing::error!(
                target_id = %payload.target_id,
                error = %e,
                "Failed to send notification"
            ),
        }
    }
}
