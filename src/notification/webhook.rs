//! Webhook delivery over HTTP POST.

use async_trait::async_trait;
use std::time::Duration;

use super::{NotificationConfig, NotificationError, NotificationPayload, NotificationProvider};

pub struct WebhookNotificationProvider {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl WebhookNotificationProvider {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_timeout,
        }
    }
}

#[async_trait]
impl NotificationProvider for WebhookNotificationProvider {
    async fn send(
        &self,
        config: &NotificationConfig,
        payload: &NotificationPayload,
    ) -> Result<(), NotificationError> {
        let url = config
            .webhook_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| NotificationError::MissingUrl(config.target_id.clone()))?;

        let timeout = if config.timeout_ms > 0 {
            Duration::from_millis(config.timeout_ms)
        } else {
            self.default_timeout
        };

        tracing::debug!(target_id = %payload.target_id, url, timeout_ms = timeout.as_millis() as u64, "Sending webhook notification");

        let response = self
            .client
            .post(url)
            .json(payload)
            .timeout(timeout)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, url, "Webhook returned error status");
            return Err(NotificationError::Status(status));
        }

        Ok(())
    }
}
