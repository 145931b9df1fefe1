//! Completion webhook.
//!
//! One POST per finished job. Delivery is best-effort: failures are logged and
//! never change the job's outcome.

use crate::config::WebhookConfig;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyStatus {
    Completed,
    Failed,
}

/// Body of the webhook call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub asset_id: String,
    pub status: NotifyStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: u64,
}

impl WebhookPayload {
    pub fn completed(asset_id: &str, output_path: &str, elapsed: Duration) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            status: NotifyStatus::Completed,
            output_path: Some(output_path.to_string()),
            error: None,
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn failed(asset_id: &str, error: &str, elapsed: Duration) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            status: NotifyStatus::Failed,
            output_path: None,
            error: Some(error.to_string()),
            processing_time_ms: elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notifier {
    http: reqwest::Client,
    url: Option<String>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(config: &WebhookConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.url.clone().filter(|u| !u.trim().is_empty()),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }

    /// Send `payload`; returns whether it was delivered.
    pub async fn notify(&self, payload: &WebhookPayload) -> bool {
        let Some(url) = self.url.as_deref() else {
            return false;
        };
        match self.send(url, payload).await {
            Ok(()) => {
                debug!(asset_id = %payload.asset_id, "Webhook delivered");
                true
            }
            Err(e) => {
                warn!(asset_id = %payload.asset_id, url, error = %e, "Webhook delivery failed");
                false
            }
        }
    }

    async fn send(&self, url: &str, payload: &WebhookPayload) -> Result<(), NotifyError> {
        let response = self
            .http
            .post(url)
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}
