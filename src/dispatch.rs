use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use crate::config::DispatchConfig;
use crate::queue::QueueItem;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Failed to deliver deferred call: {0}")]
    SendError(#[from] reqwest::Error),

    #[error("Dispatch target returned error: {0}")]
    ServiceError(String),
}

/// Performs a deferred call once it has been admitted on replay.
#[async_trait]
pub trait CallDispatcher: Send + Sync {
    async fn dispatch(&self, item: &QueueItem) -> Result<(), DispatchError>;
}

/// Records replayed calls without performing them.
pub struct LogDispatcher;

#[async_trait]
impl CallDispatcher for LogDispatcher {
    async fn dispatch(&self, item: &QueueItem) -> Result<(), DispatchError> {
        tracing::info!(
            item_id = %item.id,
            action_type = %item.action_type,
            scope_id = %item.scope_id,
            enqueued_window = %item.enqueued_at_window,
            attempts = item.attempts,
            "Replaying deferred call"
        );
        Ok(())
    }
}

/// Body posted to the webhook for each replayed call
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayEvent<'a> {
    event: &'static str,
    item: &'a QueueItem,
}

/// Hands replayed calls to the worker that owns the upstream API client.
pub struct WebhookDispatcher {
    client: Client,
    url: String,
    token: Option<String>,
}

impl WebhookDispatcher {
    pub fn new(client: Client, url: &str, token: Option<&str>) -> Self {
        Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            token: token.map(|t| t.to_string()),
        }
    }
}

#[async_trait]
impl CallDispatcher for WebhookDispatcher {
    async fn dispatch(&self, item: &QueueItem) -> Result<(), DispatchError> {
        tracing::debug!(url = %self.url, item_id = %item.id, "Posting deferred call to webhook");

        let mut request = self.client.post(&self.url).json(&ReplayEvent {
            event: "queue.replay",
            item,
        });

        // Add auth token if configured
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::ServiceError(format!(
                "webhook returned {}: {}",
                status, body
            )));
        }

        Ok(())
    }
}

/// Pick the dispatcher named by the configuration
pub fn from_config(client: Client, config: &DispatchConfig) -> Arc<dyn CallDispatcher> {
    match config.webhook_url.as_deref() {
        Some(url) if !url.trim().is_empty() => {
            tracing::info!(url = %url, "Deferred calls will be posted to webhook");
            Arc::new(WebhookDispatcher::new(
                client,
                url,
                config.webhook_token.as_deref(),
            ))
        }
        _ => {
            tracing::info!("No dispatch webhook configured, replayed calls are logged only");
            Arc::new(LogDispatcher)
        }
    }
}
