//! Lifecycle webhooks.
//!
//! One sender is shared by every pending prediction:
//! - Non-terminal events are fire-and-forget and throttled per prediction
//!   (default 500ms between updates).
//! - The `completed` event is sent synchronously with exponential backoff
//!   retries; the caller guarantees at-most-once via the pending's flag.
//! - `WEBHOOK_AUTH_TOKEN` bearer authentication.
//! - Per-request events filtering (start, output, logs, completed).

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::prediction::{PredictionRequest, PredictionResponse};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookEvent {
    Start,
    Output,
    Logs,
    #[default]
    Completed,
}

impl WebhookEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn all() -> HashSet<WebhookEvent> {
        [Self::Start, Self::Output, Self::Logs, Self::Completed]
            .into_iter()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub response_interval: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            response_interval: Duration::from_millis(
                std::env::var("COG_THROTTLE_RESPONSE_INTERVAL")
                    .ok()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|s| (s * 1000.0) as u64)
                    .unwrap_or(500),
            ),
            max_retries: 12,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

pub struct WebhookSender {
    config: WebhookConfig,
    client: reqwest::Client,
    /// Per-prediction throttle clock for non-terminal events.
    last_sent: DashMap<String, Instant>,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> Self {
        let mut headers = reqwest::header::HeaderMap::new();

        if let Ok(token) = std::env::var("WEBHOOK_AUTH_TOKEN")
            && let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
        {
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let user_agent = format!("coglet-manager/{}", env!("CARGO_PKG_VERSION"));
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&user_agent) {
            headers.insert(reqwest::header::USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build webhook client");

        Self {
            config,
            client,
            last_sent: DashMap::new(),
        }
    }

    fn filter_allows(request: &PredictionRequest, event: WebhookEvent) -> bool {
        match &request.webhook_events_filter {
            Some(filter) => filter.contains(&event),
            None => true,
        }
    }

    fn should_send(&self, request: &PredictionRequest, event: WebhookEvent) -> bool {
        if !Self::filter_allows(request, event) {
            return false;
        }
        if event.is_terminal() {
            return true;
        }

        let mut entry = self
            .last_sent
            .entry(request.id.clone())
            .or_insert_with(|| Instant::now() - self.config.response_interval);
        if entry.elapsed() >= self.config.response_interval {
            *entry = Instant::now();
            true
        } else {
            false
        }
    }

    /// Send a non-terminal webhook (fire and forget, no retry).
    pub fn send(&self, event: WebhookEvent, request: &PredictionRequest, response: &PredictionResponse) {
        let Some(url) = request.webhook.clone() else {
            return;
        };
        if !self.should_send(request, event) {
            return;
        }

        let post = self.client.post(url).json(response);
        tokio::spawn(async move {
            if let Err(e) = post.send().await {
                tracing::warn!(error = %e, ?event, "failed to send webhook");
            }
        });
    }

    /// Send the terminal `completed` webhook with exponential backoff
    /// retries. The caller holds the at-most-once flag.
    pub async fn send_terminal(&self, request: &PredictionRequest, response: &PredictionResponse) {
        let Some(url) = request.webhook.as_deref() else {
            return;
        };
        if !Self::filter_allows(request, WebhookEvent::Completed) {
            return;
        }

        let mut attempt = 0;
        loop {
            match self.client.post(url).json(response).send().await {
                Ok(http_response) => {
                    let status = http_response.status().as_u16();
                    if http_response.status().is_success() {
                        tracing::debug!(status, "terminal webhook sent");
                        return;
                    }
                    if !self.config.retry_status_codes.contains(&status) {
                        tracing::error!(status, "terminal webhook failed with non-retryable status");
                        return;
                    }
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(status, attempt, "terminal webhook failed after max retries");
                        return;
                    }
                    let backoff = self.config.backoff_base * (1 << attempt.min(10));
                    tracing::warn!(
                        status,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "terminal webhook failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        tracing::error!(error = %e, attempt, "terminal webhook failed after max retries");
                        return;
                    }
                    let backoff = self.config.backoff_base * (1 << attempt.min(10));
                    tracing::warn!(
                        error = %e,
                        attempt,
                        backoff_ms = backoff.as_millis(),
                        "terminal webhook request error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Drop the throttle entry once a prediction reaches a terminal state.
    pub fn forget(&self, prediction_id: &str) {
        self.last_sent.remove(prediction_id);
    }
}
