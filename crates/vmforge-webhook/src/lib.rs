//! Multi-destination webhook notifications for vmforge job lifecycle events
//!.
//!
//! A [`Manager`] holds one [`WebhookDestination`] per configured target.
//! `notify_all` fans an event out to every destination whose
//! [`WebhookEventFilters`] allow it, each in its own `tokio::spawn` task, so
//! a slow or unreachable destination never delays delivery to the others
//! (property 8).
//!
//! # Example
//!
//! ```ignore
//! use vmforge_webhook::{Manager, WebhookDestination};
//! use vmforge_types::{WebhookEvent, WebhookEventType, WebhookType, Provider};
//!
//! let manager = Manager::new(vec![WebhookDestination::new(
//!     "https://hooks.slack.com/services/...",
//!     WebhookType::Slack,
//! )]);
//! ```

use std::time::Duration;

use serde_json::json;
use vmforge_retry::{RetryExecutor, RetryStrategyConfig, RetryStrategyType};
use vmforge_types::{WebhookEvent, WebhookEventFilters, WebhookEventType, WebhookType};

/// One configured notification target.
#[derive(Debug, Clone)]
pub struct WebhookDestination {
    pub name: String,
    pub url: String,
    pub webhook_type: WebhookType,
    pub filters: WebhookEventFilters,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl WebhookDestination {
    pub fn new(name: impl Into<String>, url: impl Into<String>, webhook_type: WebhookType) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            webhook_type,
            filters: WebhookEventFilters::default(),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_filters(mut self, filters: WebhookEventFilters) -> Self {
        self.filters = filters;
        self
    }

    fn retry_config(&self) -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            max_attempts: self.max_retries.max(1),
            base_delay: self.retry_delay,
            max_delay: self.retry_delay.saturating_mul(8),
            jitter: 0.2,
        }
    }
}

/// Render an event into the wire body a given destination type expects.
pub fn render_payload(webhook_type: WebhookType, event: &WebhookEvent) -> serde_json::Value {
    match webhook_type {
        WebhookType::Generic => serde_json::to_value(event).unwrap_or(json!({})),
        WebhookType::Slack => slack_payload(event),
        WebhookType::Discord => discord_payload(event),
        WebhookType::Email => email_payload(event),
    }
}

fn slack_color(event_type: WebhookEventType) -> &'static str {
    match event_type {
        WebhookEventType::Start => "#2eb67d",
        WebhookEventType::Complete => "good",
        WebhookEventType::Warning => "warning",
        WebhookEventType::Error => "danger",
    }
}

fn slack_payload(event: &WebhookEvent) -> serde_json::Value {
    json!({
        "attachments": [{
            "color": slack_color(event.event_type),
            "title": format!("{} ({})", event.vm_name, event.provider),
            "text": event.message,
            "fields": [
                { "title": "Task", "value": event.task_id, "short": true },
                { "title": "Status", "value": event.status, "short": true },
            ],
        }],
    })
}

fn discord_color(event_type: WebhookEventType) -> u32 {
    match event_type {
        WebhookEventType::Start | WebhookEventType::Complete => 3_066_993,
        WebhookEventType::Warning => 16_776_960,
        WebhookEventType::Error => 15_158_332,
    }
}

fn discord_payload(event: &WebhookEvent) -> serde_json::Value {
    json!({
        "embeds": [{
            "title": format!("{} ({})", event.vm_name, event.provider),
            "description": event.message,
            "color": discord_color(event.event_type),
            "fields": [
                { "name": "Task", "value": event.task_id, "inline": true },
                { "name": "Status", "value": event.status, "inline": true },
            ],
        }],
    })
}

fn email_payload(event: &WebhookEvent) -> serde_json::Value {
    json!({
        "subject": format!("vmforge: {} {}", event.vm_name, event.status),
        "body": event.message,
        "task_id": event.task_id,
    })
}

/// Deliver `event` to `destination`, retrying per its configured policy.
/// Callers that want "fire and forget" semantics should spawn this rather
/// than `.await`ing it inline (see [`Manager::notify_all`]).
pub async fn deliver(client: &reqwest::Client, destination: &WebhookDestination, event: &WebhookEvent) -> anyhow::Result<()> {
    let executor = RetryExecutor::new(destination.retry_config());
    let body = render_payload(destination.webhook_type, event);

    executor
        .run_async(|_attempt| {
            let client = client.clone();
            let url = destination.url.clone();
            let body = body.clone();
            let timeout = destination.timeout;
            async move {
                let response = client
                    .post(&url)
                    .timeout(timeout)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| anyhow::anyhow!("webhook request to {url} failed: {e}"))?;
                if !response.status().is_success() {
                    return Err(anyhow::anyhow!(
                        "webhook {url} responded with status {}",
                        response.status()
                    ));
                }
                Ok(())
            }
        })
        .await
}

/// Outcome of delivering one event to one destination, as reported by
/// [`Manager::notify_all`].
#[derive(Debug)]
pub struct DeliveryOutcome {
    pub destination: String,
    pub result: Result<(), String>,
}

/// Fans job lifecycle events out to every configured destination.
pub struct Manager {
    destinations: Vec<WebhookDestination>,
    client: reqwest::Client,
}

impl Manager {
    pub fn new(destinations: Vec<WebhookDestination>) -> Self {
        Self {
            destinations,
            client: reqwest::Client::new(),
        }
    }

    /// Notify every destination whose filters allow `event.event_type`,
    /// concurrently. Destinations that don't allow the event type perform no
    /// HTTP request at all (property 8).
    pub async fn notify_all(&self, event: WebhookEvent) -> Vec<DeliveryOutcome> {
        let mut handles = Vec::new();
        for destination in &self.destinations {
            if !destination.filters.allows(event.event_type) {
                continue;
            }
            let client = self.client.clone();
            let destination = destination.clone();
            let event = event.clone();
            handles.push(tokio::spawn(async move {
                let result = deliver(&client, &destination, &event).await.map_err(|e| e.to_string());
                DeliveryOutcome { destination: destination.name, result }
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => outcomes.push(DeliveryOutcome {
                    destination: "unknown".to_string(),
                    result: Err(format!("webhook task panicked: {join_err}")),
                }),
            }
        }
        outcomes
    }
}
