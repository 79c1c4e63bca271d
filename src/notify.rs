use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::models::StateEvent;

/// Consumer of state-transition events.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called for every transition.
    async fn notify(&self, event: &StateEvent) -> Result<()>;

    /// Called once per check with its first observation. Not a transition,
    /// so most sinks ignore it.
    async fn baseline(&self, _event: &StateEvent) -> Result<()> {
        Ok(())
    }
}

/// Fans events out to every registered sink in registration order.
#[derive(Default, Clone)]
pub struct NotificationHub {
    sinks: Vec<Arc<dyn Sink>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Arc<dyn Sink>) {
        debug!(sink = sink.name(), "notification sink registered");
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Delivers `event` to all sinks. A failing sink is logged and skipped;
    /// the returned error only counts how many failed.
    pub async fn notify(&self, event: &StateEvent) -> Result<()> {
        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(event).await {
                failed += 1;
                error!(sink = sink.name(), check = %event.identity.id, error = %e, "Cannot notify.");
            }
        }
        if failed > 0 {
            anyhow::bail!("{failed} of {} sinks failed", self.sinks.len());
        }
        Ok(())
    }

    pub async fn baseline(&self, event: &StateEvent) -> Result<()> {
        let mut failed = 0;
        for sink in &self.sinks {
            if let Err(e) = sink.baseline(event).await {
                failed += 1;
                error!(sink = sink.name(), check = %event.identity.id, error = %e, "Cannot record baseline.");
            }
        }
        if failed > 0 {
            anyhow::bail!("{failed} of {} sinks failed", self.sinks.len());
        }
        Ok(())
    }
}

/// Writes transitions to the process log.
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &StateEvent) -> Result<()> {
        let time = event.timestamp.to_rfc3339();
        if event.ok {
            info!(name = %event.identity.name, id = %event.identity.id, %time, "Check back to normal.");
        } else {
            warn!(
                name = %event.identity.name,
                id = %event.identity.id,
                %time,
                reason = %event.reason,
                "Check failed."
            );
        }
        Ok(())
    }
}

/// Posts transitions as a chat-style embed to a webhook URL.
pub struct WebhookSink {
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    fn payload(event: &StateEvent) -> serde_json::Value {
        let (title, color) = if event.ok {
            ("Check back to normal", 0x2ECC71)
        } else {
            ("Check failed", 0xE74C3C)
        };
        let reason = if event.reason.is_empty() { "-" } else { event.reason.as_str() };
        serde_json::json!({
            "username": "NetPulse Engine",
            "embeds": [{
                "title": title,
                "color": color,
                "fields": [
                    { "name": "Check", "value": event.identity.name, "inline": true },
                    { "name": "Id", "value": event.identity.id, "inline": true },
                    { "name": "Reason", "value": reason, "inline": false }
                ],
                "timestamp": event.timestamp.to_rfc3339(),
                "footer": { "text": format!("sent {}", Utc::now().to_rfc3339()) }
            }]
        })
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, event: &StateEvent) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&Self::payload(event))
            .send()
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected event")?;
        Ok(())
    }
}
