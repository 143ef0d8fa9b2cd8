//! Chat webhook channel: Slack and Discord

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use airaware_core::config::ChatConfig;
use airaware_core::types::Severity;
use airaware_core::{Error, Result};

use crate::types::{AlertEvent, DispatchError};

/// Recipient ids used by the idempotency ledger for chat targets.
pub const SLACK_RECIPIENT: &str = "slack";
pub const DISCORD_RECIPIENT: &str = "discord";

/// Posts alert summaries to configured chat webhooks.
pub struct ChatNotifier {
    client: Client,
    slack_url: Option<String>,
    discord_url: Option<String>,
    dashboard_url: Option<String>,
}

impl ChatNotifier {
    pub fn new(config: &ChatConfig, dashboard_url: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Fatal(format!("chat HTTP client: {e}")))?;
        Ok(Self {
            client,
            slack_url: config.slack_webhook_url.clone(),
            discord_url: config.discord_webhook_url.clone(),
            dashboard_url,
        })
    }

    pub fn targets(&self) -> Vec<&'static str> {
        let mut t = Vec::new();
        if self.slack_url.is_some() {
            t.push(SLACK_RECIPIENT);
        }
        if self.discord_url.is_some() {
            t.push(DISCORD_RECIPIENT);
        }
        t
    }

    pub async fn send(
        &self,
        event: &AlertEvent,
        target: &str,
    ) -> std::result::Result<(), DispatchError> {
        let (url, payload) = match target {
            SLACK_RECIPIENT => match &self.slack_url {
                Some(url) => (url, self.slack_payload(event)),
                None => {
                    return Err(DispatchError::Permanent("slack webhook not configured".into()))
                }
            },
            DISCORD_RECIPIENT => match &self.discord_url {
                Some(url) => (url, self.discord_payload(event)),
                None => {
                    return Err(DispatchError::Permanent(
                        "discord webhook not configured".into(),
                    ))
                }
            },
            other => {
                return Err(DispatchError::Permanent(format!("unknown chat target {other}")))
            }
        };

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| DispatchError::Transient(format!("chat request: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(alert_id = %event.alert_id, target, "chat webhook delivered");
            Ok(())
        } else {
            Err(DispatchError::from_status(status, target))
        }
    }

    fn summary_line(&self, event: &AlertEvent) -> String {
        let icon = match event.severity {
            Severity::Info => "ℹ️",
            Severity::Warning => "⚠️",
            Severity::Critical => "🔴",
            Severity::Danger => "🚨",
        };
        let mut line = format!(
            "{icon} *{}* `{}` on sensor `{}` — {}",
            event.severity.as_str(),
            event.alert_type.as_str(),
            event.sensor_id,
            event.message
        );
        if event.occurrence_count > 1 {
            line.push_str(&format!(" (seen {}×)", event.occurrence_count));
        }
        if let Some(url) = &self.dashboard_url {
            line.push_str(&format!(" <{url}|dashboard>"));
        }
        line
    }

    fn slack_payload(&self, event: &AlertEvent) -> serde_json::Value {
        json!({ "text": self.summary_line(event) })
    }

    fn discord_payload(&self, event: &AlertEvent) -> serde_json::Value {
        // Discord has no mrkdwn link syntax; strip to plain content.
        let mut content = format!(
            "**{}** `{}` on sensor `{}` — {}",
            event.severity.as_str(),
            event.alert_type.as_str(),
            event.sensor_id,
            event.message
        );
        if let Some(url) = &self.dashboard_url {
            content.push_str(&format!("\n{url}"));
        }
        json!({ "content": content })
    }
}
