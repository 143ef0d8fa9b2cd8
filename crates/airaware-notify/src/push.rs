//! Web Push channel
//!
//! Delivers to browser push endpoints registered through the control
//! surface. VAPID material is an opaque external input; when configured it
//! is attached as the `Authorization` header, payload encryption is the
//! push service's contract with the subscriber.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use airaware_core::config::PushConfig;
use airaware_core::types::PushSubscription;
use airaware_core::{Error, Result};

use crate::types::{AlertEvent, DispatchError};

/// How long the push service may hold an undeliverable message.
const PUSH_TTL_SECS: u32 = 3600;

pub struct PushNotifier {
    client: Client,
    authorization: Option<String>,
}

impl PushNotifier {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Fatal(format!("push HTTP client: {e}")))?;

        let authorization = match (&config.vapid_public_key, &config.vapid_private_key) {
            (Some(public), Some(private)) => Some(format!("vapid t={private}, k={public}")),
            _ => None,
        };

        Ok(Self {
            client,
            authorization,
        })
    }

    pub async fn send(
        &self,
        event: &AlertEvent,
        subscription: &PushSubscription,
    ) -> std::result::Result<(), DispatchError> {
        let payload = json!({
            "title": event.title(),
            "body": event.message,
            "severity": event.severity.as_str(),
            "alertType": event.alert_type.as_str(),
            "sensorId": event.sensor_id,
            "alertId": event.alert_id.to_string(),
            "triggeredAt": event.triggered_at.to_rfc3339(),
        });

        let mut request = self
            .client
            .post(&subscription.endpoint)
            .header("TTL", PUSH_TTL_SECS)
            .header("Urgency", urgency(event))
            .json(&payload);
        if let Some(authorization) = &self.authorization {
            request = request.header("Authorization", authorization);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DispatchError::Transient(format!("push request: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(alert_id = %event.alert_id, endpoint = %subscription.endpoint, "push delivered");
            Ok(())
        } else {
            Err(DispatchError::from_status(status, "push"))
        }
    }
}

fn urgency(event: &AlertEvent) -> &'static str {
    use airaware_core::types::Severity;
    match event.severity {
        Severity::Info | Severity::Warning => "normal",
        Severity::Critical => "high",
        Severity::Danger => "high",
    }
}
