//! Notification job and outcome types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use airaware_core::types::{Alert, AlertType, Severity};

/// Delivery channels, routed by alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotifyChannel {
    Email,
    Sms,
    Chat,
    Push,
}

impl NotifyChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotifyChannel::Email => "email",
            NotifyChannel::Sms => "sms",
            NotifyChannel::Chat => "chat",
            NotifyChannel::Push => "push",
        }
    }
}

/// Channels a severity fans out to. INFO is log-only; each higher band
/// adds to the previous one.
pub fn channels_for(severity: Severity) -> &'static [NotifyChannel] {
    match severity {
        Severity::Info => &[],
        Severity::Warning => &[NotifyChannel::Chat, NotifyChannel::Email],
        Severity::Critical | Severity::Danger => &[
            NotifyChannel::Chat,
            NotifyChannel::Email,
            NotifyChannel::Sms,
            NotifyChannel::Push,
        ],
    }
}

/// One alert to fan out; built whenever an alert is created or its
/// severity upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: Uuid,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub sensor_id: String,
    pub triggered_at: DateTime<Utc>,
    pub occurrence_count: u32,
}

impl From<&Alert> for AlertEvent {
    fn from(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id,
            alert_type: alert.alert_type,
            severity: alert.severity,
            message: alert.message.clone(),
            sensor_id: alert.sensor_id.clone(),
            triggered_at: alert.triggered_at,
            occurrence_count: alert.occurrence_count,
        }
    }
}

impl AlertEvent {
    /// Subject line shared by email and push title.
    pub fn title(&self) -> String {
        format!(
            "[{}] {} on sensor {}",
            self.severity.as_str(),
            self.alert_type.as_str(),
            self.sensor_id
        )
    }
}

/// Channel send failure, classified for the retry loop
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// Timeout, 5xx, connection reset; retried with backoff.
    #[error("transient: {0}")]
    Transient(String),

    /// 4xx, invalid recipient; counted as failure, never retried.
    #[error("permanent: {0}")]
    Permanent(String),

    /// 404/410 from a push endpoint; the subscription is dead.
    #[error("endpoint gone: {0}")]
    Gone(String),
}

impl DispatchError {
    /// Map an HTTP status to the retry classification shared by all
    /// HTTP-backed channels.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            DispatchError::Gone(format!("{context}: HTTP {status}"))
        } else if status.is_client_error() {
            DispatchError::Permanent(format!("{context}: HTTP {status}"))
        } else {
            DispatchError::Transient(format!("{context}: HTTP {status}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn routing_widens_with_severity() {
        assert!(channels_for(Severity::Info).is_empty());
        assert_eq!(
            channels_for(Severity::Warning),
            &[NotifyChannel::Chat, NotifyChannel::Email]
        );
        assert!(channels_for(Severity::Critical).contains(&NotifyChannel::Sms));
        assert!(channels_for(Severity::Danger).contains(&NotifyChannel::Push));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            DispatchError::from_status(StatusCode::GONE, "push"),
            DispatchError::Gone(_)
        ));
        assert!(matches!(
            DispatchError::from_status(StatusCode::NOT_FOUND, "push"),
            DispatchError::Gone(_)
        ));
        assert!(matches!(
            DispatchError::from_status(StatusCode::BAD_REQUEST, "sms"),
            DispatchError::Permanent(_)
        ));
        assert!(matches!(
            DispatchError::from_status(StatusCode::TOO_MANY_REQUESTS, "chat"),
            DispatchError::Permanent(_)
        ));
        assert!(matches!(
            DispatchError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "chat"),
            DispatchError::Transient(_)
        ));
    }
}
