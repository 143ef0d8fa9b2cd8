//! SMS channel via a Twilio-compatible HTTP API

use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use airaware_core::config::SmsConfig;
use airaware_core::{Error, Result};

use crate::types::{AlertEvent, DispatchError};

const DEFAULT_API_URL: &str = "https://api.twilio.com/2010-04-01";

/// SMS sender; one message per recipient number.
pub struct SmsNotifier {
    client: Client,
    api_url: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl SmsNotifier {
    pub fn new(config: &SmsConfig) -> Result<Self> {
        Self::with_api_url(config, DEFAULT_API_URL)
    }

    /// Separate constructor so tests can point at a local mock server.
    pub fn with_api_url(config: &SmsConfig, api_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Fatal(format!("SMS HTTP client: {e}")))?;

        info!(
            sid_prefix = &config.provider_sid[..8.min(config.provider_sid.len())],
            "sms notifier initialized"
        );

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            account_sid: config.provider_sid.clone(),
            auth_token: config.provider_token.clone(),
            from_number: config.from_number.clone(),
        })
    }

    pub async fn send(
        &self,
        event: &AlertEvent,
        to: &str,
    ) -> std::result::Result<(), DispatchError> {
        let url = format!("{}/Accounts/{}/Messages.json", self.api_url, self.account_sid);
        let body = self.build_message(event);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", &self.from_number), ("Body", &body)])
            .send()
            .await
            .map_err(|e| DispatchError::Transient(format!("sms request: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(alert_id = %event.alert_id, to, "sms sent");
            Ok(())
        } else {
            Err(DispatchError::from_status(status, "sms"))
        }
    }

    fn build_message(&self, event: &AlertEvent) -> String {
        // SMS segments are 160 chars; keep it to severity + rule + sensor.
        let mut msg = format!(
            "AirAware {}: {} on {}. {}",
            event.severity.as_str(),
            event.alert_type.as_str(),
            event.sensor_id,
            event.message
        );
        msg.truncate(160);
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airaware_core::types::{AlertType, Severity};
    use chrono::Utc;
    use uuid::Uuid;

    fn config() -> SmsConfig {
        SmsConfig {
            enabled: true,
            provider_sid: "AC00000000000000000000000000000000".into(),
            provider_token: "token".into(),
            from_number: "+15005550006".into(),
            recipients: vec!["+21612345678".into()],
        }
    }

    fn event(severity: Severity) -> AlertEvent {
        AlertEvent {
            alert_id: Uuid::new_v4(),
            alert_type: AlertType::Co2High,
            severity,
            message: "CO2 level 2100 ppm exceeds 2000 ppm".into(),
            sensor_id: "S1".into(),
            triggered_at: Utc::now(),
            occurrence_count: 3,
        }
    }

    #[test]
    fn message_fits_one_segment() {
        let notifier = SmsNotifier::new(&config()).unwrap();
        let msg = notifier.build_message(&event(Severity::Critical));
        assert!(msg.len() <= 160);
        assert!(msg.starts_with("AirAware CRITICAL: CO2_HIGH on S1"));
    }

    #[tokio::test]
    async fn invalid_number_is_permanent() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let notifier = SmsNotifier::with_api_url(&config(), &server.uri()).unwrap();
        let err = notifier
            .send(&event(Severity::Critical), "+000")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Permanent(_)));
    }

    #[tokio::test]
    async fn provider_5xx_is_transient() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let notifier = SmsNotifier::with_api_url(&config(), &server.uri()).unwrap();
        let err = notifier
            .send(&event(Severity::Critical), "+21612345678")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Transient(_)));
    }

    #[tokio::test]
    async fn created_response_is_delivered() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path_regex(
                r"^/Accounts/AC\w+/Messages\.json$",
            ))
            .respond_with(wiremock::ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let notifier = SmsNotifier::with_api_url(&config(), &server.uri()).unwrap();
        assert!(notifier
            .send(&event(Severity::Critical), "+21612345678")
            .await
            .is_ok());
    }
}
