//! Email channel over SMTP

use lettre::{
    message::{header, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info};

use airaware_core::config::EmailConfig;
use airaware_core::{Error, Result};

use crate::types::{AlertEvent, DispatchError};

const FROM_NAME: &str = "AirAware Alerts";

/// SMTP-backed alert mailer. One message per recipient list.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    dashboard_url: Option<String>,
}

impl EmailNotifier {
    /// Build the transport; the connection itself is lazy, a bad relay
    /// surfaces as a transient send failure.
    pub fn new(config: &EmailConfig, dashboard_url: Option<String>) -> Result<Self> {
        let creds = Credentials::new(config.smtp_user.clone(), config.smtp_pass.clone());

        let transport = if config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| Error::Fatal(format!("SMTP relay {}: {e}", config.smtp_host)))?
                .port(config.smtp_port)
                .credentials(creds)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
                .port(config.smtp_port)
                .credentials(creds)
                .build()
        };

        let from = format!("{FROM_NAME} <{}>", config.smtp_user)
            .parse::<Mailbox>()
            .map_err(|e| Error::Fatal(format!("invalid SMTP_USER as sender: {e}")))?;

        info!(
            host = %config.smtp_host,
            port = config.smtp_port,
            starttls = config.starttls,
            "email notifier initialized"
        );

        Ok(Self {
            transport,
            from,
            dashboard_url,
        })
    }

    /// Send one alert message to the full recipient list.
    pub async fn send(
        &self,
        event: &AlertEvent,
        recipients: &[String],
    ) -> std::result::Result<(), DispatchError> {
        if recipients.is_empty() {
            debug!(alert_id = %event.alert_id, "no email recipients, skipping");
            return Ok(());
        }

        let mut builder = Message::builder().from(self.from.clone());
        for addr in recipients {
            let mailbox = addr
                .parse::<Mailbox>()
                .map_err(|e| DispatchError::Permanent(format!("invalid recipient {addr}: {e}")))?;
            builder = builder.to(mailbox);
        }

        let message = builder
            .subject(event.title())
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_PLAIN)
                            .body(self.text_body(event)),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(header::ContentType::TEXT_HTML)
                            .body(self.html_body(event)),
                    ),
            )
            .map_err(|e| DispatchError::Permanent(format!("message build: {e}")))?;

        match self.transport.send(message).await {
            Ok(_) => {
                debug!(alert_id = %event.alert_id, recipients = recipients.len(), "alert email sent");
                Ok(())
            }
            Err(e) if e.is_permanent() => Err(DispatchError::Permanent(e.to_string())),
            Err(e) => Err(DispatchError::Transient(e.to_string())),
        }
    }

    fn text_body(&self, event: &AlertEvent) -> String {
        let mut body = format!(
            "{}\n\nSensor: {}\nSeverity: {}\nTriggered: {}\nOccurrences: {}\n",
            event.message,
            event.sensor_id,
            event.severity.as_str(),
            event.triggered_at.to_rfc3339(),
            event.occurrence_count,
        );
        if let Some(url) = &self.dashboard_url {
            body.push_str(&format!("\nDashboard: {url}\n"));
        }
        body
    }

    fn html_body(&self, event: &AlertEvent) -> String {
        let link = self
            .dashboard_url
            .as_ref()
            .map(|url| format!(r#"<p><a href="{url}">Open dashboard</a></p>"#))
            .unwrap_or_default();
        format!(
            r#"<h2>{}</h2>
<p>{}</p>
<table>
  <tr><td>Sensor</td><td>{}</td></tr>
  <tr><td>Severity</td><td>{}</td></tr>
  <tr><td>Triggered</td><td>{}</td></tr>
  <tr><td>Occurrences</td><td>{}</td></tr>
</table>
{link}"#,
            event.title(),
            event.message,
            event.sensor_id,
            event.severity.as_str(),
            event.triggered_at.to_rfc3339(),
            event.occurrence_count,
        )
    }
}
