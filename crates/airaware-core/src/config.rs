use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_opt(key) {
        Some(v) => v
            .parse()
            .map_err(|_| Error::Fatal(format!("invalid value for {key}: {v}"))),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn env_csv(key: &str) -> Vec<String> {
    env_opt(key)
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn require(key: &str, feature: &str) -> Result<String> {
    env_opt(key).ok_or_else(|| Error::Fatal(format!("{key} is required when {feature} is enabled")))
}

/// Message-bus connection settings
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker URL, `tcp://host:port`
    pub url: String,
    pub topic: String,
    pub qos: u8,
    pub client_id: String,
}

impl BusConfig {
    /// Host/port pair parsed out of `url`.
    pub fn broker_addr(&self) -> Result<(String, u16)> {
        let stripped = self
            .url
            .strip_prefix("tcp://")
            .or_else(|| self.url.strip_prefix("mqtt://"))
            .unwrap_or(&self.url);
        let (host, port) = match stripped.rsplit_once(':') {
            Some((h, p)) => {
                let port: u16 = p
                    .parse()
                    .map_err(|_| Error::Fatal(format!("invalid broker port in BUS_URL: {p}")))?;
                (h.to_string(), port)
            }
            None => (stripped.to_string(), 1883),
        };
        if host.is_empty() {
            return Err(Error::Fatal(format!("invalid BUS_URL: {}", self.url)));
        }
        Ok((host, port))
    }
}

/// Datastore settings
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub url: String,
}

/// Control-surface listener settings
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub addr: String,
}

/// SMTP settings, validated only when email is enabled
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub starttls: bool,
    pub recipients: Vec<String>,
}

/// SMS provider settings, validated only when SMS is enabled
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub enabled: bool,
    pub provider_sid: String,
    pub provider_token: String,
    pub from_number: String,
    pub recipients: Vec<String>,
}

/// Chat webhook endpoints; presence implies enabled
#[derive(Debug, Clone, Default)]
pub struct ChatConfig {
    pub slack_webhook_url: Option<String>,
    pub discord_webhook_url: Option<String>,
}

impl ChatConfig {
    pub fn enabled(&self) -> bool {
        self.slack_webhook_url.is_some() || self.discord_webhook_url.is_some()
    }
}

/// Web Push settings; VAPID material is an opaque external input
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub enabled: bool,
    pub vapid_subject: Option<String>,
    pub vapid_public_key: Option<String>,
    pub vapid_private_key: Option<String>,
}

/// Pipeline sizing
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub channel_capacity: usize,
    /// Post-resolution suppression window for equivalent candidates, seconds
    pub dedup_cooldown_secs: u64,
    /// Sensors silent longer than this are swept OFFLINE, seconds
    pub offline_after_secs: u64,
}

/// Notifier sizing and pacing
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub attempt_timeout_secs: u64,
    pub recipient_cooldown_secs: u64,
    pub idempotency_window_secs: u64,
    pub drain_grace_secs: u64,
    pub replay_unresolved: bool,
}

/// One severity ladder: value beyond `warning` raises WARNING, beyond
/// `critical` CRITICAL, beyond `danger` DANGER. Direction (above/below)
/// comes from the alert type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ladder {
    pub warning: f64,
    pub critical: Option<f64>,
    pub danger: Option<f64>,
}

/// Threshold table; defaults match WHO/EPA-derived bands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdTable {
    pub co2_high: Ladder,
    pub pm25_high: Ladder,
    pub pm10_high: Ladder,
    pub voc_high: Ladder,
    pub temp_high: Ladder,
    pub temp_low: Ladder,
    pub humidity_high: Ladder,
    pub humidity_low: Ladder,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            co2_high: Ladder {
                warning: 1000.0,
                critical: Some(2000.0),
                danger: Some(5000.0),
            },
            pm25_high: Ladder {
                warning: 35.4,
                critical: Some(55.4),
                danger: Some(150.4),
            },
            pm10_high: Ladder {
                warning: 150.0,
                critical: Some(250.0),
                danger: None,
            },
            voc_high: Ladder {
                warning: 0.5,
                critical: Some(1.0),
                danger: None,
            },
            temp_high: Ladder {
                warning: 30.0,
                critical: Some(35.0),
                danger: None,
            },
            temp_low: Ladder {
                warning: 10.0,
                critical: Some(5.0),
                danger: None,
            },
            humidity_high: Ladder {
                warning: 70.0,
                critical: Some(85.0),
                danger: None,
            },
            humidity_low: Ladder {
                warning: 30.0,
                critical: Some(20.0),
                danger: None,
            },
        }
    }
}

/// Default table plus per-sensor overrides keyed by device id
#[derive(Debug, Clone, Default)]
pub struct ThresholdsConfig {
    pub default: ThresholdTable,
    pub per_sensor: HashMap<String, ThresholdTable>,
}

impl ThresholdsConfig {
    pub fn table_for(&self, device_id: &str) -> &ThresholdTable {
        self.per_sensor.get(device_id).unwrap_or(&self.default)
    }

    /// Load overrides from a YAML file:
    /// ```yaml
    /// default:
    ///   co2_high: { warning: 800.0, critical: 1500.0, danger: 4000.0 }
    /// sensors:
    ///   SENSOR_TUNIS_001:
    ///     pm25_high: { warning: 25.0, critical: 50.0, danger: 100.0 }
    /// ```
    pub fn from_file(path: &str) -> Result<Self> {
        #[derive(Deserialize)]
        struct File {
            #[serde(default)]
            default: ThresholdTable,
            #[serde(default)]
            sensors: HashMap<String, ThresholdTable>,
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Fatal(format!("cannot read thresholds file {path}: {e}")))?;
        let file: File = serde_yaml::from_str(&content)
            .map_err(|e| Error::Fatal(format!("invalid thresholds file {path}: {e}")))?;
        Ok(Self {
            default: file.default,
            per_sensor: file.sensors,
        })
    }
}

/// Full process configuration, loaded from environment with fail-fast
/// validation. A missing key is an error only when the feature that needs
/// it is enabled.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusConfig,
    pub store: StoreConfig,
    pub http: HttpConfig,
    pub email: EmailConfig,
    pub sms: SmsConfig,
    pub chat: ChatConfig,
    pub push: PushConfig,
    pub pipeline: PipelineConfig,
    pub notify: NotifyConfig,
    pub thresholds: ThresholdsConfig,
    pub dashboard_url: Option<String>,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let qos: u8 = env_parse("QOS", 1)?;
        if qos > 2 {
            return Err(Error::Fatal(format!("QOS must be 0, 1 or 2, got {qos}")));
        }

        let bus = BusConfig {
            url: env_or("BUS_URL", "tcp://localhost:1883"),
            topic: env_or("TOPIC", "airaware/sensors"),
            qos,
            client_id: env_opt("CLIENT_ID").unwrap_or_else(default_client_id),
        };
        // Reject malformed broker URLs at startup, not at first connect.
        bus.broker_addr()?;

        let email_enabled = env_bool("EMAIL_ENABLED", false);
        let email = EmailConfig {
            enabled: email_enabled,
            smtp_host: if email_enabled {
                require("SMTP_HOST", "EMAIL")?
            } else {
                env_or("SMTP_HOST", "")
            },
            smtp_port: env_parse("SMTP_PORT", 587)?,
            smtp_user: if email_enabled {
                require("SMTP_USER", "EMAIL")?
            } else {
                env_or("SMTP_USER", "")
            },
            smtp_pass: if email_enabled {
                require("SMTP_PASS", "EMAIL")?
            } else {
                env_or("SMTP_PASS", "")
            },
            starttls: env_bool("SMTP_STARTTLS", true),
            recipients: env_csv("ALERT_EMAIL_RECIPIENTS"),
        };

        let sms_enabled = env_bool("SMS_ENABLED", false);
        let sms = SmsConfig {
            enabled: sms_enabled,
            provider_sid: if sms_enabled {
                require("SMS_PROVIDER_SID", "SMS")?
            } else {
                env_or("SMS_PROVIDER_SID", "")
            },
            provider_token: if sms_enabled {
                require("SMS_PROVIDER_TOKEN", "SMS")?
            } else {
                env_or("SMS_PROVIDER_TOKEN", "")
            },
            from_number: if sms_enabled {
                require("SMS_PROVIDER_FROM", "SMS")?
            } else {
                env_or("SMS_PROVIDER_FROM", "")
            },
            recipients: env_csv("SMS_RECIPIENTS"),
        };

        let chat = ChatConfig {
            slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),
            discord_webhook_url: env_opt("DISCORD_WEBHOOK_URL"),
        };

        let push_enabled = env_bool("PUSH_ENABLED", false);
        let push = PushConfig {
            enabled: push_enabled,
            vapid_subject: env_opt("VAPID_SUBJECT"),
            vapid_public_key: env_opt("VAPID_PUBLIC_KEY"),
            vapid_private_key: env_opt("VAPID_PRIVATE_KEY"),
        };

        let pipeline = PipelineConfig {
            workers: env_parse("PIPELINE_WORKERS", 8)?,
            channel_capacity: env_parse("PIPELINE_QUEUE", 256)?,
            dedup_cooldown_secs: env_parse("DEDUP_COOLDOWN_SECS", 600)?,
            offline_after_secs: env_parse("OFFLINE_AFTER_SECS", 600)?,
        };

        let notify = NotifyConfig {
            workers: env_parse("NOTIFY_WORKERS", 16)?,
            queue_capacity: env_parse("NOTIFY_QUEUE", 1024)?,
            max_attempts: env_parse("NOTIFY_MAX_ATTEMPTS", 3)?,
            attempt_timeout_secs: env_parse("NOTIFY_ATTEMPT_TIMEOUT_SECS", 10)?,
            recipient_cooldown_secs: env_parse("NOTIFY_COOLDOWN_SECS", 300)?,
            idempotency_window_secs: env_parse("NOTIFY_IDEMPOTENCY_SECS", 86_400)?,
            drain_grace_secs: env_parse("SHUTDOWN_GRACE_SECS", 30)?,
            replay_unresolved: env_bool("REPLAY_UNRESOLVED", false),
        };

        let thresholds = match env_opt("THRESHOLDS_FILE") {
            Some(path) => ThresholdsConfig::from_file(&path)?,
            None => ThresholdsConfig::default(),
        };

        Ok(Self {
            bus,
            store: StoreConfig {
                url: env_or("DB_URL", "sqlite:airaware.db?mode=rwc"),
            },
            http: HttpConfig {
                addr: env_or("HTTP_ADDR", "0.0.0.0:8080"),
            },
            email,
            sms,
            chat,
            push,
            pipeline,
            notify,
            thresholds,
            dashboard_url: env_opt("DASHBOARD_URL"),
            log_level: env_or("LOG_LEVEL", "info"),
        })
    }
}

fn default_client_id() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("airaware-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_addr_parses_tcp_url() {
        let bus = BusConfig {
            url: "tcp://broker.example:1884".into(),
            topic: "t".into(),
            qos: 1,
            client_id: "c".into(),
        };
        assert_eq!(bus.broker_addr().unwrap(), ("broker.example".into(), 1884));
    }

    #[test]
    fn broker_addr_defaults_port() {
        let bus = BusConfig {
            url: "mqtt://localhost".into(),
            topic: "t".into(),
            qos: 1,
            client_id: "c".into(),
        };
        assert_eq!(bus.broker_addr().unwrap(), ("localhost".into(), 1883));
    }

    #[test]
    fn broker_addr_rejects_bad_port() {
        let bus = BusConfig {
            url: "tcp://host:notaport".into(),
            topic: "t".into(),
            qos: 1,
            client_id: "c".into(),
        };
        assert!(bus.broker_addr().is_err());
    }

    #[test]
    fn default_client_id_has_random_suffix() {
        let id = default_client_id();
        assert!(id.starts_with("airaware-"));
        assert_eq!(id.len(), "airaware-".len() + 8);
    }

    #[test]
    fn threshold_defaults_match_severity_bands() {
        let t = ThresholdTable::default();
        assert_eq!(t.co2_high.warning, 1000.0);
        assert_eq!(t.co2_high.danger, Some(5000.0));
        assert_eq!(t.pm25_high.critical, Some(55.4));
        assert_eq!(t.pm10_high.danger, None);
        assert_eq!(t.temp_low.critical, Some(5.0));
    }

    #[test]
    fn threshold_override_lookup_falls_back_to_default() {
        let mut cfg = ThresholdsConfig::default();
        let mut strict = ThresholdTable::default();
        strict.co2_high.warning = 600.0;
        cfg.per_sensor.insert("S1".into(), strict.clone());

        assert_eq!(cfg.table_for("S1"), &strict);
        assert_eq!(cfg.table_for("S2"), &ThresholdTable::default());
    }

    #[test]
    fn threshold_yaml_partial_override() {
        let yaml = r#"
sensors:
  SENSOR_A:
    co2_high: { warning: 700.0, critical: 1200.0, danger: 3000.0 }
"#;
        #[derive(Deserialize)]
        struct File {
            #[serde(default)]
            default: ThresholdTable,
            #[serde(default)]
            sensors: HashMap<String, ThresholdTable>,
        }
        let file: File = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.default, ThresholdTable::default());
        let a = &file.sensors["SENSOR_A"];
        assert_eq!(a.co2_high.warning, 700.0);
        // Unspecified ladders fall back to defaults.
        assert_eq!(a.pm25_high, ThresholdTable::default().pm25_high);
    }
}
