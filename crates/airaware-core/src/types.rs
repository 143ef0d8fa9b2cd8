use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sensor operational status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorStatus {
    Active,
    Inactive,
    Offline,
    Maintenance,
}

impl SensorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorStatus::Active => "ACTIVE",
            SensorStatus::Inactive => "INACTIVE",
            SensorStatus::Offline => "OFFLINE",
            SensorStatus::Maintenance => "MAINTENANCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(SensorStatus::Active),
            "INACTIVE" => Some(SensorStatus::Inactive),
            "OFFLINE" => Some(SensorStatus::Offline),
            "MAINTENANCE" => Some(SensorStatus::Maintenance),
            _ => None,
        }
    }
}

/// Geographic position of a sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub city: Option<String>,
    pub country: Option<String>,
}

/// A registered environmental sensor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: Uuid,
    /// External identifier the device publishes under, unique per deployment
    pub device_id: String,
    pub model: Option<String>,
    pub description: Option<String>,
    pub status: SensorStatus,
    pub last_update: DateTime<Utc>,
    pub location: Option<Location>,
    pub tenant_ref: Option<String>,
}

impl Sensor {
    /// Skeleton record for a device id seen on the bus before registration.
    pub fn unregistered(device_id: &str, seen_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.to_string(),
            model: None,
            description: None,
            status: SensorStatus::Active,
            last_update: seen_at,
            location: None,
            tenant_ref: None,
        }
    }
}

/// The six measurement channels a reading may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Temperature,
    Humidity,
    Co2,
    Voc,
    Pm25,
    Pm10,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Temperature,
        ChannelKind::Humidity,
        ChannelKind::Co2,
        ChannelKind::Voc,
        ChannelKind::Pm25,
        ChannelKind::Pm10,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Temperature => "temperature",
            ChannelKind::Humidity => "humidity",
            ChannelKind::Co2 => "co2",
            ChannelKind::Voc => "voc",
            ChannelKind::Pm25 => "pm25",
            ChannelKind::Pm10 => "pm10",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "temperature" => Some(ChannelKind::Temperature),
            "humidity" => Some(ChannelKind::Humidity),
            "co2" => Some(ChannelKind::Co2),
            "voc" => Some(ChannelKind::Voc),
            "pm25" => Some(ChannelKind::Pm25),
            "pm10" => Some(ChannelKind::Pm10),
            _ => None,
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            ChannelKind::Temperature => "°C",
            ChannelKind::Humidity => "%",
            ChannelKind::Co2 => "ppm",
            ChannelKind::Voc => "mg/m³",
            ChannelKind::Pm25 | ChannelKind::Pm10 => "µg/m³",
        }
    }

    /// Physical validity range; values outside are stored but flagged suspect.
    pub fn validity_range(&self) -> (f64, f64) {
        match self {
            ChannelKind::Temperature => (-50.0, 70.0),
            ChannelKind::Humidity => (0.0, 100.0),
            ChannelKind::Co2 => (0.0, 10_000.0),
            ChannelKind::Voc => (0.0, 10.0),
            ChannelKind::Pm25 | ChannelKind::Pm10 => (0.0, 1_000.0),
        }
    }
}

/// One slot per measurement channel; absent channels are not evaluated
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Channels {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub co2: Option<f64>,
    pub voc: Option<f64>,
    pub pm25: Option<f64>,
    pub pm10: Option<f64>,
}

impl Channels {
    pub fn get(&self, kind: ChannelKind) -> Option<f64> {
        match kind {
            ChannelKind::Temperature => self.temperature,
            ChannelKind::Humidity => self.humidity,
            ChannelKind::Co2 => self.co2,
            ChannelKind::Voc => self.voc,
            ChannelKind::Pm25 => self.pm25,
            ChannelKind::Pm10 => self.pm10,
        }
    }

    pub fn set(&mut self, kind: ChannelKind, value: Option<f64>) {
        let slot = match kind {
            ChannelKind::Temperature => &mut self.temperature,
            ChannelKind::Humidity => &mut self.humidity,
            ChannelKind::Co2 => &mut self.co2,
            ChannelKind::Voc => &mut self.voc,
            ChannelKind::Pm25 => &mut self.pm25,
            ChannelKind::Pm10 => &mut self.pm10,
        };
        *slot = value;
    }
}

/// One vector of environmental measurements at one instant from one sensor.
/// Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub id: Uuid,
    /// References `Sensor.device_id`
    pub sensor_id: String,
    pub timestamp: DateTime<Utc>,
    pub channels: Channels,
    /// Channels outside their validity range, stored but excluded from evaluation
    pub suspect: Vec<ChannelKind>,
}

impl Reading {
    pub fn is_suspect(&self, kind: ChannelKind) -> bool {
        self.suspect.contains(&kind)
    }
}

/// Alert severity ladder; ordering is load-bearing for routing and upgrades
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
    Danger,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
            Severity::Danger => "DANGER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Severity::Info),
            "WARNING" => Some(Severity::Warning),
            "CRITICAL" => Some(Severity::Critical),
            "DANGER" => Some(Severity::Danger),
            _ => None,
        }
    }
}

/// Alert classification, one per threshold rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Co2High,
    Pm25High,
    Pm10High,
    VocHigh,
    TempHigh,
    TempLow,
    HumidityHigh,
    HumidityLow,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Co2High => "CO2_HIGH",
            AlertType::Pm25High => "PM25_HIGH",
            AlertType::Pm10High => "PM10_HIGH",
            AlertType::VocHigh => "VOC_HIGH",
            AlertType::TempHigh => "TEMP_HIGH",
            AlertType::TempLow => "TEMP_LOW",
            AlertType::HumidityHigh => "HUMIDITY_HIGH",
            AlertType::HumidityLow => "HUMIDITY_LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CO2_HIGH" => Some(AlertType::Co2High),
            "PM25_HIGH" => Some(AlertType::Pm25High),
            "PM10_HIGH" => Some(AlertType::Pm10High),
            "VOC_HIGH" => Some(AlertType::VocHigh),
            "TEMP_HIGH" => Some(AlertType::TempHigh),
            "TEMP_LOW" => Some(AlertType::TempLow),
            "HUMIDITY_HIGH" => Some(AlertType::HumidityHigh),
            "HUMIDITY_LOW" => Some(AlertType::HumidityLow),
            _ => None,
        }
    }

    /// The measurement channel this rule watches.
    pub fn channel(&self) -> ChannelKind {
        match self {
            AlertType::Co2High => ChannelKind::Co2,
            AlertType::Pm25High => ChannelKind::Pm25,
            AlertType::Pm10High => ChannelKind::Pm10,
            AlertType::VocHigh => ChannelKind::Voc,
            AlertType::TempHigh | AlertType::TempLow => ChannelKind::Temperature,
            AlertType::HumidityHigh | AlertType::HumidityLow => ChannelKind::Humidity,
        }
    }
}

/// Snapshot of the reading that triggered an alert, embedded so the alert
/// remains self-describing even if readings are pruned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadingSnapshot {
    pub reading_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub channels: Channels,
}

impl From<&Reading> for ReadingSnapshot {
    fn from(r: &Reading) -> Self {
        Self {
            reading_id: r.id,
            timestamp: r.timestamp,
            channels: r.channels,
        }
    }
}

/// A threshold crossing, deduplicated per (sensor, type)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub sensor_id: String,
    pub triggered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub occurrence_count: u32,
    pub reading: ReadingSnapshot,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Web Push subscription registered by a browser client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscription {
    pub id: Uuid,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub user_id: Option<Uuid>,
    pub user_agent: Option<String>,
    pub platform: Option<String>,
    pub active: bool,
    pub success_count: u32,
    pub failure_count: u32,
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// Operator identity, owned by the external IAM service. Only the lookup
/// contract the pipeline needs is modelled here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub notify_email: bool,
    pub notify_sms: bool,
}

/// Connection state of the bus subscriber, published for the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusLinkState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Degraded,
    Stopped,
}

impl BusLinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusLinkState::Disconnected => "DISCONNECTED",
            BusLinkState::Connecting => "CONNECTING",
            BusLinkState::Connected => "CONNECTED",
            BusLinkState::Subscribed => "SUBSCRIBED",
            BusLinkState::Degraded => "DEGRADED",
            BusLinkState::Stopped => "STOPPED",
        }
    }
}
