//! Durable store for sensors, readings, alerts and push subscriptions.
//!
//! The `Repository` trait is the single mutation path for persisted state;
//! everything else in the process holds records only transiently. One
//! production implementation exists per deployment (`SqliteStore`).

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use airaware_core::types::{
    Alert, AlertType, PushSubscription, Reading, Sensor, SensorStatus, Severity, User,
};
use airaware_core::Result;

pub use sqlite::SqliteStore;

/// Outcome of one push delivery attempt, fed back into failure accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Delivered,
    Failed,
    /// Permanent 410/404 from the push service; deactivate immediately.
    Gone,
}

/// Filter for `list_alerts`
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub sensor_id: Option<String>,
    pub resolved: Option<bool>,
    pub limit: Option<u32>,
}

/// Aggregate counts served by the control surface
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub sensors_by_status: HashMap<SensorStatus, u64>,
    pub active_alerts_by_severity: HashMap<Severity, u64>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    // -- readings -----------------------------------------------------------

    /// Persist one reading. Idempotent on (sensor, timestamp, channel
    /// fingerprint): a bus redelivery yields `Conflict` with the stored id.
    async fn save_reading(&self, reading: &Reading) -> Result<()>;

    /// Chronologically ordered readings for one sensor. `limit` defaults to
    /// 1000 and is clamped to 10000.
    async fn list_readings(
        &self,
        sensor_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Reading>>;

    // -- sensors ------------------------------------------------------------

    async fn upsert_sensor(&self, sensor: &Sensor) -> Result<()>;
    async fn find_sensor_by_device_id(&self, device_id: &str) -> Result<Option<Sensor>>;
    async fn list_sensors(&self, status: Option<SensorStatus>) -> Result<Vec<Sensor>>;

    /// Record activity: last-write-wins on `last_update`, status → ACTIVE.
    async fn touch_sensor(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<()>;

    /// Sweep sensors silent since `cutoff` to OFFLINE; returns affected
    /// device ids.
    async fn mark_sensors_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Fails with `Conflict` while readings still reference the sensor.
    async fn delete_sensor(&self, device_id: &str) -> Result<()>;

    // -- alerts -------------------------------------------------------------

    async fn save_alert(&self, alert: &Alert) -> Result<()>;
    async fn find_active_alert(
        &self,
        sensor_id: &str,
        alert_type: AlertType,
    ) -> Result<Option<Alert>>;

    /// Bump occurrence count and `last_seen`; upgrade severity when given.
    async fn update_alert_occurrence(
        &self,
        id: Uuid,
        last_seen: DateTime<Utc>,
        severity: Option<Severity>,
    ) -> Result<()>;

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>>;

    /// Returns the resolved alert, or `NotFound`. Resolution clears the
    /// dedup state for the (sensor, type) pair.
    async fn resolve_alert(&self, id: Uuid) -> Result<Alert>;

    /// Peak severity and resolution time of the most recently resolved
    /// alert for the pair, if it resolved at or after `since`.
    async fn last_resolved_alert(
        &self,
        sensor_id: &str,
        alert_type: AlertType,
        since: DateTime<Utc>,
    ) -> Result<Option<(Severity, DateTime<Utc>)>>;

    async fn list_unresolved_alerts(&self) -> Result<Vec<Alert>>;

    // -- push subscriptions -------------------------------------------------

    /// Upsert on endpoint; re-subscribing reactivates and refreshes keys.
    async fn save_push_subscription(&self, sub: &PushSubscription) -> Result<()>;
    async fn remove_push_subscription(&self, endpoint: &str) -> Result<()>;
    async fn list_active_push_subscriptions(&self) -> Result<Vec<PushSubscription>>;

    /// Atomically account one delivery attempt. Five consecutive failures,
    /// or a `Gone` outcome, flip `active` off on that very call.
    async fn record_push_attempt(
        &self,
        endpoint: &str,
        outcome: PushOutcome,
    ) -> Result<PushSubscription>;

    // -- users (external IAM collaborator contract) -------------------------

    async fn upsert_user(&self, user: &User) -> Result<()>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Users who opted into alert notifications on any channel.
    async fn list_notification_recipients(&self) -> Result<Vec<User>>;

    // -- aggregates ---------------------------------------------------------

    async fn stats(&self) -> Result<StoreStats>;
}

/// Deterministic fingerprint over the six channel slots, used by the
/// reading dedup index. Missing and present-but-equal channels hash
/// differently, so a redelivery matches and a genuinely new sample at the
/// same instant does not.
pub fn channel_fingerprint(reading: &Reading) -> String {
    use airaware_core::types::ChannelKind;
    let mut out = String::with_capacity(64);
    for kind in ChannelKind::ALL {
        match reading.channels.get(kind) {
            // Bit pattern, not display form: -0.0 vs 0.0 and float noise
            // must not defeat idempotency.
            Some(v) => out.push_str(&format!("{:x};", v.to_bits())),
            None => out.push_str("_;"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use airaware_core::types::Channels;

    fn reading_with(co2: Option<f64>, pm25: Option<f64>) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            sensor_id: "S1".into(),
            timestamp: Utc::now(),
            channels: Channels {
                co2,
                pm25,
                ..Channels::default()
            },
            suspect: vec![],
        }
    }

    #[test]
    fn fingerprint_is_stable_across_ids() {
        let a = reading_with(Some(400.0), Some(10.0));
        let mut b = a.clone();
        b.id = Uuid::new_v4();
        assert_eq!(channel_fingerprint(&a), channel_fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_missing_from_present() {
        let a = reading_with(Some(400.0), None);
        let b = reading_with(Some(400.0), Some(10.0));
        assert_ne!(channel_fingerprint(&a), channel_fingerprint(&b));
    }

    #[test]
    fn fingerprint_distinguishes_values() {
        let a = reading_with(Some(400.0), Some(10.0));
        let b = reading_with(Some(401.0), Some(10.0));
        assert_ne!(channel_fingerprint(&a), channel_fingerprint(&b));
    }
}
