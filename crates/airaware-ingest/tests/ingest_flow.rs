//! End-to-end pipeline flows against a real SQLite store: decoded bus
//! messages in, persisted readings/alerts and sensor status out.

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use airaware_core::config::{NotifyConfig, ThresholdsConfig};
use airaware_core::stats::RuntimeStats;
use airaware_core::types::{AlertType, SensorStatus, Severity};
use airaware_ingest::bus::{DeliveryToken, RawMessage};
use airaware_ingest::pipeline::Pipeline;
use airaware_notify::service::{ChannelSet, Notifier, StaticRecipients};
use airaware_store::{AlertFilter, Repository, SqliteStore};

struct Harness {
    pipeline: Arc<Pipeline>,
    repo: Arc<SqliteStore>,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("flow.db").display());
    let store = SqliteStore::connect(&url).await.expect("connect");
    store.migrate().await.expect("migrate");
    let repo = Arc::new(store);

    let stats = Arc::new(RuntimeStats::new());
    // No channels enabled: the queue exists, deliveries are no-ops.
    let notifier = Notifier::with_channels(
        ChannelSet::default(),
        StaticRecipients::default(),
        &NotifyConfig {
            workers: 1,
            queue_capacity: 64,
            max_attempts: 1,
            attempt_timeout_secs: 1,
            recipient_cooldown_secs: 300,
            idempotency_window_secs: 86_400,
            drain_grace_secs: 1,
            replay_unresolved: false,
        },
        repo.clone(),
        stats.clone(),
    );
    let (handle, _workers) = notifier.spawn(64, 1);

    let pipeline = Pipeline::new(
        repo.clone(),
        handle,
        ThresholdsConfig::default(),
        stats,
        600,
    );

    Harness {
        pipeline,
        repo,
        _dir: dir,
    }
}

async fn publish(h: &Harness, payload: &str) {
    h.pipeline
        .handle_message(RawMessage {
            topic: "airaware/sensors".into(),
            payload: payload.as_bytes().to_vec(),
            qos: 1,
            token: DeliveryToken::detached(),
        })
        .await;
}

async fn active_alerts(h: &Harness, sensor_id: &str) -> Vec<airaware_core::types::Alert> {
    h.repo
        .list_alerts(&AlertFilter {
            sensor_id: Some(sensor_id.to_string()),
            resolved: Some(false),
            ..AlertFilter::default()
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn clean_ingestion_stores_reading_and_activates_sensor() {
    let h = harness().await;
    publish(
        &h,
        r#"{"sensorId":"S1","pm25":10,"co2":400,"timestamp":"2025-01-01T00:00:00Z"}"#,
    )
    .await;

    let readings = h.repo.list_readings("S1", None, None, None).await.unwrap();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].channels.pm25, Some(10.0));

    assert!(active_alerts(&h, "S1").await.is_empty());

    let sensor = h.repo.find_sensor_by_device_id("S1").await.unwrap().unwrap();
    assert_eq!(sensor.status, SensorStatus::Active);
    assert_eq!(
        sensor.last_update,
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    );
}

#[tokio::test]
async fn threshold_crossing_creates_warning_alert() {
    let h = harness().await;
    publish(&h, r#"{"sensorId":"S1","pm25":40}"#).await;

    let alerts = active_alerts(&h, "S1").await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, AlertType::Pm25High);
    assert_eq!(alerts[0].severity, Severity::Warning);
    assert!(!alerts[0].resolved);
    assert_eq!(alerts[0].occurrence_count, 1);
}

#[tokio::test]
async fn repeated_crossings_fold_into_one_alert_and_upgrade() {
    let h = harness().await;
    publish(&h, r#"{"sensorId":"S1","pm25":40}"#).await;
    publish(&h, r#"{"sensorId":"S1","pm25":42}"#).await;
    publish(&h, r#"{"sensorId":"S1","pm25":45}"#).await;
    publish(&h, r#"{"sensorId":"S1","pm25":60}"#).await;

    let alerts = active_alerts(&h, "S1").await;
    assert_eq!(alerts.len(), 1, "dedup must keep a single active alert");
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].occurrence_count, 4);
}

#[tokio::test]
async fn severity_never_downgrades_while_active() {
    let h = harness().await;
    publish(&h, r#"{"sensorId":"S1","pm25":60}"#).await; // CRITICAL
    publish(&h, r#"{"sensorId":"S1","pm25":40}"#).await; // back to warning band

    let alerts = active_alerts(&h, "S1").await;
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].occurrence_count, 2);
}

#[tokio::test]
async fn cooldown_suppresses_after_resolution_unless_severity_exceeds_peak() {
    let h = harness().await;
    publish(&h, r#"{"sensorId":"S1","pm25":40}"#).await;
    let alert_id = active_alerts(&h, "S1").await[0].id;
    h.repo.resolve_alert(alert_id).await.unwrap();

    // Equivalent candidate within the 10 min cooldown: suppressed.
    publish(&h, r#"{"sensorId":"S1","pm25":45}"#).await;
    assert!(active_alerts(&h, "S1").await.is_empty());

    // Strictly higher severity escapes the cooldown.
    publish(&h, r#"{"sensorId":"S1","pm25":60}"#).await;
    let alerts = active_alerts(&h, "S1").await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].severity, Severity::Critical);
    assert_eq!(alerts[0].occurrence_count, 1, "a fresh alert, not an update");
}

#[tokio::test]
async fn redelivered_message_is_idempotent() {
    let h = harness().await;
    let payload = r#"{"sensorId":"S1","pm25":40,"timestamp":"2025-01-01T00:00:00Z"}"#;
    publish(&h, payload).await;
    publish(&h, payload).await; // broker redelivery, same instant + channels

    let readings = h.repo.list_readings("S1", None, None, None).await.unwrap();
    assert_eq!(readings.len(), 1);

    let alerts = active_alerts(&h, "S1").await;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].occurrence_count, 1, "duplicate must not bump dedup state");
}

#[tokio::test]
async fn bad_payload_is_dropped_without_side_effects() {
    let h = harness().await;
    publish(&h, r#"{"pm25":40}"#).await; // sensorId missing
    publish(&h, "not json").await;

    assert!(h.repo.list_sensors(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn suspect_channel_is_stored_but_never_alerts() {
    let h = harness().await;
    publish(&h, r#"{"sensorId":"S1","co2":20000}"#).await;

    let readings = h.repo.list_readings("S1", None, None, None).await.unwrap();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].channels.co2, Some(20000.0));
    assert!(!readings[0].suspect.is_empty());

    assert!(active_alerts(&h, "S1").await.is_empty());
}

#[tokio::test]
async fn alerts_are_tracked_per_sensor_and_type() {
    let h = harness().await;
    publish(&h, r#"{"sensorId":"S1","pm25":40}"#).await;
    publish(&h, r#"{"sensorId":"S2","pm25":40}"#).await;
    publish(&h, r#"{"sensorId":"S1","co2":1500}"#).await;

    assert_eq!(active_alerts(&h, "S1").await.len(), 2);
    assert_eq!(active_alerts(&h, "S2").await.len(), 1);
}

#[tokio::test]
async fn stale_sensor_is_swept_offline() {
    let h = harness().await;
    // A reading stamped 11 minutes ago, then a sweep with a 10 min cutoff.
    let stale = (Utc::now() - chrono::Duration::minutes(11)).to_rfc3339();
    publish(
        &h,
        &format!(r#"{{"sensorId":"S1","pm25":10,"timestamp":"{stale}"}}"#),
    )
    .await;

    let swept = h
        .repo
        .mark_sensors_offline(Utc::now() - chrono::Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(swept, vec!["S1".to_string()]);
    let sensor = h.repo.find_sensor_by_device_id("S1").await.unwrap().unwrap();
    assert_eq!(sensor.status, SensorStatus::Offline);
}
