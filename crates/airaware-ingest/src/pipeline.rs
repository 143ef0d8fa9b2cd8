//! Ingestion pipeline
//!
//! Worker pool over the bus message channel. Per message: decode,
//! auto-register the sensor, then under the per-sensor lock persist the
//! reading alongside evaluation, apply alert dedup and persist alerts.
//! The broker ack is issued only after that critical section; enqueueing
//! to the notifier happens before the ack and blocks when the queue is
//! full, which backpressures the bus consumer instead of dropping work.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use airaware_core::config::ThresholdsConfig;
use airaware_core::stats::RuntimeStats;
use airaware_core::types::{Alert, Sensor};
use airaware_core::Result;
use airaware_notify::{AlertEvent, NotifierHandle};
use airaware_store::Repository;

use crate::bus::RawMessage;
use crate::codec;
use crate::evaluator::{self, Candidate};

pub struct Pipeline {
    repo: Arc<dyn Repository>,
    notifier: NotifierHandle,
    thresholds: ThresholdsConfig,
    stats: Arc<RuntimeStats>,
    /// Advisory per-sensor locks guarding {reading save, dedup, alert save}
    locks: DashMap<String, Arc<Mutex<()>>>,
    dedup_cooldown: ChronoDuration,
}

impl Pipeline {
    pub fn new(
        repo: Arc<dyn Repository>,
        notifier: NotifierHandle,
        thresholds: ThresholdsConfig,
        stats: Arc<RuntimeStats>,
        dedup_cooldown_secs: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            notifier,
            thresholds,
            stats,
            locks: DashMap::new(),
            dedup_cooldown: ChronoDuration::seconds(dedup_cooldown_secs as i64),
        })
    }

    /// Start `workers` tasks consuming the bus channel. They exit when the
    /// sender side closes and the channel drains.
    pub fn spawn_workers(
        self: &Arc<Self>,
        rx: mpsc::Receiver<RawMessage>,
        workers: usize,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        (0..workers.max(1))
            .map(|worker| {
                let pipeline = self.clone();
                let rx = rx.clone();
                tokio::spawn(async move {
                    loop {
                        let message = { rx.lock().await.recv().await };
                        match message {
                            Some(message) => pipeline.handle_message(message).await,
                            None => break,
                        }
                    }
                    debug!(worker, "pipeline worker drained");
                })
            })
            .collect()
    }

    /// Process one delivered bus message end to end.
    pub async fn handle_message(&self, message: RawMessage) {
        let reading = match codec::decode(&message.payload, Utc::now()) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "bad payload discarded");
                metrics::counter!("airaware_ingest_bad_payloads_total").increment(1);
                message.token.ack().await;
                return;
            }
        };

        // Devices may publish before registration; store a skeleton so the
        // reading is never dropped on the floor.
        match self.repo.find_sensor_by_device_id(&reading.sensor_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                let sensor = Sensor::unregistered(&reading.sensor_id, reading.timestamp);
                match self.repo.upsert_sensor(&sensor).await {
                    Ok(()) => info!(sensor_id = %reading.sensor_id, "auto-registered sensor"),
                    Err(e) if e.is_conflict() => {} // raced another worker
                    Err(e) => {
                        warn!(sensor_id = %reading.sensor_id, error = %e, "sensor registration failed; leaving message unacked");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(sensor_id = %reading.sensor_id, error = %e, "sensor lookup failed; leaving message unacked");
                return;
            }
        }

        let lock = self
            .locks
            .entry(reading.sensor_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let table = self.thresholds.table_for(&reading.sensor_id);
        let (saved, candidates) = tokio::join!(self.repo.save_reading(&reading), async {
            evaluator::evaluate(&reading, table)
        });

        let duplicate = match saved {
            Ok(()) => false,
            Err(e) if e.is_conflict() => {
                debug!(sensor_id = %reading.sensor_id, "duplicate reading redelivered, acking");
                metrics::counter!("airaware_ingest_duplicates_total").increment(1);
                true
            }
            Err(e) => {
                // Datastore down: no ack, the broker redelivers.
                warn!(sensor_id = %reading.sensor_id, error = %e, "reading save failed; leaving message unacked");
                return;
            }
        };

        let mut events = Vec::new();
        if !duplicate {
            for candidate in candidates {
                match self.apply_candidate(candidate).await {
                    Ok(Some(event)) => events.push(event),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(sensor_id = %reading.sensor_id, error = %e, "alert persistence failed; leaving message unacked");
                        return;
                    }
                }
            }

            if let Err(e) = self
                .repo
                .touch_sensor(&reading.sensor_id, reading.timestamp)
                .await
            {
                // Status upkeep must not block ingestion.
                warn!(sensor_id = %reading.sensor_id, error = %e, "sensor status update failed");
            }

            self.stats.record_reading();
            metrics::counter!("airaware_ingest_readings_total").increment(1);
        }

        drop(guard);

        // Backpressure point: blocks while the notifier queue is full.
        for event in events {
            if let Err(e) = self.notifier.enqueue(event).await {
                warn!(error = %e, "notifier enqueue failed");
            }
        }

        message.token.ack().await;
    }

    /// Dedup one candidate against the store under the caller-held sensor
    /// lock. Returns the event to notify, if any.
    async fn apply_candidate(&self, candidate: Candidate) -> Result<Option<AlertEvent>> {
        if let Some(active) = self
            .repo
            .find_active_alert(&candidate.sensor_id, candidate.alert_type)
            .await?
        {
            let upgraded = candidate.severity > active.severity;
            self.repo
                .update_alert_occurrence(
                    active.id,
                    candidate.triggered_at,
                    upgraded.then_some(candidate.severity),
                )
                .await?;

            if upgraded {
                info!(
                    sensor_id = %candidate.sensor_id,
                    alert_type = candidate.alert_type.as_str(),
                    from = active.severity.as_str(),
                    to = candidate.severity.as_str(),
                    "active alert severity upgraded"
                );
                let mut event = AlertEvent::from(&active);
                event.severity = candidate.severity;
                event.message = candidate.message;
                event.occurrence_count = active.occurrence_count + 1;
                return Ok(Some(event));
            }
            debug!(
                sensor_id = %candidate.sensor_id,
                alert_type = candidate.alert_type.as_str(),
                "candidate folded into active alert"
            );
            return Ok(None);
        }

        // Post-resolution cooldown: equivalent candidates are suppressed
        // unless the new severity strictly exceeds the resolved peak.
        let since = candidate.triggered_at - self.dedup_cooldown;
        if let Some((peak, _resolved_at)) = self
            .repo
            .last_resolved_alert(&candidate.sensor_id, candidate.alert_type, since)
            .await?
        {
            if candidate.severity <= peak {
                debug!(
                    sensor_id = %candidate.sensor_id,
                    alert_type = candidate.alert_type.as_str(),
                    peak = peak.as_str(),
                    "candidate suppressed by post-resolution cooldown"
                );
                metrics::counter!("airaware_alerts_suppressed_total").increment(1);
                return Ok(None);
            }
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type: candidate.alert_type,
            severity: candidate.severity,
            message: candidate.message,
            sensor_id: candidate.sensor_id,
            triggered_at: candidate.triggered_at,
            last_seen: candidate.triggered_at,
            occurrence_count: 1,
            reading: candidate.snapshot,
            resolved: false,
            resolved_at: None,
        };
        self.repo.save_alert(&alert).await?;
        self.stats.record_alert_created();
        metrics::counter!("airaware_alerts_created_total", "severity" => alert.severity.as_str())
            .increment(1);
        info!(
            alert_id = %alert.id,
            sensor_id = %alert.sensor_id,
            alert_type = alert.alert_type.as_str(),
            severity = alert.severity.as_str(),
            "alert created"
        );
        Ok(Some(AlertEvent::from(&alert)))
    }
}
