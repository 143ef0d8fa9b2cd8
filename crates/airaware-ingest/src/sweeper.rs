//! Offline-sensor sweep and stats upkeep

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use airaware_core::stats::RuntimeStats;
use airaware_store::Repository;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Every minute: mark sensors silent past `offline_after` as OFFLINE and
/// fold the readings/minute window into the EMA.
pub async fn run(
    repo: Arc<dyn Repository>,
    stats: Arc<RuntimeStats>,
    offline_after: Duration,
    cancel: CancellationToken,
) {
    let offline_after = ChronoDuration::seconds(offline_after.as_secs() as i64);
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; consume it so the first real sweep
    // happens one full interval after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("sweeper stopped");
                return;
            }
            _ = ticker.tick() => {}
        }

        let cutoff = Utc::now() - offline_after;
        match repo.mark_sensors_offline(cutoff).await {
            Ok(swept) => {
                for device_id in &swept {
                    warn!(sensor_id = %device_id, "sensor marked OFFLINE, no data past cutoff");
                }
                if !swept.is_empty() {
                    metrics::counter!("airaware_sensors_swept_offline_total")
                        .increment(swept.len() as u64);
                }
            }
            Err(e) => warn!(error = %e, "offline sweep failed"),
        }

        stats.ema_tick(SWEEP_INTERVAL.as_secs());
    }
}
