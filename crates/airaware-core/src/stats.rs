use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide ingestion and delivery counters shared between the
/// pipeline, the notifier and the control surface. Cheap to clone behind
/// an `Arc`; all updates are relaxed atomics.
#[derive(Debug, Default)]
pub struct RuntimeStats {
    readings_total: AtomicU64,
    /// Readings accepted since the last EMA tick
    window_count: AtomicU64,
    /// Readings/minute EMA, stored in millireadings to stay integral
    ema_milli: AtomicU64,
    alerts_created: AtomicU64,
    notify_delivered: AtomicU64,
    notify_failed: AtomicU64,
}

/// Smoothing factor for the readings/minute EMA.
const EMA_ALPHA: f64 = 0.3;

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_reading(&self) {
        self.readings_total.fetch_add(1, Ordering::Relaxed);
        self.window_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alert_created(&self) {
        self.alerts_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, delivered: bool) {
        if delivered {
            self.notify_delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notify_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fold the current window into the EMA. Called by the sweeper on its
    /// fixed cadence; `elapsed_secs` is the window length.
    pub fn ema_tick(&self, elapsed_secs: u64) {
        if elapsed_secs == 0 {
            return;
        }
        let count = self.window_count.swap(0, Ordering::Relaxed);
        let per_minute = count as f64 * 60.0 / elapsed_secs as f64;
        let prev = self.ema_milli.load(Ordering::Relaxed) as f64 / 1000.0;
        let next = if self.readings_total.load(Ordering::Relaxed) == count {
            per_minute // first window seeds the average
        } else {
            EMA_ALPHA * per_minute + (1.0 - EMA_ALPHA) * prev
        };
        self.ema_milli
            .store((next * 1000.0).round() as u64, Ordering::Relaxed);
    }

    pub fn readings_total(&self) -> u64 {
        self.readings_total.load(Ordering::Relaxed)
    }

    pub fn readings_per_minute(&self) -> f64 {
        self.ema_milli.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn alerts_created(&self) -> u64 {
        self.alerts_created.load(Ordering::Relaxed)
    }

    pub fn notify_delivered(&self) -> u64 {
        self.notify_delivered.load(Ordering::Relaxed)
    }

    pub fn notify_failed(&self) -> u64 {
        self.notify_failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let s = RuntimeStats::new();
        s.record_reading();
        s.record_reading();
        s.record_delivery(true);
        s.record_delivery(false);
        assert_eq!(s.readings_total(), 2);
        assert_eq!(s.notify_delivered(), 1);
        assert_eq!(s.notify_failed(), 1);
    }

    #[test]
    fn first_window_seeds_ema() {
        let s = RuntimeStats::new();
        for _ in 0..120 {
            s.record_reading();
        }
        s.ema_tick(60);
        assert!((s.readings_per_minute() - 120.0).abs() < 0.001);
    }

    #[test]
    fn ema_smooths_subsequent_windows() {
        let s = RuntimeStats::new();
        for _ in 0..60 {
            s.record_reading();
        }
        s.ema_tick(60); // seeds at 60/min
        s.ema_tick(60); // empty window: 0.3 * 0 + 0.7 * 60 = 42
        assert!((s.readings_per_minute() - 42.0).abs() < 0.001);
    }

    #[test]
    fn zero_elapsed_tick_is_ignored() {
        let s = RuntimeStats::new();
        s.record_reading();
        s.ema_tick(0);
        assert_eq!(s.readings_per_minute(), 0.0);
    }
}
