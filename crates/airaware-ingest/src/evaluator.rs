//! Threshold evaluation
//!
//! Pure rule engine: one reading in, candidate alerts out. Dedup against
//! existing alerts is the pipeline's job, not this module's.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use airaware_core::config::{Ladder, ThresholdTable};
use airaware_core::types::{AlertType, ChannelKind, Reading, ReadingSnapshot, Severity};

/// A threshold crossing proposed for alerting; may be deduplicated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub sensor_id: String,
    pub snapshot: ReadingSnapshot,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Clone, Copy)]
enum Direction {
    Above,
    Below,
}

/// Rule declaration order breaks severity ties downstream.
const RULES: [(AlertType, Direction); 8] = [
    (AlertType::Co2High, Direction::Above),
    (AlertType::Pm25High, Direction::Above),
    (AlertType::Pm10High, Direction::Above),
    (AlertType::VocHigh, Direction::Above),
    (AlertType::TempHigh, Direction::Above),
    (AlertType::TempLow, Direction::Below),
    (AlertType::HumidityHigh, Direction::Above),
    (AlertType::HumidityLow, Direction::Below),
];

fn ladder_for(table: &ThresholdTable, alert_type: AlertType) -> &Ladder {
    match alert_type {
        AlertType::Co2High => &table.co2_high,
        AlertType::Pm25High => &table.pm25_high,
        AlertType::Pm10High => &table.pm10_high,
        AlertType::VocHigh => &table.voc_high,
        AlertType::TempHigh => &table.temp_high,
        AlertType::TempLow => &table.temp_low,
        AlertType::HumidityHigh => &table.humidity_high,
        AlertType::HumidityLow => &table.humidity_low,
    }
}

/// Highest band the value crosses, with the crossed threshold for the
/// message. Comparisons are strict: a value exactly on a band boundary
/// stays in the band below.
fn band(value: f64, ladder: &Ladder, direction: Direction) -> Option<(Severity, f64)> {
    let crossed = |threshold: f64| match direction {
        Direction::Above => value > threshold,
        Direction::Below => value < threshold,
    };
    if let Some(danger) = ladder.danger {
        if crossed(danger) {
            return Some((Severity::Danger, danger));
        }
    }
    if let Some(critical) = ladder.critical {
        if crossed(critical) {
            return Some((Severity::Critical, critical));
        }
    }
    if crossed(ladder.warning) {
        return Some((Severity::Warning, ladder.warning));
    }
    None
}

fn channel_label(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Temperature => "Temperature",
        ChannelKind::Humidity => "Humidity",
        ChannelKind::Co2 => "CO2 level",
        ChannelKind::Voc => "VOC level",
        ChannelKind::Pm25 => "PM2.5 level",
        ChannelKind::Pm10 => "PM10 level",
    }
}

/// Evaluate one reading against the table. Absent channels are not
/// evaluated; suspect (out-of-validity-range) channels are excluded so
/// sensor garbage cannot mint alerts.
pub fn evaluate(reading: &Reading, table: &ThresholdTable) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for (alert_type, direction) in RULES {
        let kind = alert_type.channel();
        let Some(value) = reading.channels.get(kind) else {
            continue;
        };
        if reading.is_suspect(kind) {
            continue;
        }
        let Some((severity, threshold)) = band(value, ladder_for(table, alert_type), direction)
        else {
            continue;
        };

        let verb = match direction {
            Direction::Above => "exceeds",
            Direction::Below => "is below",
        };
        let unit = kind.unit();
        let message = format!("{} {value} {unit} {verb} {threshold} {unit}", channel_label(kind));

        candidates.push(Candidate {
            alert_type,
            severity,
            message,
            sensor_id: reading.sensor_id.clone(),
            snapshot: ReadingSnapshot::from(reading),
            triggered_at: reading.timestamp,
        });
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use airaware_core::types::Channels;
    use chrono::Utc;
    use uuid::Uuid;

    fn reading(channels: Channels) -> Reading {
        Reading {
            id: Uuid::new_v4(),
            sensor_id: "S1".into(),
            timestamp: Utc::now(),
            channels,
            suspect: vec![],
        }
    }

    fn table() -> ThresholdTable {
        ThresholdTable::default()
    }

    fn single(reading: &Reading) -> Candidate {
        let mut candidates = evaluate(reading, &table());
        assert_eq!(candidates.len(), 1, "expected exactly one candidate");
        candidates.remove(0)
    }

    #[test]
    fn pm25_band_boundaries_are_strict() {
        let at_warning = reading(Channels {
            pm25: Some(35.4),
            ..Channels::default()
        });
        assert!(evaluate(&at_warning, &table()).is_empty());

        let over_warning = reading(Channels {
            pm25: Some(35.401),
            ..Channels::default()
        });
        assert_eq!(single(&over_warning).severity, Severity::Warning);

        let at_critical = reading(Channels {
            pm25: Some(55.4),
            ..Channels::default()
        });
        assert_eq!(single(&at_critical).severity, Severity::Warning);

        let over_critical = reading(Channels {
            pm25: Some(55.401),
            ..Channels::default()
        });
        assert_eq!(single(&over_critical).severity, Severity::Critical);

        let over_danger = reading(Channels {
            pm25: Some(150.5),
            ..Channels::default()
        });
        assert_eq!(single(&over_danger).severity, Severity::Danger);
    }

    #[test]
    fn co2_ladder_reports_highest_band() {
        for (value, expected) in [
            (1000.0, None),
            (1000.5, Some(Severity::Warning)),
            (2000.5, Some(Severity::Critical)),
            (5000.5, Some(Severity::Danger)),
        ] {
            let r = reading(Channels {
                co2: Some(value),
                ..Channels::default()
            });
            let got = evaluate(&r, &table()).first().map(|c| c.severity);
            assert_eq!(got, expected, "co2 = {value}");
        }
    }

    #[test]
    fn low_rules_compare_downwards() {
        let cold = reading(Channels {
            temperature: Some(8.0),
            ..Channels::default()
        });
        let c = single(&cold);
        assert_eq!(c.alert_type, AlertType::TempLow);
        assert_eq!(c.severity, Severity::Warning);

        let freezing = reading(Channels {
            temperature: Some(4.9),
            ..Channels::default()
        });
        assert_eq!(single(&freezing).severity, Severity::Critical);

        // Exactly on the critical boundary stays in the warning band.
        let boundary = reading(Channels {
            temperature: Some(5.0),
            ..Channels::default()
        });
        assert_eq!(single(&boundary).severity, Severity::Warning);

        let dry = reading(Channels {
            humidity: Some(19.0),
            ..Channels::default()
        });
        let c = single(&dry);
        assert_eq!(c.alert_type, AlertType::HumidityLow);
        assert_eq!(c.severity, Severity::Critical);
    }

    #[test]
    fn missing_channels_are_not_evaluated() {
        let r = reading(Channels::default());
        assert!(evaluate(&r, &table()).is_empty());
    }

    #[test]
    fn suspect_channels_are_not_evaluated() {
        let mut r = reading(Channels {
            co2: Some(20_000.0),
            pm25: Some(40.0),
            ..Channels::default()
        });
        r.suspect = vec![ChannelKind::Co2];

        let candidates = evaluate(&r, &table());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].alert_type, AlertType::Pm25High);
    }

    #[test]
    fn candidates_follow_declaration_order() {
        let r = reading(Channels {
            co2: Some(1500.0),
            pm25: Some(40.0),
            temperature: Some(36.0),
            ..Channels::default()
        });
        let types: Vec<_> = evaluate(&r, &table()).into_iter().map(|c| c.alert_type).collect();
        assert_eq!(
            types,
            vec![AlertType::Co2High, AlertType::Pm25High, AlertType::TempHigh]
        );
    }

    #[test]
    fn candidate_carries_snapshot_and_reading_time() {
        let r = reading(Channels {
            voc: Some(1.2),
            ..Channels::default()
        });
        let c = single(&r);
        assert_eq!(c.alert_type, AlertType::VocHigh);
        assert_eq!(c.severity, Severity::Critical);
        assert_eq!(c.triggered_at, r.timestamp);
        assert_eq!(c.snapshot.reading_id, r.id);
        assert!(c.message.contains("VOC level 1.2 mg/m³ exceeds 1 mg/m³"));
    }

    #[test]
    fn condition_holds_iff_candidate_emitted() {
        // Property over a value grid: a candidate exists exactly when the
        // rule's condition holds for the (valid) channel value.
        for value in [0.0, 10.0, 35.4, 35.5, 55.4, 55.5, 150.4, 150.5, 999.0] {
            let r = reading(Channels {
                pm25: Some(value),
                ..Channels::default()
            });
            let emitted = evaluate(&r, &table())
                .iter()
                .any(|c| c.alert_type == AlertType::Pm25High);
            assert_eq!(emitted, value > 35.4, "pm25 = {value}");
        }
    }

    #[test]
    fn per_sensor_override_changes_bands() {
        let mut strict = table();
        strict.pm25_high.warning = 10.0;
        let r = reading(Channels {
            pm25: Some(12.0),
            ..Channels::default()
        });
        assert!(evaluate(&r, &table()).is_empty());
        assert_eq!(evaluate(&r, &strict).len(), 1);
    }
}
