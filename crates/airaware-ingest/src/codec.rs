//! Wire payload → [`Reading`]
//!
//! The single point of timestamp normalization: RFC 3339 with offset,
//! ISO-8601 without a timezone (read as UTC), and numeric epochs in
//! seconds or milliseconds are all accepted. Anything else on a present
//! timestamp is a `BadPayload`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use airaware_core::types::{ChannelKind, Channels, Reading};
use airaware_core::{Error, Result};

/// Epoch values below this are seconds, at or above are milliseconds.
const EPOCH_MILLIS_CUTOFF: i64 = 10_000_000_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WirePayload {
    #[serde(default)]
    sensor_id: Option<String>,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    humidity: Option<f64>,
    #[serde(default)]
    co2: Option<f64>,
    #[serde(default)]
    voc: Option<f64>,
    #[serde(default)]
    pm25: Option<f64>,
    #[serde(default)]
    pm10: Option<f64>,
    // location and any other fields are attributes of the sensor record,
    // not of the reading; serde drops them.
}

/// Decode one bus payload. `ingest_time` substitutes for a missing
/// timestamp so the codec itself never reads the clock.
pub fn decode(payload: &[u8], ingest_time: DateTime<Utc>) -> Result<Reading> {
    let wire: WirePayload = serde_json::from_slice(payload)
        .map_err(|e| Error::BadPayload(format!("invalid JSON: {e}")))?;

    let sensor_id = match wire.sensor_id {
        Some(id) if !id.trim().is_empty() => id,
        Some(_) => return Err(Error::BadPayload("sensorId is empty".into())),
        None => return Err(Error::BadPayload("sensorId is missing".into())),
    };

    let timestamp = match &wire.timestamp {
        Some(value) => parse_timestamp(value)?.unwrap_or(ingest_time),
        None => ingest_time,
    };

    let channels = Channels {
        temperature: finite(wire.temperature),
        humidity: finite(wire.humidity),
        co2: finite(wire.co2),
        voc: finite(wire.voc),
        pm25: finite(wire.pm25),
        pm10: finite(wire.pm10),
    };

    let suspect = ChannelKind::ALL
        .into_iter()
        .filter(|kind| {
            channels.get(*kind).is_some_and(|v| {
                let (lo, hi) = kind.validity_range();
                v < lo || v > hi
            })
        })
        .collect();

    Ok(Reading {
        id: Uuid::new_v4(),
        sensor_id,
        timestamp,
        channels,
        suspect,
    })
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

fn parse_timestamp(value: &serde_json::Value) -> Result<Option<DateTime<Utc>>> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => parse_timestamp_str(s).map(Some),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                epoch_to_utc(i).map(Some)
            } else if let Some(f) = n.as_f64() {
                // Fractional epoch seconds; same cutoff applies.
                if f.abs() < EPOCH_MILLIS_CUTOFF as f64 {
                    DateTime::from_timestamp_millis((f * 1000.0) as i64)
                        .map(Some)
                        .ok_or_else(|| Error::BadPayload(format!("timestamp out of range: {f}")))
                } else {
                    DateTime::from_timestamp_millis(f as i64)
                        .map(Some)
                        .ok_or_else(|| Error::BadPayload(format!("timestamp out of range: {f}")))
                }
            } else {
                Err(Error::BadPayload(format!("unparseable timestamp: {n}")))
            }
        }
        other => Err(Error::BadPayload(format!(
            "timestamp must be a string or number, got {other}"
        ))),
    }
}

fn parse_timestamp_str(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // ISO-8601 without a timezone designator is interpreted as UTC.
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    Err(Error::BadPayload(format!("unparseable timestamp: {s}")))
}

fn epoch_to_utc(value: i64) -> Result<DateTime<Utc>> {
    let dt = if value.abs() < EPOCH_MILLIS_CUTOFF {
        DateTime::from_timestamp(value, 0)
    } else {
        DateTime::from_timestamp_millis(value)
    };
    dt.ok_or_else(|| Error::BadPayload(format!("timestamp out of range: {value}")))
}
