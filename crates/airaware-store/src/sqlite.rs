use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, QueryBuilder, Row, Sqlite};
use tracing::{info, instrument};
use uuid::Uuid;

use airaware_core::types::{
    Alert, AlertType, ChannelKind, Channels, Location, PushSubscription, Reading, ReadingSnapshot,
    Sensor, SensorStatus, Severity, User,
};
use airaware_core::{Error, Result};

use crate::{channel_fingerprint, AlertFilter, PushOutcome, Repository, StoreStats};

const DEFAULT_LIST_LIMIT: u32 = 1000;
const MAX_READING_LIMIT: u32 = 10_000;

/// SQLite-backed repository. WAL mode, embedded migrations.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

fn store_err(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(e.to_string()),
        _ => Error::Transient(e.to_string()),
    }
}

fn corrupt(what: &str, value: &str) -> Error {
    Error::Fatal(format!("corrupt {what} in store: {value}"))
}

fn to_utc(naive: NaiveDateTime) -> DateTime<Utc> {
    naive.and_utc()
}

impl SqliteStore {
    /// Connect to `url` (e.g. `sqlite:airaware.db?mode=rwc`). Schema is not
    /// touched here; call [`SqliteStore::migrate`] before first use.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| Error::Fatal(format!("datastore unreachable at {url}: {e}")))?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await
            .map_err(store_err)?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await
            .map_err(store_err)?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await
            .map_err(store_err)?;

        info!(url, "sqlite store connected");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Fatal(format!("migration failed: {e}")))?;
        info!("sqlite migrations applied");
        Ok(())
    }

    fn sensor_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Sensor> {
        let id_str: String = row.get("id");
        let status_str: String = row.get("status");
        let latitude: Option<f64> = row.get("latitude");
        let longitude: Option<f64> = row.get("longitude");
        let location = match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
                altitude: row.get("altitude"),
                city: row.get("city"),
                country: row.get("country"),
            }),
            _ => None,
        };
        Ok(Sensor {
            id: Uuid::parse_str(&id_str).map_err(|_| corrupt("sensor id", &id_str))?,
            device_id: row.get("device_id"),
            model: row.get("model"),
            description: row.get("description"),
            status: SensorStatus::parse(&status_str)
                .ok_or_else(|| corrupt("sensor status", &status_str))?,
            last_update: to_utc(row.get("last_update")),
            location,
            tenant_ref: row.get("tenant_ref"),
        })
    }

    fn reading_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Reading> {
        let id_str: String = row.get("id");
        let suspect_str: String = row.get("suspect");
        let suspect = suspect_str
            .split(',')
            .filter_map(ChannelKind::parse)
            .collect();
        Ok(Reading {
            id: Uuid::parse_str(&id_str).map_err(|_| corrupt("reading id", &id_str))?,
            sensor_id: row.get("sensor_id"),
            timestamp: to_utc(row.get("timestamp")),
            channels: Channels {
                temperature: row.get("temperature"),
                humidity: row.get("humidity"),
                co2: row.get("co2"),
                voc: row.get("voc"),
                pm25: row.get("pm25"),
                pm10: row.get("pm10"),
            },
            suspect,
        })
    }

    fn alert_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Alert> {
        let id_str: String = row.get("id");
        let type_str: String = row.get("alert_type");
        let severity_str: String = row.get("severity");
        let reading_json: String = row.get("reading_json");
        let reading: ReadingSnapshot = serde_json::from_str(&reading_json)
            .map_err(|_| corrupt("alert reading snapshot", &id_str))?;
        let resolved_at: Option<NaiveDateTime> = row.get("resolved_at");
        let occurrence_count: i64 = row.get("occurrence_count");
        Ok(Alert {
            id: Uuid::parse_str(&id_str).map_err(|_| corrupt("alert id", &id_str))?,
            alert_type: AlertType::parse(&type_str)
                .ok_or_else(|| corrupt("alert type", &type_str))?,
            severity: Severity::parse(&severity_str)
                .ok_or_else(|| corrupt("alert severity", &severity_str))?,
            message: row.get("message"),
            sensor_id: row.get("sensor_id"),
            triggered_at: to_utc(row.get("triggered_at")),
            last_seen: to_utc(row.get("last_seen")),
            occurrence_count: occurrence_count as u32,
            reading,
            resolved: row.get::<i64, _>("resolved") != 0,
            resolved_at: resolved_at.map(to_utc),
        })
    }

    fn subscription_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<PushSubscription> {
        let id_str: String = row.get("id");
        let user_id: Option<String> = row.get("user_id");
        let user_id = match user_id {
            Some(s) => Some(Uuid::parse_str(&s).map_err(|_| corrupt("subscription user", &s))?),
            None => None,
        };
        let last_used_at: Option<NaiveDateTime> = row.get("last_used_at");
        Ok(PushSubscription {
            id: Uuid::parse_str(&id_str).map_err(|_| corrupt("subscription id", &id_str))?,
            endpoint: row.get("endpoint"),
            p256dh: row.get("p256dh"),
            auth: row.get("auth"),
            user_id,
            user_agent: row.get("user_agent"),
            platform: row.get("platform"),
            active: row.get::<i64, _>("active") != 0,
            success_count: row.get::<i64, _>("success_count") as u32,
            failure_count: row.get::<i64, _>("failure_count") as u32,
            consecutive_failures: row.get::<i64, _>("consecutive_failures") as u32,
            created_at: to_utc(row.get("created_at")),
            last_used_at: last_used_at.map(to_utc),
        })
    }

    fn user_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
        let id_str: String = row.get("id");
        Ok(User {
            id: Uuid::parse_str(&id_str).map_err(|_| corrupt("user id", &id_str))?,
            username: row.get("username"),
            email: row.get("email"),
            phone: row.get("phone"),
            notify_email: row.get::<i64, _>("notify_email") != 0,
            notify_sms: row.get::<i64, _>("notify_sms") != 0,
        })
    }
}

fn suspect_csv(reading: &Reading) -> String {
    reading
        .suspect
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait::async_trait]
impl Repository for SqliteStore {
    #[instrument(skip(self, reading), fields(sensor_id = %reading.sensor_id))]
    async fn save_reading(&self, reading: &Reading) -> Result<()> {
        let fingerprint = channel_fingerprint(reading);
        let result = sqlx::query(
            r#"
            INSERT INTO readings (
                id, sensor_id, timestamp, temperature, humidity, co2, voc,
                pm25, pm10, suspect, fingerprint
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (sensor_id, timestamp, fingerprint) DO NOTHING
            "#,
        )
        .bind(reading.id.to_string())
        .bind(&reading.sensor_id)
        .bind(reading.timestamp.naive_utc())
        .bind(reading.channels.temperature)
        .bind(reading.channels.humidity)
        .bind(reading.channels.co2)
        .bind(reading.channels.voc)
        .bind(reading.channels.pm25)
        .bind(reading.channels.pm10)
        .bind(suspect_csv(reading))
        .bind(&fingerprint)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        if result.rows_affected() == 0 {
            let dup: String = sqlx::query_scalar(
                "SELECT id FROM readings WHERE sensor_id = ? AND timestamp = ? AND fingerprint = ?",
            )
            .bind(&reading.sensor_id)
            .bind(reading.timestamp.naive_utc())
            .bind(&fingerprint)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
            return Err(Error::Conflict(dup));
        }
        Ok(())
    }

    async fn list_readings(
        &self,
        sensor_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Reading>> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_READING_LIMIT);

        let mut qb = QueryBuilder::new("SELECT * FROM readings WHERE sensor_id = ");
        qb.push_bind(sensor_id);
        if let Some(from) = from {
            qb.push(" AND timestamp >= ");
            qb.push_bind(from.naive_utc());
        }
        if let Some(to) = to {
            qb.push(" AND timestamp <= ");
            qb.push_bind(to.naive_utc());
        }
        qb.push(" ORDER BY timestamp ASC LIMIT ");
        qb.push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(store_err)?;
        rows.iter().map(Self::reading_from_row).collect()
    }

    async fn upsert_sensor(&self, sensor: &Sensor) -> Result<()> {
        let loc = sensor.location.as_ref();
        sqlx::query(
            r#"
            INSERT INTO sensors (
                id, device_id, model, description, status, last_update,
                latitude, longitude, altitude, city, country, tenant_ref
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (device_id) DO UPDATE SET
                model = excluded.model,
                description = excluded.description,
                status = excluded.status,
                last_update = excluded.last_update,
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                altitude = excluded.altitude,
                city = excluded.city,
                country = excluded.country,
                tenant_ref = excluded.tenant_ref
            "#,
        )
        .bind(sensor.id.to_string())
        .bind(&sensor.device_id)
        .bind(&sensor.model)
        .bind(&sensor.description)
        .bind(sensor.status.as_str())
        .bind(sensor.last_update.naive_utc())
        .bind(loc.map(|l| l.latitude))
        .bind(loc.map(|l| l.longitude))
        .bind(loc.and_then(|l| l.altitude))
        .bind(loc.and_then(|l| l.city.clone()))
        .bind(loc.and_then(|l| l.country.clone()))
        .bind(&sensor.tenant_ref)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn find_sensor_by_device_id(&self, device_id: &str) -> Result<Option<Sensor>> {
        let row = sqlx::query("SELECT * FROM sensors WHERE device_id = ?")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(Self::sensor_from_row).transpose()
    }

    async fn list_sensors(&self, status: Option<SensorStatus>) -> Result<Vec<Sensor>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM sensors WHERE status = ? ORDER BY device_id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM sensors ORDER BY device_id")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(store_err)?;
        rows.iter().map(Self::sensor_from_row).collect()
    }

    async fn touch_sensor(&self, device_id: &str, seen_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE sensors SET last_update = ?, status = 'ACTIVE' WHERE device_id = ?",
        )
        .bind(seen_at.naive_utc())
        .bind(device_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("sensor {device_id}")));
        }
        Ok(())
    }

    async fn mark_sensors_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT device_id FROM sensors WHERE status = 'ACTIVE' AND last_update < ?",
        )
        .bind(cutoff.naive_utc())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        if !stale.is_empty() {
            sqlx::query(
                "UPDATE sensors SET status = 'OFFLINE' WHERE status = 'ACTIVE' AND last_update < ?",
            )
            .bind(cutoff.naive_utc())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        }
        Ok(stale)
    }

    async fn delete_sensor(&self, device_id: &str) -> Result<()> {
        let referenced: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM readings WHERE sensor_id = ?")
                .bind(device_id)
                .fetch_one(&self.pool)
                .await
                .map_err(store_err)?;
        if referenced > 0 {
            return Err(Error::Conflict(format!(
                "sensor {device_id} still referenced by {referenced} readings"
            )));
        }
        let result = sqlx::query("DELETE FROM sensors WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("sensor {device_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, alert), fields(sensor_id = %alert.sensor_id, alert_type = alert.alert_type.as_str()))]
    async fn save_alert(&self, alert: &Alert) -> Result<()> {
        let reading_json = serde_json::to_string(&alert.reading)
            .map_err(|e| Error::Fatal(format!("alert snapshot serialization: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, alert_type, severity, message, sensor_id, triggered_at,
                last_seen, occurrence_count, reading_json, resolved, resolved_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.id.to_string())
        .bind(alert.alert_type.as_str())
        .bind(alert.severity.as_str())
        .bind(&alert.message)
        .bind(&alert.sensor_id)
        .bind(alert.triggered_at.naive_utc())
        .bind(alert.last_seen.naive_utc())
        .bind(alert.occurrence_count as i64)
        .bind(reading_json)
        .bind(alert.resolved as i64)
        .bind(alert.resolved_at.map(|t| t.naive_utc()))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn find_active_alert(
        &self,
        sensor_id: &str,
        alert_type: AlertType,
    ) -> Result<Option<Alert>> {
        let row = sqlx::query(
            "SELECT * FROM alerts WHERE sensor_id = ? AND alert_type = ? AND resolved = 0",
        )
        .bind(sensor_id)
        .bind(alert_type.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(Self::alert_from_row).transpose()
    }

    async fn update_alert_occurrence(
        &self,
        id: Uuid,
        last_seen: DateTime<Utc>,
        severity: Option<Severity>,
    ) -> Result<()> {
        let result = match severity {
            Some(severity) => {
                sqlx::query(
                    r#"
                    UPDATE alerts
                    SET occurrence_count = occurrence_count + 1,
                        last_seen = ?, severity = ?
                    WHERE id = ? AND resolved = 0
                    "#,
                )
                .bind(last_seen.naive_utc())
                .bind(severity.as_str())
                .bind(id.to_string())
                .execute(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE alerts
                    SET occurrence_count = occurrence_count + 1, last_seen = ?
                    WHERE id = ? AND resolved = 0
                    "#,
                )
                .bind(last_seen.naive_utc())
                .bind(id.to_string())
                .execute(&self.pool)
                .await
            }
        }
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("active alert {id}")));
        }
        Ok(())
    }

    async fn list_alerts(&self, filter: &AlertFilter) -> Result<Vec<Alert>> {
        let mut qb = QueryBuilder::new("SELECT * FROM alerts WHERE 1 = 1");
        if let Some(severity) = filter.severity {
            qb.push(" AND severity = ");
            qb.push_bind(severity.as_str());
        }
        if let Some(sensor_id) = &filter.sensor_id {
            qb.push(" AND sensor_id = ");
            qb.push_bind(sensor_id.clone());
        }
        if let Some(resolved) = filter.resolved {
            qb.push(" AND resolved = ");
            qb.push_bind(resolved as i64);
        }
        qb.push(" ORDER BY triggered_at DESC LIMIT ");
        qb.push_bind(filter.limit.unwrap_or(DEFAULT_LIST_LIMIT) as i64);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(store_err)?;
        rows.iter().map(Self::alert_from_row).collect()
    }

    async fn resolve_alert(&self, id: Uuid) -> Result<Alert> {
        sqlx::query("UPDATE alerts SET resolved = 1, resolved_at = ? WHERE id = ? AND resolved = 0")
            .bind(Utc::now().naive_utc())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        // Idempotent: resolving an already-resolved alert returns it as-is.
        let row = sqlx::query("SELECT * FROM alerts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match row {
            Some(row) => Self::alert_from_row(&row),
            None => Err(Error::NotFound(format!("alert {id}"))),
        }
    }

    async fn last_resolved_alert(
        &self,
        sensor_id: &str,
        alert_type: AlertType,
        since: DateTime<Utc>,
    ) -> Result<Option<(Severity, DateTime<Utc>)>> {
        let row = sqlx::query(
            r#"
            SELECT severity, resolved_at FROM alerts
            WHERE sensor_id = ? AND alert_type = ? AND resolved = 1 AND resolved_at >= ?
            ORDER BY resolved_at DESC
            LIMIT 1
            "#,
        )
        .bind(sensor_id)
        .bind(alert_type.as_str())
        .bind(since.naive_utc())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        match row {
            Some(row) => {
                let severity_str: String = row.get("severity");
                let severity = Severity::parse(&severity_str)
                    .ok_or_else(|| corrupt("alert severity", &severity_str))?;
                let resolved_at: NaiveDateTime = row.get("resolved_at");
                Ok(Some((severity, to_utc(resolved_at))))
            }
            None => Ok(None),
        }
    }

    async fn list_unresolved_alerts(&self) -> Result<Vec<Alert>> {
        let rows = sqlx::query("SELECT * FROM alerts WHERE resolved = 0 ORDER BY triggered_at")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(Self::alert_from_row).collect()
    }

    async fn save_push_subscription(&self, sub: &PushSubscription) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO push_subscriptions (
                id, endpoint, p256dh, auth, user_id, user_agent, platform,
                active, success_count, failure_count, consecutive_failures,
                created_at, last_used_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (endpoint) DO UPDATE SET
                p256dh = excluded.p256dh,
                auth = excluded.auth,
                user_id = excluded.user_id,
                user_agent = excluded.user_agent,
                platform = excluded.platform,
                active = 1,
                consecutive_failures = 0
            "#,
        )
        .bind(sub.id.to_string())
        .bind(&sub.endpoint)
        .bind(&sub.p256dh)
        .bind(&sub.auth)
        .bind(sub.user_id.map(|u| u.to_string()))
        .bind(&sub.user_agent)
        .bind(&sub.platform)
        .bind(sub.active as i64)
        .bind(sub.success_count as i64)
        .bind(sub.failure_count as i64)
        .bind(sub.consecutive_failures as i64)
        .bind(sub.created_at.naive_utc())
        .bind(sub.last_used_at.map(|t| t.naive_utc()))
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn remove_push_subscription(&self, endpoint: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = ?")
            .bind(endpoint)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("push subscription {endpoint}")));
        }
        Ok(())
    }

    async fn list_active_push_subscriptions(&self) -> Result<Vec<PushSubscription>> {
        let rows = sqlx::query("SELECT * FROM push_subscriptions WHERE active = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(Self::subscription_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn record_push_attempt(
        &self,
        endpoint: &str,
        outcome: PushOutcome,
    ) -> Result<PushSubscription> {
        let tag = match outcome {
            PushOutcome::Delivered => "delivered",
            PushOutcome::Failed => "failed",
            PushOutcome::Gone => "gone",
        };
        let result = sqlx::query(
            r#"
            UPDATE push_subscriptions SET
                success_count = success_count
                    + CASE WHEN ?1 = 'delivered' THEN 1 ELSE 0 END,
                failure_count = failure_count
                    + CASE WHEN ?1 = 'delivered' THEN 0 ELSE 1 END,
                consecutive_failures = CASE
                    WHEN ?1 = 'delivered' THEN 0
                    ELSE consecutive_failures + 1
                END,
                active = CASE
                    WHEN ?1 = 'gone' THEN 0
                    WHEN ?1 = 'failed' AND consecutive_failures + 1 >= 5 THEN 0
                    ELSE active
                END,
                last_used_at = ?2
            WHERE endpoint = ?3
            "#,
        )
        .bind(tag)
        .bind(Utc::now().naive_utc())
        .bind(endpoint)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("push subscription {endpoint}")));
        }

        let row = sqlx::query("SELECT * FROM push_subscriptions WHERE endpoint = ?")
            .bind(endpoint)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Self::subscription_from_row(&row)
    }

    async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, phone, notify_email, notify_sms)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                username = excluded.username,
                email = excluded.email,
                phone = excluded.phone,
                notify_email = excluded.notify_email,
                notify_sms = excluded.notify_sms
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.notify_email as i64)
        .bind(user.notify_sms as i64)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(Self::user_from_row).transpose()
    }

    async fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(Self::user_from_row).transpose()
    }

    async fn list_notification_recipients(&self) -> Result<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users WHERE notify_email = 1 OR notify_sms = 1")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(Self::user_from_row).collect()
    }

    async fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM sensors GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        for row in rows {
            let status_str: String = row.get("status");
            if let Some(status) = SensorStatus::parse(&status_str) {
                stats
                    .sensors_by_status
                    .insert(status, row.get::<i64, _>("n") as u64);
            }
        }

        let rows = sqlx::query(
            "SELECT severity, COUNT(*) AS n FROM alerts WHERE resolved = 0 GROUP BY severity",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        for row in rows {
            let severity_str: String = row.get("severity");
            if let Some(severity) = Severity::parse(&severity_str) {
                stats
                    .active_alerts_by_severity
                    .insert(severity, row.get::<i64, _>("n") as u64);
            }
        }

        Ok(stats)
    }
}
