use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use airaware_core::stats::RuntimeStats;
use airaware_core::types::{Alert, BusLinkState, Channels, PushSubscription, Severity};
use airaware_core::Error;
use airaware_store::{AlertFilter, Repository};

/// Shared handler state; cheap to clone per request.
#[derive(Clone)]
pub struct ApiState {
    pub repo: Arc<dyn Repository>,
    pub stats: Arc<RuntimeStats>,
    pub bus_state: watch::Receiver<BusLinkState>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/resolve", post(resolve_alert))
        .route("/push/subscribe", post(push_subscribe))
        .route("/push/unsubscribe", post(push_unsubscribe))
        .route("/stats", get(stats))
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error kinds mapped onto HTTP statuses at the transport boundary.
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::BadPayload(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Permanent(_) | Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertsQuery {
    severity: Option<String>,
    sensor_id: Option<String>,
    resolved: Option<bool>,
    limit: Option<u32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AlertDto {
    id: Uuid,
    #[serde(rename = "type")]
    alert_type: String,
    severity: String,
    message: String,
    sensor_id: String,
    triggered_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    occurrence_count: u32,
    reading: ReadingSnapshotDto,
    resolved: bool,
    resolved_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadingSnapshotDto {
    reading_id: Uuid,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    channels: Channels,
}

impl From<Alert> for AlertDto {
    fn from(a: Alert) -> Self {
        Self {
            id: a.id,
            alert_type: a.alert_type.as_str().to_string(),
            severity: a.severity.as_str().to_string(),
            message: a.message,
            sensor_id: a.sensor_id,
            triggered_at: a.triggered_at,
            last_seen: a.last_seen,
            occurrence_count: a.occurrence_count,
            reading: ReadingSnapshotDto {
                reading_id: a.reading.reading_id,
                timestamp: a.reading.timestamp,
                channels: a.reading.channels,
            },
            resolved: a.resolved,
            resolved_at: a.resolved_at,
        }
    }
}

async fn list_alerts(
    State(state): State<ApiState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<AlertDto>>, ApiError> {
    let severity = match &query.severity {
        Some(s) => Some(
            Severity::parse(s)
                .ok_or_else(|| Error::BadPayload(format!("unknown severity {s}")))?,
        ),
        None => None,
    };
    let filter = AlertFilter {
        severity,
        sensor_id: query.sensor_id,
        resolved: query.resolved,
        limit: query.limit,
    };
    let alerts = state.repo.list_alerts(&filter).await?;
    Ok(Json(alerts.into_iter().map(AlertDto::from).collect()))
}

async fn resolve_alert(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<AlertDto>, ApiError> {
    let alert = state.repo.resolve_alert(id).await?;
    info!(alert_id = %id, "alert resolved by operator");
    Ok(Json(alert.into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeKeys {
    p256dh: String,
    auth: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeBody {
    endpoint: String,
    keys: SubscribeKeys,
    platform: Option<String>,
    user_agent: Option<String>,
    user_id: Option<Uuid>,
}

#[derive(Serialize)]
struct SubscribeResponse {
    id: Uuid,
}

async fn push_subscribe(
    State(state): State<ApiState>,
    Json(body): Json<SubscribeBody>,
) -> Result<Json<SubscribeResponse>, ApiError> {
    if body.endpoint.trim().is_empty() {
        return Err(Error::BadPayload("endpoint must not be empty".into()).into());
    }
    if body.keys.p256dh.trim().is_empty() || body.keys.auth.trim().is_empty() {
        return Err(Error::BadPayload("p256dh and auth keys are required".into()).into());
    }

    let sub = PushSubscription {
        id: Uuid::new_v4(),
        endpoint: body.endpoint,
        p256dh: body.keys.p256dh,
        auth: body.keys.auth,
        user_id: body.user_id,
        user_agent: body.user_agent,
        platform: body.platform,
        active: true,
        success_count: 0,
        failure_count: 0,
        consecutive_failures: 0,
        created_at: Utc::now(),
        last_used_at: None,
    };
    state.repo.save_push_subscription(&sub).await?;
    info!(endpoint = %sub.endpoint, "push subscription registered");
    Ok(Json(SubscribeResponse { id: sub.id }))
}

#[derive(Deserialize)]
struct UnsubscribeBody {
    endpoint: String,
}

async fn push_unsubscribe(
    State(state): State<ApiState>,
    Json(body): Json<UnsubscribeBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.repo.remove_push_subscription(&body.endpoint).await?;
    info!(endpoint = %body.endpoint, "push subscription removed");
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    sensors: HashMap<String, u64>,
    active_alerts: HashMap<String, u64>,
    readings_total: u64,
    readings_per_minute: f64,
    alerts_created: u64,
    notifier: NotifierStats,
    bus: String,
}

#[derive(Serialize)]
struct NotifierStats {
    delivered: u64,
    failed: u64,
}

async fn stats(State(state): State<ApiState>) -> Result<Json<StatsResponse>, ApiError> {
    let store_stats = state.repo.stats().await?;
    let bus = *state.bus_state.borrow();
    Ok(Json(StatsResponse {
        sensors: store_stats
            .sensors_by_status
            .into_iter()
            .map(|(k, v)| (k.as_str().to_string(), v))
            .collect(),
        active_alerts: store_stats
            .active_alerts_by_severity
            .into_iter()
            .map(|(k, v)| (k.as_str().to_string(), v))
            .collect(),
        readings_total: state.stats.readings_total(),
        readings_per_minute: state.stats.readings_per_minute(),
        alerts_created: state.stats.alerts_created(),
        notifier: NotifierStats {
            delivered: state.stats.notify_delivered(),
            failed: state.stats.notify_failed(),
        },
        bus: bus.as_str().to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use airaware_core::types::{AlertType, ReadingSnapshot, Sensor};
    use airaware_store::SqliteStore;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt; // for `oneshot`

    async fn app() -> (Router, Arc<SqliteStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("api.db").display());
        let store = SqliteStore::connect(&url).await.expect("connect");
        store.migrate().await.expect("migrate");
        let repo = Arc::new(store);

        let (_tx, rx) = watch::channel(BusLinkState::Subscribed);
        let state = ApiState {
            repo: repo.clone(),
            stats: Arc::new(RuntimeStats::new()),
            bus_state: rx,
        };
        (router(state), repo, dir)
    }

    fn sample_alert(sensor_id: &str) -> Alert {
        let reading_id = Uuid::new_v4();
        Alert {
            id: Uuid::new_v4(),
            alert_type: AlertType::Pm25High,
            severity: Severity::Warning,
            message: "PM2.5 high".into(),
            sensor_id: sensor_id.into(),
            triggered_at: Utc::now(),
            last_seen: Utc::now(),
            occurrence_count: 1,
            reading: ReadingSnapshot {
                reading_id,
                timestamp: Utc::now(),
                channels: Channels {
                    pm25: Some(40.0),
                    ..Channels::default()
                },
            },
            resolved: false,
            resolved_at: None,
        }
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (app, _repo, _dir) = app().await;
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn list_alerts_filters_by_severity() {
        let (app, repo, _dir) = app().await;
        repo.save_alert(&sample_alert("S1")).await.unwrap();
        let mut critical = sample_alert("S2");
        critical.severity = Severity::Critical;
        repo.save_alert(&critical).await.unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::get("/alerts?severity=CRITICAL")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["sensorId"], "S2");
        assert_eq!(json[0]["type"], "PM25_HIGH");

        // Unknown severity names are a client error.
        let resp = app
            .oneshot(
                Request::get("/alerts?severity=SEVERE")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn resolve_alert_round_trip() {
        let (app, repo, _dir) = app().await;
        let alert = sample_alert("S1");
        repo.save_alert(&alert).await.unwrap();

        let resp = app
            .clone()
            .oneshot(
                Request::post(format!("/alerts/{}/resolve", alert.id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["resolved"], true);
        assert!(json["resolvedAt"].is_string());

        let resp = app
            .oneshot(
                Request::post(format!("/alerts/{}/resolve", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn push_subscription_lifecycle() {
        let (app, _repo, _dir) = app().await;

        let body = serde_json::json!({
            "endpoint": "https://push.example/ep1",
            "keys": { "p256dh": "BKey", "auth": "secret" },
            "platform": "web",
            "userAgent": "test"
        });
        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/push/subscribe")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json["id"].is_string());

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/push/unsubscribe")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({ "endpoint": "https://push.example/ep1" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // Removing it twice is a 404.
        let resp = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/push/unsubscribe")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        serde_json::json!({ "endpoint": "https://push.example/ep1" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn subscribe_rejects_empty_endpoint() {
        let (app, _repo, _dir) = app().await;
        let body = serde_json::json!({
            "endpoint": "",
            "keys": { "p256dh": "BKey", "auth": "secret" }
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/push/subscribe")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stats_reports_counts_and_bus_state() {
        let (app, repo, _dir) = app().await;
        repo.upsert_sensor(&Sensor::unregistered("S1", Utc::now()))
            .await
            .unwrap();
        repo.save_alert(&sample_alert("S1")).await.unwrap();

        let resp = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["sensors"]["ACTIVE"], 1);
        assert_eq!(json["activeAlerts"]["WARNING"], 1);
        assert_eq!(json["bus"], "SUBSCRIBED");
        assert_eq!(json["notifier"]["delivered"], 0);
    }
}
