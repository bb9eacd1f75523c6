use crate::geo::{format_distance, within_range, Position, DEFAULT_NEARBY_RADIUS_M};
use crate::ingest::{FeedHealth, Monitor};
use crate::model::{device_label, AlertFlag, BatteryLevel, DeviceStatus};
use crate::poller::{PollOutcome, Poller};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone)]
struct AppState {
    poller: Poller,
}

#[derive(Debug, Deserialize)]
pub struct DevicesQuery {
    lat: Option<f64>,
    lon: Option<f64>,
    max_distance: Option<f64>,
}

/// One device as shown on the map and in the device cards.
#[derive(Debug, Serialize)]
pub struct DeviceView {
    pub id: String,
    pub label: String,
    pub status: DeviceStatus,
    pub position: Option<Position>,
    pub position_is_default: bool,
    pub altitude: Option<f64>,
    pub temperature: Option<f64>,
    pub pressure: Option<f64>,
    pub battery: Option<u8>,
    pub battery_level: Option<BatteryLevel>,
    pub rssi: Option<i64>,
    pub alert: AlertFlag,
    pub last_seen: Option<DateTime<Utc>>,
    pub distance_m: Option<f64>,
    pub distance_label: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DevicesResponse {
    pub data: Vec<DeviceView>,
    pub total: usize,
    pub online: usize,
    pub emergency: usize,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub data: Vec<String>,
    pub total: usize,
}

pub fn create_router(poller: Poller) -> Router {
    let state = AppState { poller };

    Router::new()
        .route("/api/v1/devices", get(get_devices))
        .route("/api/v1/alerts", get(get_alerts))
        .route("/api/v1/health", get(get_health))
        .route("/api/v1/refresh", post(refresh))
        .with_state(state)
}

/// Builds device views ordered by status priority, then id.
///
/// With an origin, devices without a position or outside `max_distance`
/// are left out.
pub fn device_views(
    monitor: &Monitor,
    origin: Option<Position>,
    max_distance: f64,
    now: DateTime<Utc>,
) -> Vec<DeviceView> {
    let state = monitor.state();
    let mut views: Vec<DeviceView> = state
        .allowed()
        .iter()
        .filter_map(|id| {
            let snapshot = state.get(id);
            let position = state.display_position(id);
            let distance_m = match (origin, position) {
                (Some(origin), Some(position)) => {
                    if !within_range(&origin, &position, max_distance) {
                        return None;
                    }
                    Some(origin.distance_to(&position))
                }
                (Some(_), None) => return None,
                _ => None,
            };

            let battery = snapshot.and_then(|s| s.battery);
            Some(DeviceView {
                id: id.clone(),
                label: device_label(id),
                status: state.status(id, now),
                position,
                position_is_default: snapshot.and_then(|s| s.position).is_none() && position.is_some(),
                altitude: snapshot.and_then(|s| s.altitude),
                temperature: snapshot.and_then(|s| s.temperature),
                pressure: snapshot.and_then(|s| s.pressure),
                battery,
                battery_level: battery.map(BatteryLevel::from_percent),
                rssi: snapshot.and_then(|s| s.rssi),
                alert: snapshot.map(|s| s.alert).unwrap_or_default(),
                last_seen: snapshot.map(|s| s.last_seen),
                distance_m,
                distance_label: distance_m.map(format_distance),
            })
        })
        .collect();

    views.sort_by(|a, b| {
        a.status
            .priority()
            .cmp(&b.status.priority())
            .then_with(|| a.id.cmp(&b.id))
    });
    views
}

async fn get_devices(
    State(state): State<AppState>,
    Query(params): Query<DevicesQuery>,
) -> Result<Json<DevicesResponse>, AppError> {
    let origin = match (params.lat, params.lon) {
        (Some(lat), Some(lon)) => Some(Position::new(lat, lon)),
        (None, None) => None,
        _ => {
            return Err(AppError::bad_request("lat and lon must be given together"));
        }
    };
    let max_distance = params.max_distance.unwrap_or(DEFAULT_NEARBY_RADIUS_M);

    let monitor = state.poller.monitor().read().await;
    let data = device_views(&monitor, origin, max_distance, Utc::now());

    Ok(Json(DevicesResponse {
        total: data.len(),
        online: data.iter().filter(|d| d.status == DeviceStatus::Online).count(),
        emergency: data.iter().filter(|d| d.status == DeviceStatus::Emergency).count(),
        data,
    }))
}

async fn get_alerts(State(state): State<AppState>) -> Json<AlertsResponse> {
    let data = state.poller.monitor().read().await.alert_log().load();
    Json(AlertsResponse {
        total: data.len(),
        data,
    })
}

async fn get_health(State(state): State<AppState>) -> Json<FeedHealth> {
    Json(state.poller.monitor().read().await.health().clone())
}

async fn refresh(State(state): State<AppState>) -> Response {
    match state.poller.refresh().await {
        PollOutcome::Skipped => (StatusCode::CONFLICT, Json(PollOutcome::Skipped)).into_response(),
        outcome => (StatusCode::OK, Json(outcome)).into_response(),
    }
}

struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: anyhow::anyhow!(message.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        debug!("API error: {}", self.error);
        (self.status, format!("{}", self.error)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertLog;
    use crate::config::EdgeScope;
    use crate::state::{DeviceState, StatusThresholds};
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    fn monitor() -> Monitor {
        let allowed = ["p1", "p2", "p3", "p4"].iter().map(|s| s.to_string()).collect();
        let mut defaults = HashMap::new();
        defaults.insert("p4".to_string(), Position::new(27.9881, 86.925));
        let state = DeviceState::new(allowed, defaults, StatusThresholds::default());
        let log = AlertLog::new(Box::new(MemoryStore::default()), Some(10));
        Monitor::new(state, log, EdgeScope::Episode)
    }

    #[test]
    fn test_views_are_sorted_by_status() {
        let mut monitor = monitor();
        let now = Utc::now();
        monitor.ingest_batch_at(
            concat!(
                r#"{"id":"p1","battery":12}"#,
                "\n",
                r#"{"id":"p2","battery":90}"#,
                "\n",
                r#"{"id":"p3","alert":1}"#
            ),
            now,
        );

        let views = device_views(&monitor, None, DEFAULT_NEARBY_RADIUS_M, now);
        let order: Vec<(&str, DeviceStatus)> = views.iter().map(|v| (v.id.as_str(), v.status)).collect();
        assert_eq!(
            order,
            vec![
                ("p3", DeviceStatus::Emergency),
                ("p2", DeviceStatus::Online),
                ("p1", DeviceStatus::LowBattery),
                ("p4", DeviceStatus::Offline),
            ]
        );
        assert_eq!(views[2].battery_level, Some(BatteryLevel::Low));
    }

    #[test]
    fn test_default_position_is_flagged() {
        let monitor = monitor();
        let views = device_views(&monitor, None, DEFAULT_NEARBY_RADIUS_M, Utc::now());
        let p4 = views.iter().find(|v| v.id == "p4").unwrap();
        assert!(p4.position_is_default);
        assert_eq!(p4.label, "P4");
        assert!(p4.last_seen.is_none());
    }

    #[test]
    fn test_nearby_filter_and_distance_label() {
        let mut monitor = monitor();
        let now = Utc::now();
        monitor.ingest_batch_at(
            concat!(
                r#"{"id":"p1","latitude":27.9891,"longitude":86.926}"#,
                "\n",
                r#"{"id":"p2","latitude":28.5,"longitude":86.925}"#
            ),
            now,
        );

        let origin = Position::new(27.9881, 86.925);
        let views = device_views(&monitor, Some(origin), DEFAULT_NEARBY_RADIUS_M, now);
        let ids: Vec<&str> = views.iter().map(|v| v.id.as_str()).collect();

        // p2 is ~57 km away, p3 has no position at all
        assert!(ids.contains(&"p1"));
        assert!(ids.contains(&"p4"));
        assert!(!ids.contains(&"p2"));
        assert!(!ids.contains(&"p3"));

        let p1 = views.iter().find(|v| v.id == "p1").unwrap();
        assert!(p1.distance_label.as_deref().unwrap().ends_with('m'));
        let p4 = views.iter().find(|v| v.id == "p4").unwrap();
        assert_eq!(p4.distance_label.as_deref(), Some("0m"));
    }
}
