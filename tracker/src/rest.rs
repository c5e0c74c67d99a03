use crate::aggregate::{FleetSnapshot, Viewport};
use crate::errors::Error;
use crate::hub::DeltaKind;
use crate::model::{Ack, Device, DeviceCategory, DeviceFields, DeviceView, LocationSample, LocationUpdate};
use crate::tracker::{FleetTracker, UsageReport};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

#[derive(Debug, Clone)]
struct AppState {
    tracker: Arc<FleetTracker>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceQuery {
    owner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterDevice {
    id: Option<String>,
    owner_id: String,
    name: String,
    #[serde(default)]
    category: DeviceCategory,
}

#[derive(Debug, Deserialize)]
pub struct EditDevice {
    name: Option<String>,
    category: Option<DeviceCategory>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SubmitResponse {
    Accepted(Ack),
    Stale {
        device_id: String,
        last_seen: DateTime<Utc>,
    },
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    snapshot: FleetSnapshot,
    viewport: Viewport,
}

#[derive(Debug, Serialize)]
struct SamplesResponse {
    data: Vec<LocationSample>,
    total: usize,
    limit: usize,
}

pub fn create_router(tracker: Arc<FleetTracker>) -> Router {
    let state = AppState { tracker };

    Router::new()
        .route("/api/v1/updates", post(submit_update))
        .route("/api/v1/devices", get(list_devices).post(register_device))
        .route(
            "/api/v1/devices/:device_id",
            get(get_device).patch(edit_device).delete(remove_device),
        )
        .route("/api/v1/devices/:device_id/history", get(device_history))
        .route("/api/v1/owners/:owner_id/snapshot", get(owner_snapshot))
        .route("/api/v1/owners/:owner_id/usage", get(owner_usage))
        .route("/api/v1/owners/:owner_id/activity", get(owner_activity))
        .route("/api/v1/owners/:owner_id/stream", get(owner_stream))
        .with_state(state)
}

async fn submit_update(
    State(state): State<AppState>,
    Json(update): Json<LocationUpdate>,
) -> Result<Response, AppError> {
    match state.tracker.submit_update(update).await {
        Ok(ack) => Ok((StatusCode::ACCEPTED, Json(SubmitResponse::Accepted(ack))).into_response()),
        Err(Error::StaleUpdate {
            device_id,
            last_seen,
            ..
        }) => Ok((
            StatusCode::OK,
            Json(SubmitResponse::Stale {
                device_id,
                last_seen,
            }),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

async fn list_devices(
    State(state): State<AppState>,
    Query(params): Query<DeviceQuery>,
) -> Json<Vec<DeviceView>> {
    Json(state.tracker.list_devices(params.owner_id.as_deref()).await)
}

async fn register_device(
    State(state): State<AppState>,
    Json(body): Json<RegisterDevice>,
) -> Result<Response, AppError> {
    if body.name.trim().is_empty() || body.owner_id.trim().is_empty() {
        return Ok((StatusCode::BAD_REQUEST, "name and owner_id are required").into_response());
    }

    let id = body
        .id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let device = Device::new(id.clone(), body.owner_id, body.name, body.category, Utc::now());
    state.tracker.register(device).await?;

    let view = state.tracker.get(&id).await?;
    Ok((StatusCode::CREATED, Json(view)).into_response())
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceView>, AppError> {
    Ok(Json(state.tracker.get(&device_id).await?))
}

async fn edit_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Json(body): Json<EditDevice>,
) -> Result<Json<DeviceView>, AppError> {
    let fields = DeviceFields {
        name: body.name,
        category: body.category,
        ..DeviceFields::default()
    };
    Ok(Json(state.tracker.update_device(&device_id, fields).await?))
}

async fn remove_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.tracker.remove(&device_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn device_history(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<SamplesResponse>, AppError> {
    let limit = params.limit();
    let data: Vec<LocationSample> = state.tracker.query_history(&device_id, limit).await?.collect();
    Ok(Json(SamplesResponse {
        total: data.len(),
        data,
        limit,
    }))
}

async fn owner_snapshot(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Json<SnapshotResponse> {
    let snapshot = state.tracker.current_snapshot(&owner_id).await;
    let viewport = snapshot.viewport(&state.tracker.config().default_view);
    Json(SnapshotResponse { snapshot, viewport })
}

async fn owner_usage(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Json<UsageReport> {
    Json(state.tracker.usage_report(&owner_id).await)
}

async fn owner_activity(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
    Query(params): Query<LimitQuery>,
) -> Json<SamplesResponse> {
    let limit = params.limit();
    let data: Vec<LocationSample> = state.tracker.recent_activity(&owner_id, limit).await.collect();
    Json(SamplesResponse {
        total: data.len(),
        data,
        limit,
    })
}

/// Server-sent events: one `initial` event, then `change` events. The
/// subscription is released when the client disconnects and the stream is
/// dropped.
async fn owner_stream(
    State(state): State<AppState>,
    Path(owner_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.tracker.subscribe(&owner_id).await;
    info!(owner_id = %owner_id, subscription_id = %subscription.id(), "Opened fleet stream");

    let events = stream::unfold(subscription, |mut subscription| async move {
        let delta = subscription.next().await?;
        let name = match delta.kind {
            DeltaKind::Initial => "initial",
            DeltaKind::Change => "change",
        };
        let event = Event::default()
            .event(name)
            .id(delta.version().to_string())
            .json_data(&delta);
        Some((event, subscription))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

struct AppError(anyhow::Error);

fn status_for(err: &anyhow::Error) -> StatusCode {
    match err.downcast_ref::<Error>() {
        Some(Error::InvalidUpdate(_)) => StatusCode::BAD_REQUEST,
        Some(Error::UnknownDevice(_)) => StatusCode::NOT_FOUND,
        Some(Error::DuplicateDevice(_)) | Some(Error::StaleUpdate { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!("API error: {}", self.0);
            return (status, format!("Internal server error: {}", self.0)).into_response();
        }
        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_to_client_statuses() {
        let invalid = anyhow::Error::from(Error::InvalidUpdate("lat".to_string()));
        assert_eq!(status_for(&invalid), StatusCode::BAD_REQUEST);

        let unknown = anyhow::Error::from(Error::UnknownDevice("a".to_string()));
        assert_eq!(status_for(&unknown), StatusCode::NOT_FOUND);

        let duplicate = anyhow::Error::from(Error::DuplicateDevice("a".to_string()));
        assert_eq!(status_for(&duplicate), StatusCode::CONFLICT);

        let other = anyhow::anyhow!("boom");
        assert_eq!(status_for(&other), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_limit_is_clamped() {
        assert_eq!(LimitQuery { limit: None }.limit(), DEFAULT_LIMIT);
        assert_eq!(LimitQuery { limit: Some(5000) }.limit(), MAX_LIMIT);
    }

    #[test]
    fn test_stale_response_shape() {
        let body = SubmitResponse::Stale {
            device_id: "a".to_string(),
            last_seen: DateTime::<Utc>::from_timestamp(100, 0).unwrap(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["status"], "stale");
        assert_eq!(json["device_id"], "a");
    }
}
