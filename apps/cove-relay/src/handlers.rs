use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cove_signal::{
    FetchResponse, PublishRequest, PublishResponse, RelayError, RoomExistsResponse, Signal,
    SignalRelay,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, warn};

pub type SharedRelay = Arc<dyn SignalRelay>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("ROOM_EXPIRED")]
    RoomExpired,
    #[error("{0}")]
    Internal(String),
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::RoomGone(_) => ApiError::RoomExpired,
            RelayError::InvalidSignal(detail) => ApiError::BadRequest(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::RoomExpired => StatusCode::GONE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = match &self {
            ApiError::RoomExpired => json!({ "error": "ROOM_EXPIRED" }),
            ApiError::BadRequest(detail) => json!({ "error": "Invalid signal", "detail": detail }),
            ApiError::Internal(_) => json!({ "error": "Failed to store signal" }),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

pub async fn publish_signal(
    State(relay): State<SharedRelay>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> Result<Json<PublishResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    if request.room_code.trim().is_empty() {
        return Err(ApiError::BadRequest("missing roomCode".into()));
    }
    let room = request.room_code;
    let signal =
        Signal::try_from(request.signal).map_err(|err| ApiError::BadRequest(err.to_string()))?;
    let kind = signal.kind();

    match relay.publish(&room, signal).await {
        Ok(timestamp) => {
            debug!(room = %room, kind = %kind, timestamp, "signal published");
            Ok(Json(PublishResponse {
                success: true,
                timestamp,
            }))
        }
        Err(err) => {
            let api: ApiError = err.into();
            match &api {
                ApiError::Internal(detail) => {
                    error!(room = %room, kind = %kind, error = %detail, "failed to store signal")
                }
                other => debug!(room = %room, kind = %kind, reason = %other, "signal rejected"),
            }
            Err(api)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchQuery {
    #[serde(rename = "roomCode")]
    room_code: Option<String>,
    since: Option<u64>,
}

pub async fn fetch_signals(
    State(relay): State<SharedRelay>,
    Query(params): Query<FetchQuery>,
) -> (StatusCode, Json<FetchResponse>) {
    let Some(room) = params.room_code.filter(|room| !room.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(FetchResponse {
                signals: Vec::new(),
                error: Some("Room code required".into()),
            }),
        );
    };
    let since = params.since.unwrap_or(0);

    match relay.fetch_since(&room, since).await {
        Ok(signals) => {
            let signals = signals
                .into_iter()
                .filter_map(|signal| serde_json::to_value(signal).ok())
                .collect();
            (
                StatusCode::OK,
                Json(FetchResponse {
                    signals,
                    error: None,
                }),
            )
        }
        Err(err) => {
            warn!(room = %room, since, error = %err, "failed to read signals");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(FetchResponse {
                    signals: Vec::new(),
                    error: Some("Failed to get signals".into()),
                }),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RoomQuery {
    #[serde(rename = "roomCode")]
    room_code: String,
}

pub async fn room_exists(
    State(relay): State<SharedRelay>,
    Query(params): Query<RoomQuery>,
) -> Result<Json<RoomExistsResponse>, StatusCode> {
    let exists = relay.room_exists(&params.room_code).await.map_err(|err| {
        warn!(room = %params.room_code, error = %err, "room lookup failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(RoomExistsResponse { exists }))
}
