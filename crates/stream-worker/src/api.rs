//! Worker HTTP API.
//!
//! The orchestration layer drives cameras through these endpoints; they
//! are synchronous in the sense that a successful /process response means
//! the gateway path is live and playable.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::distributor::FrameDistributor;
use crate::error::StreamError;
use crate::gateway::PathCoordinator;
use crate::metrics;
use crate::supervisor::StreamSupervisor;

/// How long /process waits for the gateway to see actual media.
const ACTIVE_STREAM_TIMEOUT: Duration = Duration::from_secs(60);
/// A session counts as stale when detection runs but no frame arrived for
/// this long.
const STALE_AFTER_SECS: i64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: StreamSupervisor,
    pub gateway: Arc<dyn PathCoordinator>,
    pub distributor: Arc<FrameDistributor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/process", post(start_stream))
        .route("/stop", post(stop_stream))
        .route("/face-detection/toggle", post(toggle_face_detection))
        .route("/streams", get(list_streams))
        .route("/health", get(health))
        .route("/health/streams", get(stream_health))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest {
    camera_id: String,
    rtsp_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest {
    camera_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToggleRequest {
    camera_id: String,
    enabled: bool,
}

fn error_response(e: &StreamError) -> (StatusCode, Json<Value>) {
    let status = match e {
        StreamError::AtCapacity { .. } => StatusCode::TOO_MANY_REQUESTS,
        StreamError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StreamError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
        StreamError::TransientExternal { .. } => StatusCode::BAD_GATEWAY,
        StreamError::Launch { .. } | StreamError::Protocol { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(json!({ "error": e.to_string(), "retryable": e.is_retryable() })),
    )
}

async fn start_stream(
    State(state): State<AppState>,
    Json(req): Json<ProcessRequest>,
) -> (StatusCode, Json<Value>) {
    info!(camera_id = %req.camera_id, "stream start requested");

    let stream = match state.supervisor.start(&req.camera_id, &req.rtsp_url).await {
        Ok(s) => s,
        Err(e) => {
            warn!(camera_id = %req.camera_id, error = %e, "stream start failed");
            return error_response(&e);
        }
    };

    // Only report success once the gateway sees media on the path.
    if let Err(e) = state
        .gateway
        .wait_active_stream(&stream.path_name, ACTIVE_STREAM_TIMEOUT)
        .await
    {
        warn!(camera_id = %req.camera_id, error = %e, "stream never became active, rolling back");
        if let Err(stop_err) = state.supervisor.stop(&req.camera_id).await {
            warn!(camera_id = %req.camera_id, error = %stop_err, "rollback stop failed");
        }
        return error_response(&e);
    }

    (
        StatusCode::OK,
        Json(json!({
            "pathName": stream.path_name,
            "status": "ready",
            "webrtcUrl": stream.webrtc_url,
        })),
    )
}

async fn stop_stream(
    State(state): State<AppState>,
    Json(req): Json<StopRequest>,
) -> (StatusCode, Json<Value>) {
    match state.supervisor.stop(&req.camera_id).await {
        Ok(stopped) => (
            StatusCode::OK,
            Json(json!({ "cameraId": req.camera_id, "stopped": stopped })),
        ),
        Err(e) => error_response(&e),
    }
}

async fn toggle_face_detection(
    State(state): State<AppState>,
    Json(req): Json<ToggleRequest>,
) -> (StatusCode, Json<Value>) {
    match state
        .supervisor
        .toggle_face_detection(&req.camera_id, req.enabled)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "cameraId": req.camera_id, "faceDetectionEnabled": req.enabled })),
        ),
        Err(StreamError::Launch { camera_id, .. }) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no active stream for camera {camera_id}") })),
        ),
        Err(e) => error_response(&e),
    }
}

async fn list_streams(State(state): State<AppState>) -> Json<Value> {
    let streams = state.supervisor.active_streams();
    Json(json!({ "count": streams.len(), "streams": streams }))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "activeStreams": state.supervisor.active_count(),
        "rtspSources": state.distributor.active_sources(),
    }))
}

async fn stream_health(State(state): State<AppState>) -> Json<Value> {
    let now = Utc::now().timestamp();
    let streams: Vec<Value> = state
        .supervisor
        .active_streams()
        .into_iter()
        .map(|s| {
            // Only sessions that have produced frames can go stale;
            // streams without detection never report frame activity.
            let stale = match s.last_frame_unix {
                Some(ts) => now - ts as i64 > STALE_AFTER_SECS,
                None => false,
            };
            json!({
                "cameraId": s.camera_id,
                "pathName": s.path_name,
                "state": s.state,
                "framesProcessed": s.frames_processed,
                "restarts": s.restarts,
                "stale": stale,
                "uptimeSecs": (now - s.started_at.timestamp()).max(0),
            })
        })
        .collect();
    Json(json!({ "streams": streams }))
}

async fn render_metrics() -> (StatusCode, String) {
    (StatusCode::OK, metrics::render())
}
