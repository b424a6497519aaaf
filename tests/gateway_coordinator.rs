//! Path coordinator against an in-process fake of the gateway admin API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use stream_worker::error::StreamError;
use stream_worker::gateway::{HttpPathCoordinator, PathCoordinator};

#[derive(Default, Clone)]
struct PathRecord {
    ready: bool,
    source: Option<Value>,
    bytes_sent: u64,
}

#[derive(Default)]
struct GatewayState {
    paths: Mutex<HashMap<String, PathRecord>>,
    /// Names whose DELETE fails this many more times before succeeding.
    sticky_deletes: Mutex<HashMap<String, u32>>,
    /// Names whose POST always fails with this 400 message.
    reject_adds: Mutex<HashMap<String, String>>,
    add_attempts: Mutex<HashMap<String, u32>>,
}

impl GatewayState {
    fn insert(&self, name: &str, record: PathRecord) {
        self.paths.lock().unwrap().insert(name.to_string(), record);
    }

    fn add_attempts(&self, name: &str) -> u32 {
        self.add_attempts.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    fn update<F: FnOnce(&mut PathRecord)>(&self, name: &str, f: F) {
        if let Some(r) = self.paths.lock().unwrap().get_mut(name) {
            f(r);
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.paths.lock().unwrap().contains_key(name)
    }
}

async fn add_path(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> (StatusCode, String) {
    *state
        .add_attempts
        .lock()
        .unwrap()
        .entry(name.clone())
        .or_insert(0) += 1;
    if let Some(message) = state.reject_adds.lock().unwrap().get(&name) {
        return (StatusCode::BAD_REQUEST, message.clone());
    }
    let mut paths = state.paths.lock().unwrap();
    if paths.contains_key(&name) {
        return (
            StatusCode::BAD_REQUEST,
            "path already exists".to_string(),
        );
    }
    paths.insert(name, PathRecord::default());
    (StatusCode::OK, String::new())
}

async fn get_path(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> (StatusCode, Json<Value>) {
    match state.paths.lock().unwrap().get(&name) {
        Some(r) => (
            StatusCode::OK,
            Json(json!({
                "name": name,
                "ready": r.ready,
                "source": r.source,
                "bytesSent": r.bytes_sent,
            })),
        ),
        None => (StatusCode::NOT_FOUND, Json(json!({"error": "not found"}))),
    }
}

async fn delete_path(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> StatusCode {
    let mut sticky = state.sticky_deletes.lock().unwrap();
    if let Some(left) = sticky.get_mut(&name) {
        if *left > 0 {
            *left -= 1;
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    }
    drop(sticky);
    match state.paths.lock().unwrap().remove(&name) {
        Some(_) => StatusCode::OK,
        None => StatusCode::NOT_FOUND,
    }
}

async fn list_paths() -> Json<Value> {
    Json(json!({ "items": [] }))
}

async fn spawn_gateway() -> (Arc<GatewayState>, SocketAddr) {
    let state = Arc::new(GatewayState::default());
    let app = Router::new()
        .route("/v3/config/paths/add/:name", post(add_path))
        .route("/v3/paths/get/:name", get(get_path))
        .route("/v3/config/paths/delete/:name", delete(delete_path))
        .route("/v3/paths/list", get(list_paths))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (state, addr)
}

fn coordinator(addr: SocketAddr) -> HttpPathCoordinator {
    let base = reqwest::Url::parse(&format!("http://{addr}/")).unwrap();
    HttpPathCoordinator::new(base, None).unwrap()
}

#[tokio::test]
async fn configure_creates_a_fresh_path() {
    let (state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);

    gw.configure_path("camera_1", "publisher").await.unwrap();
    assert!(state.contains("camera_1"));
}

#[tokio::test]
async fn cleanup_of_missing_path_succeeds() {
    let (_state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);

    gw.cleanup_path("camera_ghost").await.unwrap();
}

#[tokio::test]
async fn configure_recovers_from_stuck_stale_path() {
    let (state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);

    // Pre-existing path whose first two DELETE calls fail, so the initial
    // stale cleanup misses and creation collides.
    state.insert("camera_2", PathRecord::default());
    state
        .sticky_deletes
        .lock()
        .unwrap()
        .insert("camera_2".to_string(), 2);

    gw.configure_path("camera_2", "publisher").await.unwrap();
    assert!(state.contains("camera_2"));
}

#[tokio::test]
async fn wait_ready_observes_late_readiness() {
    let (state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);
    state.insert("camera_3", PathRecord::default());

    let state2 = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        state2.update("camera_3", |r| {
            r.ready = true;
            r.source = Some(json!({"type": "rtspSession"}));
        });
    });

    gw.wait_ready("camera_3", Duration::from_secs(8)).await.unwrap();
}

#[tokio::test]
async fn wait_ready_times_out_without_source() {
    let (state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);
    // Ready flag alone is not enough; a source must be attached.
    state.insert(
        "camera_4",
        PathRecord {
            ready: true,
            source: None,
            bytes_sent: 0,
        },
    );

    let err = gw
        .wait_ready("camera_4", Duration::from_secs(3))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::Timeout { .. }), "got {err}");
}

#[tokio::test]
async fn wait_active_stream_accepts_bytes_without_source() {
    let (state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);
    state.insert(
        "camera_5",
        PathRecord {
            ready: true,
            source: None,
            bytes_sent: 4096,
        },
    );

    gw.wait_active_stream("camera_5", Duration::from_secs(5))
        .await
        .unwrap();
}

#[tokio::test]
async fn terminal_create_rejection_is_not_retried() {
    let (state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);
    state
        .reject_adds
        .lock()
        .unwrap()
        .insert("camera_bad".to_string(), "invalid source".to_string());

    let started = std::time::Instant::now();
    let err = gw.configure_path("camera_bad", "publisher").await.unwrap_err();
    assert!(matches!(err, StreamError::TransientExternal { .. }), "got {err}");
    assert_eq!(
        state.add_attempts("camera_bad"),
        1,
        "a 4xx rejection must not re-enter the retry loop"
    );
    // No retry backoff was served (first retry delay alone is 2s).
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "took {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn cleanup_returns_promptly_after_final_attempt() {
    let (state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);
    state.insert("camera_stuck", PathRecord::default());
    state
        .sticky_deletes
        .lock()
        .unwrap()
        .insert("camera_stuck".to_string(), 100);

    let started = std::time::Instant::now();
    let err = gw.cleanup_path("camera_stuck").await.unwrap_err();
    assert!(matches!(err, StreamError::TransientExternal { .. }), "got {err}");
    // Three attempts with 1s and 2s between them, no sleep after the last.
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(4500),
        "elapsed {elapsed:?}"
    );
}

#[tokio::test]
async fn api_readiness_probe_succeeds() {
    let (_state, addr) = spawn_gateway().await;
    let gw = coordinator(addr);
    gw.wait_api_ready(Duration::from_secs(5)).await.unwrap();
}
