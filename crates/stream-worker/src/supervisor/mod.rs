//! Per-camera stream session lifecycle.
//!
//! One supervisor owns every camera session in the worker. Each session
//! is a transcode subprocess publishing into the gateway, watched by a
//! monitor task that restarts it on abnormal exit under circuit breaker
//! control. All state lives on the supervisor instance; there are no
//! process-wide registries.

pub mod breaker;
pub mod process;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::store::{CameraStatus, CameraStore};

use crate::error::StreamError;
use crate::facedetect::{FacePipeline, FaceTarget};
use crate::gateway::PathCoordinator;
use crate::metrics::{
    STREAMS_RUNNING, TRANSCODE_CRASHES_TOTAL, TRANSCODE_RESTARTS_TOTAL,
};
use breaker::CircuitBreaker;
use process::{ProcessHandle, ProcessSpawner};

#[derive(Debug, Clone)]
pub struct ProbationConfig {
    /// Number of liveness checks after spawn.
    pub checks: u32,
    /// Delay between checks.
    pub interval: Duration,
    /// An exit at or after this many checks is handled by the monitor
    /// instead of failing the launch.
    pub success_after: u32,
}

impl Default for ProbationConfig {
    fn default() -> Self {
        Self {
            checks: 10,
            interval: Duration::from_millis(500),
            success_after: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub probation: ProbationConfig,
    /// How long a stopping subprocess gets to exit before SIGKILL.
    pub graceful_wait: Duration,
    pub restart_backoff_base: Duration,
    pub restart_backoff_cap: Duration,
    pub breaker_max_failures: u32,
    pub breaker_reset_after: Duration,
    pub max_concurrent: usize,
    pub path_prefix: String,
    /// RTSP base the transcoder publishes into.
    pub publish_base: String,
    /// WebRTC base handed to viewers.
    pub webrtc_base: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            probation: ProbationConfig::default(),
            graceful_wait: Duration::from_secs(3),
            restart_backoff_base: Duration::from_secs(2),
            restart_backoff_cap: Duration::from_secs(30),
            breaker_max_failures: 10,
            breaker_reset_after: Duration::from_secs(60),
            max_concurrent: 20,
            path_prefix: "camera_".to_string(),
            publish_base: "rtsp://localhost:8554".to_string(),
            webrtc_base: "http://localhost:8891".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Running,
    Retrying,
    Error,
}

/// Counters shared between a session and its face detection loop.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    frames_processed: AtomicU64,
    last_frame_unix: AtomicU64,
}

impl SessionMetrics {
    pub fn record_frame(&self) {
        self.frames_processed.fetch_add(1, Ordering::Relaxed);
        self.last_frame_unix
            .store(Utc::now().timestamp() as u64, Ordering::Relaxed);
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed.load(Ordering::Relaxed)
    }

    pub fn last_frame_unix(&self) -> Option<u64> {
        match self.last_frame_unix.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub camera_id: String,
    pub path_name: String,
    pub webrtc_url: String,
    pub state: LifecycleState,
    pub frames_processed: u64,
    /// Unix seconds of the most recent analyzed frame, if any.
    pub last_frame_unix: Option<u64>,
    pub restarts: u32,
    pub breaker_failures: u32,
    pub started_at: DateTime<Utc>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub path_name: String,
    pub publish_url: String,
    pub webrtc_url: String,
}

struct Session {
    camera_id: String,
    path_name: String,
    publish_url: String,
    webrtc_url: String,
    source_url: String,
    cancel: CancellationToken,
    state: Arc<StdMutex<LifecycleState>>,
    metrics: Arc<SessionMetrics>,
    restarts: Arc<AtomicU32>,
    pid: Arc<StdMutex<Option<u32>>>,
    started_at: DateTime<Utc>,
    monitor: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn current_state(&self) -> LifecycleState {
        match self.state.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        }
    }

    fn status(&self, breaker_failures: u32) -> StreamStatus {
        let state = self.current_state();
        let pid = match self.pid.lock() {
            Ok(g) => *g,
            Err(p) => *p.into_inner(),
        };
        StreamStatus {
            camera_id: self.camera_id.clone(),
            path_name: self.path_name.clone(),
            webrtc_url: self.webrtc_url.clone(),
            state,
            frames_processed: self.metrics.frames_processed(),
            last_frame_unix: self.metrics.last_frame_unix(),
            restarts: self.restarts.load(Ordering::Relaxed),
            breaker_failures,
            started_at: self.started_at,
            pid,
        }
    }
}

struct Inner {
    config: SupervisorConfig,
    spawner: Arc<dyn ProcessSpawner>,
    gateway: Arc<dyn PathCoordinator>,
    store: Arc<dyn CameraStore>,
    faces: Arc<FacePipeline>,
    sessions: StdMutex<HashMap<String, Arc<Session>>>,
    breakers: StdMutex<HashMap<String, Arc<CircuitBreaker>>>,
    /// Serializes start/stop per camera without blocking other cameras.
    transitions: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Clone)]
pub struct StreamSupervisor {
    inner: Arc<Inner>,
}

impl StreamSupervisor {
    pub fn new(
        config: SupervisorConfig,
        spawner: Arc<dyn ProcessSpawner>,
        gateway: Arc<dyn PathCoordinator>,
        store: Arc<dyn CameraStore>,
        faces: Arc<FacePipeline>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                spawner,
                gateway,
                store,
                faces,
                sessions: StdMutex::new(HashMap::new()),
                breakers: StdMutex::new(HashMap::new()),
                transitions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn path_name(&self, camera_id: &str) -> String {
        format!("{}{}", self.inner.config.path_prefix, camera_id)
    }

    async fn transition_lock(&self, camera_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.transitions.lock().await;
        map.entry(camera_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn breaker(&self, camera_id: &str) -> Arc<CircuitBreaker> {
        let mut map = lock(&self.inner.breakers);
        map.entry(camera_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_limits(
                    camera_id,
                    self.inner.config.breaker_max_failures,
                    self.inner.config.breaker_reset_after,
                ))
            })
            .clone()
    }

    /// Start a stream session for `camera_id`. An existing session for the
    /// same camera is terminated and replaced.
    pub async fn start(
        &self,
        camera_id: &str,
        source_url: &str,
    ) -> Result<StreamInfo, StreamError> {
        let transition = self.transition_lock(camera_id).await;
        let _guard = transition.lock().await;

        // Refuse before touching any existing session, so a session kept
        // in error state stays observable across refused retries.
        let breaker = self.breaker(camera_id);
        if !breaker.can_attempt() {
            return Err(StreamError::CircuitOpen {
                camera_id: camera_id.to_string(),
            });
        }

        if lock(&self.inner.sessions).contains_key(camera_id) {
            info!(camera_id, "stream already running, replacing session");
            self.stop_locked(camera_id).await;
        }

        // Failed sessions kept around for reconciliation do not hold a
        // capacity slot.
        let active = lock(&self.inner.sessions)
            .values()
            .filter(|s| s.current_state() != LifecycleState::Error)
            .count();
        if active >= self.inner.config.max_concurrent {
            return Err(StreamError::AtCapacity {
                limit: self.inner.config.max_concurrent,
            });
        }

        let path_name = self.path_name(camera_id);
        let publish_url = format!("{}/{}", self.inner.config.publish_base, path_name);
        let webrtc_url = format!("{}/{}", self.inner.config.webrtc_base, path_name);

        self.inner
            .gateway
            .configure_path(&path_name, "publisher")
            .await?;

        info!(camera_id, path = %path_name, "starting transcode subprocess");
        let mut handle = match self
            .inner
            .spawner
            .spawn(camera_id, source_url, &publish_url)
            .await
        {
            Ok(h) => h,
            Err(e) => {
                breaker.record_failure();
                let _ = self.inner.gateway.cleanup_path(&path_name).await;
                return Err(StreamError::Launch {
                    camera_id: camera_id.to_string(),
                    reason: format!("spawn failed: {e}"),
                });
            }
        };

        if let Err(reason) = self.probation(&mut handle, camera_id).await {
            breaker.record_failure();
            handle.kill().await;
            let _ = self.inner.gateway.cleanup_path(&path_name).await;
            return Err(StreamError::Launch {
                camera_id: camera_id.to_string(),
                reason,
            });
        }
        breaker.record_success();

        let session = Arc::new(Session {
            camera_id: camera_id.to_string(),
            path_name: path_name.clone(),
            publish_url: publish_url.clone(),
            webrtc_url: webrtc_url.clone(),
            source_url: source_url.to_string(),
            cancel: CancellationToken::new(),
            state: Arc::new(StdMutex::new(LifecycleState::Running)),
            metrics: Arc::new(SessionMetrics::default()),
            restarts: Arc::new(AtomicU32::new(0)),
            pid: Arc::new(StdMutex::new(handle.id())),
            started_at: Utc::now(),
            monitor: StdMutex::new(None),
        });
        lock(&self.inner.sessions).insert(camera_id.to_string(), session.clone());
        STREAMS_RUNNING.inc();

        let monitor = tokio::spawn(monitor_session(
            self.inner.clone(),
            session.clone(),
            breaker,
            handle,
        ));
        *lock(&session.monitor) = Some(monitor);

        if let Err(e) = self
            .inner
            .store
            .update_camera_path_info(camera_id, &path_name, CameraStatus::Processing)
            .await
        {
            warn!(camera_id, error = %e, "camera store path update failed");
        }

        self.maybe_start_face_detection(camera_id, &session).await;

        info!(camera_id, path = %path_name, "stream session started");
        Ok(StreamInfo {
            path_name,
            publish_url,
            webrtc_url,
        })
    }

    /// Watch the freshly spawned subprocess for an immediate exit. The
    /// launch counts as good once `success_after` checks pass; an exit late
    /// in the window is left to the monitor's restart logic.
    async fn probation(&self, handle: &mut ProcessHandle, camera_id: &str) -> Result<(), String> {
        let p = &self.inner.config.probation;
        for check in 0..p.checks {
            tokio::time::sleep(p.interval).await;
            match handle.try_wait() {
                Ok(Some(status)) if check < p.success_after => {
                    return Err(format!("exited during startup with {status}"));
                }
                Ok(Some(status)) => {
                    debug!(camera_id, %status, check, "late startup exit, deferring to monitor");
                    return Ok(());
                }
                Ok(None) => {
                    if check + 1 >= p.success_after {
                        debug!(camera_id, checks = check + 1, "startup probation passed");
                        return Ok(());
                    }
                }
                Err(e) => return Err(format!("liveness check failed: {e}")),
            }
        }
        Ok(())
    }

    async fn maybe_start_face_detection(&self, camera_id: &str, session: &Arc<Session>) {
        let enabled = match self.inner.store.get_camera_info(camera_id).await {
            Ok(info) => info.face_detection_enabled,
            Err(e) => {
                debug!(camera_id, error = %e, "no camera record, face detection stays off");
                false
            }
        };
        if enabled {
            let name = self.inner.store.camera_name(camera_id).await;
            self.inner.faces.start(FaceTarget {
                camera_id: camera_id.to_string(),
                camera_name: name,
                source_url: session.source_url.clone(),
                metrics: session.metrics.clone(),
            });
        }
    }

    /// Stop a stream session. Returns false when no session was running.
    pub async fn stop(&self, camera_id: &str) -> Result<bool, StreamError> {
        let transition = self.transition_lock(camera_id).await;
        let _guard = transition.lock().await;
        Ok(self.stop_locked(camera_id).await)
    }

    /// Teardown body, caller holds the camera's transition lock.
    async fn stop_locked(&self, camera_id: &str) -> bool {
        let Some(session) = lock(&self.inner.sessions).remove(camera_id) else {
            debug!(camera_id, "stop requested but no session is running");
            return false;
        };
        // A failed session already left the running gauge.
        if session.current_state() != LifecycleState::Error {
            STREAMS_RUNNING.dec();
        }

        self.inner.faces.stop(camera_id).await;
        session.cancel.cancel();

        let monitor = lock(&session.monitor).take();
        if let Some(task) = monitor {
            let deadline = self.inner.config.graceful_wait + Duration::from_secs(2);
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!(camera_id, "stream monitor did not finish within deadline");
            }
        }

        if let Err(e) = self.inner.gateway.cleanup_path(&session.path_name).await {
            warn!(camera_id, error = %e, "gateway path cleanup failed on stop");
        }
        if let Err(e) = self
            .inner
            .store
            .update_camera_path_info(camera_id, &session.path_name, CameraStatus::Offline)
            .await
        {
            warn!(camera_id, error = %e, "camera store path update failed on stop");
        }

        info!(camera_id, "stream session stopped");
        true
    }

    /// Enable or disable face detection sampling on a running session.
    pub async fn toggle_face_detection(
        &self,
        camera_id: &str,
        enabled: bool,
    ) -> Result<(), StreamError> {
        let session = lock(&self.inner.sessions).get(camera_id).cloned();
        let Some(session) = session else {
            return Err(StreamError::Launch {
                camera_id: camera_id.to_string(),
                reason: "no active stream session".to_string(),
            });
        };
        if enabled {
            let name = self.inner.store.camera_name(camera_id).await;
            self.inner.faces.start(FaceTarget {
                camera_id: camera_id.to_string(),
                camera_name: name,
                source_url: session.source_url.clone(),
                metrics: session.metrics.clone(),
            });
        } else {
            self.inner.faces.stop(camera_id).await;
        }
        Ok(())
    }

    pub fn status(&self, camera_id: &str) -> Option<StreamStatus> {
        let session = lock(&self.inner.sessions).get(camera_id).cloned()?;
        let failures = self.breaker(camera_id).failure_count();
        Some(session.status(failures))
    }

    pub fn active_streams(&self) -> Vec<StreamStatus> {
        let sessions: Vec<Arc<Session>> =
            lock(&self.inner.sessions).values().cloned().collect();
        sessions
            .iter()
            .map(|s| s.status(self.breaker(&s.camera_id).failure_count()))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Stop every session, used during worker shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = lock(&self.inner.sessions).keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!(camera_id = %id, error = %e, "stop during shutdown failed");
            }
        }
    }
}

/// Watches one subprocess until stop is requested or restarts are
/// exhausted.
async fn monitor_session(
    inner: Arc<Inner>,
    session: Arc<Session>,
    breaker: Arc<CircuitBreaker>,
    mut handle: ProcessHandle,
) {
    let camera_id = session.camera_id.clone();
    loop {
        tokio::select! {
            _ = session.cancel.cancelled() => {
                handle.signal_graceful().await;
                if handle.wait_bounded(inner.config.graceful_wait).await.is_none() {
                    warn!(camera_id, "transcode did not exit gracefully, killing");
                    handle.kill().await;
                }
                return;
            }
            status = handle.wait() => {
                match status {
                    Ok(s) if s.success() => {
                        info!(camera_id, "transcode exited cleanly");
                        breaker.record_success();
                        remove_dead_session(&inner, &session).await;
                        return;
                    }
                    Ok(s) => {
                        warn!(camera_id, status = %s, "transcode crashed");
                        TRANSCODE_CRASHES_TOTAL.inc();
                        breaker.record_failure();
                    }
                    Err(e) => {
                        error!(camera_id, error = %e, "wait on transcode failed");
                        breaker.record_failure();
                    }
                }

                if !breaker.can_attempt() {
                    error!(camera_id, "restart budget exhausted, session enters error state");
                    mark_session_failed(&inner, &session).await;
                    return;
                }

                let attempt = session.restarts.fetch_add(1, Ordering::Relaxed);
                let delay = restart_backoff(
                    attempt,
                    inner.config.restart_backoff_base,
                    inner.config.restart_backoff_cap,
                );
                set_state(&session.state, LifecycleState::Retrying);
                info!(camera_id, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "restarting transcode after backoff");

                tokio::select! {
                    _ = session.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }

                match inner
                    .spawner
                    .spawn(&camera_id, &session.source_url, &session.publish_url)
                    .await
                {
                    Ok(h) => {
                        TRANSCODE_RESTARTS_TOTAL.inc();
                        *lock(&session.pid) = h.id();
                        set_state(&session.state, LifecycleState::Running);
                        handle = h;
                    }
                    Err(e) => {
                        error!(camera_id, error = %e, "transcode respawn failed");
                        breaker.record_failure();
                        mark_session_failed(&inner, &session).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Cleanup for sessions whose subprocess exited cleanly without a stop
/// request.
async fn remove_dead_session(inner: &Arc<Inner>, session: &Arc<Session>) {
    let removed = lock(&inner.sessions).remove(&session.camera_id).is_some();
    if !removed {
        return;
    }
    STREAMS_RUNNING.dec();
    inner.faces.stop(&session.camera_id).await;
    if let Err(e) = inner.gateway.cleanup_path(&session.path_name).await {
        warn!(camera_id = %session.camera_id, error = %e, "gateway cleanup after exit failed");
    }
    if let Err(e) = inner
        .store
        .update_camera_path_info(&session.camera_id, &session.path_name, CameraStatus::Offline)
        .await
    {
        warn!(camera_id = %session.camera_id, error = %e, "camera store update after exit failed");
    }
}

/// A session out of restarts stays registered in error state so the
/// orchestration layer can observe and reconcile it; only an explicit
/// stop or a replacing start removes it.
async fn mark_session_failed(inner: &Arc<Inner>, session: &Arc<Session>) {
    if !lock(&inner.sessions).contains_key(&session.camera_id) {
        return;
    }
    set_state(&session.state, LifecycleState::Error);
    STREAMS_RUNNING.dec();
    inner.faces.stop(&session.camera_id).await;
    if let Err(e) = inner.gateway.cleanup_path(&session.path_name).await {
        warn!(camera_id = %session.camera_id, error = %e, "gateway cleanup after failure failed");
    }
    if let Err(e) = inner
        .store
        .update_camera_path_info(&session.camera_id, &session.path_name, CameraStatus::Error)
        .await
    {
        warn!(camera_id = %session.camera_id, error = %e, "camera store update after failure failed");
    }
}

fn set_state(state: &Arc<StdMutex<LifecycleState>>, value: LifecycleState) {
    match state.lock() {
        Ok(mut g) => *g = value,
        Err(p) => *p.into_inner() = value,
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Exponential backoff with a cap and +/-20% jitter so a bank of cameras
/// that died together does not restart in lockstep.
pub fn restart_backoff(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(cap);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    capped.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        for attempt in 0..12 {
            let d = restart_backoff(attempt, base, cap);
            let raw = base.saturating_mul(1u32 << attempt.min(16)).min(cap);
            assert!(d >= raw.mul_f64(0.8) && d <= raw.mul_f64(1.2), "attempt {attempt}: {d:?}");
        }
        // Deep attempts never exceed the cap plus jitter.
        assert!(restart_backoff(30, base, cap) <= cap.mul_f64(1.2));
    }

    #[test]
    fn session_metrics_report_frames() {
        let m = SessionMetrics::default();
        assert_eq!(m.frames_processed(), 0);
        assert!(m.last_frame_unix().is_none());
        m.record_frame();
        m.record_frame();
        assert_eq!(m.frames_processed(), 2);
        assert!(m.last_frame_unix().is_some());
    }
}
