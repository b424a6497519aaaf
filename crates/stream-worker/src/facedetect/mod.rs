//! Face detection sampling pipeline.
//!
//! Each enabled camera gets one sampler task: it pulls JPEG frames from
//! the camera's RTSP stream, runs them through the cascade detector about
//! once a second, gates the raw detections, and publishes an annotated
//! alert for every frame that still holds at least one face.

pub mod capture;
pub mod detector;
pub mod filter;

pub use filter::FilterConfig;

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::Rgb;
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::alerts::{BoundingBox, FaceDetectionAlert};

use crate::alerts::AlertBus;
use crate::supervisor::SessionMetrics;
use capture::MjpegCapture;
use detector::FaceDetector;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub transcode_program: String,
    pub sample_interval: Duration,
    pub confidence_threshold: f64,
    /// Settling time after the capture pipe opens before sampling starts.
    pub stabilize: Duration,
    /// Frames discarded after stabilization; cameras often emit a few
    /// corrupted pictures right after connect.
    pub warmup_frames: u32,
    pub open_attempts: u32,
    pub open_backoff: Duration,
    /// Consecutive read failures tolerated before the sampler gives up.
    pub reopen_limit: u32,
    pub read_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            transcode_program: "ffmpeg".to_string(),
            sample_interval: Duration::from_secs(1),
            confidence_threshold: 0.5,
            stabilize: Duration::from_secs(5),
            warmup_frames: 5,
            open_attempts: 5,
            open_backoff: Duration::from_secs(3),
            reopen_limit: 3,
            read_timeout: Duration::from_secs(10),
        }
    }
}

/// A camera the pipeline should sample.
pub struct FaceTarget {
    pub camera_id: String,
    pub camera_name: String,
    pub source_url: String,
    pub metrics: Arc<SessionMetrics>,
}

pub struct FacePipeline {
    config: PipelineConfig,
    filter: FilterConfig,
    detector: Option<Arc<dyn FaceDetector>>,
    bus: Arc<dyn AlertBus>,
    running: StdMutex<HashMap<String, CancellationToken>>,
}

impl FacePipeline {
    /// `detector` may be absent when no model is available; starts then
    /// become no-ops.
    pub fn new(
        config: PipelineConfig,
        filter: FilterConfig,
        detector: Option<Arc<dyn FaceDetector>>,
        bus: Arc<dyn AlertBus>,
    ) -> Self {
        Self {
            config,
            filter,
            detector,
            bus,
            running: StdMutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self, camera_id: &str) -> bool {
        lock(&self.running).contains_key(camera_id)
    }

    /// Start sampling `target`. Idempotent while a sampler is alive.
    pub fn start(self: &Arc<Self>, target: FaceTarget) {
        let Some(detector) = self.detector.clone() else {
            warn!(camera_id = %target.camera_id, "face detection requested but no model is loaded");
            return;
        };
        let mut running = lock(&self.running);
        if running.contains_key(&target.camera_id) {
            debug!(camera_id = %target.camera_id, "face detection already running");
            return;
        }
        let cancel = CancellationToken::new();
        running.insert(target.camera_id.clone(), cancel.clone());
        drop(running);

        info!(camera_id = %target.camera_id, "face detection started");
        let pipeline = Arc::downgrade(self);
        let (config, filter, bus) = (self.config.clone(), self.filter.clone(), self.bus.clone());
        tokio::spawn(async move {
            let camera_id = target.camera_id.clone();
            run_sampler(target, config, filter, detector, bus, cancel).await;
            // Deregister so a sampler that gave up does not block restarts.
            if let Some(p) = pipeline.upgrade() {
                lock(&p.running).remove(&camera_id);
            }
        });
    }

    /// Stop the sampler for `camera_id`. Returns false when none ran.
    pub async fn stop(&self, camera_id: &str) -> bool {
        let token = lock(&self.running).remove(camera_id);
        match token {
            Some(token) => {
                token.cancel();
                info!(camera_id, "face detection stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        for (camera_id, token) in lock(&self.running).drain() {
            token.cancel();
            debug!(camera_id = %camera_id, "face detection stopped on shutdown");
        }
    }
}

async fn run_sampler(
    target: FaceTarget,
    config: PipelineConfig,
    filter: FilterConfig,
    detector: Arc<dyn FaceDetector>,
    bus: Arc<dyn AlertBus>,
    cancel: CancellationToken,
) {
    let camera_id = target.camera_id.clone();
    let mut reopens = 0u32;
    loop {
        let capture = tokio::select! {
            _ = cancel.cancelled() => return,
            c = open_capture(&config, &target.source_url) => c,
        };
        let Some(capture) = capture else {
            warn!(camera_id, "could not open capture pipe, face detection stops");
            return;
        };

        match sample_loop(capture, &target, &config, &filter, &detector, &bus, &cancel).await {
            SamplerExit::Cancelled => return,
            SamplerExit::CaptureLost => {
                reopens += 1;
                if reopens > config.reopen_limit {
                    warn!(camera_id, reopens, "capture kept failing, face detection stops");
                    return;
                }
                warn!(camera_id, attempt = reopens, "capture lost, reopening");
            }
        }
    }
}

async fn open_capture(config: &PipelineConfig, source_url: &str) -> Option<MjpegCapture> {
    let mut backoff = config.open_backoff;
    for attempt in 1..=config.open_attempts {
        match MjpegCapture::open(&config.transcode_program, source_url).await {
            Ok(c) => return Some(c),
            Err(e) => {
                warn!(attempt, error = %e, "MJPEG capture open failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
    None
}

enum SamplerExit {
    Cancelled,
    CaptureLost,
}

async fn sample_loop(
    mut capture: MjpegCapture,
    target: &FaceTarget,
    config: &PipelineConfig,
    filter: &FilterConfig,
    detector: &Arc<dyn FaceDetector>,
    bus: &Arc<dyn AlertBus>,
    cancel: &CancellationToken,
) -> SamplerExit {
    let camera_id = &target.camera_id;

    tokio::select! {
        _ = cancel.cancelled() => { capture.close().await; return SamplerExit::Cancelled; }
        _ = tokio::time::sleep(config.stabilize) => {}
    }

    let mut warmup = config.warmup_frames;
    // Sampling never pauses reads: frames are drained at stream rate and
    // analyzed only when the interval has elapsed, so the pipe cannot
    // back up and a slow detection pass just skips ticks.
    let mut last_sample: Option<Instant> = None;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => { capture.close().await; return SamplerExit::Cancelled; }
            f = tokio::time::timeout(config.read_timeout, capture.next_frame()) => f,
        };
        let frame = match frame {
            Ok(Ok(f)) => f,
            Ok(Err(e)) => {
                warn!(camera_id, error = %e, "frame read failed");
                capture.close().await;
                return SamplerExit::CaptureLost;
            }
            Err(_) => {
                warn!(camera_id, "frame read timed out");
                capture.close().await;
                return SamplerExit::CaptureLost;
            }
        };

        if warmup > 0 {
            warmup -= 1;
            continue;
        }
        if matches!(last_sample, Some(t) if t.elapsed() < config.sample_interval) {
            continue;
        }
        last_sample = Some(Instant::now());
        target.metrics.record_frame();

        match analyze_frame(
            &frame,
            detector.as_ref(),
            filter,
            config.confidence_threshold,
            camera_id,
            &target.camera_name,
        ) {
            Ok(Some(alert)) => {
                debug!(camera_id, faces = alert.face_count, "faces detected");
                if let Err(e) = bus.publish(&alert).await {
                    warn!(camera_id, error = %e, "alert publication failed");
                }
            }
            Ok(None) => {}
            Err(e) => debug!(camera_id, error = %e, "frame analysis failed"),
        }
    }
}

/// Run detection on one JPEG. Returns an annotated alert when at least
/// one detection survives the plausibility gates.
pub fn analyze_frame(
    jpeg: &[u8],
    detector: &dyn FaceDetector,
    filter: &FilterConfig,
    confidence: f64,
    camera_id: &str,
    camera_name: &str,
) -> Result<Option<FaceDetectionAlert>> {
    let decoded = image::load_from_memory(jpeg).context("decoding captured frame")?;
    let (width, height) = (decoded.width(), decoded.height());

    let gray = decoded.to_luma8();
    let blurred = imageproc::filter::gaussian_blur_f32(&gray, 1.0);
    let prepared = imageproc::contrast::equalize_histogram(&blurred);

    let raw = detector.detect(&prepared)?;
    let faces = filter.filter(raw, width, height);
    if faces.is_empty() {
        return Ok(None);
    }

    let mut annotated = decoded.to_rgb8();
    let boxes: Vec<BoundingBox> = faces
        .iter()
        .map(|d| {
            draw_hollow_rect_mut(
                &mut annotated,
                Rect::at(d.x, d.y).of_size(d.width, d.height),
                Rgb([0, 255, 0]),
            );
            BoundingBox {
                x: d.x,
                y: d.y,
                width: d.width,
                height: d.height,
            }
        })
        .collect();

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut Cursor::new(&mut encoded), 85)
        .encode_image(&annotated)
        .context("encoding annotated frame")?;

    Ok(Some(FaceDetectionAlert::new(
        camera_id,
        camera_name,
        confidence,
        BASE64.encode(&encoded),
        boxes,
    )))
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::detector::{Detection, MockDetector};
    use super::*;
    use image::RgbImage;

    fn test_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([120, 130, 140]));
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut Cursor::new(&mut out), 85)
            .encode_image(&img)
            .unwrap();
        out
    }

    #[test]
    fn analyze_returns_none_without_detections() {
        let jpeg = test_jpeg(320, 240);
        let detector = MockDetector::empty();
        let result =
            analyze_frame(&jpeg, &detector, &FilterConfig::default(), 0.5, "cam-1", "Lobby")
                .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn analyze_builds_alert_for_valid_detection() {
        let jpeg = test_jpeg(320, 240);
        let detector = MockDetector::new(vec![Detection {
            x: 100,
            y: 80,
            width: 60,
            height: 66,
            score: 8.0,
        }]);

        let alert =
            analyze_frame(&jpeg, &detector, &FilterConfig::default(), 0.5, "cam-1", "Lobby")
                .unwrap()
                .unwrap();
        assert_eq!(alert.camera_id, "cam-1");
        assert_eq!(alert.face_count, 1);
        assert_eq!(alert.metadata.faces[0].x, 100);
        assert_eq!(alert.metadata.faces[0].width, 60);

        // The annotated image must round-trip as a real JPEG.
        let bytes = BASE64.decode(&alert.image_data).unwrap();
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!(img.width(), 320);
    }

    #[test]
    fn analyze_drops_gated_detections() {
        let jpeg = test_jpeg(320, 240);
        // Aspect ratio 2.0 fails the plausibility gate.
        let detector = MockDetector::new(vec![Detection {
            x: 100,
            y: 80,
            width: 120,
            height: 60,
            score: 8.0,
        }]);
        let result =
            analyze_frame(&jpeg, &detector, &FilterConfig::default(), 0.5, "cam-1", "Lobby")
                .unwrap();
        assert!(result.is_none());
    }
}
