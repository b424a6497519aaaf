//! Face detector abstraction over the cascade implementation.

use std::sync::{mpsc, Mutex};
use std::thread;

use anyhow::Result;
use image::GrayImage;
use rustface::ImageData;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub score: f64,
}

pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &GrayImage) -> Result<Vec<Detection>>;
}

struct DetectJob {
    frame: GrayImage,
    reply: mpsc::Sender<Vec<Detection>>,
}

/// Multi-scale funnel cascade detector loaded from a model file.
///
/// The underlying detector cannot cross threads and needs `&mut self`, so
/// it is confined to a dedicated worker thread and callers hand frames
/// over a channel. Detection runs about once a second per camera; a
/// single thread keeps up.
pub struct CascadeDetector {
    jobs: Mutex<mpsc::Sender<DetectJob>>,
}

impl CascadeDetector {
    pub fn from_model_file(path: &str) -> Result<Self> {
        let (jobs, job_rx) = mpsc::channel::<DetectJob>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();
        let model_path = path.to_string();
        // Detached on purpose; the thread exits when the job sender drops.
        let _ = thread::Builder::new()
            .name("face-detect".to_string())
            .spawn(move || detector_thread(&model_path, &ready_tx, &job_rx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => anyhow::bail!("loading face detection model from {path}: {e}"),
            Err(_) => anyhow::bail!("face detector thread died during model load"),
        }
        info!(model = path, "cascade face detector loaded");
        Ok(Self {
            jobs: Mutex::new(jobs),
        })
    }
}

/// Owns the cascade for its whole lifetime; exits when the job channel
/// closes.
fn detector_thread(
    model_path: &str,
    ready: &mpsc::Sender<Result<(), String>>,
    jobs: &mpsc::Receiver<DetectJob>,
) {
    let mut detector = match rustface::create_detector(model_path) {
        Ok(d) => d,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    detector.set_min_face_size(40);
    detector.set_score_thresh(2.0);
    detector.set_pyramid_scale_factor(0.8);
    detector.set_slide_window_step(4, 4);
    let _ = ready.send(Ok(()));

    for job in jobs {
        let mut image = ImageData::new(job.frame.as_raw(), job.frame.width(), job.frame.height());
        let detections = detector
            .detect(&mut image)
            .iter()
            .map(|f| {
                let bbox = f.bbox();
                Detection {
                    x: bbox.x(),
                    y: bbox.y(),
                    width: bbox.width(),
                    height: bbox.height(),
                    score: f64::from(f.score()),
                }
            })
            .collect();
        let _ = job.reply.send(detections);
    }
}

impl FaceDetector for CascadeDetector {
    fn detect(&self, frame: &GrayImage) -> Result<Vec<Detection>> {
        let (reply, response) = mpsc::channel();
        let job = DetectJob {
            frame: frame.clone(),
            reply,
        };
        {
            let sender = match self.jobs.lock() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            sender
                .send(job)
                .map_err(|_| anyhow::anyhow!("face detector thread is gone"))?;
        }
        response
            .recv()
            .map_err(|_| anyhow::anyhow!("face detector thread is gone"))
    }
}

/// Returns a fixed set of detections regardless of input.
pub struct MockDetector {
    detections: Vec<Detection>,
}

impl MockDetector {
    pub fn new(detections: Vec<Detection>) -> Self {
        Self { detections }
    }

    pub fn empty() -> Self {
        Self { detections: vec![] }
    }
}

impl FaceDetector for MockDetector {
    fn detect(&self, _frame: &GrayImage) -> Result<Vec<Detection>> {
        Ok(self.detections.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_detector_is_shareable_across_tasks() {
        fn assert_shareable<T: Send + Sync>() {}
        assert_shareable::<CascadeDetector>();
    }

    #[test]
    fn mock_detector_returns_configured_boxes() {
        let det = MockDetector::new(vec![Detection {
            x: 10,
            y: 10,
            width: 40,
            height: 40,
            score: 5.0,
        }]);
        let frame = GrayImage::new(64, 64);
        assert_eq!(det.detect(&frame).unwrap().len(), 1);
        assert!(MockDetector::empty().detect(&frame).unwrap().is_empty());
    }
}
