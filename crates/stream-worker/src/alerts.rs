//! Alert publication.
//!
//! Detection alerts leave the worker through an `AlertBus`. Production
//! runs Kafka with payloads keyed by camera so per-camera ordering holds;
//! tests swap in the in-memory bus.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, info};

use common::alerts::FaceDetectionAlert;

use crate::metrics::ALERTS_PUBLISHED_TOTAL;

#[async_trait]
pub trait AlertBus: Send + Sync {
    async fn publish(&self, alert: &FaceDetectionAlert) -> anyhow::Result<()>;
}

pub struct KafkaAlertBus {
    producer: FutureProducer,
    topic: String,
}

impl KafkaAlertBus {
    pub fn new(brokers: &str, topic: impl Into<String>) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("compression.type", "gzip")
            .set("acks", "1")
            .set("message.timeout.ms", "5000")
            .create()?;
        let topic = topic.into();
        info!(brokers, topic = %topic, "Kafka alert producer ready");
        Ok(Self { producer, topic })
    }
}

#[async_trait]
impl AlertBus for KafkaAlertBus {
    async fn publish(&self, alert: &FaceDetectionAlert) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(alert)?;
        let record = FutureRecord::to(&self.topic)
            .key(&alert.camera_id)
            .payload(&payload);
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("kafka delivery failed: {e}"))?;
        ALERTS_PUBLISHED_TOTAL.inc();
        debug!(camera_id = %alert.camera_id, faces = alert.face_count, "alert published");
        Ok(())
    }
}

/// Swallows alerts; used when no broker is configured.
pub struct NullAlertBus;

#[async_trait]
impl AlertBus for NullAlertBus {
    async fn publish(&self, alert: &FaceDetectionAlert) -> anyhow::Result<()> {
        debug!(camera_id = %alert.camera_id, "alert discarded, no broker configured");
        Ok(())
    }
}

/// Collects alerts for test inspection.
#[derive(Default)]
pub struct InMemoryAlertBus {
    alerts: Mutex<Vec<FaceDetectionAlert>>,
}

impl InMemoryAlertBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<FaceDetectionAlert> {
        match self.alerts.lock() {
            Ok(mut g) => std::mem::take(&mut *g),
            Err(p) => std::mem::take(&mut *p.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        match self.alerts.lock() {
            Ok(g) => g.len(),
            Err(p) => p.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AlertBus for InMemoryAlertBus {
    async fn publish(&self, alert: &FaceDetectionAlert) -> anyhow::Result<()> {
        match self.alerts.lock() {
            Ok(mut g) => g.push(alert.clone()),
            Err(p) => p.into_inner().push(alert.clone()),
        }
        ALERTS_PUBLISHED_TOTAL.inc();
        Ok(())
    }
}
