//! Client for the external camera record store.
//!
//! The persistence/query API owns camera records; the worker only reads a
//! camera's connection details and reflects stream status back. Status
//! updates are best-effort: a store outage must never block the stream
//! lifecycle, so callers log update failures and move on.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Camera details as known by the record store.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CameraInfo {
    pub rtsp_url: String,
    #[serde(default)]
    pub path_name: String,
    #[serde(default)]
    pub configured: bool,
    #[serde(default)]
    pub face_detection_enabled: bool,
    #[serde(default)]
    pub name: Option<String>,
}

/// Lifecycle status reflected back into the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CameraStatus {
    Processing,
    Offline,
    Error,
}

#[async_trait]
pub trait CameraStore: Send + Sync {
    async fn get_camera_info(&self, camera_id: &str) -> Result<CameraInfo>;

    /// Reflect path configuration and lifecycle status for a camera.
    /// Best-effort.
    async fn update_camera_path_info(
        &self,
        camera_id: &str,
        path_name: &str,
        status: CameraStatus,
    ) -> Result<()>;

    /// Display name for alert payloads. Falls back to a synthetic name.
    async fn camera_name(&self, camera_id: &str) -> String {
        match self.get_camera_info(camera_id).await {
            Ok(info) => info
                .name
                .unwrap_or_else(|| format!("Camera_{camera_id}")),
            Err(_) => format!("Camera_{camera_id}"),
        }
    }
}

/// HTTP implementation against the persistence collaborator.
pub struct HttpCameraStore {
    base: Url,
    client: reqwest::Client,
}

impl HttpCameraStore {
    pub fn new(base: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base, client })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base.join(path).context("invalid store endpoint")
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PathInfoUpdate<'a> {
    path_name: &'a str,
    configured: bool,
    status: CameraStatus,
}

#[async_trait]
impl CameraStore for HttpCameraStore {
    async fn get_camera_info(&self, camera_id: &str) -> Result<CameraInfo> {
        let url = self.endpoint(&format!("internal/cameras/{camera_id}"))?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .context("camera info request failed")?
            .error_for_status()
            .context("camera info returned error status")?;
        let info = resp
            .json::<CameraInfo>()
            .await
            .context("camera info body was not valid JSON")?;
        Ok(info)
    }

    async fn update_camera_path_info(
        &self,
        camera_id: &str,
        path_name: &str,
        status: CameraStatus,
    ) -> Result<()> {
        let url = self.endpoint(&format!("internal/cameras/{camera_id}/path"))?;
        let configured = status == CameraStatus::Processing;
        let body = PathInfoUpdate {
            path_name,
            configured,
            status,
        };
        self.client
            .put(url)
            .json(&body)
            .send()
            .await
            .context("camera path update request failed")?
            .error_for_status()
            .context("camera path update returned error status")?;
        debug!(camera_id, path_name, ?status, "camera path info updated");
        Ok(())
    }
}

/// Used when no record store is configured. Reads fail, writes succeed
/// silently, mirroring a worker running without persistence.
pub struct NullCameraStore;

#[async_trait]
impl CameraStore for NullCameraStore {
    async fn get_camera_info(&self, _camera_id: &str) -> Result<CameraInfo> {
        anyhow::bail!("camera record store not configured")
    }

    async fn update_camera_path_info(
        &self,
        _camera_id: &str,
        _path_name: &str,
        _status: CameraStatus,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_store_reads_fail_and_writes_succeed() {
        let store = NullCameraStore;
        assert!(store.get_camera_info("cam-1").await.is_err());
        assert!(store
            .update_camera_path_info("cam-1", "camera_cam-1", CameraStatus::Processing)
            .await
            .is_ok());
        assert_eq!(store.camera_name("cam-1").await, "Camera_cam-1");
    }

    #[test]
    fn camera_info_deserializes_partial_records() {
        let info: CameraInfo = serde_json::from_str(
            r#"{"rtspUrl":"rtsp://cam/stream","name":"Lobby"}"#,
        )
        .unwrap();
        assert_eq!(info.rtsp_url, "rtsp://cam/stream");
        assert_eq!(info.name.as_deref(), Some("Lobby"));
        assert!(!info.configured);
        assert!(!info.face_detection_enabled);
    }

    #[test]
    fn status_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_value(CameraStatus::Processing).unwrap(),
            "PROCESSING"
        );
        assert_eq!(
            serde_json::to_value(CameraStatus::Offline).unwrap(),
            "OFFLINE"
        );
        assert_eq!(serde_json::to_value(CameraStatus::Error).unwrap(), "ERROR");
    }
}
