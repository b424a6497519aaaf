//! Coordinator for named publish paths in the external streaming gateway.
//!
//! The gateway exposes a synchronous admin API (path add/get/delete). No
//! event push exists upstream, so readiness is observed by polling; every
//! poll loop is deadline-bounded and every HTTP call carries its own
//! timeout, so nothing here can hang indefinitely.

use std::time::Duration;

use async_trait::async_trait;
use common::retry::{retry_operation, RetryConfig};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};

use crate::error::StreamError;

#[async_trait]
pub trait PathCoordinator: Send + Sync {
    /// Idempotently create `path_name` reading from `source_ref`. A stale
    /// path with the same name is cleaned up first.
    async fn configure_path(&self, path_name: &str, source_ref: &str) -> Result<(), StreamError>;

    /// Poll until the gateway reports the path ready with an attached
    /// source, or the timeout elapses.
    async fn wait_ready(&self, path_name: &str, timeout: Duration) -> Result<(), StreamError>;

    /// Stronger readiness used before reporting a camera usable: requires
    /// an attached source object or nonzero bytes transmitted.
    async fn wait_active_stream(
        &self,
        path_name: &str,
        timeout: Duration,
    ) -> Result<(), StreamError>;

    /// Delete the path. "not found" counts as success.
    async fn cleanup_path(&self, path_name: &str) -> Result<(), StreamError>;

    /// Poll the admin API until it answers, or the timeout elapses.
    async fn wait_api_ready(&self, timeout: Duration) -> Result<(), StreamError>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathStatus {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    source: Option<serde_json::Value>,
    #[serde(default)]
    bytes_sent: u64,
}

impl PathStatus {
    fn has_source(&self) -> bool {
        matches!(&self.source, Some(v) if !v.is_null())
    }
}

pub struct HttpPathCoordinator {
    base: Url,
    client: reqwest::Client,
    auth: Option<(String, String)>,
}

impl HttpPathCoordinator {
    pub fn new(base: Url, auth: Option<(String, String)>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base, client, auth })
    }

    fn endpoint(&self, path: &str) -> Result<Url, StreamError> {
        self.base
            .join(path)
            .map_err(|e| StreamError::transient("gateway", format!("bad endpoint {path}: {e}")))
    }

    fn with_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    async fn create_path(&self, path_name: &str, source_ref: &str) -> Result<(), CreateError> {
        let url = self
            .endpoint(&format!("v3/config/paths/add/{path_name}"))
            .map_err(CreateError::Fatal)?;
        let body = json!({
            "source": source_ref,
            "sourceOnDemand": false,
        });

        let resp = self
            .with_auth(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| CreateError::Retryable(StreamError::transient("gateway", e)))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        if status.is_server_error() {
            return Err(CreateError::Retryable(StreamError::transient(
                "gateway",
                format!("path add {path_name}: status {status}: {text}"),
            )));
        }
        if status == StatusCode::BAD_REQUEST && text.contains("already exists") {
            return Err(CreateError::AlreadyExists);
        }
        Err(CreateError::Fatal(StreamError::transient(
            "gateway",
            format!("path add {path_name}: status {status}: {text}"),
        )))
    }

    async fn path_status(&self, path_name: &str) -> Result<Option<PathStatus>, StreamError> {
        let url = self.endpoint(&format!("v3/paths/get/{path_name}"))?;
        let resp = self
            .with_auth(self.client.get(url))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| StreamError::transient("gateway", e))?;

        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let status = resp
                    .json::<PathStatus>()
                    .await
                    .map_err(|e| StreamError::transient("gateway", e))?;
                Ok(Some(status))
            }
            s => Err(StreamError::transient(
                "gateway",
                format!("path get {path_name}: status {s}"),
            )),
        }
    }

    async fn delete_path(&self, path_name: &str) -> Result<(), StreamError> {
        let url = self.endpoint(&format!("v3/config/paths/delete/{path_name}"))?;
        let resp = self
            .with_auth(self.client.delete(url))
            .send()
            .await
            .map_err(|e| StreamError::transient("gateway", e))?;

        match resp.status() {
            // Idempotent deletion: a missing path is a success.
            StatusCode::NOT_FOUND => Ok(()),
            s if s.is_success() => Ok(()),
            s => {
                let text = resp.text().await.unwrap_or_default();
                Err(StreamError::transient(
                    "gateway",
                    format!("path delete {path_name}: status {s}: {text}"),
                ))
            }
        }
    }

    /// Multi-attempt deletion used when a create raced with a stale path.
    async fn force_cleanup(&self, path_name: &str) -> Result<(), StreamError> {
        let mut last = None;
        for attempt in 1..=3u32 {
            match self.delete_path(path_name).await {
                Ok(()) => {
                    info!(path = path_name, attempt, "forced path cleanup succeeded");
                    return Ok(());
                }
                Err(e) => {
                    warn!(path = path_name, attempt, error = %e, "forced path cleanup attempt failed");
                    last = Some(e);
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| StreamError::transient("gateway", "forced cleanup failed")))
    }

    async fn poll_path<F>(
        &self,
        path_name: &str,
        operation: &str,
        timeout: Duration,
        poll_every: Duration,
        mut accept: F,
    ) -> Result<(), StreamError>
    where
        F: FnMut(&PathStatus) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut ticker = interval(poll_every);
        // First tick fires immediately; skip it so the path has a moment.
        ticker.tick().await;

        loop {
            if Instant::now() >= deadline {
                return Err(StreamError::timeout(
                    format!("{operation} for path {path_name}"),
                    timeout,
                ));
            }
            ticker.tick().await;

            match self.path_status(path_name).await {
                Ok(Some(status)) => {
                    if accept(&status) {
                        debug!(path = path_name, operation, "path check satisfied");
                        return Ok(());
                    }
                    debug!(
                        path = path_name,
                        ready = status.ready,
                        has_source = status.has_source(),
                        bytes_sent = status.bytes_sent,
                        "path not yet ready"
                    );
                }
                Ok(None) => debug!(path = path_name, "path not present yet"),
                Err(e) => warn!(path = path_name, error = %e, "path status check failed, retrying"),
            }
        }
    }
}

enum CreateError {
    AlreadyExists,
    Retryable(StreamError),
    Fatal(StreamError),
}

#[async_trait]
impl PathCoordinator for HttpPathCoordinator {
    async fn configure_path(&self, path_name: &str, source_ref: &str) -> Result<(), StreamError> {
        // Best-effort stale cleanup; failure is logged, not fatal.
        if let Err(e) = self.delete_path(path_name).await {
            warn!(path = path_name, error = %e, "stale path cleanup failed, continuing");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;

        let retry_cfg = RetryConfig::new(3, Duration::from_secs(2), Duration::from_secs(10));
        let created = retry_operation(
            &format!("gateway path add {path_name}"),
            &retry_cfg,
            // Only transport failures and 5xx re-enter the retry loop;
            // terminal outcomes pass through as the inner value.
            || async move {
                match self.create_path(path_name, source_ref).await {
                    Ok(()) => Ok(Ok(())),
                    Err(CreateError::Retryable(e)) => Err(anyhow::anyhow!(e)),
                    Err(terminal) => Ok(Err(terminal)),
                }
            },
        )
        .await
        .map_err(|e| StreamError::transient("gateway", format!("{e:#}")))?;

        match created {
            Ok(()) => {
                info!(path = path_name, "gateway path configured");
                return Ok(());
            }
            Err(CreateError::AlreadyExists) => {}
            Err(CreateError::Fatal(e)) | Err(CreateError::Retryable(e)) => return Err(e),
        }

        // "already exists" means creation raced with the stale cleanup:
        // force removal and retry the creation exactly once more.
        warn!(path = path_name, "path already exists after cleanup, forcing removal");
        self.force_cleanup(path_name).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;

        match self.create_path(path_name, source_ref).await {
            Ok(()) => {
                info!(path = path_name, "gateway path configured after forced cleanup");
                Ok(())
            }
            Err(CreateError::AlreadyExists) => Err(StreamError::transient(
                "gateway",
                format!("path {path_name} still exists after forced cleanup"),
            )),
            Err(CreateError::Retryable(e)) | Err(CreateError::Fatal(e)) => Err(e),
        }
    }

    async fn wait_ready(&self, path_name: &str, timeout: Duration) -> Result<(), StreamError> {
        self.poll_path(path_name, "wait_ready", timeout, Duration::from_secs(2), |s| {
            s.ready && s.has_source()
        })
        .await
    }

    async fn wait_active_stream(
        &self,
        path_name: &str,
        timeout: Duration,
    ) -> Result<(), StreamError> {
        self.poll_path(
            path_name,
            "wait_active_stream",
            timeout,
            Duration::from_secs(1),
            |s| s.ready && (s.has_source() || s.bytes_sent > 0),
        )
        .await
    }

    async fn cleanup_path(&self, path_name: &str) -> Result<(), StreamError> {
        let mut last = None;
        for attempt in 1..=3u32 {
            match self.delete_path(path_name).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(path = path_name, attempt, error = %e, "path cleanup attempt failed");
                    last = Some(e);
                    // Linear backoff between attempts, none after the last.
                    if attempt < 3 {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }
        Err(last.unwrap_or_else(|| StreamError::transient("gateway", "cleanup failed")))
    }

    async fn wait_api_ready(&self, timeout: Duration) -> Result<(), StreamError> {
        let deadline = Instant::now() + timeout;
        let url = self.endpoint("v3/paths/list")?;
        loop {
            let probe = self
                .with_auth(self.client.get(url.clone()))
                .timeout(Duration::from_secs(3))
                .send()
                .await;
            match probe {
                Ok(resp) if resp.status().is_success() => {
                    info!("gateway admin API is ready");
                    return Ok(());
                }
                Ok(resp) => debug!(status = %resp.status(), "gateway API not ready yet"),
                Err(e) => debug!(error = %e, "gateway API not reachable yet"),
            }
            if Instant::now() >= deadline {
                return Err(StreamError::timeout("gateway API readiness", timeout));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_status_treats_null_source_as_absent() {
        let s: PathStatus =
            serde_json::from_str(r#"{"ready":true,"source":null,"bytesSent":0}"#).unwrap();
        assert!(s.ready);
        assert!(!s.has_source());

        let s: PathStatus =
            serde_json::from_str(r#"{"ready":true,"source":{"type":"rtspSession"},"bytesSent":10}"#)
                .unwrap();
        assert!(s.has_source());
        assert_eq!(s.bytes_sent, 10);
    }

    #[test]
    fn path_status_defaults_are_not_ready() {
        let s: PathStatus = serde_json::from_str("{}").unwrap();
        assert!(!s.ready);
        assert!(!s.has_source());
        assert_eq!(s.bytes_sent, 0);
    }
}
