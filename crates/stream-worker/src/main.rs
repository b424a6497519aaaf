use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::Url;
use tracing::{info, warn};

use common::store::{CameraStore, HttpCameraStore, NullCameraStore};
use stream_worker::alerts::{AlertBus, KafkaAlertBus, NullAlertBus};
use stream_worker::api::{self, AppState};
use stream_worker::config::Config;
use stream_worker::distributor::{DistributorConfig, FrameDistributor};
use stream_worker::facedetect::detector::{CascadeDetector, FaceDetector};
use stream_worker::facedetect::{FacePipeline, FilterConfig, PipelineConfig};
use stream_worker::gateway::{HttpPathCoordinator, PathCoordinator};
use stream_worker::supervisor::process::TranscodeSpawner;
use stream_worker::supervisor::{StreamSupervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_with_service("stream-worker");
    let config = Config::from_env()?;
    info!(bind = %config.bind_addr, gateway = %config.gateway_api_url, "stream worker starting");

    let gateway_base =
        Url::parse(&config.gateway_api_url).context("parsing GATEWAY_API_URL")?;
    let auth = match (&config.gateway_username, &config.gateway_password) {
        (Some(u), Some(p)) => Some((u.clone(), p.clone())),
        _ => None,
    };
    let gateway: Arc<dyn PathCoordinator> = Arc::new(HttpPathCoordinator::new(gateway_base, auth)?);

    let store: Arc<dyn CameraStore> = match &config.store_api_url {
        Some(url) => {
            let base = Url::parse(url).context("parsing STORE_API_URL")?;
            Arc::new(HttpCameraStore::new(base)?)
        }
        None => {
            warn!("no STORE_API_URL configured, camera records are unavailable");
            Arc::new(NullCameraStore)
        }
    };

    let bus: Arc<dyn AlertBus> = match KafkaAlertBus::new(&config.kafka_brokers, &config.alert_topic)
    {
        Ok(bus) => Arc::new(bus),
        Err(e) => {
            warn!(error = %e, "Kafka producer unavailable, alerts will be discarded");
            Arc::new(NullAlertBus)
        }
    };

    let detector: Option<Arc<dyn FaceDetector>> = if config.face.enabled {
        match CascadeDetector::from_model_file(&config.face.model_path) {
            Ok(d) => Some(Arc::new(d)),
            Err(e) => {
                warn!(error = %e, "face detection model failed to load, detection disabled");
                None
            }
        }
    } else {
        None
    };
    let faces = Arc::new(FacePipeline::new(
        PipelineConfig {
            transcode_program: config.transcode_program.clone(),
            sample_interval: config.face.sample_interval,
            confidence_threshold: config.face.confidence_threshold,
            ..PipelineConfig::default()
        },
        FilterConfig::default(),
        detector,
        bus,
    ));

    let supervisor = StreamSupervisor::new(
        SupervisorConfig {
            max_concurrent: config.max_concurrent_streams,
            publish_base: config.gateway_publish_url.clone(),
            webrtc_base: config.gateway_webrtc_url.clone(),
            ..SupervisorConfig::default()
        },
        Arc::new(TranscodeSpawner::new(&config.transcode_program)),
        gateway.clone(),
        store,
        faces,
    );

    // Block stream starts until the gateway admin API answers; a worker
    // that boots faster than the gateway would otherwise fail every
    // initial request.
    if let Err(e) = gateway.wait_api_ready(Duration::from_secs(60)).await {
        warn!(error = %e, "gateway admin API not ready, continuing anyway");
    }

    let distributor = Arc::new(FrameDistributor::new(DistributorConfig::default()));

    let state = AppState {
        supervisor: supervisor.clone(),
        gateway,
        distributor: distributor.clone(),
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("shutting down, stopping all stream sessions");
    supervisor.stop_all().await;
    distributor.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl-c handler failed");
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler failed"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
