use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    /// Streaming gateway admin API base, e.g. http://localhost:9997
    pub gateway_api_url: String,
    /// RTSP base the transcoder publishes into, e.g. rtsp://localhost:8554
    pub gateway_publish_url: String,
    /// WebRTC base handed to viewers, e.g. http://localhost:8891
    pub gateway_webrtc_url: String,
    pub gateway_username: Option<String>,
    pub gateway_password: Option<String>,
    /// Camera record store API base; absent means no persistence.
    pub store_api_url: Option<String>,
    pub kafka_brokers: String,
    pub alert_topic: String,
    pub max_concurrent_streams: usize,
    pub transcode_program: String,
    pub face: FaceConfig,
}

#[derive(Debug, Clone)]
pub struct FaceConfig {
    pub enabled: bool,
    pub model_path: String,
    pub sample_interval: Duration,
    pub confidence_threshold: f64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bind_addr = env::var("WORKER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let gateway_api_url =
            env::var("GATEWAY_API_URL").unwrap_or_else(|_| "http://localhost:9997".to_string());
        let gateway_publish_url =
            env::var("GATEWAY_PUBLISH_URL").unwrap_or_else(|_| "rtsp://localhost:8554".to_string());
        let gateway_webrtc_url =
            env::var("GATEWAY_WEBRTC_URL").unwrap_or_else(|_| "http://localhost:8891".to_string());

        let interval_ms = env_u64("FACE_DETECTION_INTERVAL_MS", 1000);
        let face = FaceConfig {
            enabled: env::var("FACE_DETECTION_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            model_path: env::var("FACE_DETECTION_MODEL_PATH")
                .unwrap_or_else(|_| "/app/models/seeta_fd_frontal_v1.0.bin".to_string()),
            sample_interval: Duration::from_millis(interval_ms.max(100)),
            confidence_threshold: env::var("FACE_DETECTION_CONFIDENCE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.5),
        };

        Ok(Config {
            bind_addr,
            gateway_api_url,
            gateway_publish_url,
            gateway_webrtc_url,
            gateway_username: env::var("GATEWAY_USERNAME").ok(),
            gateway_password: env::var("GATEWAY_PASSWORD").ok(),
            store_api_url: env::var("STORE_API_URL").ok(),
            kafka_brokers: env::var("KAFKA_BROKERS").unwrap_or_else(|_| "localhost:9092".to_string()),
            alert_topic: env::var("ALERT_TOPIC").unwrap_or_else(|_| "camera-events".to_string()),
            max_concurrent_streams: env_u64("MAX_CONCURRENT_STREAMS", 20) as usize,
            transcode_program: env::var("TRANSCODE_PROGRAM").unwrap_or_else(|_| "ffmpeg".to_string()),
            face,
        })
    }
}

fn env_u64(key: &str, def: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(def)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Avoid cross-test env pollution by only asserting stable defaults.
        let config = Config::from_env().unwrap();
        assert!(!config.gateway_publish_url.is_empty());
        assert_eq!(config.alert_topic, "camera-events");
        assert_eq!(config.max_concurrent_streams, 20);
        assert!(config.face.sample_interval >= Duration::from_millis(100));
    }
}
