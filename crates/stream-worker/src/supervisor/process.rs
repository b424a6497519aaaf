//! Transcode subprocess handling.
//!
//! The supervisor never talks to ffmpeg directly; it goes through the
//! `ProcessSpawner` trait so lifecycle logic can be exercised with shell
//! scripts standing in for the real transcoder.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, warn};

/// A running transcode subprocess with its stdin kept open for the
/// graceful quit command.
pub struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl ProcessHandle {
    pub fn new(mut child: Child) -> Self {
        let stdin = child.stdin.take();
        Self { child, stdin }
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Non-blocking exit check, used during the launch probation window.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Ask the transcoder to shut down cleanly. ffmpeg quits on a `q` on
    /// stdin; closing the pipe afterwards covers programs that only react
    /// to EOF.
    pub async fn signal_graceful(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.write_all(b"q\n").await {
                debug!(error = %e, "quit command write failed, relying on pipe close");
            }
            let _ = stdin.shutdown().await;
        }
    }

    /// Wait up to `timeout` for the process to exit on its own.
    pub async fn wait_bounded(&mut self, timeout: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(error = %e, "wait on transcode subprocess failed");
                None
            }
            Err(_) => None,
        }
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "kill failed, process likely already gone");
        }
    }
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(
        &self,
        camera_id: &str,
        source_url: &str,
        publish_url: &str,
    ) -> std::io::Result<ProcessHandle>;
}

/// Spawns the real ffmpeg re-encode pipeline.
pub struct TranscodeSpawner {
    program: String,
}

impl TranscodeSpawner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl ProcessSpawner for TranscodeSpawner {
    async fn spawn(
        &self,
        camera_id: &str,
        source_url: &str,
        publish_url: &str,
    ) -> std::io::Result<ProcessHandle> {
        let args = build_transcode_args(source_url, publish_url);
        debug!(camera_id, program = %self.program, "spawning transcode subprocess");
        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        Ok(ProcessHandle::new(child))
    }
}

/// Full re-encode to baseline H.264 plus AAC audio. Cameras ship wildly
/// inconsistent streams; normalizing here keeps the gateway and browser
/// side simple at the cost of CPU.
pub fn build_transcode_args(source_url: &str, publish_url: &str) -> Vec<String> {
    [
        "-rtsp_transport",
        "tcp",
        "-buffer_size",
        "4000000",
        "-timeout",
        "60000000",
        "-max_delay",
        "5000000",
        "-i",
        source_url,
        "-c:v",
        "libx264",
        "-profile:v",
        "baseline",
        "-level",
        "3.1",
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-g",
        "30",
        "-keyint_min",
        "30",
        "-bf",
        "0",
        "-refs",
        "1",
        "-maxrate",
        "1500k",
        "-bufsize",
        "3000k",
        "-pix_fmt",
        "yuv420p",
        "-c:a",
        "aac",
        "-b:a",
        "64k",
        "-ar",
        "44100",
        "-err_detect",
        "ignore_err",
        "-fflags",
        "+genpts",
        "-avoid_negative_ts",
        "make_zero",
        "-muxdelay",
        "0.1",
        "-f",
        "rtsp",
        "-rtsp_transport",
        "tcp",
        publish_url,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcode_args_read_source_and_publish_over_tcp() {
        let args = build_transcode_args("rtsp://cam/stream", "rtsp://gw:8554/camera_1");
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "rtsp://cam/stream");
        assert_eq!(args.last().unwrap(), "rtsp://gw:8554/camera_1");
        assert_eq!(args[0], "-rtsp_transport");
        assert_eq!(args[1], "tcp");
        // Baseline profile with zero B-frames keeps WebRTC playback happy.
        assert!(args.windows(2).any(|w| w[0] == "-profile:v" && w[1] == "baseline"));
        assert!(args.windows(2).any(|w| w[0] == "-bf" && w[1] == "0"));
    }
}
