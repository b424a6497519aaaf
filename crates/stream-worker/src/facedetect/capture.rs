//! JPEG frame capture from an RTSP source.
//!
//! Detection needs whole decoded pictures, not RTP payloads, so the
//! sampler runs a small ffmpeg that turns the camera stream into MJPEG on
//! stdout and scans the byte stream for JPEG frame boundaries.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::debug;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
// A sane ceiling for one camera JPEG; anything bigger means we lost sync.
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

pub struct MjpegCapture {
    child: Child,
    stdout: BufReader<ChildStdout>,
    buf: BytesMut,
}

impl MjpegCapture {
    /// Launch an ffmpeg MJPEG pipe reading `source_url`. Quality 5 keeps
    /// frames small; detection does not need pristine pictures.
    pub async fn open(program: &str, source_url: &str) -> Result<Self> {
        let mut child = Command::new(program)
            .args([
                "-rtsp_transport",
                "tcp",
                "-i",
                source_url,
                "-an",
                "-f",
                "mjpeg",
                "-q:v",
                "5",
                "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {program} for MJPEG capture"))?;
        let stdout = child
            .stdout
            .take()
            .context("MJPEG capture subprocess has no stdout")?;
        debug!(source_url, "MJPEG capture subprocess started");
        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            buf: BytesMut::with_capacity(256 * 1024),
        })
    }

    /// Read the next complete JPEG frame from the pipe.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>> {
        next_jpeg(&mut self.stdout, &mut self.buf).await
    }

    pub async fn close(mut self) {
        let _ = self.child.kill().await;
    }
}

/// Scan `reader` for the next SOI..EOI delimited JPEG, carrying partial
/// data across reads in `buf`. Markers split across a read boundary are
/// handled by never discarding the final unpaired 0xFF.
pub async fn next_jpeg<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Result<Vec<u8>> {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        if let Some(frame) = extract_jpeg(buf)? {
            return Ok(frame);
        }
        let n = reader.read(&mut chunk).await.context("MJPEG pipe read")?;
        if n == 0 {
            bail!("MJPEG pipe closed");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn extract_jpeg(buf: &mut BytesMut) -> Result<Option<Vec<u8>>> {
    let Some(start) = find_marker(buf, &SOI) else {
        // Keep a trailing 0xFF in case the SOI straddles the boundary.
        let keep = usize::from(buf.last() == Some(&0xFF));
        let drop = buf.len() - keep;
        let _ = buf.split_to(drop);
        return Ok(None);
    };
    if start > 0 {
        let _ = buf.split_to(start);
    }
    if buf.len() > MAX_FRAME_BYTES {
        buf.clear();
        bail!("MJPEG frame exceeded {MAX_FRAME_BYTES} bytes, resynchronizing");
    }
    match find_marker(&buf[2..], &EOI) {
        Some(rel) => {
            let end = 2 + rel + EOI.len();
            let frame = buf.split_to(end);
            Ok(Some(frame.to_vec()))
        }
        None => Ok(None),
    }
}

fn find_marker(haystack: &[u8], marker: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn fake_jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    #[tokio::test]
    async fn extracts_consecutive_frames() {
        let a = fake_jpeg(&[1, 2, 3]);
        let b = fake_jpeg(&[9, 9]);
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut reader = Cursor::new(stream);
        let mut buf = BytesMut::new();
        assert_eq!(next_jpeg(&mut reader, &mut buf).await.unwrap(), a);
        assert_eq!(next_jpeg(&mut reader, &mut buf).await.unwrap(), b);
        assert!(next_jpeg(&mut reader, &mut buf).await.is_err());
    }

    #[tokio::test]
    async fn skips_garbage_before_soi() {
        let frame = fake_jpeg(&[7]);
        let mut stream = vec![0x00, 0xFF, 0x13];
        stream.extend_from_slice(&frame);

        let mut reader = Cursor::new(stream);
        let mut buf = BytesMut::new();
        assert_eq!(next_jpeg(&mut reader, &mut buf).await.unwrap(), frame);
    }

    #[tokio::test]
    async fn handles_marker_split_across_reads() {
        // Feed one byte at a time so every marker straddles a boundary.
        struct OneByte(Cursor<Vec<u8>>);
        impl AsyncRead for OneByte {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let mut byte = [0u8; 1];
                let mut one = tokio::io::ReadBuf::new(&mut byte);
                match std::pin::Pin::new(&mut self.0).poll_read(cx, &mut one) {
                    std::task::Poll::Ready(Ok(())) => {
                        buf.put_slice(one.filled());
                        std::task::Poll::Ready(Ok(()))
                    }
                    other => other,
                }
            }
        }

        let frame = fake_jpeg(&[0xAB, 0xCD]);
        let mut reader = OneByte(Cursor::new(frame.clone()));
        let mut buf = BytesMut::new();
        assert_eq!(next_jpeg(&mut reader, &mut buf).await.unwrap(), frame);
    }
}
