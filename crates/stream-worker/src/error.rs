//! Camera-level error taxonomy.
//!
//! Transient external failures are retried inside the component that hit
//! them; only retry exhaustion or an explicit timeout propagates upward as
//! one of these variants.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The camera's circuit breaker currently refuses attempts. Retry
    /// later; no subprocess was launched.
    #[error("circuit breaker open for camera {camera_id}, retry later")]
    CircuitOpen { camera_id: String },

    /// The transcoding subprocess failed to start or exited during the
    /// probation window. Surfaced synchronously to the caller.
    #[error("transcode launch failed for camera {camera_id}: {reason}")]
    Launch { camera_id: String, reason: String },

    /// The worker is already running its configured maximum of concurrent
    /// streams.
    #[error("stream capacity reached ({limit} concurrent streams)")]
    AtCapacity { limit: usize },

    /// A gateway or RTSP call failed after its internal retry budget.
    #[error("transient failure against {target}: {reason}")]
    TransientExternal { target: String, reason: String },

    /// A readiness or liveness check exceeded its budget. Terminal for the
    /// attempt; triggers cleanup.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The RTSP source presented an unexpected track or format. Terminal,
    /// never retried.
    #[error("protocol error on {target}: {reason}")]
    Protocol { target: String, reason: String },
}

impl StreamError {
    pub fn transient(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TransientExternal {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub fn protocol(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Protocol {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may reasonably retry the whole operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::AtCapacity { .. }
                | Self::TransientExternal { .. }
                | Self::Timeout { .. }
        )
    }
}
