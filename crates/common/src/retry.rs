//! Bounded retry with exponential backoff for calls against external
//! services (gateway admin API, camera record store).

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Run `operation` up to `config.max_attempts` times, doubling the delay
/// between attempts up to `config.max_delay`.
///
/// The final error is returned once attempts are exhausted; intermediate
/// failures are logged, not surfaced.
pub async fn retry_operation<T, F, Fut>(
    name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.base_delay;
    let mut last_err = anyhow!("operation '{}' was never attempted", name);

    for attempt in 1..=config.max_attempts.max(1) {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation = name, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => {
                warn!(
                    operation = name,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %e,
                    "operation attempt failed"
                );
                last_err = e;
            }
        }

        if attempt < config.max_attempts {
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(config.max_delay);
        }
    }

    Err(last_err.context(format!(
        "operation '{}' failed after {} attempts",
        name, config.max_attempts
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let cfg = RetryConfig::new(5, Duration::from_millis(1), Duration::from_millis(4));

        let result = retry_operation("test", &cfg, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let attempts = AtomicU32::new(0);
        let cfg = RetryConfig::new(3, Duration::from_millis(1), Duration::from_millis(2));

        let result: Result<()> = retry_operation("doomed", &cfg, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("still broken")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("doomed"));
        assert!(msg.contains("still broken"));
    }
}
