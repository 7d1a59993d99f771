//! Bounded retry for calls into other subsystems.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

/// Retry policy: attempt count and a doubling delay between attempts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first. `0` is treated as `1`.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out.
///
/// `op` receives the 1-based attempt number. Between attempts the delay
/// doubles from `initial_delay`, capped at `max_delay`.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn ask_with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                tracing::debug!(attempt, error = %e, delay = ?delay, "retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(config.max_delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
