//! Bounded retry with exponential backoff around store calls.

use std::future::Future;
use std::time::{Duration, Instant};

use convertly_core::config::Config;
use convertly_core::ConversionError;

const MAX_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.storage_retry_attempts.max(1),
            base_delay: Duration::from_millis(config.storage_retry_base_ms),
            max_delay: MAX_DELAY,
        }
    }

    /// Delay before attempt `attempt + 1`: base doubled per failed attempt, capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or `policy.max_attempts` is used up.
///
/// Every store error is treated as transient. Exhaustion surfaces as
/// [`ConversionError::StorageUnavailable`] carrying the last error.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, ConversionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let start_time = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "store operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if attempt >= policy.max_attempts {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        error = %err,
                        "store operation failed: retries exhausted"
                    );
                    return Err(ConversionError::StorageUnavailable {
                        operation: operation_name.to_string(),
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }

                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "store operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
