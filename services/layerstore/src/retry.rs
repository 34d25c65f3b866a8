//! Bounded retry of transient storage failures.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use storage::StorageError;

/// A policy for retrying storage operations with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Backoff {
    /// Total attempts, including the first one.
    pub attempts: u32,

    /// The delay before the first retry, in milliseconds.
    pub delay_ms: u64,

    /// The factor the delay grows by after each retry.
    pub exponent: u32,

    /// The ceiling on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 50,
            exponent: 2,
            max_delay_ms: 1000,
        }
    }
}

impl Backoff {
    /// A policy which never retries.
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    /// The delay before retry number `retry` (starting from zero).
    fn delay(&self, retry: u32) -> Duration {
        let factor = u64::from(self.exponent).saturating_pow(retry);
        let ms = self.delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are used up. The last error is returned.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < attempts => {
                    let delay = self.delay(attempt - 1);
                    tracing::warn!(
                        %error,
                        attempt,
                        ?delay,
                        "retrying {what} after transient storage failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
