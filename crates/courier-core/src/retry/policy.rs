//! Retry policy: decides backoff delays for in-handler retries.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::domain::Classified;

/// Retry policy for transient failures inside one delivery.
///
/// The broker has its own redelivery backoff; this policy only covers the
/// short in-process retries before giving the message back.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first try. An always-failing op runs
    /// `1 + max_retries` times.
    pub max_retries: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// No in-process retries at all; every failure surfaces immediately.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Constant delay between retries.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// Calculate the delay before retry number `retry` (1-indexed).
    ///
    /// delay = base_delay * multiplier^(retry - 1), capped at max_delay.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(retry.saturating_sub(1) as i32);
        // Cap before converting back: from_secs_f64 panics on huge values.
        Duration::from_secs_f64(delay_secs.clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// Run `op`, retrying failures that classify as retryable.
    ///
    /// 一回の配送の中で完結するインライン再試行。ここで使い切った失敗は
    /// 呼び出し側（リスナー）が abandon / dead-letter に振り分けます。
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Classified + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.delay_for(retry);
                    tracing::warn!(
                        error = %err,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure; retrying in-process"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
