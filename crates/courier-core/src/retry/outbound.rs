//! Outbound calls: downstream endpoint abstraction and its retry schedule.
//!
//! LongRunning 系のハンドラは外部サービスを叩きます。その失敗分類
//! （timeout / 429 / 5xx は再試行、その他の 4xx は恒久失敗）をここに集約し、
//! 実際の HTTP スタック抜きでテストできるよう trait の背後に置いています。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::Classified;

/// Failure of a downstream call.
#[derive(Debug, Error)]
pub enum OutboundError {
    /// No response within the caller's time budget.
    #[error("downstream timed out")]
    Timeout,

    /// Responded with a non-success status.
    #[error("downstream returned status {0}")]
    Status(u16),

    /// Could not reach the endpoint at all.
    #[error("downstream connect: {0}")]
    Connect(String),
}

impl Classified for OutboundError {
    fn is_retryable(&self) -> bool {
        match self {
            OutboundError::Timeout | OutboundError::Connect(_) => true,
            // 429 は「後で来い」、5xx は向こうの都合。他の 4xx はこちらの誤り。
            OutboundError::Status(status) => *status == 429 || *status >= 500,
        }
    }
}

/// Downstream endpoint the handlers talk to.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn call(&self, body: &serde_json::Value) -> Result<serde_json::Value, OutboundError>;
}

/// Backoff schedule for outbound calls.
#[derive(Debug, Clone)]
pub struct HttpRetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,

    /// Base delay before the first re-attempt.
    pub base_delay: Duration,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for HttpRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl HttpRetryPolicy {
    /// Delay after attempt number `attempt` (1-indexed) failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs.clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// An Outbound wrapped with its retry schedule.
#[derive(Clone)]
pub struct RetryingCaller {
    downstream: Arc<dyn Outbound>,
    policy: HttpRetryPolicy,
}

impl RetryingCaller {
    pub fn new(downstream: Arc<dyn Outbound>, policy: HttpRetryPolicy) -> Self {
        Self { downstream, policy }
    }

    /// Call the downstream, retrying retryable failures per the schedule.
    pub async fn call(
        &self,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, OutboundError> {
        let mut attempt = 1;
        loop {
            match self.downstream.call(body).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    tracing::warn!(
                        error = %err,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "downstream call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
