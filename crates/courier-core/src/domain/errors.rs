//! Error classification shared across handlers, dispatch, and outbound calls.

use thiserror::Error;

/// Errors whose retryability can be asked.
///
/// リトライ方針はここで判定する。Retryable なら abandon して再配送待ち、
/// NonRetryable なら dead-letter 行き。
pub trait Classified {
    fn is_retryable(&self) -> bool;
}

/// Error returned by action handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Transient failure. The delivery is abandoned and redelivered later.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Permanent failure. The delivery is dead-lettered without another attempt.
    #[error("non-retryable: {0}")]
    NonRetryable(String),
}

impl HandlerError {
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    pub fn non_retryable(msg: impl Into<String>) -> Self {
        Self::NonRetryable(msg.into())
    }
}

impl Classified for HandlerError {
    fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }
}
