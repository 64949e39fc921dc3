//! Broker port - at-least-once メッセージ輸送の抽象化
//!
//! Broker は lease 付きの受信を提供します。receive で受け取った配送は
//! lock が切れるまでこのコンシューマに貸し出され、complete / abandon /
//! dead_letter のいずれかで決着させます。lock が切れた配送はブローカーが
//! 回収し、delivery_count を増やして再配送します。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{MessageEnvelope, MessageId, QueueName};
use crate::observability::QueueCounts;

/// Broker operation errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The lease behind a settle or renew call is no longer current.
    /// このメッセージは既に再配送（または dead-letter）済み。
    #[error("lease lost for {message_id} (attempt {attempt})")]
    LeaseLost { message_id: MessageId, attempt: u32 },

    /// The broker is shut down.
    #[error("broker closed")]
    Closed,
}

/// Handle for extending a lease while its delivery is being processed.
#[async_trait]
pub trait RenewLock: Send + Sync {
    /// Extend the current lease and return the new expiry.
    async fn renew(&self) -> Result<Instant, BrokerError>;
}

pub type LockRenewer = Arc<dyn RenewLock>;

/// A leased message for processing.
/// The listener owns this lease and must settle it exactly once.
///
/// Design intent:
/// - Broker decides what happens after the lease (redeliver or dead-letter).
/// - Listener executes the handler and reports the result.
/// - `MessageEnvelope` is exposed as an immutable reference to avoid accidental mutation.
#[async_trait]
pub trait Delivery: Send {
    fn message_id(&self) -> MessageId;

    fn envelope(&self) -> &MessageEnvelope;

    /// Lease expiry as of receive. Renewals move it forward.
    fn locked_until(&self) -> Instant;

    /// How many times this message has been handed out, this delivery included.
    fn delivery_count(&self) -> u32;

    /// Renewal handle, safe to hold across await points.
    fn renewer(&self) -> LockRenewer;

    /// Mark success. The message is gone for good.
    async fn complete(self: Box<Self>) -> Result<(), BrokerError>;

    /// Give the message back for redelivery after a backoff.
    async fn abandon(self: Box<Self>) -> Result<(), BrokerError>;

    /// Park the message in the dead-letter area with a reason.
    async fn dead_letter(self: Box<Self>, reason: String) -> Result<(), BrokerError>;
}

/// Broker port (interface).
/// v1 is in-memory, but this trait is the seam for a real broker later.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish an envelope to a named queue.
    async fn send(
        &self,
        queue: &QueueName,
        envelope: MessageEnvelope,
    ) -> Result<MessageId, BrokerError>;

    /// Receive one leased delivery, waiting up to `wait`.
    /// Returns `Ok(None)` when nothing arrived in time.
    async fn receive(
        &self,
        queue: &QueueName,
        wait: Duration,
    ) -> Result<Option<Box<dyn Delivery>>, BrokerError>;

    /// Observability hook (optional but useful).
    async fn counts(&self, queue: &QueueName) -> QueueCounts;

    /// Reject further sends and wake blocked receivers.
    async fn close(&self);
}
