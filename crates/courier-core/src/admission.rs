//! 入口の冪等受理。
//!
//! 呼び出し側は仕事を IdempotencyKey 付きで差し出します。初回だけ
//! タスクを作ってキューに積み、同じキーの再送には既存のタスクを指す
//! 受付票を返します（キューには積まない）。broker が落ちていても
//! タスク行は残るので、再送すれば同じ票が返ります。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::dispatch::Action;
use crate::domain::{
    IdempotencyKey, META_REPLY_TO, META_REQUEST_ID, MessageEnvelope, NewTask, QueueName,
    RequestId, TaskId,
};
use crate::handlers::CreateTask;
use crate::ports::{Admission, Broker, BrokerError, IdGenerator, StoreError, TaskStore};

/// 受付票。submit の結果として呼び出し側に返るもの。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub task_id: TaskId,
    pub status: TicketStatus,
    /// Set when a reply was requested; correlates the eventual reply.
    pub request_id: Option<RequestId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    /// First time this key was seen. The task is queued.
    Accepted,
    /// The key was seen before. Nothing was queued.
    AlreadyProcessed,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to encode submission: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Front door: dedupes on the idempotency key, then enqueues.
pub struct Admitter {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    ids: Arc<dyn IdGenerator>,
    work_queue: QueueName,
}

impl Admitter {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        ids: Arc<dyn IdGenerator>,
        work_queue: QueueName,
    ) -> Self {
        Self {
            store,
            broker,
            ids,
            work_queue,
        }
    }

    pub fn next_request_id(&self) -> RequestId {
        self.ids.generate_request_id()
    }

    /// Admit `task` under `key`. Publishes a `create_task` message on first
    /// admission only; a replayed key returns a ticket for the existing task.
    ///
    /// `reply_to` に (キュー, RequestId) を渡すと、成功時の返信が
    /// そのキューに届くようメタデータを積みます。
    pub async fn submit(
        &self,
        key: &IdempotencyKey,
        task: NewTask,
        reply_to: Option<(&QueueName, RequestId)>,
    ) -> Result<Ticket, SubmitError> {
        let admission = self.store.create_if_absent(key, task.clone()).await?;

        let created = match admission {
            Admission::Created(task_ref) => task_ref,
            Admission::Existing(task_ref) => {
                tracing::debug!(
                    key = %key,
                    task_id = %task_ref.task_id,
                    "duplicate submission; returning the existing task"
                );
                return Ok(Ticket {
                    task_id: task_ref.task_id,
                    status: TicketStatus::AlreadyProcessed,
                    request_id: None,
                });
            }
        };

        let action = CreateTask {
            idempotency_key: key.clone(),
            name: task.name,
            payload: task.payload,
        };
        let mut envelope = MessageEnvelope::new(CreateTask::KIND, serde_json::to_value(&action)?);
        let request_id = if let Some((reply_queue, request_id)) = reply_to {
            envelope = envelope
                .with_metadata(META_REQUEST_ID, request_id.to_string())
                .with_metadata(META_REPLY_TO, reply_queue.as_str());
            Some(request_id)
        } else {
            None
        };

        let message_id = self.broker.send(&self.work_queue, envelope).await?;
        tracing::debug!(
            key = %key,
            task_id = %created.task_id,
            message_id = %message_id,
            "task admitted and queued"
        );

        Ok(Ticket {
            task_id: created.task_id,
            status: TicketStatus::Accepted,
            request_id,
        })
    }
}
