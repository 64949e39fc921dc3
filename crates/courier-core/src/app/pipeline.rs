//! Pipeline - 受理から返信までの表面
//!
//! 組み込み側（CLI やサービス）が触るのはこの型だけです。裏では
//! Admitter がキーで重複を畳み、QueueListener が work キューを回し、
//! ReplyRouter が返信を待ち手に配ります。

use std::sync::Arc;
use std::time::Duration;

use crate::admission::{Admitter, SubmitError, Ticket, TicketStatus};
use crate::domain::{IdempotencyKey, NewTask, QueueName};
use crate::listener::QueueListener;
use crate::observability::QueueCounts;
use crate::ports::{Broker, TaskStore};
use crate::reply::ReplyRouter;

/// Outcome of [`Pipeline::submit_and_wait`].
#[derive(Debug)]
pub enum Submission {
    /// Admitted, and the handler's reply came back in time.
    Replied {
        ticket: Ticket,
        reply: serde_json::Value,
    },
    /// Admitted, but no reply within the deadline. The work itself
    /// keeps going; poll the store for the task's fate.
    TimedOut { ticket: Ticket },
    /// The key was seen before. No new work, no reply.
    AlreadyProcessed { ticket: Ticket },
}

/// A wired, running pipeline. Dropping it without [`Pipeline::shutdown`]
/// leaves the background loops running until the runtime stops.
pub struct Pipeline {
    broker: Arc<dyn Broker>,
    store: Arc<dyn TaskStore>,
    admitter: Admitter,
    listener: QueueListener,
    router: ReplyRouter,
    reply_queue: QueueName,
}

impl Pipeline {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn TaskStore>,
        admitter: Admitter,
        listener: QueueListener,
        router: ReplyRouter,
        reply_queue: QueueName,
    ) -> Self {
        Self {
            broker,
            store,
            admitter,
            listener,
            router,
            reply_queue,
        }
    }

    /// Fire-and-forget submission. The ticket says whether new work was
    /// queued; progress is visible through the store.
    pub async fn submit(
        &self,
        key: &IdempotencyKey,
        task: NewTask,
    ) -> Result<Ticket, SubmitError> {
        self.admitter.submit(key, task, None).await
    }

    /// Submit and wait for the handler's reply, up to `timeout`.
    ///
    /// RequestId を登録してから publish するので、どんなに速い返信でも
    /// 取りこぼしません。重複キーだった場合は登録を外し、待たずに
    /// `AlreadyProcessed` を返します。
    pub async fn submit_and_wait(
        &self,
        key: &IdempotencyKey,
        task: NewTask,
        timeout: Duration,
    ) -> Result<Submission, SubmitError> {
        let request_id = self.admitter.next_request_id();
        let waiter = self.router.subscribe(request_id).await;

        let ticket = match self
            .admitter
            .submit(key, task, Some((&self.reply_queue, request_id)))
            .await
        {
            Ok(ticket) => ticket,
            Err(err) => {
                waiter.cancel().await;
                return Err(err);
            }
        };

        if ticket.status == TicketStatus::AlreadyProcessed {
            waiter.cancel().await;
            return Ok(Submission::AlreadyProcessed { ticket });
        }

        match waiter.wait(timeout).await {
            Ok(reply) => Ok(Submission::Replied { ticket, reply }),
            Err(err) => {
                tracing::debug!(request_id = %request_id, error = %err, "no reply in time");
                Ok(Submission::TimedOut { ticket })
            }
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub async fn counts(&self, queue: &QueueName) -> QueueCounts {
        self.broker.counts(queue).await
    }

    /// Stop taking work, join the loops, then close the broker.
    pub async fn shutdown(self) {
        self.listener.shutdown_and_join().await;
        self.router.shutdown_and_join().await;
        self.broker.close().await;
    }
}
