//! create_task アクション。
//!
//! 受理されたタスクを store に固定し、完了まで進めます。admission は
//! 冪等キーで first-writer-wins なので、同じ配送が何度届いても
//! タスクは一つに畳み込まれます。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispatch::{Action, Handler, HandlerContext};
use crate::domain::{ActionKind, HandlerError, IdempotencyKey, NewTask, TaskStatus};
use crate::ports::TaskStore;

use super::set_status_checked;

/// Payload of a `create_task` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTask {
    pub idempotency_key: IdempotencyKey,
    pub name: String,
    pub payload: serde_json::Value,
}

impl Action for CreateTask {
    const KIND: ActionKind = ActionKind::CreateTask;
}

pub struct CreateTaskHandler {
    store: Arc<dyn TaskStore>,
}

impl CreateTaskHandler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Handler<CreateTask> for CreateTaskHandler {
    async fn handle(
        &self,
        action: CreateTask,
        _ctx: &HandlerContext,
    ) -> Result<serde_json::Value, HandlerError> {
        // 再配送でも同じタスクに落ち着く
        let admission = self
            .store
            .create_if_absent(
                &action.idempotency_key,
                NewTask {
                    name: action.name,
                    payload: action.payload,
                },
            )
            .await?;
        let task_id = admission.task_ref().task_id;
        tracing::debug!(
            key = %action.idempotency_key,
            task_id = %task_id,
            created = admission.is_created(),
            "create_task admitted"
        );

        let status = set_status_checked(self.store.as_ref(), &task_id, TaskStatus::Completed).await?;

        Ok(serde_json::json!({
            "task_id": task_id,
            "status": status,
        }))
    }
}
