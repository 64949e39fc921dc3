//! 標準アクションのハンドラ。
//!
//! どのハンドラも at-least-once 前提で書かれています。同じ配送が二度
//! 届いても、済んだタスクを巻き戻さず、外部への副作用を増やさないのが
//! ここでの約束です。

mod create_task;
mod long_running;

pub use create_task::{CreateTask, CreateTaskHandler};
pub use long_running::{LongRunning, LongRunningHandler};

use crate::domain::{HandlerError, TaskId, TaskPatch, TaskStatus};
use crate::ports::{TaskStore, UpdateOutcome};

/// Move `task_id` to `status` under optimistic concurrency, never
/// downgrading a terminal task. Returns the status the task ended up in,
/// which is `status` on a win and the terminal status on a lost race.
pub(crate) async fn set_status_checked(
    store: &dyn TaskStore,
    task_id: &TaskId,
    status: TaskStatus,
) -> Result<TaskStatus, HandlerError> {
    let Some((task, tag)) = store.get(task_id).await? else {
        return Err(HandlerError::non_retryable(format!(
            "task {task_id} not found"
        )));
    };

    if task.status.is_terminal() {
        // 遅れて届いた再配送。済んだものはそのまま。
        return Ok(task.status);
    }

    match store.update(task_id, &tag, TaskPatch::status(status)).await? {
        UpdateOutcome::Updated(_) => Ok(status),
        UpdateOutcome::PreconditionFailed(_) => {
            // 誰かが先に動かした。終端に達していればそれに従う。
            let Some((current, _)) = store.get(task_id).await? else {
                return Err(HandlerError::non_retryable(format!(
                    "task {task_id} not found"
                )));
            };
            if current.status.is_terminal() {
                Ok(current.status)
            } else {
                Err(HandlerError::retryable(format!(
                    "task {task_id} update contended"
                )))
            }
        }
        UpdateOutcome::NotFound => Err(HandlerError::non_retryable(format!(
            "task {task_id} not found"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IdempotencyKey, NewTask, Task, VersionTag};
    use crate::impls::InMemoryTaskStore;
    use crate::ports::{Admission, StoreError};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Arc;
    use ulid::Ulid;

    async fn store_with_task() -> (Arc<InMemoryTaskStore>, TaskId) {
        let store = Arc::new(InMemoryTaskStore::default());
        let admission = store
            .create_if_absent(
                &IdempotencyKey::new("k"),
                NewTask {
                    name: "t".into(),
                    payload: serde_json::json!({}),
                },
            )
            .await
            .unwrap();
        let task_id = admission.task_ref().task_id;
        (store, task_id)
    }

    #[tokio::test]
    async fn moves_a_live_task() {
        let (store, task_id) = store_with_task().await;

        let status = set_status_checked(store.as_ref(), &task_id, TaskStatus::Completed)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let (task, _) = store.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_status_is_not_downgraded() {
        let (store, task_id) = store_with_task().await;
        set_status_checked(store.as_ref(), &task_id, TaskStatus::Completed)
            .await
            .unwrap();

        let status = set_status_checked(store.as_ref(), &task_id, TaskStatus::Processing)
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Completed);

        let (task, _) = store.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn missing_task_is_permanent() {
        let store = InMemoryTaskStore::default();
        let err = set_status_checked(
            &store,
            &TaskId::from_ulid(Ulid::new()),
            TaskStatus::Completed,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandlerError::NonRetryable(_)));
    }

    /// update が常に PreconditionFailed を返す store。
    struct ContendedStore;

    #[async_trait]
    impl TaskStore for ContendedStore {
        async fn create_if_absent(
            &self,
            _key: &IdempotencyKey,
            _task: NewTask,
        ) -> Result<Admission, StoreError> {
            Err(StoreError::Backend("unused".into()))
        }

        async fn get(&self, task_id: &TaskId) -> Result<Option<(Task, VersionTag)>, StoreError> {
            Ok(Some((
                Task {
                    id: *task_id,
                    name: "t".into(),
                    payload: serde_json::json!({}),
                    status: TaskStatus::Processing,
                    created_at: Utc::now(),
                },
                VersionTag::fresh(),
            )))
        }

        async fn update(
            &self,
            _task_id: &TaskId,
            _expected: &VersionTag,
            _patch: TaskPatch,
        ) -> Result<UpdateOutcome, StoreError> {
            Ok(UpdateOutcome::PreconditionFailed(VersionTag::fresh()))
        }
    }

    #[tokio::test]
    async fn contended_update_is_retryable() {
        let store = ContendedStore;
        let err = set_status_checked(
            &store,
            &TaskId::from_ulid(Ulid::new()),
            TaskStatus::Completed,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HandlerError::Retryable(_)));
    }
}
