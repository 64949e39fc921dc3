//! InMemoryTaskStore - テスト・開発用のタスク正本
//!
//! # 実装詳細
//! - 単一の Mutex で admission の check と insert を不可分にする
//! - admission 記録（key -> task_id）は作成後 read-only
//! - update はバージョンタグの check-and-set（タグは成功のたびに新しくなる）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{IdempotencyKey, NewTask, Task, TaskId, TaskPatch, TaskStatus, VersionTag};
use crate::ports::{
    Admission, Clock, IdGenerator, StoreError, SystemClock, TaskRef, TaskStore, UlidGenerator,
    UpdateOutcome,
};

/// Stored task plus its current version tag.
struct TaskRow {
    task: Task,
    tag: VersionTag,
}

#[derive(Default)]
struct StoreState {
    tasks: HashMap<TaskId, TaskRow>,
    /// First writer per idempotency key. Never rewritten.
    admissions: HashMap<IdempotencyKey, TaskId>,
}

/// In-memory TaskStore implementation.
pub struct InMemoryTaskStore {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    state: Mutex<StoreState>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            clock,
            ids,
            state: Mutex::new(StoreState::default()),
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(
            Arc::new(SystemClock),
            Arc::new(UlidGenerator::new(SystemClock)),
        )
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create_if_absent(
        &self,
        key: &IdempotencyKey,
        task: NewTask,
    ) -> Result<Admission, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(task_id) = state.admissions.get(key).copied() {
            // Replay: hand back the first writer's task at its current status.
            let Some(row) = state.tasks.get(&task_id) else {
                return Err(StoreError::Backend(format!(
                    "admission for key {key} points at a missing task"
                )));
            };
            return Ok(Admission::Existing(TaskRef {
                task_id,
                status: row.task.status,
            }));
        }

        let task_id = self.ids.generate_task_id();
        let row = TaskRow {
            task: Task {
                id: task_id,
                name: task.name,
                payload: task.payload,
                status: TaskStatus::Accepted,
                created_at: self.clock.now(),
            },
            tag: VersionTag::fresh(),
        };
        state.tasks.insert(task_id, row);
        state.admissions.insert(key.clone(), task_id);

        Ok(Admission::Created(TaskRef {
            task_id,
            status: TaskStatus::Accepted,
        }))
    }

    async fn get(&self, task_id: &TaskId) -> Result<Option<(Task, VersionTag)>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .get(task_id)
            .map(|row| (row.task.clone(), row.tag.clone())))
    }

    async fn update(
        &self,
        task_id: &TaskId,
        tag: &VersionTag,
        patch: TaskPatch,
    ) -> Result<UpdateOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let Some(row) = state.tasks.get_mut(task_id) else {
            return Ok(UpdateOutcome::NotFound);
        };
        if row.tag != *tag {
            return Ok(UpdateOutcome::PreconditionFailed(row.tag.clone()));
        }
        patch.apply(&mut row.task);
        row.tag = VersionTag::fresh();
        Ok(UpdateOutcome::Updated(row.tag.clone()))
    }
}
