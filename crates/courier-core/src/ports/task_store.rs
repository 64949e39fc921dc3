//! TaskStore port - タスクの正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスク本体（Task）とそのバージョンタグ
//! - 冪等キーによる admission 記録
//!
//! # 設計原則
//! - create_if_absent は first-writer-wins（同じキーの二度目以降は初回の記録を返す）
//! - update はバージョンタグによる check-and-set
//! - Broker の再配送が何度来ても、ここの記録で一度きりの効果に畳み込む

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{
    HandlerError, IdempotencyKey, NewTask, Task, TaskId, TaskPatch, TaskStatus, VersionTag,
};

/// Store operation errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend failure (I/O, connection, ...).
    #[error("store backend: {0}")]
    Backend(String),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        // Backend failures are transient: abandon and let redelivery retry.
        HandlerError::Retryable(err.to_string())
    }
}

/// Pointer to a stored task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// Result of `create_if_absent`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First writer: a new task was stored.
    Created(TaskRef),
    /// The key was seen before: the record from the first write.
    Existing(TaskRef),
}

impl Admission {
    pub fn task_ref(&self) -> &TaskRef {
        match self {
            Admission::Created(r) | Admission::Existing(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Admission::Created(_))
    }
}

/// Result of a check-and-set `update`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Applied. Carries the tag for the next update.
    Updated(VersionTag),
    /// No task with that id.
    NotFound,
    /// The supplied tag is stale. Carries the current one.
    PreconditionFailed(VersionTag),
}

/// TaskStore はタスクと admission 記録の正本
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Admit a task under an idempotency key. First writer wins; later
    /// calls with the same key return the originally stored record.
    async fn create_if_absent(
        &self,
        key: &IdempotencyKey,
        task: NewTask,
    ) -> Result<Admission, StoreError>;

    /// Fetch a task together with its current version tag.
    async fn get(&self, task_id: &TaskId) -> Result<Option<(Task, VersionTag)>, StoreError>;

    /// Check-and-set update. Applies `patch` only while `tag` is current.
    async fn update(
        &self,
        task_id: &TaskId,
        tag: &VersionTag,
        patch: TaskPatch,
    ) -> Result<UpdateOutcome, StoreError>;
}
