//! long_running アクション。
//!
//! 下流 API をスライス単位で何度も呼ぶ、時間のかかる仕事です。
//! 下流呼び出しは RetryingCaller が 429/5xx/timeout を吸収し、
//! それでも失敗したものだけがここに上がってきます。lease より長く
//! かかる場合は `renew_lock` を立てておくと、スライスの区切りで
//! ロックを延長します。
//!
//! 下流から見ると呼び出しは at-least-once です。再配送された場合、
//! 完了済みタスクなら何もしませんが、道半ばのタスクはスライスを
//! 最初からやり直します。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispatch::{Action, Handler, HandlerContext};
use crate::domain::{ActionKind, Classified, HandlerError, TaskId, TaskStatus};
use crate::ports::TaskStore;
use crate::retry::RetryingCaller;

use super::set_status_checked;

/// Payload of a `long_running` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongRunning {
    pub task_id: TaskId,
    /// How many downstream calls to make.
    pub slices: u32,
    /// Pause between slices, in milliseconds.
    #[serde(default)]
    pub slice_ms: u64,
    /// Extend the lease after each slice.
    #[serde(default)]
    pub renew_lock: bool,
}

impl Action for LongRunning {
    const KIND: ActionKind = ActionKind::LongRunning;
}

pub struct LongRunningHandler {
    store: Arc<dyn TaskStore>,
    caller: RetryingCaller,
}

impl LongRunningHandler {
    pub fn new(store: Arc<dyn TaskStore>, caller: RetryingCaller) -> Self {
        Self { store, caller }
    }
}

#[async_trait]
impl Handler<LongRunning> for LongRunningHandler {
    async fn handle(
        &self,
        action: LongRunning,
        ctx: &HandlerContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let Some((task, _)) = self.store.get(&action.task_id).await? else {
            return Err(HandlerError::non_retryable(format!(
                "task {} not found",
                action.task_id
            )));
        };

        if task.status.is_terminal() {
            // 前回の実行が完了まで到達している再配送。何もしない。
            tracing::debug!(task_id = %action.task_id, "already completed; skipping");
            return Ok(serde_json::json!({
                "task_id": action.task_id,
                "status": task.status,
                "slices_done": 0,
            }));
        }

        set_status_checked(self.store.as_ref(), &action.task_id, TaskStatus::Processing).await?;

        for slice in 0..action.slices {
            let body = serde_json::json!({
                "task_id": action.task_id,
                "slice": slice,
                "of": action.slices,
            });
            self.caller.call(&body).await.map_err(|err| {
                if err.is_retryable() {
                    HandlerError::retryable(err.to_string())
                } else {
                    HandlerError::non_retryable(err.to_string())
                }
            })?;

            if action.slice_ms > 0 {
                tokio::time::sleep(Duration::from_millis(action.slice_ms)).await;
            }
            if action.renew_lock {
                ctx.renew_lock()
                    .await
                    .map_err(|err| HandlerError::retryable(err.to_string()))?;
            }
        }

        let status =
            set_status_checked(self.store.as_ref(), &action.task_id, TaskStatus::Completed).await?;

        Ok(serde_json::json!({
            "task_id": action.task_id,
            "status": status,
            "slices_done": action.slices,
        }))
    }
}
