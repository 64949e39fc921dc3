//! PipelineBuilder - パイプラインの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - expect_actions() で期待される ActionKind を並べる
//! - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
//! - 不足があれば BuildError を返して起動ごと止める。配送が来てから
//!   「handler がいない」と dead-letter の山を築くより、ここで落とす方が
//!   はるかに安い。

use std::sync::Arc;

use crate::admission::Admitter;
use crate::dispatch::{Action, Handler, HandlerRegistry, RegistryError};
use crate::domain::{ActionKind, QueueName};
use crate::listener::{ListenerConfig, QueueListener};
use crate::ports::{Broker, IdGenerator, SystemClock, TaskStore, UlidGenerator};
use crate::reply::ReplyRouter;

use super::pipeline::Pipeline;

/// Wires handlers, queues and loops into a running [`Pipeline`].
///
/// # 使用例
/// ```ignore
/// let pipeline = PipelineBuilder::new()
///     .register::<CreateTask, _>(CreateTaskHandler::new(store.clone()))?
///     .expect_actions(&[ActionKind::CreateTask])
///     .build(broker, store)?;
/// ```
pub struct PipelineBuilder {
    registry: HandlerRegistry,
    expected_actions: Option<Vec<ActionKind>>,
    work_queue: QueueName,
    reply_queue: QueueName,
    listener: ListenerConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers for action kinds: {0:?}")]
    MissingActions(Vec<ActionKind>),
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            expected_actions: None,
            work_queue: QueueName::new("work"),
            reply_queue: QueueName::new("replies"),
            listener: ListenerConfig::default(),
        }
    }

    /// Handler を登録
    pub fn register<A: Action, H: Handler<A> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<A, H>(handler)?;
        Ok(self)
    }

    /// 期待される ActionKind を設定。build() 時に登録漏れを検出する。
    pub fn expect_actions(mut self, kinds: &[ActionKind]) -> Self {
        self.expected_actions = Some(kinds.to_vec());
        self
    }

    pub fn work_queue(mut self, queue: QueueName) -> Self {
        self.work_queue = queue;
        self
    }

    pub fn reply_queue(mut self, queue: QueueName) -> Self {
        self.reply_queue = queue;
        self
    }

    pub fn listener_config(mut self, config: ListenerConfig) -> Self {
        self.listener = config;
        self
    }

    /// 検証してから配線する。listener と reply router はここで動き出す。
    pub fn build(
        self,
        broker: Arc<dyn Broker>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Pipeline, BuildError> {
        if let Some(expected) = &self.expected_actions {
            let registered = self.registry.registered_kinds();
            let missing: Vec<ActionKind> = expected
                .iter()
                .filter(|kind| !registered.contains(kind))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingActions(missing));
            }
        }

        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(SystemClock));
        let admitter = Admitter::new(
            Arc::clone(&store),
            Arc::clone(&broker),
            ids,
            self.work_queue.clone(),
        );
        let listener = QueueListener::start(
            self.work_queue,
            Arc::clone(&broker),
            Arc::new(self.registry),
            self.listener,
        );
        let router = ReplyRouter::start(Arc::clone(&broker), self.reply_queue.clone());

        Ok(Pipeline::new(
            broker,
            store,
            admitter,
            listener,
            router,
            self.reply_queue,
        ))
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
