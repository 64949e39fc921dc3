//! HandlerRegistry - Handler の登録と管理
//!
//! # 構成
//! - HashMap での型消去された trait object の管理
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::HashMap;
use std::sync::Arc;

use super::action::Action;
use super::handler::{DynHandler, Handler, TypedHandler};
use crate::domain::ActionKind;

/// RegistryError は HandlerRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for action kind '{0}' is already registered")]
    AlreadyRegistered(ActionKind),
}

/// HandlerRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<CreateTask, _>(CreateTaskHandler::new(store))?;
///
/// // ActionKind で DynHandler を取得
/// let handler = registry.get(ActionKind::CreateTask);
/// ```
///
/// # 内部実装
/// - `register::<A: Action>(handler: impl Handler<A>)` で登録
/// - 内部的に TypedHandler でラップして DynHandler に変換
/// - HashMap<ActionKind, Arc<dyn DynHandler>> で管理
pub struct HandlerRegistry {
    handlers: HashMap<ActionKind, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<A: Action, H: Handler<A> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&A::KIND) {
            return Err(RegistryError::AlreadyRegistered(A::KIND));
        }
        let typed_handler = TypedHandler::new(handler);
        self.handlers.insert(A::KIND, Arc::new(typed_handler));
        Ok(())
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn registered_kinds(&self) -> Vec<ActionKind> {
        self.handlers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::HandlerContext;
    use crate::domain::HandlerError;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping;

    impl Action for Ping {
        const KIND: ActionKind = ActionKind::CreateTask;
    }

    #[derive(Serialize, Deserialize)]
    struct Pong;

    impl Action for Pong {
        const KIND: ActionKind = ActionKind::LongRunning;
    }

    struct Quiet;

    #[async_trait]
    impl Handler<Ping> for Quiet {
        async fn handle(
            &self,
            _action: Ping,
            _ctx: &HandlerContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::json!(null))
        }
    }

    #[async_trait]
    impl Handler<Pong> for Quiet {
        async fn handle(
            &self,
            _action: Pong,
            _ctx: &HandlerContext,
        ) -> Result<serde_json::Value, HandlerError> {
            Ok(serde_json::json!(null))
        }
    }

    #[test]
    fn register_and_get_roundtrip() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Ping, _>(Quiet).unwrap();

        assert!(registry.get(ActionKind::CreateTask).is_some());
        assert!(registry.get(ActionKind::LongRunning).is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<Ping, _>(Quiet).unwrap();

        let result = registry.register::<Ping, _>(Quiet);
        assert!(matches!(
            result,
            Err(RegistryError::AlreadyRegistered(ActionKind::CreateTask))
        ));
    }

    #[test]
    fn registered_kinds_lists_everything() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());

        registry.register::<Ping, _>(Quiet).unwrap();
        registry.register::<Pong, _>(Quiet).unwrap();

        let mut kinds = registry.registered_kinds();
        kinds.sort_by_key(|k| k.as_str());
        assert_eq!(kinds, vec![ActionKind::CreateTask, ActionKind::LongRunning]);
        assert_eq!(registry.len(), 2);
    }
}
