//! Handler trait - Action を実行する Handler の定義
//!
//! # 構成
//! - ジェネリック trait (Handler<A>)
//! - Object-safe trait (DynHandler)
//! - Type erasure パターン (TypedHandler<A, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;
use thiserror::Error;

use super::action::Action;
use super::context::HandlerContext;
use crate::domain::{ActionKind, Classified, HandlerError};

/// Failure on the way into or out of a handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Payload does not decode as the action's type. Permanent: the bytes
    /// will not get better on redelivery.
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: ActionKind,
        source: serde_json::Error,
    },

    /// No handler registered for the action. Permanent: the registry is
    /// fixed at startup, redelivery cannot change it.
    #[error("no handler registered for action '{0}'")]
    UnknownAction(ActionKind),

    /// The handler itself failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl Classified for DispatchError {
    fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Malformed { .. } | DispatchError::UnknownAction(_) => false,
            DispatchError::Handler(err) => err.is_retryable(),
        }
    }
}

/// Handler は Action を実行して reply body を返す
///
/// # 使用例
/// ```ignore
/// struct MyHandler;
///
/// #[async_trait]
/// impl Handler<MyAction> for MyHandler {
///     async fn handle(
///         &self,
///         action: MyAction,
///         _ctx: &HandlerContext,
///     ) -> Result<serde_json::Value, HandlerError> {
///         Ok(serde_json::json!({"ok": true}))
///     }
/// }
/// ```
///
/// # ジェネリクスによる型安全性
/// - `Handler<CreateTask>` は `CreateTask` しか受け取れない
/// - コンパイル時に Action と Handler の対応が保証される
///
/// Ok の値は（返信先が指定されていれば）そのまま返信の body になります。
#[async_trait]
pub trait Handler<A: Action>: Send + Sync {
    async fn handle(
        &self,
        action: A,
        ctx: &HandlerContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// DynHandler は object-safe な Handler の抽象化
///
/// TypedHandler<A, H> を DynHandler に変換することで、
/// HashMap<ActionKind, Arc<dyn DynHandler>> に格納可能にします。
///
/// # Object Safety
/// - メソッドはジェネリックではない（具体的な型のみ）
/// - `dyn DynHandler` として trait object にできる
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: HandlerContext,
    ) -> Result<serde_json::Value, DispatchError>;

    fn kind(&self) -> ActionKind;
}

pub struct TypedHandler<A: Action, H: Handler<A>> {
    handler: H,
    _marker: PhantomData<A>,
}

impl<A: Action, H: Handler<A>> TypedHandler<A, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<A: Action, H: Handler<A>> DynHandler for TypedHandler<A, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: HandlerContext,
    ) -> Result<serde_json::Value, DispatchError> {
        let action: A = serde_json::from_value(payload).map_err(|source| {
            DispatchError::Malformed {
                kind: A::KIND,
                source,
            }
        })?;
        Ok(self.handler.handle(action, &ctx).await?)
    }

    fn kind(&self) -> ActionKind {
        A::KIND
    }
}
