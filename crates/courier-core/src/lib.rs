//! courier-core
//!
//! Reliability core for the courier task pipeline: idempotent admission,
//! at-least-once delivery with leases, typed handler dispatch, and reply
//! correlation.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, action, envelope, task, errors）
//! - **ports**: 抽象化レイヤー（Broker, TaskStore, Clock, IdGenerator）
//! - **impls**: 開発用実装（InMemoryBroker, InMemoryTaskStore）
//! - **retry**: リトライポリシー（in-handler / outbound）
//! - **dispatch**: 型付き Action API（Action, Handler, HandlerRegistry, HandlerContext）
//! - **listener**: QueueListener（lease 消化、並行実行、graceful shutdown）
//! - **admission**: idempotency key による受付（Admitter）
//! - **reply**: request id による返信相関（ReplyRouter）
//! - **handlers**: 組み込みハンドラ（create_task, long_running）
//! - **app**: PipelineBuilder / Pipeline（構築とワイヤリング）

pub mod domain;
pub mod ports;
pub mod impls;
pub mod retry;
pub mod dispatch;
pub mod listener;
pub mod admission;
pub mod reply;
pub mod handlers;
pub mod app;
pub mod observability;
