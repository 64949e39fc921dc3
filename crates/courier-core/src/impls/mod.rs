//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryBroker**: lease / 再配送 / dead-letter まで備えた開発用ブローカー
//! - **InMemoryTaskStore**: 冪等 admission と check-and-set を備えた正本
//!
//! # 本番用実装
//! 本番用の実装は別クレートに配置します（Service Bus / SQS 相当のブローカー、
//! RDB のタスクストアなど）。ここの実装は同じ配送セマンティクスを単一
//! プロセスで再現するためのものです。

pub mod memory_broker;
pub mod memory_store;

// 主要な型を再エクスポート
pub use self::memory_broker::{BrokerConfig, DeadLetter, InMemoryBroker};
pub use self::memory_store::InMemoryTaskStore;
