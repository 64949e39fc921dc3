//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! 各 trait は外部システム（メッセージブローカー、タスクストアなど）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore がタスクの正本（source of truth）
//! - Broker は at-least-once 配送（重複・再配送・順序入れ替わりは前提）
//! - 一度きりの効果はハンドラ + 冪等記録で畳み込む

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod task_store;

// 主要な trait を再エクスポート
pub use self::broker::{Broker, BrokerError, Delivery, LockRenewer, RenewLock};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{Admission, StoreError, TaskRef, TaskStore, UpdateOutcome};
