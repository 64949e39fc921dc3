//! Dispatch - 型付き Action API
//!
//! このモジュールは action kind と payload 型の対応を静的に保証します。
//! kind は閉じた enum（ActionKind）なので、文字列 typo はコンパイルで落ち、
//! 未知の kind は登録漏れとして実行時に一箇所で扱えます。
//!
//! # 二層構造
//! - **表層（Typed）**: `Action` trait, `Handler<A>` trait - 型安全
//! - **内部（Dyn）**: `DynHandler` trait - object-safe, type erasure

pub mod action;
pub mod context;
pub mod handler;
pub mod registry;

// 主要な trait/型 を再エクスポート
pub use self::action::Action;
pub use self::context::{HandlerContext, LeaseHandle};
pub use self::handler::{DispatchError, DynHandler, Handler, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
