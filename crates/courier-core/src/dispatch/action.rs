//! Action trait - 型付き Action の定義

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::ActionKind;

/// Action は ActionKind と payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct CreateTask {
///     idempotency_key: String,
/// }
///
/// impl Action for CreateTask {
///     const KIND: ActionKind = ActionKind::CreateTask;
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: envelope payload への書き出しのため
/// - `DeserializeOwned`: payload からの復元のため（'static に対応）
/// - `Send + Sync`: 複数スレッドから安全に使えるため
/// - `'static`: Arc に格納できるため（参照を持たない）
pub trait Action: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// この型が対応する action kind
    const KIND: ActionKind;
}
