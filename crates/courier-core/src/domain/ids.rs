//! Domain identifiers (strongly-typed IDs).
//!
//! # ULID ベースの ID + ジェネリック実装
//! ULID は timestamp が先頭にあるため生成順でソートでき、調整なしで
//! 複数ノードから生成できます。`Id<T>` というジェネリック型で共通実装を
//! 提供しつつ、`T` は実行時には使わない（PhantomData）マーカー型として
//! コンパイル時の型安全性を提供します。TaskId と MessageId を取り違える
//! コードはコンパイルが通りません。
//!
//! RequestId は metadata（文字列 map）を経由して運ばれるため、Display と
//! `parse` で文字列表現を往復できるようにしています。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
///
/// Display で使うプレフィックス（"task-", "msg-", "req-"）を提供します。
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` は PhantomData で、実行時にはメモリを消費しませんが、
/// コンパイル時に型安全性を提供します。
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// ULID から Id を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    /// 内部の ULID を取得
    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }

    /// Display 表現（プレフィックス付き、または素の ULID）から復元する。
    ///
    /// metadata の値など、文字列としてしか運べない経路のための逆変換。
    pub fn parse(s: &str) -> Option<Self> {
        let raw = s.strip_prefix(T::prefix()).unwrap_or(s);
        Ulid::from_string(raw).ok().map(Self::from_ulid)
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

/// Task のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Message のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Message {}

impl IdMarker for Message {
    fn prefix() -> &'static str {
        "msg-"
    }
}

/// Request のマーカー型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Request {}

impl IdMarker for Request {
    fn prefix() -> &'static str {
        "req-"
    }
}

// ========================================
// Type Alias（使いやすさのため）
// ========================================

/// Identifier of a Task (the unit the store tracks).
pub type TaskId = Id<Task>;

/// Identifier of a Message (one broker entry; stable across redeliveries).
pub type MessageId = Id<Message>;

/// Identifier of a Request (correlation key for replies).
pub type RequestId = Id<Request>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_distinct_types() {
        let ulid1 = Ulid::new();
        let ulid2 = Ulid::new();
        let ulid3 = Ulid::new();

        let task = TaskId::from_ulid(ulid1);
        let message = MessageId::from_ulid(ulid2);
        let request = RequestId::from_ulid(ulid3);

        assert_eq!(task.as_ulid(), ulid1);
        assert_eq!(message.as_ulid(), ulid2);
        assert_eq!(request.as_ulid(), ulid3);

        // Display のプレフィックスが正しいことを確認
        assert!(task.to_string().starts_with("task-"));
        assert!(message.to_string().starts_with("msg-"));
        assert!(request.to_string().starts_with("req-"));

        // The whole point: you can't accidentally mix these types.
        // (This is a compile-time property, so we just keep it as a comment.)
        // let _: TaskId = message; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        // ULID は時刻ベースなので、生成順序でソート可能
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id3 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
        assert!(id2 < id3);
        assert!(id1 < id3);
    }

    #[test]
    fn ulid_ids_can_be_serialized() {
        let task_id = TaskId::from_ulid(Ulid::new());

        let serialized = serde_json::to_string(&task_id).unwrap();
        let deserialized: TaskId = serde_json::from_str(&serialized).unwrap();

        assert_eq!(task_id, deserialized);
    }

    #[test]
    fn display_and_parse_roundtrip() {
        let request = RequestId::from_ulid(Ulid::new());

        let displayed = request.to_string();
        let parsed = RequestId::parse(&displayed);
        assert_eq!(parsed, Some(request));

        // 素の ULID 文字列も受け付ける
        let bare = request.as_ulid().to_string();
        assert_eq!(RequestId::parse(&bare), Some(request));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(RequestId::parse("not-a-ulid"), None);
        // 別プレフィックスの ID は素の ULID としても読めない
        let task = TaskId::from_ulid(Ulid::new());
        assert_eq!(RequestId::parse(&task.to_string()), None);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;

        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
        assert_eq!(size_of::<MessageId>(), size_of::<Ulid>());
        assert_eq!(size_of::<RequestId>(), size_of::<Ulid>());
        assert_eq!(size_of::<Ulid>(), 16);
    }
}
