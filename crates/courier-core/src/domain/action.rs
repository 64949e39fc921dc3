//! Action kinds: the closed routing vocabulary for dispatch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// ActionKind は message routing の key。
///
/// 閉じた enum なので、wire 上の未知の kind は envelope の deserialize で
/// 弾かれる。新しい message 種別を足すときはここに variant を追加し、
/// 対応する Handler を registry に登録する。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Admit a task record (gateway submission path).
    CreateTask,
    /// Long work that renews its lock while it makes progress.
    LongRunning,
    /// Reply published back to the caller's reply queue.
    Reply,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::CreateTask => "create_task",
            ActionKind::LongRunning => "long_running",
            ActionKind::Reply => "reply",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_uses_snake_case_names() {
        let json = serde_json::to_string(&ActionKind::CreateTask).unwrap();
        assert_eq!(json, "\"create_task\"");

        let kind: ActionKind = serde_json::from_str("\"long_running\"").unwrap();
        assert_eq!(kind, ActionKind::LongRunning);
    }

    #[test]
    fn unknown_kind_fails_to_deserialize() {
        let result = serde_json::from_str::<ActionKind>("\"delete_everything\"");
        assert!(result.is_err());
    }

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(ActionKind::Reply.to_string(), "reply");
        assert_eq!(ActionKind::CreateTask.as_str(), "create_task");
    }
}
