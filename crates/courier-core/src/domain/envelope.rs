//! Message envelopes: what travels through the broker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::action::ActionKind;
use super::ids::RequestId;

/// Name of a broker queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Metadata key carrying the caller's correlation id.
pub const META_REQUEST_ID: &str = "request-id";

/// Metadata key naming the queue a reply should be published to.
pub const META_REPLY_TO: &str = "reply-to";

/// ActionKind + payload (+ metadata) の“運搬用”データ。
///
/// payload は serde_json::Value のまま運び、decode は handler 側で行う。
/// decode に失敗した payload は Malformed として dead-letter 行きになる。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    action: ActionKind,
    payload: serde_json::Value,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl MessageEnvelope {
    pub fn new(action: ActionKind, payload: serde_json::Value) -> Self {
        Self {
            action,
            payload,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn action(&self) -> ActionKind {
        self.action
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Correlation id, if the sender expects a reply.
    pub fn request_id(&self) -> Option<RequestId> {
        self.metadata
            .get(META_REQUEST_ID)
            .and_then(|s| RequestId::parse(s))
    }

    /// Queue the reply should go to, if any.
    pub fn reply_to(&self) -> Option<QueueName> {
        self.metadata
            .get(META_REPLY_TO)
            .map(|s| QueueName::new(s.as_str()))
    }
}

/// Reply payload correlated back to a waiting caller by request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub request_id: RequestId,
    pub result: serde_json::Value,
}

impl ReplyEnvelope {
    pub fn new(request_id: RequestId, result: serde_json::Value) -> Self {
        Self { request_id, result }
    }

    /// Wrap into a broker message for the reply queue.
    pub fn into_message(self) -> Result<MessageEnvelope, serde_json::Error> {
        let payload = serde_json::to_value(&self)?;
        Ok(MessageEnvelope::new(ActionKind::Reply, payload))
    }

    /// Decode from a reply-queue message.
    pub fn from_message(envelope: &MessageEnvelope) -> Result<Self, serde_json::Error> {
        serde_json::from_value(envelope.payload().clone())
    }
}
