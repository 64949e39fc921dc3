//! Domain model (IDs, action kinds, envelopes, task records, errors).

pub mod action;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod task;

pub use self::action::ActionKind;
pub use self::envelope::{MessageEnvelope, QueueName, ReplyEnvelope, META_REPLY_TO, META_REQUEST_ID};
pub use self::errors::{Classified, HandlerError};
pub use self::ids::{MessageId, RequestId, TaskId};
pub use self::task::{IdempotencyKey, NewTask, Task, TaskPatch, TaskStatus, VersionTag};
