//! Write operations and mutation event envelopes.

use crate::path::KeyPath;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one live mirror session.
///
/// Stamped into the context of every write a session issues, and used to
/// recognize mutation events the session itself caused.
pub type SessionId = Uuid;

/// How a write applies at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    /// Replace the destination value wholesale.
    Overwrite,
    /// Shallow-merge a partial map into the destination; a null entry
    /// deletes that child.
    Merge,
}

/// Traceability context carried by every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteContext {
    /// The issuing session.
    pub session_id: SessionId,
    /// Shared by all writes of one flush.
    pub batch_id: u64,
    /// Position of this write within its batch.
    pub write_id: u64,
}

impl WriteContext {
    /// Creates a context for one write of a batch.
    pub fn new(session_id: SessionId, batch_id: u64, write_id: u64) -> Self {
        Self {
            session_id,
            batch_id,
            write_id,
        }
    }
}

/// A single write against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteOperation {
    /// Destination, relative to the store root.
    pub path: KeyPath,
    /// The value to apply. For `Merge` this is a partial map.
    pub value: Value,
    /// How the value applies.
    pub kind: WriteKind,
}

impl WriteOperation {
    /// Creates an overwrite of `path`.
    pub fn overwrite(path: KeyPath, value: Value) -> Self {
        Self {
            path,
            value,
            kind: WriteKind::Overwrite,
        }
    }

    /// Creates a merge into `path`.
    pub fn merge(path: KeyPath, partial: Value) -> Self {
        Self {
            path,
            value: partial,
            kind: WriteKind::Merge,
        }
    }
}

/// One elementary change inside a mutation event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// The changed location, relative to the store root.
    pub path: KeyPath,
    /// Value after the change. `None` means the location was removed.
    pub new_value: Option<Value>,
    /// Value before the change. `None` means the location did not exist.
    pub previous_value: Option<Value>,
}

impl ChangeEntry {
    /// Creates an entry for a set/update.
    pub fn set(path: KeyPath, new_value: Value, previous_value: Option<Value>) -> Self {
        Self {
            path,
            new_value: Some(new_value),
            previous_value,
        }
    }

    /// Creates an entry for a removal.
    pub fn removed(path: KeyPath, previous_value: Value) -> Self {
        Self {
            path,
            new_value: None,
            previous_value: Some(previous_value),
        }
    }
}

/// A mutation notification fanned out by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEvent {
    /// The elementary changes of one applied write.
    pub changes: Vec<ChangeEntry>,
    /// The context of the write that caused the changes, when known.
    pub context: Option<WriteContext>,
}

impl MutationEvent {
    /// Creates an event from a change list and an optional write context.
    pub fn new(changes: Vec<ChangeEntry>, context: Option<WriteContext>) -> Self {
        Self { changes, context }
    }

    /// Returns true if the event was caused by the given session's own write.
    pub fn is_from(&self, session_id: SessionId) -> bool {
        self.context
            .map(|context| context.session_id == session_id)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_constructors() {
        let path: KeyPath = "chat1.title".parse().unwrap();
        let op = WriteOperation::overwrite(path.clone(), Value::text("hello"));
        assert_eq!(op.kind, WriteKind::Overwrite);

        let op = WriteOperation::merge(path, Value::map([("title", Value::text("hi"))]));
        assert_eq!(op.kind, WriteKind::Merge);
    }

    #[test]
    fn event_origin_check() {
        let mine = Uuid::new_v4();
        let theirs = Uuid::new_v4();

        let event = MutationEvent::new(vec![], Some(WriteContext::new(mine, 1, 0)));
        assert!(event.is_from(mine));
        assert!(!event.is_from(theirs));

        // Events with no context are never self-caused.
        let event = MutationEvent::new(vec![], None);
        assert!(!event.is_from(mine));
    }

    #[test]
    fn change_entry_shapes() {
        let path: KeyPath = "a.b".parse().unwrap();
        let set = ChangeEntry::set(path.clone(), Value::Integer(2), Some(Value::Integer(1)));
        assert_eq!(set.new_value, Some(Value::Integer(2)));

        let removed = ChangeEntry::removed(path, Value::Integer(2));
        assert_eq!(removed.new_value, None);
        assert_eq!(removed.previous_value, Some(Value::Integer(2)));
    }
}
