//! In-memory authoritative store with mutation fan-out.

use crate::error::{StoreError, StoreResult};
use livetree_protocol::{
    ChangeEntry, KeyPath, MutationEvent, Value, WriteContext, WriteKind, WriteOperation,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// The authoritative store.
///
/// The store maintains:
/// - The current tree value
/// - Per-path mutation subscribers
///
/// Writes apply atomically under one lock; every applied write produces a
/// single [`MutationEvent`] carrying one change entry per elementary change,
/// delivered to every subscriber whose subscribed path overlaps a change.
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    root: Value,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    path: KeyPath,
    sender: UnboundedSender<MutationEvent>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_value(Value::Null)
    }

    /// Creates a store seeded with a value.
    pub fn with_value(root: Value) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                root,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Reads the value at `path`. Returns `None` when the location is empty.
    pub fn read(&self, path: &KeyPath) -> Option<Value> {
        let inner = self.inner.lock();
        inner
            .root
            .get_path(path)
            .filter(|value| !value.is_null())
            .cloned()
    }

    /// Returns a clone of the whole store tree.
    pub fn snapshot(&self) -> Value {
        self.inner.lock().root.clone()
    }

    /// Applies a write and fans out the resulting mutation event.
    pub fn write(&self, operation: &WriteOperation, context: WriteContext) -> StoreResult<()> {
        let mut inner = self.inner.lock();

        let changes = match operation.kind {
            WriteKind::Overwrite => Self::apply_overwrite(&mut inner.root, operation),
            WriteKind::Merge => Self::apply_merge(&mut inner.root, operation)?,
        };

        debug!(
            path = %operation.path,
            kind = ?operation.kind,
            changes = changes.len(),
            "write applied"
        );

        if !changes.is_empty() {
            let event = MutationEvent::new(changes, Some(context));
            Self::fan_out(&mut inner.subscribers, &event);
        }

        Ok(())
    }

    /// Subscribes to mutation events touching the subtree at `path`.
    ///
    /// Dropping the receiver cancels the subscription; dead subscribers are
    /// pruned at the next fan-out.
    pub fn subscribe(&self, path: &KeyPath) -> UnboundedReceiver<MutationEvent> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner.lock().subscribers.push(Subscriber {
            path: path.clone(),
            sender,
        });
        receiver
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|sub| !sub.sender.is_closed());
        inner.subscribers.len()
    }

    fn apply_overwrite(root: &mut Value, operation: &WriteOperation) -> Vec<ChangeEntry> {
        let previous = root
            .get_path(&operation.path)
            .filter(|value| !value.is_null())
            .cloned();

        if operation.value.is_null() {
            root.delete_path(&operation.path);
            return match previous {
                Some(previous) => vec![ChangeEntry::removed(operation.path.clone(), previous)],
                None => Vec::new(),
            };
        }

        if previous.as_ref() == Some(&operation.value) {
            return Vec::new();
        }
        root.set_path(&operation.path, operation.value.clone());
        vec![ChangeEntry::set(
            operation.path.clone(),
            operation.value.clone(),
            previous,
        )]
    }

    fn apply_merge(root: &mut Value, operation: &WriteOperation) -> StoreResult<Vec<ChangeEntry>> {
        let partial = match &operation.value {
            Value::Map(map) => map.clone(),
            _ => {
                return Err(StoreError::InvalidMerge {
                    path: operation.path.clone(),
                })
            }
        };

        // Materialize the destination before merging into it.
        if root.get_path(&operation.path).is_none() {
            root.set_path(&operation.path, Value::empty_map());
        }
        let destination = match root.get_path_mut(&operation.path) {
            Some(destination) => destination,
            None => return Ok(Vec::new()),
        };

        let changed = destination.merge(partial);
        let merged = root.get_path(&operation.path);
        Ok(changed
            .into_iter()
            .map(|(key, previous)| {
                let new_value = merged
                    .and_then(|value| value.as_map())
                    .and_then(|map| map.get(&key))
                    .cloned();
                let child = operation.path.child(key);
                match new_value {
                    Some(new_value) => ChangeEntry::set(child, new_value, previous),
                    None => ChangeEntry::removed(child, previous.unwrap_or(Value::Null)),
                }
            })
            .collect())
    }

    fn fan_out(subscribers: &mut Vec<Subscriber>, event: &MutationEvent) {
        subscribers.retain(|sub| {
            let relevant = event
                .changes
                .iter()
                .any(|change| sub.path.on_same_chain(&change.path));
            if !relevant {
                return !sub.sender.is_closed();
            }
            sub.sender.send(event.clone()).is_ok()
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}
