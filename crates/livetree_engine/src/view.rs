//! Addressable views into the mirrored tree.

use crate::error::{EngineError, EngineResult};
use crate::session::Shared;
use crate::stream::ValueStream;
use crate::subscription::{WatchCallback, WatchEvent, WatchHandle, WatchOutcome};
use livetree_protocol::{KeyPath, PathKey, Value, ValueKind};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// An addressable view of one location in a session's mirror.
///
/// A view never owns data; it is a (path, session) handle. Reads and writes
/// go through the session synchronously. Views obtained repeatedly for the
/// same property share identity until the property's runtime type changes.
#[derive(Clone)]
pub struct TreeView {
    core: Arc<ViewCore>,
}

struct ViewCore {
    path: KeyPath,
    shared: Weak<Shared>,
}

impl TreeView {
    pub(crate) fn new(path: KeyPath, shared: Weak<Shared>) -> Self {
        Self {
            core: Arc::new(ViewCore { path, shared }),
        }
    }

    fn shared(&self) -> EngineResult<Arc<Shared>> {
        self.core.shared.upgrade().ok_or(EngineError::Destroyed)
    }

    /// The view's location, relative to the session root.
    pub fn path(&self) -> &KeyPath {
        &self.core.path
    }

    /// The view's absolute location in the remote store.
    pub fn reference(&self) -> EngineResult<KeyPath> {
        let shared = self.shared()?;
        Ok(shared.root_path.join(&self.core.path))
    }

    /// Returns true if both handles address the same memoized view.
    pub fn is_same(&self, other: &TreeView) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// A clone of the underlying value. Not live-synced; an escape hatch.
    pub fn snapshot(&self) -> EngineResult<Option<Value>> {
        self.shared()?.value_at(&self.core.path)
    }

    /// Returns true if the location currently holds a value.
    pub fn exists(&self) -> EngineResult<bool> {
        Ok(self.snapshot()?.is_some())
    }

    /// The runtime type of the value, if present.
    pub fn kind(&self) -> EngineResult<Option<ValueKind>> {
        Ok(self.snapshot()?.map(|value| value.kind()))
    }

    /// Number of children of a container value.
    pub fn len(&self) -> EngineResult<usize> {
        match self.snapshot()? {
            Some(Value::Map(map)) => Ok(map.len()),
            Some(Value::Seq(seq)) => Ok(seq.len()),
            _ => Err(EngineError::not_container(self.core.path.clone())),
        }
    }

    /// Returns true if a container value has no children.
    pub fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }

    /// The field names of a map value.
    pub fn keys(&self) -> EngineResult<Vec<String>> {
        match self.snapshot()? {
            Some(Value::Map(map)) => Ok(map.keys().cloned().collect()),
            _ => Err(EngineError::not_container(self.core.path.clone())),
        }
    }

    /// Reads a child property's raw value.
    pub fn get(&self, key: impl Into<PathKey>) -> EngineResult<Option<Value>> {
        self.shared()?.child_value(&self.core.path, key.into())
    }

    /// The memoized view of a child property.
    ///
    /// The same handle is returned for repeated access until the
    /// property's runtime type changes, which replaces the memo entry.
    pub fn child(&self, key: impl Into<PathKey>) -> EngineResult<TreeView> {
        self.shared()?.child_view(&self.core.path, key.into())
    }

    /// Writes a child property.
    ///
    /// The write lands in the mirror synchronously and schedules a remote
    /// flush; a scalar equal to the current scalar value is a no-op.
    pub fn set(&self, key: impl Into<PathKey>, value: impl Into<Value>) -> EngineResult<()> {
        self.shared()?
            .set_child(&self.core.path, key.into(), value.into())
    }

    /// Deletes a child property. Missing properties are a no-op.
    pub fn remove_key(&self, key: impl Into<PathKey>) -> EngineResult<Option<Value>> {
        self.shared()?.remove_child(&self.core.path, key.into())
    }

    /// Replaces this location's value wholesale.
    pub fn replace(&self, value: impl Into<Value>) -> EngineResult<()> {
        self.shared()?.replace_at(self.core.path.clone(), value.into())
    }

    /// Removes this location from its parent. The root view empties the
    /// whole mirror.
    pub fn remove(&self) -> EngineResult<()> {
        let shared = self.shared()?;
        match (self.core.path.parent(), self.core.path.last()) {
            (Some(parent), Some(key)) => {
                shared.remove_child(&parent, key.clone())?;
                Ok(())
            }
            _ => shared.replace_at(KeyPath::root(), Value::Null),
        }
    }

    /// Assigns `value` under a freshly generated key of a map container
    /// and returns the key.
    pub fn append(&self, value: impl Into<Value>) -> EngineResult<String> {
        self.shared()?.append_child(&self.core.path, value.into())
    }

    /// Appends to a sequence.
    pub fn push(&self, value: impl Into<Value>) -> EngineResult<()> {
        let value = value.into();
        self.shared()?
            .mutate_sequence(&self.core.path, move |seq| seq.push(value))
    }

    /// Removes and returns the last element of a sequence.
    pub fn pop(&self) -> EngineResult<Option<Value>> {
        self.shared()?.mutate_sequence(&self.core.path, Vec::pop)
    }

    /// Removes and returns the first element of a sequence.
    pub fn shift(&self) -> EngineResult<Option<Value>> {
        self.shared()?.mutate_sequence(&self.core.path, |seq| {
            if seq.is_empty() {
                None
            } else {
                Some(seq.remove(0))
            }
        })
    }

    /// Prepends to a sequence.
    pub fn unshift(&self, value: impl Into<Value>) -> EngineResult<()> {
        let value = value.into();
        self.shared()?
            .mutate_sequence(&self.core.path, move |seq| seq.insert(0, value))
    }

    /// Removes `remove_count` elements at `start` and inserts `items`
    /// there. Returns the removed elements. Out-of-range arguments clamp.
    pub fn splice(
        &self,
        start: usize,
        remove_count: usize,
        items: Vec<Value>,
    ) -> EngineResult<Vec<Value>> {
        self.shared()?.mutate_sequence(&self.core.path, move |seq| {
            let start = start.min(seq.len());
            let end = start.saturating_add(remove_count).min(seq.len());
            seq.splice(start..end, items).collect()
        })
    }

    /// Reorders a sequence by a comparator.
    pub fn sort_by(
        &self,
        compare: impl FnMut(&Value, &Value) -> Ordering,
    ) -> EngineResult<()> {
        let mut compare = compare;
        self.shared()?
            .mutate_sequence(&self.core.path, move |seq| seq.sort_by(&mut compare))
    }

    /// Inverts a sequence's order.
    pub fn reverse(&self) -> EngineResult<()> {
        self.shared()?
            .mutate_sequence(&self.core.path, |seq| seq.reverse())
    }

    /// Watches this subtree for changes, local and foreign alike.
    ///
    /// The callback observes the subtree's current and previous value and
    /// may cancel itself by returning [`WatchOutcome::Stop`].
    pub fn watch(
        &self,
        callback: impl Fn(WatchEvent) -> WatchOutcome + Send + Sync + 'static,
    ) -> EngineResult<WatchHandle> {
        self.watch_with(Arc::new(callback))
    }

    pub(crate) fn watch_with(&self, callback: WatchCallback) -> EngineResult<WatchHandle> {
        self.shared()?
            .register_watch(self.core.path.clone(), callback)
    }

    /// Opens a push-stream of this subtree's value: the current value
    /// first, then every subsequent value. Dropping the stream stops the
    /// underlying subscription.
    pub fn observe(&self) -> EngineResult<ValueStream> {
        ValueStream::open(self)
    }
}

impl From<&TreeView> for Value {
    /// Unwraps a view to its raw underlying value, never a live link.
    ///
    /// An absent location converts to `Value::Null`; a view of a destroyed
    /// session does too.
    fn from(view: &TreeView) -> Self {
        view.snapshot().ok().flatten().unwrap_or(Value::Null)
    }
}

impl std::fmt::Debug for TreeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeView")
            .field("path", &self.core.path.to_string())
            .finish()
    }
}

/// Identity cache of child views, keyed by absolute cache path.
///
/// An entry is reused while the value's runtime type matches its tag and
/// replaced when the type changed, so stale handles never alias a
/// differently shaped value.
#[derive(Default)]
pub(crate) struct ViewArena {
    entries: HashMap<KeyPath, ViewEntry>,
}

struct ViewEntry {
    kind: ValueKind,
    view: TreeView,
}

impl ViewArena {
    pub(crate) fn lookup(
        &mut self,
        cache: &Value,
        path: KeyPath,
        shared: &Weak<Shared>,
    ) -> TreeView {
        let kind = cache
            .get_path(&path)
            .map(Value::kind)
            .unwrap_or(ValueKind::Null);
        match self.entries.get(&path) {
            Some(entry) if entry.kind == kind => entry.view.clone(),
            _ => {
                let view = TreeView::new(path.clone(), shared.clone());
                self.entries.insert(
                    path,
                    ViewEntry {
                        kind,
                        view: view.clone(),
                    },
                );
                view
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
