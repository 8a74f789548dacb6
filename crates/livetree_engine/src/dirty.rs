//! Dirty-target coalescing and the per-window mutation log.

use livetree_protocol::{KeyPath, PathKey, Value, WriteOperation};

/// The set of targets needing a remote write, in first-dirtied order.
///
/// Invariant: no two entries are in an ancestor/descendant relationship.
/// Inserting an ancestor removes its descendants; inserting under an
/// existing ancestor is a no-op.
#[derive(Debug, Default)]
pub(crate) struct DirtyQueue {
    targets: Vec<KeyPath>,
}

impl DirtyQueue {
    /// Inserts a target under the ancestor-subsumption invariant.
    pub(crate) fn insert(&mut self, target: KeyPath) {
        if self.targets.iter().any(|existing| existing.contains(&target)) {
            return;
        }
        self.targets.retain(|existing| !target.contains(existing));
        self.targets.push(target);
    }

    /// Takes every queued target, leaving the queue empty.
    pub(crate) fn drain(&mut self) -> Vec<KeyPath> {
        std::mem::take(&mut self.targets)
    }

    /// Returns true if nothing is queued.
    pub(crate) fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Drops every queued target.
    pub(crate) fn clear(&mut self) {
        self.targets.clear();
    }
}

/// One dirtied target and its value prior to the first change of the window.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MutationRecord {
    pub(crate) target: KeyPath,
    pub(crate) previous: Option<Value>,
}

/// Per-window log of dirtied targets, deduplicated by target.
///
/// The first touch of a target captures its pre-change value; later touches
/// of the same target within the window leave the captured value alone.
#[derive(Debug, Default)]
pub(crate) struct MutationLog {
    records: Vec<MutationRecord>,
}

impl MutationLog {
    /// Records a touch of `target` with its current (pre-change) value.
    pub(crate) fn touch(&mut self, target: &KeyPath, previous: Option<Value>) {
        if self.records.iter().any(|record| &record.target == target) {
            return;
        }
        self.records.push(MutationRecord {
            target: target.clone(),
            previous,
        });
    }

    /// Takes every record, leaving the log empty.
    pub(crate) fn drain(&mut self) -> Vec<MutationRecord> {
        std::mem::take(&mut self.records)
    }

    /// Drops every record.
    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }
}

/// Collapses a mutation path to its dirty target.
///
/// A path through a sequence index dirties the nearest enclosing sequence
/// root, because remote addressing treats sequences as atomic values. Paths
/// without indices dirty the exact location.
pub(crate) fn dirty_target_for(path: &KeyPath) -> KeyPath {
    match path.first_index_position() {
        Some(position) => path.truncated(position),
        None => path.clone(),
    }
}

/// Converts drained dirty targets into an ordered batch of remote writes.
///
/// A dirtied root becomes a single overwrite of the whole mirrored value.
/// Other targets are grouped by parent, one merge per distinct parent,
/// carrying the dirtied children's values read from the cache now — not at
/// dirty time (last-write-wins within the batching window). A missing child
/// becomes a null merge entry, which deletes it remotely.
pub(crate) fn build_batch(
    root_path: &KeyPath,
    cache: &Value,
    targets: Vec<KeyPath>,
) -> Vec<WriteOperation> {
    if targets.iter().any(KeyPath::is_root) {
        // Subsumption leaves a dirty root as the only entry.
        return vec![WriteOperation::overwrite(root_path.clone(), cache.clone())];
    }

    let mut groups: Vec<(KeyPath, Vec<(String, Option<Value>)>)> = Vec::new();
    let mut singles = Vec::new();
    for target in targets {
        let value = cache
            .get_path(&target)
            .filter(|value| !value.is_null())
            .cloned();
        let (parent, key) = match (target.parent(), target.last()) {
            (Some(parent), Some(PathKey::Field(name))) => (parent, name.clone()),
            _ => {
                // A target ending in an index cannot join a merge group.
                singles.push(WriteOperation::overwrite(
                    root_path.join(&target),
                    value.unwrap_or(Value::Null),
                ));
                continue;
            }
        };

        match groups.iter_mut().find(|(group, _)| *group == parent) {
            Some((_, children)) => children.push((key, value)),
            None => groups.push((parent, vec![(key, value)])),
        }
    }

    let mut batch: Vec<WriteOperation> = groups
        .into_iter()
        .map(|(parent, children)| {
            let partial = Value::map(
                children
                    .into_iter()
                    .map(|(key, value)| (key, value.unwrap_or(Value::Null))),
            );
            WriteOperation::merge(root_path.join(&parent), partial)
        })
        .collect();
    batch.extend(singles);
    batch
}
