//! Subtree subscriptions.

use crate::session::{MutationOrigin, Shared};
use livetree_protocol::{KeyPath, Value};
use std::sync::{Arc, Weak};

/// A change delivered to a subtree subscription callback.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    /// The watched subtree's value after the change. `None` when absent.
    pub current: Option<Value>,
    /// The watched subtree's value before the first change of the window.
    pub previous: Option<Value>,
    /// Where the change came from.
    pub origin: MutationOrigin,
}

impl WatchEvent {
    /// Returns true if the change did not originate from this session.
    pub fn is_remote(&self) -> bool {
        self.origin.is_remote()
    }
}

/// What a watch callback wants to happen to its own subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchOutcome {
    /// Keep the subscription.
    #[default]
    Continue,
    /// Cancel the subscription.
    Stop,
}

pub(crate) type WatchCallback = Arc<dyn Fn(WatchEvent) -> WatchOutcome + Send + Sync>;

/// Cancellation handle of one subtree subscription.
///
/// Dropping the handle leaves the subscription running; only `stop` (or the
/// callback returning [`WatchOutcome::Stop`], or session destruction)
/// cancels it.
#[derive(Clone)]
pub struct WatchHandle {
    id: u64,
    shared: Weak<Shared>,
}

impl WatchHandle {
    pub(crate) fn new(id: u64, shared: Weak<Shared>) -> Self {
        Self { id, shared }
    }

    /// Cancels the subscription. Idempotent.
    pub fn stop(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.stop_watch(self.id);
        }
    }

    /// Returns true if the subscription is still registered.
    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.watch_is_active(self.id))
            .unwrap_or(false)
    }
}

struct Entry {
    id: u64,
    target: KeyPath,
    callback: WatchCallback,
    /// Staged pre-window snapshot; outer `None` = nothing staged yet,
    /// inner `None` = the subtree was absent when staged.
    staged: Option<Option<Value>>,
}

/// Registry of subtree subscriptions for one session.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: Vec<Entry>,
    next_id: u64,
}

/// A delivery prepared under the session lock, invoked after it is released.
pub(crate) struct PendingDelivery {
    pub(crate) id: u64,
    pub(crate) callback: WatchCallback,
    pub(crate) event: WatchEvent,
}

impl SubscriptionRegistry {
    pub(crate) fn register(&mut self, target: KeyPath, callback: WatchCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(Entry {
            id,
            target,
            callback,
            staged: None,
        });
        id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Stages pre-change snapshots for subscriptions the dirtied target is
    /// relevant to. Only the first relevant change of a window stages.
    pub(crate) fn stage_for(&mut self, target: &KeyPath, cache: &Value) {
        for entry in &mut self.entries {
            if entry.staged.is_none() && entry.target.on_same_chain(target) {
                entry.staged = Some(subtree(cache, &entry.target));
            }
        }
    }

    /// Prepares local-window deliveries for the drained record targets,
    /// consuming staged snapshots.
    pub(crate) fn take_window_deliveries(
        &mut self,
        targets: &[KeyPath],
        cache: &Value,
    ) -> Vec<PendingDelivery> {
        let mut deliveries = Vec::new();
        for entry in &mut self.entries {
            if !targets.iter().any(|target| entry.target.on_same_chain(target)) {
                continue;
            }
            let previous = entry.staged.take().flatten();
            deliveries.push(PendingDelivery {
                id: entry.id,
                callback: Arc::clone(&entry.callback),
                event: WatchEvent {
                    current: subtree(cache, &entry.target),
                    previous,
                    origin: MutationOrigin::Local,
                },
            });
        }
        deliveries
    }

    /// Snapshots the subtrees of subscriptions relevant to a foreign
    /// change list, before the changes are patched in.
    pub(crate) fn snapshot_for_remote(
        &self,
        changed: &[KeyPath],
        cache: &Value,
    ) -> Vec<(u64, Option<Value>)> {
        self.entries
            .iter()
            .filter(|entry| {
                changed
                    .iter()
                    .any(|change| entry.target.on_same_chain(change))
            })
            .map(|entry| (entry.id, subtree(cache, &entry.target)))
            .collect()
    }

    /// Prepares deliveries for a patched foreign change, pairing each
    /// pre-patch snapshot with the live post-patch value.
    pub(crate) fn remote_deliveries(
        &self,
        snapshots: Vec<(u64, Option<Value>)>,
        cache: &Value,
        origin: MutationOrigin,
    ) -> Vec<PendingDelivery> {
        snapshots
            .into_iter()
            .filter_map(|(id, previous)| {
                let entry = self.entries.iter().find(|entry| entry.id == id)?;
                Some(PendingDelivery {
                    id,
                    callback: Arc::clone(&entry.callback),
                    event: WatchEvent {
                        current: subtree(cache, &entry.target),
                        previous,
                        origin,
                    },
                })
            })
            .collect()
    }

    /// Prepares deliveries for a wholesale reload: every subscription whose
    /// subtree value differs between the old and the new cache.
    pub(crate) fn reload_deliveries(
        &mut self,
        old_cache: &Value,
        new_cache: &Value,
    ) -> Vec<PendingDelivery> {
        let mut deliveries = Vec::new();
        for entry in &mut self.entries {
            let previous = match entry.staged.take() {
                Some(staged) => staged,
                None => subtree(old_cache, &entry.target),
            };
            let current = subtree(new_cache, &entry.target);
            if previous == current {
                continue;
            }
            deliveries.push(PendingDelivery {
                id: entry.id,
                callback: Arc::clone(&entry.callback),
                event: WatchEvent {
                    current,
                    previous,
                    origin: MutationOrigin::Reload,
                },
            });
        }
        deliveries
    }
}

fn subtree(cache: &Value, target: &KeyPath) -> Option<Value> {
    cache
        .get_path(target)
        .filter(|value| !value.is_null())
        .cloned()
}
