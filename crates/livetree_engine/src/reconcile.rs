//! Remote reconciliation: folding foreign mutation events into the mirror.

use crate::error::EngineError;
use crate::remote::MutationFeed;
use crate::session::{Mutation, MutationCallback, MutationOrigin, SessionPhase, Shared};
use crate::subscription::PendingDelivery;
use livetree_protocol::{KeyPath, MutationEvent, PathKey, Value};
use std::sync::Arc;
use tracing::{trace, warn};

/// Outcome of applying one foreign event under the session lock.
enum ForeignOutcome {
    /// Every change entry was patched in place.
    Applied {
        callback: Option<MutationCallback>,
        mutations: Vec<Mutation>,
        deliveries: Vec<PendingDelivery>,
    },
    /// A change referenced a path not addressable in the mirror.
    Diverged { path: KeyPath },
    /// The session was destroyed; the pump should exit.
    Stopped,
}

/// Consumes the store's mutation feed for the session's lifetime.
///
/// Self-caused events are discarded: their effect is already in the cache.
/// Foreign events are patched in place; a change that is not addressable
/// aborts the event and triggers an authoritative reload.
pub(crate) async fn run_pump(shared: Arc<Shared>, mut feed: MutationFeed) {
    while let Some(event) = feed.recv().await {
        if event.is_from(shared.id) {
            trace!(session = %shared.id, "self-caused event discarded");
            continue;
        }

        match apply_foreign(&shared, &event) {
            ForeignOutcome::Applied {
                callback,
                mutations,
                deliveries,
            } => {
                if let Some(callback) = callback {
                    for mutation in mutations {
                        callback(mutation);
                    }
                }
                shared.dispatch(deliveries);
            }
            ForeignOutcome::Diverged { path } => {
                warn!(%path, "mirror diverged from remote state, reloading");
                shared.report_error(EngineError::Reconciliation { path });
                if let Err(error) = shared.reload(MutationOrigin::Reload).await {
                    shared.report_error(error);
                }
            }
            ForeignOutcome::Stopped => break,
        }
    }
}

/// Patches a foreign event's change list into the cache.
///
/// Each change is applied by walking its target path from the cache root;
/// a missing intermediate key means the mirror missed an event or lost a
/// race with a conflicting remote change, and only a reload can recover.
fn apply_foreign(shared: &Arc<Shared>, event: &MutationEvent) -> ForeignOutcome {
    let mut inner = shared.inner.lock();
    if inner.phase.is_destroyed() {
        return ForeignOutcome::Stopped;
    }

    // Change paths arrive store-absolute. A change outside the mirrored
    // subtree (an overwrite of an ancestor) is only recoverable by reload.
    let mut relative = Vec::with_capacity(event.changes.len());
    for change in &event.changes {
        match change.path.relative_to(&shared.root_path) {
            Some(path) => relative.push(path),
            None => {
                return ForeignOutcome::Diverged {
                    path: change.path.clone(),
                }
            }
        }
    }

    inner.phase = SessionPhase::Patching;
    let snapshots = inner
        .subscriptions
        .snapshot_for_remote(&relative, &inner.cache);

    let mut mutations = Vec::with_capacity(event.changes.len());
    for (change, path) in event.changes.iter().zip(&relative) {
        if !addressable(&inner.cache, path) {
            inner.phase = SessionPhase::Active;
            return ForeignOutcome::Diverged {
                path: change.path.clone(),
            };
        }
        match &change.new_value {
            Some(value) => {
                inner.cache.set_path(path, value.clone());
            }
            None => {
                inner.cache.delete_path(path);
            }
        }
        mutations.push(Mutation {
            path: path.clone(),
            current: change.new_value.clone(),
            previous: change.previous_value.clone(),
            origin: MutationOrigin::Remote,
        });
    }
    inner.phase = SessionPhase::Active;

    let callback = inner.mutation_callback.clone();
    let deliveries = {
        let cache = &inner.cache;
        inner
            .subscriptions
            .remote_deliveries(snapshots, cache, MutationOrigin::Remote)
    };
    ForeignOutcome::Applied {
        callback,
        mutations,
        deliveries,
    }
}

/// Returns true if the leaf of `path` can be set or deleted without
/// materializing any intermediate key.
fn addressable(cache: &Value, path: &KeyPath) -> bool {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return true,
    };
    match (cache.get_path(&parent), path.last()) {
        (Some(Value::Map(_)), Some(PathKey::Field(_))) => true,
        (Some(Value::Seq(seq)), Some(PathKey::Index(index))) => *index <= seq.len(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addressable_requires_existing_container_parent() {
        let cache = Value::map([(
            "messages",
            Value::map([("msg1", Value::map([("text", Value::text("hi"))]))]),
        )]);

        assert!(addressable(&cache, &"messages.msg1.text".parse().unwrap()));
        // New leaf under an existing parent is an add, not a divergence.
        assert!(addressable(&cache, &"messages.msg2".parse().unwrap()));
        assert!(addressable(&cache, &KeyPath::root()));
        // Missing intermediate key.
        assert!(!addressable(&cache, &"messages.msg2.text".parse().unwrap()));
        // Scalar in the middle of the path.
        assert!(!addressable(
            &cache,
            &"messages.msg1.text.deep".parse().unwrap()
        ));
    }

    #[test]
    fn addressable_checks_sequence_bounds() {
        let cache = Value::map([("tags", Value::seq([Value::text("a")]))]);
        assert!(addressable(&cache, &"tags[0]".parse().unwrap()));
        assert!(addressable(&cache, &"tags[1]".parse().unwrap()));
        assert!(!addressable(&cache, &"tags[2]".parse().unwrap()));
    }
}
