//! Mirror sessions.

use crate::config::SessionConfig;
use crate::dirty::{build_batch, dirty_target_for, DirtyQueue, MutationLog, MutationRecord};
use crate::error::{EngineError, EngineResult};
use crate::reconcile;
use crate::remote::RemoteStore;
use crate::subscription::{PendingDelivery, SubscriptionRegistry, WatchCallback, WatchHandle, WatchOutcome};
use crate::view::{TreeView, ViewArena};
use livetree_protocol::{KeyPath, PathKey, SessionId, Value, WriteContext, WriteOperation};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// The lifecycle phase of a mirror session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Initial remote read in progress.
    Loading,
    /// Mirror loaded, reconciliation subscription open.
    Active,
    /// A foreign event is being patched into the cache.
    Patching,
    /// An authoritative re-read is replacing the cache wholesale.
    Reloading,
    /// The session was destroyed; every access fails.
    Destroyed,
}

impl SessionPhase {
    /// Returns true if the session still serves access.
    pub fn is_usable(&self) -> bool {
        !matches!(self, SessionPhase::Destroyed)
    }

    /// Returns true once the session was destroyed.
    pub fn is_destroyed(&self) -> bool {
        matches!(self, SessionPhase::Destroyed)
    }

    /// Returns true while a foreign change is being folded in.
    pub fn is_reconciling(&self) -> bool {
        matches!(self, SessionPhase::Patching | SessionPhase::Reloading)
    }
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOrigin {
    /// A write through this session.
    Local,
    /// A foreign event patched in place.
    Remote,
    /// A wholesale reload of the mirror.
    Reload,
}

impl MutationOrigin {
    /// Returns true if the change did not originate from this session.
    pub fn is_remote(&self) -> bool {
        !matches!(self, MutationOrigin::Local)
    }
}

/// A change notification delivered to the session's mutation callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// The changed target, relative to the session root.
    pub path: KeyPath,
    /// Value at the target after the change. `None` when removed.
    pub current: Option<Value>,
    /// Value at the target before the first change of the window.
    pub previous: Option<Value>,
    /// Where the change came from.
    pub origin: MutationOrigin,
}

pub(crate) type MutationCallback = Arc<dyn Fn(Mutation) + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(EngineError) + Send + Sync>;

/// State guarded by the session's single exclusive lock.
///
/// Cache, dirty queue, mutation log, and subscriptions are read-modify-
/// written across both the local-write path and the foreign-event path, so
/// they live behind one lock.
pub(crate) struct Inner {
    pub(crate) phase: SessionPhase,
    pub(crate) cache: Value,
    pub(crate) dirty: DirtyQueue,
    pub(crate) log: MutationLog,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) views: ViewArena,
    pub(crate) flush_scheduled: bool,
    pub(crate) mutation_callback: Option<MutationCallback>,
    pub(crate) error_callback: Option<ErrorCallback>,
    pub(crate) pump: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    pub(crate) id: SessionId,
    pub(crate) root_path: KeyPath,
    pub(crate) remote: Arc<dyn RemoteStore>,
    pub(crate) weak: Weak<Shared>,
    pub(crate) inner: Mutex<Inner>,
    /// Serializes batches so writes leave in dirtying order.
    write_chain: tokio::sync::Mutex<()>,
    batch_counter: AtomicU64,
}

impl Shared {
    pub(crate) fn lock_usable(&self) -> EngineResult<MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        if inner.phase.is_destroyed() {
            return Err(EngineError::Destroyed);
        }
        Ok(inner)
    }

    fn next_batch_id(&self) -> u64 {
        self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Reads the value at `path`. `None` for absent locations.
    pub(crate) fn value_at(&self, path: &KeyPath) -> EngineResult<Option<Value>> {
        let inner = self.lock_usable()?;
        Ok(subtree(&inner.cache, path))
    }

    /// Reads a child of a container, normalizing the key first.
    pub(crate) fn child_value(
        &self,
        parent: &KeyPath,
        key: PathKey,
    ) -> EngineResult<Option<Value>> {
        let inner = self.lock_usable()?;
        let key = normalized(&inner.cache, parent, key)?;
        Ok(subtree(&inner.cache, &parent.child(key)))
    }

    /// Returns the memoized view of a container's child, creating and
    /// caching one when none exists or the child's runtime type changed.
    pub(crate) fn child_view(&self, parent: &KeyPath, key: PathKey) -> EngineResult<TreeView> {
        let mut inner = self.lock_usable()?;
        let key = normalized(&inner.cache, parent, key)?;
        let path = parent.child(key);

        let Inner { cache, views, .. } = &mut *inner;
        Ok(views.lookup(cache, path, &self.weak))
    }

    /// Sets a child of a container, recording the dirty target.
    pub(crate) fn set_child(
        &self,
        parent: &KeyPath,
        key: PathKey,
        value: Value,
    ) -> EngineResult<()> {
        let mut inner = self.lock_usable()?;
        let key = normalized(&inner.cache, parent, key)?;
        if let (PathKey::Index(index), Some(Value::Seq(seq))) =
            (&key, inner.cache.get_path(parent))
        {
            if *index > seq.len() {
                return Err(EngineError::invalid_index(
                    index.to_string(),
                    parent.clone(),
                ));
            }
        }
        self.set_in(&mut inner, parent.child(key), value);
        Ok(())
    }

    /// Overwrites the value at `path` itself. Non-root paths require an
    /// existing container parent.
    pub(crate) fn replace_at(&self, path: KeyPath, value: Value) -> EngineResult<()> {
        let mut inner = self.lock_usable()?;
        if let Some(parent) = path.parent() {
            let container = inner
                .cache
                .get_path(&parent)
                .ok_or_else(|| EngineError::not_container(parent.clone()))?;
            if !container.is_container() {
                return Err(EngineError::not_container(parent));
            }
        }
        self.set_in(&mut inner, path, value);
        Ok(())
    }

    /// Removes a child of a container. Missing children are a no-op.
    pub(crate) fn remove_child(
        &self,
        parent: &KeyPath,
        key: PathKey,
    ) -> EngineResult<Option<Value>> {
        let mut inner = self.lock_usable()?;
        let key = normalized(&inner.cache, parent, key)?;
        let path = parent.child(key);
        if inner.cache.get_path(&path).is_none() {
            return Ok(None);
        }

        let target = dirty_target_for(&path);
        prepare_window(&mut inner, &target);
        let removed = inner.cache.delete_path(&path);
        self.commit_window(&mut inner, target);
        Ok(removed)
    }

    /// Assigns `value` under a freshly generated key of a map container.
    pub(crate) fn append_child(
        &self,
        parent: &KeyPath,
        value: Value,
    ) -> EngineResult<String> {
        let mut inner = self.lock_usable()?;
        match inner.cache.get_path(parent) {
            Some(Value::Map(_)) => {}
            _ => return Err(EngineError::not_container(parent.clone())),
        }

        let key = generated_key();
        self.set_in(&mut inner, parent.child(key.as_str()), value);
        Ok(key)
    }

    /// Runs a whole-sequence operation and dirties the sequence root.
    pub(crate) fn mutate_sequence<R>(
        &self,
        path: &KeyPath,
        op: impl FnOnce(&mut Vec<Value>) -> R,
    ) -> EngineResult<R> {
        let mut inner = self.lock_usable()?;
        if !matches!(inner.cache.get_path(path), Some(Value::Seq(_))) {
            return Err(EngineError::not_container(path.clone()));
        }

        let target = dirty_target_for(path);
        prepare_window(&mut inner, &target);
        let result = match inner.cache.get_path_mut(path) {
            Some(Value::Seq(seq)) => op(seq),
            _ => return Err(EngineError::not_container(path.clone())),
        };
        self.commit_window(&mut inner, target);
        Ok(result)
    }

    /// The core of every local mutation: no-op detection, window
    /// bookkeeping, cache update, dirty marking, flush scheduling.
    fn set_in(&self, inner: &mut Inner, path: KeyPath, value: Value) {
        if let Some(current) = inner.cache.get_path(&path) {
            // A scalar write equal to the current scalar is a no-op.
            if !current.is_container() && !value.is_container() && *current == value {
                return;
            }
        } else if value.is_null() {
            return;
        }

        let target = dirty_target_for(&path);
        prepare_window(inner, &target);
        if value.is_null() {
            inner.cache.delete_path(&path);
        } else {
            inner.cache.set_path(&path, value);
        }
        self.commit_window(inner, target);
    }

    fn commit_window(&self, inner: &mut Inner, target: KeyPath) {
        inner.dirty.insert(target);
        if inner.flush_scheduled {
            return;
        }
        inner.flush_scheduled = true;
        let Some(shared) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            // One deferral per window: a synchronous burst of edits
            // coalesces into a single flush.
            tokio::task::yield_now().await;
            shared.flush().await;
        });
    }

    /// Drains the dirty queue into one ordered batch and issues it through
    /// the serialized write chain.
    pub(crate) async fn flush(self: Arc<Self>) {
        let (batch, records) = {
            let mut inner = self.inner.lock();
            inner.flush_scheduled = false;
            if inner.phase.is_destroyed() || inner.dirty.is_empty() {
                return;
            }
            let targets = inner.dirty.drain();
            let batch = build_batch(&self.root_path, &inner.cache, targets);
            (batch, inner.log.drain())
        };

        let batch_id = self.next_batch_id();
        debug!(batch_id, writes = batch.len(), "flushing dirty targets");

        // Local notifications go out on the next turn, decoupled from
        // remote write latency.
        let notifier = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            notifier.deliver_window(records);
        });

        let _chain = self.write_chain.lock().await;
        for (index, operation) in batch.iter().enumerate() {
            let context = WriteContext::new(self.id, batch_id, index as u64);
            if let Err(error) = self.remote.write(operation, context).await {
                warn!(path = %operation.path, %error, "remote write failed");
                self.report_error(EngineError::write(operation.path.clone(), error.to_string()));
            }
        }
    }

    /// Delivers one window's mutation log to the root callback and the
    /// relevant subtree subscriptions.
    fn deliver_window(&self, records: Vec<MutationRecord>) {
        let (callback, mutations, deliveries) = {
            let mut inner = self.inner.lock();
            if inner.phase.is_destroyed() || records.is_empty() {
                return;
            }
            let targets: Vec<KeyPath> = records.iter().map(|record| record.target.clone()).collect();
            let callback = inner.mutation_callback.clone();
            let mutations: Vec<Mutation> = records
                .into_iter()
                .map(|record| Mutation {
                    current: subtree(&inner.cache, &record.target),
                    path: record.target,
                    previous: record.previous,
                    origin: MutationOrigin::Local,
                })
                .collect();
            let Inner {
                cache,
                subscriptions,
                ..
            } = &mut *inner;
            let deliveries = subscriptions.take_window_deliveries(&targets, cache);
            (callback, mutations, deliveries)
        };

        if let Some(callback) = callback {
            for mutation in mutations {
                callback(mutation);
            }
        }
        self.dispatch(deliveries);
    }

    /// Invokes prepared subscription deliveries, honoring stop outcomes.
    pub(crate) fn dispatch(&self, deliveries: Vec<PendingDelivery>) {
        for delivery in deliveries {
            if (delivery.callback)(delivery.event) == WatchOutcome::Stop {
                self.stop_watch(delivery.id);
            }
        }
    }

    /// Sends an asynchronous failure to the registered error callback.
    pub(crate) fn report_error(&self, error: EngineError) {
        let callback = self.inner.lock().error_callback.clone();
        if let Some(callback) = callback {
            callback(error);
        }
    }

    pub(crate) fn register_watch(
        &self,
        target: KeyPath,
        callback: WatchCallback,
    ) -> EngineResult<WatchHandle> {
        let mut inner = self.lock_usable()?;
        let id = inner.subscriptions.register(target, callback);
        Ok(WatchHandle::new(id, self.weak.clone()))
    }

    pub(crate) fn stop_watch(&self, id: u64) {
        self.inner.lock().subscriptions.remove(id);
    }

    pub(crate) fn watch_is_active(&self, id: u64) -> bool {
        self.inner.lock().subscriptions.contains(id)
    }

    /// Replaces the cache with an authoritative re-read of the root path.
    ///
    /// Queued-but-unflushed dirty targets do not survive: the snapshot
    /// wins, and a scheduled flush finds an empty queue.
    pub(crate) async fn reload(&self, origin: MutationOrigin) -> EngineResult<()> {
        {
            let mut inner = self.lock_usable()?;
            inner.phase = SessionPhase::Reloading;
        }

        let value = match self.remote.read(&self.root_path).await {
            Ok(value) => value.unwrap_or(Value::Null),
            Err(error) => {
                let mut inner = self.inner.lock();
                if !inner.phase.is_destroyed() {
                    inner.phase = SessionPhase::Active;
                }
                drop(inner);
                return Err(into_load(&self.root_path, error));
            }
        };

        let (callback, mutation, deliveries) = {
            let mut inner = self.inner.lock();
            if inner.phase.is_destroyed() {
                return Err(EngineError::Destroyed);
            }
            let previous = std::mem::replace(&mut inner.cache, value);
            inner.views.clear();
            inner.dirty.clear();
            inner.log.clear();
            inner.flush_scheduled = false;
            inner.phase = SessionPhase::Active;

            let callback = inner.mutation_callback.clone();
            let mutation = Mutation {
                path: KeyPath::root(),
                current: (!inner.cache.is_null()).then(|| inner.cache.clone()),
                previous: (!previous.is_null()).then(|| previous.clone()),
                origin,
            };
            let Inner {
                cache,
                subscriptions,
                ..
            } = &mut *inner;
            (callback, mutation, subscriptions.reload_deliveries(&previous, cache))
        };

        debug!(path = %self.root_path, "mirror reloaded");
        if let Some(callback) = callback {
            callback(mutation);
        }
        self.dispatch(deliveries);
        Ok(())
    }

    /// Tears the session down: drains pending writes behind any in-flight
    /// batch, stops the pump and every subscription, discards the cache.
    pub(crate) async fn destroy(&self) -> EngineResult<()> {
        let (batch, pump) = {
            let mut inner = self.inner.lock();
            if inner.phase.is_destroyed() {
                return Ok(());
            }
            let targets = inner.dirty.drain();
            let batch = if targets.is_empty() {
                Vec::new()
            } else {
                build_batch(&self.root_path, &inner.cache, targets)
            };
            inner.phase = SessionPhase::Destroyed;
            inner.log.clear();
            inner.subscriptions.clear();
            inner.views.clear();
            inner.mutation_callback = None;
            inner.error_callback = None;
            inner.cache = Value::Null;
            (batch, inner.pump.take())
        };

        let chain = self.write_chain.lock().await;
        let batch_id = self.next_batch_id();
        for (index, operation) in batch.iter().enumerate() {
            let context = WriteContext::new(self.id, batch_id, index as u64);
            if let Err(error) = self.remote.write(operation, context).await {
                warn!(path = %operation.path, %error, "write failed during teardown");
            }
        }
        drop(chain);

        if let Some(pump) = pump {
            pump.abort();
        }
        debug!(session = %self.id, "session destroyed");
        Ok(())
    }
}

fn subtree(cache: &Value, path: &KeyPath) -> Option<Value> {
    cache
        .get_path(path)
        .filter(|value| !value.is_null())
        .cloned()
}

/// Captures window bookkeeping before a mutation lands: the mutation log's
/// first-touch previous value and the subscriptions' staged snapshots.
fn prepare_window(inner: &mut Inner, target: &KeyPath) {
    let Inner {
        cache,
        log,
        subscriptions,
        ..
    } = inner;
    log.touch(target, subtree(cache, target));
    subscriptions.stage_for(target, cache);
}

/// Normalizes a raw key against the container it addresses.
///
/// Numeric string keys on a sequence parse to indices; other string keys
/// on a sequence are rejected. Index keys on a map address the decimal
/// field of the same spelling.
fn normalized(cache: &Value, parent: &KeyPath, key: PathKey) -> EngineResult<PathKey> {
    let container = cache
        .get_path(parent)
        .ok_or_else(|| EngineError::not_container(parent.clone()))?;
    match (container, key) {
        (Value::Seq(_), PathKey::Field(name)) => name
            .parse::<usize>()
            .map(PathKey::Index)
            .map_err(|_| EngineError::invalid_index(name, parent.clone())),
        (Value::Map(_), PathKey::Index(index)) => Ok(PathKey::Field(index.to_string())),
        (container, key) if container.is_container() => Ok(key),
        _ => Err(EngineError::not_container(parent.clone())),
    }
}

fn generated_key() -> String {
    format!("k{}", uuid::Uuid::new_v4().simple())
}

fn into_load(path: &KeyPath, error: EngineError) -> EngineError {
    match error {
        load @ EngineError::Load { .. } => load,
        other => EngineError::load(path.clone(), other.to_string()),
    }
}

/// One live mirror of a remote subtree.
///
/// Created by [`Session::open`]; unusable after [`Session::destroy`].
/// Local access is synchronous against the in-memory cache; remote writes
/// and reconciliation run in background tasks on the ambient tokio runtime.
pub struct Session {
    shared: Arc<Shared>,
    root: TreeView,
}

impl Session {
    /// Opens a mirror of `config.root_path` against a remote store.
    ///
    /// Performs the initial read; an empty remote location adopts the
    /// configured default value, which is immediately written back. Fails
    /// with [`EngineError::Load`] when the read or the mutation
    /// subscription fails.
    pub async fn open(
        remote: impl RemoteStore,
        config: SessionConfig,
    ) -> EngineResult<Session> {
        let root_path = KeyPath::parse(&config.root_path)?;
        let id = config.session_id.unwrap_or_else(SessionId::new_v4);
        let remote: Arc<dyn RemoteStore> = Arc::new(remote);

        let existing = remote
            .read(&root_path)
            .await
            .map_err(|error| into_load(&root_path, error))?;
        let (cache, seed) = match existing {
            Some(value) => (value, None),
            None => match &config.default_value {
                Some(default) => (default.clone(), Some(default.clone())),
                None => (Value::Null, None),
            },
        };

        let shared = Arc::new_cyclic(|weak| Shared {
            id,
            root_path: root_path.clone(),
            remote: Arc::clone(&remote),
            weak: weak.clone(),
            inner: Mutex::new(Inner {
                phase: SessionPhase::Loading,
                cache,
                dirty: DirtyQueue::default(),
                log: MutationLog::default(),
                subscriptions: SubscriptionRegistry::default(),
                views: ViewArena::default(),
                flush_scheduled: false,
                mutation_callback: None,
                error_callback: None,
                pump: None,
            }),
            write_chain: tokio::sync::Mutex::new(()),
            batch_counter: AtomicU64::new(0),
        });

        if let Some(default) = seed {
            let operation = WriteOperation::overwrite(root_path.clone(), default);
            let context = WriteContext::new(id, 0, 0);
            if let Err(error) = remote.write(&operation, context).await {
                warn!(path = %root_path, %error, "seeding default value failed");
            }
        }

        let feed = remote
            .subscribe(&root_path)
            .await
            .map_err(|error| into_load(&root_path, error))?;
        let pump = tokio::spawn(reconcile::run_pump(Arc::clone(&shared), feed));
        {
            let mut inner = shared.inner.lock();
            inner.pump = Some(pump);
            inner.phase = SessionPhase::Active;
        }

        debug!(session = %id, path = %root_path, "session opened");
        let root = TreeView::new(KeyPath::root(), shared.weak.clone());
        Ok(Session { shared, root })
    }

    /// This session's unique id.
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    /// The current lifecycle phase.
    pub fn phase(&self) -> SessionPhase {
        self.shared.inner.lock().phase
    }

    /// The root view of the mirrored value.
    pub fn root(&self) -> TreeView {
        self.root.clone()
    }

    /// Returns true once the mirror holds a value.
    pub fn has_value(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.phase.is_usable() && !inner.cache.is_null()
    }

    /// A clone of the whole mirrored value. Not live-synced.
    pub fn snapshot(&self) -> EngineResult<Option<Value>> {
        self.shared.value_at(&KeyPath::root())
    }

    /// Replaces the whole mirrored value and schedules a root overwrite.
    pub fn replace_root(&self, value: Value) -> EngineResult<()> {
        self.shared.replace_at(KeyPath::root(), value)
    }

    /// Registers the session's single mutation callback.
    ///
    /// The callback observes every distinct changed target of a window,
    /// local and foreign alike.
    pub fn on_mutation(
        &self,
        callback: impl Fn(Mutation) + Send + Sync + 'static,
    ) -> EngineResult<()> {
        let mut inner = self.shared.lock_usable()?;
        inner.mutation_callback = Some(Arc::new(callback));
        Ok(())
    }

    /// Registers the session's error callback.
    ///
    /// Write failures and reconciliation divergences are delivered here;
    /// they never surface at a caller-visible call site.
    pub fn on_error(
        &self,
        callback: impl Fn(EngineError) + Send + Sync + 'static,
    ) -> EngineResult<()> {
        let mut inner = self.shared.lock_usable()?;
        inner.error_callback = Some(Arc::new(callback));
        Ok(())
    }

    /// Replaces the mirror with an authoritative remote read.
    pub async fn reload(&self) -> EngineResult<()> {
        self.shared.reload(MutationOrigin::Reload).await
    }

    /// Destroys the session.
    ///
    /// Waits for any in-flight batch, drains still-queued writes, cancels
    /// the mutation subscription and every subtree subscription. Further
    /// access fails with [`EngineError::Destroyed`]. Idempotent.
    pub async fn destroy(&self) -> EngineResult<()> {
        self.shared.destroy().await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let mut inner = self.shared.inner.lock();
        if !inner.phase.is_destroyed() {
            inner.phase = SessionPhase::Destroyed;
            inner.subscriptions.clear();
            inner.views.clear();
            if let Some(pump) = inner.pump.take() {
                pump.abort();
            }
        }
    }
}
