//! Remote store abstraction.

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use livetree_protocol::{KeyPath, MutationEvent, Value, WriteContext, WriteOperation};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Stream of mutation events for one subscribed path.
///
/// Dropping the feed cancels the subscription at the store.
pub type MutationFeed = UnboundedReceiver<MutationEvent>;

/// A remote store holds the authoritative tree this engine mirrors.
///
/// This trait abstracts the store access layer, allowing for different
/// implementations (networked, in-memory reference store, mock for
/// testing). Implementations must fan every applied write back out through
/// subscribed mutation feeds, echoing the write's context.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Reads the value at `path`. `None` means the location is empty.
    async fn read(&self, path: &KeyPath) -> EngineResult<Option<Value>>;

    /// Applies a write at its destination.
    async fn write(&self, operation: &WriteOperation, context: WriteContext) -> EngineResult<()>;

    /// Subscribes to mutation events touching the subtree at `path`.
    async fn subscribe(&self, path: &KeyPath) -> EngineResult<MutationFeed>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn read(&self, path: &KeyPath) -> EngineResult<Option<Value>> {
        (**self).read(path).await
    }

    async fn write(&self, operation: &WriteOperation, context: WriteContext) -> EngineResult<()> {
        (**self).write(operation, context).await
    }

    async fn subscribe(&self, path: &KeyPath) -> EngineResult<MutationFeed> {
        (**self).subscribe(path).await
    }
}

/// A mock remote store for unit tests.
///
/// Serves a scripted read value, records every write, and exposes a sender
/// half for injecting mutation events into the subscribed feed.
#[derive(Default)]
pub struct MockRemote {
    disconnected: AtomicBool,
    fail_writes: AtomicBool,
    value: Mutex<Option<Value>>,
    writes: Mutex<Vec<(WriteOperation, WriteContext)>>,
    feed: Mutex<Option<UnboundedSender<MutationEvent>>>,
}

impl MockRemote {
    /// Creates a connected mock with no stored value.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value served by `read`.
    pub fn set_value(&self, value: Option<Value>) {
        *self.value.lock() = value;
    }

    /// Makes subsequent reads and subscriptions fail.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.disconnected.store(disconnected, Ordering::SeqCst);
    }

    /// Makes subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns every write recorded so far.
    pub fn writes(&self) -> Vec<(WriteOperation, WriteContext)> {
        self.writes.lock().clone()
    }

    /// Injects a mutation event into the subscribed feed.
    ///
    /// Returns false when nothing is subscribed or the feed was dropped.
    pub fn push_event(&self, event: MutationEvent) -> bool {
        self.feed
            .lock()
            .as_ref()
            .map(|sender| sender.send(event).is_ok())
            .unwrap_or(false)
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn read(&self, path: &KeyPath) -> EngineResult<Option<Value>> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(EngineError::load(path.clone(), "mock remote disconnected"));
        }
        Ok(self.value.lock().clone())
    }

    async fn write(&self, operation: &WriteOperation, context: WriteContext) -> EngineResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::write(
                operation.path.clone(),
                "mock write refused",
            ));
        }
        self.writes.lock().push((operation.clone(), context));
        Ok(())
    }

    async fn subscribe(&self, path: &KeyPath) -> EngineResult<MutationFeed> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(EngineError::load(path.clone(), "mock remote disconnected"));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.feed.lock() = Some(sender);
        Ok(receiver)
    }
}
