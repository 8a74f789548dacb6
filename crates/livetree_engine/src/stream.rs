//! Reactive stream adapter over subtree subscriptions.

use crate::error::EngineResult;
use crate::subscription::{WatchHandle, WatchOutcome};
use crate::view::TreeView;
use livetree_protocol::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver};

/// A push-stream of a subtree's value.
///
/// Emits the current value on open, then the subtree's value after every
/// change. Purely a bridge over [`TreeView::watch`]; dropping the stream
/// stops the underlying subscription.
pub struct ValueStream {
    receiver: UnboundedReceiver<Option<Value>>,
    handle: WatchHandle,
}

impl ValueStream {
    pub(crate) fn open(view: &TreeView) -> EngineResult<ValueStream> {
        let (sender, receiver) = mpsc::unbounded_channel();

        // First emission: the value as of subscription time.
        let _ = sender.send(view.snapshot()?);

        let handle = view.watch_with(Arc::new(move |event| {
            // A dropped receiver cancels the subscription lazily.
            if sender.send(event.current).is_err() {
                WatchOutcome::Stop
            } else {
                WatchOutcome::Continue
            }
        }))?;

        Ok(ValueStream { receiver, handle })
    }

    /// Waits for the next emitted value.
    ///
    /// The outer `None` means the stream ended; the inner `None` means the
    /// subtree is absent.
    pub async fn recv(&mut self) -> Option<Option<Value>> {
        self.receiver.recv().await
    }

    /// Takes the next emitted value without waiting.
    pub fn try_recv(&mut self) -> Option<Option<Value>> {
        self.receiver.try_recv().ok()
    }

    /// The handle of the underlying subscription.
    pub fn handle(&self) -> &WatchHandle {
        &self.handle
    }
}

impl Drop for ValueStream {
    fn drop(&mut self) {
        self.handle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::remote::MockRemote;
    use crate::session::Session;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    async fn session() -> Session {
        let remote = MockRemote::new();
        remote.set_value(Some(Value::map([("title", Value::text("untitled"))])));
        Session::open(remote, SessionConfig::new("chat1"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn emits_current_value_first() {
        let session = session().await;
        let mut stream = session.root().child("title").unwrap().observe().unwrap();
        assert_eq!(stream.recv().await, Some(Some(Value::text("untitled"))));
    }

    #[tokio::test]
    async fn emits_values_after_changes() {
        let session = session().await;
        let mut stream = session.root().child("title").unwrap().observe().unwrap();
        assert_eq!(stream.try_recv(), Some(Some(Value::text("untitled"))));

        session.root().set("title", Value::text("hello")).unwrap();
        settle().await;
        assert_eq!(stream.try_recv(), Some(Some(Value::text("hello"))));

        session.root().remove_key("title").unwrap();
        settle().await;
        assert_eq!(stream.try_recv(), Some(None));
    }

    #[tokio::test]
    async fn dropping_stream_stops_subscription() {
        let session = session().await;
        let stream = session.root().child("title").unwrap().observe().unwrap();
        let handle = stream.handle().clone();
        assert!(handle.is_active());

        drop(stream);
        assert!(!handle.is_active());
    }
}
