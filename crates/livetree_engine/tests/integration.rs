//! Integration tests for the engine against the in-memory store.

use async_trait::async_trait;
use livetree_engine::{
    EngineError, EngineResult, KeyPath, MutationFeed, MutationOrigin, RemoteStore, Session,
    SessionConfig, SessionId, Value, WatchOutcome, WriteContext, WriteOperation,
};
use livetree_store::MemoryStore;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Remote adapter over the shared in-memory store.
struct StoreRemote {
    store: Arc<MemoryStore>,
}

impl StoreRemote {
    fn new(store: &Arc<MemoryStore>) -> Self {
        Self {
            store: Arc::clone(store),
        }
    }
}

#[async_trait]
impl RemoteStore for StoreRemote {
    async fn read(&self, path: &KeyPath) -> EngineResult<Option<Value>> {
        Ok(self.store.read(path))
    }

    async fn write(&self, operation: &WriteOperation, context: WriteContext) -> EngineResult<()> {
        self.store
            .write(operation, context)
            .map_err(|error| EngineError::write(operation.path.clone(), error.to_string()))
    }

    async fn subscribe(&self, path: &KeyPath) -> EngineResult<MutationFeed> {
        Ok(self.store.subscribe(path))
    }
}

/// A remote whose writes block until the test grants a permit.
struct GatedRemote {
    inner: StoreRemote,
    gate: Arc<Semaphore>,
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn read(&self, path: &KeyPath) -> EngineResult<Option<Value>> {
        self.inner.read(path).await
    }

    async fn write(&self, operation: &WriteOperation, context: WriteContext) -> EngineResult<()> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| EngineError::write(operation.path.clone(), "gate closed"))?;
        self.inner.write(operation, context).await
    }

    async fn subscribe(&self, path: &KeyPath) -> EngineResult<MutationFeed> {
        self.inner.subscribe(path).await
    }
}

/// Lets flush, notification, and pump tasks run to completion.
async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn path(s: &str) -> KeyPath {
    s.parse().unwrap()
}

fn chat_default() -> Value {
    Value::from(serde_json::json!({
        "title": "untitled",
        "messages": {},
    }))
}

async fn open(store: &Arc<MemoryStore>, config: SessionConfig) -> Session {
    Session::open(StoreRemote::new(store), config).await.unwrap()
}

// Scenario A: creating a session against an empty remote path adopts the
// default and writes it back once.
#[tokio::test]
async fn create_with_default_seeds_empty_store() {
    let store = Arc::new(MemoryStore::new());
    let mut raw_feed = store.subscribe(&path("chat1"));

    let session = open(
        &store,
        SessionConfig::new("chat1").with_default_value(chat_default()),
    )
    .await;
    settle().await;

    assert!(session.has_value());
    assert_eq!(
        session.root().get("title").unwrap(),
        Some(Value::text("untitled"))
    );

    // Exactly one remote write: the seeded default.
    assert_eq!(store.read(&path("chat1")), Some(chat_default()));
    let seed = raw_feed.try_recv().unwrap();
    assert_eq!(seed.context.unwrap().session_id, session.id());
    assert!(raw_feed.try_recv().is_err());
}

// Scenario B: a synchronous burst of edits flushes once, as one batch with
// one entry per distinct parent.
#[tokio::test]
async fn synchronous_burst_flushes_as_one_batch() {
    let store = Arc::new(MemoryStore::with_value(Value::map([(
        "chat1",
        chat_default(),
    )])));
    let session = open(&store, SessionConfig::new("chat1")).await;
    let mut raw_feed = store.subscribe(&path("chat1"));

    let root = session.root();
    let key = root
        .child("messages")
        .unwrap()
        .append(Value::map([("text", Value::text("hi"))]))
        .unwrap();
    root.set("title", Value::text("hello")).unwrap();
    settle().await;

    let first = raw_feed.try_recv().unwrap();
    let second = raw_feed.try_recv().unwrap();
    assert!(raw_feed.try_recv().is_err());

    // One batch, two writes, issuance order preserved.
    let first_ctx = first.context.unwrap();
    let second_ctx = second.context.unwrap();
    assert_eq!(first_ctx.batch_id, second_ctx.batch_id);
    assert_eq!(first_ctx.write_id, 0);
    assert_eq!(second_ctx.write_id, 1);

    assert_eq!(
        store.read(&path("chat1.title")),
        Some(Value::text("hello"))
    );
    let message_path = path("chat1.messages").child(key.as_str()).child("text");
    assert_eq!(store.read(&message_path), Some(Value::text("hi")));
}

// Scenario C: a foreign change below a watched subtree fires the
// subscription once with staged previous and live current values.
#[tokio::test]
async fn foreign_change_notifies_subscription() {
    let store = Arc::new(MemoryStore::with_value(Value::from(serde_json::json!({
        "chat1": { "messages": { "msg1": { "text": "hi" } } },
    }))));
    let watcher = open(&store, SessionConfig::new("chat1")).await;
    let editor = open(&store, SessionConfig::new("chat1")).await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    watcher
        .root()
        .child("messages")
        .unwrap()
        .watch(move |event| {
            sink.lock().push(event);
            WatchOutcome::Continue
        })
        .unwrap();

    let mutations = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&mutations);
    watcher
        .on_mutation(move |mutation| sink.lock().push(mutation))
        .unwrap();

    editor
        .root()
        .child("messages")
        .unwrap()
        .child("msg1")
        .unwrap()
        .set("text", Value::text("hi!"))
        .unwrap();
    settle().await;

    let events = events.lock();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_remote());
    let current = events[0].current.as_ref().unwrap();
    let previous = events[0].previous.as_ref().unwrap();
    assert_eq!(
        current.get_path(&path("msg1.text")),
        Some(&Value::text("hi!"))
    );
    assert_eq!(
        previous.get_path(&path("msg1.text")),
        Some(&Value::text("hi"))
    );

    let mutations = mutations.lock();
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].path, path("messages.msg1.text"));
    assert_eq!(mutations[0].origin, MutationOrigin::Remote);
}

// Scenario D: destroy waits for the in-flight write, then poisons access.
#[tokio::test]
async fn destroy_waits_for_inflight_write() {
    let store = Arc::new(MemoryStore::new());
    let gate = Arc::new(Semaphore::new(0));
    let remote = GatedRemote {
        inner: StoreRemote::new(&store),
        gate: Arc::clone(&gate),
    };
    let session = Session::open(remote, SessionConfig::new("chat1")).await.unwrap();
    let root = session.root();

    session.replace_root(Value::map([("title", Value::text("t"))])).unwrap();
    settle().await;

    // The flush is parked inside the gated write. Destroy must wait for it.
    let session = Arc::new(session);
    let destroyer = Arc::clone(&session);
    let destroy_task = tokio::spawn(async move { destroyer.destroy().await });
    settle().await;
    assert!(!destroy_task.is_finished());

    gate.add_permits(8);
    destroy_task.await.unwrap().unwrap();

    assert_eq!(store.read(&path("chat1.title")), Some(Value::text("t")));
    assert!(matches!(root.get("title"), Err(EngineError::Destroyed)));
}

// Idempotent read-back: committing a window of writes leaves the remote
// equal to the pre-flush mirror.
#[tokio::test]
async fn committed_writes_read_back_identically() {
    let store = Arc::new(MemoryStore::new());
    let session = open(
        &store,
        SessionConfig::new("chat1").with_default_value(chat_default()),
    )
    .await;

    let root = session.root();
    root.set("title", Value::text("hello")).unwrap();
    root.set("topic", Value::map([("name", Value::text("sync"))])).unwrap();
    root.child("topic").unwrap().set("name", Value::text("trees")).unwrap();
    root.remove_key("messages").unwrap();

    let pre_flush = session.snapshot().unwrap();
    settle().await;

    assert_eq!(store.read(&path("chat1")), pre_flush);
    assert_eq!(session.snapshot().unwrap(), pre_flush);
}

// Ancestor subsumption: dirtying a descendant and then its ancestor sends
// exactly one write, for the ancestor.
#[tokio::test]
async fn ancestor_write_subsumes_descendant() {
    let store = Arc::new(MemoryStore::with_value(Value::from(serde_json::json!({
        "chat1": { "a": { "b": { "c": 1 } } },
    }))));
    let session = open(&store, SessionConfig::new("chat1")).await;
    let mut raw_feed = store.subscribe(&path("chat1"));

    let root = session.root();
    root.child("a").unwrap().child("b").unwrap().set("c", Value::Integer(2)).unwrap();
    root.child("a")
        .unwrap()
        .set("b", Value::map([("c", Value::Integer(3))]))
        .unwrap();
    settle().await;

    let event = raw_feed.try_recv().unwrap();
    assert!(raw_feed.try_recv().is_err());
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.changes[0].path, path("chat1.a.b"));
    assert_eq!(store.read(&path("chat1.a.b.c")), Some(Value::Integer(3)));
}

// Self-event suppression: a session's own write echoes back from the store
// without mutating the cache again or duplicating callbacks.
#[tokio::test]
async fn own_echo_is_suppressed() {
    let store = Arc::new(MemoryStore::new());
    let session = open(
        &store,
        SessionConfig::new("chat1").with_default_value(chat_default()),
    )
    .await;

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session
        .root()
        .watch(move |event| {
            sink.lock().push(event);
            WatchOutcome::Continue
        })
        .unwrap();

    let mutations = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&mutations);
    session
        .on_mutation(move |mutation| sink.lock().push(mutation))
        .unwrap();

    session.root().set("title", Value::text("hello")).unwrap();
    settle().await;

    // One local delivery each; the remote echo added nothing.
    assert_eq!(events.lock().len(), 1);
    let mutations = mutations.lock();
    assert_eq!(mutations.len(), 1);
    assert_eq!(mutations[0].origin, MutationOrigin::Local);
}

// Reload on divergence: an event whose change path misses an intermediate
// key triggers exactly one reload, after which the mirror matches a direct
// remote read.
#[tokio::test]
async fn divergent_event_triggers_reload() {
    let store = Arc::new(MemoryStore::with_value(Value::map([(
        "chat1",
        chat_default(),
    )])));
    let session = open(&store, SessionConfig::new("chat1")).await;

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    session.on_error(move |error| sink.lock().push(error)).unwrap();

    let reloads = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reloads);
    session
        .on_mutation(move |mutation| {
            if mutation.origin == MutationOrigin::Reload {
                sink.lock().push(mutation);
            }
        })
        .unwrap();

    // A foreign merge materializes `branch` at the store; the session's
    // mirror has no `branch`, so the change `chat1.branch.leaf` cannot be
    // patched in place.
    store
        .write(
            &WriteOperation::merge(
                path("chat1.branch"),
                Value::map([("leaf", Value::Integer(1))]),
            ),
            WriteContext::new(SessionId::new_v4(), 1, 0),
        )
        .unwrap();
    settle().await;

    let errors = errors.lock();
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], EngineError::Reconciliation { .. }));

    assert_eq!(reloads.lock().len(), 1);
    assert_eq!(session.snapshot().unwrap(), store.read(&path("chat1")));
    assert_eq!(
        session.root().child("branch").unwrap().get("leaf").unwrap(),
        Some(Value::Integer(1))
    );
}

// Writes from one session converge into the other through the mutation
// feed, and both mirrors end up structurally equal.
#[tokio::test]
async fn two_sessions_converge() {
    let store = Arc::new(MemoryStore::new());
    let left = open(
        &store,
        SessionConfig::new("doc").with_default_value(Value::map([("n", Value::Integer(0))])),
    )
    .await;
    settle().await;
    let right = open(&store, SessionConfig::new("doc")).await;

    left.root().set("n", Value::Integer(1)).unwrap();
    settle().await;
    right.root().set("m", Value::text("from right")).unwrap();
    settle().await;

    assert_eq!(left.snapshot().unwrap(), right.snapshot().unwrap());
    assert_eq!(store.read(&path("doc")), left.snapshot().unwrap());
}

// A watch callback cancels itself by returning the stop sentinel.
#[tokio::test]
async fn watch_stop_sentinel_cancels() {
    let store = Arc::new(MemoryStore::new());
    let session = open(
        &store,
        SessionConfig::new("chat1").with_default_value(chat_default()),
    )
    .await;

    let count = Arc::new(Mutex::new(0u32));
    let sink = Arc::clone(&count);
    let handle = session
        .root()
        .watch(move |_| {
            *sink.lock() += 1;
            WatchOutcome::Stop
        })
        .unwrap();

    session.root().set("title", Value::text("one")).unwrap();
    settle().await;
    session.root().set("title", Value::text("two")).unwrap();
    settle().await;

    assert_eq!(*count.lock(), 1);
    assert!(!handle.is_active());
}

// The stream adapter sees the current value, then every coalesced change,
// local or remote.
#[tokio::test]
async fn observe_streams_local_and_remote_changes() {
    let store = Arc::new(MemoryStore::new());
    let session = open(
        &store,
        SessionConfig::new("chat1").with_default_value(chat_default()),
    )
    .await;
    settle().await;
    let other = open(&store, SessionConfig::new("chat1")).await;

    let mut stream = session.root().child("title").unwrap().observe().unwrap();
    assert_eq!(stream.recv().await, Some(Some(Value::text("untitled"))));

    session.root().set("title", Value::text("local")).unwrap();
    settle().await;
    assert_eq!(stream.try_recv(), Some(Some(Value::text("local"))));

    other.root().set("title", Value::text("remote")).unwrap();
    settle().await;
    assert_eq!(stream.try_recv(), Some(Some(Value::text("remote"))));
}

// Remote writes carry overwrite kind for a dirtied root and merge kind for
// grouped children.
#[tokio::test]
async fn root_overwrite_and_child_merge_kinds() {
    let store = Arc::new(MemoryStore::new());
    let mut raw_feed = store.subscribe(&path("doc"));
    let session = open(
        &store,
        SessionConfig::new("doc").with_default_value(Value::map([("a", Value::Integer(1))])),
    )
    .await;
    settle().await;
    let seed = raw_feed.try_recv().unwrap();
    assert_eq!(seed.context.unwrap().batch_id, 0);

    // Child write: merge at the parent, reported per child.
    session.root().set("a", Value::Integer(2)).unwrap();
    settle().await;
    let event = raw_feed.try_recv().unwrap();
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.changes[0].path, path("doc.a"));

    // Root replacement: a single overwrite, reported at the root.
    session
        .replace_root(Value::map([("b", Value::Integer(3))]))
        .unwrap();
    settle().await;
    let event = raw_feed.try_recv().unwrap();
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.changes[0].path, path("doc"));

    assert_eq!(store.read(&path("doc")), Some(Value::map([("b", Value::Integer(3))])));
    assert_eq!(session.snapshot().unwrap(), store.read(&path("doc")));
}

// Sequence edits overwrite the sequence atomically at the store.
#[tokio::test]
async fn sequence_edit_overwrites_whole_sequence() {
    let store = Arc::new(MemoryStore::with_value(Value::from(serde_json::json!({
        "doc": { "tags": ["a", "b"] },
    }))));
    let session = open(&store, SessionConfig::new("doc")).await;
    let mut raw_feed = store.subscribe(&path("doc"));

    let tags = session.root().child("tags").unwrap();
    tags.set(0usize, Value::text("z")).unwrap();
    tags.push(Value::text("c")).unwrap();
    settle().await;

    // One event, carrying the whole sequence once.
    let event = raw_feed.try_recv().unwrap();
    assert!(raw_feed.try_recv().is_err());
    assert_eq!(event.changes.len(), 1);
    assert_eq!(event.changes[0].path, path("doc.tags"));
    assert_eq!(
        store.read(&path("doc.tags")),
        Some(Value::seq([
            Value::text("z"),
            Value::text("b"),
            Value::text("c"),
        ]))
    );
}

// Write kinds observed at the store match the batch grouping rules.
#[tokio::test]
async fn batch_grouping_shapes_store_writes() {
    let store = Arc::new(MemoryStore::with_value(Value::from(serde_json::json!({
        "doc": { "user": { "name": "ada", "age": 36 }, "tags": ["x"] },
    }))));
    let session = open(&store, SessionConfig::new("doc")).await;
    let mut raw_feed = store.subscribe(&path("doc"));

    let user = session.root().child("user").unwrap();
    user.set("name", Value::text("grace")).unwrap();
    user.set("age", Value::Integer(45)).unwrap();
    settle().await;

    // Two sibling edits under one parent: one merge event with two changes.
    let event = raw_feed.try_recv().unwrap();
    assert!(raw_feed.try_recv().is_err());
    assert_eq!(event.changes.len(), 2);
    assert!(event
        .changes
        .iter()
        .all(|change| change.path.parent() == Some(path("doc.user"))));
}
