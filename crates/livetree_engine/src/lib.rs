//! # livetree Engine
//!
//! Live mirror synchronization engine for a path-addressed, tree-structured
//! realtime data store.
//!
//! This crate provides:
//! - A per-session in-memory mirror of a remote subtree
//! - Addressable views with synchronous structural access
//! - Dirty-target coalescing into ordered remote write batches
//! - Remote mutation reconciliation (patch in place, reload on divergence)
//! - Subtree subscriptions and a reactive stream adapter
//!
//! ## Architecture
//!
//! A [`Session`] owns the cache mirror. Local mutations apply to the cache
//! synchronously and enqueue dirty targets; one flush per scheduler turn
//! converts the queue into a minimal ordered batch of remote writes, issued
//! through a serialized write chain. A pump task consumes the store's
//! mutation feed, discards events the session itself caused, patches
//! foreign changes into the cache, and reloads the mirror wholesale when a
//! change is not addressable.
//!
//! ## Key Invariants
//!
//! - The remote store is authoritative; the cache is an optimistic copy
//! - No two dirty-queue entries are in an ancestor/descendant relationship
//! - Writes of one session reach the store in dirtying order
//! - Structural errors surface at the call site; write and reconciliation
//!   failures only ever flow through the error callback

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod dirty;
mod error;
mod reconcile;
mod remote;
mod session;
mod stream;
mod subscription;
mod view;

pub use config::SessionConfig;
pub use error::{EngineError, EngineResult};
pub use remote::{MockRemote, MutationFeed, RemoteStore};
pub use session::{Mutation, MutationOrigin, Session, SessionPhase};
pub use stream::ValueStream;
pub use subscription::{WatchEvent, WatchHandle, WatchOutcome};
pub use view::TreeView;

pub use livetree_protocol::{
    ChangeEntry, KeyPath, MutationEvent, PathError, PathKey, SessionId, Value, ValueKind,
    WriteContext, WriteKind, WriteOperation,
};
