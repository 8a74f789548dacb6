//! # livetree Protocol
//!
//! Shared types for the livetree synchronization engine.
//!
//! This crate provides:
//! - `KeyPath` / `PathKey` for addressing locations in a tree
//! - `Value`, the dynamically shaped tree value model
//! - Write operations and mutation event envelopes
//!
//! This is a pure types crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod message;
mod path;
mod value;

pub use message::{
    ChangeEntry, MutationEvent, SessionId, WriteContext, WriteKind, WriteOperation,
};
pub use path::{KeyPath, PathError, PathKey, PathResult};
pub use value::{Value, ValueKind};
