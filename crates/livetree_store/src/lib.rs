//! # livetree Store
//!
//! Reference in-memory authoritative store for livetree.
//!
//! This crate provides:
//! - An authoritative tree value addressed by `KeyPath`
//! - Overwrite and merge write application with per-child change lists
//! - Mutation event fan-out to per-path subscribers
//!
//! The store echoes the `WriteContext` of every applied write into the
//! events it fans out, so mirror sessions can recognize the effects of
//! their own writes. Engine integration tests run against this store the
//! way a production deployment runs against the real remote store.
//!
//! No durability is provided; the store exists to exercise the engine's
//! synchronization protocol end to end.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod store;

pub use error::{StoreError, StoreResult};
pub use store::MemoryStore;
