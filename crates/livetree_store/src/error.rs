//! Error types for the in-memory store.

use livetree_protocol::KeyPath;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while applying writes to the store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// A merge write carried a value that is not a map.
    #[error("merge into {path} requires a map value")]
    InvalidMerge {
        /// The merge destination.
        path: KeyPath,
    },
}
