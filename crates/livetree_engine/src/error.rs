//! Error types for the synchronization engine.

use livetree_protocol::{KeyPath, PathError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the synchronization engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The initial or reload read of the mirrored path failed.
    ///
    /// Fatal to the session until a later `reload` succeeds.
    #[error("load of {path} failed: {message}")]
    Load {
        /// The mirrored root path.
        path: KeyPath,
        /// Description of the failure.
        message: String,
    },

    /// Structural navigation into a value that holds no children.
    #[error("value at {path} is not a container")]
    NotContainer {
        /// The non-container location.
        path: KeyPath,
    },

    /// A sequence was addressed with a key that is not a valid index.
    #[error("invalid sequence key {key:?} at {path}")]
    InvalidIndex {
        /// The offending key.
        key: String,
        /// The sequence location.
        path: KeyPath,
    },

    /// The session was destroyed; no further access is possible.
    #[error("session is destroyed")]
    Destroyed,

    /// A remote write failed. The optimistic cache value is kept.
    ///
    /// Never returned from a caller-visible call; delivered through the
    /// session's error callback.
    #[error("remote write to {path} failed: {message}")]
    Write {
        /// The write destination.
        path: KeyPath,
        /// Description of the failure.
        message: String,
    },

    /// A foreign mutation event referenced a path that is not addressable
    /// in the current mirror. Triggers an automatic reload.
    ///
    /// Delivered through the session's error callback as a warning-level
    /// event; not fatal.
    #[error("mutation event for {path} is not addressable in the mirror")]
    Reconciliation {
        /// The unaddressable change path.
        path: KeyPath,
    },

    /// A path string failed to parse.
    #[error(transparent)]
    Path(#[from] PathError),
}

impl EngineError {
    /// Creates a load error.
    pub fn load(path: KeyPath, message: impl Into<String>) -> Self {
        Self::Load {
            path,
            message: message.into(),
        }
    }

    /// Creates a write error.
    pub fn write(path: KeyPath, message: impl Into<String>) -> Self {
        Self::Write {
            path,
            message: message.into(),
        }
    }

    /// Creates a not-a-container error.
    pub fn not_container(path: KeyPath) -> Self {
        Self::NotContainer { path }
    }

    /// Creates an invalid-index error.
    pub fn invalid_index(key: impl Into<String>, path: KeyPath) -> Self {
        Self::InvalidIndex {
            key: key.into(),
            path,
        }
    }

    /// Returns true for programming errors that surface synchronously at
    /// the call site.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            EngineError::NotContainer { .. }
                | EngineError::InvalidIndex { .. }
                | EngineError::Path(_)
        )
    }

    /// Returns true if the session is unusable until recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Load { .. } | EngineError::Destroyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors() {
        let path: KeyPath = "a.b".parse().unwrap();
        assert!(EngineError::not_container(path.clone()).is_structural());
        assert!(EngineError::invalid_index("x", path.clone()).is_structural());
        assert!(!EngineError::write(path, "refused").is_structural());
        assert!(!EngineError::Destroyed.is_structural());
    }

    #[test]
    fn fatal_errors() {
        let path: KeyPath = "a".parse().unwrap();
        assert!(EngineError::load(path.clone(), "unreachable").is_fatal());
        assert!(EngineError::Destroyed.is_fatal());
        assert!(!EngineError::Reconciliation { path }.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = EngineError::Destroyed;
        assert_eq!(err.to_string(), "session is destroyed");

        let err = EngineError::invalid_index("name", "tags".parse().unwrap());
        assert!(err.to_string().contains("name"));
        assert!(err.to_string().contains("tags"));
    }
}
