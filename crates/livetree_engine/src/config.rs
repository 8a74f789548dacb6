//! Configuration for mirror sessions.

use livetree_protocol::{SessionId, Value};

/// Configuration for one mirror session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// The remote path this session mirrors (dotted-and-indexed form).
    pub root_path: String,
    /// Adopted and written back when the remote location is empty at load.
    pub default_value: Option<Value>,
    /// Explicit session id; generated when absent.
    pub session_id: Option<SessionId>,
}

impl SessionConfig {
    /// Creates a configuration mirroring `root_path`.
    pub fn new(root_path: impl Into<String>) -> Self {
        Self {
            root_path: root_path.into(),
            default_value: None,
            session_id: None,
        }
    }

    /// Sets the default value adopted when the remote location is empty.
    pub fn with_default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Pins the session id instead of generating one.
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}
