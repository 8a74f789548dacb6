//! Key paths addressing locations in a tree value.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for path operations.
pub type PathResult<T> = Result<T, PathError>;

/// Errors that can occur while parsing or combining paths.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    /// A dotted segment was empty (`"a..b"`, leading or trailing dot).
    #[error("empty path segment in {path:?}")]
    EmptySegment {
        /// The offending path string.
        path: String,
    },

    /// A bracketed index was not a base-10 integer.
    #[error("invalid index {index:?} in {path:?}")]
    InvalidIndex {
        /// The text between the brackets.
        index: String,
        /// The offending path string.
        path: String,
    },

    /// A bracket was opened but never closed, or appeared mid-segment.
    #[error("malformed brackets in {path:?}")]
    MalformedBrackets {
        /// The offending path string.
        path: String,
    },
}

/// One key in a [`KeyPath`]: a map field or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathKey {
    /// A string-keyed map field.
    Field(String),
    /// A position in a sequence.
    Index(usize),
}

impl PathKey {
    /// Creates a field key.
    pub fn field(name: impl Into<String>) -> Self {
        PathKey::Field(name.into())
    }

    /// Creates an index key.
    pub fn index(index: usize) -> Self {
        PathKey::Index(index)
    }

    /// Returns true if this key is a sequence index.
    pub fn is_index(&self) -> bool {
        matches!(self, PathKey::Index(_))
    }

    /// Returns the field name, if this is a field key.
    pub fn as_field(&self) -> Option<&str> {
        match self {
            PathKey::Field(name) => Some(name),
            PathKey::Index(_) => None,
        }
    }

    /// Returns the index, if this is an index key.
    pub fn as_index(&self) -> Option<usize> {
        match self {
            PathKey::Field(_) => None,
            PathKey::Index(index) => Some(*index),
        }
    }
}

impl From<&str> for PathKey {
    fn from(name: &str) -> Self {
        PathKey::Field(name.to_string())
    }
}

impl From<String> for PathKey {
    fn from(name: String) -> Self {
        PathKey::Field(name)
    }
}

impl From<usize> for PathKey {
    fn from(index: usize) -> Self {
        PathKey::Index(index)
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Field(name) => write!(f, "{name}"),
            PathKey::Index(index) => write!(f, "[{index}]"),
        }
    }
}

/// An ordered list of keys locating a value inside a tree.
///
/// The empty path addresses the tree root. Paths are written in the
/// dotted-and-indexed form `users.alice.posts[3].title`: fields are joined
/// with dots and indices appear in brackets attached to the preceding
/// segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPath {
    keys: Vec<PathKey>,
}

impl KeyPath {
    /// The root path (no keys).
    pub fn root() -> Self {
        KeyPath { keys: Vec::new() }
    }

    /// Creates a path from a list of keys.
    pub fn from_keys(keys: Vec<PathKey>) -> Self {
        KeyPath { keys }
    }

    /// Parses a dotted-and-indexed path string.
    ///
    /// The empty string parses to the root path. `"a.b[2].c"` parses to
    /// `[Field(a), Field(b), Index(2), Field(c)]`.
    pub fn parse(path: &str) -> PathResult<Self> {
        if path.is_empty() {
            return Ok(KeyPath::root());
        }

        let mut keys = Vec::new();
        for segment in path.split('.') {
            let (field, brackets) = match segment.find('[') {
                Some(pos) => segment.split_at(pos),
                None => (segment, ""),
            };

            if field.is_empty() {
                return Err(PathError::EmptySegment {
                    path: path.to_string(),
                });
            }
            keys.push(PathKey::Field(field.to_string()));

            let mut rest = brackets;
            while !rest.is_empty() {
                let inner = rest
                    .strip_prefix('[')
                    .and_then(|r| r.split_once(']'))
                    .ok_or_else(|| PathError::MalformedBrackets {
                        path: path.to_string(),
                    })?;
                let index = inner.0.parse::<usize>().map_err(|_| PathError::InvalidIndex {
                    index: inner.0.to_string(),
                    path: path.to_string(),
                })?;
                keys.push(PathKey::Index(index));
                rest = inner.1;
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(PathError::MalformedBrackets {
                        path: path.to_string(),
                    });
                }
            }
        }

        Ok(KeyPath { keys })
    }

    /// Returns true if this is the root path.
    pub fn is_root(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of keys in the path.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns true if the path has no keys.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The keys of this path, in order.
    pub fn keys(&self) -> &[PathKey] {
        &self.keys
    }

    /// The final key, if any.
    pub fn last(&self) -> Option<&PathKey> {
        self.keys.last()
    }

    /// The path without its final key. Returns `None` for the root.
    pub fn parent(&self) -> Option<KeyPath> {
        if self.keys.is_empty() {
            return None;
        }
        Some(KeyPath {
            keys: self.keys[..self.keys.len() - 1].to_vec(),
        })
    }

    /// Extends this path by one key.
    pub fn child(&self, key: impl Into<PathKey>) -> KeyPath {
        let mut keys = self.keys.clone();
        keys.push(key.into());
        KeyPath { keys }
    }

    /// Concatenates two paths.
    pub fn join(&self, other: &KeyPath) -> KeyPath {
        let mut keys = self.keys.clone();
        keys.extend(other.keys.iter().cloned());
        KeyPath { keys }
    }

    /// Returns true if `self` is an ancestor of `other` (strict prefix).
    pub fn is_ancestor_of(&self, other: &KeyPath) -> bool {
        self.keys.len() < other.keys.len() && other.keys[..self.keys.len()] == self.keys[..]
    }

    /// Returns true if `self` equals `other` or is an ancestor of it.
    pub fn contains(&self, other: &KeyPath) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    /// Returns true if the two paths lie on one root-to-leaf chain.
    pub fn on_same_chain(&self, other: &KeyPath) -> bool {
        self.contains(other) || other.is_ancestor_of(self)
    }

    /// Strips `base` from the front of this path.
    ///
    /// Returns `None` unless `base` contains `self`.
    pub fn relative_to(&self, base: &KeyPath) -> Option<KeyPath> {
        if !base.contains(self) {
            return None;
        }
        Some(KeyPath {
            keys: self.keys[base.keys.len()..].to_vec(),
        })
    }

    /// Position of the first sequence index in the path, if any.
    pub fn first_index_position(&self) -> Option<usize> {
        self.keys.iter().position(PathKey::is_index)
    }

    /// The prefix of this path up to (excluding) the key at `len`.
    pub fn truncated(&self, len: usize) -> KeyPath {
        KeyPath {
            keys: self.keys[..len.min(self.keys.len())].to_vec(),
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for key in &self.keys {
            match key {
                PathKey::Field(name) => {
                    if !first {
                        write!(f, ".")?;
                    }
                    write!(f, "{name}")?;
                }
                PathKey::Index(index) => write!(f, "[{index}]")?,
            }
            first = false;
        }
        Ok(())
    }
}

impl std::str::FromStr for KeyPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyPath::parse(s)
    }
}

impl<'a> IntoIterator for &'a KeyPath {
    type Item = &'a PathKey;
    type IntoIter = std::slice::Iter<'a, PathKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.keys.iter()
    }
}
