//! Dynamic tree value model.

use crate::path::{KeyPath, PathKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dynamically shaped tree value.
///
/// Containers are string-keyed maps and index-keyed sequences; leaves are
/// scalars. This is the shape mirrored from the remote store, so every
/// variant here must be representable at a remote location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value. A root of `Null` means the mirrored location is empty.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Byte buffer.
    Bytes(Vec<u8>),
    /// Milliseconds since the Unix epoch.
    Timestamp(i64),
    /// A typed reference to another location in the remote tree.
    Reference(KeyPath),
    /// String-keyed map.
    Map(BTreeMap<String, Value>),
    /// Index-keyed sequence.
    Seq(Vec<Value>),
}

/// Runtime type tag of a [`Value`], used to detect type changes at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// `Value::Null`.
    Null,
    /// `Value::Bool`.
    Bool,
    /// `Value::Integer`.
    Integer,
    /// `Value::Float`.
    Float,
    /// `Value::Text`.
    Text,
    /// `Value::Bytes`.
    Bytes,
    /// `Value::Timestamp`.
    Timestamp,
    /// `Value::Reference`.
    Reference,
    /// `Value::Map`.
    Map,
    /// `Value::Seq`.
    Seq,
}

impl ValueKind {
    /// Returns true if values of this kind hold children.
    pub fn is_container(&self) -> bool {
        matches!(self, ValueKind::Map | ValueKind::Seq)
    }
}

impl Value {
    /// Creates a text value.
    pub fn text(text: impl Into<String>) -> Self {
        Value::Text(text.into())
    }

    /// Creates a byte buffer value.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    /// Creates a map value from key/value pairs.
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value))
                .collect(),
        )
    }

    /// Creates an empty map value.
    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Creates a sequence value.
    pub fn seq(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Seq(items.into_iter().collect())
    }

    /// The runtime type tag of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::Reference(_) => ValueKind::Reference,
            Value::Map(_) => ValueKind::Map,
            Value::Seq(_) => ValueKind::Seq,
        }
    }

    /// Returns true if this value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns true if this value is a map or a sequence.
    pub fn is_container(&self) -> bool {
        self.kind().is_container()
    }

    /// Returns the boolean, if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer, if this is an `Integer`.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the float, if this is a `Float`.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the text, if this is a `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the map, if this is a `Map`.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the map mutably, if this is a `Map`.
    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Returns the sequence, if this is a `Seq`.
    pub fn as_seq(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Seq(seq) => Some(seq),
            _ => None,
        }
    }

    /// Returns the sequence mutably, if this is a `Seq`.
    pub fn as_seq_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::Seq(seq) => Some(seq),
            _ => None,
        }
    }

    /// Looks up a direct child by key.
    ///
    /// Field keys address maps, index keys address sequences; any other
    /// combination returns `None`.
    pub fn get_key(&self, key: &PathKey) -> Option<&Value> {
        match (self, key) {
            (Value::Map(map), PathKey::Field(name)) => map.get(name),
            (Value::Seq(seq), PathKey::Index(index)) => seq.get(*index),
            _ => None,
        }
    }

    /// Looks up a direct child by key, mutably.
    pub fn get_key_mut(&mut self, key: &PathKey) -> Option<&mut Value> {
        match (self, key) {
            (Value::Map(map), PathKey::Field(name)) => map.get_mut(name),
            (Value::Seq(seq), PathKey::Index(index)) => seq.get_mut(*index),
            _ => None,
        }
    }

    /// Resolves a path from this value.
    pub fn get_path(&self, path: &KeyPath) -> Option<&Value> {
        let mut current = self;
        for key in path {
            current = current.get_key(key)?;
        }
        Some(current)
    }

    /// Resolves a path from this value, mutably.
    pub fn get_path_mut(&mut self, path: &KeyPath) -> Option<&mut Value> {
        let mut current = self;
        for key in path {
            current = current.get_key_mut(key)?;
        }
        Some(current)
    }

    /// Overwrites the value at `path`, creating intermediate maps as needed.
    ///
    /// Intermediate locations that are not containers are replaced by maps
    /// (the authoritative-store overwrite semantics). Index keys land inside
    /// an existing sequence: an in-range index overwrites, an index equal to
    /// the length appends, anything else falls back to a map keyed by the
    /// decimal index. Returns the previous value at `path`.
    pub fn set_path(&mut self, path: &KeyPath, value: Value) -> Option<Value> {
        if path.is_root() {
            let previous = std::mem::replace(self, value);
            return (!previous.is_null()).then_some(previous);
        }

        let keys = path.keys();
        let mut current = self;
        for key in &keys[..keys.len() - 1] {
            current = Self::descend_or_create(current, key);
        }

        match &keys[keys.len() - 1] {
            PathKey::Field(name) => {
                if !matches!(current, Value::Map(_)) {
                    *current = Value::empty_map();
                }
                match current {
                    Value::Map(map) => map.insert(name.clone(), value),
                    _ => None,
                }
            }
            PathKey::Index(index) => {
                if !matches!(current, Value::Seq(seq) if *index <= seq.len())
                    && !matches!(current, Value::Map(_))
                {
                    *current = Value::empty_map();
                }
                match current {
                    Value::Seq(seq) if *index < seq.len() => {
                        Some(std::mem::replace(&mut seq[*index], value))
                    }
                    Value::Seq(seq) => {
                        seq.push(value);
                        None
                    }
                    Value::Map(map) => map.insert(index.to_string(), value),
                    _ => None,
                }
            }
        }
    }

    /// Steps one key down from `current`, materializing the container the
    /// key requires when the present value cannot hold it.
    fn descend_or_create<'a>(current: &'a mut Value, key: &PathKey) -> &'a mut Value {
        match key {
            PathKey::Field(name) => {
                if !matches!(current, Value::Map(_)) {
                    *current = Value::empty_map();
                }
                match current {
                    Value::Map(map) => map.entry(name.clone()).or_insert(Value::Null),
                    other => other,
                }
            }
            PathKey::Index(index) => {
                if !matches!(current, Value::Seq(seq) if *index <= seq.len())
                    && !matches!(current, Value::Map(_))
                {
                    *current = Value::empty_map();
                }
                match current {
                    Value::Seq(seq) => {
                        if *index == seq.len() {
                            seq.push(Value::Null);
                        }
                        &mut seq[*index]
                    }
                    Value::Map(map) => map.entry(index.to_string()).or_insert(Value::Null),
                    other => other,
                }
            }
        }
    }

    /// Removes the value at `path`.
    ///
    /// Removing the root replaces it with `Null`. Missing paths are a no-op.
    /// Returns the removed value.
    pub fn delete_path(&mut self, path: &KeyPath) -> Option<Value> {
        if path.is_root() {
            let previous = std::mem::replace(self, Value::Null);
            return (!previous.is_null()).then_some(previous);
        }

        let parent = path.parent().unwrap_or_default();
        let container = self.get_path_mut(&parent)?;
        match (container, path.last()?) {
            (Value::Map(map), PathKey::Field(name)) => map.remove(name),
            (Value::Seq(seq), PathKey::Index(index)) if *index < seq.len() => {
                Some(seq.remove(*index))
            }
            _ => None,
        }
    }

    /// Shallow-merges a partial map into this value.
    ///
    /// Each entry of `partial` overwrites the child of the same key; a
    /// `Null` entry deletes the key. A non-map receiver is replaced by a
    /// map first. Returns the keys that actually changed, with their
    /// previous values.
    pub fn merge(&mut self, partial: BTreeMap<String, Value>) -> Vec<(String, Option<Value>)> {
        if self.as_map().is_none() {
            *self = Value::empty_map();
        }
        let map = match self.as_map_mut() {
            Some(map) => map,
            None => return Vec::new(),
        };

        let mut changed = Vec::new();
        for (key, value) in partial {
            if value.is_null() {
                if let Some(previous) = map.remove(&key) {
                    changed.push((key, Some(previous)));
                }
            } else {
                let previous = map.insert(key.clone(), value.clone());
                if previous.as_ref() != Some(&value) {
                    changed.push((key, previous));
                }
            }
        }
        changed
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::Seq(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Integer(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(text) => serde_json::Value::String(text),
            Value::Bytes(bytes) => serde_json::Value::Array(
                bytes.into_iter().map(serde_json::Value::from).collect(),
            ),
            Value::Timestamp(millis) => serde_json::Value::from(millis),
            Value::Reference(path) => serde_json::Value::String(path.to_string()),
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, serde_json::Value::from(value)))
                    .collect(),
            ),
            Value::Seq(seq) => {
                serde_json::Value::Array(seq.into_iter().map(serde_json::Value::from).collect())
            }
        }
    }
}
