//! Dynamic record value type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The columns of a record, keyed by column name.
///
/// A `BTreeMap` keeps column order deterministic, which keeps snapshot
/// payloads and test assertions stable across runs.
pub type RecordData = BTreeMap<String, RecordValue>;

/// A dynamic column value.
///
/// This type represents any column value a syncable record can carry.
/// Binary columns are held as raw bytes and must pass through the engine
/// byte-exact, with no encoding transformation at any point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordValue {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer (full i64 range).
    Integer(i64),
    /// Byte string, passed through untouched end to end.
    Bytes(Vec<u8>),
    /// Text string (UTF-8).
    Text(String),
    /// Array of values.
    Array(Vec<RecordValue>),
    /// Nested map of values.
    Map(BTreeMap<String, RecordValue>),
}

impl RecordValue {
    /// Returns the text content, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RecordValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer value.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RecordValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the byte content, if this is a bytes value.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RecordValue::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the boolean content, if this is a bool value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RecordValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the nested map, if this is a map value.
    pub fn as_map(&self) -> Option<&BTreeMap<String, RecordValue>> {
        match self {
            RecordValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns true if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, RecordValue::Null)
    }
}

impl From<&str> for RecordValue {
    fn from(s: &str) -> Self {
        RecordValue::Text(s.to_owned())
    }
}

impl From<String> for RecordValue {
    fn from(s: String) -> Self {
        RecordValue::Text(s)
    }
}

impl From<i64> for RecordValue {
    fn from(i: i64) -> Self {
        RecordValue::Integer(i)
    }
}

impl From<bool> for RecordValue {
    fn from(b: bool) -> Self {
        RecordValue::Bool(b)
    }
}

impl From<Vec<u8>> for RecordValue {
    fn from(b: Vec<u8>) -> Self {
        RecordValue::Bytes(b)
    }
}
