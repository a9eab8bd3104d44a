// This file is part of gglite, a lightweight IoT edge agent runtime
// Copyright (C) 2023 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::borrow::Cow;
use std::fmt;

use crate::error::{Error, ErrorKind};

mod codec;

pub use codec::{deserialize, deserialize_bounded, serialize, serialize_bounded};

/// Default nesting bound for values.
///
/// The codec entry points take an explicit bound so internal users (like the
/// config snapshot) can raise it; everything wire-facing uses this default.
pub const MAX_OBJECT_DEPTH: usize = 10;

/// An owned byte string.
///
/// Buffers carry no encoding; most of them hold UTF-8 in practice, so Debug
/// and Display render them lossily for logs.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Buffer(Vec<u8>);

impl Buffer {
    pub fn new() -> Self {
        Buffer(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }

    pub fn to_string_lossy(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl std::ops::Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(bytes: Vec<u8>) -> Self {
        Buffer(bytes)
    }
}

impl From<&[u8]> for Buffer {
    fn from(bytes: &[u8]) -> Self {
        Buffer(bytes.to_vec())
    }
}

impl From<&str> for Buffer {
    fn from(s: &str) -> Self {
        Buffer(s.as_bytes().to_vec())
    }
}

impl From<String> for Buffer {
    fn from(s: String) -> Self {
        Buffer(s.into_bytes())
    }
}

/// A tagged value as carried in bus frames.
#[derive(Clone, PartialEq, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Buf(Buffer),
    List(Vec<Value>),
    Map(Map),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::I64(_) => "i64",
            Value::F64(_) => "f64",
            Value::Buf(_) => "buffer",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_buf(&self) -> Option<&Buffer> {
        match self {
            Value::Buf(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(val) => Some(*val),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(val) => Some(*val),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<Buffer> for Value {
    fn from(buf: Buffer) -> Self {
        Value::Buf(buf)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Buf(s.into())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::I64(i)
    }
}

/// A map with buffer keys.
///
/// Insertion order is preserved (and round-trips through the codec);
/// duplicate keys are rejected.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct Map(Vec<(Buffer, Value)>);

impl Map {
    pub fn new() -> Self {
        Map(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.0
            .iter()
            .find(|(k, _)| k.as_bytes() == key)
            .map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: impl Into<Buffer>, value: impl Into<Value>) -> Result<(), Error> {
        let key = key.into();

        if self.get(key.as_bytes()).is_some() {
            return Err(Error::new(
                ErrorKind::Invalid,
                format!("duplicate map key {:?}", key),
            ));
        }

        self.0.push((key, value.into()));
        Ok(())
    }

    /// Builder-style insert for literal keys.
    ///
    /// Panics on a duplicate key, which cannot happen for distinct literals.
    pub fn with(mut self, key: impl Into<Buffer>, value: impl Into<Value>) -> Self {
        self.insert(key, value).expect("duplicate literal map key");
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Buffer, &Value)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    /// Check the map against a schema and hand out the matched values.
    ///
    /// The result is aligned with `schema`; optional missing entries are
    /// None. Missing required keys and type mismatches fail with `Invalid`.
    pub fn validate<'a>(&'a self, schema: &[SchemaEntry]) -> Result<Vec<Option<&'a Value>>, Error> {
        let mut out = Vec::with_capacity(schema.len());

        for entry in schema {
            match self.get(entry.key.as_bytes()) {
                Some(value) => {
                    if !entry.expected.matches(value) {
                        return Err(Error::new(
                            ErrorKind::Invalid,
                            format!(
                                "key {:?} has type {}, expected {}",
                                entry.key,
                                value.type_name(),
                                entry.expected.name()
                            ),
                        ));
                    }
                    out.push(Some(value));
                }
                None if entry.required => {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        format!("missing required key {:?}", entry.key),
                    ));
                }
                None => out.push(None),
            }
        }

        Ok(out)
    }
}

impl IntoIterator for Map {
    type Item = (Buffer, Value);
    type IntoIter = std::vec::IntoIter<(Buffer, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl From<Map> for Value {
    fn from(map: Map) -> Self {
        Value::Map(map)
    }
}

/// Expected type of a schema entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Any,
    Null,
    Bool,
    I64,
    F64,
    Buf,
    List,
    Map,
}

impl ValueType {
    fn matches(self, value: &Value) -> bool {
        match (self, value) {
            (ValueType::Any, _) => true,
            (ValueType::Null, Value::Null) => true,
            (ValueType::Bool, Value::Bool(_)) => true,
            (ValueType::I64, Value::I64(_)) => true,
            (ValueType::F64, Value::F64(_)) => true,
            (ValueType::Buf, Value::Buf(_)) => true,
            (ValueType::List, Value::List(_)) => true,
            (ValueType::Map, Value::Map(_)) => true,
            _ => false,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ValueType::Any => "any",
            ValueType::Null => "null",
            ValueType::Bool => "bool",
            ValueType::I64 => "i64",
            ValueType::F64 => "f64",
            ValueType::Buf => "buffer",
            ValueType::List => "list",
            ValueType::Map => "map",
        }
    }
}

/// One entry of a map schema, see [`Map::validate`].
pub struct SchemaEntry {
    pub key: &'static str,
    pub required: bool,
    pub expected: ValueType,
}

impl SchemaEntry {
    pub const fn required(key: &'static str, expected: ValueType) -> Self {
        SchemaEntry {
            key,
            required: true,
            expected,
        }
    }

    pub const fn optional(key: &'static str, expected: ValueType) -> Self {
        SchemaEntry {
            key,
            required: false,
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Map, SchemaEntry, Value, ValueType};

    #[test]
    fn map_rejects_duplicate_keys() {
        let mut map = Map::new();

        map.insert("topic", "a/b").unwrap();
        assert!(map.insert("topic", "c/d").is_err());

        assert_eq!(map.len(), 1);
        assert_eq!(map.get(b"topic"), Some(&Value::from("a/b")));
    }

    #[test]
    fn map_preserves_insertion_order() {
        let map = Map::new()
            .with("b", 1i64)
            .with("a", 2i64)
            .with("c", 3i64);

        let keys: Vec<_> = map.iter().map(|(k, _)| k.to_string_lossy().into_owned()).collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn validate_matches_schema() {
        let map = Map::new()
            .with("topic", "a/b")
            .with("qos", 1i64);

        let schema = [
            SchemaEntry::required("topic", ValueType::Buf),
            SchemaEntry::optional("payload", ValueType::Buf),
            SchemaEntry::optional("qos", ValueType::I64),
        ];

        let out = map.validate(&schema).unwrap();
        assert_eq!(out[0], Some(&Value::from("a/b")));
        assert_eq!(out[1], None);
        assert_eq!(out[2], Some(&Value::I64(1)));
    }

    #[test]
    fn validate_rejects_missing_and_mistyped() {
        let map = Map::new().with("qos", "not a number");

        let missing = [SchemaEntry::required("topic", ValueType::Buf)];
        assert!(map.validate(&missing).is_err());

        let mistyped = [SchemaEntry::optional("qos", ValueType::I64)];
        assert!(map.validate(&mistyped).is_err());
    }
}
