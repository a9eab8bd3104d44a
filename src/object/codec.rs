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

//! Tag-length-value codec for [`Value`].
//!
//! One tag byte per value, fixed-width little-endian integers, u32 length
//! prefixes for buffers and element counts for containers. Children are
//! encoded recursively in order, so map insertion order survives a round
//! trip. Depth counts container nesting; scalars are free.

use std::convert::{TryFrom, TryInto};

use super::{Buffer, Map, Value, MAX_OBJECT_DEPTH};
use crate::error::{Error, ErrorKind};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_BUF: u8 = 4;
const TAG_LIST: u8 = 5;
const TAG_MAP: u8 = 6;

// Rough per-element bookkeeping cost charged against the decode budget in
// addition to actual byte content.
const ELEMENT_COST: usize = 8;

/// Encode a value using the default depth bound.
pub fn serialize(value: &Value) -> Result<Vec<u8>, Error> {
    serialize_bounded(value, MAX_OBJECT_DEPTH)
}

/// Encode a value, allowing at most `max_depth` levels of container nesting.
pub fn serialize_bounded(value: &Value, max_depth: usize) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    encode_value(&mut out, value, max_depth)?;
    Ok(out)
}

/// Decode a value using the default depth bound and no byte budget.
///
/// Allocations are inherently bounded by the input length, so the budget
/// only matters for callers that hand out fixed decode arenas.
pub fn deserialize(bytes: &[u8]) -> Result<Value, Error> {
    deserialize_bounded(bytes, MAX_OBJECT_DEPTH, usize::MAX)
}

/// Decode a value, allowing at most `max_depth` levels of container nesting
/// and charging decoded content against `arena` bytes.
///
/// Fails with `NoMem` if the budget is exhausted, `Unsupported` if nesting
/// exceeds the bound and `Parse` on malformed input. Trailing bytes after
/// the value are malformed input.
pub fn deserialize_bounded(bytes: &[u8], max_depth: usize, arena: usize) -> Result<Value, Error> {
    let mut reader = Reader { rest: bytes };
    let mut budget = arena;

    let value = decode_value(&mut reader, max_depth, &mut budget)?;

    if !reader.rest.is_empty() {
        return Err(Error::new(
            ErrorKind::Parse,
            format!("{} trailing bytes after value", reader.rest.len()),
        ));
    }

    Ok(value)
}

fn encode_value(out: &mut Vec<u8>, value: &Value, depth: usize) -> Result<(), Error> {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(val) => {
            out.push(TAG_BOOL);
            out.push(*val as u8);
        }
        Value::I64(val) => {
            out.push(TAG_I64);
            out.extend_from_slice(&val.to_le_bytes());
        }
        Value::F64(val) => {
            out.push(TAG_F64);
            out.extend_from_slice(&val.to_le_bytes());
        }
        Value::Buf(buf) => {
            out.push(TAG_BUF);
            encode_len(out, buf.len())?;
            out.extend_from_slice(buf.as_bytes());
        }
        Value::List(items) => {
            if depth == 0 {
                return Err(depth_error());
            }
            out.push(TAG_LIST);
            encode_len(out, items.len())?;
            for item in items {
                encode_value(out, item, depth - 1)?;
            }
        }
        Value::Map(map) => {
            if depth == 0 {
                return Err(depth_error());
            }
            out.push(TAG_MAP);
            encode_len(out, map.len())?;
            for (key, item) in map.iter() {
                encode_len(out, key.len())?;
                out.extend_from_slice(key.as_bytes());
                encode_value(out, item, depth - 1)?;
            }
        }
    }

    Ok(())
}

fn encode_len(out: &mut Vec<u8>, len: usize) -> Result<(), Error> {
    let len = u32::try_from(len)
        .map_err(|_| Error::new(ErrorKind::Range, "length exceeds u32"))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

fn depth_error() -> Error {
    Error::new(ErrorKind::Unsupported, "value nesting exceeds depth bound")
}

struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.rest.len() < len {
            return Err(Error::new(ErrorKind::Parse, "truncated value"));
        }

        let (head, tail) = self.rest.split_at(len);
        self.rest = tail;
        Ok(head)
    }

    fn take_u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }
}

fn charge(budget: &mut usize, cost: usize) -> Result<(), Error> {
    if *budget < cost {
        return Err(Error::new(ErrorKind::NoMem, "decode arena exhausted"));
    }

    if *budget != usize::MAX {
        *budget -= cost;
    }

    Ok(())
}

fn decode_value(reader: &mut Reader, depth: usize, budget: &mut usize) -> Result<Value, Error> {
    let tag = reader.take_u8()?;

    let value = match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => match reader.take_u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            byte => {
                return Err(Error::new(
                    ErrorKind::Parse,
                    format!("invalid bool byte {}", byte),
                ));
            }
        },
        TAG_I64 => {
            let bytes = reader.take(8)?;
            Value::I64(i64::from_le_bytes(bytes.try_into().unwrap()))
        }
        TAG_F64 => {
            let bytes = reader.take(8)?;
            Value::F64(f64::from_le_bytes(bytes.try_into().unwrap()))
        }
        TAG_BUF => {
            let len = reader.take_u32()? as usize;
            let bytes = reader.take(len)?;
            charge(budget, len + ELEMENT_COST)?;
            Value::Buf(Buffer::from(bytes))
        }
        TAG_LIST => {
            if depth == 0 {
                return Err(depth_error());
            }

            let count = reader.take_u32()? as usize;
            let mut items = Vec::new();

            for _ in 0..count {
                charge(budget, ELEMENT_COST)?;
                items.push(decode_value(reader, depth - 1, budget)?);
            }

            Value::List(items)
        }
        TAG_MAP => {
            if depth == 0 {
                return Err(depth_error());
            }

            let count = reader.take_u32()? as usize;
            let mut map = Map::new();

            for _ in 0..count {
                let key_len = reader.take_u32()? as usize;
                let key = Buffer::from(reader.take(key_len)?);
                charge(budget, key_len + ELEMENT_COST)?;
                let item = decode_value(reader, depth - 1, budget)?;
                map.insert(key, item)?;
            }

            Value::Map(map)
        }
        tag => {
            return Err(Error::new(
                ErrorKind::Parse,
                format!("unknown value tag {}", tag),
            ));
        }
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::{deserialize, deserialize_bounded, serialize, serialize_bounded};
    use crate::error::ErrorKind;
    use crate::object::{Buffer, Map, Value, MAX_OBJECT_DEPTH};

    fn nested_maps(levels: usize) -> Value {
        let mut value = Value::I64(0);

        for _ in 0..levels {
            value = Value::Map(Map::new().with("k", value));
        }

        value
    }

    #[test]
    fn round_trip_publish_map() {
        let value = Value::Map(
            Map::new()
                .with("topic", "a/b")
                .with("qos", 1i64)
                .with("payload", Buffer::from("hi")),
        );

        let bytes = serialize(&value).unwrap();
        assert_eq!(deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn round_trip_all_variants() {
        let value = Value::List(vec![
            Value::Null,
            Value::Bool(true),
            Value::I64(-42),
            Value::F64(2.5),
            Value::Buf(Buffer::from(&b"\x00\xff"[..])),
            Value::Map(Map::new().with("inner", Value::List(vec![]))),
        ]);

        let bytes = serialize(&value).unwrap();
        assert_eq!(deserialize(&bytes).unwrap(), value);
    }

    #[test]
    fn insertion_order_survives() {
        let forward = Value::Map(Map::new().with("a", 1i64).with("b", 2i64));
        let backward = Value::Map(Map::new().with("b", 2i64).with("a", 1i64));

        assert_ne!(serialize(&forward).unwrap(), serialize(&backward).unwrap());

        let restored = deserialize(&serialize(&backward).unwrap()).unwrap();
        assert_eq!(restored, backward);
    }

    #[test]
    fn depth_bound_is_enforced() {
        let ok = nested_maps(MAX_OBJECT_DEPTH);
        let bytes = serialize(&ok).unwrap();
        assert_eq!(deserialize(&bytes).unwrap(), ok);

        let too_deep = nested_maps(MAX_OBJECT_DEPTH + 1);
        let err = serialize(&too_deep).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);

        // A decoder with a raised bound can produce bytes the default
        // decoder must reject.
        let bytes = serialize_bounded(&too_deep, MAX_OBJECT_DEPTH + 1).unwrap();
        let err = deserialize(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn duplicate_map_keys_rejected() {
        // Hand-build a map with the key "k" twice.
        let mut bytes = vec![6u8];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        for _ in 0..2 {
            bytes.extend_from_slice(&1u32.to_le_bytes());
            bytes.push(b'k');
            bytes.push(0); // null value
        }

        let err = deserialize(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[test]
    fn truncated_input_rejected() {
        let bytes = serialize(&Value::Buf(Buffer::from("hello"))).unwrap();
        let err = deserialize(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = serialize(&Value::Null).unwrap();
        bytes.push(0);

        let err = deserialize(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn small_arena_fails_nomem() {
        let value = Value::Buf(Buffer::from(vec![0u8; 128]));
        let bytes = serialize(&value).unwrap();

        assert_eq!(
            deserialize_bounded(&bytes, MAX_OBJECT_DEPTH, 1024).unwrap(),
            value
        );

        let err = deserialize_bounded(&bytes, MAX_OBJECT_DEPTH, 16).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoMem);
    }
}
