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

//! Typed client helpers for the `gg_config` interface.
//!
//! Key paths are lists of buffers addressing into the configuration tree,
//! at most [`MAX_KEY_PATH_DEPTH`] levels deep. Errors the config daemon
//! reports come back with their original kind instead of `Remote`, so
//! callers can treat a remote `NoEntry` like a local one.

use std::sync::Arc;

use crate::bus::{self, Handle, SubscriptionObserver};
use crate::error::{Error, ErrorKind};
use crate::object::{Buffer, Map, Value};

/// Interface name of the configuration daemon.
pub const INTERFACE: &str = "gg_config";

/// Maximum depth of a configuration key path.
pub const MAX_KEY_PATH_DEPTH: usize = 10;

fn key_path_value(key_path: &[Buffer]) -> Result<Value, Error> {
    if key_path.len() > MAX_KEY_PATH_DEPTH {
        return Err(Error::new(
            ErrorKind::Unsupported,
            "key path depth exceeds maximum handled",
        ));
    }

    Ok(Value::List(
        key_path.iter().cloned().map(Value::Buf).collect(),
    ))
}

fn flatten_remote(err: Error) -> Error {
    match (err.kind(), err.remote_kind()) {
        (ErrorKind::Remote, Some(kind)) => {
            Error::new(kind, "reported by the config daemon")
        }
        _ => err,
    }
}

/// Read the configuration value at `key_path`.
pub async fn read(key_path: &[Buffer]) -> Result<Value, Error> {
    let params = Map::new().with("key_path", key_path_value(key_path)?);

    bus::call(INTERFACE, "read", params)
        .await
        .map_err(flatten_remote)
}

/// Read a configuration value that must be a UTF-8 string.
pub async fn read_str(key_path: &[Buffer]) -> Result<String, Error> {
    let value = read(key_path).await?;

    let buf = value
        .as_buf()
        .ok_or_else(|| Error::new(ErrorKind::Config, "configuration value is not a string"))?;

    String::from_utf8(buf.as_bytes().to_vec())
        .map_err(|_| Error::new(ErrorKind::Config, "configuration value is not UTF-8"))
}

/// Write `value` at `key_path` with a write timestamp.
///
/// An existing value with a newer timestamp wins; the write then succeeds
/// without taking effect.
pub async fn write(key_path: &[Buffer], value: Value, timestamp: i64) -> Result<(), Error> {
    if timestamp < 0 {
        return Err(Error::new(ErrorKind::Unsupported, "timestamp is negative"));
    }

    let params = Map::new()
        .with("key_path", key_path_value(key_path)?)
        .with("value", value)
        .with("timestamp", timestamp);

    bus::call(INTERFACE, "write", params)
        .await
        .map(|_| ())
        .map_err(flatten_remote)
}

/// Subscribe to changes at or below `key_path`.
///
/// Every message carries the current value at the subscribed path.
pub async fn subscribe(
    key_path: &[Buffer],
    observer: Arc<dyn SubscriptionObserver>,
) -> Result<Handle, Error> {
    let params = Map::new().with("key_path", key_path_value(key_path)?);

    bus::subscribe(INTERFACE, "subscribe", params, observer)
        .await
        .map_err(flatten_remote)
}
