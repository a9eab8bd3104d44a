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

//! The configuration store behind the `gg_config` interface.
//!
//! Values live in a tree addressed by key paths. Every node carries the
//! timestamp of the write that produced it; a write older than what is
//! stored is accepted but takes no effect, so replayed deployments cannot
//! roll the configuration back. Map values merge into subtrees instead of
//! replacing them.
//!
//! The whole tree is snapshotted to disk after each effective write
//! (write to a temporary file, then rename) and loaded back on startup.
//! A JSON import file can seed an empty store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_std::sync::Mutex;
use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::OnceCell;

use crate::bus::{Handle, Handler, Method, Server, StreamObserver, StreamSink};
use crate::error::{Error, ErrorKind};
use crate::gg_config::MAX_KEY_PATH_DEPTH;
use crate::object::{
    deserialize_bounded, serialize_bounded, Buffer, Map, SchemaEntry, Value, ValueType,
};

/// Interface name of the private IPC surface (system config lookups).
pub const PRIVATE_INTERFACE: &str = "aws.greengrass.ipc.private";

/// Capacity of the change subscriber table.
pub const MAX_CONFIG_SUBSCRIBERS: usize = 64;

/// Depth bound for the on-disk snapshot.
///
/// Each tree level wraps its children in two extra maps, so this is well
/// above twice the key path depth plus the value depth.
const SNAPSHOT_DEPTH: usize = 64;

struct ConfigNode {
    timestamp: i64,
    value: NodeValue,
}

enum NodeValue {
    Leaf(Value),
    Branch(Vec<(Buffer, ConfigNode)>),
}

impl ConfigNode {
    fn empty_branch() -> Self {
        ConfigNode {
            timestamp: 0,
            value: NodeValue::Branch(Vec::new()),
        }
    }

    /// Apply a write to this node. Returns whether anything changed.
    fn merge(&mut self, value: &Value, timestamp: i64) -> bool {
        match value {
            Value::Map(map) => {
                if let NodeValue::Leaf(_) = self.value {
                    if timestamp < self.timestamp {
                        return false;
                    }
                    self.value = NodeValue::Branch(Vec::new());
                    self.timestamp = timestamp;
                }

                let children = match &mut self.value {
                    NodeValue::Branch(children) => children,
                    NodeValue::Leaf(_) => return false,
                };

                let mut changed = false;

                for (key, child_value) in map.iter() {
                    let index = match children.iter().position(|(k, _)| k == key) {
                        Some(index) => index,
                        None => {
                            children.push((key.clone(), ConfigNode::empty_branch()));
                            children.len() - 1
                        }
                    };

                    changed |= children[index].1.merge(child_value, timestamp);
                }

                if changed && timestamp > self.timestamp {
                    self.timestamp = timestamp;
                }

                changed
            }
            other => {
                if timestamp < self.timestamp {
                    return false;
                }

                self.timestamp = timestamp;
                self.value = NodeValue::Leaf(other.clone());
                true
            }
        }
    }

    fn descend(&self, key_path: &[Buffer]) -> Option<&ConfigNode> {
        let mut node = self;

        for key in key_path {
            match &node.value {
                NodeValue::Branch(children) => {
                    node = children
                        .iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, child)| child)?;
                }
                NodeValue::Leaf(_) => return None,
            }
        }

        Some(node)
    }

    /// Walk to the write target, converting and creating branches on the
    /// way. Returns None if an intermediate leaf is newer than the write.
    fn descend_mut(&mut self, key_path: &[Buffer], timestamp: i64) -> Option<&mut ConfigNode> {
        let mut node = self;

        for key in key_path {
            node = ConfigNode::step_mut(node, key, timestamp)?;
        }

        Some(node)
    }

    fn step_mut<'a>(
        node: &'a mut ConfigNode,
        key: &Buffer,
        timestamp: i64,
    ) -> Option<&'a mut ConfigNode> {
        if let NodeValue::Leaf(_) = node.value {
            if timestamp < node.timestamp {
                return None;
            }
            node.value = NodeValue::Branch(Vec::new());
            node.timestamp = timestamp;
        }

        let children = match &mut node.value {
            NodeValue::Branch(children) => children,
            NodeValue::Leaf(_) => return None,
        };

        let index = match children.iter().position(|(k, _)| k == key) {
            Some(index) => index,
            None => {
                children.push((key.clone(), ConfigNode::empty_branch()));
                children.len() - 1
            }
        };

        Some(&mut children[index].1)
    }

    /// Materialize the subtree as a value (branches become maps).
    fn materialize(&self) -> Value {
        match &self.value {
            NodeValue::Leaf(value) => value.clone(),
            NodeValue::Branch(children) => {
                let mut map = Map::new();

                for (key, child) in children {
                    // Keys are unique within a branch.
                    map.insert(key.clone(), child.materialize())
                        .expect("duplicate key in config branch");
                }

                Value::Map(map)
            }
        }
    }

    fn to_snapshot(&self) -> Value {
        let mut map = Map::new().with("t", self.timestamp);

        match &self.value {
            NodeValue::Leaf(value) => {
                map.insert("v", value.clone()).expect("duplicate key");
            }
            NodeValue::Branch(children) => {
                let mut child_map = Map::new();
                for (key, child) in children {
                    child_map
                        .insert(key.clone(), child.to_snapshot())
                        .expect("duplicate key in config branch");
                }
                map.insert("c", Value::Map(child_map)).expect("duplicate key");
            }
        }

        Value::Map(map)
    }

    fn from_snapshot(value: &Value) -> Result<Self, Error> {
        let map = value
            .as_map()
            .ok_or_else(|| Error::new(ErrorKind::Parse, "config snapshot node is not a map"))?;

        let timestamp = map
            .get(b"t")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::new(ErrorKind::Parse, "config snapshot node has no timestamp"))?;

        let value = if let Some(children) = map.get(b"c") {
            let children = children
                .as_map()
                .ok_or_else(|| Error::new(ErrorKind::Parse, "config snapshot children"))?;

            let mut nodes = Vec::new();
            for (key, child) in children.iter() {
                nodes.push((key.clone(), ConfigNode::from_snapshot(child)?));
            }

            NodeValue::Branch(nodes)
        } else if let Some(leaf) = map.get(b"v") {
            NodeValue::Leaf(leaf.clone())
        } else {
            return Err(Error::new(ErrorKind::Parse, "config snapshot node is empty"));
        };

        Ok(ConfigNode { timestamp, value })
    }
}

struct StoreInner {
    root: ConfigNode,
    subscribers: Vec<Option<(Vec<Buffer>, Handle)>>,
}

pub struct ConfigStore {
    inner: Mutex<StoreInner>,
    db_path: Option<PathBuf>,
    sink: OnceCell<Arc<dyn StreamSink>>,
}

impl ConfigStore {
    /// Open the store, loading the snapshot at `db_path` if one exists.
    pub fn open(db_path: Option<PathBuf>) -> Result<Arc<Self>, Error> {
        let root = match &db_path {
            Some(path) if path.is_file() => {
                let bytes = fs::read(path)?;
                let snapshot = deserialize_bounded(&bytes, SNAPSHOT_DEPTH, usize::MAX)?;
                info!("Loaded configuration from {}", path.display());
                ConfigNode::from_snapshot(&snapshot)?
            }
            Some(path) => {
                info!(
                    "Configuration snapshot {} does not exist yet, starting empty",
                    path.display()
                );
                ConfigNode::empty_branch()
            }
            None => ConfigNode::empty_branch(),
        };

        Ok(Arc::new(ConfigStore {
            inner: Mutex::new(StoreInner {
                root,
                subscribers: (0..MAX_CONFIG_SUBSCRIBERS).map(|_| None).collect(),
            }),
            db_path,
            sink: OnceCell::new(),
        }))
    }

    /// Wire up stream delivery (see [`crate::bus::StreamSink`]).
    pub fn set_sink(&self, sink: Arc<dyn StreamSink>) {
        if self.sink.set(sink).is_err() {
            panic!("config store sink set twice");
        }
    }

    /// Whether the store holds any configuration at all.
    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.lock().await;

        match &inner.root.value {
            NodeValue::Branch(children) => children.is_empty(),
            NodeValue::Leaf(_) => false,
        }
    }

    /// Seed the store from a JSON document.
    pub async fn import_json(&self, json: &serde_json::Value, timestamp: i64) -> Result<(), Error> {
        let value = json_to_value(json)?;
        self.write(&[], value, timestamp).await
    }

    pub async fn read(&self, key_path: &[Buffer]) -> Result<Value, Error> {
        check_depth(key_path)?;

        let inner = self.inner.lock().await;

        inner
            .root
            .descend(key_path)
            .map(ConfigNode::materialize)
            .ok_or_else(|| Error::new(ErrorKind::NoEntry, "no such configuration key"))
    }

    /// Write `value` at `key_path`.
    ///
    /// A write that is older than the stored state is a successful no-op.
    /// Subscribers overlapping the written path get the fresh value at
    /// their subscribed path; the snapshot is saved before they are
    /// notified.
    pub async fn write(
        &self,
        key_path: &[Buffer],
        value: Value,
        timestamp: i64,
    ) -> Result<(), Error> {
        check_depth(key_path)?;

        if timestamp < 0 {
            return Err(Error::new(ErrorKind::Invalid, "timestamp is negative"));
        }

        let mut inner = self.inner.lock().await;

        let changed = match inner.root.descend_mut(key_path, timestamp) {
            Some(node) => node.merge(&value, timestamp),
            None => false,
        };

        if !changed {
            debug!("Write to {:?} superseded by newer state", key_path);
            return Ok(());
        }

        if let Some(path) = &self.db_path {
            if let Err(err) = save_snapshot(path, &inner.root) {
                warn!("Could not save configuration snapshot: {}", err);
            }
        }

        self.notify_subscribers(&inner, key_path).await;

        Ok(())
    }

    async fn notify_subscribers(&self, inner: &StoreInner, written: &[Buffer]) {
        let sink = match self.sink.get() {
            Some(sink) => sink,
            None => return,
        };

        for entry in inner.subscribers.iter().flatten() {
            let (sub_path, handle) = entry;

            let overlap = sub_path
                .iter()
                .zip(written.iter())
                .all(|(a, b)| a == b);
            if !overlap {
                continue;
            }

            let value = inner
                .root
                .descend(sub_path)
                .map(ConfigNode::materialize)
                .unwrap_or(Value::Null);

            if let Err(err) = sink.push(*handle, value).await {
                debug!("Could not notify config subscriber {}: {}", handle, err);
            }
        }
    }

    pub async fn subscribe_path(&self, key_path: &[Buffer], handle: Handle) -> Result<(), Error> {
        check_depth(key_path)?;

        let mut inner = self.inner.lock().await;

        let slot = inner
            .subscribers
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or_else(|| Error::new(ErrorKind::NoMem, "config subscriber table full"))?;

        *slot = Some((key_path.to_vec(), handle));
        Ok(())
    }

    pub async fn unsubscribe_handle(&self, handle: Handle) {
        let mut inner = self.inner.lock().await;

        for slot in inner.subscribers.iter_mut() {
            if matches!(slot, Some((_, h)) if *h == handle) {
                *slot = None;
            }
        }
    }
}

fn check_depth(key_path: &[Buffer]) -> Result<(), Error> {
    if key_path.len() > MAX_KEY_PATH_DEPTH {
        return Err(Error::new(
            ErrorKind::Unsupported,
            "key path depth exceeds maximum handled",
        ));
    }

    Ok(())
}

fn save_snapshot(path: &Path, root: &ConfigNode) -> Result<(), Error> {
    let bytes = serialize_bounded(&root.to_snapshot(), SNAPSHOT_DEPTH)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tmp = path.to_owned();
    tmp.set_extension("tmp");

    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)?;

    Ok(())
}

fn json_to_value(json: &serde_json::Value) -> Result<Value, Error> {
    let value = match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(number) => {
            if let Some(i) = number.as_i64() {
                Value::I64(i)
            } else if let Some(f) = number.as_f64() {
                Value::F64(f)
            } else {
                return Err(Error::new(ErrorKind::Unsupported, "number out of range"));
            }
        }
        serde_json::Value::String(s) => Value::Buf(Buffer::from(s.as_str())),
        serde_json::Value::Array(items) => Value::List(
            items
                .iter()
                .map(json_to_value)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        serde_json::Value::Object(entries) => {
            let mut map = Map::new();
            for (key, item) in entries {
                map.insert(key.as_str(), json_to_value(item)?)?;
            }
            Value::Map(map)
        }
    };

    Ok(value)
}

fn key_path_param(value: Option<&Value>) -> Result<Vec<Buffer>, Error> {
    let items = value
        .and_then(Value::as_list)
        .ok_or_else(|| Error::new(ErrorKind::Invalid, "key_path must be a list"))?;

    items
        .iter()
        .map(|item| {
            item.as_buf()
                .cloned()
                .ok_or_else(|| Error::new(ErrorKind::Invalid, "key_path entries must be buffers"))
        })
        .collect()
}

/// Method table for the `gg_config` interface.
pub fn methods(store: Arc<ConfigStore>) -> Vec<Method> {
    vec![
        Method::unary("read", Arc::new(Read { store: store.clone() })),
        Method::unary("write", Arc::new(Write { store: store.clone() })),
        Method::stream("subscribe", Arc::new(SubscribePath { store })),
    ]
}

/// Method table for the private IPC interface.
pub fn private_methods(store: Arc<ConfigStore>) -> Vec<Method> {
    vec![Method::unary("GetSystemConfig", Arc::new(GetSystemConfig { store }))]
}

struct Read {
    store: Arc<ConfigStore>,
}

#[async_trait]
impl Handler for Read {
    async fn handle(
        &self,
        server: &Arc<Server>,
        handle: Handle,
        params: Map,
    ) -> Result<(), Error> {
        let key_path = key_path_param(params.get(b"key_path"))?;
        let value = self.store.read(&key_path).await?;

        server.respond(handle, value).await
    }
}

struct Write {
    store: Arc<ConfigStore>,
}

#[async_trait]
impl Handler for Write {
    async fn handle(
        &self,
        server: &Arc<Server>,
        handle: Handle,
        params: Map,
    ) -> Result<(), Error> {
        let args = params.validate(&[
            SchemaEntry::required("key_path", ValueType::List),
            SchemaEntry::required("value", ValueType::Any),
            SchemaEntry::required("timestamp", ValueType::I64),
        ])?;

        let key_path = key_path_param(args[0])?;
        let value = args[1].cloned().unwrap_or(Value::Null);
        let timestamp = args[2]
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::new(ErrorKind::Invalid, "missing timestamp"))?;

        self.store.write(&key_path, value, timestamp).await?;

        server.respond(handle, Value::Null).await
    }
}

struct SubscribePath {
    store: Arc<ConfigStore>,
}

struct ConfigSubClosed {
    store: Arc<ConfigStore>,
}

#[async_trait]
impl StreamObserver for ConfigSubClosed {
    async fn closed(&self, handle: Handle) {
        self.store.unsubscribe_handle(handle).await;
    }
}

#[async_trait]
impl Handler for SubscribePath {
    async fn handle(
        &self,
        server: &Arc<Server>,
        handle: Handle,
        params: Map,
    ) -> Result<(), Error> {
        let key_path = key_path_param(params.get(b"key_path"))?;

        // Register first: by the time the client sees the acceptance, no
        // write can slip past unobserved. A failed accept fires the close
        // observer, which takes the registration back out.
        self.store.subscribe_path(&key_path, handle).await?;

        server
            .sub_accept(
                handle,
                Arc::new(ConfigSubClosed {
                    store: self.store.clone(),
                }),
            )
            .await
    }
}

struct GetSystemConfig {
    store: Arc<ConfigStore>,
}

#[async_trait]
impl Handler for GetSystemConfig {
    async fn handle(
        &self,
        server: &Arc<Server>,
        handle: Handle,
        params: Map,
    ) -> Result<(), Error> {
        let key = params
            .get(b"key")
            .and_then(Value::as_buf)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Invalid, "missing key"))?;

        let key_path = [Buffer::from("system"), key];
        let value = self.store.read(&key_path).await?;

        server.respond(handle, value).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_std::task::{self, block_on};

    use super::{json_to_value, methods, private_methods, ConfigStore, PRIVATE_INTERFACE};
    use crate::bus::{call, subscribe, ChannelObserver, Server};
    use crate::error::ErrorKind;
    use crate::gg_config;
    use crate::object::{Buffer, Map, Value};
    use crate::testutil::{init_socket_dir, wait_for_interface};

    fn path(parts: &[&str]) -> Vec<Buffer> {
        parts.iter().map(|p| Buffer::from(*p)).collect()
    }

    fn store() -> Arc<ConfigStore> {
        ConfigStore::open(None).unwrap()
    }

    #[test]
    fn write_then_read_subtree() {
        block_on(async {
            let store = store();

            store
                .write(
                    &path(&["services", "nucleus"]),
                    Value::Map(Map::new().with("endpoint", "example.com")),
                    1,
                )
                .await
                .unwrap();

            let value = store
                .read(&path(&["services", "nucleus", "endpoint"]))
                .await
                .unwrap();
            assert_eq!(value, Value::from("example.com"));

            let subtree = store.read(&path(&["services"])).await.unwrap();
            let map = subtree.as_map().unwrap();
            assert!(map.get(b"nucleus").is_some());

            let err = store.read(&path(&["missing"])).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NoEntry);
        });
    }

    #[test]
    fn newer_timestamp_wins() {
        block_on(async {
            let store = store();
            let key = path(&["system", "thingName"]);

            store
                .write(&key, Value::from("current"), 100)
                .await
                .unwrap();

            // A stale replay is accepted but changes nothing.
            store.write(&key, Value::from("stale"), 50).await.unwrap();
            assert_eq!(
                store.read(&key).await.unwrap(),
                Value::from("current")
            );

            store.write(&key, Value::from("newer"), 150).await.unwrap();
            assert_eq!(store.read(&key).await.unwrap(), Value::from("newer"));
        });
    }

    #[test]
    fn map_writes_merge() {
        block_on(async {
            let store = store();

            store
                .write(
                    &path(&["services"]),
                    Value::Map(Map::new().with("a", 1i64)),
                    1,
                )
                .await
                .unwrap();
            store
                .write(
                    &path(&["services"]),
                    Value::Map(Map::new().with("b", 2i64)),
                    2,
                )
                .await
                .unwrap();

            let value = store.read(&path(&["services"])).await.unwrap();
            let map = value.as_map().unwrap();
            assert_eq!(map.get(b"a"), Some(&Value::I64(1)));
            assert_eq!(map.get(b"b"), Some(&Value::I64(2)));
        });
    }

    #[test]
    fn snapshot_round_trips() {
        block_on(async {
            let dir = init_socket_dir();
            let db = dir.join("config-roundtrip.db");
            let _ = std::fs::remove_file(&db);

            {
                let store = ConfigStore::open(Some(db.clone())).unwrap();
                store
                    .write(&path(&["system", "thingName"]), Value::from("edge-1"), 7)
                    .await
                    .unwrap();
            }

            let store = ConfigStore::open(Some(db)).unwrap();
            assert_eq!(
                store
                    .read(&path(&["system", "thingName"]))
                    .await
                    .unwrap(),
                Value::from("edge-1")
            );

            // The stored timestamp survives too.
            store
                .write(&path(&["system", "thingName"]), Value::from("stale"), 3)
                .await
                .unwrap();
            assert_eq!(
                store
                    .read(&path(&["system", "thingName"]))
                    .await
                    .unwrap(),
                Value::from("edge-1")
            );
        });
    }

    #[test]
    fn json_import() {
        block_on(async {
            let store = store();

            let json: serde_json::Value = serde_json::from_str(
                r#"{"system": {"thingName": "edge-1", "ports": [1, 2]}}"#,
            )
            .unwrap();

            store.import_json(&json, 1).await.unwrap();

            assert_eq!(
                store
                    .read(&path(&["system", "thingName"]))
                    .await
                    .unwrap(),
                Value::from("edge-1")
            );
            assert_eq!(
                store.read(&path(&["system", "ports"])).await.unwrap(),
                Value::List(vec![Value::I64(1), Value::I64(2)])
            );
        });
    }

    #[test]
    fn json_conversion_covers_scalars() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"a": null, "b": true, "c": 1.5}"#).unwrap();

        let value = json_to_value(&json).unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map.get(b"a"), Some(&Value::Null));
        assert_eq!(map.get(b"b"), Some(&Value::Bool(true)));
        assert_eq!(map.get(b"c"), Some(&Value::F64(1.5)));
    }

    #[test]
    fn interface_round_trip_with_subscription() {
        init_socket_dir();

        block_on(async {
            let store = store();

            let server = Server::new(gg_config::INTERFACE, methods(store.clone()));
            store.set_sink(server.clone());
            let listener = server.clone();
            task::spawn(async move {
                let _ = listener.listen().await;
            });
            wait_for_interface(gg_config::INTERFACE).await;

            let private = Server::new(
                PRIVATE_INTERFACE,
                private_methods(store.clone()),
            );
            let private_listener = private.clone();
            task::spawn(async move {
                let _ = private_listener.listen().await;
            });
            wait_for_interface(PRIVATE_INTERFACE).await;

            // Subscribe before writing; every effective write at or below
            // the path pushes the current value.
            let (observer, rx) = ChannelObserver::new();
            gg_config::subscribe(&path(&["system"]), observer)
                .await
                .unwrap();

            gg_config::write(&path(&["system", "thingName"]), Value::from("edge-1"), 1)
                .await
                .unwrap();

            let update = rx.recv().await.unwrap();
            let map = update.as_map().unwrap();
            assert_eq!(map.get(b"thingName"), Some(&Value::from("edge-1")));

            assert_eq!(
                gg_config::read_str(&path(&["system", "thingName"]))
                    .await
                    .unwrap(),
                "edge-1"
            );

            let err = gg_config::read(&path(&["system", "missing"]))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NoEntry);

            // The private interface resolves keys below "system".
            let value = call(
                PRIVATE_INTERFACE,
                "GetSystemConfig",
                Map::new().with("key", "thingName"),
            )
            .await
            .unwrap();
            assert_eq!(value, Value::from("edge-1"));
        });
    }
}
