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

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_std::os::unix::net::{UnixListener, UnixStream};
use async_std::prelude::*;
use async_std::task;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use nix::sys::stat::{fchmodat, FchmodatFlags, Mode};

use super::frame::{read_frame, Frame, RequestType};
use super::handle::{Handle, HandleKind, HandleTable};
use super::socket_path;
use crate::error::{Error, ErrorKind};
use crate::object::{Map, Value};

/// Capacity of the per-server stream handle table.
pub const MAX_STREAMS: usize = 64;

/// A method handler registered on an interface.
///
/// The handler must answer the call through the server it is given: either
/// [`Server::respond`] for a unary reply or [`Server::sub_accept`] to turn
/// the call into a stream. Returning an error sends an ErrorResponse (or
/// closes the stream if the call was already accepted).
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        server: &Arc<Server>,
        handle: Handle,
        params: Map,
    ) -> Result<(), Error>;
}

/// Callback for server-side stream teardown.
///
/// Fires exactly once per accepted stream, whichever side initiated the
/// close, and never before the last message to that stream was sent.
#[async_trait]
pub trait StreamObserver: Send + Sync {
    async fn closed(&self, handle: Handle);
}

/// Destination for stream pushes, abstracting over the server.
///
/// Components that hold stream handles (the MQTT dispatcher, the config
/// store) deliver through this seam so they can be exercised without a
/// socket behind them.
#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn push(&self, handle: Handle, value: Value) -> Result<(), Error>;
    async fn close(&self, handle: Handle);
}

#[async_trait]
impl StreamSink for Server {
    async fn push(&self, handle: Handle, value: Value) -> Result<(), Error> {
        self.sub_respond(handle, value).await
    }

    async fn close(&self, handle: Handle) {
        self.sub_close(handle).await
    }
}

/// Descriptor for one method of an interface.
pub struct Method {
    pub name: &'static str,
    pub is_subscription: bool,
    pub handler: Arc<dyn Handler>,
}

impl Method {
    pub fn unary(name: &'static str, handler: Arc<dyn Handler>) -> Self {
        Method {
            name,
            is_subscription: false,
            handler,
        }
    }

    pub fn stream(name: &'static str, handler: Arc<dyn Handler>) -> Self {
        Method {
            name,
            is_subscription: true,
            handler,
        }
    }
}

struct Connection {
    id: u64,
    stream: Arc<UnixStream>,
    write_lock: async_std::sync::Mutex<()>,
    alive: AtomicBool,
    next_stream_id: AtomicI32,
}

impl Connection {
    async fn send(&self, frame: &Frame) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut writer = &*self.stream;
        super::frame::write_frame(&mut writer, frame).await
    }
}

struct StreamSlot {
    conn: Arc<Connection>,
    stream_id: i32,
    accepted: bool,
    notify: bool,
    subscription: bool,
    observer: Option<Arc<dyn StreamObserver>>,
}

/// One bus interface: a socket, its method table and the streams served
/// over it.
pub struct Server {
    interface: String,
    methods: Vec<Method>,
    streams: Mutex<HandleTable<StreamSlot>>,
    next_conn_id: AtomicU64,
}

impl Server {
    pub fn new(interface: impl Into<String>, methods: Vec<Method>) -> Arc<Self> {
        Arc::new(Server {
            interface: interface.into(),
            methods,
            streams: Mutex::new(HandleTable::new(HandleKind::Stream, MAX_STREAMS)),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Bind the interface socket and serve connections until the listener
    /// fails.
    ///
    /// Each accepted connection gets its own task; frames on one
    /// connection are handled sequentially.
    pub async fn listen(self: &Arc<Self>) -> Result<(), Error> {
        let path = socket_path(&self.interface);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // A stale socket file from a previous run would make bind fail.
        match fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let listener = UnixListener::bind(&path).await?;

        if let Err(err) = fchmodat(
            None,
            &path,
            Mode::from_bits_truncate(0o666),
            FchmodatFlags::FollowSymlink,
        ) {
            warn!("Could not set permissions on {}: {}", path.display(), err);
        }

        info!("Interface {} listening on {}", self.interface, path.display());

        let mut incoming = listener.incoming();

        while let Some(stream) = incoming.next().await {
            match stream {
                Ok(stream) => {
                    let conn = Arc::new(Connection {
                        id: self.next_conn_id.fetch_add(1, Ordering::Relaxed),
                        stream: Arc::new(stream),
                        write_lock: async_std::sync::Mutex::new(()),
                        alive: AtomicBool::new(true),
                        next_stream_id: AtomicI32::new(1),
                    });

                    let server = self.clone();
                    task::spawn(async move {
                        handle_connection(server, conn).await;
                    });
                }
                Err(err) => warn!("Accept on {} failed: {}", self.interface, err),
            }
        }

        Err(Error::new(ErrorKind::NoConn, "listener closed"))
    }

    async fn dispatch(self: &Arc<Self>, conn: &Arc<Connection>, frame: Frame) {
        let is_call = frame.request_type == RequestType::Call;
        let method_name = frame.method.unwrap_or_default();

        let method = match self
            .methods
            .iter()
            .find(|m| m.name.as_bytes() == method_name.as_bytes())
        {
            Some(method) => method,
            None => {
                debug!(
                    "No method {:?} on interface {}",
                    method_name, self.interface
                );
                if is_call {
                    let _ = conn.send(&Frame::error(ErrorKind::NoEntry)).await;
                }
                return;
            }
        };

        let params = match frame.payload {
            Value::Map(map) => map,
            Value::Null => Map::new(),
            other => {
                debug!(
                    "Method {:?} called with {} params instead of a map",
                    method_name,
                    other.type_name()
                );
                if is_call {
                    let _ = conn.send(&Frame::error(ErrorKind::Invalid)).await;
                }
                return;
            }
        };

        let slot = StreamSlot {
            conn: conn.clone(),
            stream_id: 0,
            accepted: false,
            notify: !is_call,
            subscription: method.is_subscription,
            observer: None,
        };

        // Bind the insert result first so the table guard is released
        // before any frame is written.
        let inserted = self.streams.lock().unwrap().insert(slot);

        let handle = match inserted {
            Ok(handle) => handle,
            Err(err) => {
                warn!("Cannot track call to {:?}: {}", method_name, err);
                if is_call {
                    let _ = conn.send(&Frame::error(ErrorKind::NoMem)).await;
                }
                return;
            }
        };

        match method.handler.handle(self, handle, params).await {
            Ok(()) => {
                // A well-behaved handler has responded or accepted by now.
                if self.take_if_pending(handle).is_some() {
                    error!(
                        "Handler for {}.{:?} returned without responding",
                        self.interface, method_name
                    );
                    if is_call {
                        let _ = conn.send(&Frame::error(ErrorKind::Failure)).await;
                    }
                }
            }
            Err(err) => {
                debug!(
                    "Method {}.{:?} failed: {}",
                    self.interface, method_name, err
                );

                if self.take_if_pending(handle).is_some() {
                    if is_call {
                        let _ = conn.send(&Frame::error(err.kind())).await;
                    }
                } else {
                    // The stream was already accepted. The only consistent
                    // way to report the failure is to close it.
                    self.sub_close(handle).await;
                }
            }
        }
    }

    fn take_if_pending(&self, handle: Handle) -> Option<StreamSlot> {
        let mut streams = self.streams.lock().unwrap();

        match streams.get(handle) {
            Some(slot) if !slot.accepted => streams.remove(handle),
            _ => None,
        }
    }

    /// Send the unary reply for an in-flight call.
    ///
    /// For a notification this only releases the call state; no frame is
    /// written.
    pub async fn respond(&self, handle: Handle, value: Value) -> Result<(), Error> {
        let slot = self
            .take_if_pending(handle)
            .ok_or_else(|| Error::new(ErrorKind::NoConn, "no pending call for handle"))?;

        if slot.notify {
            return Ok(());
        }

        slot.conn.send(&Frame::response(0, value)).await
    }

    /// Upgrade an in-flight call into a long-lived stream.
    ///
    /// After this returns the handler (or anyone holding the handle) may
    /// push messages with [`Server::sub_respond`] until the stream closes.
    /// `observer` fires exactly once when it does.
    pub async fn sub_accept(
        &self,
        handle: Handle,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<(), Error> {
        let (conn, stream_id) = {
            let mut streams = self.streams.lock().unwrap();

            let slot = streams
                .get_mut(handle)
                .ok_or_else(|| Error::new(ErrorKind::NoConn, "no pending call for handle"))?;

            if slot.accepted {
                return Err(Error::new(ErrorKind::Invalid, "stream already accepted"));
            }
            if slot.notify || !slot.subscription {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    "method cannot be upgraded to a stream",
                ));
            }

            let stream_id = slot.conn.next_stream_id.fetch_add(1, Ordering::Relaxed);
            slot.stream_id = stream_id;
            slot.accepted = true;
            slot.observer = Some(observer);

            (slot.conn.clone(), stream_id)
        };

        if let Err(err) = conn.send(&Frame::response(stream_id, Value::Null)).await {
            self.close_stream(handle, false).await;
            return Err(err);
        }

        Ok(())
    }

    /// Push one message to an accepted stream.
    pub async fn sub_respond(&self, handle: Handle, value: Value) -> Result<(), Error> {
        let (conn, stream_id) = {
            let streams = self.streams.lock().unwrap();

            match streams.get(handle) {
                Some(slot) if slot.accepted => (slot.conn.clone(), slot.stream_id),
                _ => return Err(Error::new(ErrorKind::NoConn, "no such stream")),
            }
        };

        if !conn.alive.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::NoConn, "connection is gone"));
        }

        conn.send(&Frame::stream_message(stream_id, value))
            .await
            .map_err(|err| Error::new(ErrorKind::NoConn, err.to_string()))
    }

    /// Terminate a stream from the server side.
    ///
    /// The peer receives a StreamClose frame and the stream's observer
    /// fires. Closing an already-closed handle is a no-op.
    pub async fn sub_close(&self, handle: Handle) {
        self.close_stream(handle, true).await;
    }

    async fn close_stream(&self, handle: Handle, send_close: bool) {
        let slot = match self.streams.lock().unwrap().remove(handle) {
            Some(slot) => slot,
            None => return,
        };

        if send_close && slot.accepted && slot.conn.alive.load(Ordering::Acquire) {
            let _ = slot.conn.send(&Frame::stream_close(slot.stream_id)).await;
        }

        if let Some(observer) = slot.observer {
            observer.closed(handle).await;
        }
    }

    async fn peer_closed_stream(&self, conn: &Connection, stream_id: i32) {
        let removed = self
            .streams
            .lock()
            .unwrap()
            .remove_matching(|slot| slot.conn.id == conn.id && slot.stream_id == stream_id && slot.accepted);

        for (handle, slot) in removed {
            if let Some(observer) = slot.observer {
                observer.closed(handle).await;
            }
        }
    }

    async fn drop_connection(&self, conn: &Connection) {
        conn.alive.store(false, Ordering::Release);

        let removed = self
            .streams
            .lock()
            .unwrap()
            .remove_matching(|slot| slot.conn.id == conn.id);

        for (handle, slot) in removed {
            if let Some(observer) = slot.observer {
                observer.closed(handle).await;
            }
        }
    }
}

async fn handle_connection(server: Arc<Server>, conn: Arc<Connection>) {
    debug!("Connection {} to {} open", conn.id, server.interface);

    loop {
        let mut reader = &*conn.stream;

        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(err) => {
                match err.kind() {
                    ErrorKind::NoConn => {
                        debug!("Connection {} to {} closed", conn.id, server.interface)
                    }
                    _ => warn!(
                        "Dropping connection {} to {}: {}",
                        conn.id, server.interface, err
                    ),
                }
                break;
            }
        };

        match frame.request_type {
            RequestType::Call | RequestType::Notify => {
                server.dispatch(&conn, frame).await;
            }
            RequestType::StreamClose => {
                server.peer_closed_stream(&conn, frame.stream_id).await;
            }
            other => {
                warn!(
                    "Dropping connection {} to {}: unexpected {:?} frame",
                    conn.id, server.interface, other
                );
                break;
            }
        }
    }

    server.drop_connection(&conn).await;
}
