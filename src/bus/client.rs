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

use std::net::Shutdown;
use std::sync::{Arc, Mutex};

use async_std::channel::{unbounded, Receiver, Sender};
use async_std::os::unix::net::UnixStream;
use async_std::task;
use async_trait::async_trait;
use log::{debug, warn};
use once_cell::sync::Lazy;

use super::frame::{read_frame, write_frame, Frame, RequestType};
use super::handle::{Handle, HandleKind, HandleTable};
use super::socket_path;
use crate::error::{Error, ErrorKind};
use crate::object::{Map, Value};

/// Capacity of the per-process client subscription table.
const MAX_CLIENT_SUBSCRIPTIONS: usize = 64;

/// Callbacks driving a client-side subscription.
///
/// `on_message` runs on the subscription's reader task, in stream order.
/// `on_close` fires exactly once, after the last message, whichever side
/// closed the stream.
#[async_trait]
pub trait SubscriptionObserver: Send + Sync {
    async fn on_message(&self, handle: Handle, value: Value);
    async fn on_close(&self, handle: Handle);
}

struct ClientSub {
    stream: Arc<UnixStream>,
    stream_id: i32,
}

/// Client side of the core bus.
///
/// One instance per process is enough (see [`bus`]); connections are opened
/// per operation, so the client itself only tracks live subscriptions.
pub struct BusClient {
    subs: Mutex<HandleTable<ClientSub>>,
}

/// The process-wide bus client.
pub fn bus() -> &'static BusClient {
    static BUS: Lazy<BusClient> = Lazy::new(|| BusClient {
        subs: Mutex::new(HandleTable::new(
            HandleKind::Client,
            MAX_CLIENT_SUBSCRIPTIONS,
        )),
    });

    &BUS
}

async fn connect(interface: &str) -> Result<UnixStream, Error> {
    let path = socket_path(interface);

    UnixStream::connect(&path).await.map_err(|err| {
        Error::new(
            ErrorKind::NoConn,
            format!("connecting to {} ({}): {}", interface, path.display(), err),
        )
    })
}

impl BusClient {
    /// Send a method call and do not wait for any reply.
    ///
    /// Returns once the frame is written.
    pub async fn notify(&self, interface: &str, method: &str, params: Map) -> Result<(), Error> {
        let mut stream = connect(interface).await?;

        write_frame(&mut stream, &Frame::notify(method, Value::Map(params))).await
    }

    /// Send a method call and block on exactly one reply.
    ///
    /// Transport failures surface with their local kind; an error reported
    /// by the server surfaces as kind `Remote` with the server's kind as
    /// [`Error::remote_kind`].
    pub async fn call(&self, interface: &str, method: &str, params: Map) -> Result<Value, Error> {
        let mut stream = connect(interface).await?;

        write_frame(&mut stream, &Frame::call(method, Value::Map(params))).await?;

        let reply = read_frame(&mut stream).await?;

        match reply.request_type {
            RequestType::Response => Ok(reply.payload),
            RequestType::ErrorResponse => {
                Err(Error::remote(reply.error_kind.unwrap_or(ErrorKind::Failure)))
            }
            other => Err(Error::new(
                ErrorKind::Parse,
                format!("unexpected {:?} reply to a call", other),
            )),
        }
    }

    /// Open a server-push stream.
    ///
    /// The call is sent like [`BusClient::call`]; on acceptance a reader
    /// task dispatches every stream message to `observer` until the stream
    /// closes. The connection backing the stream lives exactly as long as
    /// the subscription.
    pub async fn subscribe(
        &'static self,
        interface: &str,
        method: &str,
        params: Map,
        observer: Arc<dyn SubscriptionObserver>,
    ) -> Result<Handle, Error> {
        let stream = Arc::new(connect(interface).await?);

        {
            let mut writer = &*stream;
            write_frame(&mut writer, &Frame::call(method, Value::Map(params))).await?;
        }

        let ack = {
            let mut reader = &*stream;
            read_frame(&mut reader).await?
        };

        let stream_id = match ack.request_type {
            RequestType::Response if ack.stream_id != 0 => ack.stream_id,
            RequestType::Response => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    format!("{}.{} is not a subscription method", interface, method),
                ));
            }
            RequestType::ErrorResponse => {
                return Err(Error::remote(ack.error_kind.unwrap_or(ErrorKind::Failure)));
            }
            other => {
                return Err(Error::new(
                    ErrorKind::Parse,
                    format!("unexpected {:?} reply to a subscribe", other),
                ));
            }
        };

        let handle = self.subs.lock().unwrap().insert(ClientSub {
            stream: stream.clone(),
            stream_id,
        })?;

        task::spawn(self.run_subscription(stream, handle, observer));

        Ok(handle)
    }

    async fn run_subscription(
        &'static self,
        stream: Arc<UnixStream>,
        handle: Handle,
        observer: Arc<dyn SubscriptionObserver>,
    ) {
        loop {
            let mut reader = &*stream;

            match read_frame(&mut reader).await {
                Ok(frame) => match frame.request_type {
                    RequestType::StreamMessage => {
                        observer.on_message(handle, frame.payload).await;
                    }
                    RequestType::StreamClose => {
                        debug!("Subscription {} closed by peer", handle);
                        break;
                    }
                    other => {
                        warn!("Unexpected {:?} frame on subscription {}", other, handle);
                        break;
                    }
                },
                Err(err) => {
                    if err.kind() != ErrorKind::NoConn {
                        warn!("Subscription {} read failed: {}", handle, err);
                    }
                    break;
                }
            }
        }

        // The handle may already be gone if close_subscription() initiated
        // the teardown; on_close still fires here and only here.
        self.subs.lock().unwrap().remove(handle);
        let _ = stream.shutdown(Shutdown::Both);

        observer.on_close(handle).await;
    }

    /// Close a subscription from the client side.
    ///
    /// Tears down the backing connection; the observer's `on_close` fires
    /// from the reader task. Closing an unknown handle is a no-op.
    pub async fn close_subscription(&self, handle: Handle) {
        let sub = match self.subs.lock().unwrap().remove(handle) {
            Some(sub) => sub,
            None => return,
        };

        {
            let mut writer = &*sub.stream;
            let _ = write_frame(&mut writer, &Frame::stream_close(sub.stream_id)).await;
        }

        let _ = sub.stream.shutdown(Shutdown::Both);
    }
}

/// See [`BusClient::notify`].
pub async fn notify(interface: &str, method: &str, params: Map) -> Result<(), Error> {
    bus().notify(interface, method, params).await
}

/// See [`BusClient::call`].
pub async fn call(interface: &str, method: &str, params: Map) -> Result<Value, Error> {
    bus().call(interface, method, params).await
}

/// See [`BusClient::subscribe`].
pub async fn subscribe(
    interface: &str,
    method: &str,
    params: Map,
    observer: Arc<dyn SubscriptionObserver>,
) -> Result<Handle, Error> {
    bus().subscribe(interface, method, params, observer).await
}

/// See [`BusClient::close_subscription`].
pub async fn close_subscription(handle: Handle) {
    bus().close_subscription(handle).await
}

/// Observer adapter that forwards stream messages into a queue.
///
/// The queue closes when the subscription does, so draining it to `None`
/// doubles as close detection.
pub struct ChannelObserver {
    tx: Sender<Value>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, Receiver<Value>) {
        let (tx, rx) = unbounded();
        (Arc::new(ChannelObserver { tx }), rx)
    }
}

#[async_trait]
impl SubscriptionObserver for ChannelObserver {
    async fn on_message(&self, _handle: Handle, value: Value) {
        let _ = self.tx.send(value).await;
    }

    async fn on_close(&self, _handle: Handle) {
        self.tx.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_std::os::unix::net::UnixStream;
    use async_std::task::{self, block_on};
    use async_trait::async_trait;

    use super::{call, close_subscription, notify, subscribe, ChannelObserver};
    use crate::bus::frame::{read_frame, write_frame, Frame, RequestType};
    use crate::bus::server::{Handler, Method, Server, StreamObserver};
    use crate::bus::{socket_path, Handle};
    use crate::error::{Error, ErrorKind};
    use crate::object::{Map, Value};
    use crate::testutil::{init_socket_dir, wait_for_interface};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(
            &self,
            server: &Arc<Server>,
            handle: Handle,
            params: Map,
        ) -> Result<(), Error> {
            let value = params.get(b"value").cloned().unwrap_or(Value::Null);
            server.respond(handle, value).await
        }
    }

    struct CountCloses(Arc<AtomicUsize>);

    #[async_trait]
    impl StreamObserver for CountCloses {
        async fn closed(&self, _handle: Handle) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct TickHandler {
        accepted: Arc<Mutex<Option<Handle>>>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for TickHandler {
        async fn handle(
            &self,
            server: &Arc<Server>,
            handle: Handle,
            _params: Map,
        ) -> Result<(), Error> {
            server
                .sub_accept(handle, Arc::new(CountCloses(self.closes.clone())))
                .await?;

            *self.accepted.lock().unwrap() = Some(handle);

            let server = server.clone();
            task::spawn(async move {
                let mut tick = 0i64;
                loop {
                    task::sleep(Duration::from_millis(10)).await;
                    tick += 1;
                    if server.sub_respond(handle, Value::I64(tick)).await.is_err() {
                        break;
                    }
                }
            });

            Ok(())
        }
    }

    async fn start_server(interface: &'static str, methods: Vec<Method>) -> Arc<Server> {
        let server = Server::new(interface, methods);

        let listener = server.clone();
        task::spawn(async move {
            let _ = listener.listen().await;
        });

        wait_for_interface(interface).await;
        server
    }

    #[test]
    fn call_reaches_handler() {
        init_socket_dir();

        block_on(async {
            start_server("test_call", vec![Method::unary("echo", Arc::new(EchoHandler))]).await;

            let value = call("test_call", "echo", Map::new().with("value", 7i64))
                .await
                .unwrap();
            assert_eq!(value, Value::I64(7));
        });
    }

    #[test]
    fn notify_returns_without_reply() {
        init_socket_dir();

        block_on(async {
            start_server(
                "test_notify",
                vec![Method::unary("echo", Arc::new(EchoHandler))],
            )
            .await;

            notify("test_notify", "echo", Map::new().with("value", 1i64))
                .await
                .unwrap();

            // The interface is still healthy afterwards.
            let value = call("test_notify", "echo", Map::new().with("value", 2i64))
                .await
                .unwrap();
            assert_eq!(value, Value::I64(2));
        });
    }

    #[test]
    fn unknown_method_keeps_connection_usable() {
        init_socket_dir();

        block_on(async {
            start_server(
                "test_no_entry",
                vec![Method::unary("bar", Arc::new(EchoHandler))],
            )
            .await;

            // Through the public client API the error surfaces as Remote
            // with the server's kind attached.
            let err = call("test_no_entry", "baz", Map::new()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Remote);
            assert_eq!(err.remote_kind(), Some(ErrorKind::NoEntry));

            // On the wire the same connection stays usable for a valid
            // call after the error response.
            let mut stream = UnixStream::connect(socket_path("test_no_entry"))
                .await
                .unwrap();

            write_frame(&mut stream, &Frame::call("baz", Value::Map(Map::new())))
                .await
                .unwrap();
            let reply = read_frame(&mut stream).await.unwrap();
            assert_eq!(reply.request_type, RequestType::ErrorResponse);
            assert_eq!(reply.error_kind, Some(ErrorKind::NoEntry));

            write_frame(
                &mut stream,
                &Frame::call("bar", Value::Map(Map::new().with("value", 3i64))),
            )
            .await
            .unwrap();
            let reply = read_frame(&mut stream).await.unwrap();
            assert_eq!(reply.request_type, RequestType::Response);
            assert_eq!(reply.payload, Value::I64(3));
        });
    }

    #[test]
    fn subscription_lifetime_on_client_close() {
        init_socket_dir();

        let accepted = Arc::new(Mutex::new(None));
        let closes = Arc::new(AtomicUsize::new(0));

        block_on(async {
            let server = start_server(
                "test_sub_lifetime",
                vec![Method::stream(
                    "ticks",
                    Arc::new(TickHandler {
                        accepted: accepted.clone(),
                        closes: closes.clone(),
                    }),
                )],
            )
            .await;

            let (observer, rx) = ChannelObserver::new();
            let handle = subscribe("test_sub_lifetime", "ticks", Map::new(), observer)
                .await
                .unwrap();

            // Client subscription handles live in their own namespace.
            assert_ne!(handle.raw() & 0x8000_0000, 0);

            for _ in 0..3 {
                rx.recv().await.unwrap();
            }

            close_subscription(handle).await;

            // The channel closes once on_close has fired.
            while rx.recv().await.is_ok() {}

            let server_handle = accepted.lock().unwrap().take().unwrap();

            // The server side notices the close, fires the observer once
            // and rejects further pushes.
            let mut tries = 0;
            while closes.load(Ordering::SeqCst) == 0 && tries < 200 {
                task::sleep(Duration::from_millis(5)).await;
                tries += 1;
            }
            assert_eq!(closes.load(Ordering::SeqCst), 1);

            let err = server
                .sub_respond(server_handle, Value::I64(0))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NoConn);

            task::sleep(Duration::from_millis(50)).await;
            assert_eq!(closes.load(Ordering::SeqCst), 1);
        });
    }
}
