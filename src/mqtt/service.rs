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

//! The `aws_iot_mqtt` bus interface.
//!
//! Three methods: `publish` (unary), `subscribe` (stream of matching
//! publishes) and `connection_status` (stream of upstream state changes).

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use super::dispatch::SubscriptionDispatch;
use super::UpstreamClient;
use crate::bus::{Handle, Handler, Method, Server, StreamObserver};
use crate::error::{Error, ErrorKind};
use crate::object::{Map, SchemaEntry, Value, ValueType};
use crate::topic::{TopicFilter, MAX_TOPIC_LEN};

/// Interface name every local component publishes and subscribes through.
pub const INTERFACE: &str = "aws_iot_mqtt";

/// Upper bound of topic filters in a single subscribe call.
pub const MAX_SUBSCRIBE_FILTERS: usize = 10;

/// Build the method table for the interface.
pub fn methods(
    dispatch: Arc<SubscriptionDispatch>,
    upstream: Arc<dyn UpstreamClient>,
) -> Vec<Method> {
    vec![
        Method::unary(
            "publish",
            Arc::new(Publish {
                upstream: upstream.clone(),
            }),
        ),
        Method::stream(
            "subscribe",
            Arc::new(Subscribe {
                dispatch: dispatch.clone(),
                upstream,
            }),
        ),
        Method::stream("connection_status", Arc::new(ConnectionStatus { dispatch })),
    ]
}

fn qos_param(value: Option<&Value>) -> Result<u8, Error> {
    match value {
        None => Ok(0),
        Some(Value::I64(qos)) if (0..=2).contains(qos) => Ok(*qos as u8),
        Some(_) => Err(Error::new(ErrorKind::Invalid, "qos must be 0, 1 or 2")),
    }
}

struct Publish {
    upstream: Arc<dyn UpstreamClient>,
}

#[async_trait]
impl Handler for Publish {
    async fn handle(
        &self,
        server: &Arc<Server>,
        handle: Handle,
        params: Map,
    ) -> Result<(), Error> {
        debug!("Handling publish request");

        let args = params.validate(&[
            SchemaEntry::required("topic", ValueType::Buf),
            SchemaEntry::optional("payload", ValueType::Buf),
            SchemaEntry::optional("qos", ValueType::I64),
        ])?;

        let topic = args[0]
            .and_then(Value::as_buf)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::Invalid, "missing topic"))?;

        if topic.len() > MAX_TOPIC_LEN {
            return Err(Error::new(ErrorKind::Range, "publish topic too long"));
        }

        let payload = args[1].and_then(Value::as_buf).cloned().unwrap_or_default();
        let qos = qos_param(args[2])?;

        self.upstream.publish(&topic, &payload, qos).await?;

        server.respond(handle, Value::Null).await
    }
}

struct Subscribe {
    dispatch: Arc<SubscriptionDispatch>,
    upstream: Arc<dyn UpstreamClient>,
}

struct SubscriptionClosed {
    dispatch: Arc<SubscriptionDispatch>,
}

#[async_trait]
impl StreamObserver for SubscriptionClosed {
    async fn closed(&self, handle: Handle) {
        self.dispatch.unregister(handle, true).await;
    }
}

#[async_trait]
impl Handler for Subscribe {
    async fn handle(
        &self,
        server: &Arc<Server>,
        handle: Handle,
        params: Map,
    ) -> Result<(), Error> {
        debug!("Handling subscribe request");

        let raw = params
            .get(b"topic_filter")
            .ok_or_else(|| Error::new(ErrorKind::Invalid, "missing topic_filter"))?;

        let filters = match raw {
            Value::Buf(filter) => vec![TopicFilter::new(filter.clone())?],
            Value::List(items) => {
                if items.is_empty() {
                    return Err(Error::new(
                        ErrorKind::Invalid,
                        "need at least one topic filter",
                    ));
                }
                if items.len() > MAX_SUBSCRIBE_FILTERS {
                    return Err(Error::new(
                        ErrorKind::Unsupported,
                        "too many topic filters in one subscribe",
                    ));
                }

                items
                    .iter()
                    .map(|item| {
                        item.as_buf()
                            .cloned()
                            .ok_or_else(|| {
                                Error::new(ErrorKind::Invalid, "topic filter must be a buffer")
                            })
                            .and_then(TopicFilter::new)
                    })
                    .collect::<Result<Vec<_>, _>>()?
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::Invalid,
                    "topic_filter must be a buffer or a list of buffers",
                ));
            }
        };

        let qos = qos_param(params.get(b"qos"))?;

        self.dispatch.register(&filters, handle, qos).await?;

        if let Err(err) = self.upstream.subscribe(&filters, qos).await {
            self.dispatch.unregister(handle, false).await;
            return Err(err);
        }

        server
            .sub_accept(
                handle,
                Arc::new(SubscriptionClosed {
                    dispatch: self.dispatch.clone(),
                }),
            )
            .await
    }
}

struct ConnectionStatus {
    dispatch: Arc<SubscriptionDispatch>,
}

struct StatusClosed {
    dispatch: Arc<SubscriptionDispatch>,
}

#[async_trait]
impl StreamObserver for StatusClosed {
    async fn closed(&self, handle: Handle) {
        self.dispatch.unwatch_status(handle).await;
    }
}

#[async_trait]
impl Handler for ConnectionStatus {
    async fn handle(
        &self,
        server: &Arc<Server>,
        handle: Handle,
        _params: Map,
    ) -> Result<(), Error> {
        debug!("Handling connection status request");

        server
            .sub_accept(
                handle,
                Arc::new(StatusClosed {
                    dispatch: self.dispatch.clone(),
                }),
            )
            .await?;

        // The initial status goes out through the watcher registration,
        // under the broadcaster's lock, so it cannot race a transition.
        if let Err(err) = self.dispatch.watch_status(handle).await {
            server.sub_close(handle).await;
            return Err(err);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_std::task::{self, block_on};
    use async_trait::async_trait;

    use super::{methods, qos_param};
    use crate::bus::{call, close_subscription, subscribe, ChannelObserver, Server};
    use crate::error::{Error, ErrorKind};
    use crate::mqtt::dispatch::SubscriptionDispatch;
    use crate::mqtt::UpstreamClient;
    use crate::object::{Buffer, Map, Value};
    use crate::topic::TopicFilter;
    use crate::testutil::{init_socket_dir, wait_for_interface};

    #[derive(Default)]
    struct MockUpstream {
        published: Mutex<Vec<(Vec<u8>, Vec<u8>, u8)>>,
        subscribed: Mutex<Vec<(Vec<u8>, u8)>>,
        unsubscribed: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn publish(&self, topic: &Buffer, payload: &Buffer, qos: u8) -> Result<(), Error> {
            self.published
                .lock()
                .unwrap()
                .push((topic.as_bytes().to_vec(), payload.as_bytes().to_vec(), qos));
            Ok(())
        }

        async fn subscribe(&self, filters: &[TopicFilter], qos: u8) -> Result<(), Error> {
            for filter in filters {
                self.subscribed
                    .lock()
                    .unwrap()
                    .push((filter.as_bytes().to_vec(), qos));
            }
            Ok(())
        }

        async fn unsubscribe(&self, filters: &[TopicFilter]) -> Result<(), Error> {
            for filter in filters {
                self.unsubscribed
                    .lock()
                    .unwrap()
                    .push(filter.as_bytes().to_vec());
            }
            Ok(())
        }
    }

    async fn start_service(
        interface: &'static str,
    ) -> (Arc<Server>, Arc<SubscriptionDispatch>, Arc<MockUpstream>) {
        init_socket_dir();

        let upstream = Arc::new(MockUpstream::default());
        let dispatch = SubscriptionDispatch::new(upstream.clone());
        let server = Server::new(interface, methods(dispatch.clone(), upstream.clone()));
        dispatch.set_sink(server.clone());

        let listener = server.clone();
        task::spawn(async move {
            let _ = listener.listen().await;
        });
        wait_for_interface(interface).await;

        (server, dispatch, upstream)
    }

    #[test]
    fn qos_parameter_bounds() {
        assert_eq!(qos_param(None).unwrap(), 0);
        assert_eq!(qos_param(Some(&Value::I64(2))).unwrap(), 2);
        assert!(qos_param(Some(&Value::I64(3))).is_err());
        assert!(qos_param(Some(&Value::from("1"))).is_err());
    }

    #[test]
    fn publish_reaches_upstream() {
        block_on(async {
            let (_, _, upstream) = start_service("test_mqtt_publish").await;

            call(
                "test_mqtt_publish",
                "publish",
                Map::new()
                    .with("topic", "a/b")
                    .with("payload", Buffer::from("hi"))
                    .with("qos", 1i64),
            )
            .await
            .unwrap();

            let published = upstream.published.lock().unwrap().clone();
            assert_eq!(published, vec![(b"a/b".to_vec(), b"hi".to_vec(), 1)]);

            let err = call(
                "test_mqtt_publish",
                "publish",
                Map::new().with("topic", "a/b").with("qos", 5i64),
            )
            .await
            .unwrap_err();
            assert_eq!(err.remote_kind(), Some(ErrorKind::Invalid));
        });
    }

    #[test]
    fn subscribe_delivers_matching_publishes() {
        block_on(async {
            let (_, dispatch, upstream) = start_service("test_mqtt_subscribe").await;

            let (observer, rx) = ChannelObserver::new();
            let handle = subscribe(
                "test_mqtt_subscribe",
                "subscribe",
                Map::new()
                    .with(
                        "topic_filter",
                        Value::List(vec![Value::from("a/b"), Value::from("c/+")]),
                    )
                    .with("qos", 1i64),
                observer,
            )
            .await
            .unwrap();

            assert_eq!(
                upstream.subscribed.lock().unwrap().clone(),
                vec![(b"a/b".to_vec(), 1), (b"c/+".to_vec(), 1)]
            );

            dispatch.deliver(b"c/x", b"payload").await;

            let message = rx.recv().await.unwrap();
            let map = message.as_map().unwrap();
            assert_eq!(map.get(b"topic"), Some(&Value::from("c/x")));
            assert_eq!(
                map.get(b"payload"),
                Some(&Value::Buf(Buffer::from("payload")))
            );

            // Closing the stream unregisters both filters upstream.
            close_subscription(handle).await;

            let mut tries = 0;
            while upstream.unsubscribed.lock().unwrap().len() < 2 && tries < 200 {
                task::sleep(Duration::from_millis(5)).await;
                tries += 1;
            }
            assert_eq!(
                upstream.unsubscribed.lock().unwrap().clone(),
                vec![b"a/b".to_vec(), b"c/+".to_vec()]
            );
        });
    }

    #[test]
    fn invalid_filter_rejected_at_subscribe() {
        block_on(async {
            start_service("test_mqtt_badfilter").await;

            let (observer, _rx) = ChannelObserver::new();
            let err = subscribe(
                "test_mqtt_badfilter",
                "subscribe",
                Map::new().with("topic_filter", "#/a"),
                observer,
            )
            .await
            .unwrap_err();

            assert_eq!(err.remote_kind(), Some(ErrorKind::Invalid));
        });
    }

    #[test]
    fn connection_status_stream_tracks_transitions() {
        block_on(async {
            let (_, dispatch, _) = start_service("test_mqtt_status").await;

            let (observer, rx) = ChannelObserver::new();
            subscribe("test_mqtt_status", "connection_status", Map::new(), observer)
                .await
                .unwrap();

            assert_eq!(rx.recv().await.unwrap(), Value::Bool(false));

            dispatch.set_connected(true).await;
            dispatch.set_connected(false).await;

            assert_eq!(rx.recv().await.unwrap(), Value::Bool(true));
            assert_eq!(rx.recv().await.unwrap(), Value::Bool(false));
        });
    }
}
