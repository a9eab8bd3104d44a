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

//! The connection to the upstream MQTT broker.
//!
//! A single task owns the TCP stream and serializes everything going
//! upstream. Local callers talk to it through [`UpstreamHandle`], a small
//! queue front end; each request blocks until the broker acknowledged it or
//! the client's internal timeout fired. The task reconnects on its own with
//! capped exponential backoff and drives the dispatcher's connection state
//! and re-registration.

use std::collections::HashMap;
use std::io::Cursor;
use std::net::Shutdown;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_std::channel::{bounded, Receiver, Sender};
use async_std::future::timeout;
use async_std::net::TcpStream;
use async_std::prelude::*;
use async_std::task;
use async_trait::async_trait;
use futures_lite::future::race;
use log::{debug, info, warn};

use mqtt::control::variable_header::ConnectReturnCode;
use mqtt::packet::publish::QoSWithPacketIdentifier;
use mqtt::packet::suback::SubscribeReturnCode;
use mqtt::packet::*;
use mqtt::TopicFilter as MqttTopicFilter;
use mqtt::{Decodable, Encodable, QualityOfService, TopicName};

use super::dispatch::SubscriptionDispatch;
use super::UpstreamClient;
use crate::error::{Error, ErrorKind};
use crate::object::Buffer;
use crate::topic::TopicFilter;

/// How long to wait for CONNACK, SUBACK, UNSUBACK, PUBACK and PINGRESP.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const REQUEST_QUEUE_LEN: usize = 16;

pub struct UpstreamConfig {
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: u16,
}

impl UpstreamConfig {
    pub fn new(endpoint: impl Into<String>, client_id: impl Into<String>) -> Self {
        UpstreamConfig {
            endpoint: endpoint.into(),
            port: 1883,
            client_id: client_id.into(),
            keep_alive: 30,
        }
    }
}

enum UpstreamRequest {
    Publish {
        topic: Buffer,
        payload: Buffer,
        qos: u8,
        reply: Sender<Result<(), Error>>,
    },
    Subscribe {
        filters: Vec<TopicFilter>,
        qos: u8,
        reply: Sender<Result<(), Error>>,
    },
    Unsubscribe {
        filters: Vec<TopicFilter>,
        reply: Sender<Result<(), Error>>,
    },
}

impl UpstreamRequest {
    async fn reject(self, err: Error) {
        let reply = match self {
            UpstreamRequest::Publish { reply, .. } => reply,
            UpstreamRequest::Subscribe { reply, .. } => reply,
            UpstreamRequest::Unsubscribe { reply, .. } => reply,
        };

        let _ = reply.send(Err(err)).await;
    }
}

/// Queue of requests flowing into the connection task.
pub struct UpstreamQueue(Receiver<UpstreamRequest>);

/// Request front end handed to the dispatcher and the bus handlers.
pub struct UpstreamHandle {
    tx: Sender<UpstreamRequest>,
}

pub fn upstream_channel() -> (Arc<UpstreamHandle>, UpstreamQueue) {
    let (tx, rx) = bounded(REQUEST_QUEUE_LEN);

    (Arc::new(UpstreamHandle { tx }), UpstreamQueue(rx))
}

impl UpstreamHandle {
    async fn request<F>(&self, build: F) -> Result<(), Error>
    where
        F: FnOnce(Sender<Result<(), Error>>) -> UpstreamRequest,
    {
        let (reply_tx, reply_rx) = bounded(1);

        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| Error::new(ErrorKind::NoConn, "upstream client is not running"))?;

        reply_rx
            .recv()
            .await
            .map_err(|_| Error::new(ErrorKind::NoConn, "upstream client went away"))?
    }
}

#[async_trait]
impl UpstreamClient for UpstreamHandle {
    async fn publish(&self, topic: &Buffer, payload: &Buffer, qos: u8) -> Result<(), Error> {
        let topic = topic.clone();
        let payload = payload.clone();

        self.request(|reply| UpstreamRequest::Publish {
            topic,
            payload,
            qos,
            reply,
        })
        .await
    }

    async fn subscribe(&self, filters: &[TopicFilter], qos: u8) -> Result<(), Error> {
        let filters = filters.to_vec();

        self.request(|reply| UpstreamRequest::Subscribe {
            filters,
            qos,
            reply,
        })
        .await
    }

    async fn unsubscribe(&self, filters: &[TopicFilter]) -> Result<(), Error> {
        let filters = filters.to_vec();

        self.request(|reply| UpstreamRequest::Unsubscribe { filters, reply })
        .await
    }
}

/// Run the upstream connection until the request queue closes.
///
/// Intended as a watched task: it only ever returns with an error if the
/// state machine itself is broken, not on connection loss.
pub async fn run_upstream(
    config: UpstreamConfig,
    dispatch: Arc<SubscriptionDispatch>,
    queue: UpstreamQueue,
) -> anyhow::Result<()> {
    let requests = queue.0;
    let mut backoff = BACKOFF_MIN;

    loop {
        match connect(&config).await {
            Ok(stream) => {
                info!(
                    "Connected to {}:{} as {}",
                    config.endpoint, config.port, config.client_id
                );
                backoff = BACKOFF_MIN;

                dispatch.set_connected(true).await;

                // The session loop below is what services the request
                // queue, so the re-registration has to run as its own task.
                let re_register = dispatch.clone();
                task::spawn(async move {
                    re_register.re_register_all().await;
                });

                let result = run_session(&stream, &config, &dispatch, &requests).await;

                dispatch.set_connected(false).await;
                let _ = stream.shutdown(Shutdown::Both);

                match result {
                    Ok(()) => {
                        info!("Upstream request queue closed, shutting down");
                        dispatch.shutdown().await;
                        return Ok(());
                    }
                    Err(err) => warn!("Upstream session ended: {}", err),
                }
            }
            Err(err) => warn!(
                "Connecting to {}:{} failed: {}",
                config.endpoint, config.port, err
            ),
        }

        if !idle_backoff(&requests, backoff).await {
            dispatch.shutdown().await;
            return Ok(());
        }

        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

/// Wait out the reconnect backoff, failing incoming requests immediately.
///
/// Returns false once the request queue is closed.
async fn idle_backoff(requests: &Receiver<UpstreamRequest>, backoff: Duration) -> bool {
    enum Idle {
        Request(Option<UpstreamRequest>),
        Done,
    }

    let deadline = Instant::now() + backoff;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }

        let incoming = async {
            match requests.recv().await {
                Ok(request) => Idle::Request(Some(request)),
                Err(_) => Idle::Request(None),
            }
        };
        let wait = async {
            task::sleep(deadline - now).await;
            Idle::Done
        };

        match race(incoming, wait).await {
            Idle::Request(Some(request)) => {
                request
                    .reject(Error::new(ErrorKind::NoConn, "upstream disconnected"))
                    .await;
            }
            Idle::Request(None) => return false,
            Idle::Done => return true,
        }
    }
}

async fn connect(config: &UpstreamConfig) -> Result<TcpStream, Error> {
    let stream = timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((config.endpoint.as_str(), config.port)),
    )
    .await
    .map_err(|_| Error::new(ErrorKind::Timeout, "connect timed out"))??;

    let mut connect = ConnectPacket::new(config.client_id.as_str());
    connect.set_clean_session(true);
    connect.set_keep_alive(config.keep_alive);
    write_packet(&stream, &connect).await?;

    let connack = timeout(ACK_TIMEOUT, read_packet(&stream))
        .await
        .map_err(|_| Error::new(ErrorKind::Timeout, "no CONNACK"))??;

    match connack {
        VariablePacket::ConnackPacket(connack)
            if connack.connect_return_code() == ConnectReturnCode::ConnectionAccepted =>
        {
            Ok(stream)
        }
        VariablePacket::ConnackPacket(connack) => Err(Error::new(
            ErrorKind::NoConn,
            format!("broker refused connection: {:?}", connack.connect_return_code()),
        )),
        other => Err(Error::new(
            ErrorKind::Parse,
            format!("expected CONNACK, got {:?}", other),
        )),
    }
}

enum Event {
    Packet(Result<VariablePacket, Error>),
    ReaderGone,
    Request(UpstreamRequest),
    QueueClosed,
    Tick,
}

struct PendingAck {
    reply: Sender<Result<(), Error>>,
    deadline: Instant,
}

async fn run_session(
    stream: &TcpStream,
    config: &UpstreamConfig,
    dispatch: &Arc<SubscriptionDispatch>,
    requests: &Receiver<UpstreamRequest>,
) -> Result<(), Error> {
    let keep_alive = Duration::from_secs(config.keep_alive as u64);

    let (packet_tx, packet_rx) = bounded(REQUEST_QUEUE_LEN);
    let reader = stream.clone();
    let reader_task = task::spawn(async move {
        loop {
            match read_packet(&reader).await {
                Ok(packet) => {
                    if packet_tx.send(Ok(packet)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = packet_tx.send(Err(err)).await;
                    break;
                }
            }
        }
    });

    let mut pending: HashMap<u16, PendingAck> = HashMap::new();
    let mut next_packet_id: u16 = 1;
    let mut next_ping = Instant::now() + keep_alive;
    let mut ping_deadline: Option<Instant> = None;

    let result = 'session: loop {
        let now = Instant::now();

        if let Some(deadline) = ping_deadline {
            if now >= deadline {
                break 'session Err(Error::new(ErrorKind::Timeout, "no PINGRESP from broker"));
            }
        }

        if now >= next_ping {
            if let Err(err) = write_packet(stream, &PingreqPacket::new()).await {
                break 'session Err(err);
            }
            ping_deadline = Some(now + ACK_TIMEOUT);
            next_ping = now + keep_alive;
        }

        let expired: Vec<u16> = pending
            .iter()
            .filter(|(_, ack)| now >= ack.deadline)
            .map(|(pkid, _)| *pkid)
            .collect();
        for pkid in expired {
            if let Some(ack) = pending.remove(&pkid) {
                let _ = ack
                    .reply
                    .send(Err(Error::new(ErrorKind::Timeout, "no acknowledgement")))
                    .await;
            }
        }

        let mut wake = next_ping;
        if let Some(deadline) = ping_deadline {
            wake = wake.min(deadline);
        }
        for ack in pending.values() {
            wake = wake.min(ack.deadline);
        }

        let event = {
            let packet = async {
                match packet_rx.recv().await {
                    Ok(result) => Event::Packet(result),
                    Err(_) => Event::ReaderGone,
                }
            };
            let request = async {
                match requests.recv().await {
                    Ok(request) => Event::Request(request),
                    Err(_) => Event::QueueClosed,
                }
            };
            let tick = async {
                task::sleep(wake.saturating_duration_since(Instant::now())).await;
                Event::Tick
            };

            race(packet, race(request, tick)).await
        };

        match event {
            Event::Tick => {}
            Event::ReaderGone => {
                break 'session Err(Error::new(ErrorKind::NoConn, "connection reader stopped"));
            }
            Event::QueueClosed => break 'session Ok(()),
            Event::Packet(Err(err)) => break 'session Err(err),
            Event::Packet(Ok(packet)) => match packet {
                VariablePacket::PublishPacket(publish) => {
                    match publish.qos() {
                        QoSWithPacketIdentifier::Level0 => {}
                        QoSWithPacketIdentifier::Level1(pkid) => {
                            if let Err(err) = write_packet(stream, &PubackPacket::new(pkid)).await {
                                break 'session Err(err);
                            }
                        }
                        QoSWithPacketIdentifier::Level2(_) => {
                            warn!("Ignoring QoS 2 handshake for inbound publish");
                        }
                    }

                    dispatch
                        .deliver(publish.topic_name().as_bytes(), publish.payload())
                        .await;
                }
                VariablePacket::PubackPacket(puback) => {
                    resolve(&mut pending, puback.packet_identifier(), Ok(())).await;
                }
                VariablePacket::SubackPacket(suback) => {
                    let rejected = suback
                        .subscribes()
                        .iter()
                        .any(|code| *code == SubscribeReturnCode::Failure);

                    let result = if rejected {
                        Err(Error::new(
                            ErrorKind::Failure,
                            "broker rejected subscription",
                        ))
                    } else {
                        Ok(())
                    };

                    resolve(&mut pending, suback.packet_identifier(), result).await;
                }
                VariablePacket::UnsubackPacket(unsuback) => {
                    resolve(&mut pending, unsuback.packet_identifier(), Ok(())).await;
                }
                VariablePacket::PingrespPacket(_) => {
                    ping_deadline = None;
                }
                other => {
                    debug!("Ignoring unexpected packet: {:?}", other);
                }
            },
            Event::Request(request) => {
                if let Err(err) = handle_request(
                    stream,
                    request,
                    &mut pending,
                    &mut next_packet_id,
                )
                .await
                {
                    break 'session Err(err);
                }
            }
        }
    };

    let _ = stream.shutdown(Shutdown::Both);

    for (_, ack) in pending.drain() {
        let _ = ack
            .reply
            .send(Err(Error::new(ErrorKind::NoConn, "connection lost")))
            .await;
    }

    reader_task.cancel().await;

    result
}

/// Write one outgoing request, registering its pending acknowledgement.
///
/// An error return means the connection itself failed; per-request
/// validation problems are reported on the request's reply channel.
async fn handle_request(
    stream: &TcpStream,
    request: UpstreamRequest,
    pending: &mut HashMap<u16, PendingAck>,
    next_packet_id: &mut u16,
) -> Result<(), Error> {
    match request {
        UpstreamRequest::Publish {
            topic,
            payload,
            qos,
            reply,
        } => {
            let topic = match utf8_topic(&topic).and_then(|name| {
                TopicName::new(name)
                    .map_err(|err| Error::new(ErrorKind::Invalid, err.to_string()))
            }) {
                Ok(topic) => topic,
                Err(err) => {
                    let _ = reply.send(Err(err)).await;
                    return Ok(());
                }
            };

            match qos_level(qos) {
                QualityOfService::Level0 => {
                    let packet = PublishPacket::new(
                        topic,
                        QoSWithPacketIdentifier::Level0,
                        payload.as_bytes().to_vec(),
                    );
                    write_packet(stream, &packet).await?;
                    let _ = reply.send(Ok(())).await;
                }
                _ => {
                    let pkid = allocate_packet_id(next_packet_id, pending);
                    let packet = PublishPacket::new(
                        topic,
                        QoSWithPacketIdentifier::Level1(pkid),
                        payload.as_bytes().to_vec(),
                    );
                    insert_pending(pending, pkid, reply);
                    write_packet(stream, &packet).await?;
                }
            }
        }
        UpstreamRequest::Subscribe {
            filters,
            qos,
            reply,
        } => {
            let subscribes = match convert_filters(&filters) {
                Ok(converted) => converted
                    .into_iter()
                    .map(|filter| (filter, qos_level(qos)))
                    .collect::<Vec<_>>(),
                Err(err) => {
                    let _ = reply.send(Err(err)).await;
                    return Ok(());
                }
            };

            let pkid = allocate_packet_id(next_packet_id, pending);
            let packet = SubscribePacket::new(pkid, subscribes);
            insert_pending(pending, pkid, reply);
            write_packet(stream, &packet).await?;
        }
        UpstreamRequest::Unsubscribe { filters, reply } => {
            let unsubscribes = match convert_filters(&filters) {
                Ok(converted) => converted,
                Err(err) => {
                    let _ = reply.send(Err(err)).await;
                    return Ok(());
                }
            };

            let pkid = allocate_packet_id(next_packet_id, pending);
            let packet = UnsubscribePacket::new(pkid, unsubscribes);
            insert_pending(pending, pkid, reply);
            write_packet(stream, &packet).await?;
        }
    }

    Ok(())
}

async fn resolve(
    pending: &mut HashMap<u16, PendingAck>,
    pkid: u16,
    result: Result<(), Error>,
) {
    match pending.remove(&pkid) {
        Some(ack) => {
            let _ = ack.reply.send(result).await;
        }
        None => debug!("Unsolicited acknowledgement for packet {}", pkid),
    }
}

fn insert_pending(
    pending: &mut HashMap<u16, PendingAck>,
    pkid: u16,
    reply: Sender<Result<(), Error>>,
) {
    pending.insert(
        pkid,
        PendingAck {
            reply,
            deadline: Instant::now() + ACK_TIMEOUT,
        },
    );
}

fn allocate_packet_id(next: &mut u16, pending: &HashMap<u16, PendingAck>) -> u16 {
    loop {
        let pkid = *next;
        *next = next.wrapping_add(1);

        if pkid != 0 && !pending.contains_key(&pkid) {
            return pkid;
        }
    }
}

/// QoS 2 is downgraded: the cloud endpoint only speaks 0 and 1.
fn qos_level(qos: u8) -> QualityOfService {
    match qos {
        0 => QualityOfService::Level0,
        1 => QualityOfService::Level1,
        _ => {
            debug!("Downgrading QoS {} to 1", qos);
            QualityOfService::Level1
        }
    }
}

fn utf8_topic(topic: &Buffer) -> Result<String, Error> {
    String::from_utf8(topic.as_bytes().to_vec())
        .map_err(|_| Error::new(ErrorKind::Invalid, "topic is not valid UTF-8"))
}

fn convert_filters(filters: &[TopicFilter]) -> Result<Vec<MqttTopicFilter>, Error> {
    filters
        .iter()
        .map(|filter| {
            let name = String::from_utf8(filter.as_bytes().to_vec())
                .map_err(|_| Error::new(ErrorKind::Invalid, "filter is not valid UTF-8"))?;

            MqttTopicFilter::new(name)
                .map_err(|err| Error::new(ErrorKind::Invalid, err.to_string()))
        })
        .collect()
}

/// Read one MQTT packet from the stream.
///
/// The fixed header and its variable-length remaining-length field are
/// consumed byte-wise, then the body in one read; the packet codec itself
/// runs over the complete buffer.
async fn read_packet(stream: &TcpStream) -> Result<VariablePacket, Error> {
    let mut reader = stream;

    let mut header = [0u8; 1];
    reader.read_exact(&mut header).await?;

    let mut raw = vec![header[0]];
    let mut remaining: usize = 0;
    let mut shift = 0u32;

    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte).await?;
        raw.push(byte[0]);

        remaining |= ((byte[0] & 0x7f) as usize) << shift;

        if byte[0] & 0x80 == 0 {
            break;
        }

        shift += 7;
        if shift > 21 {
            return Err(Error::new(ErrorKind::Parse, "invalid remaining length"));
        }
    }

    let mut body = vec![0u8; remaining];
    reader.read_exact(&mut body).await?;
    raw.extend_from_slice(&body);

    VariablePacket::decode(&mut Cursor::new(raw))
        .map_err(|err| Error::new(ErrorKind::Parse, err.to_string()))
}

async fn write_packet<P: Encodable>(stream: &TcpStream, packet: &P) -> Result<(), Error> {
    let mut cursor = Cursor::new(Vec::new());
    packet
        .encode(&mut cursor)
        .map_err(|err| Error::new(ErrorKind::Parse, err.to_string()))?;

    let mut writer = stream;
    writer.write_all(&cursor.into_inner()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_std::channel::bounded;
    use async_std::task::block_on;

    use super::{upstream_channel, UpstreamRequest};
    use crate::error::ErrorKind;
    use crate::mqtt::UpstreamClient;
    use crate::object::Buffer;

    #[test]
    fn requests_fail_fast_without_a_running_client() {
        block_on(async {
            let (handle, queue) = upstream_channel();
            drop(queue);

            let err = handle
                .publish(&Buffer::from("a/b"), &Buffer::from("x"), 0)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NoConn);
        });
    }

    #[test]
    fn rejected_requests_answer_their_reply_channel() {
        block_on(async {
            let (reply_tx, reply_rx) = bounded(1);
            let request = UpstreamRequest::Publish {
                topic: Buffer::from("a/b"),
                payload: Buffer::from("x"),
                qos: 0,
                reply: reply_tx,
            };

            request
                .reject(crate::error::Error::new(ErrorKind::NoConn, "down"))
                .await;

            let result = async_std::future::timeout(Duration::from_millis(100), reply_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(result.unwrap_err().kind(), ErrorKind::NoConn);
        });
    }
}
