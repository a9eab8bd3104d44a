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

//! Subscription fan-out for the single upstream MQTT connection.
//!
//! The dispatcher records which local stream handle wants which topic
//! filter. Inbound publishes are matched row by row and pushed to every
//! subscriber; reconnects replay the whole table upstream. Subscribers of
//! the upstream connection state live in a second, separate table.

use std::sync::Arc;

use async_std::sync::Mutex;
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;

use super::{StreamSink, UpstreamClient};
use crate::bus::Handle;
use crate::error::{Error, ErrorKind};
use crate::object::{Buffer, Map, Value};
use crate::topic::TopicFilter;

/// Capacity of the subscription table and of the status watcher table.
pub const MAX_SUBSCRIPTIONS: usize = 128;

struct SubscriptionRow {
    filter: TopicFilter,
    handle: Handle,
    qos: u8,
}

struct StatusWatchers {
    connected: bool,
    watchers: Vec<Option<Handle>>,
}

pub struct SubscriptionDispatch {
    rows: Mutex<Vec<Option<SubscriptionRow>>>,
    status: Mutex<StatusWatchers>,
    upstream: Arc<dyn UpstreamClient>,
    sink: OnceCell<Arc<dyn StreamSink>>,
}

impl SubscriptionDispatch {
    pub fn new(upstream: Arc<dyn UpstreamClient>) -> Arc<Self> {
        Arc::new(SubscriptionDispatch {
            rows: Mutex::new((0..MAX_SUBSCRIPTIONS).map(|_| None).collect()),
            status: Mutex::new(StatusWatchers {
                connected: false,
                watchers: (0..MAX_SUBSCRIPTIONS).map(|_| None).collect(),
            }),
            upstream,
            sink: OnceCell::new(),
        })
    }

    /// Wire up the delivery side.
    ///
    /// Separate from `new()` because the bus server holding the streams is
    /// itself constructed with handlers that reference this dispatcher.
    pub fn set_sink(&self, sink: Arc<dyn StreamSink>) {
        if self.sink.set(sink).is_err() {
            panic!("dispatcher sink set twice");
        }
    }

    fn sink(&self) -> Result<&Arc<dyn StreamSink>, Error> {
        self.sink
            .get()
            .ok_or_else(|| Error::new(ErrorKind::NoConn, "dispatcher has no sink yet"))
    }

    /// Reserve one table row per filter for `handle`.
    ///
    /// On overflow nothing is kept: every row already reserved for this
    /// call is rolled back and the whole call fails with `NoMem`. Filter
    /// validity (empty, oversize, wildcard placement) is enforced by
    /// [`TopicFilter::new`] before a filter can get here.
    pub async fn register(
        &self,
        filters: &[TopicFilter],
        handle: Handle,
        qos: u8,
    ) -> Result<(), Error> {
        debug!("Registering {} filters for {}", filters.len(), handle);

        let mut rows = self.rows.lock().await;

        let mut remaining = filters.iter();
        let mut next = remaining.next();

        for row in rows.iter_mut() {
            let filter = match next {
                Some(filter) => filter,
                None => break,
            };

            if row.is_none() {
                *row = Some(SubscriptionRow {
                    filter: filter.clone(),
                    handle,
                    qos,
                });
                next = remaining.next();
            }
        }

        if next.is_none() {
            return Ok(());
        }

        error!("Subscription table full, rolling back registration");

        for row in rows.iter_mut() {
            if matches!(row, Some(r) if r.handle == handle) {
                *row = None;
            }
        }

        Err(Error::new(ErrorKind::NoMem, "subscription table full"))
    }

    /// Drop every row owned by `handle`.
    ///
    /// With `send_unsubscribe`, filters no surviving row still names are
    /// unsubscribed upstream (best effort).
    pub async fn unregister(&self, handle: Handle, send_unsubscribe: bool) {
        let orphaned = {
            let mut rows = self.rows.lock().await;
            let mut removed = Vec::new();

            for row in rows.iter_mut() {
                if matches!(row, Some(r) if r.handle == handle) {
                    if let Some(r) = row.take() {
                        removed.push(r.filter);
                    }
                }
            }

            removed
                .into_iter()
                .filter(|filter| {
                    !rows
                        .iter()
                        .flatten()
                        .any(|row| row.filter == *filter)
                })
                .collect::<Vec<_>>()
        };

        if !send_unsubscribe || orphaned.is_empty() {
            return;
        }

        if let Err(err) = self.upstream.unsubscribe(&orphaned).await {
            warn!("Unsubscribe of {} filters failed: {}", orphaned.len(), err);
        }
    }

    /// Fan one inbound publish out to every matching subscriber.
    ///
    /// Delivery is best effort: a failed push is logged and the row stays;
    /// rows die through their stream's close callback.
    pub async fn deliver(&self, topic: &[u8], payload: &[u8]) {
        let rows = self.rows.lock().await;

        for row in rows.iter().flatten() {
            if !row.filter.matches(topic) {
                continue;
            }

            let message = Map::new()
                .with("topic", Buffer::from(topic))
                .with("payload", Buffer::from(payload));

            let sink = match self.sink() {
                Ok(sink) => sink,
                Err(err) => {
                    warn!("Dropping publish on {:?}: {}", Buffer::from(topic), err);
                    return;
                }
            };

            if let Err(err) = sink.push(row.handle, Value::Map(message)).await {
                debug!("Could not deliver publish to {}: {}", row.handle, err);
            }
        }
    }

    /// Register a connection status watcher and send it the current state.
    ///
    /// The initial message goes out under the same lock the broadcaster
    /// takes, so the watcher can never see a stale initial value ordered
    /// after a fresher broadcast.
    pub async fn watch_status(&self, handle: Handle) -> Result<(), Error> {
        let mut status = self.status.lock().await;

        let slot = status
            .watchers
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or_else(|| Error::new(ErrorKind::NoMem, "status watcher table full"))?;

        *slot = Some(handle);

        let connected = status.connected;
        self.sink()?.push(handle, Value::Bool(connected)).await
    }

    pub async fn unwatch_status(&self, handle: Handle) {
        let mut status = self.status.lock().await;

        for slot in status.watchers.iter_mut() {
            if *slot == Some(handle) {
                *slot = None;
                return;
            }
        }
    }

    /// Record an upstream connection state change and broadcast it.
    ///
    /// Repeated reports of the same state are ignored, so watchers see
    /// every transition exactly once.
    pub async fn set_connected(&self, connected: bool) {
        let mut status = self.status.lock().await;

        if status.connected == connected {
            return;
        }

        status.connected = connected;
        info!(
            "Upstream connection is {}",
            if connected { "up" } else { "down" }
        );

        let sink = match self.sink() {
            Ok(sink) => sink.clone(),
            Err(_) => return,
        };

        for slot in status.watchers.iter() {
            if let Some(handle) = slot {
                if let Err(err) = sink.push(*handle, Value::Bool(connected)).await {
                    debug!("Could not notify status watcher {}: {}", handle, err);
                }
            }
        }
    }

    /// Replay every subscription upstream after a reconnect.
    ///
    /// A row whose SUBSCRIBE fails is dropped; its subscriber keeps its
    /// stream but will no longer see matching publishes.
    pub async fn re_register_all(&self) {
        let snapshot = {
            let rows = self.rows.lock().await;
            rows.iter()
                .flatten()
                .map(|row| (row.filter.clone(), row.handle, row.qos))
                .collect::<Vec<_>>()
        };

        for (filter, handle, qos) in snapshot {
            debug!("Subscribing again to {}", filter);

            if let Err(err) = self
                .upstream
                .subscribe(std::slice::from_ref(&filter), qos)
                .await
            {
                error!("Re-subscribe to {} failed: {}", filter, err);

                let mut rows = self.rows.lock().await;
                for row in rows.iter_mut() {
                    if matches!(row, Some(r) if r.handle == handle && r.filter == filter) {
                        *row = None;
                    }
                }
            }
        }
    }

    /// Tear down all subscriptions and watchers, closing their streams.
    pub async fn shutdown(&self) {
        let mut handles = Vec::new();

        {
            let mut rows = self.rows.lock().await;
            for row in rows.iter_mut() {
                if let Some(row) = row.take() {
                    handles.push(row.handle);
                }
            }
        }

        {
            let mut status = self.status.lock().await;
            for slot in status.watchers.iter_mut() {
                if let Some(handle) = slot.take() {
                    handles.push(handle);
                }
            }
        }

        let sink = match self.sink() {
            Ok(sink) => sink.clone(),
            Err(_) => return,
        };

        for handle in handles {
            sink.close(handle).await;
        }
    }
}
