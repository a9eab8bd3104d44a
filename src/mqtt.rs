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

//! The MQTT daemon core: one upstream connection to the cloud broker,
//! fanned out to any number of local bus subscribers.
//!
//! [`dispatch::SubscriptionDispatch`] owns the subscription and status
//! watcher tables, [`upstream`] owns the socket to the broker and
//! [`service`] exposes the whole thing as the `aws_iot_mqtt` bus interface.

use async_trait::async_trait;

use crate::error::Error;
use crate::object::Buffer;
use crate::topic::TopicFilter;

pub mod dispatch;
pub mod service;
pub mod upstream;

pub use crate::bus::StreamSink;

/// Operations the dispatcher and the bus handlers need from the upstream
/// MQTT connection.
///
/// The production implementation is [`upstream::UpstreamHandle`], a queue
/// into the connection task; all three operations block until the broker
/// acknowledged (or the client's internal timeout fired).
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn publish(&self, topic: &Buffer, payload: &Buffer, qos: u8) -> Result<(), Error>;
    async fn subscribe(&self, filters: &[TopicFilter], qos: u8) -> Result<(), Error>;
    async fn unsubscribe(&self, filters: &[TopicFilter]) -> Result<(), Error>;
}
