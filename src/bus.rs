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

//! The core bus: a framed RPC and pub/sub transport over Unix sockets.
//!
//! Every daemon exposes one interface on one well-known socket below the
//! runtime directory. Clients connect per operation: a `call` blocks for
//! exactly one reply, a `notify` returns once the frame is written and a
//! `subscribe` turns the connection into a long-lived server-push stream.

use std::env;
use std::path::PathBuf;

mod client;
mod frame;
mod handle;
mod server;

pub use client::{
    bus, call, close_subscription, notify, subscribe, BusClient, ChannelObserver,
    SubscriptionObserver,
};
pub use frame::{Frame, RequestType, MAX_MSG_LEN};
pub use handle::Handle;
pub use server::{Handler, Method, Server, StreamObserver, StreamSink, MAX_STREAMS};

/// Runtime directory holding the bus sockets.
pub fn socket_dir() -> PathBuf {
    env::var_os("GGL_SOCKET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/run/gglite"))
}

/// Socket path for a named interface.
pub fn socket_path(interface: &str) -> PathBuf {
    socket_dir().join(interface)
}
