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

//! gglite is a lightweight IoT edge agent runtime for constrained Linux
//! devices. Local components talk to each other over the core bus (framed
//! RPC and pub/sub on Unix sockets, [`bus`]) and reach the cloud through
//! the MQTT daemon, which multiplexes one upstream connection across all
//! local subscribers ([`mqtt`]).

pub mod bus;
pub mod config_store;
pub mod error;
pub mod gg_config;
pub mod mqtt;
pub mod object;
pub mod topic;
pub mod watched_tasks;

#[cfg(test)]
pub(crate) mod testutil;
