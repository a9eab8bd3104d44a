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

//! iotcored, the MQTT daemon.
//!
//! Owns the upstream connection to the cloud broker and serves the
//! `aws_iot_mqtt` interface on the bus. Connection settings come from the
//! environment or a JSON config file; whatever is still missing is looked
//! up in the config daemon, so a provisioned device needs no extra
//! configuration here.

use std::env;
use std::fs::File;

use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;

use gglite::bus::Server;
use gglite::gg_config;
use gglite::mqtt::dispatch::SubscriptionDispatch;
use gglite::mqtt::service;
use gglite::mqtt::upstream::{run_upstream, upstream_channel, UpstreamConfig};
use gglite::object::Buffer;
use gglite::watched_tasks::WatchedTasksBuilder;

#[derive(Deserialize, Default)]
struct FileConfig {
    endpoint: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    keep_alive: Option<u16>,
}

fn file_config() -> Result<FileConfig> {
    match env::var_os("GGL_IOTCORED_CONFIG") {
        Some(path) => {
            let file = File::open(&path)
                .with_context(|| format!("Could not open config file {:?}", path))?;
            serde_json::from_reader(file)
                .with_context(|| format!("Could not parse config file {:?}", path))
        }
        None => Ok(FileConfig::default()),
    }
}

fn key_path(parts: &[&str]) -> Vec<Buffer> {
    parts.iter().map(|p| Buffer::from(*p)).collect()
}

async fn resolve_config() -> Result<UpstreamConfig> {
    let file = file_config()?;

    let endpoint = match env::var("GGL_MQTT_ENDPOINT").ok().or(file.endpoint) {
        Some(endpoint) => endpoint,
        None => gg_config::read_str(&key_path(&[
            "services",
            "aws.greengrass.NucleusLite",
            "configuration",
            "iotDataEndpoint",
        ]))
        .await
        .context("No MQTT endpoint configured")?,
    };

    let client_id = match env::var("GGL_MQTT_CLIENT_ID").ok().or(file.client_id) {
        Some(client_id) => client_id,
        None => gg_config::read_str(&key_path(&["system", "thingName"]))
            .await
            .context("No MQTT client id configured")?,
    };

    let mut config = UpstreamConfig::new(endpoint, client_id);

    if let Some(port) = env::var("GGL_MQTT_PORT")
        .ok()
        .and_then(|port| port.parse().ok())
        .or(file.port)
    {
        config.port = port;
    }

    if let Some(keep_alive) = file.keep_alive {
        config.keep_alive = keep_alive;
    }

    Ok(config)
}

#[async_std::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = resolve_config().await?;

    let mut wtb = WatchedTasksBuilder::new();

    let (upstream, queue) = upstream_channel();
    let dispatch = SubscriptionDispatch::new(upstream.clone());

    let server = Server::new(
        service::INTERFACE,
        service::methods(dispatch.clone(), upstream),
    );
    dispatch.set_sink(server.clone());

    wtb.spawn_task(
        "mqtt-upstream",
        run_upstream(config, dispatch.clone(), queue),
    )?;

    wtb.spawn_task("bus-server", async move {
        server.listen().await?;
        Ok(())
    })?;

    info!("iotcored is up");

    wtb.watch().await
}
