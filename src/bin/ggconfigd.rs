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

//! ggconfigd, the configuration daemon.
//!
//! Serves the `gg_config` interface (and the private system config lookup
//! used by the IPC gateway) from a snapshot-persisted configuration tree.

use std::env;
use std::fs::File;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::info;

use gglite::bus::Server;
use gglite::config_store::{self, ConfigStore};
use gglite::gg_config;
use gglite::watched_tasks::WatchedTasksBuilder;

fn db_path() -> PathBuf {
    env::var_os("GGL_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/var/lib/gglite/config.db"))
}

async fn maybe_import(store: &ConfigStore) -> Result<()> {
    let path = match env::var_os("GGL_CONFIG_IMPORT") {
        Some(path) => path,
        None => return Ok(()),
    };

    if !store.is_empty().await {
        info!("Store already holds configuration, skipping import");
        return Ok(());
    }

    let file = File::open(&path)
        .with_context(|| format!("Could not open import file {:?}", path))?;
    let json = serde_json::from_reader(file)
        .with_context(|| format!("Could not parse import file {:?}", path))?;

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is before the epoch")?
        .as_millis() as i64;

    store.import_json(&json, timestamp).await?;
    info!("Imported initial configuration from {:?}", path);

    Ok(())
}

#[async_std::main]
async fn main() -> Result<()> {
    env_logger::init();

    let store = ConfigStore::open(Some(db_path()))?;

    maybe_import(&store).await?;

    let mut wtb = WatchedTasksBuilder::new();

    let server = Server::new(gg_config::INTERFACE, config_store::methods(store.clone()));
    store.set_sink(server.clone());

    wtb.spawn_task("gg-config-server", async move {
        server.listen().await?;
        Ok(())
    })?;

    let private = Server::new(
        config_store::PRIVATE_INTERFACE,
        config_store::private_methods(store.clone()),
    );

    wtb.spawn_task("ipc-private-server", async move {
        private.listen().await?;
        Ok(())
    })?;

    info!("ggconfigd is up");

    wtb.watch().await
}
