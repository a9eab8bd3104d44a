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

//! Shared helpers for socket-level tests.
//!
//! All tests in this binary share one runtime directory; every test uses
//! its own interface name, so the socket files never collide.

use std::path::PathBuf;
use std::sync::Once;
use std::time::Duration;

use async_std::task;

use crate::bus::socket_path;

pub fn init_socket_dir() -> PathBuf {
    static ONCE: Once = Once::new();

    let dir = std::env::temp_dir().join(format!("gglite-test-{}", std::process::id()));

    ONCE.call_once(|| {
        std::fs::create_dir_all(&dir).unwrap();
        std::env::set_var("GGL_SOCKET_DIR", &dir);
    });

    dir
}

/// Wait for a freshly spawned server to have bound its socket.
pub async fn wait_for_interface(interface: &str) {
    let path = socket_path(interface);

    for _ in 0..200 {
        if path.exists() {
            return;
        }
        task::sleep(Duration::from_millis(5)).await;
    }

    panic!("interface {} did not come up", interface);
}
