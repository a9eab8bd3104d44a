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

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Context as AnyhowContext, Result};
use async_std::task;
use log::info;

// This is a wrapper around async_std::task::spawn() that keeps track of the
// tasks it spawned. This solves the problem of error propagation from tasks
// for us.
// The daemons spawn a handful of long-running tasks (socket accept loops,
// the upstream MQTT connection) that should run for as long as the daemon
// runs; if any one of them fails the daemon should stop so the service
// manager can restart it in a known state.

type TaskResult = Result<()>;
type TaskHandle = task::JoinHandle<TaskResult>;

pub struct WatchedTasksBuilder {
    tasks: Vec<TaskHandle>,
}

pub struct WatchedTasks {
    tasks: Vec<TaskHandle>,
}

impl WatchedTasksBuilder {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Spawn an async task that runs until the end of the program
    ///
    /// If any of the tasks spawned this way returns, the WatchedTasks
    /// Future will return the Result of said task.
    /// The WatchedTasks Future should be .awaited at the end of main() so
    /// that the program ends if any of the watched tasks ends.
    pub fn spawn_task<S, F>(&mut self, name: S, future: F) -> Result<()>
    where
        S: Into<String>,
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let task = task::Builder::new().name(name.into()).spawn(future)?;

        self.tasks.push(task);

        Ok(())
    }

    /// Complete the task creation and enter the steady state of the program
    ///
    /// The returned WatchedTasks should be .awaited at the end of `main()`
    /// to end the program if any of the watched tasks ends.
    pub fn watch(self) -> WatchedTasks {
        info!("Spawned {} tasks", self.tasks.len());

        WatchedTasks { tasks: self.tasks }
    }
}

impl Future for WatchedTasks {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        for task in self.tasks.iter_mut() {
            let name = task.task().name().unwrap_or("<unknown>").to_owned();

            if let Poll::Ready(res) = Pin::new(task).poll(cx) {
                info!("Task {name} has completed");

                let res = res.with_context(|| format!("Failed in task {name}"));

                // The first task to finish determines when all others
                // should finish as well.
                return Poll::Ready(res);
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;
    use async_std::channel::{unbounded, Sender};
    use async_std::future::timeout;
    use async_std::task::block_on;

    use super::{TaskResult, WatchedTasks, WatchedTasksBuilder};

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn setup_tasks() -> (WatchedTasks, Vec<Sender<TaskResult>>) {
        let mut wtb = WatchedTasksBuilder::new();

        // Spawn tasks that each wait for a message on a channel and
        // complete if they receive it.
        let senders: Vec<_> = (0..5)
            .map(|i| {
                let (tx, rx) = unbounded();

                wtb.spawn_task(format!("task-{i}"), async move {
                    let res = rx.recv().await?;
                    res
                })
                .unwrap();

                tx
            })
            .collect();

        (wtb.watch(), senders)
    }

    #[test]
    fn tasks_end_execution() -> Result<()> {
        let (mut wt, senders) = setup_tasks();

        // At this point none of the tasks have completed yet.
        // Make sure wt reflects that.
        let wt_early_res = block_on(timeout(TIMEOUT, async { (&mut wt).await }));
        assert!(wt_early_res.is_err());

        // Make one of the tasks complete.
        senders[3].try_send(Ok(()))?;

        // Now wt should complete as well.
        let wt_late_res = block_on(timeout(TIMEOUT, async { (&mut wt).await }));
        assert!(matches!(wt_late_res, Ok(Ok(()))));

        Ok(())
    }
}
