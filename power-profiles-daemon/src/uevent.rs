/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use std::path::PathBuf;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_udev::{AsyncMonitorSocket, EventType, MonitorBuilder};
use tracing::{debug, warn};

/// A device that appeared after startup.
#[derive(Debug, Clone)]
pub(crate) struct AddedDevice {
    pub syspath: PathBuf,
}

pub(crate) struct AddWatch {
    task: JoinHandle<()>,
    events: UnboundedReceiver<AddedDevice>,
}

impl AddWatch {
    /// Subscribe to "add" uevents for a subsystem. Late-appearing devices
    /// are how hotpluggable peripherals and deferred panels show up; callers
    /// re-apply their current setting to each one.
    pub fn new(subsystem: &str) -> Result<AddWatch> {
        let monitor = MonitorBuilder::new()?
            .match_subsystem(subsystem)?
            .listen()?;
        let socket = AsyncMonitorSocket::new(monitor)?;
        let (tx, events) = unbounded_channel();
        let subsystem = subsystem.to_string();
        let task = tokio::spawn(async move {
            let mut socket = socket;
            while let Some(event) = socket.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("Error reading uevent for {subsystem}: {e}");
                        continue;
                    }
                };
                if event.event_type() != EventType::Add {
                    continue;
                }
                debug!("{subsystem} device added: {}", event.syspath().display());
                let _ = tx.send(AddedDevice {
                    syspath: event.syspath().to_path_buf(),
                });
            }
        });
        Ok(AddWatch { task, events })
    }

    pub async fn added(&mut self) -> Option<AddedDevice> {
        self.events.recv().await
    }
}

impl Drop for AddWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}
