/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use async_trait::async_trait;
use enumflags2::BitFlags;
use std::env;
use std::str::FromStr;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::drivers::{Driver, DriverContext, DriverEvent, DriverEventKind, DriverEventSender, DriverKind};
use crate::path;
use crate::profile::{ActivationReason, ProbeResult, Profile, PROFILE_ALL};
use crate::sysfs::{self, AttrWatcher, WriteSuppressor};

const DRIVER_NAME: &str = "fake";

const FAKE_DRIVER_ENV: &str = "POWER_PROFILE_DAEMON_FAKE_DRIVER";
const CONTROL_PATH: &str = "/run/power-profiles-daemon/fake-profile";

fn enabled() -> bool {
    match env::var(FAKE_DRIVER_ENV) {
        Ok(value) => !value.is_empty() && value != "0",
        Err(_) => false,
    }
}

/// Test driver, enabled through the environment. Writing a profile name to
/// its control file simulates a firmware-originated profile change.
pub(crate) struct FakeDriver {
    events: DriverEventSender,
    suppressor: Option<WriteSuppressor>,
    watch_task: Option<JoinHandle<()>>,
}

impl FakeDriver {
    pub fn new(ctx: &DriverContext) -> FakeDriver {
        FakeDriver {
            events: ctx.events.clone(),
            suppressor: None,
            watch_task: None,
        }
    }

    async fn setup_control_file(&mut self) -> Result<()> {
        let control = path(CONTROL_PATH);
        if let Some(parent) = control.parent() {
            fs::create_dir_all(parent).await?;
        }
        if !fs::try_exists(&control).await.unwrap_or(false) {
            fs::write(&control, b"balanced\n").await?;
        }

        let mut watcher = AttrWatcher::new(&control)?;
        self.suppressor = Some(watcher.suppressor());
        let events = self.events.clone();
        self.watch_task = Some(tokio::spawn(async move {
            while watcher.changed().await.is_some() {
                let value = match sysfs::read_attr(path(CONTROL_PATH)).await {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                match Profile::from_str(value.trim()) {
                    Ok(profile) => {
                        debug!("Fake driver profile changed to {profile}");
                        let _ = events.send(DriverEvent {
                            driver: DRIVER_NAME,
                            kind: DriverEventKind::ProfileChanged(profile),
                        });
                    }
                    Err(_) => warn!("Ignoring bogus fake profile '{value}'"),
                }
            }
        }));
        Ok(())
    }
}

#[async_trait]
impl Driver for FakeDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Platform
    }

    fn profiles(&self) -> BitFlags<Profile> {
        PROFILE_ALL
    }

    async fn probe(&mut self) -> ProbeResult {
        if !enabled() {
            return ProbeResult::Fail;
        }
        match self.setup_control_file().await {
            Ok(()) => ProbeResult::Success,
            Err(e) => {
                warn!("Fake driver failed to set up its control file: {e:#}");
                ProbeResult::Fail
            }
        }
    }

    async fn activate(&mut self, profile: Profile, reason: ActivationReason) -> Result<()> {
        debug!("Activating {profile} on {DRIVER_NAME} ({reason})");
        let Some(suppressor) = self.suppressor.as_ref() else {
            return Ok(());
        };
        let _guard = suppressor.hold();
        sysfs::write_attr(path(CONTROL_PATH), format!("{profile}\n")).await
    }
}

impl Drop for FakeDriver {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
    }
}
