/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{ensure, Result};
use async_trait::async_trait;
use enumflags2::BitFlags;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::drivers::{Driver, DriverContext, DriverKind};
use crate::path;
use crate::profile::{ActivationReason, ProbeResult, Profile, PROFILE_ALL};
use crate::sysfs;

const DRIVER_NAME: &str = "tlp";

const TLP_PATH: &str = "/usr/sbin/tlp";
const TLP_PWR_MODE_PATH: &str = "/run/tlp/last_pwr";
const TLP_MANUAL_MODE_PATH: &str = "/run/tlp/manual_mode";

/// Delegates profile changes to an installed TLP, so the two daemons don't
/// fight over the same sysfs knobs. Only loads when TLP is present and has
/// been initialized.
pub(crate) struct TlpDriver {}

fn subcommand_for(profile: Profile) -> &'static str {
    match profile {
        Profile::PowerSaver => "bat",
        Profile::Balanced => "start",
        Profile::Performance => "ac",
    }
}

/// Map TLP's (manual_mode, last_pwr) run state onto a profile. Auto mode is
/// balanced; manual AC/BAT map to performance/power-saver.
async fn read_tlp_profile() -> Option<Profile> {
    let pwr_mode = match sysfs::read_attr(path(TLP_PWR_MODE_PATH)).await {
        Ok(value) => value,
        Err(e) => {
            debug!("Failed to read TLP power mode: {e:#}");
            return None;
        }
    };
    let manual_mode = sysfs::read_attr(path(TLP_MANUAL_MODE_PATH))
        .await
        .unwrap_or_else(|_| String::from("0"));

    match (manual_mode.chars().next(), pwr_mode.chars().next()) {
        (Some('0'), _) => Some(Profile::Balanced),
        (Some('1'), Some('0')) => Some(Profile::Performance),
        (Some('1'), Some('1')) => Some(Profile::PowerSaver),
        _ => None,
    }
}

impl TlpDriver {
    pub fn new(_ctx: &DriverContext) -> TlpDriver {
        TlpDriver {}
    }

    async fn call_tlp(&self, subcommand: &str) -> Result<()> {
        let tlp = path(TLP_PATH);
        debug!("Executing '{} {subcommand}'", tlp.display());
        let status = Command::new(&tlp).arg(subcommand).status().await?;
        ensure!(status.success(), "'{} {subcommand}' exited with {status}", tlp.display());
        Ok(())
    }
}

#[async_trait]
impl Driver for TlpDriver {
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
        if !fs::try_exists(path(TLP_PATH)).await.unwrap_or(false) {
            debug!("TLP is not installed");
            return ProbeResult::Fail;
        }
        if read_tlp_profile().await.is_none() {
            warn!("TLP not initialized. Initialize it to use the TLP-based driver");
            return ProbeResult::Fail;
        }
        debug!("Found TLP");
        ProbeResult::Success
    }

    async fn activate(&mut self, profile: Profile, reason: ActivationReason) -> Result<()> {
        debug!("Activating {profile} on {DRIVER_NAME} ({reason})");
        self.call_tlp(subcommand_for(profile)).await
    }
}
