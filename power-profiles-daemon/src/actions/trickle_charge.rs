/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{ensure, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::actions::Action;
use crate::path;
use crate::profile::Profile;
use crate::sysdev::{self, SysDevice};
use crate::uevent::AddWatch;

const ACTION_NAME: &str = "trickle_charge";

const POWER_SUPPLY_SUBSYSTEM: &str = "power_supply";
const CHARGE_TYPE_ATTR: &str = "charge_type";
const SCOPE_ATTR: &str = "scope";

/// Slow-charges peripherals while saving power. Applies to every
/// Device-scoped power supply that exposes a charge type, including ones
/// that appear after startup.
pub(crate) struct TrickleChargeAction {
    trickle: Arc<AtomicBool>,
    watch_task: Option<JoinHandle<()>>,
}

fn charge_type_for(trickle: bool) -> &'static str {
    if trickle {
        "Trickle"
    } else {
        "Fast"
    }
}

async fn set_charge_type(device: &SysDevice, charge_type: &str) -> Result<()> {
    if !device.has_attr(CHARGE_TYPE_ATTR).await {
        return Ok(());
    }
    if !matches!(device.attr(SCOPE_ATTR).await.as_deref(), Ok("Device")) {
        return Ok(());
    }
    if matches!(
        device.attr(CHARGE_TYPE_ATTR).await.as_deref(),
        Ok(current) if current == charge_type
    ) {
        return Ok(());
    }
    debug!(
        "Setting charge type for '{}' to '{charge_type}'",
        device.sysname()
    );
    device.write_attr(CHARGE_TYPE_ATTR, charge_type).await
}

impl TrickleChargeAction {
    pub fn new() -> TrickleChargeAction {
        TrickleChargeAction {
            trickle: Arc::new(AtomicBool::new(false)),
            watch_task: None,
        }
    }

    fn watch_added_devices(&mut self) {
        let mut watch = match AddWatch::new(POWER_SUPPLY_SUBSYSTEM) {
            Ok(watch) => watch,
            Err(e) => {
                debug!("Not watching for new power supplies: {e:#}");
                return;
            }
        };
        let trickle = self.trickle.clone();
        self.watch_task = Some(tokio::spawn(async move {
            while let Some(added) = watch.added().await {
                let device = SysDevice::from_syspath(&added.syspath);
                let charge_type = charge_type_for(trickle.load(Ordering::SeqCst));
                if let Err(e) = set_charge_type(&device, charge_type).await {
                    warn!("Failed to set charge type on new device: {e:#}");
                }
            }
        }));
    }
}

#[async_trait]
impl Action for TrickleChargeAction {
    fn name(&self) -> &'static str {
        ACTION_NAME
    }

    async fn probe(&mut self) -> Result<()> {
        ensure!(
            fs::try_exists(path(format!("/sys/class/{POWER_SUPPLY_SUBSYSTEM}")))
                .await
                .unwrap_or(false),
            "No power_supply class"
        );
        self.watch_added_devices();
        Ok(())
    }

    async fn apply(&mut self, profile: Profile) -> Result<()> {
        let trickle = profile == Profile::PowerSaver;
        self.trickle.store(trickle, Ordering::SeqCst);
        let charge_type = charge_type_for(trickle);
        for device in sysdev::enumerate_devices(POWER_SUPPLY_SUBSYSTEM).await? {
            if let Err(e) = set_charge_type(&device, charge_type).await {
                warn!("Failed to set charge type on '{}': {e:#}", device.sysname());
            }
        }
        Ok(())
    }
}

impl Drop for TrickleChargeAction {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;
    use tokio::fs::{create_dir_all, read_to_string, write};

    async fn fake_supply(name: &str, scope: Option<&str>, charge_type: Option<&str>) {
        let base = path(format!("/sys/class/power_supply/{name}"));
        create_dir_all(&base).await.unwrap();
        if let Some(scope) = scope {
            write(base.join(SCOPE_ATTR), format!("{scope}\n")).await.unwrap();
        }
        if let Some(charge_type) = charge_type {
            write(base.join(CHARGE_TYPE_ATTR), format!("{charge_type}\n"))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn probe_without_subsystem() {
        let _h = testing::start();
        assert!(TrickleChargeAction::new().probe().await.is_err());
    }

    #[tokio::test]
    async fn applies_to_device_scoped_supplies() {
        let _h = testing::start();
        fake_supply("AC", None, None).await;
        fake_supply("BAT0", Some("System"), Some("Fast")).await;
        fake_supply("hid-kbd-battery", Some("Device"), Some("Fast")).await;
        fake_supply("hid-mouse-battery", Some("Device"), Some("Fast")).await;

        let mut action = TrickleChargeAction::new();
        action.apply(Profile::PowerSaver).await.expect("apply");

        for name in ["hid-kbd-battery", "hid-mouse-battery"] {
            let attr = path(format!("/sys/class/power_supply/{name}/charge_type"));
            assert_eq!(read_to_string(attr).await.unwrap(), "Trickle");
        }
        // System-scoped supplies are left alone
        let attr = path("/sys/class/power_supply/BAT0/charge_type");
        assert_eq!(read_to_string(attr).await.unwrap(), "Fast\n");

        action.apply(Profile::Balanced).await.expect("apply");
        let attr = path("/sys/class/power_supply/hid-kbd-battery/charge_type");
        assert_eq!(read_to_string(attr).await.unwrap(), "Fast");
    }

    #[tokio::test]
    async fn unchanged_value_not_rewritten() {
        let _h = testing::start();
        fake_supply("hid-kbd-battery", Some("Device"), Some("Fast")).await;

        let mut action = TrickleChargeAction::new();
        action.apply(Profile::Performance).await.expect("apply");
        // The trailing newline survives because the attribute was not
        // rewritten with the same value
        let attr = path("/sys/class/power_supply/hid-kbd-battery/charge_type");
        assert_eq!(read_to_string(attr).await.unwrap(), "Fast\n");
    }
}
