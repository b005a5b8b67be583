/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{ensure, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use zbus::Connection;

use crate::actions::{Action, ActionContext};
use crate::path;
use crate::profile::Profile;
use crate::sysdev::{self, SysDevice};
use crate::sysfs;
use crate::uevent::AddWatch;

const ACTION_NAME: &str = "amdgpu_panel_power";

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const DRM_SUBSYSTEM: &str = "drm";
const PANEL_POWER_ATTR: &str = "amdgpu/panel_power_savings";

#[zbus::proxy(
    interface = "org.freedesktop.UPower",
    default_service = "org.freedesktop.UPower",
    default_path = "/org/freedesktop/UPower"
)]
trait UPower {
    #[zbus(property)]
    fn on_battery(&self) -> zbus::Result<bool>;
}

#[derive(Default)]
struct PanelState {
    last_profile: Option<Profile>,
    on_battery: bool,
}

impl PanelState {
    /// The AMD panel power savings level, 0 (off) to 4. Only engaged on
    /// battery; plugged in, the panel always runs at full quality.
    fn target(&self) -> u32 {
        if !self.on_battery {
            return 0;
        }
        match self.last_profile {
            Some(Profile::PowerSaver) => 4,
            Some(Profile::Balanced) => 3,
            Some(Profile::Performance) | None => 0,
        }
    }
}

/// Drives the amdgpu panel_power_savings level on eDP panels, tracking both
/// profile transitions and battery state, and catching panels that appear
/// after startup.
pub(crate) struct AmdgpuPanelPowerAction {
    connection: Option<Connection>,
    state: Arc<Mutex<PanelState>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Returns whether the panel was written; connectors without the attribute
/// or already at the target level are left alone.
async fn set_panel_power(device: &SysDevice, target: u32) -> Result<bool> {
    if !device.has_attr(PANEL_POWER_ATTR).await {
        return Ok(false);
    }
    let current = device.attr(PANEL_POWER_ATTR).await?;
    if current.trim().parse::<u32>() == Ok(target) {
        return Ok(false);
    }
    debug!(
        "Setting panel power savings for '{}' to {target}",
        device.sysname()
    );
    device
        .write_attr(PANEL_POWER_ATTR, &target.to_string())
        .await?;
    Ok(true)
}

/// There is a single eDP panel to drive; update the first connector whose
/// level is out of date and stop.
async fn apply_panels(state: &Arc<Mutex<PanelState>>) -> Result<()> {
    let target = state.lock().unwrap().target();
    for device in sysdev::enumerate_devices(DRM_SUBSYSTEM).await? {
        if set_panel_power(&device, target).await? {
            break;
        }
    }
    Ok(())
}

impl AmdgpuPanelPowerAction {
    pub fn new(ctx: &ActionContext) -> AmdgpuPanelPowerAction {
        AmdgpuPanelPowerAction {
            connection: ctx.connection.clone(),
            state: Arc::new(Mutex::new(PanelState::default())),
            tasks: Vec::new(),
        }
    }

    async fn watch_battery(&mut self, connection: &Connection) -> Result<()> {
        let proxy = UPowerProxy::new(connection).await?;
        let on_battery = proxy.on_battery().await.unwrap_or(false);
        self.state.lock().unwrap().on_battery = on_battery;

        let mut stream = proxy.receive_on_battery_changed().await;
        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(change) = stream.next().await {
                let Ok(on_battery) = change.get().await else {
                    continue;
                };
                {
                    let mut state = state.lock().unwrap();
                    if state.on_battery == on_battery {
                        continue;
                    }
                    state.on_battery = on_battery;
                }
                debug!("OnBattery is now {on_battery}");
                if let Err(e) = apply_panels(&state).await {
                    warn!("Failed to update panel power: {e:#}");
                }
            }
        }));
        Ok(())
    }

    fn watch_added_connectors(&mut self) {
        let mut watch = match AddWatch::new(DRM_SUBSYSTEM) {
            Ok(watch) => watch,
            Err(e) => {
                debug!("Not watching for new panels: {e:#}");
                return;
            }
        };
        let state = self.state.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(added) = watch.added().await {
                let device = SysDevice::from_syspath(&added.syspath);
                let target = state.lock().unwrap().target();
                if let Err(e) = set_panel_power(&device, target).await {
                    warn!("Failed to set panel power on new panel: {e:#}");
                }
            }
        }));
    }
}

#[async_trait]
impl Action for AmdgpuPanelPowerAction {
    fn name(&self) -> &'static str {
        ACTION_NAME
    }

    async fn probe(&mut self) -> Result<()> {
        let cpuinfo = sysfs::read_attr(path(CPUINFO_PATH)).await?;
        ensure!(cpuinfo.contains("AuthenticAMD"), "Not an AMD CPU");

        match self.connection.clone() {
            Some(connection) => {
                if let Err(e) = self.watch_battery(&connection).await {
                    debug!("upower not available; battery data might be stale: {e:#}");
                }
            }
            None => debug!("No bus connection; battery data might be stale"),
        }
        self.watch_added_connectors();
        Ok(())
    }

    async fn apply(&mut self, profile: Profile) -> Result<()> {
        self.state.lock().unwrap().last_profile = Some(profile);
        apply_panels(&self.state).await
    }
}

impl Drop for AmdgpuPanelPowerAction {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;
    use tokio::fs::{create_dir_all, read_to_string, write};

    async fn fake_cpuinfo(vendor: &str) {
        let cpuinfo = path(CPUINFO_PATH);
        create_dir_all(cpuinfo.parent().unwrap()).await.unwrap();
        write(&cpuinfo, format!("vendor_id\t: {vendor}\n")).await.unwrap();
    }

    async fn fake_panel(name: &str, value: &str) {
        let base = path(format!("/sys/class/drm/{name}/amdgpu"));
        create_dir_all(&base).await.unwrap();
        write(base.join("panel_power_savings"), value).await.unwrap();
    }

    fn action() -> AmdgpuPanelPowerAction {
        AmdgpuPanelPowerAction::new(&ActionContext { connection: None })
    }

    #[tokio::test]
    async fn probe_needs_amd_cpu() {
        let _h = testing::start();
        fake_cpuinfo("GenuineIntel").await;
        assert!(action().probe().await.is_err());

        fake_cpuinfo("AuthenticAMD").await;
        assert!(action().probe().await.is_ok());
    }

    #[tokio::test]
    async fn on_ac_stays_off() {
        let _h = testing::start();
        fake_panel("card0-eDP-1", "3\n").await;

        let mut action = action();
        action.apply(Profile::PowerSaver).await.expect("apply");
        let attr = path("/sys/class/drm/card0-eDP-1/amdgpu/panel_power_savings");
        assert_eq!(read_to_string(attr).await.unwrap(), "0");
    }

    #[tokio::test]
    async fn on_battery_tracks_profile() {
        let _h = testing::start();
        fake_panel("card0-eDP-1", "0\n").await;
        // A connector without the attribute is skipped
        create_dir_all(path("/sys/class/drm/card0-DP-1")).await.unwrap();

        let mut action = action();
        action.state.lock().unwrap().on_battery = true;

        let attr = path("/sys/class/drm/card0-eDP-1/amdgpu/panel_power_savings");

        action.apply(Profile::PowerSaver).await.expect("apply");
        assert_eq!(read_to_string(&attr).await.unwrap(), "4");

        action.apply(Profile::Balanced).await.expect("apply");
        assert_eq!(read_to_string(&attr).await.unwrap(), "3");

        action.apply(Profile::Performance).await.expect("apply");
        assert_eq!(read_to_string(&attr).await.unwrap(), "0");
    }

    #[tokio::test]
    async fn only_stale_panel_written() {
        let _h = testing::start();
        fake_panel("card0-eDP-1", "4\n").await;
        fake_panel("card1-eDP-1", "0\n").await;

        let mut action = action();
        action.state.lock().unwrap().on_battery = true;
        action.apply(Profile::PowerSaver).await.expect("apply");

        // The up-to-date panel keeps its raw contents; the stale one is
        // brought to the target and iteration stops there
        let attr = path("/sys/class/drm/card0-eDP-1/amdgpu/panel_power_savings");
        assert_eq!(read_to_string(&attr).await.unwrap(), "4\n");
        let attr = path("/sys/class/drm/card1-eDP-1/amdgpu/panel_power_savings");
        assert_eq!(read_to_string(&attr).await.unwrap(), "4");
    }

    #[tokio::test]
    async fn unchanged_value_not_rewritten() {
        let _h = testing::start();
        fake_panel("card0-eDP-1", "0\n").await;

        let mut action = action();
        action.apply(Profile::Performance).await.expect("apply");
        let attr = path("/sys/class/drm/card0-eDP-1/amdgpu/panel_power_savings");
        assert_eq!(read_to_string(attr).await.unwrap(), "0\n");
    }
}
