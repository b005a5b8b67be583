/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use async_trait::async_trait;
use enumflags2::BitFlags;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::drivers::cpu::{
    acpi_pm_profile_is_server, CPUFREQ_POLICY_DIR, CPU_POLICY_PREFIX, EPP_ATTR, GOVERNOR_ATTR,
};
use crate::drivers::{Driver, DriverContext, DriverEvent, DriverEventKind, DriverEventSender, DriverKind};
use crate::profile::{ActivationReason, PerformanceDegraded, ProbeResult, Profile, PROFILE_ALL};
use crate::path;
use crate::sysfs::{self, AttrWatcher};

const DRIVER_NAME: &str = "intel_pstate";

const PSTATE_STATUS_PATH: &str = "/sys/devices/system/cpu/intel_pstate/status";
const NO_TURBO_PATH: &str = "/sys/devices/system/cpu/intel_pstate/no_turbo";
const CPU_DIR: &str = "/sys/devices/system/cpu";
const EPB_ATTR: &str = "power/energy_perf_bias";

/// Intel P-State driver. Only usable in active mode, where the hardware
/// follows the per-policy energy/performance preference; EPB is written as
/// well on CPUs that expose it.
pub(crate) struct IntelPstateDriver {
    events: DriverEventSender,
    epp_devices: Vec<PathBuf>,
    epb_devices: Vec<PathBuf>,
    activated: Option<Profile>,
    degraded: Arc<Mutex<PerformanceDegraded>>,
    no_turbo_task: Option<JoinHandle<()>>,
}

fn profile_to_epp_pref(profile: Profile) -> &'static str {
    // energy_performance_available_preferences is not consulted; these
    // values are always accepted
    match profile {
        Profile::PowerSaver => "power",
        Profile::Balanced => "balance_power",
        Profile::Performance => "performance",
    }
}

fn profile_to_epb_value(profile: Profile) -> &'static str {
    match profile {
        Profile::PowerSaver => "15",
        Profile::Balanced => "6",
        Profile::Performance => "0",
    }
}

impl IntelPstateDriver {
    pub fn new(ctx: &DriverContext) -> IntelPstateDriver {
        IntelPstateDriver {
            events: ctx.events.clone(),
            epp_devices: Vec::new(),
            epb_devices: Vec::new(),
            activated: None,
            degraded: Arc::new(Mutex::new(PerformanceDegraded::None)),
            no_turbo_task: None,
        }
    }

    async fn probe_epp(&mut self) -> Result<ProbeResult> {
        let status = match sysfs::read_attr(path(PSTATE_STATUS_PATH)).await {
            Ok(status) => status,
            Err(_) => {
                debug!("No Intel P-State support");
                return Ok(ProbeResult::Fail);
            }
        };
        if status.trim() != "active" {
            debug!("Intel P-State is not running in active mode");
            return Ok(ProbeResult::Fail);
        }

        if acpi_pm_profile_is_server().await.unwrap_or(true) {
            debug!("Intel P-State not supported on this ACPI PM profile");
            return Ok(ProbeResult::Fail);
        }

        self.epp_devices =
            sysfs::matching_entries(&path(CPUFREQ_POLICY_DIR), CPU_POLICY_PREFIX, EPP_ATTR)
                .await
                .unwrap_or_default();
        if self.epp_devices.is_empty() {
            debug!("Didn't find Intel P-State energy performance preferences");
            return Ok(ProbeResult::Fail);
        }

        // cpufreq/cpuidle lack the attribute, so the loose prefix is fine
        self.epb_devices = sysfs::matching_entries(&path(CPU_DIR), "cpu", EPB_ATTR)
            .await
            .unwrap_or_default();

        self.watch_no_turbo().await;

        debug!(
            "Found Intel P-State settings on {} policies, EPB on {} CPUs",
            self.epp_devices.len(),
            self.epb_devices.len()
        );
        Ok(ProbeResult::Success)
    }

    /// Turbo gets disabled by the firmware under thermal pressure; surface
    /// that as a degraded performance profile.
    async fn watch_no_turbo(&mut self) {
        let no_turbo = path(NO_TURBO_PATH);
        let mut watcher = match AttrWatcher::new(&no_turbo) {
            Ok(watcher) => watcher,
            Err(e) => {
                debug!("Not monitoring no_turbo: {e:#}");
                return;
            }
        };
        let degraded = self.degraded.clone();
        let events = self.events.clone();
        update_no_turbo(&no_turbo, &degraded, &events).await;
        self.no_turbo_task = Some(tokio::spawn(async move {
            while watcher.changed().await.is_some() {
                update_no_turbo(&no_turbo, &degraded, &events).await;
            }
        }));
    }

    async fn apply(&self, profile: Profile) -> Result<()> {
        for base in &self.epp_devices {
            // The preference only takes effect under the powersave governor
            sysfs::write_attr(base.join(GOVERNOR_ATTR), "powersave").await?;
            sysfs::write_attr(base.join(EPP_ATTR), profile_to_epp_pref(profile)).await?;
        }
        for base in &self.epb_devices {
            sysfs::write_attr(base.join(EPB_ATTR), profile_to_epb_value(profile)).await?;
        }
        Ok(())
    }
}

async fn update_no_turbo(
    no_turbo: &std::path::Path,
    degraded: &Arc<Mutex<PerformanceDegraded>>,
    events: &DriverEventSender,
) {
    let state = match sysfs::read_attr(no_turbo).await.as_deref() {
        Ok("1") => PerformanceDegraded::HighOperatingTemperature,
        _ => PerformanceDegraded::None,
    };
    let changed = {
        let mut current = degraded.lock().unwrap();
        let changed = *current != state;
        *current = state;
        changed
    };
    if changed {
        debug!("no_turbo changed, performance is now '{state}'");
        let _ = events.send(DriverEvent {
            driver: DRIVER_NAME,
            kind: DriverEventKind::PerformanceDegradedChanged,
        });
    }
}

#[async_trait]
impl Driver for IntelPstateDriver {
    fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Cpu
    }

    fn profiles(&self) -> BitFlags<Profile> {
        PROFILE_ALL
    }

    async fn probe(&mut self) -> ProbeResult {
        self.probe_epp().await.unwrap_or(ProbeResult::Fail)
    }

    async fn activate(&mut self, profile: Profile, reason: ActivationReason) -> Result<()> {
        debug!("Activating {profile} on {DRIVER_NAME} ({reason})");
        if let Err(e) = self.apply(profile).await {
            if let Some(previous) = self.activated {
                if let Err(rollback) = self.apply(previous).await {
                    warn!("Failed to restore previous profile {previous}: {rollback:#}");
                }
            }
            return Err(e);
        }
        self.activated = Some(profile);
        Ok(())
    }

    fn performance_degraded(&self) -> PerformanceDegraded {
        *self.degraded.lock().unwrap()
    }
}

impl Drop for IntelPstateDriver {
    fn drop(&mut self) {
        if let Some(task) = self.no_turbo_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::drivers::cpu::test::fake_pm_profile;
    use crate::testing;
    use std::time::Duration;
    use tokio::fs::{create_dir_all, read_to_string, write};
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    async fn fake_policies(policies: &[&str]) {
        let base = path(CPUFREQ_POLICY_DIR);
        for policy in policies {
            let dir = base.join(policy);
            create_dir_all(&dir).await.unwrap();
            write(dir.join(GOVERNOR_ATTR), "performance\n").await.unwrap();
            write(dir.join(EPP_ATTR), "balance_performance\n").await.unwrap();
        }
    }

    async fn fake_pstate(status: &str) {
        let status_path = path(PSTATE_STATUS_PATH);
        create_dir_all(status_path.parent().unwrap()).await.unwrap();
        write(&status_path, status).await.unwrap();
    }

    fn driver() -> (IntelPstateDriver, tokio::sync::mpsc::UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = unbounded_channel();
        (IntelPstateDriver::new(&DriverContext { events: tx }), rx)
    }

    #[tokio::test]
    async fn probe_without_pstate() {
        let _h = testing::start();
        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Fail);
    }

    #[tokio::test]
    async fn probe_passive_mode() {
        let _h = testing::start();
        fake_pstate("passive\n").await;
        fake_pm_profile("2\n").await;
        fake_policies(&["policy0"]).await;
        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Fail);
    }

    #[tokio::test]
    async fn probe_server_pm_profile() {
        let _h = testing::start();
        fake_pstate("active\n").await;
        fake_pm_profile("4\n").await;
        fake_policies(&["policy0"]).await;
        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Fail);
    }

    #[tokio::test]
    async fn probe_and_activate() {
        let _h = testing::start();
        fake_pstate("active\n").await;
        fake_pm_profile("1\n").await;
        fake_policies(&["policy0", "policy1"]).await;

        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);

        driver
            .activate(Profile::Performance, ActivationReason::User)
            .await
            .expect("activate");
        for policy in ["policy0", "policy1"] {
            let base = path(CPUFREQ_POLICY_DIR).join(policy);
            assert_eq!(read_to_string(base.join(GOVERNOR_ATTR)).await.unwrap(), "powersave");
            assert_eq!(read_to_string(base.join(EPP_ATTR)).await.unwrap(), "performance");
        }

        driver
            .activate(Profile::PowerSaver, ActivationReason::User)
            .await
            .expect("activate");
        let base = path(CPUFREQ_POLICY_DIR).join("policy0");
        assert_eq!(read_to_string(base.join(EPP_ATTR)).await.unwrap(), "power");

        driver
            .activate(Profile::Balanced, ActivationReason::User)
            .await
            .expect("activate");
        assert_eq!(
            read_to_string(base.join(EPP_ATTR)).await.unwrap(),
            "balance_power"
        );
    }

    #[tokio::test]
    async fn activate_writes_epb() {
        let _h = testing::start();
        fake_pstate("active\n").await;
        fake_pm_profile("1\n").await;
        fake_policies(&["policy0"]).await;
        let epb = path(CPU_DIR).join("cpu0/power");
        create_dir_all(&epb).await.unwrap();
        write(epb.join("energy_perf_bias"), "6\n").await.unwrap();

        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);
        driver
            .activate(Profile::PowerSaver, ActivationReason::User)
            .await
            .expect("activate");
        assert_eq!(read_to_string(epb.join("energy_perf_bias")).await.unwrap(), "15");
    }

    #[tokio::test]
    async fn rollback_on_partial_failure() {
        let _h = testing::start();
        fake_pstate("active\n").await;
        fake_pm_profile("1\n").await;
        fake_policies(&["policy0", "policy1"]).await;

        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);
        driver
            .activate(Profile::Balanced, ActivationReason::Reset)
            .await
            .expect("activate");

        // Make policy1 unwritable by turning its preference into a directory
        let broken = path(CPUFREQ_POLICY_DIR).join("policy1").join(EPP_ATTR);
        tokio::fs::remove_file(&broken).await.unwrap();
        create_dir_all(&broken).await.unwrap();

        assert!(driver
            .activate(Profile::Performance, ActivationReason::User)
            .await
            .is_err());

        // policy0 was re-written back to the previously activated profile
        let base = path(CPUFREQ_POLICY_DIR).join("policy0");
        assert_eq!(
            read_to_string(base.join(EPP_ATTR)).await.unwrap(),
            "balance_power"
        );
    }

    #[tokio::test]
    async fn no_turbo_degrades_performance() {
        let _h = testing::start();
        fake_pstate("active\n").await;
        fake_pm_profile("1\n").await;
        fake_policies(&["policy0"]).await;
        let no_turbo = path(NO_TURBO_PATH);
        write(&no_turbo, "1\n").await.unwrap();

        let (mut driver, mut rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);
        assert_eq!(
            driver.performance_degraded(),
            PerformanceDegraded::HighOperatingTemperature
        );
        // The initial read already notified
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, DriverEventKind::PerformanceDegradedChanged);

        write(&no_turbo, "0\n").await.unwrap();
        let event = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("no degraded event")
            .unwrap();
        assert_eq!(event.kind, DriverEventKind::PerformanceDegradedChanged);
        assert_eq!(driver.performance_degraded(), PerformanceDegraded::None);
    }
}
