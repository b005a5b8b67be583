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
use tracing::{debug, warn};

use crate::drivers::cpu::{
    acpi_pm_profile_is_server, CPUFREQ_POLICY_DIR, CPU_POLICY_PREFIX, EPP_ATTR, GOVERNOR_ATTR,
};
use crate::drivers::{Driver, DriverContext, DriverKind};
use crate::path;
use crate::profile::{ActivationReason, ProbeResult, Profile, PROFILE_ALL};
use crate::sysfs;

const DRIVER_NAME: &str = "amd_pstate";

const PSTATE_STATUS_PATH: &str = "/sys/devices/system/cpu/amd_pstate/status";

/// AMD P-State driver. Drives the per-policy energy/performance preference;
/// the hardware only honors it in active mode.
pub(crate) struct AmdPstateDriver {
    epp_devices: Vec<PathBuf>,
    activated: Option<Profile>,
}

fn profile_to_gov_pref(profile: Profile) -> &'static str {
    match profile {
        Profile::PowerSaver => "powersave",
        Profile::Balanced => "powersave",
        Profile::Performance => "performance",
    }
}

fn profile_to_epp_pref(profile: Profile) -> &'static str {
    // energy_performance_available_preferences is not consulted; these
    // values are always accepted
    match profile {
        Profile::PowerSaver => "power",
        Profile::Balanced => "balance_performance",
        Profile::Performance => "performance",
    }
}

impl AmdPstateDriver {
    pub fn new(_ctx: &DriverContext) -> AmdPstateDriver {
        AmdPstateDriver {
            epp_devices: Vec::new(),
            activated: None,
        }
    }

    async fn probe_epp(&mut self) -> Result<ProbeResult> {
        let status = match sysfs::read_attr(path(PSTATE_STATUS_PATH)).await {
            Ok(status) => status,
            Err(_) => {
                debug!("No AMD P-State support");
                return Ok(ProbeResult::Fail);
            }
        };
        if status.trim() != "active" {
            debug!("AMD P-State is not running in active mode");
            return Ok(ProbeResult::Fail);
        }

        if acpi_pm_profile_is_server().await.unwrap_or(true) {
            debug!("AMD P-State not supported on this ACPI PM profile");
            return Ok(ProbeResult::Fail);
        }

        self.epp_devices =
            sysfs::matching_entries(&path(CPUFREQ_POLICY_DIR), CPU_POLICY_PREFIX, EPP_ATTR)
                .await
                .unwrap_or_default();
        if self.epp_devices.is_empty() {
            debug!("Didn't find AMD P-State energy performance preferences");
            return Ok(ProbeResult::Fail);
        }

        debug!("Found AMD P-State settings on {} policies", self.epp_devices.len());
        Ok(ProbeResult::Success)
    }

    async fn apply(&self, profile: Profile) -> Result<()> {
        for base in &self.epp_devices {
            sysfs::write_attr(base.join(GOVERNOR_ATTR), profile_to_gov_pref(profile)).await?;
            sysfs::write_attr(base.join(EPP_ATTR), profile_to_epp_pref(profile)).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Driver for AmdPstateDriver {
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
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::drivers::cpu::test::fake_pm_profile;
    use crate::testing;
    use tokio::fs::{create_dir_all, read_to_string, write};
    use tokio::sync::mpsc::unbounded_channel;

    async fn fake_pstate(status: &str) {
        let status_path = path(PSTATE_STATUS_PATH);
        create_dir_all(status_path.parent().unwrap()).await.unwrap();
        write(&status_path, status).await.unwrap();
    }

    async fn fake_policies(policies: &[&str]) {
        let base = path(CPUFREQ_POLICY_DIR);
        for policy in policies {
            let dir = base.join(policy);
            create_dir_all(&dir).await.unwrap();
            write(dir.join(GOVERNOR_ATTR), "schedutil\n").await.unwrap();
            write(dir.join(EPP_ATTR), "balance_performance\n").await.unwrap();
        }
    }

    fn driver() -> AmdPstateDriver {
        let (tx, _rx) = unbounded_channel();
        AmdPstateDriver::new(&DriverContext { events: tx })
    }

    #[tokio::test]
    async fn probe_without_pstate() {
        let _h = testing::start();
        assert_eq!(driver().probe().await, ProbeResult::Fail);
    }

    #[tokio::test]
    async fn probe_guided_mode() {
        let _h = testing::start();
        fake_pstate("guided\n").await;
        fake_pm_profile("1\n").await;
        fake_policies(&["policy0"]).await;
        assert_eq!(driver().probe().await, ProbeResult::Fail);
    }

    #[tokio::test]
    async fn probe_server_pm_profile() {
        let _h = testing::start();
        fake_pstate("active\n").await;
        fake_pm_profile("5\n").await;
        fake_policies(&["policy0"]).await;
        assert_eq!(driver().probe().await, ProbeResult::Fail);
    }

    #[tokio::test]
    async fn probe_and_activate() {
        let _h = testing::start();
        fake_pstate("active\n").await;
        fake_pm_profile("2\n").await;
        fake_policies(&["policy0", "policy1"]).await;

        let mut driver = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);

        driver
            .activate(Profile::Performance, ActivationReason::User)
            .await
            .expect("activate");
        for policy in ["policy0", "policy1"] {
            let base = path(CPUFREQ_POLICY_DIR).join(policy);
            assert_eq!(
                read_to_string(base.join(GOVERNOR_ATTR)).await.unwrap(),
                "performance"
            );
            assert_eq!(read_to_string(base.join(EPP_ATTR)).await.unwrap(), "performance");
        }

        driver
            .activate(Profile::Balanced, ActivationReason::User)
            .await
            .expect("activate");
        let base = path(CPUFREQ_POLICY_DIR).join("policy0");
        assert_eq!(read_to_string(base.join(GOVERNOR_ATTR)).await.unwrap(), "powersave");
        assert_eq!(
            read_to_string(base.join(EPP_ATTR)).await.unwrap(),
            "balance_performance"
        );
    }

    #[tokio::test]
    async fn rollback_on_partial_failure() {
        let _h = testing::start();
        fake_pstate("active\n").await;
        fake_pm_profile("1\n").await;
        fake_policies(&["policy0", "policy1"]).await;

        let mut driver = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);
        driver
            .activate(Profile::PowerSaver, ActivationReason::Reset)
            .await
            .expect("activate");

        let broken = path(CPUFREQ_POLICY_DIR).join("policy1").join(EPP_ATTR);
        tokio::fs::remove_file(&broken).await.unwrap();
        create_dir_all(&broken).await.unwrap();

        assert!(driver
            .activate(Profile::Performance, ActivationReason::User)
            .await
            .is_err());

        let base = path(CPUFREQ_POLICY_DIR).join("policy0");
        assert_eq!(read_to_string(base.join(EPP_ATTR)).await.unwrap(), "power");
    }
}
