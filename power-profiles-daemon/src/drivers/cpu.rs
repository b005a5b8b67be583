/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{Context, Result};

use crate::{path, sysfs};

pub(super) const CPUFREQ_POLICY_DIR: &str = "/sys/devices/system/cpu/cpufreq";
pub(super) const CPU_POLICY_PREFIX: &str = "policy";
pub(super) const EPP_ATTR: &str = "energy_performance_preference";
pub(super) const GOVERNOR_ATTR: &str = "scaling_governor";

const ACPI_PM_PROFILE_PATH: &str = "/sys/firmware/acpi/pm_profile";

// ACPI FADT preferred PM profiles that identify server-class machines,
// where scaling preferences must be left alone (plus "unspecified").
const SERVER_PM_PROFILES: &[u64] = &[0, 4, 5, 7];

pub(super) async fn acpi_pm_profile_is_server() -> Result<bool> {
    let profile = sysfs::read_attr(path(ACPI_PM_PROFILE_PATH)).await?;
    let profile: u64 = profile
        .trim()
        .parse()
        .with_context(|| format!("Error parsing pm_profile value '{profile}'"))?;
    Ok(SERVER_PM_PROFILES.contains(&profile))
}
