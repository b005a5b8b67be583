/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::{path, sysfs};

/// A kernel device found by enumerating a subsystem. Thin wrapper over its
/// sysfs directory.
#[derive(Clone, Debug)]
pub(crate) struct SysDevice {
    base: PathBuf,
}

impl SysDevice {
    pub fn from_syspath<P: AsRef<Path>>(base: P) -> SysDevice {
        SysDevice {
            base: base.as_ref().to_path_buf(),
        }
    }

    pub fn sysname(&self) -> &str {
        self.base
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    pub fn attr_path(&self, attr: &str) -> PathBuf {
        self.base.join(attr)
    }

    pub async fn has_attr(&self, attr: &str) -> bool {
        fs::try_exists(self.attr_path(attr)).await.unwrap_or(false)
    }

    pub async fn attr(&self, attr: &str) -> Result<String> {
        sysfs::read_attr(self.attr_path(attr)).await
    }

    pub async fn write_attr(&self, attr: &str, value: &str) -> Result<()> {
        sysfs::write_attr(self.attr_path(attr), value).await
    }
}

/// Enumerate the devices of a subsystem, in no particular order. Class
/// devices live under `/sys/class`, bare bus devices under `/sys/bus`.
pub(crate) async fn enumerate_devices(subsystem: &str) -> Result<Vec<SysDevice>> {
    for base in [
        path(format!("/sys/class/{subsystem}")),
        path(format!("/sys/bus/{subsystem}/devices")),
    ] {
        if !fs::try_exists(&base).await.unwrap_or(false) {
            continue;
        }
        let mut devices = Vec::new();
        let mut entries = fs::read_dir(&base).await?;
        while let Some(entry) = entries.next_entry().await? {
            devices.push(SysDevice::from_syspath(entry.path()));
        }
        return Ok(devices);
    }
    Ok(Vec::new())
}

/// Find the first device in a subsystem satisfying the predicate. No
/// ordering is promised; callers must cope with any match being returned.
pub(crate) async fn find_device<F, Fut>(subsystem: &str, predicate: F) -> Result<Option<SysDevice>>
where
    F: Fn(&SysDevice) -> Fut,
    Fut: Future<Output = bool>,
{
    for device in enumerate_devices(subsystem).await? {
        if predicate(&device).await {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;
    use tokio::fs::{create_dir_all, write};

    async fn fake_power_supply(name: &str, scope: &str) {
        let base = path(format!("/sys/class/power_supply/{name}"));
        create_dir_all(&base).await.unwrap();
        write(base.join("scope"), format!("{scope}\n")).await.unwrap();
    }

    #[tokio::test]
    async fn enumerate_missing_subsystem() {
        let _h = testing::start();
        assert!(enumerate_devices("power_supply").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enumerate_class_devices() {
        let _h = testing::start();
        fake_power_supply("BAT0", "System").await;
        fake_power_supply("hid-mouse-battery", "Device").await;

        let mut names: Vec<String> = enumerate_devices("power_supply")
            .await
            .unwrap()
            .iter()
            .map(|dev| dev.sysname().to_string())
            .collect();
        names.sort();
        assert_eq!(names, &["BAT0", "hid-mouse-battery"]);
    }

    #[tokio::test]
    async fn enumerate_bus_devices() {
        let _h = testing::start();
        let base = path("/sys/bus/platform/devices/thinkpad_acpi");
        create_dir_all(&base).await.unwrap();
        write(base.join("dytc_lapmode"), "0\n").await.unwrap();

        let devices = enumerate_devices("platform").await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].sysname(), "thinkpad_acpi");
        assert!(devices[0].has_attr("dytc_lapmode").await);
        assert_eq!(devices[0].attr("dytc_lapmode").await.unwrap(), "0");
    }

    #[tokio::test]
    async fn find_by_attr() {
        let _h = testing::start();
        fake_power_supply("BAT0", "System").await;
        fake_power_supply("hid-mouse-battery", "Device").await;

        let device = find_device("power_supply", |dev| {
            let scope = dev.attr_path("scope");
            async move {
                matches!(sysfs::read_attr(scope).await.as_deref(), Ok("Device"))
            }
        })
        .await
        .unwrap()
        .expect("no device found");
        assert_eq!(device.sysname(), "hid-mouse-battery");
    }
}
