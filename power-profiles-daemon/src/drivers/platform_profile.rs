/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use enumflags2::BitFlags;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::drivers::{Driver, DriverContext, DriverEvent, DriverEventKind, DriverEventSender, DriverKind};
use crate::path;
use crate::profile::{ActivationReason, PerformanceDegraded, ProbeResult, Profile, PROFILE_ALL};
use crate::sysdev::{self, SysDevice};
use crate::sysfs::{self, AttrWatcher, WriteSuppressor};

const DRIVER_NAME: &str = "platform_profile";

const ACPI_DIR: &str = "/sys/firmware/acpi";
const PLATFORM_PROFILE_PATH: &str = "/sys/firmware/acpi/platform_profile";
const PLATFORM_PROFILE_CHOICES_PATH: &str = "/sys/firmware/acpi/platform_profile_choices";

const LAPMODE_ATTR: &str = "dytc_lapmode";
const LAPMODE_DEVICE: &str = "thinkpad_acpi";

// Firmware spellings of the low-power choice, in preference order
const LOW_POWER_CHOICES: &[&str] = &["low-power", "cool", "quiet"];

#[derive(Default)]
struct SharedState {
    current: Option<Profile>,
    degraded: PerformanceDegraded,
}

/// ACPI platform_profile driver. Maps the three profiles onto the choices
/// the firmware publishes, reflects out-of-band writes (hotkeys, other
/// tools) as profile-changed events, and reports Lenovo lap detection as a
/// degraded performance profile.
pub(crate) struct PlatformProfileDriver {
    events: DriverEventSender,
    shared: Arc<Mutex<SharedState>>,
    suppressor: Option<WriteSuppressor>,
    low_power_token: String,
    tasks: Vec<JoinHandle<()>>,
}

fn value_to_profile(value: &str) -> Option<Profile> {
    match value.chars().next() {
        Some('l') | Some('c') | Some('q') => Some(Profile::PowerSaver),
        Some('b') => Some(Profile::Balanced),
        Some('p') => Some(Profile::Performance),
        _ => {
            debug!("Unsupported platform_profile value '{value}'");
            None
        }
    }
}

impl PlatformProfileDriver {
    pub fn new(ctx: &DriverContext) -> PlatformProfileDriver {
        PlatformProfileDriver {
            events: ctx.events.clone(),
            shared: Arc::new(Mutex::new(SharedState::default())),
            suppressor: None,
            low_power_token: String::new(),
            tasks: Vec::new(),
        }
    }

    async fn probe_profile(&mut self) -> Result<ProbeResult> {
        let choices = match sysfs::read_attr(path(PLATFORM_PROFILE_CHOICES_PATH)).await {
            Ok(choices) => choices,
            Err(e) if sysfs::is_not_found(&e) => {
                debug!("No platform_profile support, waiting for kernel support to appear");
                self.watch_for_support();
                return Ok(ProbeResult::Defer);
            }
            Err(e) => return Err(e),
        };
        let choices: Vec<&str> = choices.split_whitespace().collect();
        let low_power = LOW_POWER_CHOICES
            .iter()
            .find(|token| choices.contains(*token));
        let (Some(low_power), true, true) = (
            low_power,
            choices.contains(&"balanced"),
            choices.contains(&"performance"),
        ) else {
            debug!("Unsupported platform_profile choices '{}'", choices.join(" "));
            self.watch_for_support();
            return Ok(ProbeResult::Defer);
        };
        self.low_power_token = low_power.to_string();

        let profile_path = path(PLATFORM_PROFILE_PATH);
        let watcher = AttrWatcher::new(&profile_path)?;
        self.suppressor = Some(watcher.suppressor());
        let current = match sysfs::read_attr(&profile_path).await {
            Ok(value) => value_to_profile(&value),
            Err(_) => None,
        };
        self.shared.lock().unwrap().current = current;
        self.watch_profile(watcher);

        if let Some(device) = self.find_lapmode_device().await {
            self.watch_lapmode(device).await;
        } else {
            debug!("Didn't find a {LAPMODE_ATTR} attribute on {LAPMODE_DEVICE}");
        }

        debug!("Found platform_profile support (low-power is '{}')", self.low_power_token);
        Ok(ProbeResult::Success)
    }

    /// Ask for a re-probe once the kernel module providing platform_profile
    /// shows up.
    fn watch_for_support(&mut self) {
        let mut watcher = match AttrWatcher::for_directory(path(ACPI_DIR)) {
            Ok(watcher) => watcher,
            Err(e) => {
                debug!("Not watching for platform_profile support: {e:#}");
                return;
            }
        };
        let events = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            while watcher.changed().await.is_some() {
                if !tokio::fs::try_exists(path(PLATFORM_PROFILE_CHOICES_PATH))
                    .await
                    .unwrap_or(false)
                {
                    continue;
                }
                debug!("platform_profile choices appeared, requesting re-probe");
                let _ = events.send(DriverEvent {
                    driver: DRIVER_NAME,
                    kind: DriverEventKind::ProbeRequest,
                });
                break;
            }
        }));
    }

    fn watch_profile(&mut self, mut watcher: AttrWatcher) {
        let shared = self.shared.clone();
        let events = self.events.clone();
        self.tasks.push(tokio::spawn(async move {
            while watcher.changed().await.is_some() {
                let value = match sysfs::read_attr(path(PLATFORM_PROFILE_PATH)).await {
                    Ok(value) => value,
                    Err(e) => {
                        debug!("Error reading platform_profile: {e:#}");
                        continue;
                    }
                };
                let Some(profile) = value_to_profile(&value) else {
                    continue;
                };
                {
                    let mut state = shared.lock().unwrap();
                    if state.current == Some(profile) {
                        continue;
                    }
                    state.current = Some(profile);
                }
                debug!("platform_profile is now '{value}'");
                let _ = events.send(DriverEvent {
                    driver: DRIVER_NAME,
                    kind: DriverEventKind::ProfileChanged(profile),
                });
            }
        }));
    }

    async fn find_lapmode_device(&self) -> Option<SysDevice> {
        sysdev::find_device("platform", |dev| {
            let matches = dev.sysname() == LAPMODE_DEVICE;
            let lapmode = dev.attr_path(LAPMODE_ATTR);
            async move { matches && tokio::fs::try_exists(lapmode).await.unwrap_or(false) }
        })
        .await
        .ok()
        .flatten()
    }

    async fn watch_lapmode(&mut self, device: SysDevice) {
        let attr = device.attr_path(LAPMODE_ATTR);
        let mut watcher = match AttrWatcher::new(&attr) {
            Ok(watcher) => watcher,
            Err(e) => {
                debug!("Not monitoring {LAPMODE_ATTR}: {e:#}");
                return;
            }
        };
        let shared = self.shared.clone();
        let events = self.events.clone();
        update_lapmode(&attr, &shared, &events).await;
        self.tasks.push(tokio::spawn(async move {
            while watcher.changed().await.is_some() {
                update_lapmode(&attr, &shared, &events).await;
            }
        }));
    }
}

async fn update_lapmode(
    attr: &Path,
    shared: &Arc<Mutex<SharedState>>,
    events: &DriverEventSender,
) {
    let degraded = match sysfs::read_attr(attr).await.as_deref() {
        Ok("1") => PerformanceDegraded::LapDetected,
        _ => PerformanceDegraded::None,
    };
    let changed = {
        let mut state = shared.lock().unwrap();
        let changed = state.degraded != degraded;
        state.degraded = degraded;
        changed
    };
    if changed {
        debug!("{LAPMODE_ATTR} changed, performance is now '{degraded}'");
        let _ = events.send(DriverEvent {
            driver: DRIVER_NAME,
            kind: DriverEventKind::PerformanceDegradedChanged,
        });
    }
}

#[async_trait]
impl Driver for PlatformProfileDriver {
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
        self.probe_profile().await.unwrap_or(ProbeResult::Fail)
    }

    async fn activate(&mut self, profile: Profile, reason: ActivationReason) -> Result<()> {
        if self.shared.lock().unwrap().current == Some(profile) {
            debug!("platform_profile already set to {profile}");
            return Ok(());
        }
        let suppressor = self
            .suppressor
            .as_ref()
            .ok_or(anyhow!("platform_profile driver not probed"))?;
        let token = match profile {
            Profile::PowerSaver => self.low_power_token.as_str(),
            Profile::Balanced => "balanced",
            Profile::Performance => "performance",
        };
        debug!("Activating {profile} on {DRIVER_NAME} ({reason})");
        {
            let _guard = suppressor.hold();
            sysfs::write_attr(path(PLATFORM_PROFILE_PATH), token).await?;
        }
        self.shared.lock().unwrap().current = Some(profile);
        Ok(())
    }

    fn performance_degraded(&self) -> PerformanceDegraded {
        self.shared.lock().unwrap().degraded
    }
}

impl Drop for PlatformProfileDriver {
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
    use std::time::Duration;
    use tokio::fs::{create_dir_all, read_to_string, write};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::time::timeout;

    const EVENT_WAIT: Duration = Duration::from_secs(3);
    const SILENCE_WAIT: Duration = Duration::from_millis(300);

    async fn fake_acpi(choices: &str, current: &str) {
        let dir = path(ACPI_DIR);
        create_dir_all(&dir).await.unwrap();
        write(path(PLATFORM_PROFILE_CHOICES_PATH), choices).await.unwrap();
        write(path(PLATFORM_PROFILE_PATH), current).await.unwrap();
    }

    fn driver() -> (PlatformProfileDriver, UnboundedReceiver<DriverEvent>) {
        let (tx, rx) = unbounded_channel();
        (PlatformProfileDriver::new(&DriverContext { events: tx }), rx)
    }

    #[tokio::test]
    async fn probe_defers_without_kernel_support() {
        let _h = testing::start();
        create_dir_all(path(ACPI_DIR)).await.unwrap();
        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Defer);
    }

    #[tokio::test]
    async fn probe_defers_on_incomplete_choices() {
        let _h = testing::start();
        fake_acpi("balanced performance\n", "balanced\n").await;
        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Defer);
    }

    #[tokio::test]
    async fn defer_raises_probe_request() {
        let _h = testing::start();
        create_dir_all(path(ACPI_DIR)).await.unwrap();
        let (mut driver, mut rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Defer);

        fake_acpi("low-power balanced performance\n", "balanced\n").await;
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("no probe request")
            .unwrap();
        assert_eq!(event.kind, DriverEventKind::ProbeRequest);
    }

    #[tokio::test]
    async fn probe_reads_current_profile() {
        let _h = testing::start();
        fake_acpi("low-power balanced performance\n", "performance\n").await;
        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);
        assert_eq!(driver.shared.lock().unwrap().current, Some(Profile::Performance));
    }

    #[tokio::test]
    async fn activate_writes_mapped_token() {
        let _h = testing::start();
        fake_acpi("quiet balanced performance\n", "balanced\n").await;
        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);

        driver
            .activate(Profile::PowerSaver, ActivationReason::User)
            .await
            .expect("activate");
        assert_eq!(
            read_to_string(path(PLATFORM_PROFILE_PATH)).await.unwrap(),
            "quiet"
        );

        driver
            .activate(Profile::Performance, ActivationReason::User)
            .await
            .expect("activate");
        assert_eq!(
            read_to_string(path(PLATFORM_PROFILE_PATH)).await.unwrap(),
            "performance"
        );
    }

    #[tokio::test]
    async fn activate_same_profile_is_noop() {
        let _h = testing::start();
        fake_acpi("low-power balanced performance\n", "balanced\n").await;
        let (mut driver, _rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);

        // Would fail if it wrote: make the file unwritable by removing it
        tokio::fs::remove_file(path(PLATFORM_PROFILE_PATH)).await.unwrap();
        driver
            .activate(Profile::Balanced, ActivationReason::User)
            .await
            .expect("activate");
    }

    #[tokio::test]
    async fn external_change_emits_event() {
        let _h = testing::start();
        fake_acpi("low-power balanced performance\n", "balanced\n").await;
        let (mut driver, mut rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);

        write(path(PLATFORM_PROFILE_PATH), "low-power\n").await.unwrap();
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("no change event")
            .unwrap();
        assert_eq!(
            event.kind,
            DriverEventKind::ProfileChanged(Profile::PowerSaver)
        );
    }

    #[tokio::test]
    async fn own_writes_are_suppressed() {
        let _h = testing::start();
        fake_acpi("low-power balanced performance\n", "balanced\n").await;
        let (mut driver, mut rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);

        driver
            .activate(Profile::Performance, ActivationReason::User)
            .await
            .expect("activate");
        tokio::time::sleep(SILENCE_WAIT).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lapmode_degrades_performance() {
        let _h = testing::start();
        fake_acpi("low-power balanced performance\n", "balanced\n").await;
        let lapmode = path("/sys/bus/platform/devices/thinkpad_acpi").join(LAPMODE_ATTR);
        create_dir_all(lapmode.parent().unwrap()).await.unwrap();
        write(&lapmode, "1\n").await.unwrap();

        let (mut driver, mut rx) = driver();
        assert_eq!(driver.probe().await, ProbeResult::Success);
        assert_eq!(driver.performance_degraded(), PerformanceDegraded::LapDetected);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, DriverEventKind::PerformanceDegradedChanged);

        write(&lapmode, "0\n").await.unwrap();
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("no degraded event")
            .unwrap();
        assert_eq!(event.kind, DriverEventKind::PerformanceDegradedChanged);
        assert_eq!(driver.performance_degraded(), PerformanceDegraded::None);
    }
}
