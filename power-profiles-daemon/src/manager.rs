/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{ensure, Context, Result};
use enumflags2::{bitflags, BitFlags};
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use zbus::fdo;
use zbus::Connection;

use crate::actions::{blocked_actions, Action, ActionContext, ACTION_REGISTRY};
use crate::bus::{BusKind, HoldEntry, ProfileEntry, SharedProperties};
use crate::config::{PersistedState, StateStore};
use crate::drivers::{
    blocked_drivers, Driver, DriverContext, DriverEvent, DriverEventKind, DriverEventSender,
    DriverKind, DRIVER_REGISTRY,
};
use crate::error::to_zbus_fdo_error;
use crate::profile::{
    has_single_flag, ActivationReason, PerformanceDegraded, ProbeResult, Profile,
};
use crate::Service;

/// The properties a state change may touch; used to tell the bus relay what
/// to re-emit.
#[bitflags]
#[repr(u8)]
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum ManagerProperty {
    ActiveProfile,
    Profiles,
    Actions,
    PerformanceDegraded,
    ActiveProfileHolds,
}

/// Client requests, forwarded by the bus interfaces.
#[derive(Debug)]
pub(crate) enum ManagerCommand {
    SetActiveProfile {
        profile: String,
        reply: oneshot::Sender<fdo::Result<()>>,
    },
    HoldProfile {
        profile: String,
        reason: String,
        application_id: String,
        requester: String,
        bus: BusKind,
        reply: oneshot::Sender<fdo::Result<u32>>,
    },
    ReleaseProfile {
        cookie: u32,
        reply: oneshot::Sender<fdo::Result<()>>,
    },
    /// A bus name lost its owner; any holds it had are released.
    NameVanished { name: String },
}

/// Outward effects of a state change, consumed by the bus relay.
#[derive(Debug, PartialEq)]
pub(crate) enum ManagerNotification {
    PropertiesChanged(BitFlags<ManagerProperty>),
    ProfileReleased { cookie: u32, bus: BusKind },
}

#[derive(Debug)]
struct ProfileHold {
    profile: Profile,
    reason: String,
    application_id: String,
    requester: String,
    bus: BusKind,
}

/// The profile manager: discovers drivers and actions, arbitrates between
/// user requests, firmware events, and client holds, and persists the last
/// selection. All state lives on this struct and is only touched from its
/// service loop.
pub(crate) struct ProfileManager {
    connection: Option<Connection>,
    store: StateStore,
    props: SharedProperties,

    cpu: Option<Box<dyn Driver>>,
    platform: Option<Box<dyn Driver>>,
    deferred: Vec<Box<dyn Driver>>,
    actions: Vec<Box<dyn Action>>,

    holds: HashMap<u32, ProfileHold>,
    next_cookie: u32,

    active: Profile,
    selected: Profile,

    commands: UnboundedReceiver<ManagerCommand>,
    driver_events: UnboundedReceiver<DriverEvent>,
    driver_events_tx: DriverEventSender,
    notify: UnboundedSender<ManagerNotification>,
}

impl ProfileManager {
    pub fn new(
        connection: Option<Connection>,
        props: SharedProperties,
        commands: UnboundedReceiver<ManagerCommand>,
        notify: UnboundedSender<ManagerNotification>,
    ) -> ProfileManager {
        let (driver_events_tx, driver_events) = unbounded_channel();
        ProfileManager {
            connection,
            store: StateStore::new(),
            props,
            cpu: None,
            platform: None,
            deferred: Vec::new(),
            actions: Vec::new(),
            holds: HashMap::new(),
            next_cookie: 1,
            active: Profile::Balanced,
            selected: Profile::Balanced,
            commands,
            driver_events,
            driver_events_tx,
            notify,
        }
    }

    /// Run discovery and bring the daemon to its initial state. An error
    /// here is fatal; the process exits with status 1.
    pub async fn start_up(&mut self) -> Result<()> {
        self.discover().await;
        self.finish_startup().await
    }

    async fn finish_startup(&mut self) -> Result<()> {
        self.verify_required_drivers()?;
        self.apply_configuration().await;
        if let Err(e) = self
            .activate_target_profile(self.active, ActivationReason::Reset)
            .await
        {
            warn!("Failed to activate initial profile: {e:#}");
        }
        self.publish(BitFlags::all()).await;
        Ok(())
    }

    async fn discover(&mut self) {
        let blocked = blocked_drivers();
        let ctx = DriverContext {
            events: self.driver_events_tx.clone(),
        };
        for ctor in DRIVER_REGISTRY {
            let mut driver = ctor(&ctx);
            let name = driver.name();
            debug!("Handling driver '{name}'");
            if blocked.iter().any(|blocked| blocked == name) {
                debug!("Driver '{name}' is blocked");
                continue;
            }
            if driver.profiles().is_empty() {
                warn!("Driver '{name}' implements no valid profiles");
                continue;
            }
            if self.slot(driver.kind()).is_some() {
                debug!("Driver '{name}' conflicts with an already probed driver");
                continue;
            }
            match driver.probe().await {
                ProbeResult::Success => {
                    debug!("Driver '{name}' probed successfully");
                    let kind = driver.kind();
                    *self.slot_mut(kind) = Some(driver);
                }
                ProbeResult::Defer => {
                    debug!("Driver '{name}' deferred, kernel support might appear");
                    self.deferred.push(driver);
                }
                ProbeResult::Fail => debug!("probe() failed for driver '{name}', skipping"),
            }
        }

        let blocked = blocked_actions();
        let ctx = ActionContext {
            connection: self.connection.clone(),
        };
        for ctor in ACTION_REGISTRY {
            let mut action = ctor(&ctx);
            let name = action.name();
            debug!("Handling action '{name}'");
            if blocked.iter().any(|blocked| blocked == name) {
                debug!("Action '{name}' is blocked");
                continue;
            }
            match action.probe().await {
                Ok(()) => self.actions.push(action),
                Err(e) => debug!("probe() failed for action '{name}': {e:#}"),
            }
        }
    }

    fn slot(&self, kind: DriverKind) -> &Option<Box<dyn Driver>> {
        match kind {
            DriverKind::Cpu => &self.cpu,
            DriverKind::Platform => &self.platform,
        }
    }

    fn slot_mut(&mut self, kind: DriverKind) -> &mut Option<Box<dyn Driver>> {
        match kind {
            DriverKind::Cpu => &mut self.cpu,
            DriverKind::Platform => &mut self.platform,
        }
    }

    fn verify_required_drivers(&self) -> Result<()> {
        ensure!(
            self.cpu.is_some() || self.platform.is_some(),
            "No usable profile drivers found"
        );
        let available = self.available_profiles();
        ensure!(
            available.contains(Profile::Balanced) && available.contains(Profile::PowerSaver),
            "Balanced and power-saver profiles must always be available"
        );
        Ok(())
    }

    fn available_profiles(&self) -> BitFlags<Profile> {
        self.cpu.as_ref().map(|d| d.profiles()).unwrap_or_default()
            | self
                .platform
                .as_ref()
                .map(|d| d.profiles())
                .unwrap_or_default()
    }

    /// Restore the persisted profile, unless the machine stopped matching.
    async fn apply_configuration(&mut self) {
        let state = match self.store.load().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to load persisted state: {e:#}");
                return;
            }
        };
        let names_match = state.cpu_driver.as_deref() == self.cpu.as_ref().map(|d| d.name())
            && state.platform_driver.as_deref() == self.platform.as_ref().map(|d| d.name());
        if !names_match {
            debug!("Persisted driver names don't match, ignoring stored profile");
            return;
        }
        match state.profile.as_deref().map(Profile::from_str) {
            Some(Ok(profile)) if self.available_profiles().contains(profile) => {
                debug!("Restoring persisted profile '{profile}'");
                self.active = profile;
                self.selected = profile;
            }
            Some(Ok(profile)) => {
                debug!("Persisted profile '{profile}' is not available anymore");
            }
            Some(Err(_)) => {
                warn!("Clearing invalid persisted profile");
                if let Err(e) = self.store.clear_profile().await {
                    warn!("Failed to clear persisted profile: {e:#}");
                }
            }
            None => (),
        }
    }

    /// Apply a profile: CPU driver first, then platform, then the actions.
    /// A platform failure reverts the CPU driver to the previous profile and
    /// reports the original error; action failures never abort.
    async fn activate_target_profile(
        &mut self,
        target: Profile,
        reason: ActivationReason,
    ) -> Result<()> {
        debug_assert!(has_single_flag(target.into()));
        debug!(
            "Setting active profile '{target}' (current: '{}', reason: {reason})",
            self.active
        );
        let previous = self.active;
        if let Some(cpu) = &mut self.cpu {
            if cpu.profiles().contains(target) {
                cpu.activate(target, reason)
                    .await
                    .with_context(|| format!("Failed to activate CPU driver '{}'", cpu.name()))?;
            }
        }
        if let Some(platform) = &mut self.platform {
            if platform.profiles().contains(target) {
                if let Err(e) = platform.activate(target, reason).await.with_context(|| {
                    format!("Failed to activate platform driver '{}'", platform.name())
                }) {
                    if let Some(cpu) = &mut self.cpu {
                        if cpu.profiles().contains(previous) {
                            if let Err(revert) =
                                cpu.activate(previous, ActivationReason::Internal).await
                            {
                                warn!("Failed to revert CPU driver to '{previous}': {revert:#}");
                            }
                        }
                    }
                    return Err(e);
                }
            }
        }
        for action in &mut self.actions {
            if let Err(e) = action.apply(target).await {
                warn!("Failed to apply action '{}': {e:#}", action.name());
            }
        }
        self.active = target;
        if reason.persists() {
            self.persist().await;
        }
        Ok(())
    }

    async fn persist(&self) {
        let state = PersistedState {
            cpu_driver: self.cpu.as_ref().map(|d| d.name().to_string()),
            platform_driver: self.platform.as_ref().map(|d| d.name().to_string()),
            profile: Some(self.active.to_string()),
        };
        if let Err(e) = self.store.save(&state).await {
            warn!("Failed to persist state: {e:#}");
        }
    }

    async fn set_active_profile(&mut self, profile: &str) -> fdo::Result<()> {
        let target = Profile::from_str(profile)
            .map_err(|_| fdo::Error::InvalidArgs(format!("Invalid profile name '{profile}'")))?;
        if !self.available_profiles().contains(target) {
            return Err(fdo::Error::InvalidArgs(format!(
                "Profile '{profile}' is not available"
            )));
        }
        if target == self.active {
            return Ok(());
        }

        let mut mask: BitFlags<ManagerProperty> = ManagerProperty::ActiveProfile.into();
        let released_holds = !self.holds.is_empty();
        if released_holds {
            // The user's choice wins over every outstanding hold
            self.release_all_holds();
            mask |= ManagerProperty::ActiveProfileHolds;
        }
        if let Err(e) = self
            .activate_target_profile(target, ActivationReason::User)
            .await
        {
            if released_holds {
                // The holds are gone either way; keep clients in sync
                self.publish(ManagerProperty::ActiveProfileHolds.into()).await;
            }
            return Err(to_zbus_fdo_error(format!("{e:#}")));
        }
        self.selected = target;
        self.publish(mask).await;
        Ok(())
    }

    fn release_all_holds(&mut self) {
        for (cookie, hold) in self.holds.drain() {
            debug!(
                "Releasing hold {cookie} for '{}' held by {}",
                hold.profile, hold.requester
            );
            let _ = self.notify.send(ManagerNotification::ProfileReleased {
                cookie,
                bus: hold.bus,
            });
        }
    }

    /// Holds asking for power-saver beat holds asking for performance, so
    /// opposed holds err toward saving power.
    fn effective_hold_profile(&self) -> Option<Profile> {
        if self.holds.is_empty() {
            None
        } else if self
            .holds
            .values()
            .any(|hold| hold.profile == Profile::PowerSaver)
        {
            Some(Profile::PowerSaver)
        } else {
            Some(Profile::Performance)
        }
    }

    async fn hold_profile(
        &mut self,
        profile: &str,
        reason: &str,
        application_id: &str,
        requester: String,
        bus: BusKind,
    ) -> fdo::Result<u32> {
        let target = Profile::from_str(profile)
            .map_err(|_| fdo::Error::InvalidArgs(format!("Invalid profile name '{profile}'")))?;
        if target == Profile::Balanced {
            return Err(fdo::Error::InvalidArgs(String::from(
                "Only the performance and power-saver profiles can be held",
            )));
        }
        if !self.available_profiles().contains(target) {
            return Err(fdo::Error::InvalidArgs(format!(
                "Profile '{profile}' is not available"
            )));
        }

        let cookie = self.next_cookie;
        self.next_cookie += 1;
        info!("Adding hold {cookie} for '{profile}' from {application_id} ({requester})");
        self.holds.insert(
            cookie,
            ProfileHold {
                profile: target,
                reason: reason.to_string(),
                application_id: application_id.to_string(),
                requester,
                bus,
            },
        );

        let mut mask: BitFlags<ManagerProperty> = ManagerProperty::ActiveProfileHolds.into();
        let effective = self.effective_hold_profile().unwrap_or(target);
        if effective != self.active {
            if let Err(e) = self
                .activate_target_profile(effective, ActivationReason::ProgramHold)
                .await
            {
                self.holds.remove(&cookie);
                return Err(to_zbus_fdo_error(format!("{e:#}")));
            }
            mask |= ManagerProperty::ActiveProfile;
        }
        self.publish(mask).await;
        Ok(cookie)
    }

    async fn release_profile(&mut self, cookie: u32) -> fdo::Result<()> {
        let Some(hold) = self.holds.remove(&cookie) else {
            return Err(fdo::Error::InvalidArgs(format!(
                "No hold with cookie {cookie}"
            )));
        };
        info!("Releasing hold {cookie} for '{}'", hold.profile);
        let _ = self.notify.send(ManagerNotification::ProfileReleased {
            cookie,
            bus: hold.bus,
        });

        let mut mask: BitFlags<ManagerProperty> = ManagerProperty::ActiveProfileHolds.into();
        if self.holds.is_empty() {
            if hold.profile != self.selected {
                match self
                    .activate_target_profile(self.selected, ActivationReason::ProgramHold)
                    .await
                {
                    Ok(()) => mask |= ManagerProperty::ActiveProfile,
                    Err(e) => warn!("Failed to restore selected profile: {e:#}"),
                }
            }
        } else if hold.profile == self.active {
            if let Some(effective) = self.effective_hold_profile() {
                if effective != self.active {
                    match self
                        .activate_target_profile(effective, ActivationReason::ProgramHold)
                        .await
                    {
                        Ok(()) => mask |= ManagerProperty::ActiveProfile,
                        Err(e) => warn!("Failed to apply remaining holds: {e:#}"),
                    }
                }
            }
        }
        self.publish(mask).await;
        Ok(())
    }

    async fn name_vanished(&mut self, name: &str) {
        let cookies: Vec<u32> = self
            .holds
            .iter()
            .filter(|(_, hold)| hold.requester == name)
            .map(|(cookie, _)| *cookie)
            .collect();
        for cookie in cookies {
            debug!("Requester {name} vanished, releasing hold {cookie}");
            if let Err(e) = self.release_profile(cookie).await {
                warn!("Failed to release hold {cookie}: {e}");
            }
        }
    }

    async fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::SetActiveProfile { profile, reply } => {
                let _ = reply.send(self.set_active_profile(&profile).await);
            }
            ManagerCommand::HoldProfile {
                profile,
                reason,
                application_id,
                requester,
                bus,
                reply,
            } => {
                let _ = reply.send(
                    self.hold_profile(&profile, &reason, &application_id, requester, bus)
                        .await,
                );
            }
            ManagerCommand::ReleaseProfile { cookie, reply } => {
                let _ = reply.send(self.release_profile(cookie).await);
            }
            ManagerCommand::NameVanished { name } => self.name_vanished(&name).await,
        }
    }

    async fn handle_driver_event(&mut self, event: DriverEvent) {
        match event.kind {
            DriverEventKind::ProfileChanged(profile) => {
                // Coalesce bursts of external changes to the newest value;
                // other queued events are handled afterwards in order.
                let mut latest = profile;
                let mut backlog = Vec::new();
                while let Ok(next) = self.driver_events.try_recv() {
                    match next.kind {
                        DriverEventKind::ProfileChanged(profile) => latest = profile,
                        _ => backlog.push(next),
                    }
                }
                self.handle_profile_changed(latest).await;
                for event in backlog {
                    match event.kind {
                        DriverEventKind::ProbeRequest => self.restart_profile_drivers().await,
                        DriverEventKind::PerformanceDegradedChanged => {
                            self.handle_degraded_changed(event.driver).await;
                        }
                        DriverEventKind::ProfileChanged(_) => unreachable!(),
                    }
                }
            }
            DriverEventKind::ProbeRequest => self.restart_profile_drivers().await,
            DriverEventKind::PerformanceDegradedChanged => {
                self.handle_degraded_changed(event.driver).await;
            }
        }
    }

    async fn handle_profile_changed(&mut self, profile: Profile) {
        if profile == self.active {
            return;
        }
        info!("Active profile changed externally to '{profile}'");
        match self
            .activate_target_profile(profile, ActivationReason::Internal)
            .await
        {
            Ok(()) => {
                self.selected = profile;
                self.publish(ManagerProperty::ActiveProfile.into()).await;
            }
            Err(e) => warn!("Failed to apply externally selected profile: {e:#}"),
        }
    }

    async fn handle_degraded_changed(&mut self, driver_name: &str) {
        let performance_capable = [&self.cpu, &self.platform]
            .into_iter()
            .flatten()
            .filter(|driver| driver.name() == driver_name)
            .any(|driver| driver.profiles().contains(Profile::Performance));
        if !performance_capable {
            warn!(
                "Ignored performance degradation from non-performance driver '{driver_name}'"
            );
            return;
        }
        self.publish(ManagerProperty::PerformanceDegraded.into())
            .await;
    }

    /// Tear everything down and rediscover. Raised by deferred drivers when
    /// their kernel support appears.
    async fn restart_profile_drivers(&mut self) {
        info!("Restarting profile drivers");
        self.release_all_holds();
        // Reverse construction order: actions, then drivers
        self.actions.clear();
        self.deferred.clear();
        self.platform = None;
        self.cpu = None;

        self.discover().await;
        if let Err(e) = self.verify_required_drivers() {
            error!("Required drivers missing after restart: {e:#}");
        }
        self.active = Profile::Balanced;
        self.selected = Profile::Balanced;
        self.apply_configuration().await;
        if let Err(e) = self
            .activate_target_profile(self.active, ActivationReason::Reset)
            .await
        {
            warn!("Failed to activate profile after restart: {e:#}");
        }
        self.publish(BitFlags::all()).await;
    }

    fn degraded_string(&self) -> String {
        [&self.cpu, &self.platform]
            .into_iter()
            .flatten()
            .map(|driver| driver.performance_degraded())
            .filter(|degraded| *degraded != PerformanceDegraded::None)
            .map(|degraded| degraded.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    fn profile_entries(&self) -> Vec<ProfileEntry> {
        [Profile::PowerSaver, Profile::Balanced, Profile::Performance]
            .into_iter()
            .filter_map(|profile| {
                let cpu = self
                    .cpu
                    .as_ref()
                    .filter(|driver| driver.profiles().contains(profile))
                    .map(|driver| driver.name());
                let platform = self
                    .platform
                    .as_ref()
                    .filter(|driver| driver.profiles().contains(profile))
                    .map(|driver| driver.name());
                let driver = match (cpu, platform) {
                    (Some(_), Some(_)) => String::from("multiple"),
                    (Some(name), None) | (None, Some(name)) => name.to_string(),
                    (None, None) => return None,
                };
                Some(ProfileEntry {
                    profile: profile.to_string(),
                    cpu_driver: cpu.map(String::from),
                    platform_driver: platform.map(String::from),
                    driver,
                })
            })
            .collect()
    }

    async fn publish(&self, mask: BitFlags<ManagerProperty>) {
        {
            let mut props = self.props.write().await;
            props.active_profile = self.active.to_string();
            props.profiles = self.profile_entries();
            props.actions = self
                .actions
                .iter()
                .map(|action| action.name().to_string())
                .collect();
            props.performance_degraded = self.degraded_string();
            props.holds = self
                .holds
                .values()
                .map(|hold| HoldEntry {
                    profile: hold.profile.to_string(),
                    reason: hold.reason.clone(),
                    application_id: hold.application_id.clone(),
                })
                .collect();
        }
        let _ = self
            .notify
            .send(ManagerNotification::PropertiesChanged(mask));
    }
}

impl Service for ProfileManager {
    const NAME: &'static str = "profile-manager";

    async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                Some(cmd) = self.commands.recv() => self.handle_command(cmd).await,
                Some(event) = self.driver_events.recv() => self.handle_driver_event(event).await,
            }
        }
    }
}
