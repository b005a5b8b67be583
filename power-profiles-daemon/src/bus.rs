/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, RwLock};
use tokio_stream::StreamExt;
use zbus::fdo::{self, DBusProxy, RequestNameFlags, RequestNameReply};
use zbus::message::Header;
use zbus::names::BusName;
use zbus::object_server::{InterfaceRef, SignalEmitter};
use zbus::zvariant::{OwnedValue, SerializeDict, Type, Value};
use zbus::{interface, Connection};

use crate::error::to_zbus_fdo_error;
use crate::manager::{ManagerCommand, ManagerNotification, ManagerProperty};
use crate::polkit::{PolicyGate, ACTION_HOLD_PROFILE, ACTION_SWITCH_PROFILE};
use crate::{Service, BUS_NAME, BUS_PATH, LEGACY_BUS_NAME, LEGACY_BUS_PATH, VERSION};
use tracing::{info, warn};

/// Which of the two published interfaces a request came in on. Holds
/// remember it so `ProfileReleased` goes back out the same way.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum BusKind {
    Current,
    Legacy,
}

/// One row of the `Profiles` property. `driver` is the compatibility alias:
/// `"multiple"` when both kinds advertise the profile, otherwise the sole
/// advertiser's name.
#[derive(Clone, Debug, Default, PartialEq, SerializeDict, Type, Value, OwnedValue)]
#[zvariant(signature = "dict", rename_all = "PascalCase")]
pub(crate) struct ProfileEntry {
    pub profile: String,
    pub cpu_driver: Option<String>,
    pub platform_driver: Option<String>,
    pub driver: String,
}

/// One row of the `ActiveProfileHolds` property.
#[derive(Clone, Debug, Default, PartialEq, SerializeDict, Type, Value, OwnedValue)]
#[zvariant(signature = "dict", rename_all = "PascalCase")]
pub(crate) struct HoldEntry {
    pub profile: String,
    pub reason: String,
    pub application_id: String,
}

/// The property values currently visible to clients. Written only by the
/// manager loop; the interfaces read it on every getter call.
#[derive(Clone, Debug, Default)]
pub(crate) struct PropertySnapshot {
    pub active_profile: String,
    pub profiles: Vec<ProfileEntry>,
    pub actions: Vec<String>,
    pub performance_degraded: String,
    pub holds: Vec<HoldEntry>,
}

pub(crate) type SharedProperties = Arc<RwLock<PropertySnapshot>>;

/// Everything an interface needs to answer calls: the property snapshot,
/// the manager's command channel, and the polkit gate.
#[derive(Clone)]
pub(crate) struct InterfaceContext {
    props: SharedProperties,
    channel: UnboundedSender<ManagerCommand>,
    gate: Arc<PolicyGate>,
}

impl InterfaceContext {
    pub fn new(
        props: SharedProperties,
        channel: UnboundedSender<ManagerCommand>,
        gate: Arc<PolicyGate>,
    ) -> InterfaceContext {
        InterfaceContext {
            props,
            channel,
            gate,
        }
    }

    async fn set_active_profile(&self, profile: String, header: Header<'_>) -> fdo::Result<()> {
        self.gate.check(&header, ACTION_SWITCH_PROFILE).await?;
        let (reply, rx) = oneshot::channel();
        self.channel
            .send(ManagerCommand::SetActiveProfile { profile, reply })
            .map_err(to_zbus_fdo_error)?;
        rx.await.map_err(to_zbus_fdo_error)?
    }

    async fn hold_profile(
        &self,
        profile: &str,
        reason: &str,
        application_id: &str,
        header: Header<'_>,
        bus: BusKind,
    ) -> fdo::Result<u32> {
        self.gate.check(&header, ACTION_HOLD_PROFILE).await?;
        let requester = header
            .sender()
            .ok_or_else(|| fdo::Error::Failed(String::from("Request has no sender")))?
            .to_string();
        let (reply, rx) = oneshot::channel();
        self.channel
            .send(ManagerCommand::HoldProfile {
                profile: profile.to_string(),
                reason: reason.to_string(),
                application_id: application_id.to_string(),
                requester,
                bus,
                reply,
            })
            .map_err(to_zbus_fdo_error)?;
        rx.await.map_err(to_zbus_fdo_error)?
    }

    async fn release_profile(&self, cookie: u32) -> fdo::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.channel
            .send(ManagerCommand::ReleaseProfile { cookie, reply })
            .map_err(to_zbus_fdo_error)?;
        rx.await.map_err(to_zbus_fdo_error)?
    }
}

/// The vtable served on both name/path pairs. One expansion per pair since
/// the interface name has to be known at compile time.
macro_rules! power_profiles_interface {
    ($type:ident, $iface:literal, $bus:expr) => {
        pub(crate) struct $type {
            ctx: InterfaceContext,
        }

        impl $type {
            pub(crate) fn new(ctx: InterfaceContext) -> $type {
                $type { ctx }
            }
        }

        #[interface(name = $iface)]
        impl $type {
            #[zbus(property(emits_changed_signal = "const"))]
            async fn version(&self) -> String {
                VERSION.to_string()
            }

            /// Pre-hold compatibility property; frozen at the empty string.
            #[zbus(property(emits_changed_signal = "const"))]
            async fn performance_inhibited(&self) -> String {
                String::new()
            }

            #[zbus(property)]
            async fn active_profile(&self) -> String {
                self.ctx.props.read().await.active_profile.clone()
            }

            #[zbus(property)]
            async fn set_active_profile(
                &self,
                profile: String,
                #[zbus(header)] header: Option<Header<'_>>,
            ) -> zbus::Result<()> {
                self.ctx
                    .set_active_profile(profile, header.expect("property setter always has a header"))
                    .await
                    .map_err(|e| zbus::Error::FDO(Box::new(e)))
            }

            #[zbus(property)]
            async fn profiles(&self) -> Vec<ProfileEntry> {
                self.ctx.props.read().await.profiles.clone()
            }

            #[zbus(property)]
            async fn actions(&self) -> Vec<String> {
                self.ctx.props.read().await.actions.clone()
            }

            #[zbus(property)]
            async fn performance_degraded(&self) -> String {
                self.ctx.props.read().await.performance_degraded.clone()
            }

            #[zbus(property)]
            async fn active_profile_holds(&self) -> Vec<HoldEntry> {
                self.ctx.props.read().await.holds.clone()
            }

            async fn hold_profile(
                &self,
                profile: &str,
                reason: &str,
                application_id: &str,
                #[zbus(header)] header: Header<'_>,
            ) -> fdo::Result<u32> {
                self.ctx
                    .hold_profile(profile, reason, application_id, header, $bus)
                    .await
            }

            async fn release_profile(&self, cookie: u32) -> fdo::Result<()> {
                self.ctx.release_profile(cookie).await
            }

            #[zbus(signal)]
            async fn profile_released(
                emitter: &SignalEmitter<'_>,
                cookie: u32,
            ) -> zbus::Result<()>;
        }
    };
}

power_profiles_interface!(PowerProfiles, "org.freedesktop.UPower.PowerProfiles", BusKind::Current);
power_profiles_interface!(PowerProfilesLegacy, "net.hadess.PowerProfiles", BusKind::Legacy);

macro_rules! emit_properties_changed {
    ($iface_ref:expr, $mask:expr) => {{
        let iface = $iface_ref.get().await;
        let emitter = $iface_ref.signal_emitter();
        if $mask.contains(ManagerProperty::ActiveProfile) {
            iface.active_profile_changed(emitter).await?;
        }
        if $mask.contains(ManagerProperty::Profiles) {
            iface.profiles_changed(emitter).await?;
        }
        if $mask.contains(ManagerProperty::Actions) {
            iface.actions_changed(emitter).await?;
        }
        if $mask.contains(ManagerProperty::PerformanceDegraded) {
            iface.performance_degraded_changed(emitter).await?;
        }
        if $mask.contains(ManagerProperty::ActiveProfileHolds) {
            iface.active_profile_holds_changed(emitter).await?;
        }
    }};
}

/// Register the vtable on both object paths.
pub(crate) async fn export_interfaces(
    connection: &Connection,
    ctx: InterfaceContext,
) -> Result<()> {
    let object_server = connection.object_server();
    object_server
        .at(BUS_PATH, PowerProfiles::new(ctx.clone()))
        .await?;
    object_server
        .at(LEGACY_BUS_PATH, PowerProfilesLegacy::new(ctx))
        .await?;
    Ok(())
}

/// Claim both well-known names. Failing to own a name while another
/// instance holds it is a startup failure unless replacement was requested.
pub(crate) async fn acquire_names(connection: &Connection, replace: bool) -> Result<()> {
    let mut flags = RequestNameFlags::AllowReplacement | RequestNameFlags::DoNotQueue;
    if replace {
        flags |= RequestNameFlags::ReplaceExisting;
    }
    for name in [BUS_NAME, LEGACY_BUS_NAME] {
        match connection.request_name_with_flags(name, flags).await? {
            RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner => (),
            reply => bail!("Could not acquire bus name {name}: {reply:?}"),
        }
    }
    Ok(())
}

/// Fans manager notifications out to the bus and feeds bus-side events
/// (vanished hold owners, name loss) back into the manager.
pub(crate) struct BusRelayService {
    connection: Connection,
    notifications: UnboundedReceiver<ManagerNotification>,
    commands: UnboundedSender<ManagerCommand>,
}

impl BusRelayService {
    pub fn new(
        connection: Connection,
        notifications: UnboundedReceiver<ManagerNotification>,
        commands: UnboundedSender<ManagerCommand>,
    ) -> BusRelayService {
        BusRelayService {
            connection,
            notifications,
            commands,
        }
    }

    async fn dispatch(
        &self,
        current: &InterfaceRef<PowerProfiles>,
        legacy: &InterfaceRef<PowerProfilesLegacy>,
        notification: ManagerNotification,
    ) -> zbus::Result<()> {
        match notification {
            ManagerNotification::PropertiesChanged(mask) => {
                emit_properties_changed!(current, mask);
                emit_properties_changed!(legacy, mask);
            }
            ManagerNotification::ProfileReleased { cookie, bus } => match bus {
                BusKind::Current => {
                    PowerProfiles::profile_released(current.signal_emitter(), cookie).await?;
                }
                BusKind::Legacy => {
                    PowerProfilesLegacy::profile_released(legacy.signal_emitter(), cookie).await?;
                }
            },
        }
        Ok(())
    }
}

impl Service for BusRelayService {
    const NAME: &'static str = "bus-relay";

    async fn run(&mut self) -> Result<()> {
        let object_server = self.connection.object_server();
        let current = object_server
            .interface::<_, PowerProfiles>(BUS_PATH)
            .await?;
        let legacy = object_server
            .interface::<_, PowerProfilesLegacy>(LEGACY_BUS_PATH)
            .await?;
        let dbus = DBusProxy::new(&self.connection).await?;
        let mut owner_changed = dbus.receive_name_owner_changed().await?;
        let mut name_lost = dbus.receive_name_lost().await?;

        loop {
            tokio::select! {
                Some(notification) = self.notifications.recv() => {
                    if let Err(e) = self.dispatch(&current, &legacy, notification).await {
                        warn!("Error emitting signal: {e}");
                    }
                }
                Some(signal) = owner_changed.next() => {
                    let Ok(args) = signal.args() else {
                        continue;
                    };
                    if args.old_owner().is_none() || args.new_owner().is_some() {
                        continue;
                    }
                    if let BusName::Unique(name) = args.name() {
                        let _ = self.commands.send(ManagerCommand::NameVanished {
                            name: name.to_string(),
                        });
                    }
                }
                Some(signal) = name_lost.next() => {
                    let Ok(args) = signal.args() else {
                        continue;
                    };
                    let name = args.name().to_string();
                    if name == BUS_NAME {
                        info!("Lost the {BUS_NAME} bus name, shutting down");
                        return Ok(());
                    }
                    warn!("Lost bus name {name}");
                }
            }
        }
    }
}
