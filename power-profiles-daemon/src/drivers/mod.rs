/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use async_trait::async_trait;
use enumflags2::BitFlags;
use std::env;
use tokio::sync::mpsc::UnboundedSender;

use crate::profile::{ActivationReason, PerformanceDegraded, ProbeResult, Profile};

mod amd_pstate;
mod cpu;
mod fake;
mod intel_pstate;
mod placeholder;
mod platform_profile;
mod tlp;

pub(crate) use amd_pstate::AmdPstateDriver;
pub(crate) use fake::FakeDriver;
pub(crate) use intel_pstate::IntelPstateDriver;
pub(crate) use placeholder::PlaceholderDriver;
pub(crate) use platform_profile::PlatformProfileDriver;
pub(crate) use tlp::TlpDriver;

const DRIVER_BLOCK_ENV: &str = "POWER_PROFILE_DAEMON_DRIVER_BLOCK";

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum DriverKind {
    Cpu,
    Platform,
}

/// Out-of-band happenings a driver reports back to the manager. The C
/// implementation used GObject signals for these; here they travel over one
/// channel into the manager's event loop.
#[derive(Debug, PartialEq, Clone)]
pub(crate) struct DriverEvent {
    pub driver: &'static str,
    pub kind: DriverEventKind,
}

#[derive(Debug, PartialEq, Clone)]
pub(crate) enum DriverEventKind {
    /// The firmware or another tool changed the profile under us.
    ProfileChanged(Profile),
    /// A deferred driver thinks its kernel support appeared; re-run
    /// discovery.
    ProbeRequest,
    /// The performance degradation state changed.
    PerformanceDegradedChanged,
}

pub(crate) type DriverEventSender = UnboundedSender<DriverEvent>;

/// Something that realizes a profile by writing kernel or firmware controls.
/// At most one driver of each kind is selected at a time.
#[async_trait]
pub(crate) trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> DriverKind;

    /// The profiles this driver can realize. Must be a non-empty subset of
    /// the real profiles.
    fn profiles(&self) -> BitFlags<Profile>;

    /// Probe once at discovery. Must be quick and idempotent. A `Defer`
    /// result keeps the instance alive; it must arrange to raise a
    /// `ProbeRequest` event when support may have appeared.
    async fn probe(&mut self) -> ProbeResult;

    async fn activate(&mut self, profile: Profile, reason: ActivationReason) -> Result<()>;

    fn performance_degraded(&self) -> PerformanceDegraded {
        PerformanceDegraded::None
    }
}

pub(crate) struct DriverContext {
    pub events: DriverEventSender,
}

type DriverCtor = fn(&DriverContext) -> Box<dyn Driver>;

/// Every known driver, in probe order: hardware-specific drivers first,
/// auxiliary drivers next, the placeholder last so it only fills an
/// otherwise empty platform slot.
pub(crate) const DRIVER_REGISTRY: &[DriverCtor] = &[
    |ctx| Box::new(FakeDriver::new(ctx)),
    |ctx| Box::new(AmdPstateDriver::new(ctx)),
    |ctx| Box::new(IntelPstateDriver::new(ctx)),
    |ctx| Box::new(PlatformProfileDriver::new(ctx)),
    |ctx| Box::new(TlpDriver::new(ctx)),
    |_| Box::new(PlaceholderDriver::new()),
];

pub(crate) fn blocked_drivers() -> Vec<String> {
    parse_block_list(&env::var(DRIVER_BLOCK_ENV).unwrap_or_default())
}

pub(crate) fn parse_block_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}
