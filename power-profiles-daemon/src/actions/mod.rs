/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use async_trait::async_trait;
use std::env;
use zbus::Connection;

use crate::drivers::parse_block_list;
use crate::profile::Profile;

mod amdgpu_panel_power;
mod trickle_charge;

pub(crate) use amdgpu_panel_power::AmdgpuPanelPowerAction;
pub(crate) use trickle_charge::TrickleChargeAction;

const ACTION_BLOCK_ENV: &str = "POWER_PROFILE_DAEMON_ACTION_BLOCK";

/// A best-effort side effect applied on every profile transition. Failures
/// are logged and never abort the transition.
#[async_trait]
pub(crate) trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    /// Probe once at discovery; either the action works on this host or it
    /// is released.
    async fn probe(&mut self) -> Result<()>;

    async fn apply(&mut self, profile: Profile) -> Result<()>;
}

pub(crate) struct ActionContext {
    /// Absent in unit tests, where no system bus is around.
    pub connection: Option<Connection>,
}

type ActionCtor = fn(&ActionContext) -> Box<dyn Action>;

/// Every known action, applied in this order on each transition.
pub(crate) const ACTION_REGISTRY: &[ActionCtor] = &[
    |_| Box::new(TrickleChargeAction::new()),
    |ctx| Box::new(AmdgpuPanelPowerAction::new(ctx)),
];

pub(crate) fn blocked_actions() -> Vec<String> {
    parse_block_list(&env::var(ACTION_BLOCK_ENV).unwrap_or_default())
}
