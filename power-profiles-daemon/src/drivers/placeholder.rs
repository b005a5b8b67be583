/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use async_trait::async_trait;
use enumflags2::BitFlags;
use tracing::debug;

use crate::drivers::{Driver, DriverKind};
use crate::profile::{ActivationReason, ProbeResult, Profile};

/// Installed when no real platform driver loads, so the two non-performance
/// profiles are always selectable.
pub(crate) struct PlaceholderDriver {}

impl PlaceholderDriver {
    pub fn new() -> PlaceholderDriver {
        PlaceholderDriver {}
    }
}

#[async_trait]
impl Driver for PlaceholderDriver {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Platform
    }

    fn profiles(&self) -> BitFlags<Profile> {
        Profile::PowerSaver | Profile::Balanced
    }

    async fn probe(&mut self) -> ProbeResult {
        ProbeResult::Success
    }

    async fn activate(&mut self, profile: Profile, reason: ActivationReason) -> Result<()> {
        debug!("Activating {profile} on placeholder ({reason})");
        Ok(())
    }
}
