/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

//! Client proxies for the power profiles daemon, one per published
//! interface. The two interfaces carry identical members; the legacy one
//! predates the move under the UPower namespace.

use std::collections::HashMap;
use zbus::proxy;
use zbus::zvariant::OwnedValue;

mod current {
    use super::*;

    #[proxy(
        interface = "org.freedesktop.UPower.PowerProfiles",
        default_service = "org.freedesktop.UPower.PowerProfiles",
        default_path = "/org/freedesktop/UPower/PowerProfiles"
    )]
    pub trait PowerProfiles {
        fn hold_profile(&self, profile: &str, reason: &str, application_id: &str)
            -> zbus::Result<u32>;

        fn release_profile(&self, cookie: u32) -> zbus::Result<()>;

        #[zbus(signal)]
        fn profile_released(&self, cookie: u32) -> zbus::Result<()>;

        #[zbus(property)]
        fn active_profile(&self) -> zbus::Result<String>;

        #[zbus(property)]
        fn set_active_profile(&self, profile: &str) -> zbus::Result<()>;

        #[zbus(property)]
        fn profiles(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;

        #[zbus(property)]
        fn actions(&self) -> zbus::Result<Vec<String>>;

        #[zbus(property)]
        fn performance_degraded(&self) -> zbus::Result<String>;

        #[zbus(property)]
        fn performance_inhibited(&self) -> zbus::Result<String>;

        #[zbus(property)]
        fn active_profile_holds(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;

        #[zbus(property)]
        fn version(&self) -> zbus::Result<String>;
    }
}

mod legacy {
    use super::*;

    #[proxy(
        interface = "net.hadess.PowerProfiles",
        default_service = "net.hadess.PowerProfiles",
        default_path = "/net/hadess/PowerProfiles"
    )]
    pub trait LegacyPowerProfiles {
        fn hold_profile(&self, profile: &str, reason: &str, application_id: &str)
            -> zbus::Result<u32>;

        fn release_profile(&self, cookie: u32) -> zbus::Result<()>;

        #[zbus(signal)]
        fn profile_released(&self, cookie: u32) -> zbus::Result<()>;

        #[zbus(property)]
        fn active_profile(&self) -> zbus::Result<String>;

        #[zbus(property)]
        fn set_active_profile(&self, profile: &str) -> zbus::Result<()>;

        #[zbus(property)]
        fn profiles(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;

        #[zbus(property)]
        fn actions(&self) -> zbus::Result<Vec<String>>;

        #[zbus(property)]
        fn performance_degraded(&self) -> zbus::Result<String>;

        #[zbus(property)]
        fn performance_inhibited(&self) -> zbus::Result<String>;

        #[zbus(property)]
        fn active_profile_holds(&self) -> zbus::Result<Vec<HashMap<String, OwnedValue>>>;

        #[zbus(property)]
        fn version(&self) -> zbus::Result<String>;
    }
}

pub use current::PowerProfilesProxy;
pub use legacy::LegacyPowerProfilesProxy;
