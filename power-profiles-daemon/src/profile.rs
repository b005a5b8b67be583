/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use enumflags2::{bitflags, BitFlags};
use strum::{Display, EnumString};

/// The profiles a user can select. Encoded on the wire as the kebab-case
/// nick; parsing any other string is an error and every public entry point
/// rejects it as invalid arguments.
#[bitflags]
#[repr(u8)]
#[derive(Display, EnumString, PartialEq, Eq, Debug, Copy, Clone, Hash)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum Profile {
    PowerSaver = 1 << 0,
    Balanced = 1 << 1,
    Performance = 1 << 2,
}

pub(crate) const PROFILE_ALL: BitFlags<Profile> = BitFlags::ALL;

/// True iff the mask names exactly one profile. Capability declarations are
/// masks; everything that crosses a contract boundary must be a single flag.
pub(crate) fn has_single_flag(profiles: BitFlags<Profile>) -> bool {
    profiles.exactly_one().is_some()
}

/// Why a profile is being activated. Drivers may use this to skip no-op
/// writes or pick more aggressive side effects for user-originated
/// transitions; the manager uses it to decide whether to persist.
#[derive(Display, PartialEq, Eq, Debug, Copy, Clone)]
#[strum(serialize_all = "kebab-case")]
pub(crate) enum ActivationReason {
    /// The driver profile changed internally, usually a firmware hotkey.
    Internal,
    /// Startup, or drivers getting reprobed.
    Reset,
    /// The user asked for it.
    User,
    /// The preference was lost during suspend.
    #[allow(unused)]
    Resume,
    /// A program placed or released a hold.
    ProgramHold,
}

impl ActivationReason {
    /// Only transitions the user chose or the firmware imposed outlive a
    /// restart.
    pub fn persists(self) -> bool {
        matches!(self, ActivationReason::User | ActivationReason::Internal)
    }
}

#[derive(PartialEq, Eq, Debug, Copy, Clone)]
pub(crate) enum ProbeResult {
    /// The driver loaded and can be installed.
    Success,
    /// Kernel support might appear later; keep the driver alive and re-run
    /// discovery when it raises a probe request.
    Defer,
    /// The driver cannot work on this host.
    Fail,
}

#[derive(Display, PartialEq, Eq, Debug, Copy, Clone, Default)]
pub(crate) enum PerformanceDegraded {
    #[default]
    #[strum(serialize = "")]
    None,
    #[strum(serialize = "lap-detected")]
    LapDetected,
    #[strum(serialize = "high-operating-temperature")]
    HighOperatingTemperature,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::enum_roundtrip;
    use std::str::FromStr;

    #[test]
    fn profile_roundtrip() {
        enum_roundtrip!(Profile {
            "power-saver": str = PowerSaver,
            "balanced": str = Balanced,
            "performance": str = Performance,
        });
        assert!(Profile::from_str("Balanced").is_err());
        assert!(Profile::from_str("turbo").is_err());
        assert!(Profile::from_str("").is_err());
    }

    #[test]
    fn single_flag() {
        assert!(has_single_flag(Profile::Balanced.into()));
        assert!(has_single_flag(Profile::Performance.into()));
        assert!(!has_single_flag(BitFlags::empty()));
        assert!(!has_single_flag(Profile::Balanced | Profile::PowerSaver));
        assert!(!has_single_flag(PROFILE_ALL));
    }

    #[test]
    fn persisting_reasons() {
        assert!(ActivationReason::User.persists());
        assert!(ActivationReason::Internal.persists());
        assert!(!ActivationReason::Reset.persists());
        assert!(!ActivationReason::Resume.persists());
        assert!(!ActivationReason::ProgramHold.persists());
    }

    #[test]
    fn degraded_tokens() {
        assert_eq!(PerformanceDegraded::None.to_string(), "");
        assert_eq!(PerformanceDegraded::LapDetected.to_string(), "lap-detected");
        assert_eq!(
            PerformanceDegraded::HighOperatingTemperature.to_string(),
            "high-operating-temperature"
        );
    }
}
