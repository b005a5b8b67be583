/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{Context, Result};
use ini::Ini;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs;
use tracing::debug;

use crate::path;

const STATE_FILE: &str = "/var/lib/power-profiles-daemon/state.ini";
const STATE_SECTION: &str = "State";
const CPU_DRIVER_KEY: &str = "CpuDriver";
const PLATFORM_DRIVER_KEY: &str = "PlatformDriver";
const PROFILE_KEY: &str = "Profile";

/// The last selection written to disk. Driver names are recorded so a stored
/// profile is discarded when the hardware stops matching.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct PersistedState {
    pub cpu_driver: Option<String>,
    pub platform_driver: Option<String>,
    pub profile: Option<String>,
}

/// The on-disk keyfile. Keys outside our own are preserved across saves;
/// sections other than `State` are ignored but kept.
pub(crate) struct StateStore {
    state_path: PathBuf,
}

impl StateStore {
    pub fn new() -> StateStore {
        StateStore {
            state_path: path(STATE_FILE),
        }
    }

    pub async fn load(&self) -> Result<PersistedState> {
        let contents = match fs::read_to_string(&self.state_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}", self.state_path.display());
                return Ok(PersistedState::default());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Error reading {}", self.state_path.display()))
            }
        };
        let keyfile = Ini::load_from_str(&contents)
            .with_context(|| format!("Error parsing {}", self.state_path.display()))?;
        let section = keyfile.section(Some(STATE_SECTION));
        let get = |key: &str| {
            section
                .and_then(|s| s.get(key))
                .map(ToString::to_string)
                .filter(|value| !value.is_empty())
        };
        Ok(PersistedState {
            cpu_driver: get(CPU_DRIVER_KEY),
            platform_driver: get(PLATFORM_DRIVER_KEY),
            profile: get(PROFILE_KEY),
        })
    }

    pub async fn save(&self, state: &PersistedState) -> Result<()> {
        let mut keyfile = self.load_keyfile().await;
        for (key, value) in [
            (CPU_DRIVER_KEY, &state.cpu_driver),
            (PLATFORM_DRIVER_KEY, &state.platform_driver),
            (PROFILE_KEY, &state.profile),
        ] {
            match value {
                Some(value) => keyfile.set_to(Some(STATE_SECTION), key.to_string(), value.clone()),
                None => {
                    keyfile.delete_from(Some(STATE_SECTION), key);
                }
            }
        }
        self.write_keyfile(keyfile).await
    }

    /// Drop the stored profile, keeping everything else.
    pub async fn clear_profile(&self) -> Result<()> {
        let mut keyfile = self.load_keyfile().await;
        if keyfile.delete_from(Some(STATE_SECTION), PROFILE_KEY).is_none() {
            return Ok(());
        }
        self.write_keyfile(keyfile).await
    }

    async fn load_keyfile(&self) -> Ini {
        match fs::read_to_string(&self.state_path).await {
            Ok(contents) => Ini::load_from_str(&contents).unwrap_or_default(),
            Err(_) => Ini::new(),
        }
    }

    async fn write_keyfile(&self, keyfile: Ini) -> Result<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Error creating {}", parent.display()))?;
        }
        let mut contents = Vec::new();
        keyfile
            .write_to(&mut contents)
            .context("Error serializing state")?;
        fs::write(&self.state_path, contents)
            .await
            .with_context(|| format!("Error writing {}", self.state_path.display()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing;
    use tokio::fs::{create_dir_all, read_to_string, write};

    fn state(cpu: Option<&str>, platform: Option<&str>, profile: Option<&str>) -> PersistedState {
        PersistedState {
            cpu_driver: cpu.map(String::from),
            platform_driver: platform.map(String::from),
            profile: profile.map(String::from),
        }
    }

    #[tokio::test]
    async fn missing_file_is_empty_state() {
        let _h = testing::start();
        let store = StateStore::new();
        assert_eq!(store.load().await.unwrap(), PersistedState::default());
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let _h = testing::start();
        let store = StateStore::new();
        let saved = state(Some("intel_pstate"), Some("platform_profile"), Some("performance"));
        store.save(&saved).await.expect("save");
        assert_eq!(store.load().await.unwrap(), saved);
    }

    #[tokio::test]
    async fn save_without_platform_driver() {
        let _h = testing::start();
        let store = StateStore::new();
        store
            .save(&state(Some("amd_pstate"), Some("placeholder"), Some("balanced")))
            .await
            .expect("save");
        let saved = state(Some("amd_pstate"), None, Some("balanced"));
        store.save(&saved).await.expect("save");
        assert_eq!(store.load().await.unwrap(), saved);
    }

    #[tokio::test]
    async fn clear_profile_keeps_drivers() {
        let _h = testing::start();
        let store = StateStore::new();
        store
            .save(&state(Some("intel_pstate"), Some("placeholder"), Some("power-saver")))
            .await
            .expect("save");
        store.clear_profile().await.expect("clear");
        assert_eq!(
            store.load().await.unwrap(),
            state(Some("intel_pstate"), Some("placeholder"), None)
        );
    }

    #[tokio::test]
    async fn unknown_keys_preserved() {
        let _h = testing::start();
        let state_path = path(STATE_FILE);
        create_dir_all(state_path.parent().unwrap()).await.unwrap();
        write(
            &state_path,
            "[State]\nProfile=balanced\nBattery=discharging\n\n[Quirks]\nFoo=bar\n",
        )
        .await
        .unwrap();

        let store = StateStore::new();
        store
            .save(&state(Some("intel_pstate"), None, Some("performance")))
            .await
            .expect("save");

        let contents = read_to_string(&state_path).await.unwrap();
        assert!(contents.contains("Battery=discharging"));
        assert!(contents.contains("[Quirks]"));
        assert!(contents.contains("Foo=bar"));
        assert!(contents.contains("Profile=performance"));
    }

    #[tokio::test]
    async fn garbage_file_fails_load() {
        let _h = testing::start();
        let state_path = path(STATE_FILE);
        create_dir_all(state_path.parent().unwrap()).await.unwrap();
        write(&state_path, "[State\nnot ini").await.unwrap();
        assert!(StateStore::new().load().await.is_err());
    }
}
