/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::Result;
use std::future::Future;
#[cfg(not(test))]
use std::env;
#[cfg(not(test))]
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

mod actions;
mod bus;
mod config;
pub mod daemon;
mod drivers;
mod error;
mod manager;
mod polkit;
mod profile;
mod sysdev;
mod sysfs;
mod uevent;

#[cfg(test)]
mod testing;

/// The D-Bus name and object path pairs this daemon serves. Both carry the
/// same interface; the legacy pair predates the move under the UPower
/// namespace and is kept for old clients.
pub(crate) const BUS_NAME: &str = "org.freedesktop.UPower.PowerProfiles";
pub(crate) const BUS_PATH: &str = "/org/freedesktop/UPower/PowerProfiles";
pub(crate) const LEGACY_BUS_NAME: &str = "net.hadess.PowerProfiles";
pub(crate) const LEGACY_BUS_PATH: &str = "/net/hadess/PowerProfiles";

pub(crate) const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolve a system path, honoring the filesystem root override.
///
/// In production the `UMOCKDEV_DIR` environment variable, when set to a
/// directory, is prepended to every path so integration tests can run the
/// daemon against a scratch sysfs tree. Unit tests always run against the
/// current `testing` fixture root.
#[cfg(not(test))]
pub(crate) fn path<S: AsRef<Path>>(path: S) -> PathBuf {
    match env::var_os("UMOCKDEV_DIR") {
        Some(root) if root != OsString::new() => {
            PathBuf::from(root).join(relative_path(path.as_ref()))
        }
        _ => path.as_ref().to_path_buf(),
    }
}

#[cfg(test)]
pub(crate) fn path<S: AsRef<Path>>(path: S) -> PathBuf {
    testing::current().path().join(relative_path(path.as_ref()))
}

fn relative_path(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

/// Write a sysfs-style attribute and make sure it hit the kernel before
/// returning. Writes are unbuffered and synced so the new state is observable
/// as soon as this resolves.
pub(crate) async fn write_synced<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path.as_ref()).await?;
    file.write_all(bytes).await?;
    Ok(file.sync_data().await?)
}

pub(crate) trait Service
where
    Self: Sized + Send,
{
    const NAME: &'static str;

    fn run(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn shutdown(&mut self) -> impl Future<Output = Result<()>> + Send {
        async move { Ok(()) }
    }

    fn start(mut self, token: CancellationToken) -> impl Future<Output = Result<()>> + Send {
        async move {
            debug!("Starting {}", Self::NAME);
            let res = tokio::select! {
                r = self.run() => r,
                () = token.cancelled() => Ok(()),
            };
            if res.is_err() {
                token.cancel();
            }

            debug!("Shutting down {}", Self::NAME);
            self.shutdown().await.and(res)
        }
    }
}
