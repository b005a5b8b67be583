/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::write_synced;

/// Read a kernel attribute, trimming the trailing newline.
pub(crate) async fn read_attr<P: AsRef<Path>>(attr: P) -> Result<String> {
    let attr = attr.as_ref();
    Ok(fs::read_to_string(attr)
        .await
        .with_context(|| format!("Error reading attribute {}", attr.display()))?
        .trim_end_matches('\n')
        .to_string())
}

/// Write a kernel attribute. The write is synced before this returns so the
/// new state is observable immediately afterwards.
pub(crate) async fn write_attr<P: AsRef<Path>, V: AsRef<str>>(attr: P, value: V) -> Result<()> {
    let attr = attr.as_ref();
    trace!("Writing '{}' to {}", value.as_ref(), attr.display());
    write_synced(attr, value.as_ref().as_bytes())
        .await
        .with_context(|| format!("Error writing attribute {}", attr.display()))
}

/// Whether an attribute error came from the file being absent, as opposed to
/// an I/O failure on a present file.
pub(crate) fn is_not_found(error: &anyhow::Error) -> bool {
    error
        .root_cause()
        .downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == ErrorKind::NotFound)
}

/// Watches a single attribute file for content changes.
///
/// Events raised while a [`SuppressGuard`] is held are dropped, so a driver
/// bracketing its own writes does not see them reflected back as external
/// changes.
pub(crate) struct AttrWatcher {
    _watcher: RecommendedWatcher,
    suppress: Arc<AtomicUsize>,
    events: UnboundedReceiver<()>,
}

#[derive(Clone)]
pub(crate) struct WriteSuppressor {
    counter: Arc<AtomicUsize>,
}

pub(crate) struct SuppressGuard {
    counter: Arc<AtomicUsize>,
}

impl AttrWatcher {
    pub fn new<P: AsRef<Path>>(attr: P) -> Result<AttrWatcher> {
        let attr = attr.as_ref().to_path_buf();
        let suppress = Arc::new(AtomicUsize::new(0));
        let (tx, events) = unbounded_channel();
        let mut watcher = notify_watcher(suppress.clone(), tx)?;
        watcher
            .watch(&attr, RecursiveMode::NonRecursive)
            .with_context(|| format!("Error watching {}", attr.display()))?;
        Ok(AttrWatcher {
            _watcher: watcher,
            suppress,
            events,
        })
    }

    /// Watch a directory instead of a single file, for attributes that do
    /// not exist yet.
    pub fn for_directory<P: AsRef<Path>>(dir: P) -> Result<AttrWatcher> {
        AttrWatcher::new(dir)
    }

    /// Resolves whenever the watched file's contents may have changed.
    /// Returns `None` once the watcher backend goes away.
    pub async fn changed(&mut self) -> Option<()> {
        self.events.recv().await
    }

    pub fn suppressor(&self) -> WriteSuppressor {
        WriteSuppressor {
            counter: self.suppress.clone(),
        }
    }
}

impl WriteSuppressor {
    /// Drop events until the returned guard is dropped.
    pub fn hold(&self) -> SuppressGuard {
        self.counter.fetch_add(1, Ordering::SeqCst);
        SuppressGuard {
            counter: self.counter.clone(),
        }
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn notify_watcher(
    suppress: Arc<AtomicUsize>,
    tx: UnboundedSender<()>,
) -> Result<RecommendedWatcher> {
    Ok(notify::recommended_watcher(
        move |res: notify::Result<Event>| {
            let Ok(event) = res else {
                return;
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
            ) {
                return;
            }
            if suppress.load(Ordering::SeqCst) > 0 {
                trace!("Suppressing change event for {:?}", event.paths);
                return;
            }
            let _ = tx.send(());
        },
    )?)
}

/// Enumerate directory entries whose name starts with `prefix` and that
/// contain the named attribute, e.g. every `policyN` with an
/// `energy_performance_preference` file.
pub(crate) async fn matching_entries(
    dir: &Path,
    prefix: &str,
    attr: &str,
) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("Error opening {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if !name.starts_with(prefix) {
            continue;
        }
        let base = entry.path();
        if fs::try_exists(base.join(attr)).await.unwrap_or(false) {
            found.push(base);
        }
    }
    Ok(found)
}
