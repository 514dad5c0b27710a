use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::channel::mpsc::{UnboundedReceiver, unbounded};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tracing::{debug, warn};

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(500);

/// Keeps the settings file watched for as long as it is alive.
pub struct SettingsWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
}

/// Watches `path` and yields one message per settled burst of changes.
///
/// The containing directory is watched so editors that save by replacing the
/// file keep being noticed.
pub fn watch_settings(path: &Path) -> Result<(SettingsWatcher, UnboundedReceiver<()>)> {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    let file_name = path.file_name().map(ToOwned::to_owned);

    let (tx, rx) = unbounded();
    let mut debouncer = new_debouncer(RELOAD_DEBOUNCE, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                let touched = events
                    .iter()
                    .any(|event| event.path.file_name() == file_name.as_deref());
                if touched {
                    let _ = tx.unbounded_send(());
                }
            }
            Err(err) => warn!("settings watcher error: {err:?}"),
        }
    })
    .context("failed to create settings watcher")?;

    debouncer
        .watcher()
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;
    debug!(path = %path.display(), "watching settings");

    Ok((
        SettingsWatcher {
            _debouncer: debouncer,
        },
        rx,
    ))
}
