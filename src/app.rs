use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::config_watch::watch_settings;
use crate::instance::InstanceLock;
use crate::monitor::{
    CanonicalContent, Monitor, ObservedState, RepairOutcome, compute_drift, needs_repair,
};
use crate::settings::{self, Settings};
use crate::ui::drift_view::render_drift;
use crate::ui::status_view::render_status;

/// Exit code of `check` when the file has drifted.
pub const DRIFT_EXIT_CODE: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Drifted,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Done => ExitCode::SUCCESS,
            Outcome::Drifted => ExitCode::from(DRIFT_EXIT_CODE),
        }
    }
}

fn monitor_for(settings: &Settings) -> Monitor {
    Monitor::new(
        settings.target_path(),
        settings.hosts.data.as_str(),
        settings.delay(),
    )
}

pub async fn run(config: &Path) -> Result<Outcome> {
    let _lock = InstanceLock::acquire().context("hostkeeper is already running")?;
    let settings = Settings::load(config)?;

    let monitor = monitor_for(&settings);
    let mut events = monitor.subscribe();
    monitor.start_monitoring()?;

    let (_settings_watcher, mut reloads) = watch_settings(config)?;

    println!(
        "watching {} (delay {} ms), press Ctrl-C to stop",
        monitor.target().display(),
        monitor.delay().as_millis()
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(err) = result {
                    warn!(error = %err, "failed to listen for Ctrl-C");
                }
                break;
            }
            event = events.recv() => match event {
                Ok(event) => println!("{}", render_status(&event)),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status output fell behind"),
                Err(RecvError::Closed) => break,
            },
            Some(()) = reloads.next() => reload(config, &monitor),
        }
    }

    monitor.stop_monitoring().await?;
    Ok(Outcome::Done)
}

fn reload(config: &Path, monitor: &Monitor) {
    let settings = match Settings::read(config) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(error = %err, "ignoring settings change");
            return;
        }
    };

    if settings.target_path() != monitor.target() {
        warn!(
            configured = %settings.target_path().display(),
            watching = %monitor.target().display(),
            "hosts_path changed, restart to watch the new file"
        );
    }
    monitor.set_delay(settings.delay());
    let changed = monitor.update_canonical_content(settings.hosts.data);
    info!(content_changed = changed, "settings reloaded");
}

pub async fn check(config: &Path) -> Result<Outcome> {
    let settings = Settings::load(config)?;
    let target = settings.target_path();
    let canonical = CanonicalContent::new(settings.hosts.data);

    if canonical.is_disabled() {
        println!("canonical content is empty, nothing to check");
        return Ok(Outcome::Done);
    }

    let observed = ObservedState::load(&target)
        .await
        .with_context(|| format!("failed to read {}", target.display()))?;

    if !needs_repair(&observed, &canonical) {
        println!("{} is in sync", target.display());
        return Ok(Outcome::Done);
    }

    if !observed.exists() {
        println!("{} is missing", target.display());
    }
    print!("{}", render_drift(&target, &compute_drift(&observed, &canonical)));
    Ok(Outcome::Drifted)
}

pub async fn repair(config: &Path) -> Result<Outcome> {
    let settings = Settings::load(config)?;
    let monitor = monitor_for(&settings);
    let target = monitor.target().display();

    match monitor.force_repair_now().await {
        RepairOutcome::Repaired { bytes } => println!("repaired {target} ({bytes} bytes)"),
        RepairOutcome::InSync | RepairOutcome::Echo => println!("{target} is already in sync"),
        RepairOutcome::Disabled => println!("canonical content is empty, nothing to repair"),
        RepairOutcome::Unreadable(err) => {
            return Err(err).with_context(|| format!("failed to read {target}"));
        }
        RepairOutcome::Failed(err) => return Err(err.into()),
    }
    Ok(Outcome::Done)
}

/// Replaces the canonical content from `source`, a file path or `-` for stdin.
pub async fn set_content(config: &Path, source: &Path) -> Result<Outcome> {
    let data = if source == Path::new("-") {
        let mut data = String::new();
        tokio::io::stdin()
            .read_to_string(&mut data)
            .await
            .context("failed to read content from stdin")?;
        data
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("failed to read {}", source.display()))?
    };

    if data.trim().is_empty() {
        warn!("new content is empty, repair will be disabled");
    }
    settings::save_hosts_data(config, &data)?;
    println!("saved {} bytes to {}", data.len(), config.display());
    Ok(Outcome::Done)
}

pub async fn set_delay(config: &Path, ms: i64) -> Result<Outcome> {
    if ms > settings::MAX_DELAY_MS {
        warn!(requested = ms, max = settings::MAX_DELAY_MS, "delay clamped");
    }
    settings::save_delay_time(config, ms)?;
    let saved = Settings::read(config)?;
    println!(
        "delay_time set to {} ms in {}",
        saved.delay().as_millis(),
        config.display()
    );
    Ok(Outcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn config_for(dir: &TempDir, data: &str) -> std::path::PathBuf {
        let config = dir.path().join("hostkeeper.toml");
        let hosts = dir.path().join("hosts");
        fs::write(
            &config,
            format!(
                "[general]\ndelay_time = 100\nhosts_path = {:?}\n\n[hosts]\ndata = {:?}\n",
                hosts.display().to_string(),
                data
            ),
        )
        .unwrap();
        config
    }

    #[tokio::test]
    async fn check_reports_drift_then_repair_fixes_it() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, "127.0.0.1 localhost\n");
        fs::write(dir.path().join("hosts"), "10.0.0.1 other\n").unwrap();

        assert_eq!(check(&config).await.unwrap(), Outcome::Drifted);

        repair(&config).await.unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("hosts")).unwrap(),
            "127.0.0.1 localhost\n"
        );
        assert_eq!(check(&config).await.unwrap(), Outcome::Done);
    }

    #[tokio::test]
    async fn check_with_empty_content_is_never_drift() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, "");

        assert_eq!(check(&config).await.unwrap(), Outcome::Done);
        assert!(!dir.path().join("hosts").exists());
    }

    #[tokio::test]
    async fn set_content_from_file_updates_settings() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, "a\n");
        let source = dir.path().join("new-hosts");
        fs::write(&source, "10.1.1.1 build\n").unwrap();

        set_content(&config, &source).await.unwrap();
        set_delay(&config, 250).await.unwrap();

        let settings = Settings::read(&config).unwrap();
        assert_eq!(settings.hosts.data, "10.1.1.1 build\n");
        assert_eq!(settings.general.delay_time, 250);
    }

    #[tokio::test]
    async fn non_positive_delay_is_rejected() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir, "a\n");

        assert!(set_delay(&config, 0).await.is_err());
        assert_eq!(Settings::read(&config).unwrap().general.delay_time, 100);
    }
}
