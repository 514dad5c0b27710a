use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Failure of a single repair write. The monitor keeps running after any of
/// these and retries on the next qualifying event.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("permission denied writing {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("a repair write to {} is already in flight", path.display())]
    Busy { path: PathBuf },
    #[error("failed to write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WriteError {
    pub fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                path: path.to_path_buf(),
                source,
            },
            _ => Self::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }

    /// Whether an immediate retry could succeed without anything changing
    /// outside the process.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("{} has no parent directory to watch", path.display())]
    NoParent { path: PathBuf },
    #[error("failed to subscribe to changes under {}", path.display())]
    Subscribe {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings from {}", path.display())]
    Load {
        path: PathBuf,
        #[source]
        source: config::ConfigError,
    },
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml_edit::TomlError,
    },
    #[error("failed to write {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("delay_time must be greater than zero, got {0}")]
    InvalidDelay(i64),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitoring is already running for {}", path.display())]
    AlreadyRunning { path: PathBuf },
    #[error("monitoring is not running for {}", path.display())]
    NotRunning { path: PathBuf },
}

#[derive(Debug, Error)]
#[error("another instance already holds 127.0.0.1:{port}")]
pub struct InstanceError {
    pub port: u16,
    #[source]
    pub source: io::Error,
}
