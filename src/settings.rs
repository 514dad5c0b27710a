//! On-disk configuration: `hostkeeper.toml` plus `HOSTKEEPER_*` overrides.
//!
//! Reads go through the `config` crate so environment variables can override
//! any key (`HOSTKEEPER_GENERAL__DELAY_TIME=500`). Writes go through
//! `toml_edit` so user comments and layout survive `set-content` and
//! `set-delay`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use toml_edit::{DocumentMut, Item, table, value};
use tracing::{debug, info, warn};

use crate::error::SettingsError;

pub const CONFIG_FILE_NAME: &str = "hostkeeper.toml";
pub const ENV_PREFIX: &str = "HOSTKEEPER";

pub const DEFAULT_DELAY_MS: i64 = 3000;
pub const MAX_DELAY_MS: i64 = 10_000;
pub const DEFAULT_HOSTS_DATA: &str = "# Hosts Monitor data\n127.0.0.1 localhost\n";

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub general: General,
    pub hosts: Hosts,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct General {
    pub auto_start: bool,
    pub run_as_admin: bool,
    pub minimize_to_tray: bool,
    /// Debounce delay in milliseconds. See [`normalize_delay`].
    pub delay_time: i64,
    /// Empty means the platform hosts file.
    pub hosts_path: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            auto_start: false,
            run_as_admin: false,
            minimize_to_tray: true,
            delay_time: DEFAULT_DELAY_MS,
            hosts_path: String::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Hosts {
    pub data: String,
}

impl Default for Hosts {
    fn default() -> Self {
        Self {
            data: DEFAULT_HOSTS_DATA.to_string(),
        }
    }
}

impl Settings {
    /// Loads `path`, creating it with defaults first if it does not exist.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        if !path.exists() {
            write_default(path)?;
            info!(path = %path.display(), "created default settings");
        }
        Self::read(path)
    }

    /// Like [`Settings::load`] but never creates the file.
    pub fn read(path: &Path) -> Result<Self, SettingsError> {
        let settings = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(true))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|config| config.try_deserialize::<Settings>())
            .map_err(|source| SettingsError::Load {
                path: path.to_path_buf(),
                source,
            })?;

        debug!(path = %path.display(), ?settings.general, "settings loaded");
        Ok(settings)
    }

    pub fn delay(&self) -> Duration {
        normalize_delay(self.general.delay_time)
    }

    pub fn target_path(&self) -> PathBuf {
        match self.general.hosts_path.trim() {
            "" => default_hosts_path(),
            custom => PathBuf::from(custom),
        }
    }
}

/// Non-positive delays fall back to the default; large ones are clamped.
pub fn normalize_delay(ms: i64) -> Duration {
    let ms = if ms <= 0 {
        warn!(delay_time = ms, default = DEFAULT_DELAY_MS, "invalid delay_time, using default");
        DEFAULT_DELAY_MS
    } else if ms > MAX_DELAY_MS {
        warn!(delay_time = ms, max = MAX_DELAY_MS, "delay_time too large, clamping");
        MAX_DELAY_MS
    } else {
        ms
    };
    Duration::from_millis(ms.unsigned_abs())
}

/// Checks a delay supplied on the command line before it is persisted.
pub fn validate_delay(ms: i64) -> Result<i64, SettingsError> {
    if ms <= 0 {
        return Err(SettingsError::InvalidDelay(ms));
    }
    Ok(ms.min(MAX_DELAY_MS))
}

#[cfg(windows)]
pub fn default_hosts_path() -> PathBuf {
    let root = std::env::var_os("SystemRoot")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
    root.join("System32").join("drivers").join("etc").join("hosts")
}

#[cfg(not(windows))]
pub fn default_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

/// `hostkeeper.toml` next to the running executable.
pub fn default_config_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(CONFIG_FILE_NAME)))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_NAME))
}

fn default_document() -> DocumentMut {
    let defaults = Settings::default();
    let mut doc = DocumentMut::new();

    doc["general"] = table();
    doc["general"]["auto_start"] = value(defaults.general.auto_start);
    doc["general"]["run_as_admin"] = value(defaults.general.run_as_admin);
    doc["general"]["minimize_to_tray"] = value(defaults.general.minimize_to_tray);
    doc["general"]["delay_time"] = value(defaults.general.delay_time);
    doc["general"]["hosts_path"] = value(defaults.general.hosts_path);

    doc["hosts"] = table();
    doc["hosts"]["data"] = value(defaults.hosts.data);
    doc
}

pub fn write_default(path: &Path) -> Result<(), SettingsError> {
    write_document(path, &default_document())
}

/// Replaces `[hosts].data`, keeping everything else in the file as is.
pub fn save_hosts_data(path: &Path, data: &str) -> Result<(), SettingsError> {
    let mut doc = read_document(path)?;
    ensure_table(&mut doc, "hosts");
    doc["hosts"]["data"] = value(data);
    write_document(path, &doc)
}

/// Replaces `[general].delay_time`, keeping everything else in the file as is.
pub fn save_delay_time(path: &Path, ms: i64) -> Result<(), SettingsError> {
    let ms = validate_delay(ms)?;
    let mut doc = read_document(path)?;
    ensure_table(&mut doc, "general");
    doc["general"]["delay_time"] = value(ms);
    write_document(path, &doc)
}

fn ensure_table(doc: &mut DocumentMut, key: &str) {
    if !doc.get(key).is_some_and(Item::is_table_like) {
        doc[key] = table();
    }
}

fn read_document(path: &Path) -> Result<DocumentMut, SettingsError> {
    match fs::read_to_string(path) {
        Ok(text) => text.parse::<DocumentMut>().map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        }),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(default_document()),
        Err(source) => Err(SettingsError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn write_document(path: &Path, doc: &DocumentMut) -> Result<(), SettingsError> {
    let write_err = |source: io::Error| SettingsError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(write_err)?;
    }
    fs::write(path, doc.to_string()).map_err(write_err)
}
