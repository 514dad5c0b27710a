//! Keeps a hosts file pinned to a canonical content.
//!
//! The [`monitor`] module holds the watch, debounce and repair loop. The
//! remaining modules wire it to a TOML settings file and a terminal front end.

pub mod app;
pub mod config_watch;
pub mod error;
pub mod instance;
pub mod monitor;
pub mod settings;
pub mod ui;

pub use error::{InstanceError, MonitorError, SettingsError, WatchError, WriteError};
pub use monitor::{Monitor, RepairOutcome, StatusEvent};
