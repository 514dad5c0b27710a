use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use super::content::CanonicalContent;
use super::guard::{SuppressionGuard, digest};
use crate::error::WriteError;

/// Overwrites the target with the canonical content.
///
/// The write goes to a sibling temp file that is renamed over the target. When
/// the rename route is unavailable (bind-mounted `/etc/hosts`, a locked
/// directory, a file held open without delete sharing) it falls back to an
/// in-place truncate and write.
#[derive(Debug)]
pub struct RepairWriter {
    path: PathBuf,
    guard: Arc<SuppressionGuard>,
    in_flight: AtomicBool,
    #[cfg(test)]
    fail_next: std::sync::Mutex<Option<io::ErrorKind>>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RepairWriter {
    pub fn new(path: PathBuf, guard: Arc<SuppressionGuard>) -> Self {
        Self {
            path,
            guard,
            in_flight: AtomicBool::new(false),
            #[cfg(test)]
            fail_next: std::sync::Mutex::new(None),
        }
    }

    /// Makes the next write fail with `kind` before touching the disk.
    #[cfg(test)]
    pub(crate) fn fail_next_write(&self, kind: io::ErrorKind) {
        *self.fail_next.lock().unwrap() = Some(kind);
    }

    pub async fn write(&self, content: &CanonicalContent) -> Result<(), WriteError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WriteError::Busy {
                path: self.path.clone(),
            });
        }
        let _in_flight = InFlight(&self.in_flight);

        self.guard.open(digest(content.as_bytes()));

        #[cfg(test)]
        if let Some(kind) = self.fail_next.lock().unwrap().take() {
            self.guard.close();
            return Err(WriteError::from_io(&self.path, io::Error::from(kind)));
        }

        let path = self.path.clone();
        let content = content.clone();
        let result =
            tokio::task::spawn_blocking(move || replace_contents(&path, content.as_bytes()))
                .await
                .unwrap_or_else(|join_err| {
                    Err(WriteError::Io {
                        path: self.path.clone(),
                        source: io::Error::other(join_err),
                    })
                });

        if result.is_err() {
            self.guard.close();
        }
        result
    }
}

fn replace_contents(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    match write_via_rename(path, bytes) {
        Ok(()) => {
            info!(path = %path.display(), bytes = bytes.len(), "replaced file");
            Ok(())
        }
        Err(err) => {
            debug!(path = %path.display(), error = %err, "rename route failed, writing in place");
            write_in_place(path, bytes).map_err(|source| WriteError::from_io(path, source))?;
            info!(path = %path.display(), bytes = bytes.len(), "rewrote file in place");
            Ok(())
        }
    }
}

fn write_via_rename(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".hostkeeper-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    match fs::metadata(path) {
        Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            set_default_permissions(tmp.as_file())?
        }
        Err(err) => return Err(err),
    }

    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(unix)]
fn set_default_permissions(file: &fs::File) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_permissions(_file: &fs::File) -> io::Result<()> {
    Ok(())
}

fn write_in_place(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
