//! The watch → debounce → repair loop for a single target file.

pub mod content;
pub mod detector;
pub mod guard;
pub mod repair;
pub mod scheduler;
pub mod status;
pub mod watch;
pub mod writer;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use content::{CanonicalContent, ContentStore};
pub use detector::{Drift, DriftLine, ObservedState, compute_drift, needs_repair};
pub use guard::{SUPPRESSION_GRACE, SuppressionGuard};
pub use repair::{RepairOutcome, RepairStep, Trigger};
pub use scheduler::DebounceScheduler;
pub use status::{StatusEvent, StatusReporter, SyncState};
pub use watch::{MAX_RESUBSCRIBE_ATTEMPTS, RESUBSCRIBE_BACKOFF};

use crate::error::MonitorError;
use watch::WatchLoop;

/// Upper bound on how long `stop_monitoring` waits for an in-flight repair.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

pub const DEFAULT_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug)]
struct Shared {
    store: Arc<ContentStore>,
    guard: Arc<SuppressionGuard>,
    step: Arc<RepairStep>,
    status: StatusReporter,
    delay_ms: AtomicU64,
}

#[derive(Debug)]
struct Running {
    shutdown: CancellationToken,
    scheduler: DebounceScheduler,
    tasks: Vec<JoinHandle<()>>,
}

/// Keeps one file pinned to its canonical content.
///
/// Construction is inert. [`Monitor::start_monitoring`] spawns the watch,
/// content and repair tasks on the current Tokio runtime; they run until
/// [`Monitor::stop_monitoring`] or until the monitor is dropped.
#[derive(Debug)]
pub struct Monitor {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Monitor {
    pub fn new(
        target: impl Into<PathBuf>,
        canonical: impl Into<CanonicalContent>,
        delay: Duration,
    ) -> Self {
        let target = target.into();
        let store = Arc::new(ContentStore::new(canonical));
        let guard = Arc::new(SuppressionGuard::default());
        let status = StatusReporter::new();
        let step = Arc::new(RepairStep::new(
            target,
            Arc::clone(&store),
            Arc::clone(&guard),
            status.clone(),
        ));

        Self {
            shared: Arc::new(Shared {
                store,
                guard,
                step,
                status,
                delay_ms: AtomicU64::new(millis(delay)),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &Path {
        self.shared.step.target()
    }

    pub fn canonical_content(&self) -> CanonicalContent {
        self.shared.store.get()
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.shared.delay_ms.load(Ordering::Relaxed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.status.subscribe()
    }

    pub fn sync_state(&self) -> Option<SyncState> {
        self.shared.status.current()
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to the target and arms one initial evaluation so a file
    /// that drifted while nothing was watching is repaired promptly.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_monitoring(&self) -> Result<(), MonitorError> {
        let mut running = self.running();
        if running.is_some() {
            return Err(MonitorError::AlreadyRunning {
                path: self.target().to_path_buf(),
            });
        }

        let shutdown = CancellationToken::new();
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = DebounceScheduler::new(self.delay(), fired_tx);

        let watch = WatchLoop::new(
            self.target().to_path_buf(),
            scheduler.clone(),
            Arc::clone(&self.shared.guard),
            self.shared.status.clone(),
        );

        let tasks = vec![
            tokio::spawn(watch.run(shutdown.clone())),
            tokio::spawn(repair_loop(
                Arc::clone(&self.shared.step),
                fired_rx,
                shutdown.clone(),
            )),
            tokio::spawn(content_loop(
                self.shared.store.subscribe(),
                scheduler.clone(),
                shutdown.clone(),
            )),
        ];

        scheduler.on_event();
        info!(
            path = %self.target().display(),
            delay_ms = self.delay().as_millis() as u64,
            "monitoring started"
        );

        *running = Some(Running {
            shutdown,
            scheduler,
            tasks,
        });
        Ok(())
    }

    /// Stops watching. A pending debounce timer is discarded; a repair that is
    /// already writing gets up to [`SHUTDOWN_TIMEOUT`] to finish.
    pub async fn stop_monitoring(&self) -> Result<(), MonitorError> {
        let Some(running) = self.running().take() else {
            return Err(MonitorError::NotRunning {
                path: self.target().to_path_buf(),
            });
        };

        running.scheduler.cancel();
        running.shutdown.cancel();

        let aborts: Vec<_> = running.tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all(running.tasks))
            .await
            .is_err()
        {
            warn!(
                timeout_ms = SHUTDOWN_TIMEOUT.as_millis() as u64,
                "monitor tasks did not stop in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        self.shared.guard.close();
        info!(path = %self.target().display(), "monitoring stopped");
        Ok(())
    }

    /// Replaces the canonical content. While monitoring, a change arms a new
    /// evaluation; the next decision uses the new value either way.
    pub fn update_canonical_content(&self, text: impl Into<CanonicalContent>) -> bool {
        let changed = self.shared.store.set(text);
        if changed {
            let content = self.shared.store.get();
            info!(
                bytes = content.len(),
                disabled = content.is_disabled(),
                "canonical content updated"
            );
        }
        changed
    }

    /// Runs one decision immediately, bypassing the debounce delay and the
    /// echo check. Works whether or not monitoring is running.
    pub async fn force_repair_now(&self) -> RepairOutcome {
        self.shared.step.run(Trigger::Forced).await
    }

    /// Applies to the next armed timer; a pending timer keeps its deadline.
    pub fn set_delay(&self, delay: Duration) {
        self.shared.delay_ms.store(millis(delay), Ordering::Relaxed);
        if let Some(running) = self.running().as_ref() {
            running.scheduler.set_delay(delay);
        }
        debug!(delay_ms = millis(delay), "debounce delay updated");
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.scheduler.cancel();
            running.shutdown.cancel();
        }
    }
}

async fn repair_loop(
    step: Arc<RepairStep>,
    mut fired: mpsc::UnboundedReceiver<u64>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            generation = fired.recv() => {
                let Some(generation) = generation else { break };
                let outcome = step.run(Trigger::Debounced(generation)).await;
                debug!(generation, ?outcome, "decision complete");
            }
        }
    }
    debug!("repair loop stopped");
}

async fn content_loop(
    mut content: tokio::sync::watch::Receiver<CanonicalContent>,
    scheduler: DebounceScheduler,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = content.changed() => {
                if changed.is_err() {
                    break;
                }
                scheduler.on_event();
            }
        }
    }
}

fn millis(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX).max(1)
}
