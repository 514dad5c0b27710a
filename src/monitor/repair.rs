use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::content::ContentStore;
use super::detector::{ObservedState, compute_drift, needs_repair};
use super::guard::SuppressionGuard;
use super::status::StatusReporter;
use super::writer::RepairWriter;
use crate::error::WriteError;

/// What started a decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// A debounce timer survived its delay.
    Debounced(u64),
    /// An explicit request; never treated as an echo.
    Forced,
}

#[derive(Debug)]
pub enum RepairOutcome {
    InSync,
    Disabled,
    /// The cycle was caused by our own previous write.
    Echo,
    Repaired { bytes: usize },
    Unreadable(io::Error),
    Failed(WriteError),
}

impl RepairOutcome {
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Repaired { .. })
    }
}

/// The decision step. All reads and writes of the target go through
/// [`RepairStep::run`], which holds one lock for the whole
/// read-compare-write sequence.
#[derive(Debug)]
pub struct RepairStep {
    target: PathBuf,
    store: Arc<ContentStore>,
    guard: Arc<SuppressionGuard>,
    writer: RepairWriter,
    status: StatusReporter,
    serial: Mutex<()>,
}

impl RepairStep {
    pub fn new(
        target: PathBuf,
        store: Arc<ContentStore>,
        guard: Arc<SuppressionGuard>,
        status: StatusReporter,
    ) -> Self {
        let writer = RepairWriter::new(target.clone(), Arc::clone(&guard));
        Self {
            target,
            store,
            guard,
            writer,
            status,
            serial: Mutex::new(()),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Blocks every decision until the guard is dropped.
    #[cfg(test)]
    pub(crate) async fn hold(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.serial.lock().await
    }

    pub async fn run(&self, trigger: Trigger) -> RepairOutcome {
        let _serial = self.serial.lock().await;

        let observed = match ObservedState::load(&self.target).await {
            Ok(observed) => observed,
            Err(err) => {
                warn!(path = %self.target.display(), error = %err, "cannot read target, skipping");
                return RepairOutcome::Unreadable(err);
            }
        };

        if let Trigger::Debounced(generation) = trigger {
            if self.guard.is_echo(generation, observed.digest().as_ref()) {
                debug!(generation, "change was our own write");
                return RepairOutcome::Echo;
            }
        }

        let canonical = self.store.get();
        if canonical.is_disabled() {
            debug!("canonical content is empty, repair disabled");
            self.status.disabled();
            return RepairOutcome::Disabled;
        }

        if !needs_repair(&observed, &canonical) {
            debug!(?trigger, "target in sync");
            self.status.in_sync();
            return RepairOutcome::InSync;
        }

        let drift = compute_drift(&observed, &canonical);
        info!(
            path = %self.target.display(),
            exists = observed.exists(),
            added = drift.added(),
            removed = drift.removed(),
            ?trigger,
            "drift detected, repairing"
        );

        match self.writer.write(&canonical).await {
            Ok(()) => {
                self.status.repaired(canonical.len());
                RepairOutcome::Repaired {
                    bytes: canonical.len(),
                }
            }
            Err(err) => {
                error!(path = %self.target.display(), error = %err, "repair failed");
                self.status.write_failed(&err);
                RepairOutcome::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::guard::digest;
    use crate::monitor::status::StatusEvent;
    use std::fs;
    use tempfile::TempDir;
    use tokio::sync::broadcast;

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        store: Arc<ContentStore>,
        guard: Arc<SuppressionGuard>,
        step: RepairStep,
        events: broadcast::Receiver<StatusEvent>,
    }

    fn fixture(canonical: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        let store = Arc::new(ContentStore::new(canonical));
        let guard = Arc::new(SuppressionGuard::default());
        let status = StatusReporter::new();
        let events = status.subscribe();
        let step = RepairStep::new(path.clone(), Arc::clone(&store), Arc::clone(&guard), status);
        Fixture {
            _dir: dir,
            path,
            store,
            guard,
            step,
            events,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn drifted_file_is_rewritten() {
        let mut fx = fixture("127.0.0.1 localhost\n");
        fs::write(&fx.path, "0.0.0.0 localhost\n").unwrap();

        let outcome = fx.step.run(Trigger::Forced).await;

        assert!(outcome.wrote());
        assert_eq!(fs::read_to_string(&fx.path).unwrap(), "127.0.0.1 localhost\n");
        assert_eq!(drain(&mut fx.events), vec![StatusEvent::Repaired { bytes: 20 }]);
    }

    #[tokio::test]
    async fn missing_file_is_recreated() {
        let fx = fixture("127.0.0.1 localhost\n");

        let outcome = fx.step.run(Trigger::Debounced(1)).await;

        assert!(outcome.wrote());
        assert_eq!(fs::read_to_string(&fx.path).unwrap(), "127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn repeated_decision_on_synced_file_is_silent() {
        let mut fx = fixture("a\n");
        fs::write(&fx.path, "a\n").unwrap();

        assert!(matches!(fx.step.run(Trigger::Debounced(1)).await, RepairOutcome::InSync));
        assert_eq!(drain(&mut fx.events), vec![StatusEvent::InSync]);

        let modified = fs::metadata(&fx.path).unwrap().modified().unwrap();
        for generation in 2..5 {
            assert!(matches!(
                fx.step.run(Trigger::Debounced(generation)).await,
                RepairOutcome::InSync
            ));
        }
        assert!(drain(&mut fx.events).is_empty());
        assert_eq!(fs::metadata(&fx.path).unwrap().modified().unwrap(), modified);
        assert!(!fx.guard.is_suppressing());
    }

    #[tokio::test]
    async fn empty_canonical_never_touches_the_file() {
        let mut fx = fixture("");
        fs::write(&fx.path, "whatever\n").unwrap();

        assert!(matches!(fx.step.run(Trigger::Forced).await, RepairOutcome::Disabled));
        assert_eq!(fs::read_to_string(&fx.path).unwrap(), "whatever\n");
        assert_eq!(drain(&mut fx.events), vec![StatusEvent::Disabled]);

        fs::remove_file(&fx.path).unwrap();
        assert!(matches!(fx.step.run(Trigger::Debounced(3)).await, RepairOutcome::Disabled));
        assert!(!fx.path.exists());
    }

    #[tokio::test]
    async fn echo_of_own_write_is_skipped_once() {
        let fx = fixture("a\n");
        fs::write(&fx.path, "a\n").unwrap();

        fx.guard.open(digest(b"a\n"));
        assert!(fx.guard.observe(9));

        assert!(matches!(fx.step.run(Trigger::Debounced(9)).await, RepairOutcome::Echo));
        assert!(matches!(fx.step.run(Trigger::Debounced(9)).await, RepairOutcome::InSync));
    }

    #[tokio::test]
    async fn external_edit_during_window_is_repaired() {
        let fx = fixture("a\n");
        fx.guard.open(digest(b"a\n"));
        assert!(fx.guard.observe(4));
        fs::write(&fx.path, "b\n").unwrap();

        assert!(fx.step.run(Trigger::Debounced(4)).await.wrote());
        assert_eq!(fs::read_to_string(&fx.path).unwrap(), "a\n");
    }

    #[tokio::test]
    async fn updated_content_is_applied_on_next_decision() {
        let fx = fixture("old\n");
        fs::write(&fx.path, "old\n").unwrap();
        assert!(matches!(fx.step.run(Trigger::Forced).await, RepairOutcome::InSync));

        fx.store.set("new\n");
        assert!(fx.step.run(Trigger::Forced).await.wrote());
        assert_eq!(fs::read_to_string(&fx.path).unwrap(), "new\n");
    }

    #[tokio::test]
    async fn permission_denied_is_reported_and_next_run_retries() {
        let mut fx = fixture("a\n");
        fs::write(&fx.path, "b\n").unwrap();
        fx.step.writer.fail_next_write(io::ErrorKind::PermissionDenied);

        match fx.step.run(Trigger::Forced).await {
            RepairOutcome::Failed(err) => assert!(err.is_permission_denied()),
            other => panic!("expected a failed write, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(&fx.path).unwrap(), "b\n");
        assert!(!fx.guard.is_suppressing());
        let events = drain(&mut fx.events);
        assert!(
            matches!(
                events.as_slice(),
                [StatusEvent::WriteFailed {
                    permission_denied: true,
                    ..
                }]
            ),
            "events: {events:?}"
        );

        assert!(fx.step.run(Trigger::Debounced(2)).await.wrote());
        assert_eq!(fs::read_to_string(&fx.path).unwrap(), "a\n");
        assert_eq!(drain(&mut fx.events), vec![StatusEvent::Repaired { bytes: 2 }]);
    }

    #[tokio::test]
    async fn unreadable_target_is_reported_without_writing() {
        let fx = fixture("a\n");
        fs::create_dir(&fx.path).unwrap();

        assert!(matches!(
            fx.step.run(Trigger::Forced).await,
            RepairOutcome::Unreadable(_)
        ));
        assert!(fx.path.is_dir());
    }
}
