//! Filesystem subscription for the target file.
//!
//! The parent directory is always watched (non-recursively) so that deletes,
//! recreates and rename-over writes are seen even on platforms that only
//! report them at directory level. The file itself is watched as well while
//! it exists. Every qualifying notification restarts the debounce scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::guard::SuppressionGuard;
use super::scheduler::DebounceScheduler;
use super::status::StatusReporter;
use crate::error::WatchError;

/// Wait between failed subscription attempts.
pub const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(3);

/// Consecutive failures before monitoring is reported as degraded.
pub const MAX_RESUBSCRIBE_ATTEMPTS: u32 = 5;

#[derive(Debug, PartialEq, Eq)]
enum EventClass {
    Target,
    DirectoryGone,
    Ignored,
}

enum PumpExit {
    Shutdown,
    Invalidated(String),
}

struct Subscription {
    watcher: RecommendedWatcher,
    events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    paths: WatchedPaths,
}

/// Resolved locations for one subscription. The directory is canonicalised
/// because some backends report resolved paths (`/private/var` on macOS).
#[derive(Clone, Debug)]
struct WatchedPaths {
    target: PathBuf,
    dir: PathBuf,
    resolved_dir: PathBuf,
}

impl WatchedPaths {
    fn resolve(target: &Path) -> Result<Self, WatchError> {
        let target = std::path::absolute(target).unwrap_or_else(|_| target.to_path_buf());
        let dir = match target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => return Err(WatchError::NoParent { path: target }),
        };
        let resolved_dir = dir.canonicalize().unwrap_or_else(|_| dir.clone());
        Ok(Self {
            target,
            dir,
            resolved_dir,
        })
    }

    fn is_dir(&self, path: &Path) -> bool {
        path == self.dir || path == self.resolved_dir
    }

    fn is_target(&self, path: &Path) -> bool {
        if path == self.target {
            return true;
        }
        path.file_name() == self.target.file_name()
            && path.parent().is_some_and(|parent| self.is_dir(parent))
    }

    fn classify(&self, event: &Event) -> EventClass {
        if matches!(event.kind, EventKind::Access(_)) {
            return EventClass::Ignored;
        }

        if event.paths.iter().any(|path| self.is_target(path)) {
            return EventClass::Target;
        }

        let dir_removed = matches!(
            event.kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
        ) && event.paths.iter().any(|path| self.is_dir(path));
        if dir_removed {
            return EventClass::DirectoryGone;
        }

        if event.need_rescan() {
            return EventClass::Target;
        }

        EventClass::Ignored
    }
}

pub(crate) struct WatchLoop {
    target: PathBuf,
    scheduler: DebounceScheduler,
    guard: Arc<SuppressionGuard>,
    status: StatusReporter,
    backoff: Duration,
}

impl WatchLoop {
    pub(crate) fn new(
        target: PathBuf,
        scheduler: DebounceScheduler,
        guard: Arc<SuppressionGuard>,
        status: StatusReporter,
    ) -> Self {
        Self {
            target,
            scheduler,
            guard,
            status,
            backoff: RESUBSCRIBE_BACKOFF,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Runs until `shutdown` is cancelled. Subscription failures and
    /// invalidated handles are retried; they never end the loop.
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let mut failures = 0u32;
        let mut degraded = false;

        loop {
            let err = match self.subscribe() {
                Ok(subscription) => {
                    info!(
                        path = %subscription.paths.target.display(),
                        dir = %subscription.paths.dir.display(),
                        "watching"
                    );
                    if degraded {
                        info!("monitoring recovered");
                        self.status.recovered();
                        degraded = false;
                    }
                    if failures > 0 {
                        // changes may have slipped through while unsubscribed
                        self.scheduler.on_event();
                    }
                    failures = 0;

                    match self.pump(subscription, &shutdown).await {
                        PumpExit::Shutdown => break,
                        PumpExit::Invalidated(reason) => {
                            warn!(%reason, "watch invalidated, resubscribing");
                            self.scheduler.on_event();
                            continue;
                        }
                    }
                }
                Err(err) => err,
            };

            failures += 1;
            warn!(error = %err, attempt = failures, "watch subscription failed");
            if failures >= MAX_RESUBSCRIBE_ATTEMPTS && !degraded {
                self.status.degraded(err.to_string());
                degraded = true;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }

        debug!(path = %self.target.display(), "watch loop stopped");
    }

    fn subscribe(&self) -> Result<Subscription, WatchError> {
        let paths = WatchedPaths::resolve(&self.target)?;
        // The callback runs on the backend's event thread, which also serves
        // watch/unwatch requests. It must never block.
        let (tx, events) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )
        .map_err(|source| WatchError::Subscribe {
            path: paths.dir.clone(),
            source,
        })?;

        watcher
            .watch(&paths.dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Subscribe {
                path: paths.dir.clone(),
                source,
            })?;

        let mut subscription = Subscription {
            watcher,
            events,
            paths,
        };
        subscription.watch_file();
        Ok(subscription)
    }

    async fn pump(
        &self,
        mut subscription: Subscription,
        shutdown: &CancellationToken,
    ) -> PumpExit {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return PumpExit::Shutdown,
                received = subscription.events.recv() => {
                    let event = match received {
                        Some(Ok(event)) => event,
                        Some(Err(err)) => return PumpExit::Invalidated(err.to_string()),
                        None => {
                            return PumpExit::Invalidated("notification channel closed".into());
                        }
                    };

                    match subscription.paths.classify(&event) {
                        EventClass::Ignored => {}
                        EventClass::DirectoryGone => {
                            return PumpExit::Invalidated(format!(
                                "{} was removed or renamed",
                                subscription.paths.dir.display()
                            ));
                        }
                        EventClass::Target => {
                            let generation = self.scheduler.on_event();
                            let echo = self.guard.observe(generation);
                            debug!(kind = ?event.kind, generation, echo, "target changed");

                            let replaced = event.kind.is_create()
                                || matches!(event.kind, EventKind::Modify(ModifyKind::Name(_)));
                            if replaced {
                                subscription.watch_file();
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Subscription {
    /// Best effort: the directory watch already covers the file.
    fn watch_file(&mut self) {
        let target = &self.paths.target;
        if !target.exists() {
            return;
        }
        let _ = self.watcher.unwatch(target);
        if let Err(err) = self.watcher.watch(target, RecursiveMode::NonRecursive) {
            debug!(path = %target.display(), error = %err, "file-level watch unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::status::StatusEvent;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use std::fs;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    struct Running {
        fired: mpsc::UnboundedReceiver<u64>,
        status: StatusReporter,
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    }

    impl Running {
        async fn next_fire(&mut self) -> u64 {
            tokio::time::timeout(Duration::from_secs(5), self.fired.recv())
                .await
                .expect("timed out waiting for debounced event")
                .unwrap()
        }

        fn drain(&mut self) {
            while self.fired.try_recv().is_ok() {}
        }

        async fn stop(self) {
            self.shutdown.cancel();
            self.handle.await.unwrap();
        }
    }

    fn spawn_watch(target: PathBuf, delay: Duration, backoff: Duration) -> Running {
        let (tx, fired) = mpsc::unbounded_channel();
        let status = StatusReporter::new();
        let shutdown = CancellationToken::new();
        let watch = WatchLoop::new(
            target,
            DebounceScheduler::new(delay, tx),
            Arc::new(SuppressionGuard::default()),
            status.clone(),
        )
        .with_backoff(backoff);
        let handle = tokio::spawn(watch.run(shutdown.clone()));
        Running {
            fired,
            status,
            shutdown,
            handle,
        }
    }

    fn paths(dir: &Path) -> WatchedPaths {
        WatchedPaths::resolve(&dir.join("hosts")).unwrap()
    }

    fn event(kind: EventKind, path: PathBuf) -> Event {
        Event::new(kind).add_path(path)
    }

    #[test]
    fn events_for_target_qualify() {
        let dir = TempDir::new().unwrap();
        let paths = paths(dir.path());

        let modify = event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            dir.path().join("hosts"),
        );
        assert_eq!(paths.classify(&modify), EventClass::Target);

        let removed = event(EventKind::Remove(RemoveKind::File), dir.path().join("hosts"));
        assert_eq!(paths.classify(&removed), EventClass::Target);
    }

    #[test]
    fn siblings_and_access_events_are_ignored() {
        let dir = TempDir::new().unwrap();
        let paths = paths(dir.path());

        let sibling = event(EventKind::Create(CreateKind::File), dir.path().join("hosts.allow"));
        assert_eq!(paths.classify(&sibling), EventClass::Ignored);

        let access = event(
            EventKind::Access(notify::event::AccessKind::Any),
            dir.path().join("hosts"),
        );
        assert_eq!(paths.classify(&access), EventClass::Ignored);
    }

    #[test]
    fn temp_file_renamed_over_target_qualifies() {
        let dir = TempDir::new().unwrap();
        let paths = paths(dir.path());

        let kind = EventKind::Modify(ModifyKind::Name(notify::event::RenameMode::Both));
        let rename = Event::new(kind)
            .add_path(dir.path().join(".hostkeeper-abc.tmp"))
            .add_path(dir.path().join("hosts"));
        assert_eq!(paths.classify(&rename), EventClass::Target);
    }

    #[test]
    fn removing_the_directory_invalidates_the_watch() {
        let dir = TempDir::new().unwrap();
        let paths = paths(dir.path());

        let removed = event(EventKind::Remove(RemoveKind::Folder), dir.path().to_path_buf());
        assert_eq!(paths.classify(&removed), EventClass::DirectoryGone);
    }

    #[test]
    fn rescan_requests_qualify() {
        let dir = TempDir::new().unwrap();
        let paths = paths(dir.path());

        let rescan = Event::new(EventKind::Other).set_flag(notify::event::Flag::Rescan);
        assert_eq!(paths.classify(&rescan), EventClass::Target);
    }

    #[tokio::test]
    async fn file_changes_arm_the_scheduler() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("hosts");
        fs::write(&target, "a\n").unwrap();

        let (tx, mut fired) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = DebounceScheduler::new(Duration::from_millis(50), tx);
        let shutdown = CancellationToken::new();
        let watch = WatchLoop::new(
            target.clone(),
            scheduler.clone(),
            Arc::new(SuppressionGuard::default()),
            StatusReporter::new(),
        );
        let handle = tokio::spawn(watch.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        fs::remove_file(&target).unwrap();

        let generation = tokio::time::timeout(Duration::from_secs(2), fired.recv())
            .await
            .expect("timed out waiting for debounced event")
            .unwrap();
        assert!(generation >= 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn missing_directory_is_retried_until_it_appears() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("etc");
        let target = nested.join("hosts");

        let (tx, mut fired) = tokio::sync::mpsc::unbounded_channel();
        let scheduler = DebounceScheduler::new(Duration::from_millis(20), tx);
        let status = StatusReporter::new();
        let shutdown = CancellationToken::new();
        let watch = WatchLoop::new(
            target.clone(),
            scheduler,
            Arc::new(SuppressionGuard::default()),
            status,
        )
        .with_backoff(Duration::from_millis(50));
        let handle = tokio::spawn(watch.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(120)).await;
        fs::create_dir(&nested).unwrap();

        // the first successful subscription after failures arms one cycle
        let generation = tokio::time::timeout(Duration::from_secs(2), fired.recv())
            .await
            .expect("timed out waiting for resubscription")
            .unwrap();
        assert_eq!(generation, 1);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn renamed_directory_is_resubscribed() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("etc");
        fs::create_dir(&nested).unwrap();
        let target = nested.join("hosts");
        fs::write(&target, "a\n").unwrap();

        let mut running = spawn_watch(
            target.clone(),
            Duration::from_millis(20),
            Duration::from_millis(50),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        // the file itself is untouched; only losing the directory arms this cycle
        fs::rename(&nested, dir.path().join("etc.old")).unwrap();
        let invalidated = running.next_fire().await;

        fs::create_dir(&nested).unwrap();
        let resubscribed = running.next_fire().await;
        assert!(resubscribed > invalidated);

        tokio::time::sleep(Duration::from_millis(100)).await;
        running.drain();
        fs::write(&target, "b\n").unwrap();
        assert!(running.next_fire().await > resubscribed);

        running.stop().await;
    }

    #[tokio::test]
    async fn degraded_is_reported_once_then_recovered() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("etc");

        let running = spawn_watch(
            nested.join("hosts"),
            Duration::from_millis(20),
            Duration::from_millis(10),
        );
        let mut events = running.status.subscribe();

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for degraded")
            .unwrap();
        assert!(matches!(first, StatusEvent::Degraded { .. }), "{first:?}");

        // plenty of further failed attempts, none of them reported again
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(events.try_recv().is_err());

        fs::create_dir(&nested).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for recovery")
            .unwrap();
        assert_eq!(next, StatusEvent::Recovered);

        running.stop().await;
    }

    #[test]
    fn target_recreated_under_sibling_churn_is_still_seen() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        // a wedged loop would block its runtime, so the deadline is kept on this thread
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let dir = TempDir::new().unwrap();
                let target = dir.path().join("hosts");
                let mut running = spawn_watch(
                    target.clone(),
                    Duration::from_millis(50),
                    RESUBSCRIBE_BACKOFF,
                );
                tokio::time::sleep(Duration::from_millis(200)).await;

                // nothing here yields, so all of it queues up before the loop runs
                for i in 0..5 {
                    fs::write(dir.path().join(format!("sibling-{i}")), "x").unwrap();
                }
                fs::write(&target, "a\n").unwrap();
                for i in 5..600 {
                    fs::write(dir.path().join(format!("sibling-{i}")), "x").unwrap();
                }
                fs::remove_file(&target).unwrap();

                let generation = running.next_fire().await;
                running.stop().await;
                let _ = done_tx.send(generation);
            });
        });

        let generation = done_rx
            .recv_timeout(Duration::from_secs(20))
            .expect("watch loop stopped delivering notifications");
        // create, then at least the removal after it
        assert!(generation >= 2);
    }
}
