use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::error::WriteError;

const STATUS_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusEvent {
    InSync,
    Disabled,
    Repaired { bytes: usize },
    WriteFailed { reason: String, permission_denied: bool },
    Degraded { reason: String },
    Recovered,
}

/// Where the target file stood after the most recent decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    InSync,
    Disabled,
    Failed,
}

/// Broadcasts status transitions to any number of listeners.
///
/// `InSync` and `Disabled` are only sent when the state changes, so an
/// evaluation that finds nothing to do stays silent.
#[derive(Clone, Debug)]
pub struct StatusReporter {
    tx: broadcast::Sender<StatusEvent>,
    last: Arc<Mutex<Option<SyncState>>>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusReporter {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(STATUS_CAPACITY);
        Self {
            tx,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Option<SyncState> {
        *self.last()
    }

    pub fn in_sync(&self) {
        if self.transition(SyncState::InSync) {
            self.emit(StatusEvent::InSync);
        }
    }

    pub fn disabled(&self) {
        if self.transition(SyncState::Disabled) {
            self.emit(StatusEvent::Disabled);
        }
    }

    pub fn repaired(&self, bytes: usize) {
        self.transition(SyncState::InSync);
        self.emit(StatusEvent::Repaired { bytes });
    }

    pub fn write_failed(&self, err: &WriteError) {
        self.transition(SyncState::Failed);
        self.emit(StatusEvent::WriteFailed {
            reason: error_chain(err),
            permission_denied: err.is_permission_denied(),
        });
    }

    pub fn degraded(&self, reason: impl Into<String>) {
        self.emit(StatusEvent::Degraded {
            reason: reason.into(),
        });
    }

    pub fn recovered(&self) {
        self.emit(StatusEvent::Recovered);
    }

    fn last(&self) -> MutexGuard<'_, Option<SyncState>> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: SyncState) -> bool {
        self.last().replace(next) != Some(next)
    }

    fn emit(&self, event: StatusEvent) {
        // no listeners is fine
        let _ = self.tx.send(event);
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut reason = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        reason.push_str(": ");
        reason.push_str(&cause.to_string());
        source = cause.source();
    }
    reason
}
