//! Cancel-and-restart debouncing of raw change notifications.
//!
//! Every call to [`DebounceScheduler::on_event`] aborts the armed timer, bumps
//! the generation and arms a fresh one. A timer that survives its full delay
//! hands its generation to the repair loop exactly once. A timer whose
//! generation is no longer current when it wakes does nothing, which closes the
//! race between an abort and a timer that already finished sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct TimerState {
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    delay_ms: AtomicU64,
    state: Mutex<TimerState>,
    fired: mpsc::UnboundedSender<u64>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, generation: u64) {
        let mut state = self.state();
        if state.generation != generation {
            debug!(generation, current = state.generation, "stale debounce timer");
            return;
        }
        state.pending = None;
        if self.fired.send(generation).is_err() {
            debug!(generation, "repair loop gone, dropping debounced event");
        }
    }
}

#[derive(Clone, Debug)]
pub struct DebounceScheduler {
    inner: Arc<Inner>,
}

impl DebounceScheduler {
    pub fn new(delay: Duration, fired: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            inner: Arc::new(Inner {
                delay_ms: AtomicU64::new(duration_ms(delay)),
                state: Mutex::new(TimerState::default()),
                fired,
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.inner.delay_ms.load(Ordering::Relaxed))
    }

    /// Takes effect the next time a timer is armed.
    pub fn set_delay(&self, delay: Duration) {
        self.inner.delay_ms.store(duration_ms(delay), Ordering::Relaxed);
    }

    /// Restarts the debounce window. Must be called from within a Tokio
    /// runtime. Returns the generation the new timer carries.
    pub fn on_event(&self) -> u64 {
        let mut state = self.inner.state();
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        let deadline = Instant::now() + self.delay();
        let inner = Arc::clone(&self.inner);

        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            inner.fire(generation);
        }));

        generation
    }

    /// Disarms the pending timer, if any. The generation is left untouched.
    pub fn cancel(&self) {
        if let Some(pending) = self.inner.state().pending.take() {
            pending.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.inner.state().pending.is_some()
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX).max(1)
}
