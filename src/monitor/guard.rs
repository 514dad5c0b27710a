use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest as _, Sha256};
use tokio::time::Instant;
use tracing::debug;

/// How long notifications after a repair write are attributed to that write.
pub const SUPPRESSION_GRACE: Duration = Duration::from_millis(500);

pub type Digest = [u8; 32];

pub fn digest(bytes: &[u8]) -> Digest {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GuardState {
    Idle,
    Suppressing {
        opened_at: Instant,
        written: Digest,
        /// Debounce generation of the latest notification seen inside the window.
        echo: Option<u64>,
    },
}

/// Recognises notifications caused by our own repair writes.
///
/// The guard never drops events: the scheduler restarts on every raw
/// notification regardless of guard state. It only tells the decision step
/// that a debounced cycle was triggered purely by our write, and that the
/// bytes on disk are still exactly what we wrote.
#[derive(Debug)]
pub struct SuppressionGuard {
    grace: Duration,
    state: Mutex<GuardState>,
}

impl Default for SuppressionGuard {
    fn default() -> Self {
        Self::new(SUPPRESSION_GRACE)
    }
}

impl SuppressionGuard {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            state: Mutex::new(GuardState::Idle),
        }
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Called right before the repair writer touches the file.
    pub fn open(&self, written: Digest) {
        *self.state() = GuardState::Suppressing {
            opened_at: Instant::now(),
            written,
            echo: None,
        };
    }

    pub fn close(&self) {
        *self.state() = GuardState::Idle;
    }

    pub fn is_suppressing(&self) -> bool {
        matches!(*self.state(), GuardState::Suppressing { .. })
    }

    /// Records a raw notification that restarted the debounce timer as
    /// `generation`. Returns true when it was attributed to our own write.
    pub fn observe(&self, generation: u64) -> bool {
        let mut state = self.state();
        match *state {
            GuardState::Suppressing {
                opened_at,
                written,
                ..
            } if opened_at.elapsed() <= self.grace => {
                *state = GuardState::Suppressing {
                    opened_at,
                    written,
                    echo: Some(generation),
                };
                true
            }
            GuardState::Suppressing { .. } => {
                debug!(generation, "suppression window elapsed");
                *state = GuardState::Idle;
                false
            }
            GuardState::Idle => false,
        }
    }

    /// Asked by the decision step when the debounce timer for `generation`
    /// fires. Consumes the window when the generation matches; the cycle is an
    /// echo only if the file still hashes to what was written.
    pub fn is_echo(&self, generation: u64, on_disk: Option<&Digest>) -> bool {
        let mut state = self.state();
        let GuardState::Suppressing {
            opened_at,
            written,
            echo,
        } = *state
        else {
            return false;
        };

        match echo {
            Some(echo) if echo == generation => {
                *state = GuardState::Idle;
                let unchanged = on_disk == Some(&written);
                if !unchanged {
                    debug!(
                        generation,
                        written = %hex::encode(&written[..6]),
                        "file changed again inside the suppression window"
                    );
                }
                unchanged
            }
            Some(echo) if echo > generation => false,
            Some(_) => {
                *state = GuardState::Idle;
                false
            }
            None => {
                if opened_at.elapsed() > self.grace {
                    *state = GuardState::Idle;
                }
                false
            }
        }
    }
}
