//! Caller-side control of a running story.

use super::RunnerState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Cheap, cloneable control surface for a [`Runner`](super::Runner).
///
/// `pause()` and `stop()` are cooperative: the runner observes them at the
/// top of each installment, so an in-flight generation call finishes first.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    stop: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
    state: watch::Receiver<RunnerState>,
}

impl RunnerHandle {
    pub(super) fn new(stop: CancellationToken, pause: Arc<watch::Sender<bool>>, state: watch::Receiver<RunnerState>) -> Self {
        Self { stop, pause, state }
    }

    pub fn pause(&self) {
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        self.pause.send_replace(false);
    }

    /// Stop the run. A stopped runner cannot be restarted; build a new one.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Current runner state.
    pub fn state(&self) -> RunnerState {
        self.state.borrow().clone()
    }

    /// Receiver that is notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<RunnerState> {
        self.state.clone()
    }

    /// The stop signal, for threading into retry backoff sleeps.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}
