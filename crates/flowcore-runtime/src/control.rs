//! Pause/resume/cancel flags shared between a `WorkflowRunner::run` call and
//! whatever external handle the host keeps around while it's in flight.
//! Pausing and resuming simply flips these state flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Cheaply `Clone`-able: every clone shares the same underlying flags, so a
/// handle obtained before `run()` starts observes pause/cancel requests
/// made while it's executing.
#[derive(Clone)]
pub struct RunnerControl {
    paused: Arc<AtomicBool>,
    notify: Arc<Notify>,
    cancel: CancellationToken,
}

impl Default for RunnerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerControl {
    pub fn new() -> Self {
        RunnerControl {
            paused: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        // Unblock a paused run so it can observe the cancellation promptly
        // rather than waiting for a `resume()` that may never come.
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cloned into each task attempt's `ExecutorOptions::signal` so a single
    /// `cancel()` call aborts every in-flight and future attempt at once.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Blocks until either resumed or cancelled. A no-op if not paused.
    pub async fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_cancelled() {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => {}
            }
        }
    }
}
