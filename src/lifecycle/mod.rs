//! Drives shutdown-on-completion versus persistent operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Watches transfer completion and decides when the process should exit.
///
/// When a non-persistent transfer completes and the stay-open flag is off, a
/// cancellable countdown starts; once it elapses the shutdown token fires.
/// Toggling stay-open on, or a new transfer starting, aborts the countdown.
pub struct LifecycleController {
    stay_open: AtomicBool,
    grace: Duration,
    shutdown: CancellationToken,
    countdown: Mutex<Option<CancellationToken>>,
}

impl LifecycleController {
    pub fn new(stay_open: bool, grace: Duration) -> Self {
        Self {
            stay_open: AtomicBool::new(stay_open),
            grace,
            shutdown: CancellationToken::new(),
            countdown: Mutex::new(None),
        }
    }

    pub fn stay_open(&self) -> bool {
        self.stay_open.load(Ordering::SeqCst)
    }

    /// Operator toggle. Turning stay-open on aborts any pending countdown.
    pub fn set_stay_open(&self, value: bool) {
        self.stay_open.store(value, Ordering::SeqCst);
        if value {
            self.abort_countdown();
        }
    }

    /// Token that fires when the process should exit.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Immediate shutdown, skipping any countdown.
    pub fn request_shutdown(&self) {
        self.abort_countdown();
        self.shutdown.cancel();
    }

    /// A new transfer begins: any countdown in flight is aborted.
    pub fn transfer_started(&self) {
        self.abort_countdown();
    }

    /// A transfer reached `Completed`. Starts the countdown unless the
    /// session is persistent or the operator wants the server kept open.
    pub fn transfer_completed(self: &Arc<Self>, persistent: bool) {
        if persistent || self.stay_open() {
            return;
        }

        let token = CancellationToken::new();
        {
            let mut slot = lock_clean(&self.countdown);
            if let Some(previous) = slot.take() {
                previous.cancel();
            }
            *slot = Some(token.clone());
        }

        let controller = self.clone();
        let grace = self.grace;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("shutdown countdown aborted");
                }
                _ = tokio::time::sleep(grace) => {
                    tracing::info!("transfer complete, shutting down");
                    controller.shutdown.cancel();
                }
            }
        });
    }

    fn abort_countdown(&self) {
        if let Some(token) = lock_clean(&self.countdown).take() {
            token.cancel();
        }
    }
}

fn lock_clean<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("lifecycle lock poisoned, recovering");
            poisoned.into_inner()
        }
    }
}
