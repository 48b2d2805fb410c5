use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// A single-shot broadcast signal that long-poll waiters block on.
///
/// A gate fires at most once and then stays fired; waiting on a fired gate
/// returns immediately. Surveys replace their gate every time they change,
/// so a wakeup only says "something changed", never what.
#[derive(Debug, Default)]
pub struct Gate {
    fired: AtomicBool,
    notify: Notify,
}

impl Gate {
    /// A fresh, unfired gate.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A gate that has already fired, for callers that are already behind.
    pub fn fired() -> Arc<Self> {
        let gate = Self::default();
        gate.fired.store(true, Ordering::SeqCst);
        Arc::new(gate)
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Fire the gate, waking every waiter.
    /// Returns false if it had already fired, in which case nothing happens.
    pub(crate) fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    /// Wait until the gate fires.
    pub async fn wait(&self) {
        // Register before checking the flag, so a concurrent `fire` cannot slip
        // in between the check and the registration.
        let notified = self.notify.notified();
        if self.is_fired() {
            return;
        }
        notified.await;
    }

    /// Wait until the gate fires or `timeout` elapses.
    /// Returns true iff the gate fired.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok() || self.is_fired()
    }
}
