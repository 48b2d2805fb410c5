use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Duration;
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{self, Duration as StdDuration},
};

use crate::registry::Registry;

/// Background task that periodically evicts expired surveys.
///
/// The task only holds a weak handle to the registry, so it stops by itself
/// once the registry is dropped. It can also be cancelled, or triggered early.
pub struct Sweeper {
    task_handle: JoinHandle<()>,
    signal: Arc<Notify>,
    passes: Arc<AtomicU64>,
}

impl Sweeper {
    /// Start sweeping every `period`, removing surveys older than `max_age`.
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn(registry: Weak<Registry>, period: StdDuration, max_age: Duration) -> Self {
        let signal = Arc::new(Notify::new());
        let passes = Arc::new(AtomicU64::new(0));

        let task_signal = signal.clone();
        let task_passes = passes.clone();
        let task_handle = tokio::spawn(async move {
            info!(
                "Starting survey sweeper, timeout {} minutes",
                max_age.num_minutes()
            );
            loop {
                tokio::select! {
                    _ = time::sleep(period) => {}
                    _ = task_signal.notified() => {}
                }
                let registry = match registry.upgrade() {
                    Some(registry) => registry,
                    None => {
                        debug!("Registry is gone, stopping survey sweeper");
                        break;
                    }
                };
                sweep_once(&registry, max_age);
                task_passes.fetch_add(1, Ordering::SeqCst);
            }
        });

        Self {
            task_handle,
            signal,
            passes,
        }
    }

    /// Run a pass now instead of waiting for the period to elapse.
    pub fn trigger_now(&self) {
        self.signal.notify_one();
    }

    /// Stop sweeping. Surveys are no longer evicted afterwards.
    pub fn cancel(&self) {
        self.task_handle.abort();
    }

    /// Has the task stopped, either by cancellation or because the registry went away?
    pub fn is_finished(&self) -> bool {
        self.task_handle.is_finished()
    }

    /// Number of completed passes.
    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.task_handle.abort();
    }
}

/// One sweep pass. A panic must not take the loop down with it, so it is
/// caught and logged; the next pass runs as normal.
fn sweep_once(registry: &Registry, max_age: Duration) {
    if panic::catch_unwind(AssertUnwindSafe(|| registry.sweep(max_age))).is_err() {
        error!("Survey sweep panicked, retrying on the next pass");
    }
}
