//! Abort signal shared between an execution and its handle.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::warn;

type AbortCallback = Box<dyn Fn() + Send + Sync>;

/// A one-shot abort signal.
///
/// The first `abort` wins; its reason is kept and later calls are ignored.
#[derive(Default)]
pub struct AbortSignal {
    aborted: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: Mutex<Vec<AbortCallback>>,
    notify: Notify,
}

impl AbortSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Triggers the signal. Returns false if it was already triggered.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *self.reason.write() = Some(reason.into());
        self.notify.notify_waiters();

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in callbacks {
            run_callback(&callback);
        }
        true
    }

    /// Registers a callback run once on abort; runs it now if already aborted.
    pub fn on_abort<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: AbortCallback = Box::new(callback);
        {
            let mut callbacks = self.callbacks.lock();
            if !self.is_aborted() {
                callbacks.push(callback);
                return;
            }
        }
        run_callback(&callback);
    }

    /// Returns true once aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// The abort reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Resolves when the signal is triggered.
    pub async fn aborted(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }
}

fn run_callback(callback: &AbortCallback) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        warn!("Abort callback panicked: {:?}", panic);
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("reason", &self.reason())
            .finish()
    }
}
