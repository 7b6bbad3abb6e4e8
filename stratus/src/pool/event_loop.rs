//! Runtime injected into the pool.

use crate::errors::{ConfigError, StratusError};
use parking_lot::Mutex;
use std::future::Future;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::info;

/// The runtime connections and executions are driven on.
///
/// Either owned, in which case [`shutdown`](Self::shutdown) stops it, or a
/// borrowed handle to a runtime managed elsewhere.
#[derive(Debug)]
pub struct EventLoop {
    handle: Handle,
    owned: Mutex<Option<Runtime>>,
}

impl EventLoop {
    /// Starts an owned multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for zero threads, or an I/O error if
    /// the runtime cannot start.
    pub fn new(worker_threads: usize) -> Result<Self, StratusError> {
        if worker_threads == 0 {
            return Err(ConfigError::new("event_loop_threads", "must be at least 1").into());
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name("stratus-event-loop")
            .enable_all()
            .build()?;
        info!(worker_threads, "Started event loop");
        Ok(Self {
            handle: runtime.handle().clone(),
            owned: Mutex::new(Some(runtime)),
        })
    }

    /// Borrows an existing runtime.
    #[must_use]
    pub fn borrowed(handle: Handle) -> Self {
        Self {
            handle,
            owned: Mutex::new(None),
        }
    }

    /// Borrows the runtime the caller is running on.
    ///
    /// # Errors
    ///
    /// Returns a configuration error outside a tokio runtime.
    pub fn current() -> Result<Self, StratusError> {
        Handle::try_current()
            .map(Self::borrowed)
            .map_err(|e| ConfigError::new("event_loop", e.to_string()).into())
    }

    /// Handle for spawning onto the loop.
    #[must_use]
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Returns true if the loop is owned and still running.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        self.owned.lock().is_some()
    }

    /// Spawns a task onto the loop.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Stops an owned loop without waiting for its tasks. No-op when borrowed.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.owned.lock().take() {
            runtime.shutdown_background();
            info!("Event loop shut down");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
