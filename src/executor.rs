//! A small fixed-size worker pool for listener callbacks, backoff waits and edge I/O.
use std::{
    future::Future,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Mutex, PoisonError},
};

use tokio::{
    runtime::{Builder, Handle, Runtime},
    task::JoinHandle,
};

/// Worker pool backed by a multi-threaded tokio runtime.
///
/// Shutting the pool down drops every queued and running task, which is how backoff waits are
/// interrupted on close. After shutdown, submissions are silently ignored.
pub struct Executor {
    name: String,
    runtime: Mutex<Option<Runtime>>,
}

impl Executor {
    pub fn new(name: &str, worker_threads: usize) -> std::io::Result<Executor> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name(name)
            .enable_all()
            .build()?;

        Ok(Executor {
            name: name.to_owned(),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    fn handle(&self) -> Option<Handle> {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|runtime| runtime.handle().clone())
    }

    /// Run a blocking callback on the pool. Panics inside `f` are caught and logged.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) {
        let name = self.name.clone();
        self.spawn(async move {
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                log::error!(target: "featurehub", executor = name.as_str(); "callback panicked");
            }
        });
    }

    /// Spawn a future on the pool. Returns `None` if the pool is shut down.
    pub fn spawn<F>(&self, future: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self.handle() {
            Some(handle) => Some(handle.spawn(future)),
            None => {
                log::trace!(target: "featurehub", executor = self.name.as_str(); "ignoring task submitted after shutdown");
                None
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stop the pool without waiting for running tasks. Calling it again is a no-op.
    pub fn shutdown(&self) {
        let runtime = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            log::debug!(target: "featurehub", executor = self.name.as_str(); "shutting down executor");
            // `shutdown_background` is safe to call from async contexts, unlike dropping.
            runtime.shutdown_background();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
