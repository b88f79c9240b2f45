// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};

///
/// Executors come in two flavors:
/// * "borrowed"
///     * Created with `Self::new()`.
///     * A borrowed Executor will not be shut down when all handles are dropped, and shutdown
///       methods will have no impact. Used in unit tests where the Runtime is created by the
///       `#[tokio::test]` macro.
/// * "owned"
///     * Created with `Self::new_owned()`.
///     * When all handles of an owned Executor are dropped, its Runtime will be shut down.
///       Used by the binary entrypoint, which owns the single process-wide runtime that backs
///       both scheduling threads and the worker pool.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    /// Creates an Executor for an existing tokio::Runtime (generally provided by tokio's macros).
    pub fn new() -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    /// Creates a new owned Executor with its own multi-threaded Runtime.
    pub fn new_owned(num_worker_threads: usize) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_worker_threads.max(1))
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;
        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    /// Creates a clone of this Executor which is disconnected from shutdown events.
    pub fn to_borrowed(&self) -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: self.handle.clone(),
        }
    }

    /// Spawn a Future on the Runtime and return a Future handle to it, recovering from a panic
    /// in the spawned task via the provided closure.
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    /// Spawn a Future on the Runtime as a new Task, and return its JoinHandle.
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    /// Run a Future to completion on this Executor's Runtime. Should not be called from within
    /// a Future already running on the Runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Returns a reference to this Executor's runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Blocking call to shut down the Runtime of an "owned" Executor. Has no effect on
    /// "borrowed" Executors. If tasks do not shut down within `timeout`, they are leaked.
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        let start = Instant::now();
        runtime.shutdown_timeout(timeout);
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    /// Returns true if `shutdown` has been called. Always true for borrowed Executors.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn borrowed_executor_spawns() {
        let executor = Executor::new();
        let result = executor
            .spawn(async { 1 + 1 }, |_| 0)
            .await;
        assert_eq!(result, 2);
    }

    #[test]
    fn owned_executor_blocks_on() {
        let executor = Executor::new_owned(1).unwrap();
        assert_eq!(executor.block_on(async { 21 * 2 }), 42);
        executor.shutdown(Duration::from_millis(500));
        assert!(executor.is_shutdown());
    }
}
