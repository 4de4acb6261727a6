//! A small multi-threaded executor.
//!
//! The schedulers in [`crate::scheduler`] run their jobs as tasks on a
//! [`Runtime`]. Workers pull runnable tasks from one global injector in wake
//! order and park on a condition variable while it is empty. Task panics are
//! caught and logged; the worker keeps running.
//!
//! # Example
//!
//! ```
//! use coopsync::runtime::{Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::with_workers(2))?;
//! let join = runtime.handle().spawn(async { 6 * 7 });
//! assert_eq!(runtime.block_on(join), Ok(42));
//! # Ok::<(), coopsync::runtime::BuildError>(())
//! ```

mod task;
mod worker;
mod yield_now;

pub use crate::config::{ConfigError, RuntimeConfig};
pub use yield_now::{YieldNow, yield_now};

use futures_lite::future::Boxed;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle as ThreadHandle;

use crate::error::Cancelled;
use crate::sync::waiter::{Suspended, resumption};
use worker::{Shared, Worker};

/// Error returned by [`Runtime::new`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Something that can run detached futures.
///
/// The schedulers are written against this trait rather than a concrete
/// runtime.
pub trait Spawn: Send + Sync {
    /// Runs `future` to completion in the background.
    fn spawn_boxed(&self, future: Boxed<()>);
}

/// A running executor. Dropping it stops the workers and drops every
/// unfinished task.
#[derive(Debug)]
pub struct Runtime {
    handle: Handle,
    workers: Vec<ThreadHandle<()>>,
}

impl Runtime {
    /// Starts the worker threads described by `config`.
    pub fn new(mut config: RuntimeConfig) -> Result<Self, BuildError> {
        config.normalize();
        config.validate()?;

        let shared = Shared::new();
        let mut workers = Vec::with_capacity(config.worker_threads);
        for index in 0..config.worker_threads {
            let worker = Worker::new(index, Arc::clone(&shared));
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{index}", config.thread_name_prefix))
                .stack_size(config.thread_stack_size)
                .spawn(move || worker.run_loop());
            match spawned {
                Ok(thread) => workers.push(thread),
                Err(err) => {
                    shared.begin_shutdown();
                    for thread in workers {
                        let _ = thread.join();
                    }
                    return Err(err.into());
                }
            }
        }
        tracing::debug!(workers = config.worker_threads, "runtime started");

        Ok(Self {
            handle: Handle { shared },
            workers,
        })
    }

    /// Returns a handle for spawning onto this runtime.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Runs `future` on the calling thread until it completes. Spawned tasks
    /// keep running on the workers meanwhile.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        futures_lite::future::block_on(future)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let shared = &self.handle.shared;
        shared.begin_shutdown();
        for thread in self.workers.drain(..) {
            if thread.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        shared.drain();
        tracing::debug!("runtime stopped");
    }
}

/// A cloneable handle to a [`Runtime`].
#[derive(Debug, Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    /// Spawns `future` and returns a handle to await its output.
    ///
    /// The task keeps running if the [`JoinHandle`] is dropped.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (resumer, suspended) = resumption();
        self.shared.spawn(Box::pin(async move {
            let output = future.await;
            if let Some(waker) = resumer.resume(output) {
                waker.wake();
            }
        }));
        JoinHandle { output: suspended }
    }

    /// Number of spawned tasks that have not completed.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.shared.live_tasks()
    }

    /// This handle as a shared [`Spawn`], the form schedulers take.
    #[must_use]
    pub fn spawner(&self) -> Arc<dyn Spawn> {
        Arc::new(self.clone())
    }
}

impl Spawn for Handle {
    fn spawn_boxed(&self, future: Boxed<()>) {
        self.shared.spawn(future);
    }
}

/// Awaits the output of a spawned task.
///
/// Resolves with [`Cancelled`] if the task panicked or was dropped at
/// shutdown.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct JoinHandle<T> {
    output: Suspended<T>,
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.output
            .poll_resumed(cx.waker())
            .map(|output| output.ok_or(Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test;

    fn runtime(workers: usize) -> Runtime {
        Runtime::new(RuntimeConfig::with_workers(workers)).expect("runtime")
    }

    #[test]
    fn spawn_and_join() {
        init_test("spawn_and_join");
        let rt = runtime(2);
        let handles: Vec<_> = (0..8_u32).map(|i| rt.handle().spawn(async move { i * 2 })).collect();
        let sum: u32 = handles
            .into_iter()
            .map(|h| rt.block_on(h).expect("task completed"))
            .sum();
        crate::assert_with_log!(sum == 56, "sum of doubled", 56, sum);
        crate::test_complete!("spawn_and_join");
    }

    #[test]
    fn panicking_task_is_contained() {
        init_test("panicking_task_is_contained");
        let rt = runtime(1);
        let failed = rt.handle().spawn(async {
            panic!("boom");
        });
        let result: Result<(), Cancelled> = rt.block_on(failed);
        assert_eq!(result, Err(Cancelled));

        let ok = rt.block_on(rt.handle().spawn(async { 1 }));
        crate::assert_with_log!(ok == Ok(1), "worker survives", Ok::<i32, Cancelled>(1), ok);
        crate::test_complete!("panicking_task_is_contained");
    }

    #[test]
    fn yield_now_lets_others_run() {
        let rt = runtime(1);
        let a = rt.handle().spawn(async {
            for _ in 0..3 {
                yield_now().await;
            }
            "a"
        });
        let b = rt.handle().spawn(async { "b" });
        assert_eq!(rt.block_on(b), Ok("b"));
        assert_eq!(rt.block_on(a), Ok("a"));
    }

    #[test]
    fn drop_cancels_pending_tasks() {
        let rt = runtime(1);
        let join = rt.handle().spawn(futures_lite::future::pending::<()>());
        drop(rt);
        assert_eq!(futures_lite::future::block_on(join), Err(Cancelled));
    }

    #[test]
    fn invalid_config_rejected() {
        let config = RuntimeConfig {
            thread_stack_size: 1024,
            ..RuntimeConfig::with_workers(1)
        };
        assert!(matches!(Runtime::new(config), Err(BuildError::Config(_))));
    }
}
