//! Worker threads, the global injector and idle parking.

use crossbeam_queue::SegQueue;
use futures_lite::future::Boxed;
use parking_lot::{Condvar, Mutex};
use slab::Slab;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::task::Task;

/// State shared by every worker and handle of one runtime.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    /// Runnable tasks, in wake order.
    injector: SegQueue<Arc<Task>>,
    /// Spawned tasks that have not completed, so shutdown can drop them.
    live: Mutex<Slab<Arc<Task>>>,
    /// Guards the sleep/wake handshake; the value is the number of parked
    /// workers.
    idle: Mutex<usize>,
    unparked: Condvar,
    shutdown: AtomicBool,
    next_task_id: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn spawn(self: &Arc<Self>, future: Boxed<()>) {
        if self.is_shutdown() {
            tracing::debug!("spawn after shutdown, dropping future");
            return;
        }
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let task = {
            let mut live = self.live.lock();
            let entry = live.vacant_entry();
            let task = Task::new(id, entry.key(), future, Arc::clone(self));
            entry.insert(Arc::clone(&task));
            task
        };
        tracing::trace!(task = id, "task spawned");
        self.push(task);
    }

    /// Queues a runnable task and wakes one parked worker.
    pub(crate) fn push(&self, task: Arc<Task>) {
        if self.is_shutdown() {
            return;
        }
        self.injector.push(task);
        let idle = self.idle.lock();
        if *idle > 0 {
            self.unparked.notify_one();
        }
    }

    pub(crate) fn task_done(&self, key: usize) {
        let task = self.live.lock().try_remove(key);
        if let Some(task) = task {
            tracing::trace!(task = task.id(), "task complete");
        }
    }

    /// Number of spawned tasks that have not completed.
    pub(crate) fn live_tasks(&self) -> usize {
        self.live.lock().len()
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _idle = self.idle.lock();
        self.unparked.notify_all();
    }

    /// Drops every unfinished task. Workers must have exited.
    pub(crate) fn drain(&self) {
        let tasks: Vec<Arc<Task>> = self.live.lock().drain().collect();
        let dropped = tasks.len();
        // Dropping a future may wake or spawn other tasks; the lock is not
        // held here and both paths are no-ops after shutdown.
        for task in &tasks {
            task.cancel();
        }
        drop(tasks);
        while self.injector.pop().is_some() {}
        if dropped > 0 {
            tracing::debug!(dropped, "unfinished tasks dropped at shutdown");
        }
    }
}

/// One worker thread's loop.
pub(crate) struct Worker {
    index: usize,
    shared: Arc<Shared>,
}

impl Worker {
    pub(crate) fn new(index: usize, shared: Arc<Shared>) -> Self {
        Self { index, shared }
    }

    /// Runs tasks until shutdown, parking while the injector is empty.
    pub(crate) fn run_loop(self) {
        tracing::debug!(worker = self.index, "worker started");
        loop {
            if let Some(task) = self.shared.injector.pop() {
                task.run();
                continue;
            }

            let mut idle = self.shared.idle.lock();
            if self.shared.is_shutdown() {
                break;
            }
            // Re-check under the lock `push` takes before notifying.
            if !self.shared.injector.is_empty() {
                continue;
            }
            *idle += 1;
            self.shared.unparked.wait(&mut idle);
            *idle -= 1;
        }
        tracing::debug!(worker = self.index, "worker stopped");
    }
}
