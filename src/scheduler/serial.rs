//! One-at-a-time FIFO scheduling.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};

use super::{CancelScope, Job, QueueHandle, Scheduler, Withdraw, Work};
use crate::cx::Cx;
use crate::runtime::Spawn;
use crate::sync::{Condvar, Mutex};

type Backlog = parking_lot::Mutex<VecDeque<Job<()>>>;

/// Runs jobs one at a time in the order they were scheduled.
///
/// A single runner task owns the queue: it waits on a condition variable
/// while the backlog is empty and runs each job to completion before taking
/// the next. A job is never started while an earlier one is still running,
/// even if the earlier job suspends.
///
/// Cancelling a queued job removes it from the backlog at once. Dropping the
/// queue cancels every job and stops the runner.
pub struct SerialQueue {
    inner: Arc<SerialInner>,
    runner: Cx,
}

struct SerialInner {
    backlog: Arc<Backlog>,
    /// Held by the runner while it decides to sleep.
    gate: Mutex<()>,
    ready: Condvar,
    scope: CancelScope,
}

impl SerialQueue {
    /// Creates a queue whose runner is spawned onto `spawner`.
    #[must_use]
    pub fn new(spawner: Arc<dyn Spawn>) -> Self {
        let inner = Arc::new(SerialInner {
            backlog: Arc::default(),
            gate: Mutex::new(()),
            ready: Condvar::new(),
            scope: CancelScope::default(),
        });
        let runner = Cx::new();
        spawner.spawn_boxed(Box::pin(run(Arc::clone(&inner), runner.clone())));
        Self { inner, runner }
    }

    /// Number of jobs waiting to start.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.backlog.lock().len()
    }

    /// Returns true if no job is waiting to start.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn run(inner: Arc<SerialInner>, cx: Cx) {
    tracing::trace!("serial runner started");
    loop {
        let Ok(gate) = inner.gate.lock(&cx).await else {
            break;
        };
        let Ok(gate) = inner
            .ready
            .wait_until(&cx, &inner.gate, gate, |_| !inner.backlog.lock().is_empty())
            .await
        else {
            break;
        };
        let job = inner.backlog.lock().pop_front();
        drop(gate);

        // None if the job was withdrawn after the check.
        if let Some(job) = job {
            let _ = job.run().await;
        }
    }
    tracing::trace!("serial runner stopped");
}

impl Scheduler for SerialQueue {
    type Config = ();
    type Handle = QueueHandle;

    fn schedule(&self, (): (), work: Work) -> impl Future<Output = QueueHandle> + Send {
        let (job, handle) = Job::new(&self.inner.scope, (), work);
        let backlog: Weak<dyn Withdraw> = Arc::downgrade(&self.inner.backlog) as Weak<_>;
        let handle = QueueHandle::new(handle, backlog);
        async move {
            self.inner.backlog.lock().push_back(job);
            // Passing through the gate orders the push against a runner that
            // is deciding to sleep.
            drop(self.inner.gate.lock_uncancelled().await);
            self.inner.ready.notify_one();
            handle
        }
    }

    fn cancel_all(&self) {
        self.inner.scope.cancel_all();
        let discarded = std::mem::take(&mut *self.inner.backlog.lock());
        tracing::debug!(discarded = discarded.len(), "serial queue cancelled all jobs");
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.cancel_all();
        self.runner.cancel();
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("queued", &self.len())
            .field("stopped", &self.runner.is_cancel_requested())
            .finish_non_exhaustive()
    }
}
