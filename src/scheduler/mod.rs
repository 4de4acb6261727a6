//! Job schedulers.
//!
//! A [`Scheduler`] accepts units of [`Work`] and runs them on a
//! [`Runtime`](crate::runtime::Runtime) according to a policy:
//!
//! - [`PoolScheduler`]: every job runs as its own task, unordered
//! - [`SerialQueue`]: one job at a time, strict FIFO
//! - [`ConcurrentQueue`]: up to N jobs at a time, with barrier jobs
//! - [`BatchingQueue`]: drains its jobs one by one as a single job of
//!   another scheduler, with per-job retry policies
//! - [`TrappingScheduler`], [`ScopedScheduler`]: wrappers that divert
//!   failures or cancel everything on drop
//! - [`DurableQueue`]: persists queued items through a [`Store`]
//!
//! Every job gets its own [`Cx`]. [`Cancel::cancel`] on the returned handle
//! cancels that context: a queued job is removed from its queue without
//! running, a running job observes the cancellation at its next checkpoint.
//!
//! [`SchedulerExt`] turns a dispatch into an awaitable [`ScheduledTask`].
//!
//! # Example
//!
//! ```
//! use coopsync::runtime::{Runtime, RuntimeConfig};
//! use coopsync::scheduler::{SchedulerExt, SerialQueue};
//!
//! let runtime = Runtime::new(RuntimeConfig::with_workers(2))?;
//! let queue = SerialQueue::new(runtime.handle().spawner());
//!
//! let answer = runtime.block_on(queue.submit_and_wait((), |_cx| async { Ok(42) }));
//! assert_eq!(answer, Ok(42));
//! # Ok::<(), coopsync::runtime::BuildError>(())
//! ```

mod batching;
mod concurrent;
mod durable;
mod pool;
mod scoped;
mod serial;
mod task;
mod trapping;

pub use batching::{BatchJobConfig, BatchingQueue, RetryPolicy};
pub use concurrent::{ConcurrentJobConfig, ConcurrentQueue};
pub use durable::{DurableQueue, Identified, Store};
pub use pool::PoolScheduler;
pub use scoped::ScopedScheduler;
pub use serial::SerialQueue;
pub use task::ScheduledTask;
pub use trapping::{ErrorHandler, TrappingConfig, TrappingScheduler};

use futures_lite::future::Boxed;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cx::{Cx, WeakCx};
use crate::error::Error;

/// A reusable unit of work. Each call receives the job's context and
/// returns the future to run.
///
/// Work is `Fn` rather than `FnOnce` because a [`BatchingQueue`] may run a
/// failed job again.
pub type Work = Arc<dyn Fn(Cx) -> Boxed<Result<(), Error>> + Send + Sync>;

/// Wraps a closure into [`Work`].
pub fn work<F, Fut>(f: F) -> Work
where
    F: Fn(Cx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |cx: Cx| -> Boxed<Result<(), Error>> { Box::pin(f(cx)) })
}

/// Something that can be cancelled. Idempotent, and a no-op once the
/// target has finished.
pub trait Cancel {
    /// Requests cancellation.
    fn cancel(&self);
}

/// A job scheduler.
pub trait Scheduler: Send + Sync {
    /// Per-job configuration.
    type Config: Default + Clone + Send + Sync + 'static;
    /// Handle returned for each scheduled job.
    type Handle: Cancel + Send + Sync + 'static;

    /// Queues `work` and returns a handle that can cancel it.
    fn schedule(
        &self,
        config: Self::Config,
        work: Work,
    ) -> impl Future<Output = Self::Handle> + Send;

    /// Cancels every job scheduled so far: running jobs are cancelled and
    /// queued jobs are discarded without starting.
    fn cancel_all(&self);
}

/// Process-unique job identity, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Cancels one job through a weak reference to its context.
#[derive(Debug, Clone, Default)]
pub struct JobHandle {
    id: Option<JobId>,
    cx: WeakCx,
}

impl JobHandle {
    /// The job this handle refers to.
    #[must_use]
    pub fn id(&self) -> Option<JobId> {
        self.id
    }
}

impl Cancel for JobHandle {
    fn cancel(&self) {
        if let Some(id) = self.id {
            tracing::trace!(job = %id, "job cancel requested");
        }
        self.cx.cancel();
    }
}

/// A backlog that can give up a job that has not started.
pub(crate) trait Withdraw: Send + Sync {
    /// Removes job `id` if it is still queued. The removed job is dropped
    /// after the backlog is unlocked.
    fn withdraw(&self, id: JobId) -> bool;
}

impl<C: Send> Withdraw for Mutex<VecDeque<Job<C>>> {
    fn withdraw(&self, id: JobId) -> bool {
        let removed = {
            let mut jobs = self.lock();
            jobs.iter()
                .position(|job| job.id == id)
                .and_then(|index| jobs.remove(index))
        };
        removed.is_some()
    }
}

/// Handle for a job on a queueing scheduler.
///
/// Cancelling removes the job from its queue if it has not started, which
/// resolves its task straight away, and cancels its context if it runs.
#[derive(Clone)]
pub struct QueueHandle {
    job: JobHandle,
    queue: Weak<dyn Withdraw>,
}

impl QueueHandle {
    pub(crate) fn new(job: JobHandle, queue: Weak<dyn Withdraw>) -> Self {
        Self { job, queue }
    }

    /// The job this handle refers to.
    #[must_use]
    pub fn id(&self) -> Option<JobId> {
        self.job.id()
    }
}

impl Cancel for QueueHandle {
    fn cancel(&self) {
        self.job.cancel();
        let (Some(queue), Some(id)) = (self.queue.upgrade(), self.job.id()) else {
            return;
        };
        if queue.withdraw(id) {
            tracing::trace!(job = %id, "cancelled job withdrawn from queue");
        }
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle")
            .field("job", &self.job.id())
            .finish_non_exhaustive()
    }
}

/// A queued job.
#[derive(Clone)]
pub(crate) struct Job<C> {
    pub(crate) id: JobId,
    pub(crate) config: C,
    pub(crate) cx: Cx,
    pub(crate) work: Work,
}

impl<C> std::fmt::Debug for Job<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("cancelled", &self.cx.is_cancel_requested())
            .finish_non_exhaustive()
    }
}

impl<C> Job<C> {
    pub(crate) fn new(scope: &CancelScope, config: C, work: Work) -> (Self, JobHandle) {
        let cx = scope.job_cx();
        let id = JobId::next();
        let handle = JobHandle {
            id: Some(id),
            cx: cx.downgrade(),
        };
        (
            Self {
                id,
                config,
                cx,
                work,
            },
            handle,
        )
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cx.is_cancel_requested()
    }

    /// Runs the work unless the job was cancelled before starting.
    pub(crate) async fn run(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            tracing::trace!(job = %self.id, "discarding cancelled job");
            return Err(Error::Cancelled);
        }
        tracing::trace!(job = %self.id, "job started");
        let result = (self.work)(self.cx.clone()).await;
        match &result {
            Ok(()) => tracing::trace!(job = %self.id, "job finished"),
            Err(err) if err.is_cancelled() => {
                tracing::trace!(job = %self.id, "job cancelled");
            }
            Err(err) => tracing::debug!(job = %self.id, error = %err, "job failed"),
        }
        result
    }
}

/// Parent context for every job of one scheduler.
///
/// `cancel_all` cancels the current parent, which cancels every job created
/// under it, and installs a fresh one for jobs scheduled afterwards.
#[derive(Debug, Default)]
pub(crate) struct CancelScope {
    current: Mutex<Cx>,
}

impl CancelScope {
    pub(crate) fn job_cx(&self) -> Cx {
        self.current.lock().child()
    }

    pub(crate) fn cancel_all(&self) {
        let previous = std::mem::take(&mut *self.current.lock());
        previous.cancel();
    }
}

impl Drop for CancelScope {
    fn drop(&mut self) {
        self.current.get_mut().cancel();
    }
}

/// Extension methods available on every [`Scheduler`].
pub trait SchedulerExt: Scheduler {
    /// Schedules a closure as [`Work`].
    fn schedule_fn<F, Fut>(
        &self,
        config: Self::Config,
        f: F,
    ) -> impl Future<Output = Self::Handle> + Send
    where
        F: Fn(Cx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.schedule(config, work(f))
    }

    /// Schedules `f` and returns a task resolving to its result.
    ///
    /// The task resolves with `Err(Error::Cancelled)` if it is cancelled
    /// before the work starts.
    fn submit<R, F, Fut>(
        &self,
        config: Self::Config,
        f: F,
    ) -> impl Future<Output = ScheduledTask<R>> + Send
    where
        R: Send + 'static,
        F: Fn(Cx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        self.submit_or_else(config, || Err(Error::Cancelled), f)
    }

    /// Like [`submit`](Self::submit), resolving with `if_cancelled()` when
    /// cancelled before the work starts.
    fn submit_or_else<R, C, F, Fut>(
        &self,
        config: Self::Config,
        if_cancelled: C,
        f: F,
    ) -> impl Future<Output = ScheduledTask<R>> + Send
    where
        R: Send + 'static,
        C: Fn() -> Result<R, Error> + Send + Sync + 'static,
        F: Fn(Cx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        let (prepared, job) = task::prepare(if_cancelled, f);
        let dispatch = self.schedule(config, job);
        async move { prepared.attach(dispatch.await) }
    }

    /// Schedules `f` and waits for its result.
    fn submit_and_wait<R, F, Fut>(
        &self,
        config: Self::Config,
        f: F,
    ) -> impl Future<Output = Result<R, Error>> + Send
    where
        R: Send + 'static,
        F: Fn(Cx) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Error>> + Send + 'static,
    {
        let submitted = self.submit(config, f);
        async move { submitted.await.await }
    }

    /// Wraps this scheduler in a [`BatchingQueue`] whose drain jobs are
    /// scheduled with `batch_config`.
    fn batching(self, batch_config: Self::Config) -> BatchingQueue<Self>
    where
        Self: Sized + 'static,
    {
        BatchingQueue::new(self, batch_config)
    }

    /// Wraps this scheduler in a [`TrappingScheduler`].
    fn trapping(self, error_handler: ErrorHandler) -> TrappingScheduler<Self>
    where
        Self: Sized,
    {
        TrappingScheduler::new(self, error_handler)
    }

    /// Wraps this scheduler in a [`ScopedScheduler`].
    fn scoped(self) -> ScopedScheduler<Self>
    where
        Self: Sized,
    {
        ScopedScheduler::new(self)
    }
}

impl<S: Scheduler + ?Sized> SchedulerExt for S {}
