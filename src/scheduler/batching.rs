//! Draining a backlog as one job of another scheduler.

use futures_lite::future::Boxed;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Weak};

use super::{CancelScope, Job, JobId, QueueHandle, Scheduler, Withdraw, Work};
use crate::cx::Cx;
use crate::error::Error;

/// What a [`BatchingQueue`] does when a job fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Drop the failed job and continue with the next one.
    #[default]
    Discard,
    /// Keep the failed job at the front and dispatch a fresh drain, which
    /// runs it again before anything behind it.
    Retry,
    /// Stop draining. The failed job stays at the front and, with the rest
    /// of the backlog, waits for the next `schedule`.
    Abort,
}

/// Per-job configuration for a [`BatchingQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchJobConfig {
    /// Failure handling for this job.
    pub retry_policy: RetryPolicy,
}

impl BatchJobConfig {
    /// A configuration with the given policy.
    #[must_use]
    pub const fn new(retry_policy: RetryPolicy) -> Self {
        Self { retry_policy }
    }
}

/// Queues jobs and runs them one at a time inside a single "drain" job of
/// the wrapped scheduler.
///
/// The first `schedule` after the queue went idle dispatches a drain with
/// the batch configuration given at construction. The drain runs queued jobs
/// in order until the backlog is empty. A job whose context was cancelled is
/// discarded whatever its [`RetryPolicy`]; cancelling a queued job's handle
/// removes it from the backlog at once.
pub struct BatchingQueue<S: Scheduler> {
    inner: Arc<BatchingInner<S>>,
}

struct BatchingInner<S: Scheduler> {
    scheduler: S,
    batch_config: S::Config,
    state: Arc<Mutex<BatchState>>,
    scope: CancelScope,
}

#[derive(Default)]
struct BatchState {
    backlog: VecDeque<Job<BatchJobConfig>>,
    /// The job the drain is running.
    current: Option<JobId>,
    /// A drain is dispatched or running.
    running: bool,
    /// Bumped on every dispatch; a drain only resets `running` for its own
    /// epoch.
    epoch: u64,
}

impl BatchState {
    fn remove(&mut self, id: JobId) -> Option<Job<BatchJobConfig>> {
        let index = self.backlog.iter().position(|job| job.id == id)?;
        self.backlog.remove(index)
    }
}

impl Withdraw for Mutex<BatchState> {
    fn withdraw(&self, id: JobId) -> bool {
        let removed = {
            let mut state = self.lock();
            // The drain owns the job it is running.
            if state.current == Some(id) {
                None
            } else {
                state.remove(id)
            }
        };
        removed.is_some()
    }
}

impl std::fmt::Debug for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchState")
            .field("backlog", &self.backlog.len())
            .field("current", &self.current)
            .field("running", &self.running)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl<S: Scheduler + 'static> BatchingQueue<S> {
    /// Wraps `scheduler`. Drain jobs are scheduled with `batch_config`.
    pub fn new(scheduler: S, batch_config: S::Config) -> Self {
        Self {
            inner: Arc::new(BatchingInner {
                scheduler,
                batch_config,
                state: Arc::default(),
                scope: CancelScope::default(),
            }),
        }
    }

    /// Number of jobs waiting, including the one being run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    /// Returns true if no job is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while a drain is dispatched or running.
    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().running
    }
}

impl<S: Scheduler + 'static> BatchingInner<S> {
    async fn dispatch(self: &Arc<Self>, epoch: u64) {
        tracing::trace!(epoch, "dispatching batch drain");
        let drain = drain_work(Arc::downgrade(self), epoch);
        // Drains are never cancelled individually.
        let _ = self
            .scheduler
            .schedule(self.batch_config.clone(), drain)
            .await;
    }

    async fn drain(self: &Arc<Self>, epoch: u64) {
        loop {
            let job = {
                let mut state = self.state.lock();
                while state.backlog.front().is_some_and(Job::is_cancelled) {
                    if let Some(job) = state.backlog.pop_front() {
                        tracing::trace!(job = %job.id, "discarding cancelled job");
                    }
                }
                let Some(job) = state.backlog.front().cloned() else {
                    state.running = false;
                    state.current = None;
                    tracing::trace!(epoch, "batch drained");
                    return;
                };
                state.current = Some(job.id);
                job
            };

            let result = job.run().await;

            let next_epoch = {
                let mut state = self.state.lock();
                state.current = None;
                match result {
                    Ok(()) => {
                        state.remove(job.id);
                        None
                    }
                    Err(_) if job.is_cancelled() => {
                        state.remove(job.id);
                        None
                    }
                    Err(err) if err.is_cancelled() => {
                        state.remove(job.id);
                        None
                    }
                    Err(err) => match job.config.retry_policy {
                        RetryPolicy::Discard => {
                            tracing::debug!(job = %job.id, error = %err, "discarding failed job");
                            state.remove(job.id);
                            None
                        }
                        RetryPolicy::Retry => {
                            tracing::debug!(job = %job.id, error = %err, "retrying failed job");
                            state.epoch += 1;
                            Some(state.epoch)
                        }
                        RetryPolicy::Abort => {
                            tracing::warn!(
                                job = %job.id,
                                error = %err,
                                remaining = state.backlog.len(),
                                "batch aborted"
                            );
                            state.running = false;
                            return;
                        }
                    },
                }
            };
            drop(job);

            if let Some(next_epoch) = next_epoch {
                self.dispatch(next_epoch).await;
                return;
            }
        }
    }
}

/// Resets `running` if a drain is dropped before finishing, so the next
/// `schedule` dispatches a fresh one.
struct DrainGuard<S: Scheduler> {
    inner: Weak<BatchingInner<S>>,
    epoch: u64,
}

impl<S: Scheduler> Drop for DrainGuard<S> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state.lock();
        if state.epoch == self.epoch && state.running {
            tracing::debug!(epoch = self.epoch, "batch drain dropped before finishing");
            state.running = false;
            state.current = None;
        }
    }
}

fn drain_work<S: Scheduler + 'static>(inner: Weak<BatchingInner<S>>, epoch: u64) -> Work {
    let guard = Arc::new(DrainGuard { inner, epoch });
    Arc::new(move |_cx: Cx| -> Boxed<Result<(), Error>> {
        let guard = Arc::clone(&guard);
        Box::pin(async move {
            if let Some(inner) = guard.inner.upgrade() {
                inner.drain(guard.epoch).await;
            }
            Ok(())
        })
    })
}

impl<S: Scheduler + 'static> Scheduler for BatchingQueue<S> {
    type Config = BatchJobConfig;
    type Handle = QueueHandle;

    fn schedule(
        &self,
        config: BatchJobConfig,
        work: Work,
    ) -> impl Future<Output = QueueHandle> + Send {
        let (job, handle) = Job::new(&self.inner.scope, config, work);
        let dispatch = {
            let mut state = self.inner.state.lock();
            state.backlog.push_back(job);
            if state.running {
                None
            } else {
                state.running = true;
                state.epoch += 1;
                Some(state.epoch)
            }
        };
        let state: Weak<dyn Withdraw> = Arc::downgrade(&self.inner.state) as Weak<_>;
        let handle = QueueHandle::new(handle, state);
        async move {
            if let Some(epoch) = dispatch {
                self.inner.dispatch(epoch).await;
            }
            handle
        }
    }

    fn cancel_all(&self) {
        self.inner.scope.cancel_all();
        let discarded = std::mem::take(&mut self.inner.state.lock().backlog);
        tracing::debug!(discarded = discarded.len(), "batching queue cancelled all jobs");
    }
}

impl<S: Scheduler> std::fmt::Debug for BatchingQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchingQueue")
            .field("state", &*self.inner.state.lock())
            .finish_non_exhaustive()
    }
}
