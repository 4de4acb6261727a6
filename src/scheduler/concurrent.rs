//! Bounded-parallel scheduling with barrier jobs.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};

use super::{CancelScope, Job, JobId, QueueHandle, Scheduler, Withdraw, Work};
use crate::runtime::Spawn;

/// Per-job configuration for a [`ConcurrentQueue`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConcurrentJobConfig {
    /// Run this job alone: it starts only once nothing else runs, and
    /// nothing else starts until it finishes.
    pub barrier: bool,
}

impl ConcurrentJobConfig {
    /// A barrier job.
    pub const BARRIER: Self = Self { barrier: true };
}

/// Runs up to `max_concurrency` jobs at a time from one FIFO backlog.
///
/// Runners are tasks on the runtime, started on demand and stopped once the
/// backlog is empty or blocked. Jobs start in scheduling order; a barrier job
/// waits for every earlier job to finish and holds back every later one.
/// Cancelling a job that has not started removes it from the backlog.
pub struct ConcurrentQueue {
    inner: Arc<ConcurrentInner>,
}

struct ConcurrentInner {
    state: Arc<Mutex<ConcurrentState>>,
    scope: CancelScope,
    spawner: Arc<dyn Spawn>,
    max_concurrency: usize,
}

#[derive(Default)]
struct ConcurrentState {
    backlog: VecDeque<Job<ConcurrentJobConfig>>,
    running: HashSet<JobId>,
    barrier_running: bool,
    runners: usize,
}

impl ConcurrentState {
    /// Pops the next job a runner may start, or `None` if the backlog is
    /// empty or blocked by a barrier.
    fn next_ready(&mut self) -> Option<Job<ConcurrentJobConfig>> {
        while self.backlog.front().is_some_and(Job::is_cancelled) {
            if let Some(job) = self.backlog.pop_front() {
                tracing::trace!(job = %job.id, "discarding cancelled job");
            }
        }
        if self.barrier_running {
            return None;
        }
        let front = self.backlog.front()?;
        if front.config.barrier && !self.running.is_empty() {
            return None;
        }
        let job = self.backlog.pop_front()?;
        self.running.insert(job.id);
        self.barrier_running = job.config.barrier;
        Some(job)
    }

    /// Non-barrier jobs at the head of the backlog.
    fn leading_parallel(&self) -> usize {
        self.backlog
            .iter()
            .filter(|job| !job.is_cancelled())
            .take_while(|job| !job.config.barrier)
            .count()
    }
}

impl ConcurrentQueue {
    /// Creates a queue running at most `max_concurrency` jobs at once.
    ///
    /// # Panics
    ///
    /// Panics if `max_concurrency` is zero.
    #[must_use]
    pub fn new(spawner: Arc<dyn Spawn>, max_concurrency: usize) -> Self {
        assert!(max_concurrency > 0, "max_concurrency must be at least 1");
        Self {
            inner: Arc::new(ConcurrentInner {
                state: Arc::default(),
                scope: CancelScope::default(),
                spawner,
                max_concurrency,
            }),
        }
    }

    /// The concurrency limit.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Number of jobs waiting to start.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().backlog.len()
    }

    /// Returns true if no job is waiting to start.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Withdraw for Mutex<ConcurrentState> {
    fn withdraw(&self, id: JobId) -> bool {
        let removed = {
            let mut state = self.lock();
            let index = state.backlog.iter().position(|job| job.id == id);
            index.and_then(|index| state.backlog.remove(index))
        };
        removed.is_some()
    }
}

impl ConcurrentInner {
    fn start_runner(self: &Arc<Self>, state: &mut ConcurrentState) {
        state.runners += 1;
        tracing::trace!(runners = state.runners, "starting runner");
        self.spawner.spawn_boxed(Box::pin(run(Arc::clone(self))));
    }
}

async fn run(inner: Arc<ConcurrentInner>) {
    let mut finished: Option<Job<ConcurrentJobConfig>> = None;
    loop {
        let next = {
            let mut state = inner.state.lock();
            if let Some(job) = &finished {
                state.running.remove(&job.id);
                if job.config.barrier {
                    state.barrier_running = false;
                    let free = inner.max_concurrency - state.runners;
                    let extra = state.leading_parallel().saturating_sub(1).min(free);
                    if extra > 0 {
                        tracing::debug!(job = %job.id, extra, "barrier finished, restoring parallelism");
                    }
                    for _ in 0..extra {
                        inner.start_runner(&mut state);
                    }
                }
            }
            let next = state.next_ready();
            if next.is_none() {
                state.runners -= 1;
                tracing::trace!(runners = state.runners, "runner stopped");
            }
            next
        };
        drop(finished.take());
        let Some(job) = next else {
            break;
        };
        let _ = job.run().await;
        finished = Some(job);
    }
}

impl Scheduler for ConcurrentQueue {
    type Config = ConcurrentJobConfig;
    type Handle = QueueHandle;

    fn schedule(
        &self,
        config: ConcurrentJobConfig,
        work: Work,
    ) -> impl Future<Output = QueueHandle> + Send {
        let (job, handle) = Job::new(&self.inner.scope, config, work);
        {
            let mut state = self.inner.state.lock();
            state.backlog.push_back(job);
            if state.runners < self.inner.max_concurrency {
                self.inner.start_runner(&mut state);
            }
        }
        let state: Weak<dyn Withdraw> = Arc::downgrade(&self.inner.state) as Weak<_>;
        std::future::ready(QueueHandle::new(handle, state))
    }

    fn cancel_all(&self) {
        self.inner.scope.cancel_all();
        let discarded = std::mem::take(&mut self.inner.state.lock().backlog);
        tracing::debug!(discarded = discarded.len(), "concurrent queue cancelled all jobs");
    }
}

impl Drop for ConcurrentQueue {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

impl std::fmt::Debug for ConcurrentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("max_concurrency", &self.inner.max_concurrency)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::scheduler::{Cancel, SchedulerExt, work};
    use crate::test_utils::{ManualSpawner, init_test};
    use futures_lite::future::block_on;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manual_queue(max_concurrency: usize) -> (Arc<ManualSpawner>, ConcurrentQueue) {
        let spawner = Arc::new(ManualSpawner::default());
        let queue = ConcurrentQueue::new(Arc::clone(&spawner) as Arc<dyn Spawn>, max_concurrency);
        (spawner, queue)
    }

    #[test]
    fn cancelled_handle_withdraws_queued_job() {
        init_test("cancelled_handle_withdraws_queued_job");
        let (spawner, queue) = manual_queue(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let handle = block_on(queue.schedule_fn(ConcurrentJobConfig::default(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));
        let kept = block_on(queue.submit(ConcurrentJobConfig::default(), |_| async { Ok(2) }));
        assert_eq!(queue.len(), 2);

        handle.cancel();
        crate::assert_with_log!(queue.len() == 1, "backlog after cancel", 1, queue.len());

        spawner.run_queued();
        assert_eq!(block_on(kept), Ok(2));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        crate::test_complete!("cancelled_handle_withdraws_queued_job");
    }

    #[test]
    fn cancel_all_resolves_queued_tasks() {
        let (spawner, queue) = manual_queue(2);
        let tasks: Vec<_> = (0..3)
            .map(|_| block_on(queue.submit(ConcurrentJobConfig::default(), |_| async { Ok(()) })))
            .collect();

        queue.cancel_all();
        assert!(queue.is_empty());
        assert!(tasks.iter().all(crate::scheduler::ScheduledTask::is_finished));
        for task in tasks {
            assert_eq!(block_on(task), Err(Error::Cancelled));
        }
        // Runners started before the cancel find nothing and stop.
        spawner.run_queued();
        assert_eq!(queue.inner.state.lock().runners, 0);
    }

    fn job(scope: &CancelScope, barrier: bool) -> Job<ConcurrentJobConfig> {
        Job::new(scope, ConcurrentJobConfig { barrier }, work(|_| async { Ok(()) })).0
    }

    #[test]
    fn barrier_waits_for_running_jobs() {
        let scope = CancelScope::default();
        let mut state = ConcurrentState::default();
        state.backlog.push_back(job(&scope, false));
        state.backlog.push_back(job(&scope, true));
        state.backlog.push_back(job(&scope, false));

        let first = state.next_ready().expect("plain job starts");
        assert!(state.next_ready().is_none(), "barrier must wait");

        state.running.remove(&first.id);
        let barrier = state.next_ready().expect("barrier starts when idle");
        assert!(barrier.config.barrier);
        assert!(state.next_ready().is_none(), "nothing overlaps a barrier");
    }

    #[test]
    fn cancelled_jobs_are_skipped() {
        let scope = CancelScope::default();
        let mut state = ConcurrentState::default();
        let (cancelled, handle) =
            Job::new(&scope, ConcurrentJobConfig::default(), work(|_| async { Ok(()) }));
        state.backlog.push_back(cancelled);
        state.backlog.push_back(job(&scope, false));
        crate::scheduler::Cancel::cancel(&handle);

        let next = state.next_ready().expect("live job");
        assert!(!next.is_cancelled());
        assert!(state.backlog.is_empty());
    }

    #[test]
    fn leading_parallel_stops_at_barrier() {
        let scope = CancelScope::default();
        let mut state = ConcurrentState::default();
        for barrier in [false, false, true, false] {
            state.backlog.push_back(job(&scope, barrier));
        }
        assert_eq!(state.leading_parallel(), 2);
    }
}
