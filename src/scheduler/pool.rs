//! Unordered scheduling straight onto the runtime.

use std::future::Future;
use std::sync::Arc;

use super::{CancelScope, Job, JobHandle, Scheduler, Work};
use crate::runtime::Spawn;

/// Runs every job as its own runtime task.
///
/// Jobs start as soon as a worker picks them up, in no particular order and
/// with no concurrency limit beyond the worker count.
pub struct PoolScheduler {
    spawner: Arc<dyn Spawn>,
    scope: CancelScope,
}

impl PoolScheduler {
    /// Creates a scheduler spawning onto `spawner`.
    #[must_use]
    pub fn new(spawner: Arc<dyn Spawn>) -> Self {
        Self {
            spawner,
            scope: CancelScope::default(),
        }
    }

    fn dispatch(&self, work: Work) -> JobHandle {
        let (job, handle) = Job::new(&self.scope, (), work);
        self.spawner.spawn_boxed(Box::pin(async move {
            let _ = job.run().await;
        }));
        handle
    }
}

impl std::fmt::Debug for PoolScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolScheduler").finish_non_exhaustive()
    }
}

impl Scheduler for PoolScheduler {
    type Config = ();
    type Handle = JobHandle;

    fn schedule(&self, (): (), work: Work) -> impl Future<Output = JobHandle> + Send {
        std::future::ready(self.dispatch(work))
    }

    fn cancel_all(&self) {
        tracing::debug!("pool scheduler cancelling all jobs");
        self.scope.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::runtime::{Runtime, RuntimeConfig};
    use crate::scheduler::{Cancel, SchedulerExt};
    use crate::test_utils::{ManualSpawner, init_test};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_job() {
        init_test("runs_every_job");
        let rt = Runtime::new(RuntimeConfig::with_workers(2)).expect("runtime");
        let pool = PoolScheduler::new(rt.handle().spawner());
        let tasks: Vec<_> = (0..10_u32)
            .map(|i| rt.block_on(pool.submit((), move |_| async move { Ok(i) })))
            .collect();
        let total: u32 = tasks
            .into_iter()
            .map(|task| rt.block_on(task).expect("job result"))
            .sum();
        crate::assert_with_log!(total == 45, "sum of results", 45, total);
        crate::test_complete!("runs_every_job");
    }

    #[test]
    fn cancel_all_stops_running_jobs() {
        let rt = Runtime::new(RuntimeConfig::with_workers(1)).expect("runtime");
        let pool = PoolScheduler::new(rt.handle().spawner());
        let task = rt.block_on(pool.submit((), |cx| async move {
            cx.cancelled().await;
            Err::<(), _>(Error::Cancelled)
        }));
        pool.cancel_all();
        assert_eq!(rt.block_on(task), Err(Error::Cancelled));

        let after = rt.block_on(pool.submit_and_wait((), |_| async { Ok(7) }));
        assert_eq!(after, Ok(7));
    }

    #[test]
    fn cancelled_handle_skips_work() {
        let spawner = Arc::new(ManualSpawner::default());
        let pool = PoolScheduler::new(Arc::clone(&spawner) as Arc<dyn Spawn>);
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let handle = futures_lite::future::block_on(pool.schedule_fn((), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));
        handle.cancel();

        assert_eq!(spawner.queued(), 1);
        spawner.run_queued();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
