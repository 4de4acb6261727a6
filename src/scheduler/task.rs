//! Awaitable results of scheduled work.

use futures_lite::future::Boxed;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use super::{Cancel, Work};
use crate::cx::Cx;
use crate::error::Error;

enum Mode<R> {
    /// Dispatched; the work has not started.
    Scheduled,
    Running,
    /// Cancelled or dropped before producing a result.
    Cancelled,
    Finished(Result<R, Error>),
    /// The outcome was handed to the awaiting caller.
    Taken,
}

struct Slot<R> {
    mode: Mode<R>,
    /// Latest failure of a run that may still be retried.
    failure: Option<Error>,
    waker: Option<Waker>,
}

struct TaskShared<R> {
    slot: Mutex<Slot<R>>,
    if_cancelled: Box<dyn Fn() -> Result<R, Error> + Send + Sync>,
}

impl<R> TaskShared<R> {
    /// Called when the work is about to run. False if the task was cancelled
    /// before it started.
    fn begin(&self) -> bool {
        let mut slot = self.slot.lock();
        match slot.mode {
            Mode::Scheduled => {
                slot.mode = Mode::Running;
                true
            }
            Mode::Cancelled => false,
            // A retry after a failed run.
            Mode::Running => true,
            Mode::Finished(_) | Mode::Taken => false,
        }
    }

    /// Remembers a failure without resolving the task; a later run of the
    /// same work may still succeed.
    fn fail(&self, err: Error) {
        self.slot.lock().failure = Some(err);
    }

    /// Records the final outcome. Later outcomes are dropped.
    fn settle(&self, outcome: Mode<R>) {
        let waker = {
            let mut slot = self.slot.lock();
            if !matches!(slot.mode, Mode::Scheduled | Mode::Running) {
                return;
            }
            slot.mode = outcome;
            slot.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// Settles the task when the work is dropped: with the last failure if a
/// run failed, else as cancelled.
struct Abandon<R> {
    shared: Arc<TaskShared<R>>,
}

impl<R> Drop for Abandon<R> {
    fn drop(&mut self) {
        let failure = self.shared.slot.lock().failure.take();
        self.shared.settle(match failure {
            Some(err) => Mode::Finished(Err(err)),
            None => Mode::Cancelled,
        });
    }
}

/// A task whose [`Work`] exists but has not been dispatched yet.
pub(crate) struct Prepared<R> {
    shared: Arc<TaskShared<R>>,
}

impl<R> Prepared<R> {
    pub(crate) fn attach<H>(self, handle: H) -> ScheduledTask<R>
    where
        H: Cancel + Send + Sync + 'static,
    {
        ScheduledTask {
            shared: self.shared,
            handle: Box::new(handle),
            detached: false,
        }
    }
}

/// Builds the [`Work`] that feeds a [`ScheduledTask`].
pub(crate) fn prepare<R, C, F, Fut>(if_cancelled: C, f: F) -> (Prepared<R>, Work)
where
    R: Send + 'static,
    C: Fn() -> Result<R, Error> + Send + Sync + 'static,
    F: Fn(Cx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, Error>> + Send + 'static,
{
    let shared = Arc::new(TaskShared {
        slot: Mutex::new(Slot {
            mode: Mode::Scheduled,
            failure: None,
            waker: None,
        }),
        if_cancelled: Box::new(if_cancelled),
    });
    let abandon = Abandon {
        shared: Arc::clone(&shared),
    };
    let work: Work = Arc::new(move |cx: Cx| -> Boxed<Result<(), Error>> {
        let shared = Arc::clone(&abandon.shared);
        if !shared.begin() {
            return Box::pin(async { Err(Error::Cancelled) });
        }
        let running = f(cx);
        Box::pin(async move {
            match running.await {
                Ok(value) => {
                    shared.settle(Mode::Finished(Ok(value)));
                    Ok(())
                }
                Err(err) if err.is_cancelled() => {
                    shared.settle(Mode::Finished(Err(Error::Cancelled)));
                    Err(Error::Cancelled)
                }
                // Settled once the work is dropped, unless a retry succeeds.
                Err(err) => {
                    shared.fail(err.clone());
                    Err(err)
                }
            }
        })
    });
    (Prepared { shared }, work)
}

/// The awaitable result of work submitted through
/// [`SchedulerExt::submit`](super::SchedulerExt::submit).
///
/// Resolves with the work's result. If the task is cancelled before the work
/// starts, or the scheduler drops the job without running it, it resolves
/// with the fallback given at submission (`Err(Error::Cancelled)` by
/// default). If it is cancelled while running, it resolves with whatever the
/// work returns.
///
/// A failed run resolves the task only once the scheduler is done with the
/// job: a scheduler that runs the work again (a batching `Retry`) delivers
/// the result of the last run.
///
/// Dropping the task cancels the job; use [`detach`](Self::detach) to let
/// it run unobserved.
#[must_use = "dropping a ScheduledTask cancels its job"]
pub struct ScheduledTask<R> {
    shared: Arc<TaskShared<R>>,
    handle: Box<dyn Cancel + Send + Sync>,
    detached: bool,
}

impl<R> ScheduledTask<R> {
    /// Cancels the job. A no-op once the task has finished.
    pub fn cancel(&self) {
        let waker = {
            let mut slot = self.shared.slot.lock();
            match slot.mode {
                Mode::Scheduled => {
                    slot.mode = Mode::Cancelled;
                    slot.waker.take()
                }
                Mode::Running => None,
                Mode::Cancelled | Mode::Finished(_) | Mode::Taken => return,
            }
        };
        self.handle.cancel();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Returns true once the task has an outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !matches!(
            self.shared.slot.lock().mode,
            Mode::Scheduled | Mode::Running
        )
    }

    /// Lets the job run to completion without awaiting it.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl<R> Cancel for ScheduledTask<R> {
    fn cancel(&self) {
        Self::cancel(self);
    }
}

impl<R> Future for ScheduledTask<R> {
    type Output = Result<R, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.shared.slot.lock();
        match std::mem::replace(&mut slot.mode, Mode::Taken) {
            Mode::Finished(result) => Poll::Ready(result),
            Mode::Cancelled => {
                drop(slot);
                Poll::Ready((self.shared.if_cancelled)())
            }
            Mode::Taken => Poll::Ready(Err(Error::Cancelled)),
            pending @ (Mode::Scheduled | Mode::Running) => {
                slot.mode = pending;
                match &mut slot.waker {
                    Some(waker) if waker.will_wake(cx.waker()) => {}
                    waker => *waker = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
        }
    }
}

impl<R> Drop for ScheduledTask<R> {
    fn drop(&mut self) {
        if !self.detached {
            self.cancel();
        }
    }
}

impl<R> std::fmt::Debug for ScheduledTask<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.shared.slot.lock().mode {
            Mode::Scheduled => "scheduled",
            Mode::Running => "running",
            Mode::Cancelled => "cancelled",
            Mode::Finished(_) => "finished",
            Mode::Taken => "taken",
        };
        f.debug_struct("ScheduledTask")
            .field("mode", &mode)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}
