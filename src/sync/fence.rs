//! Event with synchronous signalling.
//!
//! [`Fence`] has the same contract as [`Event`](super::Event) but keeps its
//! flag next to the waiter queue, so `signal`, `reset` and `is_signaled`
//! never suspend. Each waiter moves from waiting to either signalled or
//! cancelled exactly once; a signal that lands before a cancellation is
//! observed wins.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::waiter::{WaitStep, WakeList, Waiter, WaiterQueue, wake_all};
use crate::cx::{CancelListener, Cx};
use crate::error::Cancelled;

#[derive(Debug, Default)]
struct FenceState {
    signaled: bool,
    waiters: WaiterQueue,
}

/// A signalable fence.
#[derive(Debug, Default)]
pub struct Fence {
    state: Mutex<FenceState>,
}

impl Fence {
    /// Creates a fence in the cleared state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Releases every waiter. The fence is left set unless `reset` is true.
    pub fn signal(&self, reset: bool) {
        let mut wakers = WakeList::new();
        {
            let mut state = self.state.lock();
            state.signaled = !reset;
            state.waiters.resume_all((), &mut wakers);
        }
        wake_all(wakers);
    }

    /// Clears the fence without waking anyone.
    pub fn reset(&self) {
        self.state.lock().signaled = false;
    }

    /// Returns true if the fence is set.
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    /// Number of suspended waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Returns immediately if the fence is set, otherwise suspends until the
    /// next [`signal`](Self::signal).
    pub fn wait(&self, cx: &Cx) -> FenceWait<'_> {
        FenceWait {
            fence: self,
            listener: CancelListener::new(cx),
            waiter: None,
            done: false,
        }
    }
}

/// Future returned by [`Fence::wait`].
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct FenceWait<'a> {
    fence: &'a Fence,
    listener: CancelListener,
    waiter: Option<Waiter>,
    done: bool,
}

impl FenceWait<'_> {
    fn finish(&mut self, result: Result<(), Cancelled>) -> Poll<Result<(), Cancelled>> {
        self.waiter = None;
        self.done = true;
        Poll::Ready(result)
    }
}

impl Future for FenceWait<'_> {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Ok(()));
        }
        if this.waiter.is_none() {
            if this.listener.cx().is_cancel_requested() {
                return this.finish(Err(Cancelled));
            }
            let mut state = this.fence.state.lock();
            if state.signaled {
                drop(state);
                return this.finish(Ok(()));
            }
            this.waiter = Some(state.waiters.push(()));
        }
        let Some(waiter) = this.waiter.as_mut() else {
            return Poll::Pending;
        };

        match waiter.poll_step(task, &mut this.listener) {
            WaitStep::Resumed(()) => this.finish(Ok(())),
            WaitStep::CancelRequested => {
                let removed = this.fence.state.lock().waiters.remove(waiter.id());
                if removed {
                    this.finish(Err(Cancelled))
                } else {
                    this.finish(Ok(()))
                }
            }
            WaitStep::Abandoned => this.finish(Err(Cancelled)),
            WaitStep::Pending => Poll::Pending,
        }
    }
}

impl Drop for FenceWait<'_> {
    fn drop(&mut self) {
        if let Some(waiter) = self.waiter.take() {
            self.fence.state.lock().waiters.remove(waiter.id());
        }
    }
}
