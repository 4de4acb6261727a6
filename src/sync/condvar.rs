//! Condition variable over any [`Lockable`].
//!
//! [`Condvar::wait`] registers the caller, releases the lock, suspends until
//! notified, and re-acquires the lock before returning. The lock is
//! re-acquired on the cancellation path too, so the caller always gets its
//! guard back.
//!
//! # Cancel Safety
//!
//! - Cancelling the context removes the waiter; the guard comes back inside
//!   [`WaitCancelled`]. A notification that landed first wins and `wait`
//!   returns `Ok`.
//! - Dropping a wait that already consumed a `notify_one` passes the
//!   notification on to the next waiter, so it is not lost.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::Lockable;
use super::waiter::{WaitStep, WakeList, Waiter, WaiterQueue, wake_all};
use crate::cx::{CancelListener, Cx};
use crate::error::Cancelled;

/// Error returned when a [`Condvar`] wait is cancelled.
///
/// Carries the re-acquired guard.
pub struct WaitCancelled<G> {
    guard: G,
}

impl<G> WaitCancelled<G> {
    /// Returns the re-acquired guard.
    pub fn into_guard(self) -> G {
        self.guard
    }
}

impl<G> std::fmt::Debug for WaitCancelled<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitCancelled").finish_non_exhaustive()
    }
}

impl<G> std::fmt::Display for WaitCancelled<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "condition wait cancelled")
    }
}

impl<G> std::error::Error for WaitCancelled<G> {}

impl<G> From<WaitCancelled<G>> for Cancelled {
    fn from(_: WaitCancelled<G>) -> Self {
        Self
    }
}

/// Which notification resumed a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Notified {
    One,
    All,
}

/// A condition variable for async tasks.
///
/// # Panics
///
/// Dropping a `Condvar` while tasks are still waiting on it panics.
#[derive(Debug, Default)]
pub struct Condvar {
    waiters: Mutex<WaiterQueue<(), Notified>>,
}

impl Condvar {
    /// Creates a condition variable with no waiters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks currently waiting.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Wakes the oldest waiter, if any.
    pub fn notify_one(&self) {
        let mut wakers = WakeList::new();
        self.waiters
            .lock()
            .resume_front(Notified::One, &mut wakers);
        wake_all(wakers);
    }

    /// Wakes every current waiter.
    pub fn notify_all(&self) {
        let mut wakers = WakeList::new();
        let woken = self.waiters.lock().resume_all(Notified::All, &mut wakers);
        if woken > 0 {
            tracing::trace!(woken, "condvar notify_all");
        }
        wake_all(wakers);
    }

    /// Releases `guard`, waits for a notification, and re-acquires `lock`.
    ///
    /// The waiter is registered before the guard is dropped, so a notification
    /// sent by whoever takes the lock next is never missed.
    pub async fn wait<'a, L: Lockable>(
        &self,
        cx: &Cx,
        lock: &'a L,
        guard: L::Guard<'a>,
    ) -> Result<L::Guard<'a>, WaitCancelled<L::Guard<'a>>> {
        self.wait_unless(cx, lock, guard, || false).await
    }

    /// Like [`wait`](Self::wait), but checks `skip` after the waiter is
    /// registered and returns the guard at once if it holds.
    ///
    /// For state changed without taking `lock`: a change that happens before
    /// the check is seen by `skip`, one that happens after it finds the
    /// waiter registered and can notify it.
    pub(crate) async fn wait_unless<'a, L: Lockable>(
        &self,
        cx: &Cx,
        lock: &'a L,
        guard: L::Guard<'a>,
        skip: impl FnOnce() -> bool,
    ) -> Result<L::Guard<'a>, WaitCancelled<L::Guard<'a>>> {
        let waiter = self.waiters.lock().push(());
        let mut wait = Wait {
            condvar: self,
            listener: CancelListener::new(cx),
            waiter: Some(waiter),
        };
        if skip() {
            drop(wait);
            return Ok(guard);
        }
        drop(guard);

        let outcome = (&mut wait).await;
        drop(wait);
        let guard = relock(lock).await;
        match outcome {
            Ok(()) => Ok(guard),
            Err(Cancelled) => Err(WaitCancelled { guard }),
        }
    }

    /// Waits until `condition` holds, re-checking it under the lock after
    /// every notification.
    pub async fn wait_until<'a, L, F>(
        &self,
        cx: &Cx,
        lock: &'a L,
        mut guard: L::Guard<'a>,
        mut condition: F,
    ) -> Result<L::Guard<'a>, WaitCancelled<L::Guard<'a>>>
    where
        L: Lockable,
        F: FnMut(&mut L::Guard<'a>) -> bool,
    {
        while !condition(&mut guard) {
            guard = self.wait(cx, lock, guard).await?;
        }
        Ok(guard)
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        let waiting = self.waiters.get_mut().len();
        if waiting > 0 && !std::thread::panicking() {
            panic!("condvar dropped with {waiting} task(s) still waiting");
        }
    }
}

/// Re-acquires `lock` under a context that is never cancelled.
async fn relock<L: Lockable>(lock: &L) -> L::Guard<'_> {
    let cx = Cx::new();
    loop {
        if let Ok(guard) = lock.lock(&cx).await {
            return guard;
        }
    }
}

/// The suspended half of a wait.
struct Wait<'c> {
    condvar: &'c Condvar,
    listener: CancelListener,
    waiter: Option<Waiter<Notified>>,
}

impl Future for Wait<'_> {
    type Output = Result<(), Cancelled>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(waiter) = this.waiter.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        match waiter.poll_step(task, &mut this.listener) {
            WaitStep::Resumed(_) => {
                this.waiter = None;
                Poll::Ready(Ok(()))
            }
            WaitStep::CancelRequested => {
                let removed = this.condvar.waiters.lock().remove(waiter.id());
                let notified = !removed && waiter.take_resumed().is_some();
                this.waiter = None;
                if notified {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(Cancelled))
                }
            }
            WaitStep::Abandoned => {
                this.waiter = None;
                Poll::Ready(Err(Cancelled))
            }
            WaitStep::Pending => Poll::Pending,
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        let Some(mut waiter) = self.waiter.take() else {
            return;
        };
        let removed = self.condvar.waiters.lock().remove(waiter.id());
        if !removed && waiter.take_resumed() == Some(Notified::One) {
            self.condvar.notify_one();
        }
    }
}
