//! Fair async mutex with direct ownership handoff.
//!
//! Waiters are served strictly in arrival order. Releasing the lock while a
//! waiter is queued hands ownership to the oldest waiter without ever marking
//! the mutex free, so a late arrival can never barge ahead of the queue.
//!
//! # Cancel Safety
//!
//! - Cancelling the [`Cx`] passed to [`Mutex::lock`] resolves a queued
//!   acquisition with [`Cancelled`] and removes it from the queue, unless
//!   ownership was already handed over, in which case the lock is returned.
//! - Dropping a [`LockFuture`] removes its waiter. If ownership had already
//!   been handed to it, the lock is released again to the next waiter.
//!
//! # Example
//!
//! ```
//! use coopsync::Cx;
//! use coopsync::sync::Mutex;
//!
//! # futures_lite::future::block_on(async {
//! let cx = Cx::new();
//! let mutex = Mutex::new(42);
//!
//! let mut guard = mutex.lock(&cx).await?;
//! *guard += 1;
//! drop(guard);
//!
//! assert_eq!(mutex.with_lock(&cx, |value| *value).await?, 43);
//! # Ok::<(), coopsync::Cancelled>(())
//! # }).unwrap();
//! ```

#![allow(unsafe_code)]

use parking_lot::Mutex as ParkingMutex;
use std::cell::UnsafeCell;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::waiter::{WaitStep, WakeList, Waiter, WaiterQueue, wake_all};
use crate::cx::{CancelListener, Cx};
use crate::error::Cancelled;

/// Error returned by [`Mutex::try_lock`] when the mutex is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryLockError;

impl std::fmt::Display for TryLockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mutex is locked")
    }
}

impl std::error::Error for TryLockError {}

/// An async mutex for mutual exclusion.
#[derive(Debug)]
pub struct Mutex<T> {
    /// The protected data.
    data: UnsafeCell<T>,
    state: ParkingMutex<MutexState>,
}

// Safety: access to `data` is serialized by `state.locked`.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

#[derive(Debug)]
struct MutexState {
    /// Held by a guard, or handed to a waiter that has not consumed it yet.
    locked: bool,
    waiters: WaiterQueue,
}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            data: UnsafeCell::new(value),
            state: ParkingMutex::new(MutexState {
                locked: false,
                waiters: WaiterQueue::new(),
            }),
        }
    }

    /// Returns true if the mutex is currently locked.
    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Returns the number of tasks currently waiting for the lock.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Acquires the mutex asynchronously.
    ///
    /// Resolves with [`Cancelled`] if `cx` is cancelled before ownership is
    /// handed to this caller.
    pub fn lock(&self, cx: &Cx) -> LockFuture<'_, T> {
        LockFuture {
            mutex: self,
            listener: CancelListener::new(cx),
            waiter: None,
        }
    }

    /// Tries to acquire the mutex without waiting.
    ///
    /// Fails while the mutex is held, which includes the window in which
    /// ownership has been handed to a queued waiter.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, TryLockError> {
        let mut state = self.state.lock();
        if state.locked {
            return Err(TryLockError);
        }
        state.locked = true;
        drop(state);

        Ok(MutexGuard { mutex: self })
    }

    /// Runs `f` with exclusive access and releases the lock on every exit
    /// path, including unwinding.
    pub async fn with_lock<R>(&self, cx: &Cx, f: impl FnOnce(&mut T) -> R) -> Result<R, Cancelled> {
        let mut guard = self.lock(cx).await?;
        Ok(f(&mut guard))
    }

    /// Acquires the mutex under a private context that is never cancelled.
    pub(crate) async fn lock_uncancelled(&self) -> MutexGuard<'_, T> {
        let cx = Cx::new();
        loop {
            if let Ok(guard) = self.lock(&cx).await {
                return guard;
            }
        }
    }

    /// Returns a mutable reference to the underlying data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Consumes the mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Acquires the mutex, returning a guard that keeps the mutex alive.
    pub async fn lock_owned(self: &Arc<Self>, cx: &Cx) -> Result<OwnedMutexGuard<T>, Cancelled> {
        let guard = self.lock(cx).await?;
        std::mem::forget(guard);
        Ok(OwnedMutexGuard {
            mutex: Arc::clone(self),
        })
    }

    /// Tries to acquire the mutex without waiting, returning an owned guard.
    pub fn try_lock_owned(self: &Arc<Self>) -> Result<OwnedMutexGuard<T>, TryLockError> {
        let guard = self.try_lock()?;
        std::mem::forget(guard);
        Ok(OwnedMutexGuard {
            mutex: Arc::clone(self),
        })
    }

    /// Releases ownership, handing it to the oldest waiter if there is one.
    #[inline]
    fn unlock(&self) {
        let mut wakers = WakeList::new();
        {
            let mut state = self.state.lock();
            if !state.waiters.resume_front((), &mut wakers) {
                state.locked = false;
            }
        }
        wake_all(wakers);
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Future returned by [`Mutex::lock`].
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct LockFuture<'a, T> {
    mutex: &'a Mutex<T>,
    listener: CancelListener,
    waiter: Option<Waiter>,
}

impl<'a, T> Future for LockFuture<'a, T> {
    type Output = Result<MutexGuard<'a, T>, Cancelled>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mutex = this.mutex;

        let Some(waiter) = this.waiter.as_mut() else {
            if this.listener.cx().is_cancel_requested() {
                return Poll::Ready(Err(Cancelled));
            }
            let mut state = mutex.state.lock();
            if !state.locked {
                state.locked = true;
                return Poll::Ready(Ok(MutexGuard { mutex }));
            }
            this.waiter = Some(state.waiters.push(()));
            drop(state);
            // Poll straight away to register the waker; a handoff may already
            // have landed.
            return Pin::new(this).poll(task);
        };

        match waiter.poll_step(task, &mut this.listener) {
            WaitStep::Resumed(()) => {
                this.waiter = None;
                Poll::Ready(Ok(MutexGuard { mutex }))
            }
            WaitStep::CancelRequested => {
                let removed = mutex.state.lock().waiters.remove(waiter.id());
                if removed {
                    this.waiter = None;
                    return Poll::Ready(Err(Cancelled));
                }
                // Ownership was handed over before the cancel was observed.
                let granted = waiter.take_resumed().is_some();
                this.waiter = None;
                if granted {
                    Poll::Ready(Ok(MutexGuard { mutex }))
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

impl<T> Drop for LockFuture<'_, T> {
    fn drop(&mut self) {
        let Some(mut waiter) = self.waiter.take() else {
            return;
        };
        let removed = self.mutex.state.lock().waiters.remove(waiter.id());
        if !removed && waiter.take_resumed().is_some() {
            // Pass the baton to the next waiter.
            tracing::trace!("lock future dropped after handoff, releasing");
            self.mutex.unlock();
        }
    }
}

/// A guard that releases the mutex when dropped.
#[must_use = "guard will be immediately released if not held"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

unsafe impl<T: Send> Send for MutexGuard<'_, T> {}
unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> MutexGuard<'_, T> {
    /// Releases the lock. Equivalent to dropping the guard.
    pub fn unlock(self) {
        drop(self);
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard").field("data", &**self).finish()
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

/// An owned guard that releases the mutex when dropped.
#[must_use = "guard will be immediately released if not held"]
pub struct OwnedMutexGuard<T> {
    mutex: Arc<Mutex<T>>,
}

unsafe impl<T: Send> Send for OwnedMutexGuard<T> {}
unsafe impl<T: Sync> Sync for OwnedMutexGuard<T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for OwnedMutexGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedMutexGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> Deref for OwnedMutexGuard<T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for OwnedMutexGuard<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for OwnedMutexGuard<T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
