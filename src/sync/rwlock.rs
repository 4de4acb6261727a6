//! Cancel-aware read-write lock with a bounded reader count.
//!
//! Multiple readers or a single writer may hold the lock. Readers and writers
//! wait in one queue in arrival order.
//!
//! # Fairness
//!
//! | Scenario                     | Behavior                                   |
//! |------------------------------|--------------------------------------------|
//! | No writer holding or queued  | Readers acquire up to `max_readers`        |
//! | Writer queued                | New readers queue behind it                |
//! | Readers holding + writer     | Writer waits for every reader to release   |
//! | Release                      | Consecutive compatible waiters are granted |
//!
//! On every release, and whenever a queued waiter is cancelled, a notify pass
//! walks the queue from the front granting waiters while their condition
//! holds and stops at the first one that cannot proceed. A run of readers
//! behind a writer is therefore granted together once the writer releases.
//!
//! # Example
//!
//! ```
//! use coopsync::Cx;
//! use coopsync::sync::RwLock;
//!
//! # futures_lite::future::block_on(async {
//! let cx = Cx::new();
//! let lock = RwLock::new(vec![1, 2, 3]);
//!
//! let read1 = lock.read(&cx).await?;
//! let read2 = lock.read(&cx).await?;
//! assert_eq!(lock.readers(), 2);
//!
//! drop((read1, read2));
//! let mut write = lock.write(&cx).await?;
//! write.push(4);
//! # Ok::<(), coopsync::Cancelled>(())
//! # }).unwrap();
//! ```

#![allow(unsafe_code)]

use parking_lot::Mutex as ParkingMutex;
use std::cell::UnsafeCell;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};

use super::waiter::{WaitStep, WakeList, Waiter, WaiterQueue, wake_all};
use crate::cx::{CancelListener, Cx};
use crate::error::Cancelled;

/// Error returned by [`RwLock::try_read`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryReadError;

impl std::fmt::Display for TryReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rwlock is write-locked or at its reader limit")
    }
}

impl std::error::Error for TryReadError {}

/// Error returned by [`RwLock::try_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryWriteError;

impl std::fmt::Display for TryWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rwlock is locked")
    }
}

impl std::error::Error for TryWriteError {}

/// The kind of access a queued waiter asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct State {
    readers: usize,
    writing: bool,
    max_readers: usize,
    waiters: WaiterQueue<Access>,
}

impl State {
    fn writer_queued(&self) -> bool {
        self.waiters.any(|access| *access == Access::Exclusive)
    }

    /// Fast-path acquisition for a caller that is not yet queued.
    fn try_acquire(&mut self, access: Access) -> bool {
        if self.writing || self.writer_queued() {
            return false;
        }
        match access {
            Access::Shared if self.readers < self.max_readers => {
                self.readers += 1;
                true
            }
            Access::Exclusive if self.readers == 0 => {
                self.writing = true;
                true
            }
            _ => false,
        }
    }

    fn release(&mut self, access: Access, wakers: &mut WakeList) {
        match access {
            Access::Shared => self.readers -= 1,
            Access::Exclusive => self.writing = false,
        }
        self.notify(wakers);
    }

    /// Grants waiters from the front while their condition holds.
    fn notify(&mut self, wakers: &mut WakeList) {
        let readers = &mut self.readers;
        let writing = &mut self.writing;
        let max_readers = self.max_readers;
        let granted = self.waiters.resume_while(
            |access| match access {
                Access::Shared if !*writing && *readers < max_readers => {
                    *readers += 1;
                    Some(())
                }
                Access::Exclusive if !*writing && *readers == 0 => {
                    *writing = true;
                    Some(())
                }
                _ => None,
            },
            wakers,
        );
        if granted > 0 {
            tracing::trace!(
                granted,
                readers = self.readers,
                writing = self.writing,
                "rwlock notify pass"
            );
        }
    }
}

/// A cancel-aware read-write lock.
///
/// # Cancel Safety
///
/// Both [`read`](Self::read) and [`write`](Self::write) are cancel-safe. If
/// the context is cancelled while waiting, the waiter is removed, no access
/// is acquired and [`Cancelled`] is returned. If access was granted before
/// the cancellation was observed, the guard is returned instead.
#[derive(Debug)]
pub struct RwLock<T> {
    state: ParkingMutex<State>,
    data: UnsafeCell<T>,
}

// Safety: shared access hands out `&T` to several threads, exclusive access
// is serialized by `State::writing`.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new lock with no reader limit.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self::with_max_readers(value, usize::MAX)
    }

    /// Creates a new lock admitting at most `max_readers` concurrent readers.
    ///
    /// # Panics
    ///
    /// Panics if `max_readers` is zero.
    #[must_use]
    pub fn with_max_readers(value: T, max_readers: usize) -> Self {
        assert!(max_readers > 0, "max_readers must be at least 1");
        Self {
            state: ParkingMutex::new(State {
                readers: 0,
                writing: false,
                max_readers,
                waiters: WaiterQueue::new(),
            }),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the lock and returns the inner value.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the inner value.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Number of readers currently holding the lock.
    #[must_use]
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    /// Returns true while a writer holds the lock.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    /// Number of queued readers and writers.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// The configured reader limit.
    #[must_use]
    pub fn max_readers(&self) -> usize {
        self.state.lock().max_readers
    }

    /// Acquires shared access.
    pub fn read(&self, cx: &Cx) -> ReadFuture<'_, T> {
        ReadFuture {
            inner: Acquire::new(self, Access::Shared, cx),
        }
    }

    /// Acquires exclusive access.
    pub fn write(&self, cx: &Cx) -> WriteFuture<'_, T> {
        WriteFuture {
            inner: Acquire::new(self, Access::Exclusive, cx),
        }
    }

    /// Tries to acquire shared access without waiting.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, TryReadError> {
        if self.state.lock().try_acquire(Access::Shared) {
            Ok(RwLockReadGuard { lock: self })
        } else {
            Err(TryReadError)
        }
    }

    /// Tries to acquire exclusive access without waiting.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, TryWriteError> {
        if self.state.lock().try_acquire(Access::Exclusive) {
            Ok(RwLockWriteGuard { lock: self })
        } else {
            Err(TryWriteError)
        }
    }

    /// Runs `f` with shared access, releasing on every exit path.
    pub async fn read_with<R>(&self, cx: &Cx, f: impl FnOnce(&T) -> R) -> Result<R, Cancelled> {
        let guard = self.read(cx).await?;
        Ok(f(&guard))
    }

    /// Runs `f` with exclusive access, releasing on every exit path.
    pub async fn write_with<R>(
        &self,
        cx: &Cx,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, Cancelled> {
        let mut guard = self.write(cx).await?;
        Ok(f(&mut guard))
    }

    /// Stores `value` under exclusive access and returns the previous value.
    pub async fn replace(&self, cx: &Cx, value: T) -> Result<T, Cancelled> {
        self.write_with(cx, |current| std::mem::replace(current, value))
            .await
    }

    /// Exchanges the protected value with `other` under exclusive access.
    ///
    /// On cancellation `other` is left untouched.
    pub async fn swap(&self, cx: &Cx, other: &mut T) -> Result<(), Cancelled> {
        self.write_with(cx, |current| std::mem::swap(current, other))
            .await
    }

    /// Applies `f` under exclusive access and returns the value it replaced.
    pub async fn get_and_update(
        &self,
        cx: &Cx,
        f: impl FnOnce(&mut T),
    ) -> Result<T, Cancelled>
    where
        T: Clone,
    {
        self.write_with(cx, |current| {
            let previous = current.clone();
            f(current);
            previous
        })
        .await
    }

    /// Acquires exclusive access under a private context that is never
    /// cancelled.
    pub(crate) async fn write_uncancelled(&self) -> RwLockWriteGuard<'_, T> {
        let cx = Cx::new();
        loop {
            if let Ok(guard) = self.write(&cx).await {
                return guard;
            }
        }
    }

    /// A [`Lockable`](super::Lockable) view acquiring shared access.
    #[must_use]
    pub fn shared(&self) -> Shared<'_, T> {
        Shared { lock: self }
    }

    /// A [`Lockable`](super::Lockable) view acquiring exclusive access.
    #[must_use]
    pub fn exclusive(&self) -> Exclusive<'_, T> {
        Exclusive { lock: self }
    }

    fn release(&self, access: Access) {
        let mut wakers = WakeList::new();
        self.state.lock().release(access, &mut wakers);
        wake_all(wakers);
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Shared acquisition view of an [`RwLock`].
#[derive(Debug, Clone, Copy)]
pub struct Shared<'a, T> {
    pub(crate) lock: &'a RwLock<T>,
}

/// Exclusive acquisition view of an [`RwLock`].
#[derive(Debug, Clone, Copy)]
pub struct Exclusive<'a, T> {
    pub(crate) lock: &'a RwLock<T>,
}

/// Queue-aware acquisition shared by the read and write futures.
#[derive(Debug)]
struct Acquire<'a, T> {
    lock: &'a RwLock<T>,
    access: Access,
    listener: CancelListener,
    waiter: Option<Waiter>,
}

impl<'a, T> Acquire<'a, T> {
    fn new(lock: &'a RwLock<T>, access: Access, cx: &Cx) -> Self {
        Self {
            lock,
            access,
            listener: CancelListener::new(cx),
            waiter: None,
        }
    }

    fn poll_acquire(&mut self, task: &mut Context<'_>) -> Poll<Result<(), Cancelled>> {
        if self.waiter.is_none() {
            if self.listener.cx().is_cancel_requested() {
                return Poll::Ready(Err(Cancelled));
            }
            let mut state = self.lock.state.lock();
            if state.try_acquire(self.access) {
                return Poll::Ready(Ok(()));
            }
            self.waiter = Some(state.waiters.push(self.access));
        }
        let Some(waiter) = self.waiter.as_mut() else {
            return Poll::Pending;
        };

        match waiter.poll_step(task, &mut self.listener) {
            WaitStep::Resumed(()) => {
                self.waiter = None;
                Poll::Ready(Ok(()))
            }
            WaitStep::CancelRequested => {
                let mut wakers = WakeList::new();
                let removed = {
                    let mut state = self.lock.state.lock();
                    let removed = state.waiters.remove(waiter.id());
                    if removed {
                        // The cancelled waiter may have been holding back
                        // compatible waiters behind it.
                        state.notify(&mut wakers);
                    }
                    removed
                };
                wake_all(wakers);
                let granted = !removed && waiter.take_resumed().is_some();
                self.waiter = None;
                if granted {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(Cancelled))
                }
            }
            WaitStep::Abandoned => {
                self.waiter = None;
                Poll::Ready(Err(Cancelled))
            }
            WaitStep::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Acquire<'_, T> {
    fn drop(&mut self) {
        let Some(mut waiter) = self.waiter.take() else {
            return;
        };
        let mut wakers = WakeList::new();
        {
            let mut state = self.lock.state.lock();
            if state.waiters.remove(waiter.id()) {
                state.notify(&mut wakers);
            } else if waiter.take_resumed().is_some() {
                // Granted but never observed.
                state.release(self.access, &mut wakers);
            }
        }
        wake_all(wakers);
    }
}

/// Future returned by [`RwLock::read`].
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct ReadFuture<'a, T> {
    inner: Acquire<'a, T>,
}

impl<'a, T> Future for ReadFuture<'a, T> {
    type Output = Result<RwLockReadGuard<'a, T>, Cancelled>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.inner
            .poll_acquire(task)
            .map_ok(|()| RwLockReadGuard {
                lock: this.inner.lock,
            })
    }
}

/// Future returned by [`RwLock::write`].
#[must_use = "futures do nothing unless polled"]
#[derive(Debug)]
pub struct WriteFuture<'a, T> {
    inner: Acquire<'a, T>,
}

impl<'a, T> Future for WriteFuture<'a, T> {
    type Output = Result<RwLockWriteGuard<'a, T>, Cancelled>;

    fn poll(self: Pin<&mut Self>, task: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.inner
            .poll_acquire(task)
            .map_ok(|()| RwLockWriteGuard {
                lock: this.inner.lock,
            })
    }
}

/// Guard for shared access.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

unsafe impl<T: Sync> Send for RwLockReadGuard<'_, T> {}
unsafe impl<T: Sync> Sync for RwLockReadGuard<'_, T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockReadGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockReadGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release(Access::Shared);
    }
}

/// Guard for exclusive access.
#[must_use = "guard will be immediately released if not held"]
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

unsafe impl<T: Send + Sync> Send for RwLockWriteGuard<'_, T> {}
unsafe impl<T: Send + Sync> Sync for RwLockWriteGuard<'_, T> {}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLockWriteGuard<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLockWriteGuard")
            .field("data", &**self)
            .finish()
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.release(Access::Exclusive);
    }
}
