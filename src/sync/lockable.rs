//! The lock contract shared by [`Mutex`] and the [`RwLock`] views.
//!
//! [`Condvar`](super::Condvar) waits over any `Lockable`, so a condition can be
//! paired with a mutex or with either side of a reader/writer lock.

use std::future::Future;

use super::mutex::{Mutex, MutexGuard};
use super::rwlock::{Exclusive, RwLockReadGuard, RwLockWriteGuard, Shared};
use crate::cx::Cx;
use crate::error::Cancelled;

/// Something that can be locked asynchronously, yielding a guard that
/// unlocks on drop.
pub trait Lockable: Sync {
    /// Guard proving the lock is held.
    type Guard<'a>: Send
    where
        Self: 'a;

    /// Suspends until the lock is held or `cx` is cancelled.
    fn lock<'a>(
        &'a self,
        cx: &Cx,
    ) -> impl Future<Output = Result<Self::Guard<'a>, Cancelled>> + Send + 'a;

    /// Runs `f` while holding the lock; the lock is released on every exit
    /// path.
    fn with_lock<'a, R, F>(
        &'a self,
        cx: &Cx,
        f: F,
    ) -> impl Future<Output = Result<R, Cancelled>> + Send + 'a
    where
        F: FnOnce(&mut Self::Guard<'a>) -> R + Send + 'a,
        R: 'a,
    {
        let acquire = self.lock(cx);
        async move {
            let mut guard = acquire.await?;
            Ok(f(&mut guard))
        }
    }
}

impl<T: Send> Lockable for Mutex<T> {
    type Guard<'a>
        = MutexGuard<'a, T>
    where
        Self: 'a;

    fn lock<'a>(
        &'a self,
        cx: &Cx,
    ) -> impl Future<Output = Result<MutexGuard<'a, T>, Cancelled>> + Send + 'a {
        Mutex::lock(self, cx)
    }
}

impl<T: Send + Sync> Lockable for Shared<'_, T> {
    type Guard<'a>
        = RwLockReadGuard<'a, T>
    where
        Self: 'a;

    fn lock<'a>(
        &'a self,
        cx: &Cx,
    ) -> impl Future<Output = Result<RwLockReadGuard<'a, T>, Cancelled>> + Send + 'a {
        self.lock.read(cx)
    }
}

impl<T: Send + Sync> Lockable for Exclusive<'_, T> {
    type Guard<'a>
        = RwLockWriteGuard<'a, T>
    where
        Self: 'a;

    fn lock<'a>(
        &'a self,
        cx: &Cx,
    ) -> impl Future<Output = Result<RwLockWriteGuard<'a, T>, Cancelled>> + Send + 'a {
        self.lock.write(cx)
    }
}
