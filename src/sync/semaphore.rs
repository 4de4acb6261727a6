//! Counting semaphore built from a [`Mutex`] and a [`Condvar`].
//!
//! # Cancel Safety
//!
//! - [`Semaphore::wait`] is cancel-safe: a cancelled wait takes nothing.
//! - [`Semaphore::acquire`] returns its permit when the work finishes,
//!   whether it succeeded or failed, and also when the acquire future is
//!   dropped mid-work.
//!
//! # Example
//!
//! ```
//! use coopsync::Cx;
//! use coopsync::sync::Semaphore;
//!
//! # futures_lite::future::block_on(async {
//! let cx = Cx::new();
//! let sem = Semaphore::new(2);
//!
//! let doubled = sem.acquire(&cx, async { 21 * 2 }).await?;
//! assert_eq!(doubled, 42);
//! assert_eq!(sem.value().await, 2);
//! # Ok::<(), coopsync::Cancelled>(())
//! # }).unwrap();
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Condvar, Mutex, MutexGuard};
use crate::cx::Cx;
use crate::error::Cancelled;

/// A counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    value: Mutex<usize>,
    available: Condvar,
    /// Permits returned by dropped [`acquire`](Self::acquire) futures while
    /// the mutex was held elsewhere; folded into `value` by the next holder.
    returned: AtomicUsize,
}

impl Semaphore {
    /// Creates a semaphore holding `value` permits.
    #[must_use]
    pub fn new(value: usize) -> Self {
        Self {
            value: Mutex::new(value),
            available: Condvar::new(),
            returned: AtomicUsize::new(0),
        }
    }

    /// Takes one permit, suspending while none is available.
    pub async fn wait(&self, cx: &Cx) -> Result<(), Cancelled> {
        let mut guard = self.value.lock(cx).await?;
        loop {
            self.fold_returned(&mut guard);
            if *guard > 0 {
                break;
            }
            // Permits returned without the mutex land in `returned`; re-check
            // it once registered so one arriving meanwhile is not missed.
            guard = self
                .available
                .wait_unless(cx, &self.value, guard, || {
                    self.returned.load(Ordering::SeqCst) > 0
                })
                .await?;
        }
        *guard -= 1;
        Ok(())
    }

    /// Returns one permit and wakes the oldest waiter.
    pub async fn signal(&self) {
        let mut guard = self.value.lock_uncancelled().await;
        self.fold_returned(&mut guard);
        *guard += 1;
        self.available.notify_one();
    }

    /// Waits for a permit, runs `work`, and returns the permit.
    pub async fn acquire<F: Future>(&self, cx: &Cx, work: F) -> Result<F::Output, Cancelled> {
        self.wait(cx).await?;
        let permit = Permit { semaphore: self };
        let output = work.await;
        permit.give_back().await;
        Ok(output)
    }

    /// Number of permits currently available.
    pub async fn value(&self) -> usize {
        let mut guard = self.value.lock_uncancelled().await;
        self.fold_returned(&mut guard);
        *guard
    }

    fn fold_returned(&self, value: &mut MutexGuard<'_, usize>) {
        let returned = self.returned.swap(0, Ordering::SeqCst);
        if returned > 0 {
            **value += returned;
            self.available.notify_all();
        }
    }

    /// Returns a permit without suspending.
    fn release(&self) {
        if let Ok(mut guard) = self.value.try_lock() {
            self.fold_returned(&mut guard);
            *guard += 1;
            self.available.notify_one();
        } else {
            self.returned.fetch_add(1, Ordering::SeqCst);
            self.available.notify_all();
        }
    }
}

/// Returns the permit of an `acquire` future dropped mid-work.
struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Permit<'_> {
    /// Returns the permit through [`Semaphore::signal`]. Dropped before the
    /// signal lands, the permit still returns through `Drop`.
    async fn give_back(self) {
        self.semaphore.signal().await;
        std::mem::forget(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
