//! The cancellation context type.
//!
//! `Cx` is a cheaply clonable token carrying one cancellation flag. Clones
//! share the flag; [`Cx::child`] creates a context that is cancelled whenever
//! its parent is, which is how schedulers cancel every job they own at once.
//!
//! # Example
//!
//! ```
//! use coopsync::Cx;
//!
//! let cx = Cx::new();
//! let job = cx.child();
//! assert!(job.checkpoint().is_ok());
//!
//! cx.cancel();
//! assert!(job.is_cancel_requested());
//! assert!(job.checkpoint().is_err());
//! ```

use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};

use super::CancelListener;
use crate::error::Cancelled;

static NEXT_CX_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub(crate) struct CxInner {
    id: u64,
    pub(super) state: Mutex<CancelState>,
}

#[derive(Debug, Default)]
pub(crate) struct CancelState {
    pub(super) cancel_requested: bool,
    /// Wakers of suspended operations watching this context.
    pub(super) listeners: Slab<Waker>,
    /// Bumped whenever `listeners` is drained so stale slab keys are never
    /// reused by a listener that registered before the drain.
    pub(super) epoch: u64,
    children: Vec<Weak<CxInner>>,
}

impl CxInner {
    fn new(cancel_requested: bool) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CX_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(CancelState {
                cancel_requested,
                ..CancelState::default()
            }),
        })
    }

    fn cancel(&self) {
        let (wakers, children) = {
            let mut state = self.state.lock();
            if state.cancel_requested {
                return;
            }
            state.cancel_requested = true;
            state.epoch += 1;
            let wakers: SmallVec<[Waker; 4]> = state.listeners.drain().collect();
            (wakers, std::mem::take(&mut state.children))
        };

        tracing::trace!(cx = self.id, woken = wakers.len(), "cancel requested");
        for waker in wakers {
            waker.wake();
        }
        for child in children {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

/// A cancellation context.
///
/// `Cx` is `Send + Sync` and cheap to clone. All clones observe the same
/// cancellation flag.
#[derive(Debug, Clone)]
pub struct Cx {
    pub(crate) inner: Arc<CxInner>,
}

impl Cx {
    /// Creates a new, uncancelled context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: CxInner::new(false),
        }
    }

    /// Creates a context for tests. Identical to [`Cx::new`].
    #[must_use]
    pub fn for_testing() -> Self {
        Self::new()
    }

    /// Returns a process-unique identifier, useful in log output.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Creates a child context.
    ///
    /// The child is cancelled when this context is cancelled (immediately, if
    /// this context is already cancelled). Cancelling the child does not
    /// affect the parent.
    #[must_use]
    pub fn child(&self) -> Self {
        let mut state = self.inner.state.lock();
        if state.cancel_requested {
            return Self {
                inner: CxInner::new(true),
            };
        }

        let child = CxInner::new(false);
        state.children.retain(|weak| weak.strong_count() > 0);
        state.children.push(Arc::downgrade(&child));
        Self { inner: child }
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.state.lock().cancel_requested
    }

    /// Returns `Err(Cancelled)` if cancellation has been requested.
    ///
    /// Long-running work should call this between steps so a cancelled job
    /// stops early:
    ///
    /// ```
    /// # use coopsync::{Cx, Cancelled};
    /// fn step(cx: &Cx) -> Result<(), Cancelled> {
    ///     cx.checkpoint()?;
    ///     // ... do a slice of work ...
    ///     Ok(())
    /// }
    /// # assert!(step(&Cx::new()).is_ok());
    /// ```
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        if self.is_cancel_requested() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Requests cancellation of this context and all of its children.
    ///
    /// Idempotent. Every operation suspended under this context is woken so it
    /// can observe the request.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Sets the cancellation flag.
    ///
    /// `true` behaves like [`Cx::cancel`]. `false` clears the flag on this
    /// context only; children that were already cancelled stay cancelled.
    pub fn set_cancel_requested(&self, value: bool) {
        if value {
            self.cancel();
        } else {
            self.inner.state.lock().cancel_requested = false;
        }
    }

    /// Returns a future that resolves once this context is cancelled.
    #[must_use]
    pub fn cancelled(&self) -> Cancellation {
        Cancellation {
            listener: CancelListener::new(self),
        }
    }

    /// Creates a non-owning handle that can cancel this context while it is
    /// still alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakCx {
        WeakCx {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}

/// A weak reference to a [`Cx`].
///
/// Holding a `WeakCx` does not keep the context alive; cancelling through a
/// dead reference is a no-op.
#[derive(Debug, Clone, Default)]
pub struct WeakCx {
    inner: Weak<CxInner>,
}

impl WeakCx {
    /// Cancels the referenced context if it is still alive.
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel();
        }
    }

    /// Returns the context if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Cx> {
        self.inner.upgrade().map(|inner| Cx { inner })
    }
}

/// Future returned by [`Cx::cancelled`].
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Cancellation {
    listener: CancelListener,
}

impl Future for Cancellation {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.listener.poll_cancelled(cx.waker()) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test, poll_once};

    #[test]
    fn checkpoint_without_cancel() {
        init_test("checkpoint_without_cancel");
        let cx = Cx::for_testing();
        assert!(cx.checkpoint().is_ok());
        crate::test_complete!("checkpoint_without_cancel");
    }

    #[test]
    fn checkpoint_with_cancel() {
        init_test("checkpoint_with_cancel");
        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);
        let err = cx.checkpoint();
        crate::assert_with_log!(err.is_err(), "checkpoint fails", true, err.is_err());
        crate::test_complete!("checkpoint_with_cancel");
    }

    #[test]
    fn reset_clears_flag() {
        let cx = Cx::for_testing();
        cx.cancel();
        cx.set_cancel_requested(false);
        assert!(cx.checkpoint().is_ok());
    }

    #[test]
    fn child_follows_parent() {
        init_test("child_follows_parent");
        let parent = Cx::new();
        let child = parent.child();
        let grandchild = child.child();

        child.cancel();
        crate::assert_with_log!(
            !parent.is_cancel_requested(),
            "parent unaffected by child",
            false,
            parent.is_cancel_requested()
        );

        let sibling = parent.child();
        parent.cancel();
        assert!(sibling.is_cancel_requested());
        assert!(grandchild.is_cancel_requested());

        let late = parent.child();
        assert!(late.is_cancel_requested(), "child of cancelled parent");
        crate::test_complete!("child_follows_parent");
    }

    #[test]
    fn weak_cancel_is_noop_after_drop() {
        let cx = Cx::new();
        let weak = cx.downgrade();
        assert!(weak.upgrade().is_some());
        drop(cx);
        weak.cancel();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn cancelled_future_resolves_after_cancel() {
        init_test("cancelled_future_resolves_after_cancel");
        let cx = Cx::new();
        let mut fut = cx.cancelled();
        assert!(poll_once(&mut fut).is_none());
        cx.cancel();
        assert!(poll_once(&mut fut).is_some());
        crate::test_complete!("cancelled_future_resolves_after_cancel");
    }
}
