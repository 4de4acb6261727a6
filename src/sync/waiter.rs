//! Waiter queues with one-shot resumption slots.
//!
//! Every primitive in this module keeps its fields and a [`WaiterQueue`]
//! inside one `parking_lot::Mutex`. A caller that cannot proceed pushes a
//! waiter while holding that lock and gets back a [`Waiter`]; the queue keeps
//! the matching [`Resumer`]. Resuming consumes the `Resumer`, so a waiter can
//! be resumed at most once.
//!
//! A resumption that lands before the waiter is polled again is stored in the
//! slot and consumed on the next poll. Cancellation is decided by the waiter
//! itself, under the primitive's lock: if its entry is still queued it removes
//! it and reports [`Cancelled`](crate::Cancelled); if the entry is gone the
//! resumption has already been delivered and it wins.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use crate::cx::CancelListener;

/// Wakers collected inside an exclusive section and woken after leaving it.
pub(crate) type WakeList = SmallVec<[Waker; 8]>;

pub(crate) fn wake_all(wakers: WakeList) {
    for waker in wakers {
        waker.wake();
    }
}

/// Identity of a queued waiter, unique within its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WaiterId(u64);

#[derive(Debug)]
enum SlotState<T> {
    Empty(Option<Waker>),
    Filled(T),
    Taken,
    Abandoned,
}

#[derive(Debug)]
struct Slot<T> {
    state: Mutex<SlotState<T>>,
}

/// Creates a connected resumer/suspended pair.
pub(crate) fn resumption<T>() -> (Resumer<T>, Suspended<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(SlotState::Empty(None)),
    });
    (
        Resumer {
            slot: Some(Arc::clone(&slot)),
        },
        Suspended { slot },
    )
}

/// The filling half of a one-shot slot.
///
/// Dropping a `Resumer` without resuming abandons the slot and wakes the
/// suspended side, which then observes `None`.
#[derive(Debug)]
pub(crate) struct Resumer<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Resumer<T> {
    /// Fills the slot and returns the waker to wake once the caller has left
    /// its exclusive section.
    pub(crate) fn resume(mut self, value: T) -> Option<Waker> {
        let slot = self.slot.take()?;
        let mut state = slot.state.lock();
        match std::mem::replace(&mut *state, SlotState::Filled(value)) {
            SlotState::Empty(waker) => waker,
            // The suspended side gave up before we got here.
            other => {
                *state = other;
                None
            }
        }
    }

    /// Discards the resumer without waking anyone.
    fn dismiss(mut self) {
        if let Some(slot) = self.slot.take() {
            let mut state = slot.state.lock();
            if matches!(*state, SlotState::Empty(_)) {
                *state = SlotState::Taken;
            }
        }
    }
}

impl<T> Drop for Resumer<T> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let waker = {
            let mut state = slot.state.lock();
            match std::mem::replace(&mut *state, SlotState::Abandoned) {
                SlotState::Empty(waker) => waker,
                other => {
                    *state = other;
                    None
                }
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// The waiting half of a one-shot slot.
#[derive(Debug)]
pub(crate) struct Suspended<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Suspended<T> {
    /// Returns the value if resumed, `Ready(None)` if the resumer was dropped,
    /// and otherwise stores `waker` for the eventual resumption.
    pub(crate) fn poll_resumed(&mut self, waker: &Waker) -> Poll<Option<T>> {
        let mut state = self.slot.state.lock();
        match &mut *state {
            SlotState::Empty(stored) => {
                match stored {
                    Some(existing) if existing.will_wake(waker) => {}
                    _ => *stored = Some(waker.clone()),
                }
                Poll::Pending
            }
            SlotState::Filled(_) => match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Filled(value) => Poll::Ready(Some(value)),
                _ => unreachable!("slot state changed under lock"),
            },
            SlotState::Taken | SlotState::Abandoned => Poll::Ready(None),
        }
    }

    /// Takes the value if the slot has been filled, without registering.
    pub(crate) fn try_take(&mut self) -> Option<T> {
        let mut state = self.slot.state.lock();
        if matches!(*state, SlotState::Filled(_)) {
            if let SlotState::Filled(value) = std::mem::replace(&mut *state, SlotState::Taken) {
                return Some(value);
            }
        }
        None
    }
}

/// Outcome of one poll of a queued waiter.
#[derive(Debug)]
pub(crate) enum WaitStep<T> {
    /// The waiter was resumed with a value.
    Resumed(T),
    /// The waiter's context was cancelled; the caller must try to dequeue.
    CancelRequested,
    /// The queue owning the resumer went away.
    Abandoned,
    Pending,
}

/// A caller's handle to its queued entry.
#[derive(Debug)]
pub(crate) struct Waiter<T = ()> {
    id: WaiterId,
    suspended: Suspended<T>,
}

impl<T> Waiter<T> {
    pub(crate) fn id(&self) -> WaiterId {
        self.id
    }

    /// Checks the slot first, then the cancellation context, registering the
    /// task's waker with both.
    pub(crate) fn poll_step(
        &mut self,
        task: &mut Context<'_>,
        listener: &mut CancelListener,
    ) -> WaitStep<T> {
        match self.suspended.poll_resumed(task.waker()) {
            Poll::Ready(Some(value)) => return WaitStep::Resumed(value),
            Poll::Ready(None) => return WaitStep::Abandoned,
            Poll::Pending => {}
        }
        if listener.poll_cancelled(task.waker()) {
            WaitStep::CancelRequested
        } else {
            WaitStep::Pending
        }
    }

    /// Takes an already delivered resumption. Used after a failed dequeue,
    /// which proves the resumption happened.
    pub(crate) fn take_resumed(&mut self) -> Option<T> {
        self.suspended.try_take()
    }
}

#[derive(Debug)]
struct Entry<K, T> {
    id: WaiterId,
    kind: K,
    resumer: Resumer<T>,
}

/// FIFO queue of waiters tagged with a per-primitive kind `K` and resumed
/// with a value of type `T`.
#[derive(Debug)]
pub(crate) struct WaiterQueue<K = (), T = ()> {
    entries: VecDeque<Entry<K, T>>,
    next_id: u64,
}

impl<K, T> Default for WaiterQueue<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> WaiterQueue<K, T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(4),
            next_id: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a waiter at the back.
    pub(crate) fn push(&mut self, kind: K) -> Waiter<T> {
        let id = WaiterId(self.next_id);
        self.next_id += 1;
        let (resumer, suspended) = resumption();
        self.entries.push_back(Entry { id, kind, resumer });
        Waiter { id, suspended }
    }

    /// Removes a still-queued waiter. Returns false if it was already resumed.
    pub(crate) fn remove(&mut self, id: WaiterId) -> bool {
        let position = if self.entries.front().is_some_and(|entry| entry.id == id) {
            Some(0)
        } else {
            self.entries.iter().position(|entry| entry.id == id)
        };
        match position.and_then(|index| self.entries.remove(index)) {
            Some(entry) => {
                entry.resumer.dismiss();
                true
            }
            None => false,
        }
    }

    pub(crate) fn any(&self, mut predicate: impl FnMut(&K) -> bool) -> bool {
        self.entries.iter().any(|entry| predicate(&entry.kind))
    }

    /// Resumes the oldest waiter with `value`.
    pub(crate) fn resume_front(&mut self, value: T, wakers: &mut WakeList) -> bool {
        match self.entries.pop_front() {
            Some(entry) => {
                wakers.extend(entry.resumer.resume(value));
                true
            }
            None => false,
        }
    }

    /// Resumes waiters from the front for as long as `admit` returns a value,
    /// stopping at the first waiter it refuses.
    pub(crate) fn resume_while(
        &mut self,
        mut admit: impl FnMut(&K) -> Option<T>,
        wakers: &mut WakeList,
    ) -> usize {
        let mut resumed = 0;
        while let Some(front) = self.entries.front() {
            let Some(value) = admit(&front.kind) else {
                break;
            };
            if let Some(entry) = self.entries.pop_front() {
                wakers.extend(entry.resumer.resume(value));
                resumed += 1;
            }
        }
        resumed
    }

    /// Resumes every queued waiter.
    pub(crate) fn resume_all(&mut self, value: T, wakers: &mut WakeList) -> usize
    where
        T: Clone,
    {
        let count = self.entries.len();
        for entry in self.entries.drain(..) {
            wakers.extend(entry.resumer.resume(value.clone()));
        }
        count
    }
}
