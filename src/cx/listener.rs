//! Waker registration against a [`Cx`].

use std::task::Waker;

use super::Cx;

/// Registers the waker of a suspended operation with a context so that
/// cancelling the context wakes the operation.
///
/// The registration is removed on drop.
#[derive(Debug)]
pub(crate) struct CancelListener {
    cx: Cx,
    slot: Option<(usize, u64)>,
}

impl CancelListener {
    pub(crate) fn new(cx: &Cx) -> Self {
        Self {
            cx: cx.clone(),
            slot: None,
        }
    }

    pub(crate) fn cx(&self) -> &Cx {
        &self.cx
    }

    /// Returns true if cancellation has been requested; otherwise registers
    /// (or refreshes) `waker` so a later cancellation wakes it.
    ///
    /// The flag is checked under the same lock that cancellation takes to
    /// drain listeners, so a cancel racing with registration is never missed.
    pub(crate) fn poll_cancelled(&mut self, waker: &Waker) -> bool {
        let mut state = self.cx.inner.state.lock();
        if state.cancel_requested {
            return true;
        }

        let epoch = state.epoch;
        match self.slot {
            Some((key, slot_epoch)) if slot_epoch == epoch => {
                if let Some(existing) = state.listeners.get_mut(key) {
                    if !existing.will_wake(waker) {
                        existing.clone_from(waker);
                    }
                }
            }
            _ => {
                let key = state.listeners.insert(waker.clone());
                self.slot = Some((key, epoch));
            }
        }
        false
    }
}

impl Drop for CancelListener {
    fn drop(&mut self) {
        if let Some((key, slot_epoch)) = self.slot.take() {
            let mut state = self.cx.inner.state.lock();
            if state.epoch == slot_epoch && state.listeners.contains(key) {
                state.listeners.remove(key);
            }
        }
    }
}
