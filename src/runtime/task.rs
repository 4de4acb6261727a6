//! Spawned tasks and their wakers.

use futures_lite::future::Boxed;
use parking_lot::Mutex;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::task::{Context, Poll, Wake, Waker};

use super::worker::Shared;

/// Not queued and not running; waiting for a wake.
const IDLE: u8 = 0;
/// Sitting in the injector.
const SCHEDULED: u8 = 1;
const RUNNING: u8 = 2;
/// Woken while running; must be polled again.
const NOTIFIED: u8 = 3;
const COMPLETE: u8 = 4;

/// A spawned future together with its scheduling state.
///
/// A task is in the injector at most once: only the transition out of `IDLE`
/// pushes it, and a wake that arrives while the task runs is recorded as
/// `NOTIFIED` and turned into a reschedule when the poll returns.
pub(crate) struct Task {
    id: u64,
    /// Key in the runtime's live-task table.
    key: usize,
    state: AtomicU8,
    future: Mutex<Option<Boxed<()>>>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Task {
    pub(crate) fn new(id: u64, key: usize, future: Boxed<()>, shared: Arc<Shared>) -> Arc<Self> {
        Arc::new(Self {
            id,
            key,
            state: AtomicU8::new(SCHEDULED),
            future: Mutex::new(Some(future)),
            shared,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Polls the task once. Called by a worker that popped it.
    pub(crate) fn run(self: &Arc<Self>) {
        self.state.store(RUNNING, Ordering::Release);
        let waker = Waker::from(Arc::clone(self));
        let mut context = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            self.state.store(COMPLETE, Ordering::Release);
            return;
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut context)));
        match outcome {
            Ok(Poll::Pending) => {
                drop(slot);
                if self
                    .state
                    .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Woken during the poll.
                    self.state.store(SCHEDULED, Ordering::Release);
                    self.shared.push(Arc::clone(self));
                }
            }
            Ok(Poll::Ready(())) => {
                let future = slot.take();
                drop(slot);
                drop(future);
                self.complete();
            }
            Err(payload) => {
                let future = slot.take();
                drop(slot);
                tracing::error!(
                    task = self.id,
                    panic = panic_message(payload.as_ref()),
                    "task panicked"
                );
                drop(future);
                self.complete();
            }
        }
    }

    fn complete(&self) {
        self.state.store(COMPLETE, Ordering::Release);
        self.shared.task_done(self.key);
    }

    /// Drops the future without polling it. Used at shutdown.
    pub(crate) fn cancel(&self) {
        let future = self.future.lock().take();
        self.state.store(COMPLETE, Ordering::Release);
        drop(future);
    }

    fn schedule(self: &Arc<Self>) {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => SCHEDULED,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == IDLE {
            self.shared.push(Arc::clone(self));
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
