//! Cancelling a scheduler's jobs when it goes out of scope.

use std::future::Future;

use super::{Scheduler, Work};

/// Forwards to a scheduler and cancels all of its jobs when dropped.
#[derive(Debug)]
pub struct ScopedScheduler<S: Scheduler> {
    scheduler: S,
}

impl<S: Scheduler> ScopedScheduler<S> {
    /// Wraps `scheduler`.
    pub fn new(scheduler: S) -> Self {
        Self { scheduler }
    }

    /// The wrapped scheduler.
    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }
}

impl<S: Scheduler> Scheduler for ScopedScheduler<S> {
    type Config = S::Config;
    type Handle = S::Handle;

    fn schedule(&self, config: S::Config, work: Work) -> impl Future<Output = S::Handle> + Send {
        self.scheduler.schedule(config, work)
    }

    fn cancel_all(&self) {
        self.scheduler.cancel_all();
    }
}

impl<S: Scheduler> Drop for ScopedScheduler<S> {
    fn drop(&mut self) {
        tracing::trace!("scoped scheduler dropped, cancelling jobs");
        self.scheduler.cancel_all();
    }
}
