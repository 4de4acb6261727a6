//! Diverting job failures to a handler.

use futures_lite::future::Boxed;
use std::future::Future;
use std::sync::Arc;

use super::{Scheduler, Work};
use crate::cx::Cx;
use crate::error::Error;

/// Receives failures trapped by a [`TrappingScheduler`].
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Per-job configuration for a [`TrappingScheduler`].
pub struct TrappingConfig<C> {
    /// Configuration passed to the wrapped scheduler.
    pub base: C,
    /// Overrides the scheduler-wide handler for this job.
    pub error_handler: Option<ErrorHandler>,
}

impl<C: Default> Default for TrappingConfig<C> {
    fn default() -> Self {
        Self {
            base: C::default(),
            error_handler: None,
        }
    }
}

impl<C: Clone> Clone for TrappingConfig<C> {
    fn clone(&self) -> Self {
        Self {
            base: self.base.clone(),
            error_handler: self.error_handler.clone(),
        }
    }
}

impl<C: std::fmt::Debug> std::fmt::Debug for TrappingConfig<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrappingConfig")
            .field("base", &self.base)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

/// Wraps a scheduler so that work failures go to a handler instead of
/// failing the job. Cancellation still propagates.
pub struct TrappingScheduler<S> {
    base: S,
    error_handler: ErrorHandler,
}

impl<S> TrappingScheduler<S> {
    /// Wraps `base`, sending failures to `error_handler`.
    pub fn new(base: S, error_handler: ErrorHandler) -> Self {
        Self {
            base,
            error_handler,
        }
    }

    /// The wrapped scheduler.
    pub fn base(&self) -> &S {
        &self.base
    }
}

fn trap(work: Work, handler: ErrorHandler) -> Work {
    Arc::new(move |cx: Cx| -> Boxed<Result<(), Error>> {
        let running = work(cx);
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            match running.await {
                Err(err) if !err.is_cancelled() => {
                    tracing::debug!(error = %err, "trapped job failure");
                    handler(&err);
                    Ok(())
                }
                other => other,
            }
        })
    })
}

impl<S: Scheduler> Scheduler for TrappingScheduler<S> {
    type Config = TrappingConfig<S::Config>;
    type Handle = S::Handle;

    fn schedule(
        &self,
        config: Self::Config,
        work: Work,
    ) -> impl Future<Output = S::Handle> + Send {
        let handler = config
            .error_handler
            .unwrap_or_else(|| Arc::clone(&self.error_handler));
        self.base.schedule(config.base, trap(work, handler))
    }

    fn cancel_all(&self) {
        self.base.cancel_all();
    }
}

impl<S: std::fmt::Debug> std::fmt::Debug for TrappingScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrappingScheduler")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}
