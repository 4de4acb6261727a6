//! Error types shared by the primitives and the schedulers.
//!
//! Errors fall into three groups:
//!
//! - **Cancellation**: a suspended or queued operation was cancelled before
//!   it produced a result. Always distinguishable from failure.
//! - **Work failure**: caller-supplied work returned an error. Propagated as
//!   the result of the job, never swallowed (unless a
//!   [`TrappingScheduler`](crate::scheduler::TrappingScheduler) diverts it).
//! - **Faults**: lifetime bugs such as dropping a
//!   [`Condvar`](crate::sync::Condvar) with outstanding waiters. These panic.

use std::sync::Arc;

/// Boxed error type carried by [`Error::WorkFailed`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A suspended operation was cancelled before it was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Error produced by scheduled work and by awaited scheduler tasks.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The job was cancelled before (or while) producing a result.
    #[error("operation cancelled")]
    Cancelled,
    /// The work itself failed.
    #[error("work failed: {0}")]
    WorkFailed(#[source] Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    /// Wraps an arbitrary error as a work failure.
    pub fn failed<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::WorkFailed(Arc::from(err.into()))
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<Cancelled> for Error {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::WorkFailed(a), Self::WorkFailed(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

/// Convenience alias used by scheduled work.
pub type Result<T, E = Error> = std::result::Result<T, E>;
