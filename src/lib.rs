//! Cooperative synchronization primitives and job schedulers.
//!
//! `coopsync` provides async locks and signals whose waits are cancellable
//! through an explicit context, plus a family of schedulers built on them.
//!
//! # Modules
//!
//! - [`cx`]: [`Cx`], the cancellation context every suspending call takes
//! - [`sync`]: mutex, reader/writer lock, condition variable, semaphore,
//!   countdown latch, event and fence
//! - [`scheduler`]: serial, bounded-concurrency, batching, pool, trapping,
//!   scoped and durable schedulers, and the awaitable
//!   [`ScheduledTask`](scheduler::ScheduledTask)
//! - [`runtime`]: the small multi-threaded executor the schedulers run on
//!
//! # Cancellation
//!
//! A suspended operation ends in exactly one of two ways: it is granted, or
//! its [`Cx`] is cancelled first and it returns [`Cancelled`]. A grant that
//! races with cancellation wins. Dropping a suspended future also withdraws
//! it.
//!
//! # Example
//!
//! ```
//! use coopsync::Cx;
//! use coopsync::sync::Mutex;
//!
//! let cx = Cx::new();
//! let counter = Mutex::new(0);
//! futures_lite::future::block_on(async {
//!     *counter.lock(&cx).await? += 1;
//!     Ok::<_, coopsync::Cancelled>(())
//! })?;
//! assert_eq!(counter.into_inner(), 1);
//! # Ok::<(), coopsync::Cancelled>(())
//! ```

pub mod config;
pub mod cx;
pub mod error;
pub mod runtime;
pub mod scheduler;
pub mod sync;

#[cfg(test)]
mod test_utils;

pub use cx::{Cancellation, Cx, WeakCx};
pub use error::{BoxError, Cancelled, Error, Result};
