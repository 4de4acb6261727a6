//! Cancellation contexts.
//!
//! Every suspending operation in this crate takes a [`Cx`]. The context is
//! how a caller that stays alive asks an in-progress operation to give up:
//! cancelling the context wakes every waiter parked under it, and the waiter
//! resolves with [`Cancelled`](crate::Cancelled) unless it has already been
//! granted (grant wins the race).
//!
//! Dropping a suspended future is the other way to cancel; it never produces
//! a result but still removes the waiter from its queue.

#[allow(clippy::module_inception)]
mod cx;
mod listener;

pub use cx::{Cancellation, Cx, WeakCx};
pub(crate) use listener::CancelListener;
