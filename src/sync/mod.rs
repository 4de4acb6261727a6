//! Cancel-aware synchronization primitives.
//!
//! Every primitive keeps its state and its waiter queue behind one short
//! `parking_lot` critical section that never spans a suspension point.
//! A caller that cannot proceed is queued and suspended; the caller that
//! changes the state resumes exactly the waiters whose condition now holds.
//!
//! # Primitives
//!
//! - [`Mutex`]: FIFO mutual exclusion with direct ownership handoff
//! - [`RwLock`]: Readers/writer lock with an optional reader limit
//! - [`Condvar`]: Condition variable over any [`Lockable`]
//! - [`Semaphore`], [`CountdownLatch`], [`Event`]: built from `Mutex` + `Condvar`
//! - [`Fence`]: Event with synchronous signalling
//!
//! # Cancel Safety
//!
//! - Cancelling the [`Cx`](crate::Cx) of a suspended operation removes its
//!   waiter and yields [`Cancelled`](crate::Cancelled), unless the operation
//!   was already granted; a grant always wins.
//! - Dropping a suspended future removes its waiter; a grant it never
//!   observed is handed on to the next waiter.
//! - Guards release exactly once, on drop (including unwinding).

mod condvar;
mod event;
mod fence;
mod latch;
mod lockable;
mod mutex;
mod rwlock;
mod semaphore;
pub(crate) mod waiter;

pub use condvar::{Condvar, WaitCancelled};
pub use event::Event;
pub use fence::{Fence, FenceWait};
pub use latch::CountdownLatch;
pub use lockable::Lockable;
pub use mutex::{LockFuture, Mutex, MutexGuard, OwnedMutexGuard, TryLockError};
pub use rwlock::{
    Exclusive, ReadFuture, RwLock, RwLockReadGuard, RwLockWriteGuard, Shared, TryReadError,
    TryWriteError, WriteFuture,
};
pub use semaphore::Semaphore;
