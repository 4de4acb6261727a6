//! Shared helpers for unit tests.

use futures_lite::future::Boxed;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::runtime::Spawn;

/// Installs a test-writer tracing subscriber once per process.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

pub(crate) fn init_test(test_name: &str) {
    init_test_logging();
    crate::test_phase!(test_name);
}

/// Polls a future once with a no-op waker.
///
/// `async` blocks are not `Unpin`; pass them through `Box::pin` first.
pub(crate) fn poll_once<F: Future + Unpin>(future: &mut F) -> Option<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    match Pin::new(future).poll(&mut cx) {
        Poll::Ready(v) => Some(v),
        Poll::Pending => None,
    }
}

/// A [`Spawn`] that holds futures until the test runs them, for
/// deterministic scheduler tests.
#[derive(Default)]
pub(crate) struct ManualSpawner {
    queued: parking_lot::Mutex<Vec<Boxed<()>>>,
}

impl ManualSpawner {
    pub(crate) fn queued(&self) -> usize {
        self.queued.lock().len()
    }

    /// Runs queued futures to completion on this thread, including ones
    /// spawned meanwhile. Returns how many ran.
    pub(crate) fn run_queued(&self) -> usize {
        let mut ran = 0;
        loop {
            let batch: Vec<_> = self.queued.lock().drain(..).collect();
            if batch.is_empty() {
                return ran;
            }
            for future in batch {
                futures_lite::future::block_on(future);
                ran += 1;
            }
        }
    }
}

impl Spawn for ManualSpawner {
    fn spawn_boxed(&self, future: Boxed<()>) {
        self.queued.lock().push(future);
    }
}

/// Marks the start of a test in the log.
#[macro_export]
#[doc(hidden)]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Marks the successful end of a test in the log.
#[macro_export]
#[doc(hidden)]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Assertion that logs expected and actual values before failing.
#[macro_export]
#[doc(hidden)]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
