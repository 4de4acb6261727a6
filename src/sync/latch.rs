//! Countdown latch.

use super::{Condvar, Mutex};
use crate::cx::Cx;
use crate::error::Cancelled;

/// A one-shot barrier that releases every waiter once it has been signalled
/// `count` times.
///
/// Once the count reaches zero the latch stays open: later waits return
/// immediately and further signals are ignored.
#[derive(Debug)]
pub struct CountdownLatch {
    count: Mutex<usize>,
    released: Condvar,
}

impl CountdownLatch {
    /// Creates a latch that opens after `count` signals.
    #[must_use]
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            released: Condvar::new(),
        }
    }

    /// Decrements the count, waking every waiter when it reaches zero.
    pub async fn signal(&self) {
        let mut count = self.count.lock_uncancelled().await;
        if *count == 0 {
            return;
        }
        *count -= 1;
        if *count == 0 {
            tracing::trace!(waiters = self.released.waiters(), "latch released");
            self.released.notify_all();
        }
    }

    /// Suspends until the count reaches zero.
    pub async fn wait(&self, cx: &Cx) -> Result<(), Cancelled> {
        let guard = self.count.lock(cx).await?;
        self.released
            .wait_until(cx, &self.count, guard, |count| **count == 0)
            .await?;
        Ok(())
    }

    /// Signals still needed before the latch opens.
    pub async fn count(&self) -> usize {
        *self.count.lock_uncancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test, poll_once};
    use futures_lite::future;

    #[test]
    fn releases_after_last_signal() {
        init_test("releases_after_last_signal");
        let cx = Cx::for_testing();
        let latch = CountdownLatch::new(3);

        let mut a = Box::pin(latch.wait(&cx));
        let mut b = Box::pin(latch.wait(&cx));
        assert!(poll_once(&mut a).is_none());
        assert!(poll_once(&mut b).is_none());

        future::block_on(latch.signal());
        future::block_on(latch.signal());
        let still_waiting = poll_once(&mut a).is_none();
        crate::assert_with_log!(still_waiting, "closed after two signals", true, still_waiting);

        future::block_on(latch.signal());
        assert!(matches!(poll_once(&mut a), Some(Ok(()))));
        assert!(matches!(poll_once(&mut b), Some(Ok(()))));
        crate::test_complete!("releases_after_last_signal");
    }

    #[test]
    fn stays_open_and_ignores_extra_signals() {
        let cx = Cx::for_testing();
        let latch = CountdownLatch::new(1);
        future::block_on(latch.signal());
        future::block_on(latch.signal());
        assert_eq!(future::block_on(latch.count()), 0);
        assert!(future::block_on(latch.wait(&cx)).is_ok());
    }

    #[test]
    fn zero_count_is_open() {
        let cx = Cx::for_testing();
        let latch = CountdownLatch::new(0);
        let mut wait = Box::pin(latch.wait(&cx));
        assert!(matches!(poll_once(&mut wait), Some(Ok(()))));
    }
}
