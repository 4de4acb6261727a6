//! One-shot or pulsed event.

use super::{Condvar, Mutex};
use crate::cx::Cx;
use crate::error::Cancelled;

/// An event that waiters suspend on until it is signalled.
///
/// `signal(false)` leaves the event set, so later waits return immediately.
/// `signal(true)` pulses it: current waiters are released and the event is
/// left clear.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    changed: Condvar,
}

impl Event {
    /// Creates an event in the cleared state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns immediately if the event is set, otherwise suspends until the
    /// next [`signal`](Self::signal).
    pub async fn wait(&self, cx: &Cx) -> Result<(), Cancelled> {
        let guard = self.signaled.lock(cx).await?;
        if *guard {
            return Ok(());
        }
        self.changed.wait(cx, &self.signaled, guard).await?;
        Ok(())
    }

    /// Wakes every waiter. The event is left set unless `reset` is true.
    pub async fn signal(&self, reset: bool) {
        let mut signaled = self.signaled.lock_uncancelled().await;
        *signaled = !reset;
        self.changed.notify_all();
    }

    /// Clears the event without waking anyone.
    pub async fn reset(&self) {
        *self.signaled.lock_uncancelled().await = false;
    }

    /// Returns true if the event is set.
    pub async fn is_signaled(&self) -> bool {
        *self.signaled.lock_uncancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{init_test, poll_once};
    use futures_lite::future;

    #[test]
    fn pulse_wakes_and_clears() {
        init_test("pulse_wakes_and_clears");
        let cx = Cx::for_testing();
        let event = Event::new();

        let mut waiter = Box::pin(event.wait(&cx));
        assert!(poll_once(&mut waiter).is_none());

        future::block_on(event.signal(true));
        assert!(matches!(poll_once(&mut waiter), Some(Ok(()))));
        let set = future::block_on(event.is_signaled());
        crate::assert_with_log!(!set, "pulse leaves event clear", false, set);

        let mut late = Box::pin(event.wait(&cx));
        assert!(poll_once(&mut late).is_none(), "late waiter suspends");
        future::block_on(event.signal(true));
        assert!(poll_once(&mut late).is_some());
        crate::test_complete!("pulse_wakes_and_clears");
    }

    #[test]
    fn sticky_signal_releases_later_waits() {
        init_test("sticky_signal_releases_later_waits");
        let cx = Cx::for_testing();
        let event = Event::new();

        future::block_on(event.signal(false));
        assert!(future::block_on(event.is_signaled()));
        let mut wait = Box::pin(event.wait(&cx));
        assert!(matches!(poll_once(&mut wait), Some(Ok(()))));

        future::block_on(event.reset());
        let mut wait = Box::pin(event.wait(&cx));
        assert!(poll_once(&mut wait).is_none());
        future::block_on(event.signal(false));
        assert!(poll_once(&mut wait).is_some());
        crate::test_complete!("sticky_signal_releases_later_waits");
    }

    #[test]
    fn cancelled_wait() {
        let cx = Cx::for_testing();
        let event = Event::new();
        let mut wait = Box::pin(event.wait(&cx));
        assert!(poll_once(&mut wait).is_none());
        cx.cancel();
        assert!(matches!(poll_once(&mut wait), Some(Err(Cancelled))));
    }
}
