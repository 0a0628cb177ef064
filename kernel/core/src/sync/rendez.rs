//! Rendez: the kernel's wait channel.
//!
//! A rendezvous point for one waker and many sleepers. Tasks call
//! [`Rendez::wait`] inside a condition loop; other tasks call
//! [`Rendez::wakeup`] (one sleeper, FIFO) or [`Rendez::wakeup_all`] after
//! changing the condition. A wakeup is a hint, not a handoff: woken tasks
//! must re-check their condition and sleep again if it does not hold.

use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use crate::sync::SpinLock;

/// A wait channel with FIFO wakeup order.
pub struct Rendez {
    waiters: SpinLock<Vec<Waker>>,
}

impl Rendez {
    /// Creates an empty rendez.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(Vec::new()),
        }
    }

    /// Returns a future that completes when this rendez is woken.
    ///
    /// Callers sleep in a loop:
    ///
    /// ```ignore
    /// while !condition() {
    ///     rendez.wait().await;
    /// }
    /// ```
    pub fn wait(&self) -> WaitFuture<'_> {
        WaitFuture {
            rendez: self,
            registered: None,
        }
    }

    /// Wakes the longest-sleeping task, if any.
    pub fn wakeup(&self) {
        let mut waiters = self.waiters.lock();
        if !waiters.is_empty() {
            let waker = waiters.remove(0);
            drop(waiters);
            waker.wake();
        }
    }

    /// Wakes every sleeping task.
    pub fn wakeup_all(&self) {
        let mut waiters = self.waiters.lock();
        let drained: Vec<Waker> = waiters.drain(..).collect();
        drop(waiters);
        for waker in drained {
            waker.wake();
        }
    }

    /// Registers a waker directly, without creating a future.
    ///
    /// Used by [`Mutex`](crate::sync::Mutex) to register interest before
    /// retrying acquisition.
    pub fn register_waker(&self, waker: &Waker) {
        self.waiters.lock().push(waker.clone());
    }

    /// Returns the number of currently registered sleepers.
    pub fn sleeper_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for Rendez {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Rendez::wait`].
pub struct WaitFuture<'a> {
    rendez: &'a Rendez,
    registered: Option<Waker>,
}

impl Future for WaitFuture<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(mine) = self.registered.take() {
            // Polled again after registration: a wakeup arrived. Withdraw
            // our slot if a spurious re-poll left it queued.
            let mut waiters = self.rendez.waiters.lock();
            if let Some(pos) = waiters.iter().position(|w| w.will_wake(&mine)) {
                waiters.remove(pos);
            }
            Poll::Ready(())
        } else {
            let waker = cx.waker().clone();
            self.rendez.waiters.lock().push(waker.clone());
            self.registered = Some(waker);
            Poll::Pending
        }
    }
}

impl Drop for WaitFuture<'_> {
    fn drop(&mut self) {
        let Some(mine) = self.registered.take() else {
            return;
        };
        // Cancelled mid-sleep. If our slot is still queued, withdraw it;
        // otherwise a wakeup meant for us was consumed, so pass it along.
        let mut waiters = self.rendez.waiters.lock();
        if let Some(pos) = waiters.iter().position(|w| w.will_wake(&mine)) {
            waiters.remove(pos);
        } else {
            drop(waiters);
            self.rendez.wakeup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_waker::{counting_waker, noop_waker};
    use core::sync::atomic::Ordering;

    #[test]
    fn wait_pending_then_ready() {
        let rendez = Rendez::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = rendez.wait();

        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Pending));
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(())));
    }

    #[test]
    fn wakeup_is_fifo() {
        let rendez = Rendez::new();
        let (w1, c1) = counting_waker();
        let (w2, c2) = counting_waker();
        rendez.register_waker(&w1);
        rendez.register_waker(&w2);

        rendez.wakeup();
        assert!(c1.load(Ordering::SeqCst) > 0, "first sleeper wakes first");
        assert_eq!(c2.load(Ordering::SeqCst), 0, "second sleeper still asleep");

        rendez.wakeup();
        assert!(c2.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn wakeup_all_wakes_everyone() {
        let rendez = Rendez::new();
        let (w1, c1) = counting_waker();
        let (w2, c2) = counting_waker();
        rendez.register_waker(&w1);
        rendez.register_waker(&w2);

        rendez.wakeup_all();
        assert!(c1.load(Ordering::SeqCst) > 0);
        assert!(c2.load(Ordering::SeqCst) > 0);
        assert_eq!(rendez.sleeper_count(), 0);
    }

    #[test]
    fn wakeup_empty_no_panic() {
        let rendez = Rendez::new();
        rendez.wakeup();
        rendez.wakeup_all();
    }

    #[test]
    fn cancelled_waiter_withdraws_quietly() {
        let rendez = Rendez::new();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = rendez.wait();
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Pending));
        assert_eq!(rendez.sleeper_count(), 1);

        drop(fut);
        assert_eq!(rendez.sleeper_count(), 0, "cancelled slot removed");
    }

    #[test]
    fn cancelled_waiter_forwards_consumed_wakeup() {
        let rendez = Rendez::new();

        // First sleeper registers, then is woken (slot consumed).
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = rendez.wait();
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Pending));

        let (w2, c2) = counting_waker();
        rendez.register_waker(&w2);

        rendez.wakeup();
        assert_eq!(c2.load(Ordering::SeqCst), 0);

        // The woken future is dropped instead of completing; the wakeup it
        // swallowed must reach the next sleeper.
        drop(fut);
        assert!(c2.load(Ordering::SeqCst) > 0);
    }
}
