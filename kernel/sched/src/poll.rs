//! Polling helpers for bridging sync and async code.

use alloc::sync::Arc;
use alloc::task::Wake;
use core::future::Future;
use core::pin::pin;
use core::task::{Context, Poll, Waker};

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

/// Creates a [`Waker`] that does nothing when woken.
pub fn noop_waker() -> Waker {
    Waker::from(Arc::new(NoopWake))
}

/// Polls `future` once; returns `Some(output)` if it completed immediately.
pub fn try_poll_immediate<T>(future: impl Future<Output = T>) -> Option<T> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    match pin!(future).poll(&mut cx) {
        Poll::Ready(val) => Some(val),
        Poll::Pending => None,
    }
}

/// Polls `future`, which must complete without suspending.
///
/// # Panics
///
/// Panics if the future returns `Pending`. Use for operations that are
/// synchronous by construction (e.g. ramfs lookups already in memory).
pub fn poll_immediate<T>(future: impl Future<Output = T>) -> T {
    try_poll_immediate(future).expect("poll_immediate: future suspended")
}

/// Yields the current task to the back of its ready queue once.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: core::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_immediate_ready() {
        assert_eq!(poll_immediate(async { 5 }), 5);
    }

    #[test]
    fn try_poll_immediate_pending() {
        let rendez = cheviot_core::sync::Rendez::new();
        assert!(try_poll_immediate(async { rendez.wait().await }).is_none());
    }

    #[test]
    fn yield_now_completes_on_second_poll() {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = yield_now();
        assert!(matches!(core::pin::Pin::new(&mut fut).poll(&mut cx), Poll::Pending));
        assert!(matches!(
            core::pin::Pin::new(&mut fut).poll(&mut cx),
            Poll::Ready(())
        ));
    }
}
