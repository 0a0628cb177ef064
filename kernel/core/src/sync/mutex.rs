//! Async-aware mutual exclusion lock.
//!
//! Unlike [`SpinLock`](crate::sync::SpinLock), [`Mutex`] parks the current
//! task on a [`Rendez`] when contended, so it may be held across suspension
//! points. The superblock busy lock and the execargs pool use it.

use core::cell::UnsafeCell;
use core::future::Future;
use core::ops::{Deref, DerefMut};
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::{Context, Poll};

use crate::sync::Rendez;

/// An async-aware mutual exclusion lock.
///
/// When contended, waiting tasks yield to the executor and are woken via
/// the lock's [`Rendez`] when it becomes available.
pub struct Mutex<T> {
    locked: AtomicBool,
    waiters: Rendez,
    data: UnsafeCell<T>,
}

// SAFETY: The Mutex ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different threads.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new unlocked `Mutex` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            waiters: Rendez::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Asynchronously acquires the lock.
    pub fn lock(&self) -> MutexLockFuture<'_, T> {
        MutexLockFuture { mutex: self }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }
}

/// Future returned by [`Mutex::lock`].
pub struct MutexLockFuture<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> Future for MutexLockFuture<'a, T> {
    type Output = MutexGuard<'a, T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // Fast path.
        if let Some(guard) = self.mutex.try_lock() {
            return Poll::Ready(guard);
        }

        // Register BEFORE retrying so a release between the first attempt
        // and registration cannot strand us.
        self.mutex.waiters.register_waker(cx.waker());

        if let Some(guard) = self.mutex.try_lock() {
            return Poll::Ready(guard);
        }

        Poll::Pending
    }
}

/// RAII guard that releases the [`Mutex`] when dropped.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
        self.mutex.waiters.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::test_waker::{counting_waker, noop_waker};
    use core::sync::atomic::Ordering;

    #[test]
    fn try_lock_when_free() {
        let mutex = Mutex::new(42);
        let guard = mutex.try_lock();
        assert!(guard.is_some());
        assert_eq!(*guard.unwrap(), 42);
    }

    #[test]
    fn try_lock_when_held() {
        let mutex = Mutex::new(42);
        let _guard = mutex.try_lock().unwrap();
        assert!(mutex.try_lock().is_none());
    }

    #[test]
    fn lock_future_ready_when_free() {
        let mutex = Mutex::new(7);
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = mutex.lock();
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(_)));
    }

    #[test]
    fn lock_future_pending_when_held() {
        let mutex = Mutex::new(7);
        let _guard = mutex.try_lock().unwrap();

        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = mutex.lock();
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Pending));
    }

    #[test]
    fn guard_drop_wakes_waiter() {
        let mutex = Mutex::new(7);
        let guard = mutex.try_lock().unwrap();

        let (waker, count) = counting_waker();
        let mut cx = Context::from_waker(&waker);
        let mut fut = mutex.lock();
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Pending));

        drop(guard);
        assert!(count.load(Ordering::SeqCst) > 0, "waiter should be woken");
    }

    #[test]
    fn guard_mutates_value() {
        let mutex = Mutex::new(0);
        {
            let mut guard = mutex.try_lock().unwrap();
            *guard = 13;
        }
        assert_eq!(*mutex.try_lock().unwrap(), 13);
    }
}
