//! Waker utilities for polling futures in host-side tests without a real
//! executor. Built on `core`/`alloc` so downstream kernel crates can use
//! them from their own test modules.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::{RawWaker, RawWakerVTable, Waker};

/// Creates a [`Waker`] that does nothing when woken.
pub fn noop_waker() -> Waker {
    fn noop(_: *const ()) {}
    fn clone(p: *const ()) -> RawWaker {
        RawWaker::new(p, &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    // SAFETY: All vtable entries are no-ops over a null data pointer.
    unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) }
}

/// Creates a [`Waker`] that increments a counter each time it is woken.
///
/// Returns the waker and the shared counter tracking wake calls.
pub fn counting_waker() -> (Waker, Arc<AtomicUsize>) {
    let counter = Arc::new(AtomicUsize::new(0));
    let data = Arc::into_raw(counter.clone()) as *const ();

    unsafe fn clone(data: *const ()) -> RawWaker {
        // SAFETY: `data` is a valid `Arc<AtomicUsize>` from `Arc::into_raw`.
        let arc = unsafe { Arc::from_raw(data as *const AtomicUsize) };
        let cloned = arc.clone();
        let _ = Arc::into_raw(arc); // keep original alive
        RawWaker::new(Arc::into_raw(cloned) as *const (), &VTABLE)
    }

    unsafe fn wake(data: *const ()) {
        // SAFETY: `data` is a valid `Arc<AtomicUsize>` from `Arc::into_raw`.
        let arc = unsafe { Arc::from_raw(data as *const AtomicUsize) };
        arc.fetch_add(1, Ordering::SeqCst);
        // arc dropped here (consumed)
    }

    unsafe fn wake_by_ref(data: *const ()) {
        // SAFETY: `data` is a valid `Arc<AtomicUsize>` from `Arc::into_raw`.
        let arc = unsafe { Arc::from_raw(data as *const AtomicUsize) };
        arc.fetch_add(1, Ordering::SeqCst);
        let _ = Arc::into_raw(arc); // keep alive
    }

    unsafe fn drop_waker(data: *const ()) {
        // SAFETY: `data` is a valid `Arc<AtomicUsize>` from `Arc::into_raw`.
        unsafe { drop(Arc::from_raw(data as *const AtomicUsize)) };
    }

    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop_waker);

    // SAFETY: The vtable upholds the Arc refcount contract above.
    let waker = unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) };
    (waker, counter)
}
