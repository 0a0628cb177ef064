//! Synchronization primitives.
//!
//! Three tiers, matching how long a lock is held:
//! [`SpinLock`] for short list/table surgery, [`Rendez`] as the wait
//! channel that suspended tasks sleep on, and [`Mutex`] for exclusivity
//! that spans suspension points.

mod mutex;
mod spinlock;

pub mod rendez;
pub mod test_waker;

pub use mutex::{Mutex, MutexGuard};
pub use rendez::Rendez;
pub use spinlock::{SpinLock, SpinLockGuard};
