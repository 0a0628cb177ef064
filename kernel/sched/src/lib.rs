//! Kernel task scheduler and timer subsystem.
//!
//! The executor runs every kernel task (process bodies, file system server
//! loops, the write-behind flusher) on a single CPU. Tasks suspend at
//! explicit points (rendez waits, IPC sends, cache misses, timer sleeps)
//! and the ready queue is drained FIFO per priority band, which keeps whole
//! kernel runs deterministic on a host.
//!
//! Timekeeping is split the classic way: the hardclock top half only
//! advances counters, and the softclock bottom half sweeps the hashed
//! timing wheel to fire expired timers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod executor;
pub mod timer;

mod poll;

pub use executor::{Executor, HaltOnIdle, IdleHandler, Priority, TaskId};
pub use poll::{noop_waker, poll_immediate, try_poll_immediate, yield_now};
pub use timer::{JIFFIES_PER_SECOND, SleepTimedOut, TimerId, TimerTarget, Timers};
