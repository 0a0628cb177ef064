//! Hashed timing wheel with hardclock / softclock separation.
//!
//! The hardclock top half runs in (virtual) interrupt context and only
//! advances `(seconds, jiffy)` counters. The softclock bottom half sweeps
//! the wheel from its own position up to the hardclock, one jiffy bucket at
//! a time, firing expired timers. The wheel has [`JIFFIES_PER_SECOND`]
//! buckets, so times of 1.01s, 2.01s, 3.01s share a bucket; a relative
//! timer carries the count of whole-second sweeps left before it fires, an
//! absolute timer the second it fires in.
//!
//! A fired timer invokes its target exactly once per arming.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};

use cheviot_core::sync::{Rendez, SpinLock};
use cheviot_core::sync::rendez::WaitFuture;

/// Timer interrupt rate: jiffies per second (10 ms per jiffy).
pub const JIFFIES_PER_SECOND: u64 = 100;

/// Indicator that a timed sleep expired before its rendez was woken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepTimedOut;

/// Identifier of an armed timer, usable to disarm it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

/// What a timer does when it fires.
pub enum TimerTarget {
    /// Wake a suspended task.
    Waker(Waker),
    /// Run a callback (event raising, flusher kicks).
    Callback(Box<dyn FnOnce() + Send>),
}

enum Expiry {
    /// Whole-second sweeps remaining before firing.
    Relative { seconds_left: u64 },
    /// Fires when the softclock second matches.
    Absolute { seconds: u64 },
}

struct WheelEntry {
    id: TimerId,
    expiry: Expiry,
    target: Option<TimerTarget>,
}

struct Wheel {
    soft_seconds: u64,
    soft_jiffy: u64,
    buckets: Vec<Vec<WheelEntry>>,
    next_id: u64,
    armed: usize,
}

/// The kernel's clock and timing wheel.
pub struct Timers {
    hard_seconds: AtomicU64,
    hard_jiffy: AtomicU64,
    wheel: SpinLock<Wheel>,
}

impl Timers {
    /// Creates a timer subsystem at time zero.
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(JIFFIES_PER_SECOND as usize);
        for _ in 0..JIFFIES_PER_SECOND {
            buckets.push(Vec::new());
        }
        Self {
            hard_seconds: AtomicU64::new(0),
            hard_jiffy: AtomicU64::new(0),
            wheel: SpinLock::new(Wheel {
                soft_seconds: 0,
                soft_jiffy: 0,
                buckets,
                next_id: 1,
                armed: 0,
            }),
        }
    }

    // ── hardclock (top half) ────────────────────────────────────────

    /// Advances the hardclock by one jiffy. Interrupt context only: no
    /// timer is fired here.
    pub fn hardclock_tick(&self) {
        let jiffy = self.hard_jiffy.load(Ordering::Relaxed) + 1;
        if jiffy >= JIFFIES_PER_SECOND {
            self.hard_jiffy.store(0, Ordering::Relaxed);
            self.hard_seconds.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hard_jiffy.store(jiffy, Ordering::Relaxed);
        }
    }

    /// Returns the hardclock as `(seconds, jiffy)`.
    pub fn system_time(&self) -> (u64, u64) {
        (
            self.hard_seconds.load(Ordering::Relaxed),
            self.hard_jiffy.load(Ordering::Relaxed),
        )
    }

    /// Returns the hardclock in total jiffies since boot.
    pub fn hard_ticks(&self) -> u64 {
        let (s, j) = self.system_time();
        s * JIFFIES_PER_SECOND + j
    }

    /// Returns the softclock in total jiffies since boot.
    pub fn soft_ticks(&self) -> u64 {
        let wheel = self.wheel.lock();
        wheel.soft_seconds * JIFFIES_PER_SECOND + wheel.soft_jiffy
    }

    // ── softclock (bottom half) ─────────────────────────────────────

    /// Sweeps the wheel from the softclock up to the hardclock, firing
    /// expired timers. Returns the number of timers fired.
    pub fn run_softclock(&self) -> usize {
        let mut fired: Vec<TimerTarget> = Vec::new();

        loop {
            let hard = self.hard_ticks();
            let mut wheel = self.wheel.lock();
            let soft = wheel.soft_seconds * JIFFIES_PER_SECOND + wheel.soft_jiffy;
            if soft >= hard {
                break;
            }

            // Advance one jiffy and sweep its bucket.
            wheel.soft_jiffy += 1;
            if wheel.soft_jiffy >= JIFFIES_PER_SECOND {
                wheel.soft_jiffy = 0;
                wheel.soft_seconds += 1;
            }
            let second = wheel.soft_seconds;
            let bucket_idx = wheel.soft_jiffy as usize;

            let fired_before = fired.len();
            let bucket = &mut wheel.buckets[bucket_idx];
            let mut kept = Vec::with_capacity(bucket.len());
            for mut entry in bucket.drain(..) {
                let fire = match &mut entry.expiry {
                    Expiry::Relative { seconds_left } => {
                        if *seconds_left == 0 {
                            true
                        } else {
                            *seconds_left -= 1;
                            false
                        }
                    }
                    Expiry::Absolute { seconds } => *seconds == second,
                };
                if fire {
                    if let Some(target) = entry.target.take() {
                        fired.push(target);
                    }
                } else {
                    kept.push(entry);
                }
            }
            let newly_fired = fired.len() - fired_before;
            wheel.armed = wheel.armed.saturating_sub(newly_fired);
            wheel.buckets[bucket_idx] = kept;
        }

        // Invoke targets outside the wheel lock.
        let count = fired.len();
        for target in fired {
            match target {
                TimerTarget::Waker(waker) => waker.wake(),
                TimerTarget::Callback(f) => f(),
            }
        }
        count
    }

    // ── arming ──────────────────────────────────────────────────────

    /// Arms a timer to fire `ticks` jiffies from now (minimum one).
    pub fn arm_relative(&self, ticks: u64, target: TimerTarget) -> TimerId {
        let ticks = ticks.max(1);
        let now_jiffy = self.hard_jiffy.load(Ordering::Relaxed);
        let bucket = ((now_jiffy + ticks) % JIFFIES_PER_SECOND) as usize;
        // The bucket is swept once per wheel turn; the first sweep after
        // arming happens within one turn, so a deadline of exactly k turns
        // needs k-1 skipped sweeps, not k.
        let seconds_left = (ticks - 1) / JIFFIES_PER_SECOND;
        self.insert(bucket, Expiry::Relative { seconds_left }, target)
    }

    /// Arms a timer to fire at the absolute time `(seconds, jiffy)`.
    pub fn arm_absolute(&self, seconds: u64, jiffy: u64, target: TimerTarget) -> TimerId {
        let bucket = (jiffy % JIFFIES_PER_SECOND) as usize;
        self.insert(bucket, Expiry::Absolute { seconds }, target)
    }

    fn insert(&self, bucket: usize, expiry: Expiry, target: TimerTarget) -> TimerId {
        let mut wheel = self.wheel.lock();
        let id = TimerId(wheel.next_id);
        wheel.next_id += 1;
        wheel.armed += 1;
        wheel.buckets[bucket].push(WheelEntry {
            id,
            expiry,
            target: Some(target),
        });
        id
    }

    /// Disarms a timer. Returns `true` if it had not fired yet.
    pub fn disarm(&self, id: TimerId) -> bool {
        let mut wheel = self.wheel.lock();
        for bucket in wheel.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|e| e.id == id) {
                bucket.remove(pos);
                wheel.armed -= 1;
                return true;
            }
        }
        false
    }

    /// Number of timers currently armed.
    pub fn armed_count(&self) -> usize {
        self.wheel.lock().armed
    }

    // ── sleep futures ───────────────────────────────────────────────

    /// Sleeps for at least `ticks` jiffies.
    pub fn sleep(&self, ticks: u64) -> Sleep<'_> {
        Sleep {
            timers: self,
            deadline: self.hard_ticks() + ticks,
            armed: None,
        }
    }

    /// Waits on `rendez` with an optional timeout in jiffies.
    ///
    /// Resolves to `Ok(())` when the rendez is woken, or
    /// `Err(SleepTimedOut)` when the timeout expires first.
    pub fn timed_wait<'a>(
        &'a self,
        rendez: &'a Rendez,
        timeout_ticks: Option<u64>,
    ) -> TimedWait<'a> {
        TimedWait {
            timers: self,
            wait: rendez.wait(),
            deadline: timeout_ticks.map(|t| self.hard_ticks() + t),
            armed: None,
        }
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

/// Future returned by [`Timers::sleep`].
pub struct Sleep<'a> {
    timers: &'a Timers,
    deadline: u64,
    armed: Option<TimerId>,
}

impl Future for Sleep<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.timers.hard_ticks() >= self.deadline {
            if let Some(id) = self.armed.take() {
                self.timers.disarm(id);
            }
            return Poll::Ready(());
        }
        // Re-arm on every pending poll: a spurious wake consumed the wheel
        // entry, and leaving none armed would strand the sleeper.
        if let Some(id) = self.armed.take() {
            self.timers.disarm(id);
        }
        let ticks = self.deadline - self.timers.hard_ticks();
        self.armed = Some(
            self.timers
                .arm_relative(ticks, TimerTarget::Waker(cx.waker().clone())),
        );
        Poll::Pending
    }
}

impl Drop for Sleep<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.armed.take() {
            self.timers.disarm(id);
        }
    }
}

/// Future returned by [`Timers::timed_wait`].
pub struct TimedWait<'a> {
    timers: &'a Timers,
    wait: WaitFuture<'a>,
    deadline: Option<u64>,
    armed: Option<TimerId>,
}

impl Future for TimedWait<'_> {
    type Output = Result<(), SleepTimedOut>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let timed_out = self
            .deadline
            .is_some_and(|d| self.timers.hard_ticks() >= d);

        match Pin::new(&mut self.wait).poll(cx) {
            Poll::Ready(()) => {
                if let Some(id) = self.armed.take() {
                    self.timers.disarm(id);
                }
                Poll::Ready(if timed_out { Err(SleepTimedOut) } else { Ok(()) })
            }
            Poll::Pending => {
                if timed_out {
                    if let Some(id) = self.armed.take() {
                        self.timers.disarm(id);
                    }
                    return Poll::Ready(Err(SleepTimedOut));
                }
                if let Some(deadline) = self.deadline {
                    if let Some(id) = self.armed.take() {
                        self.timers.disarm(id);
                    }
                    let ticks = deadline - self.timers.hard_ticks();
                    self.armed = Some(
                        self.timers
                            .arm_relative(ticks, TimerTarget::Waker(cx.waker().clone())),
                    );
                }
                Poll::Pending
            }
        }
    }
}

impl Drop for TimedWait<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.armed.take() {
            self.timers.disarm(id);
        }
    }
}
