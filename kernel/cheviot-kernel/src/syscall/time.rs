//! Timer and interrupt syscalls.
//!
//! A user timer is a handle-table object; arming it inserts a wheel
//! timer whose firing raises an event on the handle (observed through
//! `EVFILT_TIMER`) exactly once per arming. Interrupt sources work the
//! same way through `EVFILT_IRQ`.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use cheviot_core::Errno;
use cheviot_core::event::Listeners;
use cheviot_core::id::Fd;
use cheviot_core::sync::SpinLock;
use cheviot_sched::{JIFFIES_PER_SECOND, TimerId, TimerTarget, Timers};

use crate::context::Kernel;
use crate::handle::{Filp, FilpObject, OpenFlags};
use crate::proc::Process;

/// Relative timer expiry.
pub const TIMER_RELATIVE: u32 = 0;
/// Absolute timer expiry.
pub const TIMER_ABSOLUTE: u32 = 1;

/// A user timer object behind a handle.
pub struct UserTimer {
    armed: SpinLock<Option<TimerId>>,
    fired: AtomicBool,
    /// Raised once per arming when the timer fires.
    pub listeners: Listeners,
}

impl UserTimer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: SpinLock::new(None),
            fired: AtomicBool::new(false),
            listeners: Listeners::new(),
        })
    }

    /// True once the current arming has fired.
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Disarms a pending expiry (close, re-arm).
    pub fn cancel(&self, timers: &Timers) {
        if let Some(id) = self.armed.lock().take() {
            timers.disarm(id);
        }
    }
}

impl Kernel {
    /// Creates an unarmed timer handle.
    pub fn sys_create_timer(self: &Arc<Self>, process: &Arc<Process>) -> Result<Fd, Errno> {
        let filp = Filp::new(FilpObject::Timer(UserTimer::new()), OpenFlags::READ);
        self.install_filp(process, filp)
    }

    /// Arms (or, with `None`, cancels) a timer.
    ///
    /// The expiry is `(seconds, jiffy)`, relative or absolute per
    /// `timer_type`. Re-arming replaces any pending expiry.
    pub fn sys_set_timer(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        timer_type: u32,
        expiry: Option<(u64, u64)>,
    ) -> Result<(), Errno> {
        let filp = process.handles.lock().get(fd)?;
        let FilpObject::Timer(ref timer) = filp.object else {
            return Err(Errno::EINVAL);
        };

        timer.cancel(&self.timers);
        timer.fired.store(false, Ordering::Release);

        let Some((seconds, jiffy)) = expiry else {
            return Ok(());
        };

        let target = {
            let timer = timer.clone();
            TimerTarget::Callback(alloc::boxed::Box::new(move || {
                timer.fired.store(true, Ordering::Release);
                *timer.armed.lock() = None;
                timer.listeners.fire(1);
            }))
        };

        let id = match timer_type {
            TIMER_RELATIVE => {
                let ticks = seconds * JIFFIES_PER_SECOND + jiffy;
                self.timers.arm_relative(ticks, target)
            }
            TIMER_ABSOLUTE => self.timers.arm_absolute(seconds, jiffy, target),
            _ => return Err(Errno::EINVAL),
        };
        *timer.armed.lock() = Some(id);
        Ok(())
    }

    /// The hardclock time as `(seconds, jiffy)`.
    pub fn sys_get_system_time(self: &Arc<Self>) -> (u64, u64) {
        self.timers.system_time()
    }

    /// Registers an interrupt source; `EVFILT_IRQ` on the returned
    /// handle observes raised interrupts.
    pub fn sys_create_interrupt(
        self: &Arc<Self>,
        process: &Arc<Process>,
        irq: u32,
    ) -> Result<Fd, Errno> {
        let listeners = {
            let mut irqs = self.irqs.lock();
            irqs.entry(irq)
                .or_insert_with(|| Arc::new(Listeners::new()))
                .clone()
        };
        let filp = Filp::new(FilpObject::Irq(irq, listeners), OpenFlags::READ);
        self.install_filp(process, filp)
    }
}
