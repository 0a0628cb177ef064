//! Signal delivery state.
//!
//! Only delivery is modeled: pending and masked sets, registered
//! dispositions, and the interaction with blocking calls. A delivered
//! signal interrupts a queued (not yet received) synchronous IPC send
//! and wakes `sigsuspend` sleepers. Handler trampolines and full POSIX
//! semantics are out of scope.

use alloc::sync::Arc;

use bit_field::BitField;

use cheviot_core::Errno;
use cheviot_core::id::Pid;
use cheviot_core::sync::{Rendez, SpinLock};

use crate::context::Kernel;
use crate::proc::Process;

/// Number of signals.
pub const NSIG: usize = 32;

/// Kill.
pub const SIGKILL: u32 = 9;
/// Termination request.
pub const SIGTERM: u32 = 15;
/// Segmentation violation.
pub const SIGSEGV: u32 = 11;

/// Restart interrupted syscalls instead of failing them with `EINTR`.
pub const SA_RESTART: u32 = 1 << 0;

/// One registered disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigAction {
    /// Handler address in the process image (0 = default).
    pub handler: u64,
    /// `SA_*` flags.
    pub flags: u32,
    /// Signals blocked while the handler runs.
    pub mask: u32,
}

struct SignalInner {
    pending: u32,
    mask: u32,
    actions: [SigAction; NSIG],
}

/// A process's signal state.
pub struct SignalState {
    inner: SpinLock<SignalInner>,
    /// Woken on delivery (sigsuspend sleeps here).
    pub rendez: Rendez,
}

impl SignalState {
    /// Creates a state with nothing pending, nothing masked.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(SignalInner {
                pending: 0,
                mask: 0,
                actions: [SigAction::default(); NSIG],
            }),
            rendez: Rendez::new(),
        }
    }

    /// Fork: dispositions and mask copy, pending signals clear.
    pub fn fork_clone(&self) -> Self {
        let inner = self.inner.lock();
        Self {
            inner: SpinLock::new(SignalInner {
                pending: 0,
                mask: inner.mask,
                actions: inner.actions,
            }),
            rendez: Rendez::new(),
        }
    }

    /// Marks `sig` pending. Returns `false` for out-of-range signals.
    pub fn raise(&self, sig: u32) -> bool {
        if sig == 0 || sig as usize >= NSIG {
            return false;
        }
        self.inner.lock().pending.set_bit(sig as usize, true);
        self.rendez.wakeup_all();
        true
    }

    /// Pending, unmasked signals.
    pub fn deliverable(&self) -> u32 {
        let inner = self.inner.lock();
        inner.pending & !inner.mask
    }

    /// Takes (clears and returns) the lowest deliverable signal.
    pub fn take_deliverable(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        let ready = inner.pending & !inner.mask;
        if ready == 0 {
            return None;
        }
        let sig = ready.trailing_zeros();
        inner.pending.set_bit(sig as usize, false);
        Some(sig)
    }

    /// The registered action for `sig`.
    pub fn action(&self, sig: u32) -> Option<SigAction> {
        if sig == 0 || sig as usize >= NSIG {
            return None;
        }
        Some(self.inner.lock().actions[sig as usize])
    }

    /// Registers an action, returning the previous one. `SIGKILL`'s
    /// disposition cannot change.
    pub fn set_action(&self, sig: u32, action: SigAction) -> Result<SigAction, Errno> {
        if sig == 0 || sig as usize >= NSIG || sig == SIGKILL {
            return Err(Errno::EINVAL);
        }
        let mut inner = self.inner.lock();
        let old = inner.actions[sig as usize];
        inner.actions[sig as usize] = action;
        Ok(old)
    }

    /// Current mask.
    pub fn mask(&self) -> u32 {
        self.inner.lock().mask
    }

    /// Replaces the mask (`SIGKILL` stays unmaskable), returning the
    /// old one.
    pub fn set_mask(&self, mask: u32) -> u32 {
        let mut inner = self.inner.lock();
        let old = inner.mask;
        inner.mask = mask & !(1 << SIGKILL);
        old
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// `sigprocmask` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigMaskHow {
    /// Add the given signals to the mask.
    Block,
    /// Remove the given signals from the mask.
    Unblock,
    /// Replace the mask.
    SetMask,
}

impl Kernel {
    /// Sends `sig` to `pid`.
    ///
    /// Marks the signal pending, wakes signal sleepers, and unwinds a
    /// queued (not yet received) IPC send with `EINTR` unless the
    /// disposition asks for restart.
    ///
    /// # Errors
    ///
    /// `ESRCH` for unknown pids, `EINVAL` for bad signal numbers.
    pub fn sys_kill(self: &Arc<Self>, pid: Pid, sig: u32) -> Result<(), Errno> {
        let target = self.lookup_process(pid).ok_or(Errno::ESRCH)?;
        if !target.signals.raise(sig) {
            return Err(Errno::EINVAL);
        }

        let restart = target
            .signals
            .action(sig)
            .map(|a| a.flags & SA_RESTART != 0)
            .unwrap_or(false);
        if !restart {
            // Unwind an in-flight send still sitting on a port queue.
            for sb in self.fs.mounts.list() {
                if sb.port.interrupt(pid) {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Registers a signal disposition, returning the previous one.
    pub fn sys_sigaction(
        self: &Arc<Self>,
        process: &Arc<Process>,
        sig: u32,
        action: SigAction,
    ) -> Result<SigAction, Errno> {
        process.signals.set_action(sig, action)
    }

    /// Adjusts the signal mask, returning the previous mask.
    pub fn sys_sigprocmask(
        self: &Arc<Self>,
        process: &Arc<Process>,
        how: SigMaskHow,
        set: u32,
    ) -> u32 {
        let old = process.signals.mask();
        let new = match how {
            SigMaskHow::Block => old | set,
            SigMaskHow::Unblock => old & !set,
            SigMaskHow::SetMask => set,
        };
        process.signals.set_mask(new);
        old
    }

    /// Temporarily installs `mask` and sleeps until a deliverable signal
    /// arrives, then restores the mask. Always returns `EINTR`.
    pub async fn sys_sigsuspend(
        self: &Arc<Self>,
        process: &Arc<Process>,
        mask: u32,
    ) -> Errno {
        let old = process.signals.set_mask(mask);
        while process.signals.deliverable() == 0 {
            process.signals.rendez.wait().await;
        }
        process.signals.set_mask(old);
        Errno::EINTR
    }
}
