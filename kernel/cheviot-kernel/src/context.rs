//! The kernel context.
//!
//! One [`Kernel`] owns every subsystem: executor, clock and wheel, page
//! frames, the VFS core and the process table. The idle handler stands in
//! for the hardware timer interrupt: whenever the executor runs out of
//! ready tasks, it advances the hardclock one jiffy and runs softclock,
//! which is what wakes sleepers and the write-behind flusher.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use cheviot_core::id::Pid;
use cheviot_core::sync::SpinLock;
use cheviot_fs::FsCore;
use cheviot_mm::FrameTable;
use cheviot_sched::{Executor, IdleHandler, Timers};

use crate::proc::Process;

/// Pseudo-pid used for kernel-initiated server traffic (boot lookups,
/// flusher strategy writes).
pub const KERNEL_PID: Pid = Pid::new(0);

/// The kernel: every subsystem, no globals.
pub struct Kernel {
    /// Task executor.
    pub executor: Executor,
    /// Clock and timing wheel.
    pub timers: Arc<Timers>,
    /// Physical page frames.
    pub frames: Arc<FrameTable>,
    /// The VFS.
    pub fs: Arc<FsCore>,
    /// Process table.
    pub procs: SpinLock<BTreeMap<Pid, Arc<Process>>>,
    next_pid: SpinLock<u32>,
    /// IRQ sources registered by `create_interrupt`.
    pub irqs: SpinLock<BTreeMap<u32, Arc<cheviot_core::event::Listeners>>>,
    /// The exec argv/env marshalling pool.
    pub execargs: crate::proc::exec::ExecArgsPool,
    /// The anonymous superblock backing pipe v-nodes, created lazily.
    pub(crate) anon_sb: SpinLock<Option<Arc<cheviot_fs::SuperBlock>>>,
    pub(crate) next_anon_ino: SpinLock<i64>,
}

impl Kernel {
    /// Builds a kernel over `mem_size` bytes of modeled RAM.
    pub fn new(mem_size: usize) -> Arc<Self> {
        let timers = Arc::new(Timers::new());
        Arc::new(Self {
            executor: Executor::new(),
            timers: timers.clone(),
            frames: FrameTable::new(mem_size),
            fs: FsCore::new(timers),
            procs: SpinLock::new(BTreeMap::new()),
            next_pid: SpinLock::new(1),
            irqs: SpinLock::new(BTreeMap::new()),
            execargs: crate::proc::exec::ExecArgsPool::new(),
            anon_sb: SpinLock::new(None),
            next_anon_ino: SpinLock::new(1),
        })
    }

    /// Allocates the next process id.
    pub fn alloc_pid(&self) -> Pid {
        let mut next = self.next_pid.lock();
        let pid = Pid::new(*next);
        *next += 1;
        pid
    }

    /// Registers a process in the table.
    pub fn register_process(&self, process: &Arc<Process>) {
        self.procs.lock().insert(process.pid, process.clone());
    }

    /// Looks a process up by pid.
    pub fn lookup_process(&self, pid: Pid) -> Option<Arc<Process>> {
        self.procs.lock().get(&pid).cloned()
    }

    /// Removes a process from the table (reaped by waitpid).
    pub fn unregister_process(&self, pid: Pid) {
        self.procs.lock().remove(&pid);
    }

    /// Children of `parent`, in pid order.
    pub fn children_of(&self, parent: Pid) -> alloc::vec::Vec<Arc<Process>> {
        self.procs
            .lock()
            .values()
            .filter(|p| p.parent() == Some(parent))
            .cloned()
            .collect()
    }

    /// Raises an interrupt: every registered watcher of `irq` fires.
    pub fn irq_raise(&self, irq: u32) {
        let listeners = self.irqs.lock().get(&irq).cloned();
        if let Some(listeners) = listeners {
            listeners.fire(irq);
        }
    }

    /// Drives `future` to completion, running kernel tasks and advancing
    /// the virtual clock while it is pending. The entry point for boot
    /// and for every whole-kernel test.
    pub fn run<T>(self: &Arc<Self>, future: impl core::future::Future<Output = T>) -> T {
        let idle = KernelIdle { kernel: self };
        self.executor.block_on(&idle, future)
    }
}

/// Idle handler: the virtual timer interrupt.
///
/// When the ready queues drain, a real CPU would halt until the next
/// interrupt; here we advance the hardclock one jiffy and run softclock.
/// Progress stops only when no timer is armed, which `block_on` reports
/// as a deadlock of the root future.
struct KernelIdle<'a> {
    kernel: &'a Arc<Kernel>,
}

impl IdleHandler for KernelIdle<'_> {
    fn idle(&self) -> bool {
        let timers = &self.kernel.timers;
        if timers.armed_count() == 0 {
            return false;
        }
        timers.hardclock_tick();
        timers.run_softclock();
        true
    }
}
