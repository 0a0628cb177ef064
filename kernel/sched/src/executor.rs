//! Single-CPU run-queue executor.
//!
//! Tasks are spawned into one of three priority bands and polled FIFO
//! within a band, highest band first: the async rendition of priority
//! round-robin. Wakers re-enqueue their task id. When every band drains,
//! the installed [`IdleHandler`] runs; the kernel's handler advances the
//! virtual clock one tick and runs softclock, standing in for the
//! enable-interrupts-and-halt idle loop of a real CPU.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::task::Wake;
use core::future::Future;
use core::pin::Pin;
use core::sync::atomic::{AtomicU64, Ordering};
use core::task::{Context, Poll, Waker};

use cheviot_core::sync::SpinLock;

/// Identifier of a spawned task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    /// Returns the raw id value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Scheduling band of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Runs ahead of everything else (timer bottom half, flusher kicks).
    Critical,
    /// Default band for process and server tasks.
    Normal,
    /// Runs only when nothing else is ready.
    Background,
}

type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Task {
    future: TaskFuture,
    priority: Priority,
}

/// Hook invoked when the ready queues drain.
///
/// Returns `true` if the handler made progress (e.g. advanced the clock and
/// fired timers) and the executor should keep running, `false` to stop.
pub trait IdleHandler {
    /// Called with all ready queues empty.
    fn idle(&self) -> bool;
}

/// A no-progress idle handler: the executor stops as soon as it idles.
pub struct HaltOnIdle;

impl IdleHandler for HaltOnIdle {
    fn idle(&self) -> bool {
        false
    }
}

struct ExecutorInner {
    ready: [SpinLock<VecDeque<TaskId>>; 3],
    tasks: SpinLock<BTreeMap<TaskId, Task>>,
    next_id: AtomicU64,
}

impl ExecutorInner {
    fn enqueue(&self, id: TaskId, priority: Priority) {
        let band = match priority {
            Priority::Critical => 0,
            Priority::Normal => 1,
            Priority::Background => 2,
        };
        let mut queue = self.ready[band].lock();
        if !queue.contains(&id) {
            queue.push_back(id);
        }
    }

    fn dequeue(&self) -> Option<TaskId> {
        for band in &self.ready {
            if let Some(id) = band.lock().pop_front() {
                return Some(id);
            }
        }
        None
    }
}

struct TaskWaker {
    id: TaskId,
    priority: Priority,
    inner: Arc<ExecutorInner>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.inner.enqueue(self.id, self.priority);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.inner.enqueue(self.id, self.priority);
    }
}

/// The kernel task executor.
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Creates an empty executor.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                ready: [
                    SpinLock::new(VecDeque::new()),
                    SpinLock::new(VecDeque::new()),
                    SpinLock::new(VecDeque::new()),
                ],
                tasks: SpinLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Spawns a task at [`Priority::Normal`].
    pub fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) -> TaskId {
        self.spawn_with(Priority::Normal, future)
    }

    /// Spawns a task at the given priority.
    pub fn spawn_with(
        &self,
        priority: Priority,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> TaskId {
        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.tasks.lock().insert(
            id,
            Task {
                future: Box::pin(future),
                priority,
            },
        );
        self.inner.enqueue(id, priority);
        id
    }

    /// Returns `true` while the task exists (not yet run to completion).
    pub fn is_live(&self, id: TaskId) -> bool {
        self.inner.tasks.lock().contains_key(&id)
    }

    /// Polls ready tasks until every band is empty.
    ///
    /// Each pass takes the task out of the table, polls it once, and puts
    /// it back unless it completed. Tasks woken during their own poll are
    /// re-queued and picked up in a later pass.
    pub fn run_until_idle(&self) {
        while let Some(id) = self.inner.dequeue() {
            // A completed task may leave a stale queue entry behind.
            let Some(mut task) = self.inner.tasks.lock().remove(&id) else {
                continue;
            };

            let waker = Waker::from(Arc::new(TaskWaker {
                id,
                priority: task.priority,
                inner: self.inner.clone(),
            }));
            let mut cx = Context::from_waker(&waker);

            match task.future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {}
                Poll::Pending => {
                    self.inner.tasks.lock().insert(id, task);
                }
            }
        }
    }

    /// Runs tasks to quiescence, consulting `idle` whenever the ready
    /// queues drain. Returns when the handler reports no more progress.
    pub fn run(&self, idle: &dyn IdleHandler) {
        loop {
            self.run_until_idle();
            if !idle.idle() {
                return;
            }
        }
    }

    /// Drives `future` to completion, servicing spawned tasks and the idle
    /// handler while it is pending.
    ///
    /// # Panics
    ///
    /// Panics if the system quiesces (no ready tasks, idle handler out of
    /// progress) while the future is still pending, i.e. a deadlock.
    pub fn block_on<T>(&self, idle: &dyn IdleHandler, future: impl Future<Output = T>) -> T {
        let mut future = core::pin::pin!(future);
        let (waker, woken) = flag_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            woken.store(false, Ordering::SeqCst);
            if let Poll::Ready(val) = future.as_mut().poll(&mut cx) {
                return val;
            }

            loop {
                self.run_until_idle();
                if woken.load(Ordering::SeqCst) {
                    break;
                }
                assert!(
                    idle.idle(),
                    "block_on: system quiesced with the root future still pending"
                );
            }
        }
    }

    /// Number of live tasks.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

fn flag_waker() -> (Waker, Arc<core::sync::atomic::AtomicBool>) {
    use core::sync::atomic::AtomicBool;

    struct FlagWaker(Arc<AtomicBool>);

    impl Wake for FlagWaker {
        fn wake(self: Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }

        fn wake_by_ref(self: &Arc<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    let flag = Arc::new(AtomicBool::new(false));
    (Waker::from(Arc::new(FlagWaker(flag.clone()))), flag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheviot_core::sync::Rendez;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn spawned_task_runs() {
        let ex = Executor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ex.spawn(async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        ex.run_until_idle();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(ex.task_count(), 0);
    }

    #[test]
    fn critical_runs_before_normal() {
        let ex = Executor::new();
        let order = Arc::new(SpinLock::new(Vec::new()));

        let o = order.clone();
        ex.spawn(async move {
            o.lock().push("normal");
        });
        let o = order.clone();
        ex.spawn_with(Priority::Critical, async move {
            o.lock().push("critical");
        });

        ex.run_until_idle();
        assert_eq!(*order.lock(), vec!["critical", "normal"]);
    }

    #[test]
    fn rendez_handoff_between_tasks() {
        let ex = Executor::new();
        let rendez = Arc::new(Rendez::new());
        let flag = Arc::new(AtomicUsize::new(0));

        let (r, f) = (rendez.clone(), flag.clone());
        ex.spawn(async move {
            while f.load(Ordering::SeqCst) == 0 {
                r.wait().await;
            }
            f.store(2, Ordering::SeqCst);
        });

        let (r, f) = (rendez.clone(), flag.clone());
        ex.spawn(async move {
            f.store(1, Ordering::SeqCst);
            r.wakeup();
        });

        ex.run_until_idle();
        assert_eq!(flag.load(Ordering::SeqCst), 2, "sleeper observed the update");
    }

    #[test]
    fn block_on_interleaves_tasks() {
        let ex = Executor::new();
        let rendez = Arc::new(Rendez::new());
        let done = Arc::new(AtomicUsize::new(0));

        let (r, d) = (rendez.clone(), done.clone());
        ex.spawn(async move {
            d.store(1, Ordering::SeqCst);
            r.wakeup_all();
        });

        let r = rendez.clone();
        let d = done.clone();
        let result = ex.block_on(&HaltOnIdle, async move {
            while d.load(Ordering::SeqCst) == 0 {
                r.wait().await;
            }
            99
        });
        assert_eq!(result, 99);
    }

    #[test]
    #[should_panic(expected = "quiesced")]
    fn block_on_detects_deadlock() {
        let ex = Executor::new();
        let rendez = Rendez::new();
        ex.block_on(&HaltOnIdle, async move {
            rendez.wait().await; // nobody will wake us
        });
    }
}
