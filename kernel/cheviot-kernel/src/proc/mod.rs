//! Processes.
//!
//! A process owns an address space, a handle table, current/root
//! directory v-nodes, credentials and signal state. Process bodies run
//! as executor tasks; fork clones the address space copy-on-write and
//! the handle table share-by-share, exit turns the process into a
//! zombie, and waitpid reaps it.

pub mod exec;
pub mod signal;

use alloc::string::String;
use alloc::sync::Arc;

use cheviot_core::{Errno, kdebug, kinfo};
use cheviot_core::id::Pid;
use cheviot_core::sync::{Rendez, SpinLock};
use cheviot_fs::lookup::LookupStart;
use cheviot_fs::Vnode;
use cheviot_mm::SoftAddressSpace;

use crate::context::Kernel;
use crate::handle::HandleTable;
use signal::SignalState;

/// A process.
pub struct Process {
    /// Process id.
    pub pid: Pid,
    parent: SpinLock<Option<Pid>>,
    /// Address space.
    pub addr_space: SpinLock<SoftAddressSpace>,
    /// Handle table.
    pub handles: SpinLock<HandleTable>,
    /// Current working directory.
    pub cwd: SpinLock<Option<Arc<Vnode>>>,
    /// Root directory (changed by chroot).
    pub root_dir: SpinLock<Option<Arc<Vnode>>>,
    /// Owner uid.
    pub uid: SpinLock<u32>,
    /// Owner gid.
    pub gid: SpinLock<u32>,
    /// Signal delivery state.
    pub signals: SignalState,
    /// Exit status once the process has exited.
    pub exit_status: SpinLock<Option<i32>>,
    /// Woken when this process exits (parents sleep here in waitpid).
    pub exit_rendez: Rendez,
    /// Program entry point, set by exec.
    pub entry: SpinLock<u64>,
    /// Initial stack pointer, set by exec.
    pub stack_ptr: SpinLock<u64>,
    /// Program name, for diagnostics.
    pub name: SpinLock<String>,
    mmap_cursor: SpinLock<u64>,
}

/// Base of the per-process mmap region.
const MMAP_BASE: u64 = 0x2000_0000;

impl Process {
    /// Reserves a page-rounded virtual range for a new mapping.
    pub fn take_mmap_range(&self, len: u64) -> u64 {
        let page = cheviot_mm::PAGE_SIZE as u64;
        let rounded = (len + page - 1) & !(page - 1);
        let mut cursor = self.mmap_cursor.lock();
        let base = *cursor;
        // Leave a guard page between mappings.
        *cursor = base + rounded + page;
        base
    }
    /// The parent pid, if the process has one.
    pub fn parent(&self) -> Option<Pid> {
        *self.parent.lock()
    }

    /// True once the process has exited and awaits reaping.
    pub fn is_zombie(&self) -> bool {
        self.exit_status.lock().is_some()
    }

    /// The resolver start position for this process.
    ///
    /// # Errors
    ///
    /// `ENOENT` before the root file system is mounted.
    pub fn lookup_start(&self, kernel: &Kernel) -> Result<LookupStart, Errno> {
        let root = match self.root_dir.lock().clone() {
            Some(root) => root,
            None => kernel.fs.root()?,
        };
        let cwd = match self.cwd.lock().clone() {
            Some(cwd) => cwd,
            None => root.clone(),
        };
        Ok(LookupStart { root, cwd })
    }
}

impl Kernel {
    /// Creates a process with an empty address space and handle table.
    pub fn new_process(self: &Arc<Self>, name: &str, parent: Option<Pid>) -> Arc<Process> {
        let process = Arc::new(Process {
            pid: self.alloc_pid(),
            parent: SpinLock::new(parent),
            addr_space: SpinLock::new(SoftAddressSpace::new(self.frames.clone())),
            handles: SpinLock::new(HandleTable::new()),
            cwd: SpinLock::new(None),
            root_dir: SpinLock::new(None),
            uid: SpinLock::new(0),
            gid: SpinLock::new(0),
            signals: SignalState::new(),
            exit_status: SpinLock::new(None),
            exit_rendez: Rendez::new(),
            entry: SpinLock::new(0),
            stack_ptr: SpinLock::new(0),
            name: SpinLock::new(String::from(name)),
            mmap_cursor: SpinLock::new(MMAP_BASE),
        });
        self.register_process(&process);
        kdebug!("process {} created ({})", process.pid, name);
        process
    }

    /// Forks `parent`: copy-on-write address space, handle table with
    /// shares raised, same directories and credentials, cleared pending
    /// signals.
    pub fn sys_fork(self: &Arc<Self>, parent: &Arc<Process>) -> Result<Arc<Process>, Errno> {
        let addr_space: SoftAddressSpace = {
            let mut parent_space = parent.addr_space.lock();
            parent_space.fork()?
        };
        // Handles are shared descriptions: the child raises each filp's
        // share count, and pipe endpoint counts stay as they are (one
        // description, however many processes hold it).
        let handles = parent.handles.lock().fork_clone();

        let cwd = parent.cwd.lock().clone();
        if let Some(ref cwd) = cwd {
            self.fs.vnodes.incref(cwd);
        }
        let root_dir = parent.root_dir.lock().clone();
        if let Some(ref root) = root_dir {
            self.fs.vnodes.incref(root);
        }

        let child = Arc::new(Process {
            pid: self.alloc_pid(),
            parent: SpinLock::new(Some(parent.pid)),
            addr_space: SpinLock::new(addr_space),
            handles: SpinLock::new(handles),
            cwd: SpinLock::new(cwd),
            root_dir: SpinLock::new(root_dir),
            uid: SpinLock::new(*parent.uid.lock()),
            gid: SpinLock::new(*parent.gid.lock()),
            signals: parent.signals.fork_clone(),
            exit_status: SpinLock::new(None),
            exit_rendez: Rendez::new(),
            entry: SpinLock::new(*parent.entry.lock()),
            stack_ptr: SpinLock::new(*parent.stack_ptr.lock()),
            name: SpinLock::new(parent.name.lock().clone()),
            mmap_cursor: SpinLock::new(*parent.mmap_cursor.lock()),
        });
        self.register_process(&child);
        kdebug!("process {} forked from {}", child.pid, parent.pid);
        Ok(child)
    }

    /// Terminates `process`: closes every handle, releases directories
    /// and memory, records the exit status and wakes waiters.
    pub async fn sys_exit(self: &Arc<Self>, process: &Arc<Process>, status: i32) {
        let filps = process.handles.lock().drain();
        for filp in filps {
            self.release_filp(process, filp).await;
        }

        let cwd = process.cwd.lock().take();
        if let Some(cwd) = cwd {
            self.fs.vnode_put(process.pid, &cwd).await;
        }
        let root_dir = process.root_dir.lock().take();
        if let Some(root) = root_dir {
            self.fs.vnode_put(process.pid, &root).await;
        }

        process.addr_space.lock().reset();

        // Orphans lose their parent link; nothing reaps them here.
        for child in self.children_of(process.pid) {
            *child.parent.lock() = None;
        }

        *process.exit_status.lock() = Some(status);
        process.exit_rendez.wakeup_all();
        kinfo!("process {} exited with status {}", process.pid, status);
    }

    /// Waits for a child to exit and reaps it.
    ///
    /// `target` of `None` waits for any child. Returns the child's pid
    /// and exit status.
    ///
    /// # Errors
    ///
    /// `ECHILD` when the process has no (matching) children.
    pub async fn sys_waitpid(
        self: &Arc<Self>,
        process: &Arc<Process>,
        target: Option<Pid>,
    ) -> Result<(Pid, i32), Errno> {
        loop {
            let children = self.children_of(process.pid);
            let candidates: alloc::vec::Vec<Arc<Process>> = match target {
                Some(pid) => children.into_iter().filter(|c| c.pid == pid).collect(),
                None => children,
            };
            if candidates.is_empty() {
                return Err(Errno::ECHILD);
            }

            for child in &candidates {
                let status = *child.exit_status.lock();
                if let Some(status) = status {
                    self.unregister_process(child.pid);
                    return Ok((child.pid, status));
                }
            }

            // No candidate has exited yet; sleep on the first one's exit
            // rendez (any exit re-checks the whole set).
            candidates[0].exit_rendez.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_process_registers() {
        let kernel = Kernel::new(1024 * 1024);
        let proc = kernel.new_process("init", None);
        assert!(kernel.lookup_process(proc.pid).is_some());
        assert!(proc.parent().is_none());
        assert!(!proc.is_zombie());
    }

    #[test]
    fn fork_links_parent_and_copies_creds() {
        let kernel = Kernel::new(1024 * 1024);
        let parent = kernel.new_process("parent", None);
        *parent.uid.lock() = 7;

        let child = kernel.sys_fork(&parent).unwrap();
        assert_eq!(child.parent(), Some(parent.pid));
        assert_eq!(*child.uid.lock(), 7);
    }

    #[test]
    fn waitpid_reaps_exited_child() {
        let kernel = Kernel::new(1024 * 1024);
        let parent = kernel.new_process("parent", None);
        let child = kernel.sys_fork(&parent).unwrap();
        let child_pid = child.pid;

        let k = kernel.clone();
        let result = kernel.run(async move {
            k.sys_exit(&child, 3).await;
            k.sys_waitpid(&parent, None).await
        });
        let (pid, status) = result.unwrap();
        assert_eq!(pid, child_pid);
        assert_eq!(status, 3);
        assert!(kernel.lookup_process(child_pid).is_none(), "reaped");
    }

    #[test]
    fn waitpid_with_no_children_is_echild() {
        let kernel = Kernel::new(1024 * 1024);
        let lonely = kernel.new_process("lonely", None);
        let k = kernel.clone();
        let result = kernel.run(async move { k.sys_waitpid(&lonely, None).await });
        assert_eq!(result.unwrap_err(), Errno::ECHILD);
    }

    #[test]
    fn waitpid_blocks_until_exit() {
        let kernel = Kernel::new(1024 * 1024);
        let parent = kernel.new_process("parent", None);
        let child = kernel.sys_fork(&parent).unwrap();
        let child_pid = child.pid;

        let k = kernel.clone();
        let k2 = kernel.clone();
        // The child exits later, from a separate task; waitpid must sleep
        // until then.
        kernel.executor.spawn(async move {
            k2.timers.sleep(5).await;
            k2.sys_exit(&child, 0).await;
        });
        let result = kernel.run(async move { k.sys_waitpid(&parent, Some(child_pid)).await });
        assert_eq!(result.unwrap().0, child_pid);
    }
}
