//! Per-process handle (file descriptor) tables.
//!
//! A handle is a small integer indexing a shared [`Filp`]: the open-file
//! state carrying the object reference, a 64-bit seek offset and a share
//! count that `dup`/`dup2`/fork raise. The close-on-exec bitmap is swept
//! by exec.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bit_field::BitField;
use bitflags::bitflags;

use cheviot_core::Errno;
use cheviot_core::id::Fd;
use cheviot_core::sync::SpinLock;
use cheviot_fs::Vnode;

use crate::kqueue::KQueue;

/// Handle slots per process.
pub const NPROC_FD: usize = 32;

bitflags! {
    /// Open-file flags carried on a [`Filp`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ   = 1 << 0;
        /// Open for writing.
        const WRITE  = 1 << 1;
        /// Writes append to the end of the file.
        const APPEND = 1 << 2;
    }
}

/// What a handle refers to.
pub enum FilpObject {
    /// A v-node (file, directory, device, fifo, message port).
    Vnode(Arc<Vnode>),
    /// A kernel event queue.
    KQueue(Arc<KQueue>),
    /// A user timer (armed with `set_timer`).
    Timer(Arc<crate::syscall::time::UserTimer>),
    /// An interrupt source (raised events observed via `EVFILT_IRQ`).
    Irq(u32, Arc<cheviot_core::event::Listeners>),
}

/// Shared open-file state.
pub struct Filp {
    /// The object the handle refers to.
    pub object: FilpObject,
    /// Seek offset (also the readdir cookie for directories).
    pub offset: SpinLock<u64>,
    /// Open flags.
    pub flags: SpinLock<OpenFlags>,
    share: SpinLock<usize>,
}

impl core::fmt::Debug for Filp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Filp").finish_non_exhaustive()
    }
}

impl Filp {
    /// Creates a filp with one share.
    pub fn new(object: FilpObject, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            object,
            offset: SpinLock::new(0),
            flags: SpinLock::new(flags),
            share: SpinLock::new(1),
        })
    }

    /// The v-node behind this filp, for v-node handles.
    pub fn vnode(&self) -> Option<Arc<Vnode>> {
        match &self.object {
            FilpObject::Vnode(vnode) => Some(vnode.clone()),
            _ => None,
        }
    }

    /// Raises the share count (dup, fork).
    pub fn add_share(&self) {
        *self.share.lock() += 1;
    }

    /// Drops a share; returns `true` when this was the last one and the
    /// underlying object reference must be released.
    pub fn drop_share(&self) -> bool {
        let mut share = self.share.lock();
        debug_assert!(*share > 0, "drop_share on closed filp");
        *share -= 1;
        *share == 0
    }

    /// Current share count.
    pub fn shares(&self) -> usize {
        *self.share.lock()
    }
}

/// A process's handle table.
pub struct HandleTable {
    slots: Vec<Option<Arc<Filp>>>,
    cloexec: u32,
}

impl HandleTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NPROC_FD);
        slots.resize_with(NPROC_FD, || None);
        Self { slots, cloexec: 0 }
    }

    /// Installs `filp` in the lowest free slot at or above `from`.
    ///
    /// # Errors
    ///
    /// `EMFILE` when the table is full.
    pub fn alloc_from(&mut self, from: usize, filp: Arc<Filp>) -> Result<Fd, Errno> {
        for idx in from..NPROC_FD {
            if self.slots[idx].is_none() {
                self.slots[idx] = Some(filp);
                self.cloexec.set_bit(idx, false);
                return Ok(Fd::new(idx as u32));
            }
        }
        Err(Errno::EMFILE)
    }

    /// Installs `filp` in the lowest free slot.
    pub fn alloc(&mut self, filp: Arc<Filp>) -> Result<Fd, Errno> {
        self.alloc_from(0, filp)
    }

    /// Installs `filp` at exactly `fd`, returning the displaced filp if
    /// any (dup2 closes it).
    ///
    /// # Errors
    ///
    /// `EBADF` for out-of-range descriptors.
    pub fn install_at(&mut self, fd: Fd, filp: Arc<Filp>) -> Result<Option<Arc<Filp>>, Errno> {
        let idx = fd.as_usize();
        if idx >= NPROC_FD {
            return Err(Errno::EBADF);
        }
        let old = self.slots[idx].take();
        self.slots[idx] = Some(filp);
        self.cloexec.set_bit(idx, false);
        Ok(old)
    }

    /// The filp at `fd`.
    ///
    /// # Errors
    ///
    /// `EBADF` for empty or out-of-range slots.
    pub fn get(&self, fd: Fd) -> Result<Arc<Filp>, Errno> {
        self.slots
            .get(fd.as_usize())
            .and_then(|slot| slot.clone())
            .ok_or(Errno::EBADF)
    }

    /// Removes the filp at `fd`.
    ///
    /// # Errors
    ///
    /// `EBADF` for empty or out-of-range slots.
    pub fn remove(&mut self, fd: Fd) -> Result<Arc<Filp>, Errno> {
        let idx = fd.as_usize();
        if idx >= NPROC_FD {
            return Err(Errno::EBADF);
        }
        let filp = self.slots[idx].take().ok_or(Errno::EBADF)?;
        self.cloexec.set_bit(idx, false);
        Ok(filp)
    }

    /// Reads the close-on-exec bit.
    pub fn get_cloexec(&self, fd: Fd) -> Result<bool, Errno> {
        if self.slots.get(fd.as_usize()).and_then(Option::as_ref).is_none() {
            return Err(Errno::EBADF);
        }
        Ok(self.cloexec.get_bit(fd.as_usize()))
    }

    /// Writes the close-on-exec bit.
    pub fn set_cloexec(&mut self, fd: Fd, value: bool) -> Result<(), Errno> {
        if self.slots.get(fd.as_usize()).and_then(Option::as_ref).is_none() {
            return Err(Errno::EBADF);
        }
        self.cloexec.set_bit(fd.as_usize(), value);
        Ok(())
    }

    /// Removes and returns every filp whose close-on-exec bit is set
    /// (the exec sweep).
    pub fn sweep_cloexec(&mut self) -> Vec<Arc<Filp>> {
        let mut swept = Vec::new();
        for idx in 0..NPROC_FD {
            if self.cloexec.get_bit(idx) {
                if let Some(filp) = self.slots[idx].take() {
                    swept.push(filp);
                }
                self.cloexec.set_bit(idx, false);
            }
        }
        swept
    }

    /// Removes and returns every filp (process exit).
    pub fn drain(&mut self) -> Vec<Arc<Filp>> {
        self.cloexec = 0;
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    /// Clones the table for fork: every filp gains a share, close-on-exec
    /// bits copy over.
    pub fn fork_clone(&self) -> Self {
        let slots = self
            .slots
            .iter()
            .map(|slot| {
                slot.as_ref().inspect(|filp| filp.add_share()).cloned()
            })
            .collect();
        Self {
            slots,
            cloexec: self.cloexec,
        }
    }

    /// Every live filp (unmount busy checks).
    pub fn live_filps(&self) -> Vec<Arc<Filp>> {
        self.slots.iter().filter_map(Clone::clone).collect()
    }

    /// Number of open handles.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kqueue::KQueue;

    fn kq_filp() -> Arc<Filp> {
        Filp::new(FilpObject::KQueue(KQueue::new()), OpenFlags::READ)
    }

    #[test]
    fn alloc_uses_lowest_slot() {
        let mut table = HandleTable::new();
        let a = table.alloc(kq_filp()).unwrap();
        let b = table.alloc(kq_filp()).unwrap();
        assert_eq!(a, Fd::new(0));
        assert_eq!(b, Fd::new(1));

        table.remove(a).unwrap();
        let c = table.alloc(kq_filp()).unwrap();
        assert_eq!(c, Fd::new(0), "freed slot is reused first");
    }

    #[test]
    fn alloc_from_skips_lower_slots() {
        let mut table = HandleTable::new();
        let fd = table.alloc_from(10, kq_filp()).unwrap();
        assert_eq!(fd, Fd::new(10));
    }

    #[test]
    fn emfile_when_full() {
        let mut table = HandleTable::new();
        for _ in 0..NPROC_FD {
            table.alloc(kq_filp()).unwrap();
        }
        assert_eq!(table.alloc(kq_filp()).unwrap_err(), Errno::EMFILE);
    }

    #[test]
    fn install_at_returns_displaced() {
        let mut table = HandleTable::new();
        let fd = table.alloc(kq_filp()).unwrap();
        let displaced = table.install_at(fd, kq_filp()).unwrap();
        assert!(displaced.is_some());
    }

    #[test]
    fn shares_track_dup_and_close() {
        let filp = kq_filp();
        filp.add_share();
        assert_eq!(filp.shares(), 2);
        assert!(!filp.drop_share());
        assert!(filp.drop_share(), "last share closes the object");
    }

    #[test]
    fn cloexec_sweep_removes_marked() {
        let mut table = HandleTable::new();
        let keep = table.alloc(kq_filp()).unwrap();
        let sweep = table.alloc(kq_filp()).unwrap();
        table.set_cloexec(sweep, true).unwrap();

        let swept = table.sweep_cloexec();
        assert_eq!(swept.len(), 1);
        assert!(table.get(keep).is_ok());
        assert_eq!(table.get(sweep).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn fork_clone_bumps_shares_and_copies_cloexec() {
        let mut table = HandleTable::new();
        let fd = table.alloc(kq_filp()).unwrap();
        table.set_cloexec(fd, true).unwrap();

        let clone = table.fork_clone();
        assert_eq!(table.get(fd).unwrap().shares(), 2);
        assert!(clone.get_cloexec(fd).unwrap());
    }

    #[test]
    fn cloexec_of_missing_fd_is_ebadf() {
        let table = HandleTable::new();
        assert_eq!(table.get_cloexec(Fd::new(3)).unwrap_err(), Errno::EBADF);
    }
}
