//! Superblocks and the mount machinery.
//!
//! One superblock per mounted file system: the message port its server
//! answers on, the client-side root v-node, the server-side v-node whose
//! holder is the server, and the delayed-write state the flusher drains.
//! Mount points are spliced into the namespace through the covered
//! v-node's `mounted_here` link and the root's `covered` back-link.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use cheviot_core::{Errno, kinfo, kwarn};
use cheviot_core::id::{InodeNr, SbId};
use cheviot_core::sync::{Mutex, Rendez, SpinLock};
use cheviot_ipc::MsgPort;

use crate::cache::DelwriQueue;
use crate::stat::{S_IFPORT, Stat};
use crate::vnode::{Vnode, VnodeFlags};
use crate::FsCore;

/// Maximum number of mounted file systems.
pub const NR_SUPERBLOCK: usize = 128;

bitflags! {
    /// Superblock flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SbFlags: u32 {
        /// Server died: every operation fails with `EIO`.
        const ABORT    = 1 << 0;
        /// Mounted read-only.
        const READONLY = 1 << 1;
        /// Anonymous: no server behind the port (pipe v-nodes).
        const ANON     = 1 << 2;
    }
}

/// One mounted file system.
pub struct SuperBlock {
    /// Identity of this mount.
    pub id: SbId,
    /// The message port its server answers on.
    pub port: MsgPort,
    flags: SpinLock<SbFlags>,
    /// Client-side root v-node.
    pub root: SpinLock<Option<Arc<Vnode>>>,
    /// Server-side v-node; closing its last handle aborts the mount.
    pub server_vnode: SpinLock<Option<Arc<Vnode>>>,
    /// Serializes directory-level operations against this file system.
    pub lock: Mutex<()>,
    /// Delayed-write wheel drained by the flusher task.
    pub delwri: DelwriQueue,
    /// Wakes the flusher early (fsync, unmount drain).
    pub flush_rendez: Rendez,
}

impl core::fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SuperBlock")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl SuperBlock {
    /// Current flags.
    pub fn flags(&self) -> SbFlags {
        *self.flags.lock()
    }

    /// True once the mount is aborted.
    pub fn is_aborted(&self) -> bool {
        self.flags().contains(SbFlags::ABORT)
    }

    /// True for read-only mounts.
    pub fn is_readonly(&self) -> bool {
        self.flags().contains(SbFlags::READONLY)
    }

    /// Marks the superblock aborted and completes all port traffic with
    /// `EIO`.
    pub fn abort(&self) {
        kwarn!("{}: superblock aborted", self.id);
        self.flags.lock().insert(SbFlags::ABORT);
        self.port.abort();
        self.flush_rendez.wakeup_all();
    }
}

/// The table of mounted file systems.
pub struct MountTable {
    superblocks: SpinLock<Vec<Arc<SuperBlock>>>,
    next_id: SpinLock<u32>,
}

impl MountTable {
    /// Creates an empty mount table.
    pub fn new() -> Self {
        Self {
            superblocks: SpinLock::new(Vec::new()),
            next_id: SpinLock::new(1),
        }
    }

    /// Allocates a superblock with a fresh port.
    ///
    /// # Errors
    ///
    /// `ENFILE` when the table is full.
    pub fn alloc(&self, flags: SbFlags) -> Result<Arc<SuperBlock>, Errno> {
        let mut superblocks = self.superblocks.lock();
        if superblocks.len() >= NR_SUPERBLOCK {
            return Err(Errno::ENFILE);
        }
        let mut next = self.next_id.lock();
        let id = SbId::new(*next);
        *next += 1;
        drop(next);

        let sb = Arc::new(SuperBlock {
            id,
            port: MsgPort::new(),
            flags: SpinLock::new(flags),
            root: SpinLock::new(None),
            server_vnode: SpinLock::new(None),
            lock: Mutex::new(()),
            delwri: DelwriQueue::new(),
            flush_rendez: Rendez::new(),
        });
        superblocks.push(sb.clone());
        Ok(sb)
    }

    /// Looks a superblock up by id.
    pub fn find(&self, id: SbId) -> Option<Arc<SuperBlock>> {
        self.superblocks.lock().iter().find(|sb| sb.id == id).cloned()
    }

    /// Removes a superblock from the table.
    pub fn remove(&self, id: SbId) {
        self.superblocks.lock().retain(|sb| sb.id != id);
    }

    /// Snapshot of all mounted superblocks.
    pub fn list(&self) -> Vec<Arc<SuperBlock>> {
        self.superblocks.lock().clone()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FsCore {
    /// Creates a mount: a superblock, its server-side v-node and its
    /// client-side root, spliced over `covered` (absent only for the
    /// first mount, which becomes the system root).
    ///
    /// Returns `(superblock, server_vnode, root_vnode)`; the caller
    /// installs the server v-node into the mounting process's handle
    /// table.
    pub fn mount_create(
        &self,
        covered: Option<Arc<Vnode>>,
        stat: &Stat,
        flags: SbFlags,
    ) -> Result<(Arc<SuperBlock>, Arc<Vnode>, Arc<Vnode>), Errno> {
        if let Some(ref cv) = covered {
            if cv.mounted_here().is_some() {
                return Err(Errno::EEXIST);
            }
        }

        let sb = self.mounts.alloc(flags)?;

        let server = self.vnodes.create(&sb, InodeNr::SERVER)?;
        server.init_from_attr(&crate::wire::WireAttr {
            inode_nr: InodeNr::SERVER.as_i64(),
            size: 0,
            mode: S_IFPORT | 0o777,
            uid: stat.st_uid,
            gid: stat.st_gid,
            nlink: 1,
        });

        let root = self.vnodes.create(&sb, InodeNr::ROOT)?;
        root.init_from_attr(&crate::wire::WireAttr {
            inode_nr: InodeNr::ROOT.as_i64(),
            size: stat.st_size,
            mode: stat.st_mode,
            uid: stat.st_uid,
            gid: stat.st_gid,
            nlink: 1,
        });
        root.set_flags(VnodeFlags::ROOT);

        *sb.root.lock() = Some(root.clone());
        *sb.server_vnode.lock() = Some(server.clone());

        if let Some(cv) = covered {
            self.dnlc.purge_vnode(&cv);
            cv.cover_with(&root);
            self.vnodes.incref(&cv);
        }

        let mut sys_root = self.root_vnode.lock();
        if sys_root.is_none() {
            *sys_root = Some(root.clone());
        }
        drop(sys_root);

        kinfo!("{}: mounted (root ino {})", sb.id, root.inode_nr);
        Ok((sb, server, root))
    }

    /// Tears a mount down.
    ///
    /// The caller has already verified no handles reference the mount and
    /// drained delayed writes. Clears the cover splice both ways, purges
    /// the name cache and v-node cache of the superblock, and drops the
    /// superblock from the table.
    pub fn mount_teardown(&self, sb: &Arc<SuperBlock>) {
        let root = sb.root.lock().take();
        if let Some(ref root) = root {
            if let Some(covered) = root.covered() {
                covered.uncover();
                self.vnodes.decref(&covered);
            }
        }
        *sb.server_vnode.lock() = None;

        self.dnlc.purge_superblock(sb.id);
        self.cache.discard_superblock(sb.id);
        for vnode in self.vnodes.of_superblock(sb.id) {
            self.vnodes.discard(&vnode);
        }
        self.mounts.remove(sb.id);
        kinfo!("{}: unmounted", sb.id);
    }

    /// Swaps the system root: `new_root` becomes `/`, and the old root
    /// is re-mounted over `old` so existing paths stay reachable.
    ///
    /// # Errors
    ///
    /// `EINVAL` when either v-node is not a mount root / directory.
    pub fn pivot_root(
        &self,
        new_root: &Arc<Vnode>,
        old: &Arc<Vnode>,
    ) -> Result<(), Errno> {
        if !new_root.is_dir() || !old.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        let current_root = self.root()?;
        if new_root.same_as(&current_root) {
            return Err(Errno::EINVAL);
        }

        // The new root leaves its old mount point; both sides of that
        // splice clear together.
        if let Some(prev_covered) = new_root.covered() {
            prev_covered.uncover();
        }
        // The old root tree hangs under `old` so its paths stay reachable.
        old.cover_with(&current_root);

        *self.root_vnode.lock() = Some(new_root.clone());
        self.dnlc.purge_all();
        kinfo!("pivot_root: new root {} ino {}", new_root.superblock.id, new_root.inode_nr);
        Ok(())
    }

    /// Moves a mount from `old` (currently covered) onto `new`.
    ///
    /// # Errors
    ///
    /// `EINVAL` when `old` has no mount or `new` already has one.
    pub fn move_mount(&self, new: &Arc<Vnode>, old: &Arc<Vnode>) -> Result<(), Errno> {
        if new.mounted_here().is_some() {
            return Err(Errno::EEXIST);
        }
        let root = old.mounted_here().ok_or(Errno::EINVAL)?;
        old.uncover();
        self.vnodes.decref(old);
        new.cover_with(&root);
        self.vnodes.incref(new);
        self.dnlc.purge_vnode(old);
        self.dnlc.purge_vnode(new);
        Ok(())
    }
}
