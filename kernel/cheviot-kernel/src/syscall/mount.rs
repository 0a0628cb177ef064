//! Mount syscalls: mount, unmount, pivot_root, move_mount.

use alloc::sync::Arc;

use cheviot_core::Errno;
use cheviot_core::id::Fd;
use cheviot_fs::lookup::LookupFlags;
use cheviot_fs::{SbFlags, Stat, VnodeType};

use crate::context::{KERNEL_PID, Kernel};
use crate::handle::{Filp, FilpObject, OpenFlags};
use crate::proc::Process;

/// Mount the file system read-only.
pub const MOUNT_RDONLY: u32 = 1 << 0;

impl Kernel {
    /// Creates a mount at `path` and returns the server's side of the
    /// superblock port. The first mount in the system ignores `path` and
    /// becomes the root.
    pub async fn sys_mount(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
        flags: u32,
        stat: &Stat,
    ) -> Result<Fd, Errno> {
        let covered = if self.fs.root_vnode.lock().is_some() {
            let start = process.lookup_start(self)?;
            let looked = self
                .fs
                .lookup(process.pid, &start, path, LookupFlags::empty())
                .await?;
            Some(looked.vnode.ok_or(Errno::ENOENT)?)
        } else {
            None
        };

        let mut sb_flags = SbFlags::empty();
        if flags & MOUNT_RDONLY != 0 {
            sb_flags |= SbFlags::READONLY;
        }

        let (sb, server_vnode, _root) =
            match self.fs.mount_create(covered.clone(), stat, sb_flags) {
                Ok(created) => created,
                Err(e) => {
                    if let Some(covered) = covered {
                        self.fs.vnode_put(process.pid, &covered).await;
                    }
                    return Err(e);
                }
            };
        if let Some(covered) = covered {
            // The splice holds its own reference now.
            self.fs.vnode_put(process.pid, &covered).await;
        }

        // Writable mounts get a write-behind flusher task.
        if !sb.is_readonly() {
            let fs = self.fs.clone();
            self.executor
                .spawn(fs.bdflush_task(KERNEL_PID, sb.clone()));
        }

        let filp = Filp::new(
            FilpObject::Vnode(server_vnode),
            OpenFlags::READ | OpenFlags::WRITE,
        );
        self.install_filp(process, filp)
    }

    /// Unmounts the file system whose server port is `fd`.
    ///
    /// Refuses with `EBUSY` while any handle in any process references a
    /// v-node of the mount (`force` skips the check and discards dirty
    /// state). Otherwise drains delayed writes and detaches the mount.
    pub async fn sys_unmount(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        force: bool,
    ) -> Result<(), Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        if vnode.vnode_type() != VnodeType::Port {
            return Err(Errno::EINVAL);
        }
        let sb = vnode.superblock.clone();
        if self.fs.mounts.find(sb.id).is_none() {
            return Err(Errno::EINVAL);
        }

        if !force {
            let busy = self.procs.lock().values().any(|proc| {
                proc.handles.lock().live_filps().iter().any(|f| {
                    f.vnode().is_some_and(|v| {
                        v.superblock.id == sb.id && v.vnode_type() != VnodeType::Port
                    })
                })
            });
            if busy {
                return Err(Errno::EBUSY);
            }
            self.fs.bsync_superblock(process.pid, &sb).await?;
        }

        self.fs.mount_teardown(&sb);
        Ok(())
    }

    /// Swaps the root file system: `new_root` becomes `/` and the old
    /// root tree reappears under `old_root`.
    pub async fn sys_pivot_root(
        self: &Arc<Self>,
        process: &Arc<Process>,
        new_root: &str,
        old_root: &str,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let new = self
            .fs
            .lookup(process.pid, &start, new_root, LookupFlags::empty())
            .await?;
        let new_vnode = new.vnode.ok_or(Errno::ENOENT)?;

        let old = match self
            .fs
            .lookup(process.pid, &start, old_root, LookupFlags::empty())
            .await
        {
            Ok(old) => old,
            Err(e) => {
                self.fs.vnode_put(process.pid, &new_vnode).await;
                return Err(e);
            }
        };
        let old_vnode = old.vnode.ok_or(Errno::ENOENT)?;

        let result = self.fs.pivot_root(&new_vnode, &old_vnode);
        self.fs.vnode_put(process.pid, &old_vnode).await;
        self.fs.vnode_put(process.pid, &new_vnode).await;
        result
    }

    /// Moves the mount at `old_path` onto `new_path`.
    pub async fn sys_move_mount(
        self: &Arc<Self>,
        process: &Arc<Process>,
        new_path: &str,
        old_path: &str,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let new = self
            .fs
            .lookup(process.pid, &start, new_path, LookupFlags::empty())
            .await?;
        let new_vnode = new.vnode.ok_or(Errno::ENOENT)?;

        let old = match self
            .fs
            .lookup(process.pid, &start, old_path, LookupFlags::empty())
            .await
        {
            Ok(old) => old,
            Err(e) => {
                self.fs.vnode_put(process.pid, &new_vnode).await;
                return Err(e);
            }
        };
        // Lookup of a mount point lands on the mounted root; step back
        // to the covered v-node underneath it.
        let old_mounted_root = old.vnode.ok_or(Errno::ENOENT)?;
        let old_covered = old_mounted_root.covered().ok_or(Errno::EINVAL);

        let result = match old_covered {
            Ok(covered) => self.fs.move_mount(&new_vnode, &covered),
            Err(e) => Err(e),
        };
        self.fs.vnode_put(process.pid, &old_mounted_root).await;
        self.fs.vnode_put(process.pid, &new_vnode).await;
        result
    }
}
