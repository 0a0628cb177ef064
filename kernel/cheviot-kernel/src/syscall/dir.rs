//! Directory syscalls: mkdir, rmdir, mknod, directory scanning, and the
//! current/root directory of a process.

use alloc::sync::Arc;

use cheviot_core::Errno;
use cheviot_core::id::Fd;
use cheviot_fs::lookup::LookupFlags;
use cheviot_fs::stat::{S_IFDIR, S_IFMT};
use cheviot_fs::vnode::hint;
use cheviot_fs::wire::{DirEnt, unpack_dirents};
use cheviot_fs::Stat;

use crate::context::Kernel;
use crate::proc::Process;

/// Dirent blob size fetched per readdir call.
const READDIR_BUF_SZ: usize = 512;

impl Kernel {
    /// Creates a directory.
    pub async fn sys_mkdir(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
        mode: u32,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::PARENT)
            .await?;
        let parent = looked.parent.ok_or(Errno::EINVAL)?;

        if let Some(existing) = looked.vnode {
            self.fs.vnode_put(process.pid, &existing).await;
            self.fs.vnode_put(process.pid, &parent).await;
            return Err(Errno::EEXIST);
        }

        let stat = Stat {
            st_mode: S_IFDIR | (mode & !S_IFMT),
            st_uid: *process.uid.lock(),
            st_gid: *process.gid.lock(),
            ..Stat::default()
        };
        let result = self
            .fs
            .vfs_mkdir(process.pid, &parent, &looked.last_component, &stat)
            .await;
        match result {
            Ok(vnode) => {
                parent.listeners.fire(hint::WRITE);
                self.fs.vnode_put(process.pid, &vnode).await;
                self.fs.vnode_put(process.pid, &parent).await;
                Ok(())
            }
            Err(e) => {
                self.fs.vnode_put(process.pid, &parent).await;
                Err(e)
            }
        }
    }

    /// Removes an empty directory.
    pub async fn sys_rmdir(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::REMOVE)
            .await?;
        let vnode = looked.vnode.ok_or(Errno::ENOENT)?;
        let parent = looked.parent.ok_or(Errno::EINVAL)?;

        let result = if !vnode.is_dir() {
            Err(Errno::ENOTDIR)
        } else if vnode.mounted_here().is_some() {
            Err(Errno::EBUSY)
        } else {
            self.fs
                .vfs_rmdir(process.pid, &parent, &looked.last_component)
                .await
        };
        if result.is_ok() {
            vnode.listeners.fire(hint::DELETE);
            parent.listeners.fire(hint::WRITE);
        }
        self.fs.vnode_put(process.pid, &vnode).await;
        self.fs.vnode_put(process.pid, &parent).await;
        result
    }

    /// Creates a file system node (device, fifo, future mount point).
    pub async fn sys_mknod(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
        stat: &Stat,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::PARENT)
            .await?;
        let parent = looked.parent.ok_or(Errno::EINVAL)?;

        if let Some(existing) = looked.vnode {
            self.fs.vnode_put(process.pid, &existing).await;
            self.fs.vnode_put(process.pid, &parent).await;
            return Err(Errno::EEXIST);
        }

        let result = self
            .fs
            .vfs_mknod(process.pid, &parent, &looked.last_component, stat)
            .await;
        match result {
            Ok(vnode) => {
                parent.listeners.fire(hint::WRITE);
                self.fs.vnode_put(process.pid, &vnode).await;
                self.fs.vnode_put(process.pid, &parent).await;
                Ok(())
            }
            Err(e) => {
                self.fs.vnode_put(process.pid, &parent).await;
                Err(e)
            }
        }
    }

    /// Opens a directory for scanning.
    pub async fn sys_opendir(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
    ) -> Result<Fd, Errno> {
        let fd = self
            .sys_open(process, path, super::file::O_RDONLY, 0)
            .await?;
        let filp = process.handles.lock().get(fd)?;
        let is_dir = filp.vnode().map(|v| v.is_dir()).unwrap_or(false);
        if !is_dir {
            self.sys_close(process, fd).await?;
            return Err(Errno::ENOTDIR);
        }
        Ok(fd)
    }

    /// Returns the next directory entry, or `None` at the end of the
    /// scan. The descriptor's offset carries the server's resume cookie.
    pub async fn sys_readdir(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
    ) -> Result<Option<DirEnt>, Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        if !vnode.is_dir() {
            return Err(Errno::ENOTDIR);
        }

        let cookie = *filp.offset.lock() as i64;
        let (blob, _next) = self
            .fs
            .vfs_readdir(process.pid, &vnode, cookie, READDIR_BUF_SZ)
            .await?;
        if blob.is_empty() {
            return Ok(None);
        }
        let entries = unpack_dirents(&blob)?;
        let Some(first) = entries.into_iter().next() else {
            return Ok(None);
        };
        *filp.offset.lock() = first.d_cookie as u64;
        Ok(Some(first))
    }

    /// Restarts a directory scan.
    pub fn sys_rewinddir(self: &Arc<Self>, process: &Arc<Process>, fd: Fd) -> Result<(), Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        if !vnode.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        *filp.offset.lock() = 0;
        Ok(())
    }

    /// Changes the current directory.
    pub async fn sys_chdir(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::empty())
            .await?;
        let vnode = looked.vnode.ok_or(Errno::ENOENT)?;
        if !vnode.is_dir() {
            self.fs.vnode_put(process.pid, &vnode).await;
            return Err(Errno::ENOTDIR);
        }
        let old = process.cwd.lock().replace(vnode);
        if let Some(old) = old {
            self.fs.vnode_put(process.pid, &old).await;
        }
        Ok(())
    }

    /// Changes the current directory to an open directory descriptor.
    pub async fn sys_fchdir(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
    ) -> Result<(), Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        if !vnode.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        self.fs.vnodes.incref(&vnode);
        let old = process.cwd.lock().replace(vnode);
        if let Some(old) = old {
            self.fs.vnode_put(process.pid, &old).await;
        }
        Ok(())
    }

    /// Changes the process root directory.
    pub async fn sys_chroot(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::empty())
            .await?;
        let vnode = looked.vnode.ok_or(Errno::ENOENT)?;
        if !vnode.is_dir() {
            self.fs.vnode_put(process.pid, &vnode).await;
            return Err(Errno::ENOTDIR);
        }
        let old = process.root_dir.lock().replace(vnode);
        if let Some(old) = old {
            self.fs.vnode_put(process.pid, &old).await;
        }
        Ok(())
    }
}
