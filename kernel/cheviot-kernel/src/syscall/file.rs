//! File syscalls: open, close, read, write, seek, dup, fcntl, stat,
//! attribute changes, pipes and terminal forwarding.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use cheviot_core::Errno;
use cheviot_core::id::{Fd, InodeNr};
use cheviot_fs::lookup::LookupFlags;
use cheviot_fs::stat::{S_IFIFO, S_IFMT, S_IFREG};
use cheviot_fs::vnode::hint;
use cheviot_fs::wire::Termios;
use cheviot_fs::{Stat, Vnode, VnodeType};
use cheviot_ipc::Pipe;

use crate::context::Kernel;
use crate::handle::{Filp, FilpObject, OpenFlags};
use crate::proc::Process;

/// Open for reading only.
pub const O_RDONLY: u32 = 0;
/// Open for writing only.
pub const O_WRONLY: u32 = 1;
/// Open for reading and writing.
pub const O_RDWR: u32 = 2;
/// Mask of the access-mode bits.
pub const O_ACCMODE: u32 = 3;
/// Create the file if absent.
pub const O_CREAT: u32 = 0o100;
/// With `O_CREAT`, fail if the file exists.
pub const O_EXCL: u32 = 0o200;
/// Truncate to zero length on open.
pub const O_TRUNC: u32 = 0o1000;
/// Writes go to the end of the file.
pub const O_APPEND: u32 = 0o2000;
/// Close the descriptor on exec.
pub const O_CLOEXEC: u32 = 0o2000000;

/// Seek relative to the file start.
pub const SEEK_SET: u32 = 0;
/// Seek relative to the current offset.
pub const SEEK_CUR: u32 = 1;
/// Seek relative to the end of file.
pub const SEEK_END: u32 = 2;

/// `fcntl`: duplicate onto the lowest descriptor at or above `arg`.
pub const F_DUPFD: u32 = 0;
/// `fcntl`: read the close-on-exec flag.
pub const F_GETFD: u32 = 1;
/// `fcntl`: write the close-on-exec flag.
pub const F_SETFD: u32 = 2;

fn open_flags_of(oflags: u32) -> Result<OpenFlags, Errno> {
    let mut flags = match oflags & O_ACCMODE {
        O_RDONLY => OpenFlags::READ,
        O_WRONLY => OpenFlags::WRITE,
        O_RDWR => OpenFlags::READ | OpenFlags::WRITE,
        _ => return Err(Errno::EINVAL),
    };
    if oflags & O_APPEND != 0 {
        flags |= OpenFlags::APPEND;
    }
    Ok(flags)
}

impl Kernel {
    /// Opens `path`, returning a new descriptor.
    pub async fn sys_open(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
        oflags: u32,
        mode: u32,
    ) -> Result<Fd, Errno> {
        let flags = open_flags_of(oflags)?;
        let start = process.lookup_start(self)?;
        let lflags = if oflags & O_CREAT != 0 {
            LookupFlags::PARENT
        } else {
            LookupFlags::empty()
        };
        let looked = self.fs.lookup(process.pid, &start, path, lflags).await?;

        let vnode = match (looked.vnode, looked.parent) {
            (Some(vnode), parent) => {
                if let Some(parent) = parent {
                    self.fs.vnode_put(process.pid, &parent).await;
                }
                if oflags & (O_CREAT | O_EXCL) == (O_CREAT | O_EXCL) {
                    self.fs.vnode_put(process.pid, &vnode).await;
                    return Err(Errno::EEXIST);
                }
                if vnode.is_dir() && flags.contains(OpenFlags::WRITE) {
                    self.fs.vnode_put(process.pid, &vnode).await;
                    return Err(Errno::EISDIR);
                }
                if oflags & O_TRUNC != 0 && flags.contains(OpenFlags::WRITE) {
                    if let Err(e) = self.fs.vfs_truncate(process.pid, &vnode, 0).await {
                        self.fs.vnode_put(process.pid, &vnode).await;
                        return Err(e);
                    }
                }
                vnode
            }
            (None, Some(parent)) => {
                // O_CREAT path: the final component does not exist yet.
                let stat = Stat {
                    st_mode: S_IFREG | (mode & !S_IFMT),
                    st_uid: *process.uid.lock(),
                    st_gid: *process.gid.lock(),
                    ..Stat::default()
                };
                let created = self
                    .fs
                    .vfs_create(process.pid, &parent, &looked.last_component, oflags, &stat)
                    .await;
                parent.listeners.fire(hint::WRITE);
                self.fs.vnode_put(process.pid, &parent).await;
                created?
            }
            (None, None) => return Err(Errno::ENOENT),
        };

        // A FIFO opened by name gets its pipe on first open. A fresh
        // pipe counts one reader and one writer (the anonymous-pipe
        // shape); a named FIFO starts with no openers, so those initial
        // counts come off before this open adds its own.
        if vnode.vnode_type() == VnodeType::Fifo {
            let pipe = {
                let mut slot = vnode.pipe.lock();
                match slot.clone() {
                    Some(pipe) => pipe,
                    None => {
                        let pipe = Arc::new(Pipe::new());
                        pipe.remove_reader();
                        pipe.remove_writer();
                        *slot = Some(pipe.clone());
                        pipe
                    }
                }
            };
            if flags.contains(OpenFlags::READ) {
                pipe.add_reader();
            }
            if flags.contains(OpenFlags::WRITE) {
                pipe.add_writer();
            }
        }

        let filp = Filp::new(FilpObject::Vnode(vnode), flags);
        let fd = self.install_filp(process, filp)?;
        if oflags & O_CLOEXEC != 0 {
            process.handles.lock().set_cloexec(fd, true)?;
        }
        Ok(fd)
    }

    pub(crate) fn install_filp(
        self: &Arc<Self>,
        process: &Arc<Process>,
        filp: Arc<Filp>,
    ) -> Result<Fd, Errno> {
        process.handles.lock().alloc(filp)
    }

    /// Closes a descriptor.
    pub async fn sys_close(self: &Arc<Self>, process: &Arc<Process>, fd: Fd) -> Result<(), Errno> {
        let filp = process.handles.lock().remove(fd)?;
        self.release_filp(process, filp).await;
        Ok(())
    }

    /// Releases one share of a filp, dropping the underlying object
    /// reference when it was the last.
    pub async fn release_filp(self: &Arc<Self>, process: &Arc<Process>, filp: Arc<Filp>) {
        if !filp.drop_share() {
            return;
        }
        match &filp.object {
            FilpObject::Vnode(vnode) => {
                if let Some(pipe) = vnode.pipe.lock().clone() {
                    let flags = *filp.flags.lock();
                    if flags.contains(OpenFlags::READ) {
                        pipe.remove_reader();
                        vnode.listeners.fire(hint::WR);
                    }
                    if flags.contains(OpenFlags::WRITE) {
                        pipe.remove_writer();
                        vnode.listeners.fire(hint::RD);
                    }
                }
                // Closing the server side of a mount aborts it.
                if vnode.vnode_type() == VnodeType::Port {
                    let sb = &vnode.superblock;
                    if self.fs.mounts.find(sb.id).is_some() && !sb.is_aborted() {
                        sb.abort();
                        self.fs.cache.discard_superblock(sb.id);
                    }
                }
                self.fs.vnode_put(process.pid, vnode).await;
            }
            FilpObject::KQueue(kq) => kq.close(),
            FilpObject::Timer(timer) => timer.cancel(&self.timers),
            FilpObject::Irq(_, _) => {}
        }
    }

    fn readable_filp(
        &self,
        process: &Arc<Process>,
        fd: Fd,
    ) -> Result<(Arc<Filp>, Arc<Vnode>), Errno> {
        let filp = process.handles.lock().get(fd)?;
        if !filp.flags.lock().contains(OpenFlags::READ) {
            return Err(Errno::EBADF);
        }
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        Ok((filp, vnode))
    }

    fn writable_filp(
        &self,
        process: &Arc<Process>,
        fd: Fd,
    ) -> Result<(Arc<Filp>, Arc<Vnode>), Errno> {
        let filp = process.handles.lock().get(fd)?;
        if !filp.flags.lock().contains(OpenFlags::WRITE) {
            return Err(Errno::EBADF);
        }
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        Ok((filp, vnode))
    }

    /// Reads up to `len` bytes from a descriptor.
    pub async fn sys_read(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        len: usize,
    ) -> Result<Vec<u8>, Errno> {
        let (filp, vnode) = self.readable_filp(process, fd)?;
        match vnode.vnode_type() {
            VnodeType::Dir => Err(Errno::EISDIR),
            VnodeType::Reg => {
                let mut buf = vec![0u8; len];
                let mut offset = *filp.offset.lock();
                let n = self
                    .fs
                    .read_from_cache(process.pid, &vnode, &mut buf, &mut offset)
                    .await?;
                *filp.offset.lock() = offset;
                buf.truncate(n);
                Ok(buf)
            }
            VnodeType::Fifo => {
                let pipe = vnode.pipe.lock().clone().ok_or(Errno::EBADF)?;
                let mut buf = vec![0u8; len];
                let n = pipe.read(&mut buf).await?;
                vnode.listeners.fire(hint::WR);
                buf.truncate(n);
                Ok(buf)
            }
            VnodeType::Chr | VnodeType::Blk => {
                let offset = *filp.offset.lock();
                let data = self.fs.vfs_read(process.pid, &vnode, offset, len).await?;
                *filp.offset.lock() = offset + data.len() as u64;
                Ok(data)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    /// Writes `data` to a descriptor, returning the byte count.
    pub async fn sys_write(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        data: &[u8],
    ) -> Result<usize, Errno> {
        let (filp, vnode) = self.writable_filp(process, fd)?;
        match vnode.vnode_type() {
            VnodeType::Dir => Err(Errno::EISDIR),
            VnodeType::Reg => {
                if vnode.superblock.is_readonly() {
                    return Err(Errno::EPERM);
                }
                // Writers of one file serialize on its busy lock;
                // sub-cluster interleaving is the callers' problem.
                let _busy = vnode.lock().await;
                let mut offset = if filp.flags.lock().contains(OpenFlags::APPEND) {
                    vnode.size()
                } else {
                    *filp.offset.lock()
                };
                let n = self
                    .fs
                    .write_to_cache(process.pid, &vnode, data, &mut offset)
                    .await?;
                *filp.offset.lock() = offset;
                vnode.listeners.fire(hint::WRITE);
                Ok(n)
            }
            VnodeType::Fifo => {
                let pipe = vnode.pipe.lock().clone().ok_or(Errno::EBADF)?;
                let n = pipe.write(data).await?;
                vnode.listeners.fire(hint::RD);
                Ok(n)
            }
            VnodeType::Chr | VnodeType::Blk => {
                let offset = *filp.offset.lock();
                let n = self.fs.vfs_write(process.pid, &vnode, offset, data).await?;
                *filp.offset.lock() = offset + n as u64;
                Ok(n)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    /// Repositions a descriptor's offset.
    pub fn sys_lseek(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        offset: i64,
        whence: u32,
    ) -> Result<u64, Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        match vnode.vnode_type() {
            VnodeType::Fifo | VnodeType::Chr | VnodeType::Port => return Err(Errno::ESPIPE),
            _ => {}
        }
        let base = match whence {
            SEEK_SET => 0i64,
            SEEK_CUR => *filp.offset.lock() as i64,
            SEEK_END => vnode.size() as i64,
            _ => return Err(Errno::EINVAL),
        };
        let target = base.checked_add(offset).ok_or(Errno::EINVAL)?;
        if target < 0 {
            return Err(Errno::EINVAL);
        }
        *filp.offset.lock() = target as u64;
        Ok(target as u64)
    }

    /// Duplicates a descriptor onto the lowest free slot.
    pub fn sys_dup(self: &Arc<Self>, process: &Arc<Process>, fd: Fd) -> Result<Fd, Errno> {
        let mut handles = process.handles.lock();
        let filp = handles.get(fd)?;
        filp.add_share();
        match handles.alloc(filp.clone()) {
            Ok(newfd) => Ok(newfd),
            Err(e) => {
                filp.drop_share();
                Err(e)
            }
        }
    }

    /// Duplicates `fd` onto `newfd`, closing a live `newfd` first.
    pub async fn sys_dup2(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        newfd: Fd,
    ) -> Result<Fd, Errno> {
        if fd == newfd {
            process.handles.lock().get(fd)?;
            return Ok(newfd);
        }
        let displaced = {
            let mut handles = process.handles.lock();
            let filp = handles.get(fd)?;
            filp.add_share();
            handles.install_at(newfd, filp)?
        };
        if let Some(old) = displaced {
            self.release_filp(process, old).await;
        }
        Ok(newfd)
    }

    /// `fcntl`: `F_DUPFD`, `F_GETFD`, `F_SETFD`.
    pub fn sys_fcntl(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        cmd: u32,
        arg: u32,
    ) -> Result<u32, Errno> {
        let mut handles = process.handles.lock();
        match cmd {
            F_DUPFD => {
                let filp = handles.get(fd)?;
                filp.add_share();
                match handles.alloc_from(arg as usize, filp.clone()) {
                    Ok(newfd) => Ok(newfd.as_u32()),
                    Err(e) => {
                        filp.drop_share();
                        Err(e)
                    }
                }
            }
            F_GETFD => Ok(u32::from(handles.get_cloexec(fd)?)),
            F_SETFD => {
                handles.set_cloexec(fd, arg != 0)?;
                Ok(0)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    /// Status of an open descriptor.
    pub fn sys_fstat(self: &Arc<Self>, process: &Arc<Process>, fd: Fd) -> Result<Stat, Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        Ok(vnode.stat())
    }

    /// Status of a path.
    pub async fn sys_stat(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
    ) -> Result<Stat, Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::empty())
            .await?;
        let vnode = looked.vnode.ok_or(Errno::ENOENT)?;
        let stat = vnode.stat();
        self.fs.vnode_put(process.pid, &vnode).await;
        Ok(stat)
    }

    /// Changes permission bits of a path.
    pub async fn sys_chmod(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
        mode: u32,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::empty())
            .await?;
        let vnode = looked.vnode.ok_or(Errno::ENOENT)?;
        let result = self.fs.vfs_chmod(process.pid, &vnode, mode).await;
        vnode.listeners.fire(hint::ATTRIB);
        self.fs.vnode_put(process.pid, &vnode).await;
        result
    }

    /// Changes ownership of a path.
    pub async fn sys_chown(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
        uid: u32,
        gid: u32,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::empty())
            .await?;
        let vnode = looked.vnode.ok_or(Errno::ENOENT)?;
        let result = self.fs.vfs_chown(process.pid, &vnode, uid, gid).await;
        vnode.listeners.fire(hint::ATTRIB);
        self.fs.vnode_put(process.pid, &vnode).await;
        result
    }

    /// Truncates a path to `size`.
    pub async fn sys_truncate(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
        size: u64,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::empty())
            .await?;
        let vnode = looked.vnode.ok_or(Errno::ENOENT)?;
        let result = if vnode.is_dir() {
            Err(Errno::EISDIR)
        } else {
            self.fs.vfs_truncate(process.pid, &vnode, size).await
        };
        self.fs.vnode_put(process.pid, &vnode).await;
        result
    }

    /// Truncates an open file to `size`.
    pub async fn sys_ftruncate(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        size: u64,
    ) -> Result<(), Errno> {
        let (_filp, vnode) = self.writable_filp(process, fd)?;
        self.fs.vfs_truncate(process.pid, &vnode, size).await
    }

    /// Removes a name.
    pub async fn sys_unlink(
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

        let result = if vnode.is_dir() {
            Err(Errno::EISDIR)
        } else {
            self.fs
                .vfs_unlink(process.pid, &parent, &looked.last_component)
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

    /// Renames `old_path` to `new_path` within one file system.
    pub async fn sys_rename(
        self: &Arc<Self>,
        process: &Arc<Process>,
        old_path: &str,
        new_path: &str,
    ) -> Result<(), Errno> {
        let start = process.lookup_start(self)?;
        let old = self
            .fs
            .lookup(process.pid, &start, old_path, LookupFlags::REMOVE)
            .await?;
        let old_vnode = old.vnode.ok_or(Errno::ENOENT)?;
        let old_parent = old.parent.ok_or(Errno::EINVAL)?;

        let new = match self
            .fs
            .lookup(process.pid, &start, new_path, LookupFlags::PARENT)
            .await
        {
            Ok(new) => new,
            Err(e) => {
                self.fs.vnode_put(process.pid, &old_vnode).await;
                self.fs.vnode_put(process.pid, &old_parent).await;
                return Err(e);
            }
        };
        let new_parent = match new.parent {
            Some(ref parent) => parent.clone(),
            None => {
                if let Some(v) = new.vnode {
                    self.fs.vnode_put(process.pid, &v).await;
                }
                self.fs.vnode_put(process.pid, &old_vnode).await;
                self.fs.vnode_put(process.pid, &old_parent).await;
                return Err(Errno::EINVAL);
            }
        };

        let result = self
            .fs
            .vfs_rename(
                process.pid,
                &old_parent,
                &old.last_component,
                &new_parent,
                &new.last_component,
            )
            .await;
        if result.is_ok() {
            old_parent.listeners.fire(hint::WRITE);
            new_parent.listeners.fire(hint::WRITE);
        }

        if let Some(displaced) = new.vnode {
            self.fs.vnode_put(process.pid, &displaced).await;
        }
        self.fs.vnode_put(process.pid, &new_parent).await;
        self.fs.vnode_put(process.pid, &old_vnode).await;
        self.fs.vnode_put(process.pid, &old_parent).await;
        result
    }

    /// Commits a file's scheduled writes to its server.
    pub async fn sys_fsync(self: &Arc<Self>, process: &Arc<Process>, fd: Fd) -> Result<(), Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        self.fs.bsync(process.pid, &vnode).await
    }

    /// Creates an anonymous pipe; returns `(read_fd, write_fd)`.
    pub fn sys_pipe(self: &Arc<Self>, process: &Arc<Process>) -> Result<(Fd, Fd), Errno> {
        let sb = self.anon_superblock()?;
        let ino = self.alloc_anon_ino();
        let vnode = self.fs.vnodes.create(&sb, ino)?;
        vnode.init_from_attr(&cheviot_fs::wire::WireAttr {
            inode_nr: ino.as_i64(),
            size: 0,
            mode: S_IFIFO | 0o600,
            uid: *process.uid.lock(),
            gid: *process.gid.lock(),
            nlink: 1,
        });
        *vnode.pipe.lock() = Some(Arc::new(Pipe::new()));
        // Two filps share the v-node: one more reference.
        self.fs.vnodes.incref(&vnode);

        let reader = Filp::new(FilpObject::Vnode(vnode.clone()), OpenFlags::READ);
        let writer = Filp::new(FilpObject::Vnode(vnode), OpenFlags::WRITE);

        let mut handles = process.handles.lock();
        let rfd = handles.alloc(reader)?;
        let wfd = match handles.alloc(writer) {
            Ok(fd) => fd,
            Err(e) => {
                handles.remove(rfd).ok();
                return Err(e);
            }
        };
        Ok((rfd, wfd))
    }

    /// Is the descriptor a terminal?
    pub async fn sys_isatty(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
    ) -> Result<bool, Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        if vnode.vnode_type() != VnodeType::Chr {
            return Ok(false);
        }
        self.fs.vfs_isatty(process.pid, &vnode).await
    }

    /// Reads terminal attributes of a character device.
    pub async fn sys_tcgetattr(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
    ) -> Result<Termios, Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        if vnode.vnode_type() != VnodeType::Chr {
            return Err(Errno::ENOTTY);
        }
        self.fs.vfs_tcgetattr(process.pid, &vnode).await
    }

    /// Writes terminal attributes of a character device.
    pub async fn sys_tcsetattr(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        termios: &Termios,
    ) -> Result<(), Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        if vnode.vnode_type() != VnodeType::Chr {
            return Err(Errno::ENOTTY);
        }
        self.fs.vfs_tcsetattr(process.pid, &vnode, termios).await
    }

    pub(crate) fn alloc_anon_ino(self: &Arc<Self>) -> InodeNr {
        let mut next = self.next_anon_ino.lock();
        let ino = InodeNr::new(*next);
        *next += 1;
        ino
    }

    /// The shared anonymous superblock backing pipes.
    pub(crate) fn anon_superblock(
        self: &Arc<Self>,
    ) -> Result<Arc<cheviot_fs::SuperBlock>, Errno> {
        let mut anon = self.anon_sb.lock();
        if let Some(sb) = anon.clone() {
            return Ok(sb);
        }
        let sb = self.fs.mounts.alloc(cheviot_fs::SbFlags::ANON)?;
        *anon = Some(sb.clone());
        Ok(sb)
    }
}
