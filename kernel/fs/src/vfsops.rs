//! Kernel-side message builders for the server protocol.
//!
//! Each operation assembles a `[fsreq, name?, reply, payload?]` iov, sends
//! it on the target superblock's port, and interprets the reply. Reply
//! status at or below zero is `-errno`; positive statuses are byte
//! counts. Directory-shape operations serialize on the superblock lock.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use cheviot_core::Errno;
use cheviot_core::id::{InodeNr, Pid};
use cheviot_ipc::IovSeg;

use crate::FsCore;
use crate::mount::SuperBlock;
use crate::stat::Stat;
use crate::vnode::Vnode;
use crate::wire::{FSREPLY_SZ, FsReply, FsReq, Termios, WireAttr};

/// Index of the reply segment in a `[req, reply, ...]` iov.
const REPLY_SEG_NO_NAME: usize = 1;
/// Index of the reply segment in a `[req, name, reply, ...]` iov.
const REPLY_SEG_WITH_NAME: usize = 2;

fn reply_from(iov: &[IovSeg], index: usize) -> Result<FsReply, Errno> {
    FsReply::decode(iov.get(index).ok_or(Errno::EIO)?.bytes())
}

async fn send(
    sb: &Arc<SuperBlock>,
    pid: Pid,
    iov: Vec<IovSeg>,
) -> Result<(isize, Vec<IovSeg>), Errno> {
    if sb.is_aborted() || sb.flags().contains(crate::mount::SbFlags::ANON) {
        return Err(Errno::EIO);
    }
    let (status, iov) = sb.port.send(pid, iov).await?;
    if status < 0 {
        return Err(Errno::from_errno(-status as i32));
    }
    Ok((status, iov))
}

impl FsCore {
    /// Materializes the v-node a reply's attributes describe, reusing the
    /// cache where possible.
    fn vnode_from_attr(
        &self,
        dir: &Arc<Vnode>,
        attr: &WireAttr,
    ) -> Result<Arc<Vnode>, Errno> {
        let sb = &dir.superblock;
        if attr.inode_nr == dir.inode_nr.as_i64() {
            self.vnodes.incref(dir);
            return Ok(dir.clone());
        }
        let ino = InodeNr::new(attr.inode_nr);
        if let Some(vnode) = self.vnodes.get(sb.id, ino) {
            return Ok(vnode);
        }
        let vnode = self.vnodes.create(sb, ino)?;
        vnode.init_from_attr(attr);
        Ok(vnode)
    }

    /// Asks `dir`'s server to resolve one component name.
    pub async fn vfs_lookup(
        &self,
        pid: Pid,
        dir: &Arc<Vnode>,
        name: &str,
    ) -> Result<Arc<Vnode>, Errno> {
        let req = FsReq::Lookup {
            dir_inode_nr: dir.inode_nr.as_i64(),
            name_sz: name.len() as u32,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::readonly(name.as_bytes().to_vec()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        let (_, iov) = send(&dir.superblock, pid, iov).await?;
        match reply_from(&iov, REPLY_SEG_WITH_NAME)? {
            FsReply::Attr(attr) => self.vnode_from_attr(dir, &attr),
            _ => Err(Errno::EIO),
        }
    }

    /// Strategy read: fills `sz` bytes from `offset` of the file.
    pub async fn vfs_read(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        offset: u64,
        sz: usize,
    ) -> Result<Vec<u8>, Errno> {
        let req = FsReq::Read {
            inode_nr: vnode.inode_nr.as_i64(),
            offset,
            sz: sz as u64,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
            IovSeg::writable(vec![0u8; sz]),
        ];
        let (_, mut iov) = send(&vnode.superblock, pid, iov).await?;
        let nbytes = match reply_from(&iov, REPLY_SEG_NO_NAME)? {
            FsReply::Size { nbytes } if nbytes >= 0 => nbytes as usize,
            FsReply::Size { .. } => return Err(Errno::EIO),
            _ => return Err(Errno::EIO),
        };
        if nbytes > sz {
            return Err(Errno::EIO);
        }
        let mut data = iov.remove(2).into_bytes();
        data.truncate(nbytes);
        Ok(data)
    }

    /// Strategy write: commits `data` at `offset` of the file.
    pub async fn vfs_write(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, Errno> {
        if vnode.superblock.is_readonly() {
            return Err(Errno::EPERM);
        }
        let req = FsReq::Write {
            inode_nr: vnode.inode_nr.as_i64(),
            offset,
            sz: data.len() as u64,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
            IovSeg::readonly(data.to_vec()),
        ];
        let (_, iov) = send(&vnode.superblock, pid, iov).await?;
        match reply_from(&iov, REPLY_SEG_NO_NAME)? {
            FsReply::Size { nbytes } if nbytes >= 0 => Ok(nbytes as usize),
            _ => Err(Errno::EIO),
        }
    }

    /// Streams packed dirents from a directory. Returns the blob and the
    /// next resume cookie.
    pub async fn vfs_readdir(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        cookie: i64,
        sz: usize,
    ) -> Result<(Vec<u8>, i64), Errno> {
        let sb = vnode.superblock.clone();
        let _guard = sb.lock.lock().await;

        let req = FsReq::ReadDir {
            inode_nr: vnode.inode_nr.as_i64(),
            cookie,
            sz: sz as u64,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
            IovSeg::writable(vec![0u8; sz]),
        ];
        let (_, mut iov) = send(&sb, pid, iov).await?;
        match reply_from(&iov, REPLY_SEG_NO_NAME)? {
            FsReply::DirEnts { nbytes, cookie } if nbytes >= 0 && (nbytes as usize) <= sz => {
                let mut blob = iov.remove(2).into_bytes();
                blob.truncate(nbytes as usize);
                Ok((blob, cookie))
            }
            _ => Err(Errno::EIO),
        }
    }

    /// Creates a regular file in `dir`.
    pub async fn vfs_create(
        &self,
        pid: Pid,
        dir: &Arc<Vnode>,
        name: &str,
        oflags: u32,
        stat: &Stat,
    ) -> Result<Arc<Vnode>, Errno> {
        let sb = dir.superblock.clone();
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::Create {
            dir_inode_nr: dir.inode_nr.as_i64(),
            name_sz: name.len() as u32,
            oflags,
            mode: stat.st_mode,
            uid: stat.st_uid,
            gid: stat.st_gid,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::readonly(name.as_bytes().to_vec()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        let (_, iov) = send(&sb, pid, iov).await?;
        match reply_from(&iov, REPLY_SEG_WITH_NAME)? {
            FsReply::Attr(attr) => {
                let vnode = self.vnode_from_attr(dir, &attr)?;
                self.dnlc.enter(dir, name, Some(vnode.clone()));
                Ok(vnode)
            }
            _ => Err(Errno::EIO),
        }
    }

    /// Creates a directory in `dir`.
    pub async fn vfs_mkdir(
        &self,
        pid: Pid,
        dir: &Arc<Vnode>,
        name: &str,
        stat: &Stat,
    ) -> Result<Arc<Vnode>, Errno> {
        let sb = dir.superblock.clone();
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::MkDir {
            dir_inode_nr: dir.inode_nr.as_i64(),
            name_sz: name.len() as u32,
            mode: stat.st_mode,
            uid: stat.st_uid,
            gid: stat.st_gid,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::readonly(name.as_bytes().to_vec()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        let (_, iov) = send(&sb, pid, iov).await?;
        match reply_from(&iov, REPLY_SEG_WITH_NAME)? {
            FsReply::Attr(attr) => {
                let vnode = self.vnode_from_attr(dir, &attr)?;
                self.dnlc.enter(dir, name, Some(vnode.clone()));
                Ok(vnode)
            }
            _ => Err(Errno::EIO),
        }
    }

    /// Creates a node (device, fifo, mount cover) in `dir`.
    pub async fn vfs_mknod(
        &self,
        pid: Pid,
        dir: &Arc<Vnode>,
        name: &str,
        stat: &Stat,
    ) -> Result<Arc<Vnode>, Errno> {
        let sb = dir.superblock.clone();
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::MkNod {
            dir_inode_nr: dir.inode_nr.as_i64(),
            name_sz: name.len() as u32,
            mode: stat.st_mode,
            uid: stat.st_uid,
            gid: stat.st_gid,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::readonly(name.as_bytes().to_vec()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        let (_, iov) = send(&sb, pid, iov).await?;
        match reply_from(&iov, REPLY_SEG_WITH_NAME)? {
            FsReply::Attr(attr) => {
                let vnode = self.vnode_from_attr(dir, &attr)?;
                self.dnlc.enter(dir, name, Some(vnode.clone()));
                Ok(vnode)
            }
            _ => Err(Errno::EIO),
        }
    }

    /// Removes a name from `dir`.
    pub async fn vfs_unlink(&self, pid: Pid, dir: &Arc<Vnode>, name: &str) -> Result<(), Errno> {
        let sb = dir.superblock.clone();
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::Unlink {
            dir_inode_nr: dir.inode_nr.as_i64(),
            name_sz: name.len() as u32,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::readonly(name.as_bytes().to_vec()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        send(&sb, pid, iov).await?;
        self.dnlc.remove(dir, name);
        Ok(())
    }

    /// Removes a directory from `dir`.
    pub async fn vfs_rmdir(&self, pid: Pid, dir: &Arc<Vnode>, name: &str) -> Result<(), Errno> {
        let sb = dir.superblock.clone();
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::RmDir {
            dir_inode_nr: dir.inode_nr.as_i64(),
            name_sz: name.len() as u32,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::readonly(name.as_bytes().to_vec()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        send(&sb, pid, iov).await?;
        self.dnlc.remove(dir, name);
        Ok(())
    }

    /// Renames `src_name` in `src_dir` to `dst_name` in `dst_dir` (same
    /// file system).
    pub async fn vfs_rename(
        &self,
        pid: Pid,
        src_dir: &Arc<Vnode>,
        src_name: &str,
        dst_dir: &Arc<Vnode>,
        dst_name: &str,
    ) -> Result<(), Errno> {
        let sb = src_dir.superblock.clone();
        if !Arc::ptr_eq(&sb, &dst_dir.superblock) {
            return Err(Errno::EXDEV);
        }
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::Rename {
            src_dir_inode_nr: src_dir.inode_nr.as_i64(),
            dst_dir_inode_nr: dst_dir.inode_nr.as_i64(),
            src_name_sz: src_name.len() as u32,
            dst_name_sz: dst_name.len() as u32,
        };
        let mut names = src_name.as_bytes().to_vec();
        names.extend_from_slice(dst_name.as_bytes());
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::readonly(names),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        send(&sb, pid, iov).await?;
        self.dnlc.remove(src_dir, src_name);
        self.dnlc.remove(dst_dir, dst_name);
        Ok(())
    }

    /// Sets a file's size.
    pub async fn vfs_truncate(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        size: u64,
    ) -> Result<(), Errno> {
        let sb = vnode.superblock.clone();
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::Truncate {
            inode_nr: vnode.inode_nr.as_i64(),
            size,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        send(&sb, pid, iov).await?;
        vnode.set_size(size);
        self.cache.truncate(vnode, size);
        Ok(())
    }

    /// Changes permission bits.
    pub async fn vfs_chmod(&self, pid: Pid, vnode: &Arc<Vnode>, mode: u32) -> Result<(), Errno> {
        let sb = vnode.superblock.clone();
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::Chmod {
            inode_nr: vnode.inode_nr.as_i64(),
            mode,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        send(&sb, pid, iov).await?;
        vnode.set_mode_bits(mode);
        Ok(())
    }

    /// Changes ownership.
    pub async fn vfs_chown(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        uid: u32,
        gid: u32,
    ) -> Result<(), Errno> {
        let sb = vnode.superblock.clone();
        if sb.is_readonly() {
            return Err(Errno::EPERM);
        }
        let _guard = sb.lock.lock().await;

        let req = FsReq::Chown {
            inode_nr: vnode.inode_nr.as_i64(),
            uid,
            gid,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        send(&sb, pid, iov).await?;
        vnode.set_owner(uid, gid);
        Ok(())
    }

    /// Tells the server the kernel dropped its last reference.
    pub async fn vfs_close(&self, pid: Pid, vnode: &Arc<Vnode>) -> Result<(), Errno> {
        // Anonymous v-nodes (pipes) have no server to tell, and a mount
        // that is already torn down has nobody left to answer.
        if vnode
            .superblock
            .flags()
            .contains(crate::mount::SbFlags::ANON)
            || self.mounts.find(vnode.superblock.id).is_none()
        {
            return Ok(());
        }
        let req = FsReq::Close {
            inode_nr: vnode.inode_nr.as_i64(),
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        send(&vnode.superblock, pid, iov).await?;
        Ok(())
    }

    /// Reads a symlink's target.
    pub async fn vfs_rdlink(&self, pid: Pid, vnode: &Arc<Vnode>) -> Result<String, Errno> {
        let sz = crate::PATH_MAX;
        let req = FsReq::ReadLink {
            inode_nr: vnode.inode_nr.as_i64(),
            sz: sz as u64,
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
            IovSeg::writable(vec![0u8; sz]),
        ];
        let (_, mut iov) = send(&vnode.superblock, pid, iov).await?;
        match reply_from(&iov, REPLY_SEG_NO_NAME)? {
            FsReply::Size { nbytes } if nbytes >= 0 && (nbytes as usize) <= sz => {
                let mut data = iov.remove(2).into_bytes();
                data.truncate(nbytes as usize);
                String::from_utf8(data).map_err(|_| Errno::EIO)
            }
            _ => Err(Errno::EIO),
        }
    }

    /// Is the device a terminal?
    pub async fn vfs_isatty(&self, pid: Pid, vnode: &Arc<Vnode>) -> Result<bool, Errno> {
        let req = FsReq::IsATty {
            inode_nr: vnode.inode_nr.as_i64(),
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
        ];
        let (status, _) = send(&vnode.superblock, pid, iov).await?;
        Ok(status > 0)
    }

    /// Reads terminal attributes.
    pub async fn vfs_tcgetattr(&self, pid: Pid, vnode: &Arc<Vnode>) -> Result<Termios, Errno> {
        let req = FsReq::TcGetAttr {
            inode_nr: vnode.inode_nr.as_i64(),
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
            IovSeg::writable(vec![0u8; crate::wire::TERMIOS_SZ]),
        ];
        let (_, iov) = send(&vnode.superblock, pid, iov).await?;
        Termios::decode(iov.get(2).ok_or(Errno::EIO)?.bytes())
    }

    /// Writes terminal attributes.
    pub async fn vfs_tcsetattr(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        termios: &Termios,
    ) -> Result<(), Errno> {
        let req = FsReq::TcSetAttr {
            inode_nr: vnode.inode_nr.as_i64(),
        };
        let iov = vec![
            IovSeg::readonly(req.encode()),
            IovSeg::writable(vec![0u8; FSREPLY_SZ]),
            IovSeg::readonly(termios.encode()),
        ];
        send(&vnode.superblock, pid, iov).await?;
        Ok(())
    }

    /// Drops a v-node reference; at zero the server is told (`CLOSE`),
    /// name-cache entries referencing the v-node are purged, and the
    /// v-node parks on the free list.
    pub async fn vnode_put(&self, pid: Pid, vnode: &Arc<Vnode>) {
        if self.vnodes.decref(vnode) {
            self.dnlc.purge_vnode(vnode);
            // Best effort: the server may already be gone.
            let _ = self.vfs_close(pid, vnode).await;
        }
    }
}
