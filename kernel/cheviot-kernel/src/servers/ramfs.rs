//! The ramfs server: a read-write RAM file system.
//!
//! The reference implementation of the full server protocol: creates,
//! strategy reads and writes, directory mutation, rename, truncate and
//! attribute changes over an in-memory node store. Integration tests
//! mount it to exercise the VFS end to end, and its on-"disk" state is
//! observable through [`RamFs::snapshot`] for write-back assertions.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cheviot_core::{Errno, kinfo};
use cheviot_core::id::{Fd, Pid};
use cheviot_core::sync::SpinLock;
use cheviot_fs::stat::{S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
use cheviot_fs::wire::{
    FSREPLY_SZ, FSREQ_SZ, FsReply, FsReq, WireAttr, pack_dirent,
};

use crate::context::Kernel;
use crate::kqueue::{Filter, Kevent};
use crate::proc::Process;
use crate::syscall::file::O_EXCL;

/// One node of the store.
#[derive(Debug, Clone)]
pub struct RamNode {
    /// Entry name (empty for the root).
    pub name: String,
    /// Parent inode.
    pub parent: i64,
    /// Type and permission bits.
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// File contents (empty for directories).
    pub data: Vec<u8>,
    /// Symlink target for `S_IFLNK` nodes.
    pub link_target: Option<String>,
}

/// The in-memory store behind one ramfs mount.
pub struct RamFs {
    nodes: BTreeMap<i64, RamNode>,
    next_ino: i64,
}

impl RamFs {
    /// Creates a store containing an empty root directory (inode 0).
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            0,
            RamNode {
                name: String::new(),
                parent: 0,
                mode: S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                data: Vec::new(),
                link_target: None,
            },
        );
        Self { nodes, next_ino: 1 }
    }

    fn alloc_ino(&mut self) -> i64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn lookup(&self, dir: i64, name: &str) -> Option<(i64, &RamNode)> {
        self.nodes
            .iter()
            .find(|&(&ino, ref n)| n.parent == dir && n.name == name && ino != dir)
            .map(|(&ino, n)| (ino, n))
    }

    fn children(&self, dir: i64) -> Vec<(i64, String)> {
        self.nodes
            .iter()
            .filter(|&(&ino, ref n)| n.parent == dir && ino != dir)
            .map(|(&ino, n)| (ino, n.name.clone()))
            .collect()
    }

    fn attr_of(&self, ino: i64) -> Option<WireAttr> {
        self.nodes.get(&ino).map(|n| WireAttr {
            inode_nr: ino,
            size: n.data.len() as u64,
            mode: n.mode,
            uid: n.uid,
            gid: n.gid,
            nlink: 1,
        })
    }

    /// Plants a symlink (tests exercise resolver splicing through this).
    pub fn add_symlink(&mut self, parent: i64, name: &str, target: &str) -> i64 {
        let ino = self.alloc_ino();
        self.nodes.insert(
            ino,
            RamNode {
                name: String::from(name),
                parent,
                mode: S_IFLNK | 0o777,
                uid: 0,
                gid: 0,
                data: Vec::new(),
                link_target: Some(String::from(target)),
            },
        );
        ino
    }

    /// Plants a regular file.
    pub fn add_file(&mut self, parent: i64, name: &str, data: &[u8]) -> i64 {
        let ino = self.alloc_ino();
        self.nodes.insert(
            ino,
            RamNode {
                name: String::from(name),
                parent,
                mode: S_IFREG | 0o644,
                uid: 0,
                gid: 0,
                data: data.to_vec(),
                link_target: None,
            },
        );
        ino
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a store, so tests can inspect the server's state.
#[derive(Clone)]
pub struct RamFsHandle(pub Arc<SpinLock<RamFs>>);

impl RamFsHandle {
    /// Wraps a store.
    pub fn new(fs: RamFs) -> Self {
        Self(Arc::new(SpinLock::new(fs)))
    }

    /// Copies out a file's contents by path from the root, for
    /// write-back assertions.
    pub fn snapshot(&self, path: &str) -> Option<Vec<u8>> {
        let fs = self.0.lock();
        let mut ino = 0i64;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let (next, _) = fs.lookup(ino, comp)?;
            ino = next;
        }
        fs.nodes.get(&ino).map(|n| n.data.clone())
    }
}

/// The server task body. Runs until the port dies.
pub async fn ramfs_server(
    kernel: Arc<Kernel>,
    process: Arc<Process>,
    port_fd: Fd,
    store: RamFsHandle,
) {
    let Ok(kq) = kernel.sys_kqueue(&process) else {
        return;
    };
    let register = [Kevent::add(port_fd.as_usize(), Filter::MsgPort)];
    if kernel
        .sys_kevent(&process, kq, &register, 0, None)
        .await
        .is_err()
    {
        return;
    }
    kinfo!("ramfs: serving");

    loop {
        let events = match kernel.sys_kevent(&process, kq, &[], 1, None).await {
            Ok(events) => events,
            Err(_) => return,
        };
        if events.is_empty() {
            continue;
        }

        loop {
            let msg = match kernel.sys_get_msg(&process, port_fd, FSREQ_SZ) {
                Ok(msg) => msg,
                Err(_) => return,
            };
            let Some((msgid, req_bytes)) = msg else {
                break;
            };
            let Ok(req) = FsReq::decode(&req_bytes) else {
                reply_err(&kernel, &process, port_fd, msgid, Errno::EIO);
                continue;
            };
            handle(&kernel, &process, port_fd, msgid, &store, req);
        }
    }
}

fn reply_err(kernel: &Arc<Kernel>, process: &Arc<Process>, port_fd: Fd, msgid: Pid, e: Errno) {
    let _ = kernel.sys_reply_msg(
        process,
        port_fd,
        msgid,
        -(e.to_errno() as isize),
        &[],
        0,
    );
}

fn reply_attr(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    port_fd: Fd,
    msgid: Pid,
    attr: WireAttr,
    reply_offset: usize,
) {
    let reply = FsReply::Attr(attr).encode();
    let _ = kernel.sys_reply_msg(process, port_fd, msgid, 0, &reply, reply_offset);
}

// A bare success status. The reply placeholder's position varies with
// the command's name segments, and the kernel ignores its contents for
// these commands, so nothing is written back.
fn reply_empty(kernel: &Arc<Kernel>, process: &Arc<Process>, port_fd: Fd, msgid: Pid) {
    let _ = kernel.sys_reply_msg(process, port_fd, msgid, 0, &[], 0);
}

fn read_name(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    port_fd: Fd,
    msgid: Pid,
    name_sz: u32,
) -> Result<String, Errno> {
    let bytes = kernel.sys_read_msg(process, port_fd, msgid, name_sz as usize)?;
    core::str::from_utf8(&bytes)
        .map(String::from)
        .map_err(|_| Errno::EINVAL)
}

#[allow(clippy::too_many_lines)]
fn handle(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    port_fd: Fd,
    msgid: Pid,
    store: &RamFsHandle,
    req: FsReq,
) {
    match req {
        FsReq::Lookup {
            dir_inode_nr,
            name_sz,
        } => {
            let Ok(name) = read_name(kernel, process, port_fd, msgid, name_sz) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            };
            let fs = store.0.lock();
            let found = if name == ".." {
                fs.nodes.get(&dir_inode_nr).map(|n| n.parent)
            } else {
                fs.lookup(dir_inode_nr, &name).map(|(ino, _)| ino)
            };
            let attr = found.and_then(|ino| fs.attr_of(ino));
            drop(fs);
            match attr {
                Some(attr) => reply_attr(
                    kernel,
                    process,
                    port_fd,
                    msgid,
                    attr,
                    FSREQ_SZ + name_sz as usize,
                ),
                None => reply_err(kernel, process, port_fd, msgid, Errno::ENOENT),
            }
        }

        FsReq::Create {
            dir_inode_nr,
            name_sz,
            oflags,
            mode,
            uid,
            gid,
        } => {
            let Ok(name) = read_name(kernel, process, port_fd, msgid, name_sz) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            };
            let mut fs = store.0.lock();
            if let Some((existing, node)) = fs.lookup(dir_inode_nr, &name) {
                // Open-exclusive races resolve here: the second creator
                // loses.
                if oflags & O_EXCL != 0 || node.mode & S_IFMT == S_IFDIR {
                    drop(fs);
                    return reply_err(kernel, process, port_fd, msgid, Errno::EEXIST);
                }
                let attr = fs.attr_of(existing).expect("node exists");
                drop(fs);
                return reply_attr(
                    kernel,
                    process,
                    port_fd,
                    msgid,
                    attr,
                    FSREQ_SZ + name_sz as usize,
                );
            }
            let ino = fs.alloc_ino();
            fs.nodes.insert(
                ino,
                RamNode {
                    name,
                    parent: dir_inode_nr,
                    mode: S_IFREG | (mode & !S_IFMT),
                    uid,
                    gid,
                    data: Vec::new(),
                    link_target: None,
                },
            );
            let attr = fs.attr_of(ino).expect("just inserted");
            drop(fs);
            reply_attr(
                kernel,
                process,
                port_fd,
                msgid,
                attr,
                FSREQ_SZ + name_sz as usize,
            );
        }

        FsReq::Read {
            inode_nr,
            offset,
            sz,
        } => {
            let fs = store.0.lock();
            let Some(node) = fs.nodes.get(&inode_nr) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            let start = (offset as usize).min(node.data.len());
            let end = (start + sz as usize).min(node.data.len());
            let data = node.data[start..end].to_vec();
            drop(fs);

            if !data.is_empty() {
                let _ = kernel.sys_seek_msg(process, port_fd, msgid, FSREQ_SZ + FSREPLY_SZ);
                if kernel
                    .sys_write_msg(process, port_fd, msgid, &data)
                    .is_err()
                {
                    return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
                }
            }
            let reply = FsReply::Size {
                nbytes: data.len() as i64,
            }
            .encode();
            let _ = kernel.sys_reply_msg(
                process,
                port_fd,
                msgid,
                data.len() as isize,
                &reply,
                FSREQ_SZ,
            );
        }

        FsReq::Write {
            inode_nr,
            offset,
            sz,
        } => {
            // Payload rides after the request and reply placeholders.
            let _ = kernel.sys_seek_msg(process, port_fd, msgid, FSREQ_SZ + FSREPLY_SZ);
            let Ok(payload) = kernel.sys_read_msg(process, port_fd, msgid, sz as usize)
            else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            };

            let mut fs = store.0.lock();
            let Some(node) = fs.nodes.get_mut(&inode_nr) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            let end = offset as usize + payload.len();
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[offset as usize..end].copy_from_slice(&payload);
            drop(fs);

            let reply = FsReply::Size {
                nbytes: payload.len() as i64,
            }
            .encode();
            let _ = kernel.sys_reply_msg(
                process,
                port_fd,
                msgid,
                payload.len() as isize,
                &reply,
                FSREQ_SZ,
            );
        }

        FsReq::ReadDir {
            inode_nr,
            cookie,
            sz,
        } => {
            let fs = store.0.lock();
            let Some(dir) = fs.nodes.get(&inode_nr) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            let parent = dir.parent;
            let children = fs.children(inode_nr);
            drop(fs);

            let max = (sz as usize).min(4096);
            let mut blob = Vec::new();
            let mut next_cookie = cookie;
            let mut entries: Vec<(i64, String)> = Vec::new();
            entries.push((inode_nr, String::from(".")));
            entries.push((parent, String::from("..")));
            entries.extend(children);

            for (index, (ino, name)) in entries.iter().enumerate() {
                let index = index as i64;
                if index < cookie {
                    continue;
                }
                if !pack_dirent(&mut blob, max, *ino, index + 1, name) {
                    break;
                }
                next_cookie = index + 1;
            }

            let nbytes = blob.len();
            if nbytes > 0 {
                let _ = kernel.sys_seek_msg(process, port_fd, msgid, FSREQ_SZ + FSREPLY_SZ);
                if kernel
                    .sys_write_msg(process, port_fd, msgid, &blob)
                    .is_err()
                {
                    return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
                }
            }
            let reply = FsReply::DirEnts {
                nbytes: nbytes as i64,
                cookie: next_cookie,
            }
            .encode();
            let _ = kernel.sys_reply_msg(
                process,
                port_fd,
                msgid,
                nbytes as isize,
                &reply,
                FSREQ_SZ,
            );
        }

        FsReq::MkDir {
            dir_inode_nr,
            name_sz,
            mode,
            uid,
            gid,
        }
        | FsReq::MkNod {
            dir_inode_nr,
            name_sz,
            mode,
            uid,
            gid,
        } => {
            let is_mkdir = matches!(req, FsReq::MkDir { .. });
            let Ok(name) = read_name(kernel, process, port_fd, msgid, name_sz) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            };
            let mut fs = store.0.lock();
            if fs.lookup(dir_inode_nr, &name).is_some() {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::EEXIST);
            }
            let mode = if is_mkdir {
                S_IFDIR | (mode & !S_IFMT)
            } else {
                mode
            };
            let ino = fs.alloc_ino();
            fs.nodes.insert(
                ino,
                RamNode {
                    name,
                    parent: dir_inode_nr,
                    mode,
                    uid,
                    gid,
                    data: Vec::new(),
                    link_target: None,
                },
            );
            let attr = fs.attr_of(ino).expect("just inserted");
            drop(fs);
            reply_attr(
                kernel,
                process,
                port_fd,
                msgid,
                attr,
                FSREQ_SZ + name_sz as usize,
            );
        }

        FsReq::Unlink {
            dir_inode_nr,
            name_sz,
        } => {
            let Ok(name) = read_name(kernel, process, port_fd, msgid, name_sz) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            };
            let mut fs = store.0.lock();
            let Some((ino, node)) = fs.lookup(dir_inode_nr, &name) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            if node.mode & S_IFMT == S_IFDIR {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::EISDIR);
            }
            fs.nodes.remove(&ino);
            drop(fs);
            reply_empty(kernel, process, port_fd, msgid);
        }

        FsReq::RmDir {
            dir_inode_nr,
            name_sz,
        } => {
            let Ok(name) = read_name(kernel, process, port_fd, msgid, name_sz) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            };
            let mut fs = store.0.lock();
            let Some((ino, node)) = fs.lookup(dir_inode_nr, &name) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            if node.mode & S_IFMT != S_IFDIR {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOTDIR);
            }
            if !fs.children(ino).is_empty() {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOTEMPTY);
            }
            fs.nodes.remove(&ino);
            drop(fs);
            reply_empty(kernel, process, port_fd, msgid);
        }

        FsReq::Rename {
            src_dir_inode_nr,
            dst_dir_inode_nr,
            src_name_sz,
            dst_name_sz,
        } => {
            let Ok(names) = kernel.sys_read_msg(
                process,
                port_fd,
                msgid,
                (src_name_sz + dst_name_sz) as usize,
            ) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            };
            let (src_bytes, dst_bytes) = names.split_at(src_name_sz as usize);
            let (Ok(src_name), Ok(dst_name)) = (
                core::str::from_utf8(src_bytes),
                core::str::from_utf8(dst_bytes),
            ) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EINVAL);
            };

            let mut fs = store.0.lock();
            let Some((src_ino, _)) = fs.lookup(src_dir_inode_nr, src_name) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            // A live destination is replaced.
            if let Some((dst_ino, _)) = fs.lookup(dst_dir_inode_nr, dst_name) {
                fs.nodes.remove(&dst_ino);
            }
            let dst_name = String::from(dst_name);
            if let Some(node) = fs.nodes.get_mut(&src_ino) {
                node.name = dst_name;
                node.parent = dst_dir_inode_nr;
            }
            drop(fs);
            reply_empty(kernel, process, port_fd, msgid);
        }

        FsReq::Truncate { inode_nr, size } => {
            let mut fs = store.0.lock();
            let Some(node) = fs.nodes.get_mut(&inode_nr) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            node.data.resize(size as usize, 0);
            drop(fs);
            reply_empty(kernel, process, port_fd, msgid);
        }

        FsReq::Chmod { inode_nr, mode } => {
            let mut fs = store.0.lock();
            let Some(node) = fs.nodes.get_mut(&inode_nr) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            node.mode = (node.mode & S_IFMT) | (mode & !S_IFMT);
            drop(fs);
            reply_empty(kernel, process, port_fd, msgid);
        }

        FsReq::Chown {
            inode_nr,
            uid,
            gid,
        } => {
            let mut fs = store.0.lock();
            let Some(node) = fs.nodes.get_mut(&inode_nr) else {
                drop(fs);
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            node.uid = uid;
            node.gid = gid;
            drop(fs);
            reply_empty(kernel, process, port_fd, msgid);
        }

        FsReq::ReadLink { inode_nr, sz } => {
            let fs = store.0.lock();
            let target = fs
                .nodes
                .get(&inode_nr)
                .and_then(|n| n.link_target.clone());
            drop(fs);
            let Some(target) = target else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EINVAL);
            };
            let bytes = target.as_bytes();
            let n = bytes.len().min(sz as usize);
            let _ = kernel.sys_seek_msg(process, port_fd, msgid, FSREQ_SZ + FSREPLY_SZ);
            if kernel
                .sys_write_msg(process, port_fd, msgid, &bytes[..n])
                .is_err()
            {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            }
            let reply = FsReply::Size { nbytes: n as i64 }.encode();
            let _ =
                kernel.sys_reply_msg(process, port_fd, msgid, n as isize, &reply, FSREQ_SZ);
        }

        FsReq::Close { .. } => reply_empty(kernel, process, port_fd, msgid),

        FsReq::IsATty { .. } => {
            let reply = FsReply::Empty.encode();
            let _ = kernel.sys_reply_msg(process, port_fd, msgid, 0, &reply, FSREQ_SZ);
        }

        _ => reply_err(kernel, process, port_fd, msgid, Errno::ENOTSUP),
    }
}
