//! The IFS server: read-only boot file system.
//!
//! Serves lookups, reads and directory scans straight out of the boot
//! image. Directory scans synthesize `.` and `..` ahead of the node
//! table's children; the readdir cookie is the entry index to resume at.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cheviot_core::{Errno, kinfo, kwarn};
use cheviot_core::id::{Fd, Pid};
use cheviot_fs::ifs::{IfsImage, IfsNode};
use cheviot_fs::wire::{
    FSREPLY_SZ, FSREQ_SZ, FsReply, FsReq, WireAttr, pack_dirent,
};

use crate::context::Kernel;
use crate::kqueue::{Filter, Kevent};
use crate::proc::Process;

fn attr_of(node: &IfsNode) -> WireAttr {
    WireAttr {
        inode_nr: i64::from(node.ino),
        size: u64::from(node.file_size),
        mode: node.perm,
        uid: node.uid as u32,
        gid: node.gid as u32,
        nlink: 1,
    }
}

/// The server task body. Runs until the port dies.
pub async fn ifs_server(
    kernel: Arc<Kernel>,
    process: Arc<Process>,
    port_fd: Fd,
    image: IfsImage,
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
        kwarn!("ifs: cannot watch port");
        return;
    }
    kinfo!("ifs: serving {} nodes", image.nodes().len());

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
            handle(&kernel, &process, port_fd, msgid, &image, req);
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

fn handle(
    kernel: &Arc<Kernel>,
    process: &Arc<Process>,
    port_fd: Fd,
    msgid: Pid,
    image: &IfsImage,
    req: FsReq,
) {
    match req {
        FsReq::Lookup {
            dir_inode_nr,
            name_sz,
        } => {
            let Ok(name_bytes) =
                kernel.sys_read_msg(process, port_fd, msgid, name_sz as usize)
            else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
            };
            let Ok(name) = core::str::from_utf8(&name_bytes) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::EINVAL);
            };

            let found = if name == ".." {
                image
                    .node(dir_inode_nr)
                    .and_then(|n| image.node(i64::from(n.parent_ino)))
            } else {
                image.lookup(dir_inode_nr, name)
            };

            match found {
                Some(node) => {
                    let reply = FsReply::Attr(attr_of(node)).encode();
                    let _ = kernel.sys_reply_msg(
                        process,
                        port_fd,
                        msgid,
                        0,
                        &reply,
                        FSREQ_SZ + name_sz as usize,
                    );
                }
                None => reply_err(kernel, process, port_fd, msgid, Errno::ENOENT),
            }
        }

        FsReq::Read {
            inode_nr,
            offset,
            sz,
        } => {
            let Some(node) = image.node(inode_nr) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            let data = image.file_data(node, offset, sz as usize);
            let nbytes = data.len();
            if nbytes > 0 {
                let _ = kernel.sys_seek_msg(process, port_fd, msgid, FSREQ_SZ + FSREPLY_SZ);
                if kernel
                    .sys_write_msg(process, port_fd, msgid, data)
                    .is_err()
                {
                    return reply_err(kernel, process, port_fd, msgid, Errno::EIO);
                }
            }
            let reply = FsReply::Size {
                nbytes: nbytes as i64,
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

        FsReq::ReadDir {
            inode_nr,
            cookie,
            sz,
        } => {
            let Some(dir) = image.node(inode_nr) else {
                return reply_err(kernel, process, port_fd, msgid, Errno::ENOENT);
            };
            let max = (sz as usize).min(4096);
            let mut blob = Vec::new();

            // Entry index space: 0 = ".", 1 = "..", 2+i = children.
            let mut index = 0i64;
            let mut next_cookie = cookie;
            let mut emit = |ino: i64, name: &str, index: i64| -> bool {
                if index < cookie {
                    return true;
                }
                if !pack_dirent(&mut blob, max, ino, index + 1, name) {
                    return false;
                }
                next_cookie = index + 1;
                true
            };

            let mut full = !emit(i64::from(dir.ino), ".", index);
            index += 1;
            if !full {
                let parent = i64::from(dir.parent_ino);
                full = !emit(parent, "..", index);
                index += 1;
            }
            if !full {
                for child in image.children(inode_nr) {
                    if !emit(i64::from(child.ino), &child.name, index) {
                        break;
                    }
                    index += 1;
                }
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

        FsReq::Close { .. } => {
            let reply = FsReply::Empty.encode();
            let _ = kernel.sys_reply_msg(process, port_fd, msgid, 0, &reply, FSREQ_SZ);
        }

        FsReq::Write { .. } | FsReq::Truncate { .. } => {
            reply_err(kernel, process, port_fd, msgid, Errno::EPERM)
        }

        _ => reply_err(kernel, process, port_fd, msgid, Errno::ENOTSUP),
    }
}
