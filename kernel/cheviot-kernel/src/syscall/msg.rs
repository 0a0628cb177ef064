//! Server-side message syscalls.
//!
//! A file system server holds the mount's port descriptor and uses these
//! calls to receive requests, stream the scatter/gather message in both
//! directions, and reply. The message id handed out by `get_msg` is the
//! sender's pid, which the partial read/write/seek calls re-address the
//! in-flight message by.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cheviot_core::Errno;
use cheviot_core::id::{Fd, Pid};
use cheviot_fs::{SuperBlock, VnodeType};

use crate::context::Kernel;
use crate::proc::Process;

impl Kernel {
    fn server_port(
        &self,
        process: &Arc<Process>,
        fd: Fd,
    ) -> Result<Arc<SuperBlock>, Errno> {
        let filp = process.handles.lock().get(fd)?;
        let vnode = filp.vnode().ok_or(Errno::EBADF)?;
        if vnode.vnode_type() != VnodeType::Port {
            return Err(Errno::EINVAL);
        }
        Ok(vnode.superblock.clone())
    }

    /// Dequeues the next pending message, returning the sender's pid and
    /// up to `bufsz` bytes from the head of the message. `None` when no
    /// message is queued.
    pub fn sys_get_msg(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        bufsz: usize,
    ) -> Result<Option<(Pid, Vec<u8>)>, Errno> {
        let sb = self.server_port(process, fd)?;
        Ok(sb.port.get_msg(bufsz))
    }

    /// Queue a message without waiting. Not implemented; synchronous
    /// sends cover the VFS protocol.
    pub fn sys_put_msg(self: &Arc<Self>, _process: &Arc<Process>, _fd: Fd) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Reads from the in-flight message of `msgid` at its cursor.
    pub fn sys_read_msg(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        msgid: Pid,
        bufsz: usize,
    ) -> Result<Vec<u8>, Errno> {
        let sb = self.server_port(process, fd)?;
        sb.port.read_msg(msgid, bufsz)
    }

    /// Writes into the in-flight message of `msgid` at its cursor.
    pub fn sys_write_msg(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        msgid: Pid,
        data: &[u8],
    ) -> Result<usize, Errno> {
        let sb = self.server_port(process, fd)?;
        sb.port.write_msg(msgid, data)
    }

    /// Repositions the in-flight message cursor of `msgid`.
    pub fn sys_seek_msg(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        msgid: Pid,
        offset: usize,
    ) -> Result<(), Errno> {
        let sb = self.server_port(process, fd)?;
        sb.port.seek_msg(msgid, offset)
    }

    /// Completes the in-flight message of `msgid`: writes `reply` at
    /// `reply_offset`, sets the status, and wakes the sender.
    pub fn sys_reply_msg(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fd: Fd,
        msgid: Pid,
        status: isize,
        reply: &[u8],
        reply_offset: usize,
    ) -> Result<(), Errno> {
        let sb = self.server_port(process, fd)?;
        sb.port.reply_msg(msgid, status, reply, reply_offset)
    }
}
