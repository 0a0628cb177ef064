//! Message ports and scatter/gather messages.
//!
//! Lifecycle of one message: the sender builds an iov, queues it on the
//! port (`Send`), wakes the port's watchers, and sleeps. The server
//! dequeues it (`Received`), streams the request out with [`MsgPort::get_msg`],
//! moves the shared cursor with `read_msg`/`write_msg`/`seek_msg`, and
//! finishes with `reply_msg` (`Replied`), which wakes the sender. States
//! are never revisited.
//!
//! Aborting a port completes every outstanding message with `EIO` and
//! fails all future sends, which is how a dying server unblocks its
//! clients.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cheviot_core::Errno;
use cheviot_core::event::Listeners;
use cheviot_core::id::Pid;
use cheviot_core::sync::{Rendez, SpinLock};

/// State of an in-flight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgState {
    /// Queued on the port, not yet seen by the server.
    Send,
    /// Dequeued by the server, cursor operations allowed.
    Received,
    /// Server replied; sender may collect the iov.
    Replied,
}

/// One scatter/gather segment of a message.
#[derive(Debug)]
pub struct IovSeg {
    data: Vec<u8>,
    writable: bool,
}

impl IovSeg {
    /// A read-only segment (request headers, names, write payloads).
    pub fn readonly(data: Vec<u8>) -> Self {
        Self {
            data,
            writable: false,
        }
    }

    /// A writable segment (reply placeholders, read payload buffers).
    pub fn writable(data: Vec<u8>) -> Self {
        Self {
            data,
            writable: true,
        }
    }

    /// Segment length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the segment is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Immutable view of the bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consumes the segment, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

struct MsgInner {
    state: MsgState,
    offset: usize,
    iov: Vec<IovSeg>,
    reply_status: isize,
    interrupted: bool,
}

/// A scatter/gather message pinned to its sender for its lifetime.
pub struct Msg {
    pid: Pid,
    inner: SpinLock<MsgInner>,
    rendez: Rendez,
}

impl Msg {
    fn new(pid: Pid, iov: Vec<IovSeg>) -> Arc<Self> {
        Arc::new(Self {
            pid,
            inner: SpinLock::new(MsgInner {
                state: MsgState::Send,
                offset: 0,
                iov,
                reply_status: 0,
                interrupted: false,
            }),
            rendez: Rendez::new(),
        })
    }

    /// The sending process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Current state.
    pub fn state(&self) -> MsgState {
        self.inner.lock().state
    }

    /// Total bytes across all iov segments.
    pub fn total_len(&self) -> usize {
        self.inner.lock().iov.iter().map(IovSeg::len).sum()
    }

    /// Takes the iov back after the reply. Collecting it in any earlier
    /// state is a kernel bug, so this asserts `Replied`.
    pub fn take_iov(&self) -> Vec<IovSeg> {
        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            MsgState::Replied,
            "iov collected before reply"
        );
        core::mem::take(&mut inner.iov)
    }

    fn complete(&self, status: isize) {
        {
            let mut inner = self.inner.lock();
            inner.reply_status = status;
            inner.state = MsgState::Replied;
        }
        self.rendez.wakeup_all();
    }
}

/// Hint passed to port listeners when a message arrives.
pub const PORT_HINT_MSG: u32 = 1;

/// The server end of a superblock: a FIFO of pending messages plus the
/// set of messages the server has received and not yet replied to.
pub struct MsgPort {
    pending: SpinLock<VecDeque<Arc<Msg>>>,
    received: SpinLock<BTreeMap<Pid, Arc<Msg>>>,
    aborted: SpinLock<bool>,
    /// Woken when a message arrives (servers block here or in kevent).
    pub rendez: Rendez,
    /// Fired with [`PORT_HINT_MSG`] on every arrival; event filters
    /// attach here.
    pub listeners: Listeners,
}

impl MsgPort {
    /// Creates an empty port.
    pub fn new() -> Self {
        Self {
            pending: SpinLock::new(VecDeque::new()),
            received: SpinLock::new(BTreeMap::new()),
            aborted: SpinLock::new(false),
            rendez: Rendez::new(),
            listeners: Listeners::new(),
        }
    }

    /// True once the port has been aborted.
    pub fn is_aborted(&self) -> bool {
        *self.aborted.lock()
    }

    /// True if a message is queued and not yet received.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    fn notify(&self) {
        self.rendez.wakeup_all();
        self.listeners.fire(PORT_HINT_MSG);
    }

    /// Sends `iov` and sleeps until the server replies.
    ///
    /// Returns the reply status and the iov (with server-written segments)
    /// on success. The caller is responsible for ensuring the sender has
    /// no other in-flight message.
    ///
    /// # Errors
    ///
    /// `EIO` if the port is aborted before or during the exchange;
    /// `EINTR` if a signal interrupts the wait before the server picked
    /// the message up.
    pub async fn send(&self, pid: Pid, iov: Vec<IovSeg>) -> Result<(isize, Vec<IovSeg>), Errno> {
        if self.is_aborted() {
            return Err(Errno::EIO);
        }

        let msg = Msg::new(pid, iov);
        self.pending.lock().push_back(msg.clone());
        self.notify();

        loop {
            {
                let inner = msg.inner.lock();
                if inner.state == MsgState::Replied {
                    break;
                }
                if inner.interrupted {
                    return Err(Errno::EINTR);
                }
            }
            msg.rendez.wait().await;
        }

        let status = msg.inner.lock().reply_status;
        Ok((status, msg.take_iov()))
    }

    /// Interrupts `pid`'s message if it is still queued (state `Send`).
    ///
    /// A message the server already received runs to completion; the
    /// sender keeps sleeping for the reply, matching the rule that only
    /// not-yet-started IPC unwinds with `EINTR`.
    pub fn interrupt(&self, pid: Pid) -> bool {
        let mut pending = self.pending.lock();
        if let Some(pos) = pending.iter().position(|m| m.pid == pid) {
            let msg = pending.remove(pos).expect("position was valid");
            drop(pending);
            msg.inner.lock().interrupted = true;
            msg.rendez.wakeup_all();
            true
        } else {
            false
        }
    }

    /// Dequeues the head message, transitioning it to `Received`, and
    /// streams up to `bufsz` bytes from the start of its iov.
    ///
    /// Returns `None` when no message is pending.
    pub fn get_msg(&self, bufsz: usize) -> Option<(Pid, Vec<u8>)> {
        let msg = self.pending.lock().pop_front()?;
        {
            let mut inner = msg.inner.lock();
            debug_assert_eq!(inner.state, MsgState::Send);
            inner.state = MsgState::Received;
            inner.offset = 0;
        }
        let pid = msg.pid;
        let data = self.copy_from(&msg, bufsz);
        self.received.lock().insert(pid, msg);
        Some((pid, data))
    }

    /// Reads up to `bufsz` bytes from `pid`'s received message at its
    /// cursor, advancing it.
    pub fn read_msg(&self, pid: Pid, bufsz: usize) -> Result<Vec<u8>, Errno> {
        let msg = self.received_msg(pid)?;
        Ok(self.copy_from(&msg, bufsz))
    }

    /// Writes `data` into `pid`'s received message at its cursor,
    /// advancing it. Read-only segments are skipped without transfer,
    /// stopping the write. Returns the number of bytes written.
    pub fn write_msg(&self, pid: Pid, data: &[u8]) -> Result<usize, Errno> {
        let msg = self.received_msg(pid)?;
        let mut inner = msg.inner.lock();
        let mut offset = inner.offset;
        let mut written = 0;

        'outer: for seg_start in SegWalk::new(&inner.iov) {
            let (idx, base, len) = seg_start;
            if offset >= base + len || written >= data.len() {
                continue;
            }
            if offset < base {
                break;
            }
            if !inner.iov[idx].writable {
                break 'outer;
            }
            let seg_off = offset - base;
            let n = (len - seg_off).min(data.len() - written);
            inner.iov[idx].data[seg_off..seg_off + n]
                .copy_from_slice(&data[written..written + n]);
            written += n;
            offset += n;
        }

        inner.offset = offset;
        Ok(written)
    }

    /// Sets the cursor of `pid`'s received message to an absolute offset.
    pub fn seek_msg(&self, pid: Pid, offset: usize) -> Result<(), Errno> {
        let msg = self.received_msg(pid)?;
        msg.inner.lock().offset = offset;
        Ok(())
    }

    /// Replies to `pid`'s received message: optional bytes into the given
    /// absolute offset, status code, state `Replied`, sender woken.
    pub fn reply_msg(&self, pid: Pid, status: isize, reply: &[u8], reply_offset: usize) -> Result<(), Errno> {
        let msg = self
            .received
            .lock()
            .remove(&pid)
            .ok_or(Errno::EINVAL)?;
        if !reply.is_empty() {
            {
                let mut inner = msg.inner.lock();
                inner.offset = reply_offset;
            }
            self.received.lock().insert(pid, msg.clone());
            let written = self.write_msg(pid, reply)?;
            self.received.lock().remove(&pid);
            if written < reply.len() {
                msg.complete(-(Errno::EFAULT.to_errno() as isize));
                return Err(Errno::EFAULT);
            }
        }
        msg.complete(status);
        Ok(())
    }

    /// Aborts the port: every pending and received message completes with
    /// `EIO`, all senders wake, and future sends fail.
    pub fn abort(&self) {
        *self.aborted.lock() = true;
        let drained: Vec<Arc<Msg>> = self.pending.lock().drain(..).collect();
        for msg in drained {
            msg.complete(-(Errno::EIO.to_errno() as isize));
        }
        let received: Vec<Arc<Msg>> = {
            let mut map = self.received.lock();
            let msgs = map.values().cloned().collect();
            map.clear();
            msgs
        };
        for msg in received {
            msg.complete(-(Errno::EIO.to_errno() as isize));
        }
        self.rendez.wakeup_all();
    }

    fn received_msg(&self, pid: Pid) -> Result<Arc<Msg>, Errno> {
        self.received.lock().get(&pid).cloned().ok_or(Errno::EINVAL)
    }

    fn copy_from(&self, msg: &Msg, bufsz: usize) -> Vec<u8> {
        let mut inner = msg.inner.lock();
        let mut offset = inner.offset;
        let mut out = Vec::new();

        for (idx, base, len) in SegWalk::new(&inner.iov) {
            if out.len() >= bufsz {
                break;
            }
            if offset >= base + len {
                continue;
            }
            if offset < base {
                break;
            }
            let seg_off = offset - base;
            let n = (len - seg_off).min(bufsz - out.len());
            out.extend_from_slice(&inner.iov[idx].data[seg_off..seg_off + n]);
            offset += n;
        }

        inner.offset = offset;
        out
    }
}

impl Default for MsgPort {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over `(index, base_offset, len)` of iov segments.
struct SegWalk {
    bases: Vec<(usize, usize, usize)>,
    pos: usize,
}

impl SegWalk {
    fn new(iov: &[IovSeg]) -> Self {
        let mut bases = Vec::with_capacity(iov.len());
        let mut base = 0;
        for (idx, seg) in iov.iter().enumerate() {
            bases.push((idx, base, seg.len()));
            base += seg.len();
        }
        Self { bases, pos: 0 }
    }
}

impl Iterator for SegWalk {
    type Item = (usize, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.bases.get(self.pos).copied();
        self.pos += 1;
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cheviot_sched::try_poll_immediate;

    fn three_seg_iov() -> Vec<IovSeg> {
        vec![
            IovSeg::readonly(vec![1, 2, 3, 4]),
            IovSeg::writable(vec![0; 4]),
            IovSeg::writable(vec![0; 8]),
        ]
    }

    #[test]
    fn get_msg_streams_across_segments() {
        let port = MsgPort::new();
        let mut send = Box::pin(port.send(Pid::new(7), three_seg_iov()));
        assert!(try_poll_immediate(send.as_mut()).is_none(), "sender blocks");

        let (pid, data) = port.get_msg(6).expect("message pending");
        assert_eq!(pid, Pid::new(7));
        assert_eq!(data, vec![1, 2, 3, 4, 0, 0], "crosses segment boundary");
    }

    #[test]
    fn cursor_advances_and_seeks() {
        let port = MsgPort::new();
        let mut send = Box::pin(port.send(Pid::new(1), three_seg_iov()));
        assert!(try_poll_immediate(send.as_mut()).is_none());

        let (pid, first) = port.get_msg(4).unwrap();
        assert_eq!(first.len(), 4);

        // Cursor sits at 4; read continues from there.
        let next = port.read_msg(pid, 2).unwrap();
        assert_eq!(next, vec![0, 0]);

        // Seek back to the start and re-read the header.
        port.seek_msg(pid, 0).unwrap();
        let again = port.read_msg(pid, 4).unwrap();
        assert_eq!(again, vec![1, 2, 3, 4]);
    }

    #[test]
    fn write_msg_respects_readonly_segments() {
        let port = MsgPort::new();
        let mut send = Box::pin(port.send(Pid::new(1), three_seg_iov()));
        assert!(try_poll_immediate(send.as_mut()).is_none());
        let (pid, _) = port.get_msg(0).unwrap();

        // Cursor at 0 points into the read-only request segment.
        let written = port.write_msg(pid, &[9, 9]).unwrap();
        assert_eq!(written, 0, "read-only segment blocks the write");

        // Seek to the writable area and write across both segments.
        port.seek_msg(pid, 4).unwrap();
        let written = port.write_msg(pid, &[5; 6]).unwrap();
        assert_eq!(written, 6);
    }

    #[test]
    fn reply_wakes_sender_with_status_and_data() {
        let port = MsgPort::new();
        let mut send = Box::pin(port.send(Pid::new(3), three_seg_iov()));
        assert!(try_poll_immediate(send.as_mut()).is_none());

        let (pid, _) = port.get_msg(4).unwrap();
        port.reply_msg(pid, 42, &[7, 7, 7, 7], 4).unwrap();

        let (status, iov) = try_poll_immediate(send.as_mut())
            .expect("sender resumes")
            .expect("send succeeds");
        assert_eq!(status, 42);
        assert_eq!(iov[1].bytes(), &[7, 7, 7, 7]);
    }

    #[test]
    fn fifo_delivery_order() {
        let port = MsgPort::new();
        let mut s1 = Box::pin(port.send(Pid::new(1), vec![IovSeg::readonly(vec![1])]));
        let mut s2 = Box::pin(port.send(Pid::new(2), vec![IovSeg::readonly(vec![2])]));
        assert!(try_poll_immediate(s1.as_mut()).is_none());
        assert!(try_poll_immediate(s2.as_mut()).is_none());

        let (pid_a, _) = port.get_msg(1).unwrap();
        let (pid_b, _) = port.get_msg(1).unwrap();
        assert_eq!(pid_a, Pid::new(1), "first sender served first");
        assert_eq!(pid_b, Pid::new(2));
    }

    #[test]
    fn state_sequence_never_revisited() {
        let port = MsgPort::new();
        let mut send = Box::pin(port.send(Pid::new(1), three_seg_iov()));
        assert!(try_poll_immediate(send.as_mut()).is_none());

        assert!(port.has_pending());
        let (pid, _) = port.get_msg(0).unwrap();
        assert!(!port.has_pending());

        port.reply_msg(pid, 0, &[], 0).unwrap();
        // A second reply must fail: the message left the received set.
        assert_eq!(port.reply_msg(pid, 0, &[], 0), Err(Errno::EINVAL));
    }

    #[test]
    fn abort_completes_everyone_with_eio() {
        let port = MsgPort::new();
        let mut queued = Box::pin(port.send(Pid::new(1), three_seg_iov()));
        let mut received = Box::pin(port.send(Pid::new(2), three_seg_iov()));
        assert!(try_poll_immediate(queued.as_mut()).is_none());
        assert!(try_poll_immediate(received.as_mut()).is_none());
        let _ = port.get_msg(0).unwrap();

        port.abort();

        let (status, _) = try_poll_immediate(queued.as_mut()).unwrap().unwrap();
        assert_eq!(status, -(Errno::EIO.to_errno() as isize));
        let (status, _) = try_poll_immediate(received.as_mut()).unwrap().unwrap();
        assert_eq!(status, -(Errno::EIO.to_errno() as isize));

        // Future sends fail outright.
        let result = try_poll_immediate(port.send(Pid::new(3), three_seg_iov()));
        assert_eq!(result.unwrap().unwrap_err(), Errno::EIO);
    }

    #[test]
    fn interrupt_unwinds_queued_message_only() {
        let port = MsgPort::new();
        let mut queued = Box::pin(port.send(Pid::new(1), three_seg_iov()));
        assert!(try_poll_immediate(queued.as_mut()).is_none());

        assert!(port.interrupt(Pid::new(1)));
        let result = try_poll_immediate(queued.as_mut()).unwrap();
        assert_eq!(result.unwrap_err(), Errno::EINTR);

        // A received message is not interruptible.
        let mut received = Box::pin(port.send(Pid::new(2), three_seg_iov()));
        assert!(try_poll_immediate(received.as_mut()).is_none());
        let _ = port.get_msg(0).unwrap();
        assert!(!port.interrupt(Pid::new(2)));
    }

    #[test]
    fn listener_fires_on_arrival() {
        use std::sync::Arc as StdArc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let port = MsgPort::new();
        let hits = StdArc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = port.listeners.add(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        let mut send = Box::pin(port.send(Pid::new(1), three_seg_iov()));
        assert!(try_poll_immediate(send.as_mut()).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        port.listeners.remove(id);
        let mut send2 = Box::pin(port.send(Pid::new(2), three_seg_iov()));
        assert!(try_poll_immediate(send2.as_mut()).is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1, "removed listener is silent");
    }
}
