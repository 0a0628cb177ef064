//! Event syscalls: kqueue, kevent and poll.
//!
//! `EV_ADD` attaches the note to the watched object's listener list and
//! immediately raises it when the object is already in the ready state:
//! a registration racing an event that has already happened must not
//! block until the next one.

use alloc::sync::Arc;
use alloc::vec::Vec;

use cheviot_core::Errno;
use cheviot_core::id::Fd;
use cheviot_fs::VnodeType;
use cheviot_ipc::PollEvents;

use crate::context::Kernel;
use crate::handle::{Filp, FilpObject, OpenFlags};
use crate::kqueue::{Filter, KNote, KQueue, KevFlags, Kevent};
use crate::proc::Process;

/// Readable (poll).
pub const POLLIN: u32 = 1 << 0;
/// Writable (poll).
pub const POLLOUT: u32 = 1 << 2;
/// Hung up (poll).
pub const POLLHUP: u32 = 1 << 4;
/// Invalid descriptor (poll).
pub const POLLNVAL: u32 = 1 << 5;

/// `EVFILT_USER`: trigger the event.
pub const NOTE_TRIGGER: u32 = 0x0100_0000;

impl Kernel {
    /// Creates an event queue descriptor.
    pub fn sys_kqueue(self: &Arc<Self>, process: &Arc<Process>) -> Result<Fd, Errno> {
        let filp = Filp::new(
            FilpObject::KQueue(KQueue::new()),
            OpenFlags::READ | OpenFlags::WRITE,
        );
        self.install_filp(process, filp)
    }

    fn kqueue_of(&self, process: &Arc<Process>, fd: Fd) -> Result<Arc<KQueue>, Errno> {
        let filp = process.handles.lock().get(fd)?;
        match &filp.object {
            FilpObject::KQueue(kq) => Ok(kq.clone()),
            _ => Err(Errno::EBADF),
        }
    }

    /// Current readiness of a descriptor, as poll bits.
    fn readiness(&self, process: &Arc<Process>, fd: Fd) -> PollEvents {
        let Ok(filp) = process.handles.lock().get(fd) else {
            return PollEvents::empty();
        };
        match &filp.object {
            FilpObject::Vnode(vnode) => match vnode.vnode_type() {
                VnodeType::Fifo => vnode
                    .pipe
                    .lock()
                    .as_ref()
                    .map(|p| p.poll_events())
                    .unwrap_or(PollEvents::empty()),
                VnodeType::Port => {
                    let mut events = PollEvents::POLLOUT;
                    if vnode.superblock.port.has_pending() {
                        events |= PollEvents::POLLIN;
                    }
                    events
                }
                // Regular files and devices never block here.
                _ => PollEvents::POLLIN | PollEvents::POLLOUT,
            },
            FilpObject::KQueue(kq) => {
                if kq.has_pending() {
                    PollEvents::POLLIN
                } else {
                    PollEvents::empty()
                }
            }
            FilpObject::Timer(timer) => {
                if timer.has_fired() {
                    PollEvents::POLLIN
                } else {
                    PollEvents::empty()
                }
            }
            FilpObject::Irq(_, _) => PollEvents::empty(),
        }
    }

    /// Attaches a registered note to its object and performs the
    /// initial-readiness check.
    fn attach_note(
        self: &Arc<Self>,
        process: &Arc<Process>,
        kq: &Arc<KQueue>,
        note: &Arc<KNote>,
        change: &Kevent,
    ) -> Result<(), Errno> {
        let fd = Fd::new(note.ident as u32);
        match note.filter {
            Filter::Read | Filter::Write | Filter::Vnode => {
                let filp = process.handles.lock().get(fd)?;
                let vnode = filp.vnode().ok_or(Errno::EBADF)?;
                let hook = kq.activation_hook(note);
                let id = vnode.listeners.add(hook);
                {
                    let vnode = vnode.clone();
                    note.set_detach(alloc::boxed::Box::new(move || {
                        vnode.listeners.remove(id)
                    }));
                }

                let ready = self.readiness(process, fd);
                let want = match note.filter {
                    Filter::Read => ready.contains(PollEvents::POLLIN),
                    Filter::Write => ready.contains(PollEvents::POLLOUT),
                    Filter::Vnode => false,
                    _ => false,
                };
                if want {
                    kq.activate(note, 0);
                }
            }
            Filter::MsgPort => {
                let filp = process.handles.lock().get(fd)?;
                let vnode = filp.vnode().ok_or(Errno::EBADF)?;
                if vnode.vnode_type() != VnodeType::Port {
                    return Err(Errno::EBADF);
                }
                let sb = vnode.superblock.clone();
                let hook = kq.activation_hook(note);
                let id = sb.port.listeners.add(hook);
                {
                    let sb = sb.clone();
                    note.set_detach(alloc::boxed::Box::new(move || {
                        sb.port.listeners.remove(id)
                    }));
                }
                // A message may already be queued: raise the initial
                // notification now or the server waits forever.
                if sb.port.has_pending() {
                    kq.activate(note, cheviot_ipc::msg::PORT_HINT_MSG);
                }
            }
            Filter::Timer => {
                let filp = process.handles.lock().get(fd)?;
                let FilpObject::Timer(ref timer) = filp.object else {
                    return Err(Errno::EBADF);
                };
                let hook = kq.activation_hook(note);
                let id = timer.listeners.add(hook);
                {
                    let timer = timer.clone();
                    note.set_detach(alloc::boxed::Box::new(move || {
                        timer.listeners.remove(id)
                    }));
                }
                if timer.has_fired() {
                    kq.activate(note, 1);
                }
            }
            Filter::Irq => {
                let filp = process.handles.lock().get(fd)?;
                let FilpObject::Irq(_, ref listeners) = filp.object else {
                    return Err(Errno::EBADF);
                };
                let hook = kq.activation_hook(note);
                let id = listeners.add(hook);
                {
                    let listeners = listeners.clone();
                    note.set_detach(alloc::boxed::Box::new(move || listeners.remove(id)));
                }
            }
            Filter::User => {
                if change.fflags & NOTE_TRIGGER != 0 {
                    kq.activate(note, change.fflags);
                }
            }
        }
        Ok(())
    }

    /// Registers changes and waits for events.
    ///
    /// `timeout` of `None` blocks indefinitely, `Some(0)` polls, and a
    /// positive value is a relative wait in jiffies; a timed-out wait
    /// returns no events.
    pub async fn sys_kevent(
        self: &Arc<Self>,
        process: &Arc<Process>,
        kqfd: Fd,
        changes: &[Kevent],
        max_events: usize,
        timeout: Option<u64>,
    ) -> Result<Vec<Kevent>, Errno> {
        let kq = self.kqueue_of(process, kqfd)?;
        let _busy = kq.busy.lock().await;

        for change in changes {
            if change.flags.contains(KevFlags::EV_ADD) {
                let note = kq.register(change.ident, change.filter, change.flags, change.udata)?;
                if let Err(e) = self.attach_note(process, &kq, &note, change) {
                    kq.unregister(&note);
                    return Err(e);
                }
            } else if change.flags.contains(KevFlags::EV_DELETE) {
                let note = kq
                    .find(change.ident, change.filter)
                    .ok_or(Errno::EINVAL)?;
                kq.unregister(&note);
            } else {
                let note = kq
                    .find(change.ident, change.filter)
                    .ok_or(Errno::EINVAL)?;
                if change.flags.contains(KevFlags::EV_ENABLE) {
                    note.flags.lock().remove(KevFlags::EV_DISABLE);
                }
                if change.flags.contains(KevFlags::EV_DISABLE) {
                    note.flags.lock().insert(KevFlags::EV_DISABLE);
                }
                if change.filter == Filter::User && change.fflags & NOTE_TRIGGER != 0 {
                    kq.activate(&note, change.fflags);
                }
            }
        }

        if max_events == 0 {
            return Ok(Vec::new());
        }

        loop {
            let events = kq.drain_pending(max_events);
            if !events.is_empty() {
                return Ok(events);
            }
            match timeout {
                Some(0) => return Ok(Vec::new()),
                Some(ticks) => {
                    if self
                        .timers
                        .timed_wait(&kq.rendez, Some(ticks))
                        .await
                        .is_err()
                    {
                        return Ok(kq.drain_pending(max_events));
                    }
                }
                None => kq.rendez.wait().await,
            }
        }
    }

    /// Waits for readiness on a set of descriptors.
    ///
    /// Returns one `revents` word per input entry, in order. Built on
    /// the kqueue machinery with an ephemeral queue.
    pub async fn sys_poll(
        self: &Arc<Self>,
        process: &Arc<Process>,
        fds: &[(Fd, u32)],
        timeout: Option<u64>,
    ) -> Result<Vec<u32>, Errno> {
        let kq = KQueue::new();

        for (fd, events) in fds {
            if process.handles.lock().get(*fd).is_err() {
                continue; // reported as POLLNVAL below
            }
            if events & POLLIN != 0 {
                if let Ok(note) =
                    kq.register(fd.as_usize(), Filter::Read, KevFlags::EV_ADD, 0)
                {
                    let change = Kevent::add(fd.as_usize(), Filter::Read);
                    let _ = self.attach_note(process, &kq, &note, &change);
                }
            }
            if events & POLLOUT != 0 {
                if let Ok(note) =
                    kq.register(fd.as_usize(), Filter::Write, KevFlags::EV_ADD, 0)
                {
                    let change = Kevent::add(fd.as_usize(), Filter::Write);
                    let _ = self.attach_note(process, &kq, &note, &change);
                }
            }
        }

        if !kq.has_pending() {
            match timeout {
                Some(0) => {}
                Some(ticks) => {
                    let _ = self.timers.timed_wait(&kq.rendez, Some(ticks)).await;
                }
                None => {
                    while !kq.has_pending() {
                        kq.rendez.wait().await;
                    }
                }
            }
        }

        let mut revents = Vec::with_capacity(fds.len());
        for (fd, events) in fds {
            if process.handles.lock().get(*fd).is_err() {
                revents.push(POLLNVAL);
                continue;
            }
            let ready = self.readiness(process, *fd);
            let mut out = 0;
            if events & POLLIN != 0 && ready.contains(PollEvents::POLLIN) {
                out |= POLLIN;
            }
            if events & POLLOUT != 0 && ready.contains(PollEvents::POLLOUT) {
                out |= POLLOUT;
            }
            if ready.contains(PollEvents::POLLHUP) {
                out |= POLLHUP;
            }
            revents.push(out);
        }
        kq.close();
        Ok(revents)
    }
}
