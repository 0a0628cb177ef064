//! Kernel event queues (kqueue / knote).
//!
//! A [`KQueue`] holds registered [`KNote`]s, one per `(ident, filter)`
//! pair, plus a FIFO of notes whose objects signalled a change. Objects
//! raise notes through the listener attached at `EV_ADD` time; delivery
//! order is pending-FIFO order. A note for an object that is already
//! ready at registration is raised immediately, closing the lost-wakeup
//! window between registering interest and the event arriving.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;

use cheviot_core::Errno;
use cheviot_core::sync::{Mutex, Rendez, SpinLock};

bitflags! {
    /// Kevent action and state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KevFlags: u32 {
        /// Register the event.
        const EV_ADD     = 1 << 0;
        /// Remove the event.
        const EV_DELETE  = 1 << 1;
        /// Enable delivery.
        const EV_ENABLE  = 1 << 2;
        /// Keep registered but suppress delivery.
        const EV_DISABLE = 1 << 3;
        /// Remove after first delivery.
        const EV_ONESHOT = 1 << 4;
    }
}

/// Event filter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Readable data available.
    Read,
    /// Writable space available.
    Write,
    /// V-node changed (write, delete, attributes).
    Vnode,
    /// A message arrived on a port.
    MsgPort,
    /// An interrupt was raised.
    Irq,
    /// A user timer fired.
    Timer,
    /// Explicitly triggered by user code.
    User,
}

/// One entry of a kevent changelist or eventlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Kevent {
    /// Object identifier (usually a descriptor).
    pub ident: usize,
    /// Which aspect of the object to watch.
    pub filter: Filter,
    /// Action / state flags.
    pub flags: KevFlags,
    /// Filter-specific flags (the raising hint on delivery).
    pub fflags: u32,
    /// Filter-specific data (timer period, byte counts).
    pub data: i64,
    /// Opaque user data returned on delivery.
    pub udata: u64,
}

impl Kevent {
    /// A changelist entry registering `(ident, filter)`.
    pub fn add(ident: usize, filter: Filter) -> Self {
        Self {
            ident,
            filter,
            flags: KevFlags::EV_ADD | KevFlags::EV_ENABLE,
            fflags: 0,
            data: 0,
            udata: 0,
        }
    }

    /// A changelist entry removing `(ident, filter)`.
    pub fn delete(ident: usize, filter: Filter) -> Self {
        Self {
            ident,
            filter,
            flags: KevFlags::EV_DELETE,
            fflags: 0,
            data: 0,
            udata: 0,
        }
    }
}

/// A registered interest in one object event.
pub struct KNote {
    /// Object identifier.
    pub ident: usize,
    /// Watched aspect.
    pub filter: Filter,
    /// State flags.
    pub flags: SpinLock<KevFlags>,
    /// Last raising hint.
    pub hint: SpinLock<u32>,
    /// Opaque user data.
    pub udata: u64,
    on_pending: SpinLock<bool>,
    detach: SpinLock<Option<Box<dyn FnOnce() + Send>>>,
}

impl core::fmt::Debug for KNote {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KNote")
            .field("ident", &self.ident)
            .field("filter", &self.filter)
            .field("udata", &self.udata)
            .finish_non_exhaustive()
    }
}

impl KNote {
    fn new(ident: usize, filter: Filter, flags: KevFlags, udata: u64) -> Arc<Self> {
        Arc::new(Self {
            ident,
            filter,
            flags: SpinLock::new(flags),
            hint: SpinLock::new(0),
            udata,
            on_pending: SpinLock::new(false),
            detach: SpinLock::new(None),
        })
    }

    /// Installs the object-side detach action (listener removal).
    pub fn set_detach(&self, detach: Box<dyn FnOnce() + Send>) {
        *self.detach.lock() = Some(detach);
    }

    fn run_detach(&self) {
        if let Some(detach) = self.detach.lock().take() {
            detach();
        }
    }
}

/// An event queue.
pub struct KQueue {
    notes: SpinLock<Vec<Arc<KNote>>>,
    pending: SpinLock<VecDeque<Arc<KNote>>>,
    /// Woken when a note lands on the pending FIFO.
    pub rendez: Rendez,
    /// One kevent call at a time per queue.
    pub busy: Mutex<()>,
}

impl KQueue {
    /// Creates an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notes: SpinLock::new(Vec::new()),
            pending: SpinLock::new(VecDeque::new()),
            rendez: Rendez::new(),
            busy: Mutex::new(()),
        })
    }

    /// The note registered for `(ident, filter)`.
    pub fn find(&self, ident: usize, filter: Filter) -> Option<Arc<KNote>> {
        self.notes
            .lock()
            .iter()
            .find(|n| n.ident == ident && n.filter == filter)
            .cloned()
    }

    /// Registers a note.
    ///
    /// # Errors
    ///
    /// `EEXIST` if `(ident, filter)` is already registered.
    pub fn register(
        self: &Arc<Self>,
        ident: usize,
        filter: Filter,
        flags: KevFlags,
        udata: u64,
    ) -> Result<Arc<KNote>, Errno> {
        let mut notes = self.notes.lock();
        if notes.iter().any(|n| n.ident == ident && n.filter == filter) {
            return Err(Errno::EEXIST);
        }
        let note = KNote::new(ident, filter, flags | KevFlags::EV_ENABLE, udata);
        notes.push(note.clone());
        Ok(note)
    }

    /// Unregisters a note, running its detach action.
    pub fn unregister(&self, note: &Arc<KNote>) {
        self.notes.lock().retain(|n| !Arc::ptr_eq(n, note));
        self.pending.lock().retain(|n| !Arc::ptr_eq(n, note));
        *note.on_pending.lock() = false;
        note.run_detach();
    }

    /// Raises a note: records the hint and appends it to the pending
    /// FIFO unless disabled or already queued.
    pub fn activate(&self, note: &Arc<KNote>, hint: u32) {
        *note.hint.lock() = hint;
        if note.flags.lock().contains(KevFlags::EV_DISABLE) {
            return;
        }
        {
            let mut on_pending = note.on_pending.lock();
            if *on_pending {
                return;
            }
            *on_pending = true;
        }
        self.pending.lock().push_back(note.clone());
        self.rendez.wakeup_all();
    }

    /// Builds the activation closure handed to an object's listener
    /// list: a weak self-reference so a dead queue silently drops
    /// events.
    pub fn activation_hook(self: &Arc<Self>, note: &Arc<KNote>) -> impl Fn(u32) + Send + Sync + use<> {
        let kq: Weak<KQueue> = Arc::downgrade(self);
        let note = note.clone();
        move |hint| {
            if let Some(kq) = kq.upgrade() {
                kq.activate(&note, hint);
            }
        }
    }

    /// True when a delivery is waiting.
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Pops up to `max` pending notes in FIFO order, converting them to
    /// events. One-shot notes are unregistered after conversion.
    pub fn drain_pending(&self, max: usize) -> Vec<Kevent> {
        let mut events = Vec::new();
        while events.len() < max {
            let Some(note) = self.pending.lock().pop_front() else {
                break;
            };
            *note.on_pending.lock() = false;
            events.push(Kevent {
                ident: note.ident,
                filter: note.filter,
                flags: *note.flags.lock(),
                fflags: *note.hint.lock(),
                data: 0,
                udata: note.udata,
            });
            if note.flags.lock().contains(KevFlags::EV_ONESHOT) {
                self.unregister(&note);
            }
        }
        events
    }

    /// Detaches every note (queue close).
    pub fn close(&self) {
        let notes: Vec<Arc<KNote>> = self.notes.lock().drain(..).collect();
        self.pending.lock().clear();
        for note in notes {
            note.run_detach();
        }
    }

    /// Number of registered notes.
    pub fn note_count(&self) -> usize {
        self.notes.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_activate_drain() {
        let kq = KQueue::new();
        let note = kq
            .register(5, Filter::MsgPort, KevFlags::EV_ADD, 99)
            .unwrap();

        kq.activate(&note, 7);
        assert!(kq.has_pending());

        let events = kq.drain_pending(8);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].ident, 5);
        assert_eq!(events[0].fflags, 7);
        assert_eq!(events[0].udata, 99);
        assert!(!kq.has_pending());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let kq = KQueue::new();
        kq.register(1, Filter::Read, KevFlags::EV_ADD, 0).unwrap();
        assert_eq!(
            kq.register(1, Filter::Read, KevFlags::EV_ADD, 0).unwrap_err(),
            Errno::EEXIST
        );
        // Same ident, different filter is a distinct note.
        kq.register(1, Filter::Write, KevFlags::EV_ADD, 0).unwrap();
    }

    #[test]
    fn double_activate_queues_once() {
        let kq = KQueue::new();
        let note = kq.register(1, Filter::Read, KevFlags::EV_ADD, 0).unwrap();
        kq.activate(&note, 1);
        kq.activate(&note, 2);

        let events = kq.drain_pending(8);
        assert_eq!(events.len(), 1, "coalesced while pending");
        assert_eq!(events[0].fflags, 2, "latest hint wins");
    }

    #[test]
    fn delivery_is_fifo() {
        let kq = KQueue::new();
        let a = kq.register(1, Filter::Read, KevFlags::EV_ADD, 0).unwrap();
        let b = kq.register(2, Filter::Read, KevFlags::EV_ADD, 0).unwrap();
        kq.activate(&b, 0);
        kq.activate(&a, 0);

        let events = kq.drain_pending(8);
        assert_eq!(events[0].ident, 2, "first raised, first delivered");
        assert_eq!(events[1].ident, 1);
    }

    #[test]
    fn disabled_notes_do_not_deliver() {
        let kq = KQueue::new();
        let note = kq.register(1, Filter::Read, KevFlags::EV_ADD, 0).unwrap();
        note.flags.lock().insert(KevFlags::EV_DISABLE);
        kq.activate(&note, 0);
        assert!(!kq.has_pending());
    }

    #[test]
    fn oneshot_unregisters_after_delivery() {
        let kq = KQueue::new();
        let note = kq
            .register(1, Filter::Timer, KevFlags::EV_ADD | KevFlags::EV_ONESHOT, 0)
            .unwrap();
        kq.activate(&note, 0);
        let events = kq.drain_pending(8);
        assert_eq!(events.len(), 1);
        assert_eq!(kq.note_count(), 0, "one-shot note freed");
    }

    #[test]
    fn activation_hook_survives_queue_drop() {
        let kq = KQueue::new();
        let note = kq.register(1, Filter::Irq, KevFlags::EV_ADD, 0).unwrap();
        let hook = kq.activation_hook(&note);
        drop(kq);
        hook(3); // must not panic
    }
}
