//! Event listener lists.
//!
//! Observable kernel objects (message ports, v-nodes, IRQ sources) carry a
//! [`Listeners`] list; interested parties (event filters, pollers) attach
//! callbacks and the object fires them with a hint describing what
//! changed. This is the attachment point the kqueue layer builds on.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::sync::SpinLock;

/// Identifier of one attached listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Callback = Arc<dyn Fn(u32) + Send + Sync>;

/// A list of callbacks fired when an object's state changes.
pub struct Listeners {
    callbacks: SpinLock<Vec<(ListenerId, Callback)>>,
    next_id: AtomicU64,
}

impl Listeners {
    /// Creates an empty listener list.
    pub const fn new() -> Self {
        Self {
            callbacks: SpinLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Attaches a callback; it runs on every subsequent [`fire`](Self::fire).
    pub fn add(&self, callback: impl Fn(u32) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, Arc::new(callback)));
        id
    }

    /// Detaches a callback.
    pub fn remove(&self, id: ListenerId) {
        self.callbacks.lock().retain(|(lid, _)| *lid != id);
    }

    /// Fires every listener with `hint`.
    ///
    /// Callbacks run outside the internal lock, so a listener may attach
    /// or detach others (including itself).
    pub fn fire(&self, hint: u32) {
        let snapshot: Vec<Callback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for cb in snapshot {
            cb(hint);
        }
    }

    /// Number of attached listeners.
    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.callbacks.lock().is_empty()
    }
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new()
    }
}
