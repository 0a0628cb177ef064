//! Physical page-frame table.
//!
//! Covers the machine's RAM with reference-counted 4 K frames. Runs of 16
//! contiguous free frames can be claimed as one 64 K frame for mappings
//! that want larger TLB entries (the cache and boot-time kernel ranges).
//! Frame contents live in byte arrays so higher layers can observe memory
//! through the frame table in tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use cheviot_core::Errno;
use cheviot_core::sync::SpinLock;

/// Size of one page frame in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Frames per large (64 K) allocation.
pub const FRAMES_PER_LARGE: usize = 16;

/// Index of a physical page frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(usize);

impl FrameId {
    /// Creates a frame id from a raw index.
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw frame index.
    pub const fn index(self) -> usize {
        self.0
    }
}

struct FrameSlot {
    ref_cnt: usize,
    /// Physical-device frames are shared, never CoW-copied or refcounted.
    phys: bool,
    data: Option<Box<[u8]>>,
}

struct FrameTableInner {
    slots: Vec<FrameSlot>,
    free: Vec<usize>,
}

/// The system-wide page-frame table.
pub struct FrameTable {
    inner: SpinLock<FrameTableInner>,
}

impl FrameTable {
    /// Builds a frame table covering `mem_size` bytes of RAM.
    pub fn new(mem_size: usize) -> Arc<Self> {
        let count = mem_size / PAGE_SIZE;
        let mut slots = Vec::with_capacity(count);
        let mut free = Vec::with_capacity(count);
        for idx in 0..count {
            slots.push(FrameSlot {
                ref_cnt: 0,
                phys: false,
                data: None,
            });
            free.push(idx);
        }
        // Pop order: lowest index first.
        free.reverse();
        Arc::new(Self {
            inner: SpinLock::new(FrameTableInner { slots, free }),
        })
    }

    /// Allocates one zeroed frame with a reference count of one.
    pub fn alloc(&self) -> Result<FrameId, Errno> {
        let mut inner = self.inner.lock();
        let idx = inner.free.pop().ok_or(Errno::ENOMEM)?;
        let slot = &mut inner.slots[idx];
        slot.ref_cnt = 1;
        slot.phys = false;
        slot.data = Some(vec![0u8; PAGE_SIZE].into_boxed_slice());
        Ok(FrameId(idx))
    }

    /// Allocates 16 contiguous frames (one 64 K unit), coalescing a free
    /// run. Returns the first frame.
    pub fn alloc_large(&self) -> Result<FrameId, Errno> {
        let mut inner = self.inner.lock();
        let count = inner.slots.len();
        let mut base = None;
        'scan: for start in (0..count.saturating_sub(FRAMES_PER_LARGE - 1))
            .step_by(FRAMES_PER_LARGE)
        {
            for idx in start..start + FRAMES_PER_LARGE {
                if inner.slots[idx].ref_cnt != 0 {
                    continue 'scan;
                }
            }
            base = Some(start);
            break;
        }
        let base = base.ok_or(Errno::ENOMEM)?;
        for idx in base..base + FRAMES_PER_LARGE {
            let slot = &mut inner.slots[idx];
            slot.ref_cnt = 1;
            slot.phys = false;
            slot.data = Some(vec![0u8; PAGE_SIZE].into_boxed_slice());
            inner.free.retain(|&f| f != idx);
        }
        Ok(FrameId(base))
    }

    /// Marks `count` frames starting at `base` as a shared physical
    /// region (device memory, boot image). Such frames are never
    /// refcounted or freed.
    pub fn claim_phys(&self, count: usize) -> Result<FrameId, Errno> {
        let mut inner = self.inner.lock();
        let total = inner.slots.len();
        let mut base = None;
        'scan: for start in 0..total.saturating_sub(count.saturating_sub(1)) {
            for idx in start..start + count {
                if inner.slots[idx].ref_cnt != 0 {
                    continue 'scan;
                }
            }
            base = Some(start);
            break;
        }
        let base = base.ok_or(Errno::ENOMEM)?;
        for idx in base..base + count {
            let slot = &mut inner.slots[idx];
            slot.ref_cnt = 1;
            slot.phys = true;
            slot.data = Some(vec![0u8; PAGE_SIZE].into_boxed_slice());
            inner.free.retain(|&f| f != idx);
        }
        Ok(FrameId(base))
    }

    /// Increments a frame's reference count (CoW aliasing).
    pub fn incref(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[frame.0];
        if !slot.phys {
            slot.ref_cnt += 1;
        }
    }

    /// Decrements a frame's reference count, freeing it at zero.
    pub fn decref(&self, frame: FrameId) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[frame.0];
        if slot.phys {
            return;
        }
        debug_assert!(slot.ref_cnt > 0, "decref of free frame");
        slot.ref_cnt -= 1;
        if slot.ref_cnt == 0 {
            slot.data = None;
            inner.free.push(frame.0);
        }
    }

    /// Current reference count of a frame.
    pub fn refcount(&self, frame: FrameId) -> usize {
        self.inner.lock().slots[frame.0].ref_cnt
    }

    /// Number of free frames.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Number of whole free 64 K runs available for large mappings.
    pub fn free_large_runs(&self) -> usize {
        let inner = self.inner.lock();
        let count = inner.slots.len();
        let mut runs = 0;
        let mut start = 0;
        while start + FRAMES_PER_LARGE <= count {
            if (start..start + FRAMES_PER_LARGE).all(|i| inner.slots[i].ref_cnt == 0) {
                runs += 1;
            }
            start += FRAMES_PER_LARGE;
        }
        runs
    }

    /// Copies bytes out of a frame.
    pub fn read(&self, frame: FrameId, offset: usize, buf: &mut [u8]) {
        let inner = self.inner.lock();
        let data = inner.slots[frame.0]
            .data
            .as_ref()
            .expect("read of unbacked frame");
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copies bytes into a frame.
    pub fn write(&self, frame: FrameId, offset: usize, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        let data = inner.slots[frame.0]
            .data
            .as_mut()
            .expect("write of unbacked frame");
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Duplicates a frame's contents into a fresh frame (CoW break).
    pub fn duplicate(&self, frame: FrameId) -> Result<FrameId, Errno> {
        let copy = self.alloc()?;
        let mut page = [0u8; PAGE_SIZE];
        self.read(frame, 0, &mut page);
        self.write(copy, 0, &page);
        Ok(copy)
    }
}
