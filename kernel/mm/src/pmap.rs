//! The machine-dependent mapping layer, behind a trait.
//!
//! Real hardware would walk page tables here; [`SoftPmap`] keeps a sorted
//! map of page-aligned virtual addresses to PTEs. The address-space
//! manager above is machine-independent either way.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::frame::FrameId;

bitflags! {
    /// Access protections for a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        /// Readable.
        const READ  = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC  = 1 << 2;
    }
}

bitflags! {
    /// Per-PTE flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Readable.
        const READ  = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXEC  = 1 << 2;
        /// Copy-on-write: write faults duplicate the frame.
        const COW   = 1 << 3;
        /// Physical/device mapping: shared, never refcounted.
        const PHYS  = 1 << 4;
    }
}

impl PteFlags {
    /// The protection bits of these flags.
    pub fn prot(self) -> Prot {
        Prot::from_bits_truncate(self.bits() & 0b111)
    }

    /// Builds flags from protection bits.
    pub fn from_prot(prot: Prot) -> Self {
        Self::from_bits_truncate(prot.bits())
    }
}

/// One page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    /// The mapped frame.
    pub frame: FrameId,
    /// Access and bookkeeping flags.
    pub flags: PteFlags,
}

/// Machine-dependent page-table operations.
pub trait Pmap {
    /// Creates an empty pmap.
    fn new() -> Self;

    /// Installs or replaces the PTE for `va` (page-aligned).
    fn enter(&mut self, va: u64, pte: Pte);

    /// Removes the PTE for `va`, returning it.
    fn remove(&mut self, va: u64) -> Option<Pte>;

    /// Returns the PTE for `va`.
    fn extract(&self, va: u64) -> Option<Pte>;

    /// Rewrites the flags of an existing PTE. No-op when unmapped.
    fn reflag(&mut self, va: u64, flags: PteFlags);

    /// All present mappings, in address order.
    fn mappings(&self) -> Vec<(u64, Pte)>;
}

/// Software pmap: a sorted address map standing in for hardware tables.
pub struct SoftPmap {
    entries: BTreeMap<u64, Pte>,
}

impl Pmap for SoftPmap {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    fn enter(&mut self, va: u64, pte: Pte) {
        self.entries.insert(va, pte);
    }

    fn remove(&mut self, va: u64) -> Option<Pte> {
        self.entries.remove(&va)
    }

    fn extract(&self, va: u64) -> Option<Pte> {
        self.entries.get(&va).copied()
    }

    fn reflag(&mut self, va: u64, flags: PteFlags) {
        if let Some(pte) = self.entries.get_mut(&va) {
            pte.flags = flags;
        }
    }

    fn mappings(&self) -> Vec<(u64, Pte)> {
        self.entries.iter().map(|(&va, &pte)| (va, pte)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_extract_remove() {
        let mut pmap = SoftPmap::new();
        let pte = Pte {
            frame: FrameId::new(3),
            flags: PteFlags::READ | PteFlags::WRITE,
        };
        pmap.enter(0x1000, pte);
        assert_eq!(pmap.extract(0x1000), Some(pte));
        assert_eq!(pmap.remove(0x1000), Some(pte));
        assert_eq!(pmap.extract(0x1000), None);
    }

    #[test]
    fn reflag_rewrites_flags() {
        let mut pmap = SoftPmap::new();
        pmap.enter(
            0x2000,
            Pte {
                frame: FrameId::new(1),
                flags: PteFlags::READ | PteFlags::WRITE,
            },
        );
        pmap.reflag(0x2000, PteFlags::READ | PteFlags::COW);
        let pte = pmap.extract(0x2000).unwrap();
        assert!(pte.flags.contains(PteFlags::COW));
        assert!(!pte.flags.contains(PteFlags::WRITE));
    }

    #[test]
    fn prot_projection() {
        let flags = PteFlags::READ | PteFlags::COW | PteFlags::PHYS;
        assert_eq!(flags.prot(), Prot::READ);
    }
}
