//! Memory management: the page-frame table and per-process address spaces.
//!
//! The machine-dependent page-table layer sits behind the [`Pmap`] trait;
//! [`SoftPmap`] is the in-repo implementation, backing mappings with
//! plain byte arrays so copy-on-write fork and fault handling are
//! observable in host tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr_space;
pub mod frame;
pub mod pmap;

pub use addr_space::{Access, AddressSpace, SegKind};
pub use frame::{FrameId, FrameTable, PAGE_SIZE};
pub use pmap::{Pmap, Prot, PteFlags, SoftPmap};

/// An address space over the in-repo soft pmap.
pub type SoftAddressSpace = addr_space::AddressSpace<pmap::SoftPmap>;
