//! The virtual file system core.
//!
//! Everything between the syscall layer and the out-of-process servers:
//! the v-node cache and its lock/ref discipline, the directory name
//! lookup cache, the component-wise path resolver with mount traversal,
//! the per-file block cache with delayed-write flushing, and the
//! `fsreq`/`fsreply` wire protocol those servers speak.
//!
//! All VFS state hangs off [`FsCore`], which the kernel context owns and
//! threads through every subsystem.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cache;
pub mod dnlc;
pub mod ifs;
pub mod lookup;
pub mod mount;
pub mod stat;
pub mod vfsops;
pub mod vnode;
pub mod wire;

use alloc::sync::Arc;

use cheviot_core::sync::SpinLock;
use cheviot_sched::Timers;

pub use cache::{Buf, BufFlags, CLUSTER_SZ};
pub use lookup::{Lookup, LookupFlags, LookupStart};
pub use mount::{SbFlags, SuperBlock};
pub use stat::{Stat, VnodeType};
pub use vnode::{Vnode, VnodeFlags};
pub use wire::{FsReply, FsReq};

/// Maximum path length accepted by the resolver.
pub const PATH_MAX: usize = 1024;

/// Maximum length of one path component (and of a DNLC name).
pub const NAME_MAX: usize = 64;

/// Symlink expansions allowed in one resolution.
pub const MAX_SYMLINK: usize = 32;

/// The VFS state: every cache and table the file system layer owns.
///
/// One instance per kernel, embedded in the kernel context so tests can
/// build a whole VFS with nothing global.
pub struct FsCore {
    /// The v-node cache.
    pub vnodes: vnode::VnodeTable,
    /// The directory name lookup cache.
    pub dnlc: dnlc::Dnlc,
    /// The per-file block cache.
    pub cache: cache::BufCache,
    /// Mounted file systems.
    pub mounts: mount::MountTable,
    /// The system root v-node (covered by the root mount).
    pub root_vnode: SpinLock<Option<Arc<Vnode>>>,
    /// Clock and timing wheel, shared with the scheduler.
    pub timers: Arc<Timers>,
}

impl FsCore {
    /// Creates an empty VFS.
    pub fn new(timers: Arc<Timers>) -> Arc<Self> {
        Arc::new(Self {
            vnodes: vnode::VnodeTable::new(),
            dnlc: dnlc::Dnlc::new(),
            cache: cache::BufCache::new(),
            mounts: mount::MountTable::new(),
            root_vnode: SpinLock::new(None),
            timers,
        })
    }

    /// Returns the current root v-node.
    ///
    /// # Errors
    ///
    /// `ENOENT` before the root file system is mounted.
    pub fn root(&self) -> Result<Arc<Vnode>, cheviot_core::Errno> {
        self.root_vnode
            .lock()
            .clone()
            .ok_or(cheviot_core::Errno::ENOENT)
    }
}
