//! The v-node cache.
//!
//! A v-node is the in-memory form of one inode of one mounted file
//! system. The table holds at most `NR_VNODE` of them; v-nodes whose
//! reference count reaches zero are parked on an LRU free list and may be
//! reclaimed for new identities. The busy lock serializes mutating VFS
//! operations per v-node; reference counts keep identities pinned across
//! suspension points.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use cheviot_core::Errno;
use cheviot_core::event::Listeners;
use cheviot_core::id::{InodeNr, SbId};
use cheviot_core::sync::{Mutex, MutexGuard, SpinLock};
use cheviot_ipc::Pipe;

use crate::mount::SuperBlock;
use crate::stat::{Stat, VnodeType};
use crate::wire::WireAttr;

/// Capacity of the v-node cache.
pub const NR_VNODE: usize = 128;

bitflags! {
    /// V-node state flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeFlags: u32 {
        /// Attributes are populated from the server.
        const VALID = 1 << 0;
        /// Root of its mounted file system; never reclaimed.
        const ROOT  = 1 << 1;
    }
}

/// Hint bits passed to v-node listeners.
pub mod hint {
    /// Data or directory contents changed.
    pub const WRITE: u32 = 1 << 0;
    /// An entry was removed.
    pub const DELETE: u32 = 1 << 1;
    /// Attributes changed.
    pub const ATTRIB: u32 = 1 << 2;
    /// Readable (pipe/port data arrived).
    pub const RD: u32 = 1 << 3;
    /// Writable (pipe space available).
    pub const WR: u32 = 1 << 4;
}

struct VnodeState {
    flags: VnodeFlags,
    ref_cnt: usize,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    nlink: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
    covered: Option<Arc<Vnode>>,
    mounted_here: Option<Arc<Vnode>>,
}

/// An in-memory inode.
pub struct Vnode {
    /// The mounted file system this v-node belongs to.
    pub superblock: Arc<SuperBlock>,
    /// Inode number within that file system.
    pub inode_nr: InodeNr,
    state: SpinLock<VnodeState>,
    /// Busy lock: one mutating VFS operation at a time.
    busy: Mutex<()>,
    /// Event listeners (vnode filters, pollers).
    pub listeners: Listeners,
    /// Pipe attached to FIFO v-nodes.
    pub pipe: SpinLock<Option<Arc<Pipe>>>,
}

impl core::fmt::Debug for Vnode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vnode")
            .field("inode_nr", &self.inode_nr)
            .finish_non_exhaustive()
    }
}

impl Vnode {
    fn new(superblock: Arc<SuperBlock>, inode_nr: InodeNr) -> Arc<Self> {
        Arc::new(Self {
            superblock,
            inode_nr,
            state: SpinLock::new(VnodeState {
                flags: VnodeFlags::empty(),
                ref_cnt: 1,
                mode: 0,
                uid: 0,
                gid: 0,
                size: 0,
                nlink: 0,
                atime: 0,
                mtime: 0,
                ctime: 0,
                covered: None,
                mounted_here: None,
            }),
            busy: Mutex::new(()),
            listeners: Listeners::new(),
            pipe: SpinLock::new(None),
        })
    }

    /// Acquires the busy lock.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.busy.lock().await
    }

    /// The cache key of this v-node.
    pub fn key(&self) -> (SbId, InodeNr) {
        (self.superblock.id, self.inode_nr)
    }

    /// True when `other` is the same cached v-node.
    pub fn same_as(self: &Arc<Self>, other: &Arc<Vnode>) -> bool {
        Arc::ptr_eq(self, other)
    }

    /// Current reference count.
    pub fn ref_cnt(&self) -> usize {
        self.state.lock().ref_cnt
    }

    /// State flags.
    pub fn flags(&self) -> VnodeFlags {
        self.state.lock().flags
    }

    /// Sets the given flags.
    pub fn set_flags(&self, flags: VnodeFlags) {
        self.state.lock().flags |= flags;
    }

    /// Mode bits (type + permissions).
    pub fn mode(&self) -> u32 {
        self.state.lock().mode
    }

    /// The v-node's type, from its mode.
    pub fn vnode_type(&self) -> VnodeType {
        VnodeType::from_mode(self.mode())
    }

    /// True for directories.
    pub fn is_dir(&self) -> bool {
        self.vnode_type() == VnodeType::Dir
    }

    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.state.lock().size
    }

    /// Updates the file size (writes extending the file, truncate).
    pub fn set_size(&self, size: u64) {
        self.state.lock().size = size;
    }

    /// Fills attributes from a server reply and marks the v-node valid.
    pub fn init_from_attr(&self, attr: &WireAttr) {
        let mut st = self.state.lock();
        st.mode = attr.mode;
        st.uid = attr.uid;
        st.gid = attr.gid;
        st.size = attr.size;
        st.nlink = if attr.nlink == 0 { 1 } else { attr.nlink };
        st.flags |= VnodeFlags::VALID;
    }

    /// Applies a chmod result.
    pub fn set_mode_bits(&self, mode: u32) {
        let mut st = self.state.lock();
        st.mode = (st.mode & super::stat::S_IFMT) | (mode & !super::stat::S_IFMT);
    }

    /// Applies a chown result.
    pub fn set_owner(&self, uid: u32, gid: u32) {
        let mut st = self.state.lock();
        st.uid = uid;
        st.gid = gid;
    }

    /// Snapshot of the v-node as a `stat` structure.
    pub fn stat(&self) -> Stat {
        let st = self.state.lock();
        Stat {
            st_mode: st.mode,
            st_uid: st.uid,
            st_gid: st.gid,
            st_size: st.size,
            st_ino: self.inode_nr.as_i64(),
            st_nlink: st.nlink,
            st_atime: st.atime,
            st_mtime: st.mtime,
            st_ctime: st.ctime,
        }
    }

    /// The v-node mounted over this one, if it is a mount point.
    pub fn mounted_here(&self) -> Option<Arc<Vnode>> {
        self.state.lock().mounted_here.clone()
    }

    /// The v-node this mount root covers.
    pub fn covered(&self) -> Option<Arc<Vnode>> {
        self.state.lock().covered.clone()
    }

    /// Splices a mount: `self` becomes covered by `root`.
    ///
    /// Both sides of the link are set together under one lock ordering
    /// (covered first), so teardown can nullify both without a window
    /// where only one side dangles.
    pub fn cover_with(self: &Arc<Self>, root: &Arc<Vnode>) {
        self.state.lock().mounted_here = Some(root.clone());
        root.state.lock().covered = Some(self.clone());
    }

    /// Removes a mount splice, clearing both directions.
    pub fn uncover(self: &Arc<Self>) {
        let root = self.state.lock().mounted_here.take();
        if let Some(root) = root {
            root.state.lock().covered = None;
        }
    }
}

struct TableInner {
    map: BTreeMap<(SbId, InodeNr), Arc<Vnode>>,
    /// Zero-reference v-nodes, least recently freed first.
    free: Vec<Arc<Vnode>>,
}

/// The system-wide v-node cache.
pub struct VnodeTable {
    inner: SpinLock<TableInner>,
}

impl VnodeTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(TableInner {
                map: BTreeMap::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Returns the cached v-node for `(sb, ino)`, bumping its reference
    /// count and removing it from the free list.
    pub fn get(&self, sb: SbId, ino: InodeNr) -> Option<Arc<Vnode>> {
        let mut inner = self.inner.lock();
        let vnode = inner.map.get(&(sb, ino)).cloned()?;
        {
            let mut st = vnode.state.lock();
            st.ref_cnt += 1;
            if st.ref_cnt == 1 {
                drop(st);
                let key = vnode.key();
                inner.free.retain(|v| v.key() != key);
            }
        }
        Some(vnode)
    }

    /// Allocates a fresh v-node with one reference, evicting the least
    /// recently freed zero-reference v-node if the table is full.
    ///
    /// The caller initializes attributes (the v-node starts without
    /// `VALID`).
    ///
    /// # Errors
    ///
    /// `ENFILE` when every slot is referenced.
    pub fn create(
        &self,
        superblock: &Arc<SuperBlock>,
        ino: InodeNr,
    ) -> Result<Arc<Vnode>, Errno> {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&(superblock.id, ino)) {
            return Err(Errno::EEXIST);
        }
        if inner.map.len() >= NR_VNODE {
            if inner.free.is_empty() {
                return Err(Errno::ENFILE);
            }
            let victim = inner.free.remove(0);
            inner.map.remove(&victim.key());
        }
        let vnode = Vnode::new(superblock.clone(), ino);
        inner.map.insert((superblock.id, ino), vnode.clone());
        Ok(vnode)
    }

    /// Bumps a reference count.
    pub fn incref(&self, vnode: &Arc<Vnode>) {
        let mut inner = self.inner.lock();
        let mut st = vnode.state.lock();
        st.ref_cnt += 1;
        if st.ref_cnt == 1 {
            drop(st);
            let key = vnode.key();
            inner.free.retain(|v| v.key() != key);
        }
    }

    /// Drops a reference. Returns `true` when the count reached zero and
    /// the v-node was parked on the free list (the caller then purges
    /// name-cache entries and notifies the server).
    ///
    /// Root v-nodes are never parked; their last reference only goes
    /// away at unmount.
    pub fn decref(&self, vnode: &Arc<Vnode>) -> bool {
        let mut inner = self.inner.lock();
        let mut st = vnode.state.lock();
        debug_assert!(st.ref_cnt > 0, "decref of free v-node");
        st.ref_cnt -= 1;
        if st.ref_cnt > 0 {
            return false;
        }
        if st.flags.contains(VnodeFlags::ROOT) {
            return false;
        }
        drop(st);
        inner.free.push(vnode.clone());
        true
    }

    /// Drops a v-node from the table entirely (unmount teardown).
    pub fn discard(&self, vnode: &Arc<Vnode>) {
        let mut inner = self.inner.lock();
        inner.map.remove(&vnode.key());
        let key = vnode.key();
        inner.free.retain(|v| v.key() != key);
    }

    /// Every cached v-node of one superblock (unmount sweep).
    pub fn of_superblock(&self, sb: SbId) -> Vec<Arc<Vnode>> {
        let inner = self.inner.lock();
        inner
            .map
            .range((sb, InodeNr::new(i64::MIN))..=(sb, InodeNr::new(i64::MAX)))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Number of cached v-nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }
}

impl Default for VnodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::MountTable;

    fn test_sb() -> Arc<SuperBlock> {
        MountTable::new().alloc(crate::mount::SbFlags::empty()).unwrap()
    }

    #[test]
    fn create_then_get_bumps_refs() {
        let table = VnodeTable::new();
        let sb = test_sb();
        let vn = table.create(&sb, InodeNr::new(5)).unwrap();
        assert_eq!(vn.ref_cnt(), 1);

        let again = table.get(sb.id, InodeNr::new(5)).unwrap();
        assert!(vn.same_as(&again));
        assert_eq!(vn.ref_cnt(), 2);
    }

    #[test]
    fn duplicate_create_rejected() {
        let table = VnodeTable::new();
        let sb = test_sb();
        table.create(&sb, InodeNr::new(5)).unwrap();
        assert_eq!(
            table.create(&sb, InodeNr::new(5)).unwrap_err(),
            Errno::EEXIST
        );
    }

    #[test]
    fn zero_refs_goes_to_free_list_and_back() {
        let table = VnodeTable::new();
        let sb = test_sb();
        let vn = table.create(&sb, InodeNr::new(5)).unwrap();

        assert!(table.decref(&vn), "reached zero");
        // Still cached: a get revives it from the free list.
        let revived = table.get(sb.id, InodeNr::new(5)).unwrap();
        assert!(vn.same_as(&revived));
        assert_eq!(revived.ref_cnt(), 1);
    }

    #[test]
    fn root_vnodes_never_park() {
        let table = VnodeTable::new();
        let sb = test_sb();
        let vn = table.create(&sb, InodeNr::new(0)).unwrap();
        vn.set_flags(VnodeFlags::ROOT);
        assert!(!table.decref(&vn), "root is pinned");
    }

    #[test]
    fn full_table_evicts_lru_free() {
        let table = VnodeTable::new();
        let sb = test_sb();
        for i in 0..NR_VNODE {
            let vn = table.create(&sb, InodeNr::new(i as i64)).unwrap();
            if i < 2 {
                table.decref(&vn); // first two become reclaimable
            }
        }
        assert_eq!(table.len(), NR_VNODE);

        // Table is full; creating reclaims inode 0 (least recently freed).
        let vn = table.create(&sb, InodeNr::new(1000)).unwrap();
        assert_eq!(vn.inode_nr, InodeNr::new(1000));
        assert!(table.get(sb.id, InodeNr::new(0)).is_none(), "evicted");
        assert!(table.get(sb.id, InodeNr::new(1)).is_some(), "still cached");
    }

    #[test]
    fn enfile_when_everything_referenced() {
        let table = VnodeTable::new();
        let sb = test_sb();
        for i in 0..NR_VNODE {
            table.create(&sb, InodeNr::new(i as i64)).unwrap();
        }
        assert_eq!(
            table.create(&sb, InodeNr::new(9999)).unwrap_err(),
            Errno::ENFILE
        );
    }

    #[test]
    fn cover_links_are_symmetric() {
        let table = VnodeTable::new();
        let sb = test_sb();
        let covered = table.create(&sb, InodeNr::new(3)).unwrap();
        let sb2 = test_sb();
        let root = table.create(&sb2, InodeNr::new(0)).unwrap();

        covered.cover_with(&root);
        assert!(covered.mounted_here().unwrap().same_as(&root));
        assert!(root.covered().unwrap().same_as(&covered));

        covered.uncover();
        assert!(covered.mounted_here().is_none());
        assert!(root.covered().is_none());
    }

    #[test]
    fn stat_reflects_attrs() {
        let table = VnodeTable::new();
        let sb = test_sb();
        let vn = table.create(&sb, InodeNr::new(9)).unwrap();
        vn.init_from_attr(&WireAttr {
            inode_nr: 9,
            size: 321,
            mode: crate::stat::S_IFREG | 0o644,
            uid: 10,
            gid: 20,
            nlink: 2,
        });

        let stat = vn.stat();
        assert_eq!(stat.st_size, 321);
        assert_eq!(stat.st_ino, 9);
        assert_eq!(stat.st_nlink, 2);
        assert_eq!(vn.vnode_type(), VnodeType::Reg);
        assert!(vn.flags().contains(VnodeFlags::VALID));
    }
}
