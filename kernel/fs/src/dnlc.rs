//! Directory name lookup cache.
//!
//! Maps `(directory v-node, component name)` to the resolved v-node, or
//! to a negative entry recording "no such name". Capacity-bounded with
//! LRU eviction. Directory-mutating operations invalidate the affected
//! names; a v-node leaving the cache purges every entry it appears in;
//! unmount purges by superblock and pivot_root purges everything.

use alloc::collections::BTreeMap;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cheviot_core::id::{InodeNr, SbId};
use cheviot_core::sync::SpinLock;

use crate::vnode::Vnode;

/// Capacity of the name cache.
pub const NR_DNAME: usize = 64;

type Key = (SbId, InodeNr, String);

struct Entry {
    dir: Arc<Vnode>,
    /// `None` is a negative entry: the name is known absent.
    vnode: Option<Arc<Vnode>>,
}

struct DnlcInner {
    map: BTreeMap<Key, Entry>,
    lru: VecDeque<Key>,
}

/// Result of a name-cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnlcHit<T> {
    /// The name resolves to a v-node.
    Found(T),
    /// The name is cached as absent.
    Negative,
    /// The cache has no answer.
    Miss,
}

/// The directory name lookup cache.
pub struct Dnlc {
    inner: SpinLock<DnlcInner>,
}

impl Dnlc {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(DnlcInner {
                map: BTreeMap::new(),
                lru: VecDeque::new(),
            }),
        }
    }

    fn key(dir: &Arc<Vnode>, name: &str) -> Key {
        let (sb, ino) = dir.key();
        (sb, ino, String::from(name))
    }

    /// Looks `name` up in `dir`.
    pub fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> DnlcHit<Arc<Vnode>> {
        let mut inner = self.inner.lock();
        let key = Self::key(dir, name);
        match inner.map.get(&key) {
            None => DnlcHit::Miss,
            Some(entry) => {
                let hit = match &entry.vnode {
                    Some(vnode) => DnlcHit::Found(vnode.clone()),
                    None => DnlcHit::Negative,
                };
                // Refresh LRU position.
                inner.lru.retain(|k| *k != key);
                inner.lru.push_back(key);
                hit
            }
        }
    }

    /// Records `name` in `dir` resolving to `vnode` (`None` caches the
    /// absence of the name). Evicts the least recently used entry when
    /// full. Names longer than the component limit are not cached.
    pub fn enter(&self, dir: &Arc<Vnode>, name: &str, vnode: Option<Arc<Vnode>>) {
        if name.len() > crate::NAME_MAX {
            return;
        }
        let mut inner = self.inner.lock();
        let key = Self::key(dir, name);
        if inner.map.len() >= NR_DNAME && !inner.map.contains_key(&key) {
            if let Some(victim) = inner.lru.pop_front() {
                inner.map.remove(&victim);
            }
        }
        inner.lru.retain(|k| *k != key);
        inner.lru.push_back(key.clone());
        inner.map.insert(
            key,
            Entry {
                dir: dir.clone(),
                vnode,
            },
        );
    }

    /// Drops the entry for `name` in `dir` (unlink, rename, rmdir).
    pub fn remove(&self, dir: &Arc<Vnode>, name: &str) {
        let mut inner = self.inner.lock();
        let key = Self::key(dir, name);
        inner.map.remove(&key);
        inner.lru.retain(|k| *k != key);
    }

    /// Purges every entry in which `vnode` appears, as directory or as
    /// target.
    pub fn purge_vnode(&self, vnode: &Arc<Vnode>) {
        let mut inner = self.inner.lock();
        let doomed: Vec<Key> = inner
            .map
            .iter()
            .filter(|(_, entry)| {
                entry.dir.same_as(vnode)
                    || entry.vnode.as_ref().is_some_and(|v| v.same_as(vnode))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.map.remove(&key);
            inner.lru.retain(|k| *k != key);
        }
    }

    /// Purges every entry belonging to one superblock (unmount).
    pub fn purge_superblock(&self, sb: SbId) {
        let mut inner = self.inner.lock();
        let doomed: Vec<Key> = inner
            .map
            .iter()
            .filter(|((dir_sb, _, _), entry)| {
                *dir_sb == sb
                    || entry
                        .vnode
                        .as_ref()
                        .is_some_and(|v| v.superblock.id == sb)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.map.remove(&key);
            inner.lru.retain(|k| *k != key);
        }
    }

    /// Empties the cache (pivot_root).
    pub fn purge_all(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.lru.clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }
}

impl Default for Dnlc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount::{MountTable, SbFlags};
    use crate::vnode::VnodeTable;

    fn fixture() -> (VnodeTable, Arc<Vnode>, Arc<Vnode>) {
        let mounts = MountTable::new();
        let sb = mounts.alloc(SbFlags::empty()).unwrap();
        let vnodes = VnodeTable::new();
        let dir = vnodes.create(&sb, InodeNr::new(2)).unwrap();
        let file = vnodes.create(&sb, InodeNr::new(3)).unwrap();
        (vnodes, dir, file)
    }

    #[test]
    fn hit_after_enter() {
        let (_t, dir, file) = fixture();
        let dnlc = Dnlc::new();
        assert!(matches!(dnlc.lookup(&dir, "passwd"), DnlcHit::Miss));

        dnlc.enter(&dir, "passwd", Some(file.clone()));
        match dnlc.lookup(&dir, "passwd") {
            DnlcHit::Found(v) => assert!(v.same_as(&file)),
            _ => panic!("expected a positive hit"),
        }
    }

    #[test]
    fn negative_entries_cache_absence() {
        let (_t, dir, _) = fixture();
        let dnlc = Dnlc::new();
        dnlc.enter(&dir, "missing", None);
        assert!(matches!(dnlc.lookup(&dir, "missing"), DnlcHit::Negative));
    }

    #[test]
    fn remove_invalidates() {
        let (_t, dir, file) = fixture();
        let dnlc = Dnlc::new();
        dnlc.enter(&dir, "a", Some(file));
        dnlc.remove(&dir, "a");
        assert!(matches!(dnlc.lookup(&dir, "a"), DnlcHit::Miss));
    }

    #[test]
    fn purge_vnode_hits_both_roles() {
        let (t, dir, file) = fixture();
        let dnlc = Dnlc::new();
        dnlc.enter(&dir, "as-target", Some(file.clone()));
        dnlc.enter(&file, "as-dir", None);
        let other = t.create(&dir.superblock.clone(), InodeNr::new(9)).unwrap();
        dnlc.enter(&dir, "unrelated", Some(other));

        dnlc.purge_vnode(&file);
        assert!(matches!(dnlc.lookup(&dir, "as-target"), DnlcHit::Miss));
        assert!(matches!(dnlc.lookup(&file, "as-dir"), DnlcHit::Miss));
        assert!(matches!(dnlc.lookup(&dir, "unrelated"), DnlcHit::Found(_)));
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let (t, dir, _) = fixture();
        let dnlc = Dnlc::new();
        for i in 0..NR_DNAME {
            let vn = t
                .create(&dir.superblock.clone(), InodeNr::new(100 + i as i64))
                .unwrap();
            dnlc.enter(&dir, &format!("name{i}"), Some(vn));
        }
        assert_eq!(dnlc.len(), NR_DNAME);

        // Touch name0 so name1 becomes the LRU victim.
        assert!(matches!(dnlc.lookup(&dir, "name0"), DnlcHit::Found(_)));
        let vn = t.create(&dir.superblock.clone(), InodeNr::new(999)).unwrap();
        dnlc.enter(&dir, "newcomer", Some(vn));

        assert!(matches!(dnlc.lookup(&dir, "name0"), DnlcHit::Found(_)));
        assert!(matches!(dnlc.lookup(&dir, "name1"), DnlcHit::Miss), "LRU evicted");
    }

    #[test]
    fn purge_superblock_clears_everything_for_that_fs() {
        let (_t, dir, file) = fixture();
        let dnlc = Dnlc::new();
        dnlc.enter(&dir, "x", Some(file));
        dnlc.purge_superblock(dir.superblock.id);
        assert!(dnlc.is_empty());
    }

    #[test]
    fn oversized_names_not_cached() {
        let (_t, dir, file) = fixture();
        let dnlc = Dnlc::new();
        let long = "n".repeat(crate::NAME_MAX + 1);
        dnlc.enter(&dir, &long, Some(file));
        assert!(dnlc.is_empty());
    }
}
