//! The per-file block cache.
//!
//! Caches fixed-size clusters of file data keyed by `(vnode, offset)`,
//! following the classic getblk/bread/bwrite/brelse discipline. Clusters
//! are the unit of transfer to servers; reads and writes at byte
//! granularity walk clusters through [`FsCore::read_from_cache`] and
//! [`FsCore::write_to_cache`].
//!
//! Dirty clusters park on their superblock's delayed-write timing wheel:
//! `bawrite` schedules at the current softclock (flush soon), `bdwrite`
//! after [`DELWRI_DELAY_TICKS`] (the file is likely still growing). The
//! per-superblock flusher task sweeps the wheel bucket by bucket, bounded
//! each pass by the superblock's strategy-message budget.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;

use cheviot_core::{Errno, kerr};
use cheviot_core::id::{InodeNr, Pid, SbId};
use cheviot_core::sync::{Rendez, SpinLock};
use cheviot_sched::JIFFIES_PER_SECOND;

use crate::FsCore;
use crate::mount::SuperBlock;
use crate::vnode::Vnode;

/// Cluster size: the unit of caching and server transfer.
pub const CLUSTER_SZ: usize = 0x10000;

/// Number of cache blocks.
pub const NR_BUF: usize = 64;

/// Buckets in each superblock's delayed-write wheel.
pub const NR_DELWRI_BUCKETS: usize = 64;

/// Delay before a `bdwrite` cluster is flushed.
pub const DELWRI_DELAY_TICKS: u64 = 5 * JIFFIES_PER_SECOND;

/// Strategy messages one flusher pass may have outstanding.
pub const NR_DELWRIMSG_PER_SB: usize = 8;

/// Flusher wakeup interval in jiffies.
pub const BDFLUSH_WAKEUP_INTERVAL_TICKS: u64 = JIFFIES_PER_SECOND / 2;

bitflags! {
    /// Cache block flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u32 {
        /// Contents mirror the file.
        const VALID   = 1 << 0;
        /// Claimed by an operation.
        const BUSY    = 1 << 1;
        /// Strategy read in progress.
        const READ    = 1 << 2;
        /// Strategy write in progress or scheduled.
        const WRITE   = 1 << 3;
        /// Scheduled for asynchronous write-back.
        const ASYNC   = 1 << 4;
        /// Scheduled for delayed write-back.
        const DELWRI  = 1 << 5;
        /// Strategy transfer failed.
        const ERROR   = 1 << 6;
        /// Invalidate on release (truncation, abort).
        const DISCARD = 1 << 7;
        /// Strategy transfer completed.
        const IODONE  = 1 << 8;
    }
}

struct BufState {
    flags: BufFlags,
    vnode: Option<Arc<Vnode>>,
    cluster_offset: u64,
    expiration: u64,
    data: Vec<u8>,
}

/// One cache block: at most one cluster of one file.
pub struct Buf {
    state: SpinLock<BufState>,
    /// Woken when the block stops being busy.
    pub rendez: Rendez,
}

impl Buf {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: SpinLock::new(BufState {
                flags: BufFlags::empty(),
                vnode: None,
                cluster_offset: 0,
                expiration: 0,
                data: Vec::new(),
            }),
            rendez: Rendez::new(),
        })
    }

    /// Current flags.
    pub fn flags(&self) -> BufFlags {
        self.state.lock().flags
    }

    /// The `(superblock, inode, cluster)` key, if the block has an
    /// identity.
    pub fn key(&self) -> Option<(SbId, InodeNr, u64)> {
        let st = self.state.lock();
        st.vnode
            .as_ref()
            .map(|v| (v.superblock.id, v.inode_nr, st.cluster_offset))
    }

    /// The owning v-node.
    pub fn vnode(&self) -> Option<Arc<Vnode>> {
        self.state.lock().vnode.clone()
    }

    /// Cluster offset within the file.
    pub fn cluster_offset(&self) -> u64 {
        self.state.lock().cluster_offset
    }

    /// Copies bytes out of the cluster.
    pub fn read_at(&self, offset: usize, out: &mut [u8]) {
        let st = self.state.lock();
        out.copy_from_slice(&st.data[offset..offset + out.len()]);
    }

    /// Copies bytes into the cluster.
    pub fn write_at(&self, offset: usize, data: &[u8]) {
        let mut st = self.state.lock();
        st.data[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Zero-fills a range of the cluster.
    pub fn zero_range(&self, from: usize, to: usize) {
        let mut st = self.state.lock();
        for b in &mut st.data[from..to] {
            *b = 0;
        }
    }

    fn set_flags(&self, set: BufFlags, clear: BufFlags) {
        let mut st = self.state.lock();
        st.flags.insert(set);
        st.flags.remove(clear);
    }
}

// ── delayed-write wheel ─────────────────────────────────────────────

struct DelwriInner {
    softclock: u64,
    buckets: Vec<Vec<Arc<Buf>>>,
}

/// A superblock's delayed-write timing wheel, hashed by expiration tick.
pub struct DelwriQueue {
    inner: SpinLock<DelwriInner>,
}

impl DelwriQueue {
    /// Creates an empty wheel.
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(NR_DELWRI_BUCKETS);
        for _ in 0..NR_DELWRI_BUCKETS {
            buckets.push(Vec::new());
        }
        Self {
            inner: SpinLock::new(DelwriInner {
                softclock: 0,
                buckets,
            }),
        }
    }

    /// The wheel's current softclock tick.
    pub fn softclock(&self) -> u64 {
        self.inner.lock().softclock
    }

    fn insert(&self, buf: Arc<Buf>, expiration: u64) {
        let mut inner = self.inner.lock();
        let bucket = (expiration as usize) % NR_DELWRI_BUCKETS;
        inner.buckets[bucket].push(buf);
    }

    fn remove(&self, buf: &Arc<Buf>) -> bool {
        let mut inner = self.inner.lock();
        for bucket in inner.buckets.iter_mut() {
            if let Some(pos) = bucket.iter().position(|b| Arc::ptr_eq(b, buf)) {
                bucket.remove(pos);
                return true;
            }
        }
        false
    }

    /// Takes one block from the current bucket whose expiration has
    /// passed.
    fn take_expired(&self) -> Option<Arc<Buf>> {
        let mut inner = self.inner.lock();
        let softclock = inner.softclock;
        let bucket = (softclock as usize) % NR_DELWRI_BUCKETS;
        let pos = inner.buckets[bucket]
            .iter()
            .position(|b| b.state.lock().expiration <= softclock)?;
        Some(inner.buckets[bucket].remove(pos))
    }

    fn advance(&self) {
        self.inner.lock().softclock += 1;
    }

    /// Every block currently parked on the wheel.
    pub fn all(&self) -> Vec<Arc<Buf>> {
        let inner = self.inner.lock();
        inner.buckets.iter().flatten().cloned().collect()
    }

    /// Number of blocks awaiting write-back.
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock();
        inner.buckets.iter().map(Vec::len).sum()
    }
}

impl Default for DelwriQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ── the cache proper ────────────────────────────────────────────────

struct CacheInner {
    hash: BTreeMap<(SbId, InodeNr, u64), Arc<Buf>>,
    /// Clean unlocked blocks, least recently released first.
    free: VecDeque<Arc<Buf>>,
}

/// The system-wide block cache.
pub struct BufCache {
    inner: SpinLock<CacheInner>,
    /// Woken when a block returns to the free list.
    pub free_rendez: Rendez,
}

impl BufCache {
    /// Creates the cache with [`NR_BUF`] empty blocks.
    pub fn new() -> Self {
        let mut free = VecDeque::with_capacity(NR_BUF);
        for _ in 0..NR_BUF {
            free.push_back(Buf::new());
        }
        Self {
            inner: SpinLock::new(CacheInner {
                hash: BTreeMap::new(),
                free,
            }),
            free_rendez: Rendez::new(),
        }
    }

    fn key_of(vnode: &Arc<Vnode>, cluster_offset: u64) -> (SbId, InodeNr, u64) {
        (vnode.superblock.id, vnode.inode_nr, cluster_offset)
    }

    /// Looks a cluster up without claiming it.
    pub fn findblk(&self, vnode: &Arc<Vnode>, cluster_offset: u64) -> Option<Arc<Buf>> {
        self.inner
            .lock()
            .hash
            .get(&Self::key_of(vnode, cluster_offset))
            .cloned()
    }

    fn take_from_free(&self, buf: &Arc<Buf>) {
        let mut inner = self.inner.lock();
        inner.free.retain(|b| !Arc::ptr_eq(b, buf));
    }

    /// Releases a claimed block.
    ///
    /// Error or discard releases invalidate the block and put it at the
    /// head of the free list. A still-dirty block (claimed off the
    /// delayed-write wheel and released without a new write call) goes
    /// back on the wheel. Clean releases go to the free-list tail,
    /// leaving the block discoverable in the hash for the next hit.
    pub fn brelse(&self, buf: &Arc<Buf>) {
        let mut inner = self.inner.lock();
        let mut st = buf.state.lock();
        if st.flags.intersects(BufFlags::ERROR | BufFlags::DISCARD) {
            if let Some(vnode) = st.vnode.take() {
                inner
                    .hash
                    .remove(&(vnode.superblock.id, vnode.inode_nr, st.cluster_offset));
            }
            st.flags.remove(
                BufFlags::VALID
                    | BufFlags::ERROR
                    | BufFlags::DISCARD
                    | BufFlags::DELWRI
                    | BufFlags::ASYNC
                    | BufFlags::WRITE,
            );
            st.data = Vec::new();
            st.flags.remove(BufFlags::BUSY);
            drop(st);
            inner.free.push_front(buf.clone());
        } else if st.flags.intersects(BufFlags::DELWRI | BufFlags::ASYNC) {
            let expiration = st.expiration;
            let vnode = st.vnode.clone();
            st.flags.remove(BufFlags::BUSY);
            drop(st);
            drop(inner);
            if let Some(vnode) = vnode {
                vnode.superblock.delwri.insert(buf.clone(), expiration);
            }
            self.free_rendez.wakeup_all();
            buf.rendez.wakeup_all();
            return;
        } else {
            st.flags.remove(BufFlags::BUSY);
            drop(st);
            inner.free.push_back(buf.clone());
        }
        drop(inner);
        self.free_rendez.wakeup_all();
        buf.rendez.wakeup_all();
    }

    /// Invalidates every block of `vnode` at or past `new_size`
    /// (truncation), and zeroes the tail of a now-partial last cluster.
    pub fn truncate(&self, vnode: &Arc<Vnode>, new_size: u64) {
        let inner = self.inner.lock();
        let doomed: Vec<Arc<Buf>> = inner
            .hash
            .range(
                (vnode.superblock.id, vnode.inode_nr, 0)
                    ..=(vnode.superblock.id, vnode.inode_nr, u64::MAX),
            )
            .map(|(_, b)| b.clone())
            .collect();
        drop(inner);

        for buf in doomed {
            let st = buf.state.lock();
            let cluster_offset = st.cluster_offset;
            let busy = st.flags.contains(BufFlags::BUSY);
            drop(st);

            if cluster_offset >= new_size {
                buf.set_flags(BufFlags::DISCARD, BufFlags::empty());
                if let Some(vn) = buf.vnode() {
                    vn.superblock.delwri.remove(&buf);
                }
                if !busy {
                    self.take_from_free(&buf);
                    buf.set_flags(BufFlags::BUSY, BufFlags::empty());
                    self.brelse(&buf);
                }
            } else if cluster_offset + CLUSTER_SZ as u64 > new_size {
                let from = (new_size - cluster_offset) as usize;
                let st = buf.state.lock();
                let len = st.data.len();
                drop(st);
                if from < len {
                    buf.zero_range(from, len);
                }
            }
        }
    }

    /// Invalidates every block belonging to one superblock (abort,
    /// unmount). Dirty data is discarded.
    pub fn discard_superblock(&self, sb: SbId) {
        let inner = self.inner.lock();
        let doomed: Vec<Arc<Buf>> = inner
            .hash
            .values()
            .filter(|b| {
                b.vnode()
                    .map(|v| v.superblock.id == sb)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        drop(inner);

        for buf in doomed {
            if let Some(vn) = buf.vnode() {
                vn.superblock.delwri.remove(&buf);
            }
            buf.set_flags(BufFlags::DISCARD, BufFlags::DELWRI | BufFlags::ASYNC);
            if !buf.flags().contains(BufFlags::BUSY) {
                self.take_from_free(&buf);
                buf.set_flags(BufFlags::BUSY, BufFlags::empty());
                self.brelse(&buf);
            }
        }
    }

    /// Number of blocks on the free list.
    pub fn free_count(&self) -> usize {
        self.inner.lock().free.len()
    }
}

impl Default for BufCache {
    fn default() -> Self {
        Self::new()
    }
}

impl FsCore {
    /// Claims the cache block for `(vnode, cluster_offset)`.
    ///
    /// A hash hit sleeps while the block is busy, then claims it, taking
    /// it off the free list, and off the delayed-write wheel if a flush
    /// was pending for this cluster. A miss recycles the least recently
    /// used free block: a stale delayed write on the victim is drained
    /// first, its old identity is unhashed, and fresh zeroed pages back
    /// the new cluster.
    pub async fn getblk(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        cluster_offset: u64,
    ) -> Result<Arc<Buf>, Errno> {
        let key = BufCache::key_of(vnode, cluster_offset);
        loop {
            let found = self.cache.inner.lock().hash.get(&key).cloned();
            if let Some(buf) = found {
                {
                    let mut st = buf.state.lock();
                    if st.flags.contains(BufFlags::BUSY) {
                        drop(st);
                        buf.rendez.wait().await;
                        continue;
                    }
                    st.flags.insert(BufFlags::BUSY);
                    if st.flags.intersects(BufFlags::DELWRI | BufFlags::ASYNC) {
                        // Claim the pending flush along with the block;
                        // the dirty flags stay set so a plain release
                        // re-schedules it instead of dropping the data.
                        drop(st);
                        vnode.superblock.delwri.remove(&buf);
                    }
                }
                self.cache.take_from_free(&buf);
                return Ok(buf);
            }

            // Miss: recycle the LRU free block.
            let victim = {
                let mut inner = self.cache.inner.lock();
                inner.free.pop_front()
            };
            let Some(buf) = victim else {
                self.cache.free_rendez.wait().await;
                continue;
            };

            {
                let mut st = buf.state.lock();
                st.flags.insert(BufFlags::BUSY);
            }

            // A victim still carrying a delayed write for its old cluster
            // is drained before reuse. The drain suspends, so the hash
            // must be re-checked afterwards: another claimant may have
            // installed our key meanwhile.
            if buf.flags().contains(BufFlags::DELWRI) {
                if let Some(old_vnode) = buf.vnode() {
                    old_vnode.superblock.delwri.remove(&buf);
                    if let Err(e) = self.flush_buf(pid, &buf).await {
                        kerr!("getblk: drain of stale delayed write failed: {e}");
                    }
                    self.cache.brelse(&buf);
                    continue;
                }
            }

            {
                let mut inner = self.cache.inner.lock();
                let mut st = buf.state.lock();
                if let Some(old) = st.vnode.take() {
                    inner
                        .hash
                        .remove(&(old.superblock.id, old.inode_nr, st.cluster_offset));
                }
                st.flags.remove(BufFlags::VALID);
                st.vnode = Some(vnode.clone());
                st.cluster_offset = cluster_offset;
                st.expiration = 0;
                st.data = vec![0u8; CLUSTER_SZ];
                inner.hash.insert(key, buf.clone());
            }
            return Ok(buf);
        }
    }

    /// Reads a cluster through the cache.
    ///
    /// On a miss the cluster is fetched from the server; bytes past the
    /// end of file stay zero. Returns the claimed block; release with
    /// `brelse`.
    pub async fn bread(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        cluster_offset: u64,
    ) -> Result<Arc<Buf>, Errno> {
        let buf = self.getblk(pid, vnode, cluster_offset).await?;
        if buf.flags().contains(BufFlags::VALID) {
            return Ok(buf);
        }

        buf.set_flags(BufFlags::READ, BufFlags::WRITE | BufFlags::ASYNC);
        let wanted = (vnode.size().saturating_sub(cluster_offset) as usize).min(CLUSTER_SZ);
        let result = if wanted == 0 {
            Ok(Vec::new())
        } else {
            self.vfs_read(pid, vnode, cluster_offset, wanted).await
        };
        match result {
            Ok(data) => {
                buf.write_at(0, &data);
                buf.set_flags(BufFlags::VALID | BufFlags::IODONE, BufFlags::READ);
                Ok(buf)
            }
            Err(e) => {
                buf.set_flags(BufFlags::ERROR, BufFlags::READ);
                self.cache.brelse(&buf);
                Err(e)
            }
        }
    }

    /// Writes one claimed block's live bytes to the server.
    async fn flush_buf(&self, pid: Pid, buf: &Arc<Buf>) -> Result<(), Errno> {
        let Some(vnode) = buf.vnode() else {
            return Ok(());
        };
        let cluster_offset = buf.cluster_offset();
        let live = (vnode.size().saturating_sub(cluster_offset) as usize).min(CLUSTER_SZ);
        if live == 0 {
            buf.set_flags(BufFlags::IODONE, BufFlags::WRITE | BufFlags::DELWRI | BufFlags::ASYNC);
            return Ok(());
        }
        let mut data = vec![0u8; live];
        buf.read_at(0, &mut data);

        match self.vfs_write(pid, &vnode, cluster_offset, &data).await {
            Ok(n) if n == live => {
                buf.set_flags(
                    BufFlags::IODONE,
                    BufFlags::WRITE | BufFlags::DELWRI | BufFlags::ASYNC,
                );
                Ok(())
            }
            Ok(_) => {
                buf.set_flags(BufFlags::ERROR, BufFlags::WRITE);
                Err(Errno::EIO)
            }
            Err(e) => {
                buf.set_flags(BufFlags::ERROR, BufFlags::WRITE);
                Err(e)
            }
        }
    }

    /// Synchronous write: commits the block and releases it.
    pub async fn bwrite(&self, pid: Pid, buf: Arc<Buf>) -> Result<(), Errno> {
        buf.set_flags(BufFlags::WRITE, BufFlags::READ | BufFlags::ASYNC);
        let result = self.flush_buf(pid, &buf).await;
        self.cache.brelse(&buf);
        result
    }

    /// Asynchronous write: schedules the block for the flusher's next
    /// pass and releases the claim.
    pub fn bawrite(&self, buf: Arc<Buf>) {
        let Some(vnode) = buf.vnode() else {
            self.cache.brelse(&buf);
            return;
        };
        let sb = vnode.superblock.clone();
        let expiration = sb.delwri.softclock();
        {
            let mut st = buf.state.lock();
            st.flags.insert(BufFlags::WRITE | BufFlags::ASYNC);
            st.flags.remove(BufFlags::READ | BufFlags::DELWRI | BufFlags::BUSY);
            st.expiration = expiration;
        }
        sb.delwri.insert(buf.clone(), expiration);
        buf.rendez.wakeup_all();
        sb.flush_rendez.wakeup_all();
    }

    /// Delayed write: schedules the block for flush after
    /// [`DELWRI_DELAY_TICKS`] and releases the claim. Used when the same
    /// cluster is likely to be written again soon.
    pub fn bdwrite(&self, buf: Arc<Buf>) {
        let Some(vnode) = buf.vnode() else {
            self.cache.brelse(&buf);
            return;
        };
        let sb = vnode.superblock.clone();
        let expiration = sb.delwri.softclock() + DELWRI_DELAY_TICKS;
        {
            let mut st = buf.state.lock();
            st.flags.insert(BufFlags::WRITE | BufFlags::DELWRI);
            st.flags.remove(BufFlags::READ | BufFlags::ASYNC | BufFlags::BUSY);
            st.expiration = expiration;
        }
        sb.delwri.insert(buf.clone(), expiration);
        buf.rendez.wakeup_all();
    }

    /// One flusher pass over a superblock's wheel: advances the
    /// superblock softclock toward `now`, issuing strategy writes for
    /// expired blocks until the strategy-message budget runs out (in
    /// which case the rest waits for the next pass).
    pub async fn bdflush_pass(&self, pid: Pid, sb: &Arc<SuperBlock>, now: u64) {
        let mut budget = NR_DELWRIMSG_PER_SB;
        while sb.delwri.softclock() < now {
            loop {
                let Some(buf) = sb.delwri.take_expired() else {
                    break;
                };
                if budget == 0 {
                    // Out of strategy messages: requeue and retry on the
                    // next wakeup.
                    sb.delwri.insert(buf.clone(), buf.state.lock().expiration);
                    return;
                }
                budget -= 1;
                buf.set_flags(BufFlags::BUSY, BufFlags::empty());
                self.cache.take_from_free(&buf);
                if let Err(e) = self.flush_buf(pid, &buf).await {
                    kerr!(
                        "bdflush: write-back failed on {}: {e}",
                        sb.id
                    );
                }
                self.cache.brelse(&buf);
            }
            sb.delwri.advance();
        }
    }

    /// Flushes every scheduled write of `vnode` immediately (fsync).
    pub async fn bsync(&self, pid: Pid, vnode: &Arc<Vnode>) -> Result<(), Errno> {
        let sb = vnode.superblock.clone();
        let mut result = Ok(());
        for buf in sb.delwri.all() {
            let matches = buf
                .vnode()
                .map(|v| v.same_as(vnode))
                .unwrap_or(false);
            if !matches {
                continue;
            }
            if !sb.delwri.remove(&buf) {
                continue;
            }
            buf.set_flags(BufFlags::BUSY, BufFlags::empty());
            self.cache.take_from_free(&buf);
            if let Err(e) = self.flush_buf(pid, &buf).await {
                result = Err(e);
            }
            self.cache.brelse(&buf);
        }
        result
    }

    /// Flushes every scheduled write of a superblock (unmount drain).
    pub async fn bsync_superblock(&self, pid: Pid, sb: &Arc<SuperBlock>) -> Result<(), Errno> {
        let mut result = Ok(());
        for buf in sb.delwri.all() {
            if !sb.delwri.remove(&buf) {
                continue;
            }
            buf.set_flags(BufFlags::BUSY, BufFlags::empty());
            self.cache.take_from_free(&buf);
            if let Err(e) = self.flush_buf(pid, &buf).await {
                result = Err(e);
            }
            self.cache.brelse(&buf);
        }
        result
    }

    /// The flusher task body for one superblock: wakes on an interval
    /// (or an explicit kick), sweeps the wheel, and exits when the mount
    /// goes away.
    pub async fn bdflush_task(self: Arc<Self>, pid: Pid, sb: Arc<SuperBlock>) {
        loop {
            let _ = self
                .timers
                .timed_wait(&sb.flush_rendez, Some(BDFLUSH_WAKEUP_INTERVAL_TICKS))
                .await;
            if sb.is_aborted() || self.mounts.find(sb.id).is_none() {
                return;
            }
            let now = self.timers.soft_ticks();
            self.bdflush_pass(pid, &sb, now).await;
        }
    }

    // ── byte-granularity file access through the cache ──────────────

    /// Reads up to `buf.len()` bytes at `*offset`, advancing it. Returns
    /// the byte count (0 at end of file).
    pub async fn read_from_cache(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        out: &mut [u8],
        offset: &mut u64,
    ) -> Result<usize, Errno> {
        let size = vnode.size();
        if *offset >= size {
            return Ok(0);
        }
        let mut remaining = ((size - *offset) as usize).min(out.len());
        let mut done = 0usize;

        while remaining > 0 {
            let cluster_base = *offset - (*offset % CLUSTER_SZ as u64);
            let cluster_off = (*offset % CLUSTER_SZ as u64) as usize;
            let n = (CLUSTER_SZ - cluster_off).min(remaining);

            let buf = match self.bread(pid, vnode, cluster_base).await {
                Ok(buf) => buf,
                Err(e) => {
                    if done > 0 {
                        break;
                    }
                    return Err(e);
                }
            };
            buf.read_at(cluster_off, &mut out[done..done + n]);
            self.cache.brelse(&buf);

            done += n;
            *offset += n as u64;
            remaining -= n;
        }
        Ok(done)
    }

    /// Writes `data` at `*offset` through the cache, advancing the
    /// offset and extending the file size as needed. A write that lands
    /// past the old end of file zero-fills the gap first. Clusters whose
    /// write reaches their end are scheduled for prompt write-back;
    /// partially written clusters are delayed.
    pub async fn write_to_cache(
        &self,
        pid: Pid,
        vnode: &Arc<Vnode>,
        data: &[u8],
        offset: &mut u64,
    ) -> Result<usize, Errno> {
        let mut remaining = data.len();
        let mut done = 0usize;

        // Extend-then-write: zero from the old EOF up to the write start
        // so no stale bytes appear in the gap.
        let old_size = vnode.size();
        if *offset > old_size {
            let gap_cluster = old_size - (old_size % CLUSTER_SZ as u64);
            if let Ok(buf) = self.bread(pid, vnode, gap_cluster).await {
                let from = (old_size - gap_cluster) as usize;
                let to = ((*offset - gap_cluster) as usize).min(CLUSTER_SZ);
                if from < to {
                    buf.zero_range(from, to);
                }
                self.bdwrite(buf);
            }
        }

        while remaining > 0 {
            let cluster_base = *offset - (*offset % CLUSTER_SZ as u64);
            let cluster_off = (*offset % CLUSTER_SZ as u64) as usize;
            let n = (CLUSTER_SZ - cluster_off).min(remaining);

            let buf = match self.bread(pid, vnode, cluster_base).await {
                Ok(buf) => buf,
                Err(e) => {
                    if done > 0 {
                        break;
                    }
                    return Err(e);
                }
            };
            buf.write_at(cluster_off, &data[done..done + n]);

            done += n;
            *offset += n as u64;
            remaining -= n;

            if *offset > vnode.size() {
                vnode.set_size(*offset);
            }

            if cluster_off + n == CLUSTER_SZ {
                self.bawrite(buf);
            } else {
                self.bdwrite(buf);
            }
        }
        Ok(done)
    }
}
