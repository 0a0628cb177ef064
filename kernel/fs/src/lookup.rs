//! Component-wise path resolution.
//!
//! Walks one component at a time from the root (absolute) or the
//! caller's current directory (relative), descending into mounts through
//! `mounted_here` and climbing back out of them through `covered` on
//! `..`. The name cache answers first; misses go to the directory's
//! server. Symlink targets splice into the remaining path, bounded by
//! [`MAX_SYMLINK`](crate::MAX_SYMLINK) expansions.
//!
//! Reference discipline: every v-node handed back in a [`Lookup`] carries
//! a reference the caller must put; every intermediate reference is put
//! here.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::Arc;

use bitflags::bitflags;

use cheviot_core::Errno;
use cheviot_core::id::Pid;

use crate::stat::VnodeType;
use crate::vnode::Vnode;
use crate::FsCore;

bitflags! {
    /// Resolver behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LookupFlags: u32 {
        /// Return the parent and last component even when the final
        /// component does not exist (create paths).
        const PARENT   = 1 << 0;
        /// Return parent and target for deletion; the target must exist.
        const REMOVE   = 1 << 1;
        /// Do not follow a terminal symlink.
        const NOFOLLOW = 1 << 5;
        /// The path originates in the kernel, not user space.
        const KERNEL   = 1 << 6;
    }
}

/// Where a resolution starts: the process's root and current directory.
pub struct LookupStart {
    /// Root v-node (changed by chroot).
    pub root: Arc<Vnode>,
    /// Current directory v-node.
    pub cwd: Arc<Vnode>,
}

/// The outcome of a path resolution.
pub struct Lookup {
    /// The resolved v-node (absent for a PARENT lookup of a missing
    /// final component).
    pub vnode: Option<Arc<Vnode>>,
    /// The parent directory, present for PARENT/REMOVE lookups.
    pub parent: Option<Arc<Vnode>>,
    /// The final path component.
    pub last_component: String,
}

impl FsCore {
    /// Follows mount splices downward: a covered v-node resolves to the
    /// root mounted over it. Consumes the caller's reference on `vnode`
    /// and returns one on the result.
    async fn descend_mounts(&self, pid: Pid, mut vnode: Arc<Vnode>) -> Arc<Vnode> {
        while let Some(root) = vnode.mounted_here() {
            self.vnodes.incref(&root);
            self.vnode_put(pid, &vnode).await;
            vnode = root;
        }
        vnode
    }

    /// Resolves one component in `cur`, handling `.`, `..` across mount
    /// roots, the name cache, and mount descent on the result.
    ///
    /// Returns `Ok(None)` when the name does not exist.
    async fn advance(
        &self,
        pid: Pid,
        cur: &Arc<Vnode>,
        name: &str,
    ) -> Result<Option<Arc<Vnode>>, Errno> {
        if name == "." {
            self.vnodes.incref(cur);
            return Ok(Some(cur.clone()));
        }

        // `..` on a mount root climbs back to the file system the mount
        // covers before asking a server anything.
        let mut dir = cur.clone();
        if name == ".." {
            while dir.flags().contains(crate::vnode::VnodeFlags::ROOT) {
                match dir.covered() {
                    Some(covered) => dir = covered,
                    None => {
                        // `..` at the system root stays put.
                        self.vnodes.incref(&dir);
                        return Ok(Some(dir));
                    }
                }
            }
            let parent = self.vfs_lookup(pid, &dir, "..").await?;
            return Ok(Some(self.descend_mounts(pid, parent).await));
        }

        match self.dnlc.lookup(&dir, name) {
            crate::dnlc::DnlcHit::Found(vnode) => {
                self.vnodes.incref(&vnode);
                return Ok(Some(self.descend_mounts(pid, vnode).await));
            }
            crate::dnlc::DnlcHit::Negative => return Ok(None),
            crate::dnlc::DnlcHit::Miss => {}
        }

        match self.vfs_lookup(pid, &dir, name).await {
            Ok(vnode) => {
                self.dnlc.enter(&dir, name, Some(vnode.clone()));
                Ok(Some(self.descend_mounts(pid, vnode).await))
            }
            Err(Errno::ENOENT) => {
                self.dnlc.enter(&dir, name, None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Resolves `path` from `start` according to `flags`.
    pub async fn lookup(
        &self,
        pid: Pid,
        start: &LookupStart,
        path: &str,
        flags: LookupFlags,
    ) -> Result<Lookup, Errno> {
        if path.is_empty() {
            return Err(Errno::ENOENT);
        }
        if path.len() > crate::PATH_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        let wants_parent = flags.intersects(LookupFlags::PARENT | LookupFlags::REMOVE);

        let absolute = path.starts_with('/');
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            // The path was "/" (possibly repeated).
            if wants_parent {
                return Err(Errno::EINVAL);
            }
            self.vnodes.incref(&start.root);
            let root = self.descend_mounts(pid, start.root.clone()).await;
            return Ok(Lookup {
                vnode: Some(root),
                parent: None,
                last_component: String::new(),
            });
        }

        let mut components: VecDeque<String> = trimmed
            .split('/')
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();

        let mut cur = if absolute {
            self.vnodes.incref(&start.root);
            self.descend_mounts(pid, start.root.clone()).await
        } else {
            self.vnodes.incref(&start.cwd);
            start.cwd.clone()
        };

        let mut links_followed = 0usize;

        loop {
            let name = components.pop_front().expect("component list non-empty");
            let is_last = components.is_empty();

            if cur.superblock.is_aborted() {
                self.vnode_put(pid, &cur).await;
                return Err(Errno::EIO);
            }
            if name.len() > crate::NAME_MAX {
                self.vnode_put(pid, &cur).await;
                return Err(Errno::ENAMETOOLONG);
            }
            if !cur.is_dir() {
                self.vnode_put(pid, &cur).await;
                return Err(Errno::ENOTDIR);
            }
            if cur.mode() & 0o111 == 0 {
                self.vnode_put(pid, &cur).await;
                return Err(Errno::EACCES);
            }
            if is_last && wants_parent && (name == "." || name == "..") {
                self.vnode_put(pid, &cur).await;
                return Err(Errno::EINVAL);
            }

            let next = match self.advance(pid, &cur, &name).await {
                Ok(next) => next,
                Err(e) => {
                    self.vnode_put(pid, &cur).await;
                    return Err(e);
                }
            };

            let Some(vnode) = next else {
                if is_last && flags.contains(LookupFlags::PARENT) {
                    return Ok(Lookup {
                        vnode: None,
                        parent: Some(cur),
                        last_component: name,
                    });
                }
                self.vnode_put(pid, &cur).await;
                return Err(Errno::ENOENT);
            };

            // Symlink: splice the target into the remaining path.
            if vnode.vnode_type() == VnodeType::Lnk
                && !(is_last && flags.contains(LookupFlags::NOFOLLOW))
            {
                links_followed += 1;
                if links_followed > crate::MAX_SYMLINK {
                    self.vnode_put(pid, &vnode).await;
                    self.vnode_put(pid, &cur).await;
                    return Err(Errno::ELOOP);
                }
                let target = match self.vfs_rdlink(pid, &vnode).await {
                    Ok(t) => t,
                    Err(e) => {
                        self.vnode_put(pid, &vnode).await;
                        self.vnode_put(pid, &cur).await;
                        return Err(e);
                    }
                };
                self.vnode_put(pid, &vnode).await;

                let target_trimmed = target.trim_end_matches('/');
                if target_trimmed.is_empty() && !target.starts_with('/') {
                    self.vnode_put(pid, &cur).await;
                    return Err(Errno::ENOENT);
                }
                for comp in target_trimmed.split('/').filter(|c| !c.is_empty()).rev() {
                    components.push_front(String::from(comp));
                }
                if target.starts_with('/') {
                    self.vnode_put(pid, &cur).await;
                    self.vnodes.incref(&start.root);
                    cur = self.descend_mounts(pid, start.root.clone()).await;
                }
                if components.is_empty() {
                    // The link pointed at "/" itself.
                    return Ok(Lookup {
                        vnode: Some(cur),
                        parent: None,
                        last_component: String::new(),
                    });
                }
                continue;
            }

            if is_last {
                if wants_parent {
                    return Ok(Lookup {
                        vnode: Some(vnode),
                        parent: Some(cur),
                        last_component: name,
                    });
                }
                self.vnode_put(pid, &cur).await;
                return Ok(Lookup {
                    vnode: Some(vnode),
                    parent: None,
                    last_component: name,
                });
            }

            self.vnode_put(pid, &cur).await;
            cur = vnode;
        }
    }
}
