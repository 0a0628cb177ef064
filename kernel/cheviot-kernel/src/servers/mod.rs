//! In-process reference servers.
//!
//! Each server is an executor task that owns the server side of a mount
//! and speaks raw `fsreq` over its port through the message syscalls,
//! exactly what an out-of-process server binary would do. `ifs` is the
//! read-only boot file system; `ramfs` is the read-write RAM file system
//! integration tests mount.

pub mod ifs;
pub mod ramfs;
