//! The Cheviot kernel.
//!
//! Ties the subsystems together: processes with address spaces and handle
//! tables, the kqueue event layer, the syscall surface that translates
//! POSIX-shaped calls into VFS and IPC operations, the in-process
//! reference servers, and the boot glue that brings the first file system
//! and `/sbin/init` up.
//!
//! There are no global singletons: everything hangs off a
//! [`Kernel`](context::Kernel) context, so whole-system scenarios run
//! deterministically in host tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod context;
pub mod handle;
pub mod kqueue;
pub mod proc;
pub mod servers;
pub mod syscall;

pub use context::Kernel;
pub use handle::{Filp, FilpObject, HandleTable, NPROC_FD};
pub use kqueue::{Filter, KQueue, Kevent, KevFlags};
pub use proc::Process;
