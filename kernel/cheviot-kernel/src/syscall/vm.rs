//! Virtual memory syscalls over the address-space manager.

use alloc::sync::Arc;

use cheviot_core::Errno;
use cheviot_mm::{PAGE_SIZE, Prot, SegKind};

use crate::context::Kernel;
use crate::proc::Process;

impl Kernel {
    /// Allocates anonymous memory; returns the mapped address.
    pub fn sys_virtual_alloc(
        self: &Arc<Self>,
        process: &Arc<Process>,
        len: u64,
        prot: Prot,
    ) -> Result<u64, Errno> {
        if len == 0 {
            return Err(Errno::EINVAL);
        }
        let va = process.take_mmap_range(len);
        process
            .addr_space
            .lock()
            .map(va, len, prot, SegKind::Anon)?;
        Ok(va)
    }

    /// Allocates a shared physical region (device windows, boot images);
    /// returns the mapped address.
    pub fn sys_virtual_alloc_phys(
        self: &Arc<Self>,
        process: &Arc<Process>,
        len: u64,
        prot: Prot,
    ) -> Result<u64, Errno> {
        if len == 0 {
            return Err(Errno::EINVAL);
        }
        let pages = (len as usize).div_ceil(PAGE_SIZE);
        let base_frame = self.frames.claim_phys(pages)?;
        let va = process.take_mmap_range(len);
        process
            .addr_space
            .lock()
            .map(va, len, prot, SegKind::Phys(base_frame))?;
        Ok(va)
    }

    /// Releases a mapping.
    pub fn sys_virtual_free(
        self: &Arc<Self>,
        process: &Arc<Process>,
        va: u64,
        len: u64,
    ) -> Result<(), Errno> {
        process.addr_space.lock().unmap(va, len)
    }

    /// Changes a mapping's protections.
    pub fn sys_virtual_protect(
        self: &Arc<Self>,
        process: &Arc<Process>,
        va: u64,
        len: u64,
        prot: Prot,
    ) -> Result<(), Errno> {
        process.addr_space.lock().protect(va, len, prot)
    }
}
