//! Boot glue.
//!
//! Brings the system from a bare kernel context to a running root file
//! system and an exec'd `/sbin/init`: inventories physical memory, maps
//! the IFS image, mounts the root through the IFS server task (handing
//! it the image base and size as argv strings, the way the loader does),
//! and starts init.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

use cheviot_core::{Errno, kinfo};
use cheviot_fs::ifs::IfsImage;
use cheviot_fs::lookup::LookupFlags;
use cheviot_fs::stat::S_IFDIR;
use cheviot_fs::Stat;
use cheviot_mm::Prot;

use crate::context::Kernel;
use crate::proc::Process;
use crate::servers::ifs::ifs_server;
use crate::syscall::mount::MOUNT_RDONLY;

/// The running system after boot.
pub struct BootInfo {
    /// The IFS/root server process.
    pub root_server: Arc<Process>,
    /// The init process, exec'd from `/sbin/init`.
    pub init: Arc<Process>,
}

impl Kernel {
    /// Boots the system from an IFS image.
    ///
    /// # Errors
    ///
    /// Fails when the image does not parse, the root mount cannot be
    /// created, or `/sbin/init` is absent or not a valid executable.
    pub async fn bootstrap(self: &Arc<Self>, ifs_image: Vec<u8>) -> Result<BootInfo, Errno> {
        kinfo!(
            "boot: {} bytes RAM, {} large frame runs free",
            self.frames.free_count() * cheviot_mm::PAGE_SIZE,
            self.frames.free_large_runs()
        );

        let image_size = ifs_image.len();
        let image = IfsImage::parse(ifs_image.clone())?;

        // The root server process, with the boot image mapped as a
        // shared physical region.
        let root_server = self.new_process("ifs", None);
        let image_base = self.sys_virtual_alloc_phys(
            &root_server,
            image_size as u64,
            Prot::READ | Prot::WRITE,
        )?;
        root_server
            .addr_space
            .lock()
            .copy_out(image_base, &ifs_image)?;

        // Mount the root.
        let stat = Stat {
            st_mode: S_IFDIR | 0o755,
            ..Stat::default()
        };
        let port_fd = self
            .sys_mount(&root_server, "/", MOUNT_RDONLY, &stat)
            .await?;

        // Hand the server its image location the way the loader passes
        // argv: base and size as strings.
        let argv_base = format!("{image_base:#x}");
        let argv_size = format!("{image_size}");
        kinfo!("boot: ifs image at {argv_base} ({argv_size} bytes)");

        {
            let kernel = self.clone();
            let process = root_server.clone();
            self.executor
                .spawn(ifs_server(kernel, process, port_fd, image));
        }

        // Give the server's root directory to init as cwd and exec it.
        // Init is not a server: it drops its inherited port handle.
        let init = self.sys_fork(&root_server)?;
        self.sys_close(&init, port_fd).await?;
        {
            let start = init.lookup_start(self)?;
            let looked = self
                .fs
                .lookup(init.pid, &start, "/", LookupFlags::empty())
                .await?;
            let root = looked.vnode.ok_or(Errno::ENOENT)?;
            *init.cwd.lock() = Some(root);
        }
        self.sys_exec(&init, "/sbin/init", &["/sbin/init"], &[]).await?;

        kinfo!("boot: init is process {}", init.pid);
        Ok(BootInfo { root_server, init })
    }
}
