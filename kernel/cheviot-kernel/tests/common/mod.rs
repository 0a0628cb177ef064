//! Shared fixture for whole-kernel tests: boot images, a tiny ELF
//! builder for init binaries, and ramfs mounting helpers.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use std::sync::Arc;

use cheviot_core::id::Fd;
use cheviot_fs::ifs::IfsImageBuilder;
use cheviot_fs::stat::S_IFDIR;
use cheviot_fs::Stat;
use cheviot_kernel::servers::ramfs::{RamFs, RamFsHandle, ramfs_server};
use cheviot_kernel::{Kernel, Process};

/// Startup configuration planted in every boot image.
pub const STARTUP_CFG: &[u8] = b"hostname=cheviot\nconsole=/dev/uart0\nboot=normal\n";

/// A kernel over 16 MiB of modeled RAM.
pub fn test_kernel() -> Arc<Kernel> {
    Kernel::new(16 * 1024 * 1024)
}

/// Builds a minimal 32-bit ARM `ET_EXEC` image: one read-execute text
/// segment at 0x8000 plus a read-write data segment with a zero tail.
pub fn minimal_init_elf() -> Vec<u8> {
    build_elf(
        0x8000,
        &[
            (0x8000, b"\xde\xc0\xad\x0binit-code".as_slice(), 13, 0x5), // R+X
            (0x9000, b"init-data".as_slice(), 64, 0x6),                // R+W
        ],
    )
}

/// Builds a 32-bit little-endian ARM executable from
/// `(vaddr, file bytes, memsz, p_flags)` segments.
pub fn build_elf(entry: u32, segs: &[(u32, &[u8], u32, u32)]) -> Vec<u8> {
    let phoff = 52usize;
    let phentsize = 32usize;
    let data_off = phoff + segs.len() * phentsize;

    let mut out = vec![0u8; data_off];
    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 1; // ELFCLASS32
    out[5] = 1; // ELFDATA2LSB
    out[6] = 1; // EV_CURRENT
    out[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out[18..20].copy_from_slice(&40u16.to_le_bytes()); // EM_ARM
    out[24..28].copy_from_slice(&entry.to_le_bytes());
    out[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
    out[42..44].copy_from_slice(&(phentsize as u16).to_le_bytes());
    out[44..46].copy_from_slice(&(segs.len() as u16).to_le_bytes());

    let mut cursor = data_off as u32;
    for (i, (vaddr, data, memsz, pflags)) in segs.iter().enumerate() {
        let ph = phoff + i * phentsize;
        out[ph..ph + 4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out[ph + 4..ph + 8].copy_from_slice(&cursor.to_le_bytes());
        out[ph + 8..ph + 12].copy_from_slice(&vaddr.to_le_bytes());
        out[ph + 16..ph + 20].copy_from_slice(&(data.len() as u32).to_le_bytes());
        out[ph + 20..ph + 24].copy_from_slice(&memsz.to_le_bytes());
        out[ph + 24..ph + 28].copy_from_slice(&pflags.to_le_bytes());
        cursor += data.len() as u32;
    }
    for (_, data, _, _) in segs {
        out.extend_from_slice(data);
    }
    out
}

/// A boot image with `/etc/startup.cfg`, `/sbin/init` and a docs dir.
pub fn boot_image() -> Vec<u8> {
    let mut b = IfsImageBuilder::new();
    let etc = b.add_dir(0, "etc");
    b.add_file(etc, "startup.cfg", STARTUP_CFG);
    let sbin = b.add_dir(0, "sbin");
    b.add_file(sbin, "init", &minimal_init_elf());
    b.add_file(0, "motd", b"welcome to cheviot\n");
    b.build()
}

/// A directory `stat` for mount calls.
pub fn dir_stat() -> Stat {
    Stat {
        st_mode: S_IFDIR | 0o755,
        ..Stat::default()
    }
}

/// Mounts a ramfs at `path` (the system root when nothing is mounted
/// yet), spawns its server task, and returns the server process, the
/// store handle and the port descriptor.
pub async fn mount_ramfs(
    kernel: &Arc<Kernel>,
    path: &str,
    store: RamFs,
) -> (Arc<Process>, RamFsHandle, Fd) {
    let server = kernel.new_process("ramfs", None);
    let handle = RamFsHandle::new(store);
    let port_fd = kernel
        .sys_mount(&server, path, 0, &dir_stat())
        .await
        .expect("mount ramfs");
    kernel.executor.spawn(ramfs_server(
        kernel.clone(),
        server.clone(),
        port_fd,
        handle.clone(),
    ));
    (server, handle, port_fd)
}

/// Boots a ramfs as the root file system and returns a user process
/// whose cwd is the root.
pub async fn boot_ramfs(kernel: &Arc<Kernel>) -> (Arc<Process>, RamFsHandle) {
    let (_server, handle, _port) = mount_ramfs(kernel, "/", RamFs::new()).await;
    let user = kernel.new_process("user", None);
    (user, handle)
}
