//! The exec loader.
//!
//! Validates a 32-bit ELF executable, marshals argv/env through the
//! single-user argument pool, resets the address space, maps every
//! `PT_LOAD` with a zero-filled `memsz - filesz` tail, builds the user
//! stack with argv/env rewritten to their stack addresses, and records
//! the entry point and stack pointer for the return to user space.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use cheviot_core::{Errno, kinfo};
use cheviot_core::sync::Mutex;
use cheviot_fs::lookup::LookupFlags;
use cheviot_fs::VnodeType;
use cheviot_mm::{Access, PAGE_SIZE, Prot, SegKind};

use crate::context::Kernel;
use crate::proc::Process;

/// Size of the argv/env marshalling pool.
pub const MAX_ARGS_SZ: usize = 0x10000;

/// Top of the user stack.
pub const USER_STACK_TOP: u64 = 0x4000_0000;

/// User stack size.
pub const USER_STACK_SZ: u64 = 64 * 1024;

/// The argv/env marshalling pool: one exec at a time system-wide.
pub struct ExecArgsPool {
    /// Async mutex standing in for the pool's busy flag and rendez.
    pub lock: Mutex<()>,
}

impl ExecArgsPool {
    /// Creates the pool.
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }
}

impl Default for ExecArgsPool {
    fn default() -> Self {
        Self::new()
    }
}

// ── ELF parsing ─────────────────────────────────────────────────────

/// ELF magic.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
/// 32-bit class.
const ELFCLASS32: u8 = 1;
/// Little-endian data.
const ELFDATA2LSB: u8 = 1;
/// Executable object.
const ET_EXEC: u16 = 2;
/// x86.
const EM_386: u16 = 3;
/// ARM.
const EM_ARM: u16 = 40;
/// Loadable segment.
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

/// One loadable segment.
#[derive(Debug, Clone)]
pub struct ElfSegment {
    /// Virtual load address.
    pub vaddr: u64,
    /// Bytes present in the file.
    pub data: Vec<u8>,
    /// In-memory size (`>= data.len()`; the tail is zero-filled).
    pub memsz: u64,
    /// Mapping protections from `p_flags`.
    pub prot: Prot,
}

/// A validated executable image.
#[derive(Debug, Clone)]
pub struct ElfImage {
    /// Entry point.
    pub entry: u64,
    /// Loadable segments in file order.
    pub segments: Vec<ElfSegment>,
}

fn u16_at(bytes: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(bytes[off..off + 2].try_into().expect("2 bytes"))
}

fn u32_at(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(bytes[off..off + 4].try_into().expect("4 bytes"))
}

/// Parses and validates a 32-bit little-endian `ET_EXEC` image for ARM
/// or x86.
///
/// # Errors
///
/// `EINVAL` for anything that is not such an image.
pub fn parse_elf(bytes: &[u8]) -> Result<ElfImage, Errno> {
    if bytes.len() < 52 || bytes[0..4] != ELF_MAGIC {
        return Err(Errno::EINVAL);
    }
    if bytes[4] != ELFCLASS32 || bytes[5] != ELFDATA2LSB {
        return Err(Errno::EINVAL);
    }
    if u16_at(bytes, 16) != ET_EXEC {
        return Err(Errno::EINVAL);
    }
    let machine = u16_at(bytes, 18);
    if machine != EM_ARM && machine != EM_386 {
        return Err(Errno::EINVAL);
    }

    let entry = u64::from(u32_at(bytes, 24));
    let phoff = u32_at(bytes, 28) as usize;
    let phentsize = u16_at(bytes, 42) as usize;
    let phnum = u16_at(bytes, 44) as usize;
    if phentsize < 32 || phoff.saturating_add(phnum * phentsize) > bytes.len() {
        return Err(Errno::EINVAL);
    }

    let mut segments = Vec::new();
    for i in 0..phnum {
        let ph = &bytes[phoff + i * phentsize..phoff + (i + 1) * phentsize];
        if u32_at(ph, 0) != PT_LOAD {
            continue;
        }
        let offset = u32_at(ph, 4) as usize;
        let vaddr = u64::from(u32_at(ph, 8));
        let filesz = u32_at(ph, 16) as usize;
        let memsz = u64::from(u32_at(ph, 20));
        let flags = u32_at(ph, 24);

        if offset.saturating_add(filesz) > bytes.len() || memsz < filesz as u64 {
            return Err(Errno::EINVAL);
        }

        let mut prot = Prot::empty();
        if flags & PF_R != 0 {
            prot |= Prot::READ;
        }
        if flags & PF_W != 0 {
            prot |= Prot::WRITE;
        }
        if flags & PF_X != 0 {
            prot |= Prot::EXEC;
        }

        segments.push(ElfSegment {
            vaddr,
            data: bytes[offset..offset + filesz].to_vec(),
            memsz,
            prot,
        });
    }
    if segments.is_empty() {
        return Err(Errno::EINVAL);
    }
    Ok(ElfImage { entry, segments })
}

// ── the loader ──────────────────────────────────────────────────────

fn page_down(va: u64) -> u64 {
    va & !(PAGE_SIZE as u64 - 1)
}

fn page_up(va: u64) -> u64 {
    (va + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

impl Kernel {
    /// Replaces `process`'s image with the executable at `path`.
    ///
    /// On success the process's entry point and stack pointer are set
    /// and close-on-exec handles have been swept. On failure the old
    /// image may already be gone; the caller treats it as fatal to the
    /// process.
    pub async fn sys_exec(
        self: &Arc<Self>,
        process: &Arc<Process>,
        path: &str,
        argv: &[&str],
        env: &[&str],
    ) -> Result<(), Errno> {
        // Read the executable in before touching the address space.
        let start = process.lookup_start(self)?;
        let looked = self
            .fs
            .lookup(process.pid, &start, path, LookupFlags::empty())
            .await?;
        let vnode = looked.vnode.ok_or(Errno::ENOENT)?;
        if vnode.vnode_type() != VnodeType::Reg {
            self.fs.vnode_put(process.pid, &vnode).await;
            return Err(Errno::EACCES);
        }

        let size = vnode.size() as usize;
        let mut image = vec![0u8; size];
        let mut offset = 0u64;
        let mut done = 0usize;
        while done < size {
            let n = self
                .fs
                .read_from_cache(process.pid, &vnode, &mut image[done..], &mut offset)
                .await?;
            if n == 0 {
                break;
            }
            done += n;
        }
        self.fs.vnode_put(process.pid, &vnode).await;
        if done < size {
            return Err(Errno::EIO);
        }

        let elf = parse_elf(&image)?;

        // The argument pool admits one exec at a time.
        let _pool = self.execargs.lock.lock().await;

        // Marshal argv/env into the pool, bounding total size.
        let total: usize = argv.iter().chain(env.iter()).map(|s| s.len() + 1).sum::<usize>()
            + (argv.len() + env.len() + 2) * 8;
        if total > MAX_ARGS_SZ {
            return Err(Errno::ENOMEM);
        }
        let argv_pool: Vec<String> = argv.iter().map(|s| String::from(*s)).collect();
        let env_pool: Vec<String> = env.iter().map(|s| String::from(*s)).collect();

        // Point of no return: tear the old image down.
        {
            let mut space = process.addr_space.lock();
            space.reset();

            let mut mapped_end = 0u64;
            for seg in &elf.segments {
                let mut base = page_down(seg.vaddr);
                let end = page_up(seg.vaddr + seg.memsz.max(1));
                if base < mapped_end {
                    base = mapped_end;
                }
                if base < end {
                    space.map(base, end - base, Prot::READ | Prot::WRITE, SegKind::Anon)?;
                    mapped_end = end;
                }
            }
            for seg in &elf.segments {
                space.copy_out(seg.vaddr, &seg.data)?;
            }
            // Zero tails are implicit: anonymous pages start zeroed.
            for seg in &elf.segments {
                let base = page_down(seg.vaddr);
                let end = page_up(seg.vaddr + seg.memsz.max(1));
                // Protections apply per page range; overlapping rounded
                // segments keep the stronger (writable) mapping.
                if seg.prot.contains(Prot::WRITE) {
                    continue;
                }
                let _ = space.protect(base, end - base, seg.prot);
            }

            // Fresh user stack.
            space.map(
                USER_STACK_TOP - USER_STACK_SZ,
                USER_STACK_SZ,
                Prot::READ | Prot::WRITE,
                SegKind::Anon,
            )?;

            // Copy strings to the stack top, then pointer tables below
            // them, rewritten to their stack addresses.
            let mut cursor = USER_STACK_TOP;
            let mut arg_ptrs = Vec::with_capacity(argv_pool.len());
            let mut env_ptrs = Vec::with_capacity(env_pool.len());
            for (strings, ptrs) in [(&argv_pool, &mut arg_ptrs), (&env_pool, &mut env_ptrs)] {
                for s in strings.iter() {
                    cursor -= s.len() as u64 + 1;
                    space.copy_out(cursor, s.as_bytes())?;
                    space.copy_out(cursor + s.len() as u64, &[0u8])?;
                    ptrs.push(cursor);
                }
            }

            cursor &= !7; // align the pointer tables
            let mut words: Vec<u64> = Vec::new();
            words.push(argv_pool.len() as u64); // argc
            words.extend(arg_ptrs.iter());
            words.push(0); // argv terminator
            words.extend(env_ptrs.iter());
            words.push(0); // env terminator

            cursor -= (words.len() * 8) as u64;
            cursor &= !15; // ABI stack alignment
            let mut bytes = Vec::with_capacity(words.len() * 8);
            for w in &words {
                bytes.extend_from_slice(&w.to_le_bytes());
            }
            space.copy_out(cursor, &bytes)?;

            // Verify the faulted-in stack page is writable before
            // committing the registers.
            space.fault(cursor, Access::Write)?;

            *process.entry.lock() = elf.entry;
            *process.stack_ptr.lock() = cursor;
        }

        // Close-on-exec sweep.
        let swept = process.handles.lock().sweep_cloexec();
        for filp in swept {
            self.release_filp(process, filp).await;
        }

        *process.name.lock() = String::from(path);
        kinfo!(
            "process {}: exec {} (entry {:#x})",
            process.pid,
            path,
            elf.entry
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_elf(entry: u32, segs: &[(u32, &[u8], u32, u32)]) -> Vec<u8> {
        // (vaddr, data, memsz, pflags)
        let phoff = 52usize;
        let phentsize = 32usize;
        let data_off = phoff + segs.len() * phentsize;

        let mut out = vec![0u8; data_off];
        out[0..4].copy_from_slice(&ELF_MAGIC);
        out[4] = ELFCLASS32;
        out[5] = ELFDATA2LSB;
        out[6] = 1; // EV_CURRENT
        out[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        out[18..20].copy_from_slice(&EM_ARM.to_le_bytes());
        out[24..28].copy_from_slice(&entry.to_le_bytes());
        out[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
        out[42..44].copy_from_slice(&(phentsize as u16).to_le_bytes());
        out[44..46].copy_from_slice(&(segs.len() as u16).to_le_bytes());

        let mut cursor = data_off as u32;
        for (i, (vaddr, data, memsz, pflags)) in segs.iter().enumerate() {
            let ph = phoff + i * phentsize;
            out[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
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

    #[test]
    fn parse_accepts_minimal_arm_exec() {
        let image = minimal_elf(0x8000, &[(0x8000, b"code", 4, PF_R | PF_X)]);
        let elf = parse_elf(&image).unwrap();
        assert_eq!(elf.entry, 0x8000);
        assert_eq!(elf.segments.len(), 1);
        assert_eq!(elf.segments[0].data, b"code");
        assert_eq!(elf.segments[0].prot, Prot::READ | Prot::EXEC);
    }

    #[test]
    fn parse_rejects_wrong_class_or_type() {
        let mut image = minimal_elf(0x8000, &[(0x8000, b"x", 1, PF_R)]);
        image[4] = 2; // ELFCLASS64
        assert_eq!(parse_elf(&image).unwrap_err(), Errno::EINVAL);

        let mut image = minimal_elf(0x8000, &[(0x8000, b"x", 1, PF_R)]);
        image[16] = 3; // ET_DYN
        assert_eq!(parse_elf(&image).unwrap_err(), Errno::EINVAL);

        assert_eq!(parse_elf(b"not an elf").unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn parse_rejects_truncated_segment() {
        let mut image = minimal_elf(0x8000, &[(0x8000, b"codecode", 8, PF_R)]);
        image.truncate(image.len() - 4);
        assert_eq!(parse_elf(&image).unwrap_err(), Errno::EINVAL);
    }

    #[test]
    fn memsz_smaller_than_filesz_rejected() {
        let phoff = 52;
        let mut image = minimal_elf(0x8000, &[(0x8000, b"codecode", 8, PF_R)]);
        image[phoff + 20..phoff + 24].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(parse_elf(&image).unwrap_err(), Errno::EINVAL);
    }
}
