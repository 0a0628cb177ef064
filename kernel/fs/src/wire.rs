//! The `fsreq` / `fsreply` wire protocol.
//!
//! This is the contract between the kernel VFS and file-system server
//! processes, so the byte layout is fixed: both structures are 64-byte
//! little-endian records, with the command's arguments starting at offset
//! 8. Names travel as separate length-counted iov segments (no NUL
//! required on the wire); bulk data rides in a trailing payload segment.
//!
//! Byte order is explicit everywhere. Do not replace the helpers with
//! host-order casts; big-endian builds must produce identical bytes.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use cheviot_core::Errno;

/// Size of an encoded request.
pub const FSREQ_SZ: usize = 64;
/// Size of an encoded reply.
pub const FSREPLY_SZ: usize = 64;
/// Size of an encoded termios structure.
pub const TERMIOS_SZ: usize = 36;

// Command codes.
const CMD_LOOKUP: u32 = 1;
const CMD_CLOSE: u32 = 2;
const CMD_CREATE: u32 = 3;
const CMD_READ: u32 = 4;
const CMD_WRITE: u32 = 5;
const CMD_READDIR: u32 = 6;
const CMD_MKDIR: u32 = 7;
const CMD_RMDIR: u32 = 8;
const CMD_MKNOD: u32 = 9;
const CMD_UNLINK: u32 = 10;
const CMD_RENAME: u32 = 11;
const CMD_TRUNCATE: u32 = 12;
const CMD_CHMOD: u32 = 13;
const CMD_CHOWN: u32 = 14;
const CMD_ISATTY: u32 = 15;
const CMD_TCGETATTR: u32 = 16;
const CMD_TCSETATTR: u32 = 17;
const CMD_RDLINK: u32 = 18;

// ── little-endian field helpers ─────────────────────────────────────

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

fn put_i64(buf: &mut [u8], off: usize, val: i64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().expect("4 bytes"))
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().expect("8 bytes"))
}

fn get_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(buf[off..off + 8].try_into().expect("8 bytes"))
}

// ── requests ────────────────────────────────────────────────────────

/// A request from the VFS to a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsReq {
    /// Look a name up in a directory; the name follows in the next iov
    /// segment (`name_sz` bytes).
    Lookup {
        /// Directory being searched.
        dir_inode_nr: i64,
        /// Length of the name segment.
        name_sz: u32,
    },
    /// The kernel dropped its last reference to an inode.
    Close {
        /// The inode released.
        inode_nr: i64,
    },
    /// Create a regular file in a directory.
    Create {
        /// Parent directory.
        dir_inode_nr: i64,
        /// Length of the name segment.
        name_sz: u32,
        /// Open flags from the caller.
        oflags: u32,
        /// Mode of the new file.
        mode: u32,
        /// Owner of the new file.
        uid: u32,
        /// Group of the new file.
        gid: u32,
    },
    /// Strategy read: fill the payload segment from the file.
    Read {
        /// File to read.
        inode_nr: i64,
        /// Byte offset.
        offset: u64,
        /// Requested size.
        sz: u64,
    },
    /// Strategy write: commit the payload segment to the file.
    Write {
        /// File to write.
        inode_nr: i64,
        /// Byte offset.
        offset: u64,
        /// Payload size.
        sz: u64,
    },
    /// Stream packed dirent records from a directory.
    ReadDir {
        /// Directory to list.
        inode_nr: i64,
        /// Opaque resume cookie (0 restarts).
        cookie: i64,
        /// Payload capacity.
        sz: u64,
    },
    /// Create a directory.
    MkDir {
        /// Parent directory.
        dir_inode_nr: i64,
        /// Length of the name segment.
        name_sz: u32,
        /// Mode of the new directory.
        mode: u32,
        /// Owner.
        uid: u32,
        /// Group.
        gid: u32,
    },
    /// Remove a directory.
    RmDir {
        /// Parent directory.
        dir_inode_nr: i64,
        /// Length of the name segment.
        name_sz: u32,
    },
    /// Create a node (device, fifo, mount cover).
    MkNod {
        /// Parent directory.
        dir_inode_nr: i64,
        /// Length of the name segment.
        name_sz: u32,
        /// Mode (type + permissions).
        mode: u32,
        /// Owner.
        uid: u32,
        /// Group.
        gid: u32,
    },
    /// Remove a name.
    Unlink {
        /// Parent directory.
        dir_inode_nr: i64,
        /// Length of the name segment.
        name_sz: u32,
    },
    /// Rename within the file system; both names follow in one segment,
    /// source first.
    Rename {
        /// Source directory.
        src_dir_inode_nr: i64,
        /// Destination directory.
        dst_dir_inode_nr: i64,
        /// Length of the source name.
        src_name_sz: u32,
        /// Length of the destination name.
        dst_name_sz: u32,
    },
    /// Set a file's size.
    Truncate {
        /// File to resize.
        inode_nr: i64,
        /// New size.
        size: u64,
    },
    /// Change permission bits.
    Chmod {
        /// Target inode.
        inode_nr: i64,
        /// New mode bits.
        mode: u32,
    },
    /// Change ownership.
    Chown {
        /// Target inode.
        inode_nr: i64,
        /// New owner.
        uid: u32,
        /// New group.
        gid: u32,
    },
    /// Is this a terminal device?
    IsATty {
        /// Target inode.
        inode_nr: i64,
    },
    /// Read terminal attributes into the payload segment.
    TcGetAttr {
        /// Target inode.
        inode_nr: i64,
    },
    /// Set terminal attributes from the payload segment.
    TcSetAttr {
        /// Target inode.
        inode_nr: i64,
    },
    /// Read a symlink's target into the payload segment.
    ReadLink {
        /// The symlink inode.
        inode_nr: i64,
        /// Payload capacity.
        sz: u64,
    },
}

impl FsReq {
    /// Encodes the request into its 64-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; FSREQ_SZ];
        match *self {
            Self::Lookup {
                dir_inode_nr,
                name_sz,
            } => {
                put_u32(&mut buf, 0, CMD_LOOKUP);
                put_i64(&mut buf, 8, dir_inode_nr);
                put_u32(&mut buf, 16, name_sz);
            }
            Self::Close { inode_nr } => {
                put_u32(&mut buf, 0, CMD_CLOSE);
                put_i64(&mut buf, 8, inode_nr);
            }
            Self::Create {
                dir_inode_nr,
                name_sz,
                oflags,
                mode,
                uid,
                gid,
            } => {
                put_u32(&mut buf, 0, CMD_CREATE);
                put_i64(&mut buf, 8, dir_inode_nr);
                put_u32(&mut buf, 16, name_sz);
                put_u32(&mut buf, 20, oflags);
                put_u32(&mut buf, 24, mode);
                put_u32(&mut buf, 28, uid);
                put_u32(&mut buf, 32, gid);
            }
            Self::Read {
                inode_nr,
                offset,
                sz,
            } => {
                put_u32(&mut buf, 0, CMD_READ);
                put_i64(&mut buf, 8, inode_nr);
                put_u64(&mut buf, 16, offset);
                put_u64(&mut buf, 24, sz);
            }
            Self::Write {
                inode_nr,
                offset,
                sz,
            } => {
                put_u32(&mut buf, 0, CMD_WRITE);
                put_i64(&mut buf, 8, inode_nr);
                put_u64(&mut buf, 16, offset);
                put_u64(&mut buf, 24, sz);
            }
            Self::ReadDir {
                inode_nr,
                cookie,
                sz,
            } => {
                put_u32(&mut buf, 0, CMD_READDIR);
                put_i64(&mut buf, 8, inode_nr);
                put_i64(&mut buf, 16, cookie);
                put_u64(&mut buf, 24, sz);
            }
            Self::MkDir {
                dir_inode_nr,
                name_sz,
                mode,
                uid,
                gid,
            } => {
                put_u32(&mut buf, 0, CMD_MKDIR);
                put_i64(&mut buf, 8, dir_inode_nr);
                put_u32(&mut buf, 16, name_sz);
                put_u32(&mut buf, 20, mode);
                put_u32(&mut buf, 24, uid);
                put_u32(&mut buf, 28, gid);
            }
            Self::RmDir {
                dir_inode_nr,
                name_sz,
            } => {
                put_u32(&mut buf, 0, CMD_RMDIR);
                put_i64(&mut buf, 8, dir_inode_nr);
                put_u32(&mut buf, 16, name_sz);
            }
            Self::MkNod {
                dir_inode_nr,
                name_sz,
                mode,
                uid,
                gid,
            } => {
                put_u32(&mut buf, 0, CMD_MKNOD);
                put_i64(&mut buf, 8, dir_inode_nr);
                put_u32(&mut buf, 16, name_sz);
                put_u32(&mut buf, 20, mode);
                put_u32(&mut buf, 24, uid);
                put_u32(&mut buf, 28, gid);
            }
            Self::Unlink {
                dir_inode_nr,
                name_sz,
            } => {
                put_u32(&mut buf, 0, CMD_UNLINK);
                put_i64(&mut buf, 8, dir_inode_nr);
                put_u32(&mut buf, 16, name_sz);
            }
            Self::Rename {
                src_dir_inode_nr,
                dst_dir_inode_nr,
                src_name_sz,
                dst_name_sz,
            } => {
                put_u32(&mut buf, 0, CMD_RENAME);
                put_i64(&mut buf, 8, src_dir_inode_nr);
                put_i64(&mut buf, 16, dst_dir_inode_nr);
                put_u32(&mut buf, 24, src_name_sz);
                put_u32(&mut buf, 28, dst_name_sz);
            }
            Self::Truncate { inode_nr, size } => {
                put_u32(&mut buf, 0, CMD_TRUNCATE);
                put_i64(&mut buf, 8, inode_nr);
                put_u64(&mut buf, 16, size);
            }
            Self::Chmod { inode_nr, mode } => {
                put_u32(&mut buf, 0, CMD_CHMOD);
                put_i64(&mut buf, 8, inode_nr);
                put_u32(&mut buf, 16, mode);
            }
            Self::Chown { inode_nr, uid, gid } => {
                put_u32(&mut buf, 0, CMD_CHOWN);
                put_i64(&mut buf, 8, inode_nr);
                put_u32(&mut buf, 16, uid);
                put_u32(&mut buf, 20, gid);
            }
            Self::IsATty { inode_nr } => {
                put_u32(&mut buf, 0, CMD_ISATTY);
                put_i64(&mut buf, 8, inode_nr);
            }
            Self::TcGetAttr { inode_nr } => {
                put_u32(&mut buf, 0, CMD_TCGETATTR);
                put_i64(&mut buf, 8, inode_nr);
            }
            Self::TcSetAttr { inode_nr } => {
                put_u32(&mut buf, 0, CMD_TCSETATTR);
                put_i64(&mut buf, 8, inode_nr);
            }
            Self::ReadLink { inode_nr, sz } => {
                put_u32(&mut buf, 0, CMD_RDLINK);
                put_i64(&mut buf, 8, inode_nr);
                put_u64(&mut buf, 16, sz);
            }
        }
        buf
    }

    /// Decodes a request from its wire form.
    ///
    /// # Errors
    ///
    /// `EINVAL` for short buffers or unknown commands.
    pub fn decode(buf: &[u8]) -> Result<Self, Errno> {
        if buf.len() < FSREQ_SZ {
            return Err(Errno::EINVAL);
        }
        let req = match get_u32(buf, 0) {
            CMD_LOOKUP => Self::Lookup {
                dir_inode_nr: get_i64(buf, 8),
                name_sz: get_u32(buf, 16),
            },
            CMD_CLOSE => Self::Close {
                inode_nr: get_i64(buf, 8),
            },
            CMD_CREATE => Self::Create {
                dir_inode_nr: get_i64(buf, 8),
                name_sz: get_u32(buf, 16),
                oflags: get_u32(buf, 20),
                mode: get_u32(buf, 24),
                uid: get_u32(buf, 28),
                gid: get_u32(buf, 32),
            },
            CMD_READ => Self::Read {
                inode_nr: get_i64(buf, 8),
                offset: get_u64(buf, 16),
                sz: get_u64(buf, 24),
            },
            CMD_WRITE => Self::Write {
                inode_nr: get_i64(buf, 8),
                offset: get_u64(buf, 16),
                sz: get_u64(buf, 24),
            },
            CMD_READDIR => Self::ReadDir {
                inode_nr: get_i64(buf, 8),
                cookie: get_i64(buf, 16),
                sz: get_u64(buf, 24),
            },
            CMD_MKDIR => Self::MkDir {
                dir_inode_nr: get_i64(buf, 8),
                name_sz: get_u32(buf, 16),
                mode: get_u32(buf, 20),
                uid: get_u32(buf, 24),
                gid: get_u32(buf, 28),
            },
            CMD_RMDIR => Self::RmDir {
                dir_inode_nr: get_i64(buf, 8),
                name_sz: get_u32(buf, 16),
            },
            CMD_MKNOD => Self::MkNod {
                dir_inode_nr: get_i64(buf, 8),
                name_sz: get_u32(buf, 16),
                mode: get_u32(buf, 20),
                uid: get_u32(buf, 24),
                gid: get_u32(buf, 28),
            },
            CMD_UNLINK => Self::Unlink {
                dir_inode_nr: get_i64(buf, 8),
                name_sz: get_u32(buf, 16),
            },
            CMD_RENAME => Self::Rename {
                src_dir_inode_nr: get_i64(buf, 8),
                dst_dir_inode_nr: get_i64(buf, 16),
                src_name_sz: get_u32(buf, 24),
                dst_name_sz: get_u32(buf, 28),
            },
            CMD_TRUNCATE => Self::Truncate {
                inode_nr: get_i64(buf, 8),
                size: get_u64(buf, 16),
            },
            CMD_CHMOD => Self::Chmod {
                inode_nr: get_i64(buf, 8),
                mode: get_u32(buf, 16),
            },
            CMD_CHOWN => Self::Chown {
                inode_nr: get_i64(buf, 8),
                uid: get_u32(buf, 16),
                gid: get_u32(buf, 20),
            },
            CMD_ISATTY => Self::IsATty {
                inode_nr: get_i64(buf, 8),
            },
            CMD_TCGETATTR => Self::TcGetAttr {
                inode_nr: get_i64(buf, 8),
            },
            CMD_TCSETATTR => Self::TcSetAttr {
                inode_nr: get_i64(buf, 8),
            },
            CMD_RDLINK => Self::ReadLink {
                inode_nr: get_i64(buf, 8),
                sz: get_u64(buf, 16),
            },
            _ => return Err(Errno::EINVAL),
        };
        Ok(req)
    }
}

// ── replies ─────────────────────────────────────────────────────────

/// Attribute block carried in replies that materialize an inode
/// (lookup, create, mkdir, mknod).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireAttr {
    /// The inode found or created.
    pub inode_nr: i64,
    /// File size in bytes.
    pub size: u64,
    /// Mode (type + permissions).
    pub mode: u32,
    /// Owner.
    pub uid: u32,
    /// Group.
    pub gid: u32,
    /// Hard link count.
    pub nlink: u32,
}

/// A server's reply to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsReply {
    /// Inode attributes (lookup/create/mkdir/mknod).
    Attr(WireAttr),
    /// Byte count (read/write).
    Size {
        /// Bytes transferred.
        nbytes: i64,
    },
    /// Dirent blob size plus resume cookie (readdir).
    DirEnts {
        /// Bytes of packed dirents in the payload.
        nbytes: i64,
        /// Cookie to resume the scan with.
        cookie: i64,
    },
    /// No payload (close/unlink/rename/...).
    Empty,
}

impl FsReply {
    /// Encodes the reply into its 64-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; FSREPLY_SZ];
        match *self {
            Self::Attr(attr) => {
                put_u32(&mut buf, 0, 1);
                put_i64(&mut buf, 8, attr.inode_nr);
                put_u64(&mut buf, 16, attr.size);
                put_u32(&mut buf, 24, attr.mode);
                put_u32(&mut buf, 28, attr.uid);
                put_u32(&mut buf, 32, attr.gid);
                put_u32(&mut buf, 36, attr.nlink);
            }
            Self::Size { nbytes } => {
                put_u32(&mut buf, 0, 2);
                put_i64(&mut buf, 8, nbytes);
            }
            Self::DirEnts { nbytes, cookie } => {
                put_u32(&mut buf, 0, 3);
                put_i64(&mut buf, 8, nbytes);
                put_i64(&mut buf, 16, cookie);
            }
            Self::Empty => {
                put_u32(&mut buf, 0, 4);
            }
        }
        buf
    }

    /// Decodes a reply from its wire form.
    ///
    /// # Errors
    ///
    /// `EIO` for short buffers or unknown discriminants: a malformed
    /// reply from a server degrades the operation.
    pub fn decode(buf: &[u8]) -> Result<Self, Errno> {
        if buf.len() < FSREPLY_SZ {
            return Err(Errno::EIO);
        }
        let reply = match get_u32(buf, 0) {
            1 => Self::Attr(WireAttr {
                inode_nr: get_i64(buf, 8),
                size: get_u64(buf, 16),
                mode: get_u32(buf, 24),
                uid: get_u32(buf, 28),
                gid: get_u32(buf, 32),
                nlink: get_u32(buf, 36),
            }),
            2 => Self::Size {
                nbytes: get_i64(buf, 8),
            },
            3 => Self::DirEnts {
                nbytes: get_i64(buf, 8),
                cookie: get_i64(buf, 16),
            },
            4 => Self::Empty,
            _ => return Err(Errno::EIO),
        };
        Ok(reply)
    }
}

// ── dirent packing ──────────────────────────────────────────────────

/// Fixed header bytes of a packed dirent before the name.
const DIRENT_HDR: usize = 18;

/// One directory entry from a readdir blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEnt {
    /// Inode of the entry.
    pub d_ino: i64,
    /// Cookie that resumes the scan *after* this entry.
    pub d_cookie: i64,
    /// Entry name.
    pub name: String,
}

/// Appends one 8-byte-aligned dirent record to `buf`. Returns `false`
/// (and leaves `buf` untouched) when the record would exceed `max`.
pub fn pack_dirent(buf: &mut Vec<u8>, max: usize, ino: i64, cookie: i64, name: &str) -> bool {
    let reclen = (DIRENT_HDR + name.len() + 1).div_ceil(8) * 8;
    if buf.len() + reclen > max {
        return false;
    }
    let base = buf.len();
    buf.resize(base + reclen, 0);
    put_i64(buf, base, ino);
    put_i64(buf, base + 8, cookie);
    buf[base + 16..base + 18].copy_from_slice(&(reclen as u16).to_le_bytes());
    buf[base + DIRENT_HDR..base + DIRENT_HDR + name.len()].copy_from_slice(name.as_bytes());
    true
}

/// Parses a packed dirent blob into entries.
///
/// # Errors
///
/// `EIO` on truncated or misaligned records.
pub fn unpack_dirents(blob: &[u8]) -> Result<Vec<DirEnt>, Errno> {
    let mut entries = Vec::new();
    let mut off = 0;
    while off + DIRENT_HDR <= blob.len() {
        let reclen = u16::from_le_bytes(blob[off + 16..off + 18].try_into().expect("2 bytes"))
            as usize;
        if reclen < DIRENT_HDR || reclen % 8 != 0 || off + reclen > blob.len() {
            return Err(Errno::EIO);
        }
        let name_bytes = &blob[off + DIRENT_HDR..off + reclen];
        let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = core::str::from_utf8(&name_bytes[..name_end])
            .map_err(|_| Errno::EIO)?;
        entries.push(DirEnt {
            d_ino: get_i64(blob, off),
            d_cookie: get_i64(blob, off + 8),
            name: String::from(name),
        });
        off += reclen;
    }
    if off != blob.len() {
        return Err(Errno::EIO);
    }
    Ok(entries)
}

// ── termios ─────────────────────────────────────────────────────────

/// Terminal attributes, as carried by `TCGETATTR` / `TCSETATTR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Termios {
    /// Input modes.
    pub c_iflag: u32,
    /// Output modes.
    pub c_oflag: u32,
    /// Control modes.
    pub c_cflag: u32,
    /// Local modes.
    pub c_lflag: u32,
    /// Control characters.
    pub c_cc: [u8; 20],
}

impl Termios {
    /// Encodes into the 36-byte wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TERMIOS_SZ];
        put_u32(&mut buf, 0, self.c_iflag);
        put_u32(&mut buf, 4, self.c_oflag);
        put_u32(&mut buf, 8, self.c_cflag);
        put_u32(&mut buf, 12, self.c_lflag);
        buf[16..36].copy_from_slice(&self.c_cc);
        buf
    }

    /// Decodes from the wire form.
    ///
    /// # Errors
    ///
    /// `EIO` on short buffers.
    pub fn decode(buf: &[u8]) -> Result<Self, Errno> {
        if buf.len() < TERMIOS_SZ {
            return Err(Errno::EIO);
        }
        let mut c_cc = [0u8; 20];
        c_cc.copy_from_slice(&buf[16..36]);
        Ok(Self {
            c_iflag: get_u32(buf, 0),
            c_oflag: get_u32(buf, 4),
            c_cflag: get_u32(buf, 8),
            c_lflag: get_u32(buf, 12),
            c_cc,
        })
    }
}
