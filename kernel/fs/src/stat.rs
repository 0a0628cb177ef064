//! File modes, types and the `stat` structure.
//!
//! Mode bits follow the POSIX layout so server binaries and libc agree on
//! them; `S_IFPORT` is this system's extra type for the server side of a
//! mount.

/// Mask of the file-type bits in a mode.
pub const S_IFMT: u32 = 0o170000;
/// FIFO (pipe).
pub const S_IFIFO: u32 = 0o010000;
/// Character device.
pub const S_IFCHR: u32 = 0o020000;
/// Directory.
pub const S_IFDIR: u32 = 0o040000;
/// Block device.
pub const S_IFBLK: u32 = 0o060000;
/// Regular file.
pub const S_IFREG: u32 = 0o100000;
/// Symbolic link.
pub const S_IFLNK: u32 = 0o120000;
/// Message-port (server-side v-node of a mount).
pub const S_IFPORT: u32 = 0o160000;

/// What a v-node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VnodeType {
    /// Regular file.
    Reg,
    /// Directory.
    Dir,
    /// Character device.
    Chr,
    /// Block device.
    Blk,
    /// FIFO / pipe.
    Fifo,
    /// Symbolic link.
    Lnk,
    /// Message port.
    Port,
}

impl VnodeType {
    /// Extracts the type from mode bits; unknown types read as regular
    /// files.
    pub fn from_mode(mode: u32) -> Self {
        match mode & S_IFMT {
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chr,
            S_IFBLK => Self::Blk,
            S_IFIFO => Self::Fifo,
            S_IFLNK => Self::Lnk,
            S_IFPORT => Self::Port,
            _ => Self::Reg,
        }
    }

    /// The `S_IF*` bits for this type.
    pub fn to_mode(self) -> u32 {
        match self {
            Self::Reg => S_IFREG,
            Self::Dir => S_IFDIR,
            Self::Chr => S_IFCHR,
            Self::Blk => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Lnk => S_IFLNK,
            Self::Port => S_IFPORT,
        }
    }
}

/// File status, as returned by `stat`/`fstat` and passed to `mount`,
/// `mknod` and `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// File type and permission bits.
    pub st_mode: u32,
    /// Owner.
    pub st_uid: u32,
    /// Group.
    pub st_gid: u32,
    /// Size in bytes.
    pub st_size: u64,
    /// Inode number.
    pub st_ino: i64,
    /// Number of hard links.
    pub st_nlink: u32,
    /// Access time (seconds).
    pub st_atime: u64,
    /// Modification time (seconds).
    pub st_mtime: u64,
    /// Change time (seconds).
    pub st_ctime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mode_roundtrip() {
        for t in [
            VnodeType::Reg,
            VnodeType::Dir,
            VnodeType::Chr,
            VnodeType::Blk,
            VnodeType::Fifo,
            VnodeType::Lnk,
            VnodeType::Port,
        ] {
            assert_eq!(VnodeType::from_mode(t.to_mode() | 0o755), t);
        }
    }

    #[test]
    fn permission_bits_are_preserved_alongside_type() {
        let mode = S_IFDIR | 0o755;
        assert_eq!(mode & !S_IFMT, 0o755);
        assert_eq!(VnodeType::from_mode(mode), VnodeType::Dir);
    }
}
