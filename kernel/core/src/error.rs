//! Kernel error numbers.
//!
//! Every fallible kernel path returns `Result<T, Errno>`. Syscall shims
//! flatten that to an `isize` (non-negative value or `-errno`), and the
//! server wire protocol carries the same numbering in reply statuses.

use core::fmt;

/// POSIX-style error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted.
    EPERM = 1,
    /// No such file or directory.
    ENOENT = 2,
    /// No such process.
    ESRCH = 3,
    /// Interrupted system call.
    EINTR = 4,
    /// Input/output error.
    EIO = 5,
    /// No such device.
    ENODEV = 6,
    /// Bad file descriptor.
    EBADF = 9,
    /// No child processes.
    ECHILD = 10,
    /// Resource temporarily unavailable.
    EAGAIN = 11,
    /// Out of memory.
    ENOMEM = 12,
    /// Permission denied.
    EACCES = 13,
    /// Bad address.
    EFAULT = 14,
    /// Device or resource busy.
    EBUSY = 16,
    /// File exists.
    EEXIST = 17,
    /// Cross-device link.
    EXDEV = 18,
    /// Not a directory.
    ENOTDIR = 20,
    /// Is a directory.
    EISDIR = 21,
    /// Invalid argument.
    EINVAL = 22,
    /// Too many open files in system.
    ENFILE = 23,
    /// Too many open files.
    EMFILE = 24,
    /// Inappropriate ioctl for device.
    ENOTTY = 25,
    /// Broken pipe.
    EPIPE = 32,
    /// Illegal seek.
    ESPIPE = 29,
    /// Function not implemented.
    ENOSYS = 38,
    /// Directory not empty.
    ENOTEMPTY = 39,
    /// Too many levels of symbolic links.
    ELOOP = 40,
    /// File name too long.
    ENAMETOOLONG = 36,
    /// Operation not supported.
    ENOTSUP = 95,
    /// Connection timed out.
    ETIMEDOUT = 110,
}

impl Errno {
    /// Returns the positive errno value.
    pub const fn to_errno(self) -> i32 {
        self as i32
    }

    /// Maps a positive errno value back to an `Errno`.
    ///
    /// Unknown values fold to [`Errno::EIO`], matching how recoverable
    /// consistency errors degrade in this kernel.
    pub const fn from_errno(val: i32) -> Self {
        match val {
            1 => Self::EPERM,
            2 => Self::ENOENT,
            3 => Self::ESRCH,
            4 => Self::EINTR,
            5 => Self::EIO,
            6 => Self::ENODEV,
            9 => Self::EBADF,
            10 => Self::ECHILD,
            11 => Self::EAGAIN,
            12 => Self::ENOMEM,
            13 => Self::EACCES,
            14 => Self::EFAULT,
            16 => Self::EBUSY,
            17 => Self::EEXIST,
            18 => Self::EXDEV,
            20 => Self::ENOTDIR,
            21 => Self::EISDIR,
            22 => Self::EINVAL,
            23 => Self::ENFILE,
            24 => Self::EMFILE,
            25 => Self::ENOTTY,
            29 => Self::ESPIPE,
            32 => Self::EPIPE,
            36 => Self::ENAMETOOLONG,
            38 => Self::ENOSYS,
            39 => Self::ENOTEMPTY,
            40 => Self::ELOOP,
            95 => Self::ENOTSUP,
            110 => Self::ETIMEDOUT,
            _ => Self::EIO,
        }
    }

    /// Converts a syscall-style `isize` (`>= 0` value or `-errno`) into a
    /// `Result`.
    pub fn from_status(status: isize) -> Result<usize, Self> {
        if status >= 0 {
            Ok(status as usize)
        } else {
            Err(Self::from_errno(-(status as i32)))
        }
    }

    /// Flattens a `Result` into a syscall-style `isize`.
    pub fn to_status(result: Result<usize, Self>) -> isize {
        match result {
            Ok(val) => val as isize,
            Err(e) => -(e.to_errno() as isize),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_roundtrip() {
        for e in [
            Errno::EPERM,
            Errno::ENOENT,
            Errno::EINTR,
            Errno::EIO,
            Errno::EBADF,
            Errno::ENOMEM,
            Errno::EACCES,
            Errno::EBUSY,
            Errno::EEXIST,
            Errno::ENOTDIR,
            Errno::EISDIR,
            Errno::EINVAL,
            Errno::EMFILE,
            Errno::ENAMETOOLONG,
            Errno::ENOTEMPTY,
            Errno::ELOOP,
            Errno::ETIMEDOUT,
        ] {
            assert_eq!(Errno::from_errno(e.to_errno()), e);
        }
    }

    #[test]
    fn unknown_errno_degrades_to_eio() {
        assert_eq!(Errno::from_errno(9999), Errno::EIO);
    }

    #[test]
    fn status_conversion() {
        assert_eq!(Errno::from_status(42), Ok(42));
        assert_eq!(Errno::from_status(-2), Err(Errno::ENOENT));
        assert_eq!(Errno::to_status(Ok(7)), 7);
        assert_eq!(Errno::to_status(Err(Errno::EBADF)), -9);
    }
}
