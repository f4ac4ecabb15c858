//! POSIX error numbers.
//!
//! Kernel-internal routines return [`Result<T>`] and propagate failures
//! with `?`. The syscall boundary flattens a `Result` into an `isize`
//! whose negative range encodes the errno and whose non-negative range
//! encodes success (a count, an fd, an address).

use core::fmt;

/// A POSIX error number.
///
/// Discriminants match the Linux i386 ABI so the value can be handed to
/// user space unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
#[allow(missing_docs, reason = "the names are the documentation")]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EINTR = 4,
    EIO = 5,
    ENXIO = 6,
    E2BIG = 7,
    ENOEXEC = 8,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EFAULT = 14,
    ENOTBLK = 15,
    EBUSY = 16,
    EEXIST = 17,
    EXDEV = 18,
    ENODEV = 19,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    ENFILE = 23,
    EMFILE = 24,
    ENOTTY = 25,
    ETXTBSY = 26,
    EFBIG = 27,
    ENOSPC = 28,
    ESPIPE = 29,
    EROFS = 30,
    EMLINK = 31,
    EPIPE = 32,
    EDOM = 33,
    ERANGE = 34,
    EDEADLK = 35,
    ENAMETOOLONG = 36,
    ENOLCK = 37,
    ENOSYS = 38,
    ENOTEMPTY = 39,
    ELOOP = 40,
    /// Kernel-internal: restart the interrupted syscall. Never reaches
    /// user space; the dispatcher converts it to a rewound `int 0x80`
    /// or to [`Errno::EINTR`] depending on `SA_RESTART`.
    ERESTART = 512,
}

impl Errno {
    /// `EWOULDBLOCK` aliases `EAGAIN` on this ABI.
    pub const EWOULDBLOCK: Errno = Errno::EAGAIN;

    /// Returns the errno encoded as a negative `isize` for the syscall ABI.
    #[must_use]
    pub const fn as_neg(self) -> isize {
        -(self as isize)
    }

    /// Returns the symbolic name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::EPERM => "EPERM",
            Self::ENOENT => "ENOENT",
            Self::ESRCH => "ESRCH",
            Self::EINTR => "EINTR",
            Self::EIO => "EIO",
            Self::ENXIO => "ENXIO",
            Self::E2BIG => "E2BIG",
            Self::ENOEXEC => "ENOEXEC",
            Self::EBADF => "EBADF",
            Self::ECHILD => "ECHILD",
            Self::EAGAIN => "EAGAIN",
            Self::ENOMEM => "ENOMEM",
            Self::EACCES => "EACCES",
            Self::EFAULT => "EFAULT",
            Self::ENOTBLK => "ENOTBLK",
            Self::EBUSY => "EBUSY",
            Self::EEXIST => "EEXIST",
            Self::EXDEV => "EXDEV",
            Self::ENODEV => "ENODEV",
            Self::ENOTDIR => "ENOTDIR",
            Self::EISDIR => "EISDIR",
            Self::EINVAL => "EINVAL",
            Self::ENFILE => "ENFILE",
            Self::EMFILE => "EMFILE",
            Self::ENOTTY => "ENOTTY",
            Self::ETXTBSY => "ETXTBSY",
            Self::EFBIG => "EFBIG",
            Self::ENOSPC => "ENOSPC",
            Self::ESPIPE => "ESPIPE",
            Self::EROFS => "EROFS",
            Self::EMLINK => "EMLINK",
            Self::EPIPE => "EPIPE",
            Self::EDOM => "EDOM",
            Self::ERANGE => "ERANGE",
            Self::EDEADLK => "EDEADLK",
            Self::ENAMETOOLONG => "ENAMETOOLONG",
            Self::ENOLCK => "ENOLCK",
            Self::ENOSYS => "ENOSYS",
            Self::ENOTEMPTY => "ENOTEMPTY",
            Self::ELOOP => "ELOOP",
            Self::ERESTART => "ERESTART",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kernel-internal result type.
pub type Result<T> = core::result::Result<T, Errno>;

/// Flattens a `Result<usize>`-like value into the syscall ABI encoding.
#[must_use]
pub fn to_syscall_ret(res: Result<isize>) -> isize {
    match res {
        Ok(v) => v,
        Err(e) => e.as_neg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_values_match_linux_i386() {
        assert_eq!(Errno::EPERM as i32, 1);
        assert_eq!(Errno::ENOENT as i32, 2);
        assert_eq!(Errno::EAGAIN as i32, 11);
        assert_eq!(Errno::ENOSYS as i32, 38);
        assert_eq!(Errno::ELOOP as i32, 40);
        assert_eq!(Errno::EWOULDBLOCK, Errno::EAGAIN);
    }

    #[test]
    fn negative_encoding() {
        assert_eq!(Errno::EBADF.as_neg(), -9);
        assert_eq!(to_syscall_ret(Err(Errno::EINVAL)), -22);
        assert_eq!(to_syscall_ret(Ok(42)), 42);
    }
}
