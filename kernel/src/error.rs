//! Kernel error type
//!
//! Every operation that can fail on behalf of user space returns a
//! [`Result`] carrying an [`Errno`]. The numeric values are the classic
//! i386 errno ABI; the syscall dispatcher encodes failures as negative
//! values in the accumulator on return to user mode.
//!
//! Errno is for expected failures only. Kernel invariant violations
//! (heap bracket corruption, impossible states) panic instead.

use core::fmt;

/// POSIX error numbers used by the kernel.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "errno values must be propagated or reported"]
pub enum Errno {
    /// Operation not permitted
    Eperm = 1,
    /// No such file or directory
    Enoent = 2,
    /// No such process
    Esrch = 3,
    /// Interrupted system call
    Eintr = 4,
    /// I/O error
    Eio = 5,
    /// No such device or address
    Enxio = 6,
    /// Argument list too long
    E2big = 7,
    /// Exec format error
    Enoexec = 8,
    /// Bad file descriptor
    Ebadf = 9,
    /// No child processes
    Echild = 10,
    /// Try again
    Eagain = 11,
    /// Out of memory
    Enomem = 12,
    /// Permission denied
    Eacces = 13,
    /// Bad address
    Efault = 14,
    /// Device or resource busy
    Ebusy = 16,
    /// File exists
    Eexist = 17,
    /// Cross-device link
    Exdev = 18,
    /// No such device
    Enodev = 19,
    /// Not a directory
    Enotdir = 20,
    /// Is a directory
    Eisdir = 21,
    /// Invalid argument
    Einval = 22,
    /// File table overflow
    Enfile = 23,
    /// Too many open files
    Emfile = 24,
    /// Not a typewriter
    Enotty = 25,
    /// File too large
    Efbig = 27,
    /// No space left on device
    Enospc = 28,
    /// Illegal seek
    Espipe = 29,
    /// Read-only file system
    Erofs = 30,
    /// Too many links
    Emlink = 31,
    /// Broken pipe
    Epipe = 32,
    /// Math argument out of domain of func
    Edom = 33,
    /// Math result not representable
    Erange = 34,
    /// File name too long
    Enametoolong = 36,
    /// No record locks available
    Enolck = 37,
    /// Function not implemented
    Enosys = 38,
    /// Directory not empty
    Enotempty = 39,
    /// Too many symbolic links encountered
    Eloop = 40,
    /// No data available
    Enodata = 61,
    /// Operation not supported
    Enotsup = 95,
}

impl Errno {
    /// Encode as the negative value placed in the accumulator for user
    /// space. Always in `-1..=-4095`.
    pub const fn as_neg(self) -> isize {
        -(self as i32 as isize)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Errno::Eperm => "EPERM",
            Errno::Enoent => "ENOENT",
            Errno::Esrch => "ESRCH",
            Errno::Eintr => "EINTR",
            Errno::Eio => "EIO",
            Errno::Enxio => "ENXIO",
            Errno::E2big => "E2BIG",
            Errno::Enoexec => "ENOEXEC",
            Errno::Ebadf => "EBADF",
            Errno::Echild => "ECHILD",
            Errno::Eagain => "EAGAIN",
            Errno::Enomem => "ENOMEM",
            Errno::Eacces => "EACCES",
            Errno::Efault => "EFAULT",
            Errno::Ebusy => "EBUSY",
            Errno::Eexist => "EEXIST",
            Errno::Exdev => "EXDEV",
            Errno::Enodev => "ENODEV",
            Errno::Enotdir => "ENOTDIR",
            Errno::Eisdir => "EISDIR",
            Errno::Einval => "EINVAL",
            Errno::Enfile => "ENFILE",
            Errno::Emfile => "EMFILE",
            Errno::Enotty => "ENOTTY",
            Errno::Efbig => "EFBIG",
            Errno::Enospc => "ENOSPC",
            Errno::Espipe => "ESPIPE",
            Errno::Erofs => "EROFS",
            Errno::Emlink => "EMLINK",
            Errno::Epipe => "EPIPE",
            Errno::Edom => "EDOM",
            Errno::Erange => "ERANGE",
            Errno::Enametoolong => "ENAMETOOLONG",
            Errno::Enolck => "ENOLCK",
            Errno::Enosys => "ENOSYS",
            Errno::Enotempty => "ENOTEMPTY",
            Errno::Eloop => "ELOOP",
            Errno::Enodata => "ENODATA",
            Errno::Enotsup => "ENOTSUP",
        };
        write!(f, "{}", name)
    }
}

/// Result alias used throughout the kernel.
pub type KResult<T> = Result<T, Errno>;
