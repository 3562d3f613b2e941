//! System-call dispatch
//!
//! A syscall arrives as `int 0x80` with the number in the accumulator
//! and up to six arguments in the remaining general registers. The
//! trap stub hands the saved frame here; the table below routes each
//! number to its typed handler and the result (or negative errno) goes
//! back in the accumulator. Unknown numbers return -ENOSYS.
//!
//! The numbers are the stable i386 subset this kernel's userland was
//! built against.

pub mod file;
pub mod id;
pub mod mem;
pub mod proc;
pub mod sig;
pub mod time;

use alloc::string::String;
use alloc::vec;

use crate::error::{Errno, KResult};
use crate::mm::paging::PageDir;
use crate::mm::{uaccess, VirtAddr, TASK_LOCAL_BOUND};
use crate::task::sched;

// Process control
pub const SYS_EXIT: u32 = 1;
pub const SYS_FORK: u32 = 2;
pub const SYS_READ: u32 = 3;
pub const SYS_WRITE: u32 = 4;
pub const SYS_OPEN: u32 = 5;
pub const SYS_CLOSE: u32 = 6;
pub const SYS_WAITPID: u32 = 7;
pub const SYS_CREAT: u32 = 8;
pub const SYS_LINK: u32 = 9;
pub const SYS_UNLINK: u32 = 10;
pub const SYS_EXECVE: u32 = 11;
pub const SYS_CHDIR: u32 = 12;
pub const SYS_TIME: u32 = 13;
pub const SYS_MKNOD: u32 = 14;
pub const SYS_CHMOD: u32 = 15;
pub const SYS_CHOWN: u32 = 16;
pub const SYS_LSEEK: u32 = 19;
pub const SYS_GETPID: u32 = 20;
pub const SYS_MOUNT: u32 = 21;
pub const SYS_UMOUNT: u32 = 22;
pub const SYS_SETUID: u32 = 23;
pub const SYS_GETUID: u32 = 24;
pub const SYS_PTRACE: u32 = 26;
pub const SYS_ALARM: u32 = 27;
pub const SYS_PAUSE: u32 = 29;
pub const SYS_UTIME: u32 = 30;
pub const SYS_ACCESS: u32 = 33;
pub const SYS_NICE: u32 = 34;
pub const SYS_SYNC: u32 = 36;
pub const SYS_KILL: u32 = 37;
pub const SYS_RENAME: u32 = 38;
pub const SYS_MKDIR: u32 = 39;
pub const SYS_RMDIR: u32 = 40;
pub const SYS_DUP: u32 = 41;
pub const SYS_PIPE: u32 = 42;
pub const SYS_TIMES: u32 = 43;
pub const SYS_BRK: u32 = 45;
pub const SYS_SETGID: u32 = 46;
pub const SYS_GETGID: u32 = 47;
pub const SYS_SIGNAL: u32 = 48;
pub const SYS_GETEUID: u32 = 49;
pub const SYS_GETEGID: u32 = 50;
pub const SYS_IOCTL: u32 = 54;
pub const SYS_FCNTL: u32 = 55;
pub const SYS_SETPGID: u32 = 57;
pub const SYS_UMASK: u32 = 60;
pub const SYS_CHROOT: u32 = 61;
pub const SYS_DUP2: u32 = 63;
pub const SYS_GETPPID: u32 = 64;
pub const SYS_GETPGRP: u32 = 65;
pub const SYS_SETSID: u32 = 66;
pub const SYS_SIGACTION: u32 = 67;
pub const SYS_SIGSUSPEND: u32 = 72;
pub const SYS_SIGPENDING: u32 = 73;
pub const SYS_SETHOSTNAME: u32 = 74;
pub const SYS_SETRLIMIT: u32 = 75;
pub const SYS_GETRLIMIT: u32 = 76;
pub const SYS_GETRUSAGE: u32 = 77;
pub const SYS_GETTIMEOFDAY: u32 = 78;
pub const SYS_SETTIMEOFDAY: u32 = 79;
pub const SYS_SYMLINK: u32 = 83;
pub const SYS_READLINK: u32 = 85;
pub const SYS_MMAP: u32 = 90;
pub const SYS_MUNMAP: u32 = 91;
pub const SYS_TRUNCATE: u32 = 92;
pub const SYS_FTRUNCATE: u32 = 93;
pub const SYS_FCHMOD: u32 = 94;
pub const SYS_FCHOWN: u32 = 95;
pub const SYS_GETPRIORITY: u32 = 96;
pub const SYS_SETPRIORITY: u32 = 97;
pub const SYS_STATFS: u32 = 99;
pub const SYS_SETITIMER: u32 = 104;
pub const SYS_GETITIMER: u32 = 105;
pub const SYS_STAT: u32 = 106;
pub const SYS_LSTAT: u32 = 107;
pub const SYS_FSTAT: u32 = 108;
pub const SYS_WAIT4: u32 = 114;
pub const SYS_SYSINFO: u32 = 116;
/// Restores the context saved by signal delivery; the trap layer
/// handles it before the table is consulted.
pub const SYS_SIGRETURN: u32 = 119;
pub const SYS_FSYNC: u32 = 118;
pub const SYS_SETDOMAINNAME: u32 = 121;
pub const SYS_UNAME: u32 = 122;
pub const SYS_MPROTECT: u32 = 125;
pub const SYS_SIGPROCMASK: u32 = 126;
pub const SYS_GETPGID: u32 = 132;
pub const SYS_FCHDIR: u32 = 133;
pub const SYS_SETFSUID: u32 = 138;
pub const SYS_SETFSGID: u32 = 139;
pub const SYS_GETDENTS: u32 = 141;
pub const SYS_GETSID: u32 = 147;
pub const SYS_FDATASYNC: u32 = 148;
pub const SYS_NANOSLEEP: u32 = 162;
pub const SYS_GETCWD: u32 = 183;
pub const SYS_SETXATTR: u32 = 226;
pub const SYS_GETXATTR: u32 = 229;
pub const SYS_LISTXATTR: u32 = 232;
pub const SYS_REMOVEXATTR: u32 = 235;
pub const SYS_OPENAT: u32 = 295;
pub const SYS_MKDIRAT: u32 = 296;
pub const SYS_MKNODAT: u32 = 297;
pub const SYS_FCHOWNAT: u32 = 298;
pub const SYS_UNLINKAT: u32 = 301;
pub const SYS_RENAMEAT: u32 = 302;
pub const SYS_LINKAT: u32 = 303;
pub const SYS_SYMLINKAT: u32 = 304;
pub const SYS_READLINKAT: u32 = 305;
pub const SYS_FCHMODAT: u32 = 306;
pub const SYS_FACCESSAT: u32 = 307;

/// One past the highest valid call number.
pub const NR_SYSCALLS: u32 = 308;

/// Special `openat`/`*at` descriptor meaning "relative to the cwd".
pub const AT_FDCWD: i32 = -100;

// ---------------------------------------------------------------------------
// User-memory helpers
// ---------------------------------------------------------------------------

/// Address space of the calling task.
pub fn current_dir() -> PageDir {
    sched::with_scheduler(|s| {
        s.task(s.current_pid())
            .map(|t| t.page_dir)
            .expect("current task missing")
    })
}

fn check_user_range(va: u32, len: usize) -> KResult<()> {
    let end = va.checked_add(len as u32).ok_or(Errno::Efault)?;
    if va == 0 || end > TASK_LOCAL_BOUND {
        return Err(Errno::Efault);
    }
    Ok(())
}

/// Copy bytes in from user space.
pub fn copy_from_user(va: u32, buf: &mut [u8]) -> KResult<()> {
    check_user_range(va, buf.len())?;
    uaccess::read_bytes(current_dir(), VirtAddr::new(va), buf)
}

/// Copy bytes out to user space.
pub fn copy_to_user(va: u32, buf: &[u8]) -> KResult<()> {
    check_user_range(va, buf.len())?;
    uaccess::write_bytes(current_dir(), VirtAddr::new(va), buf)
}

/// Read a user C string (paths, names).
pub fn user_cstring(va: u32) -> KResult<String> {
    check_user_range(va, 1)?;
    uaccess::read_cstring(current_dir(), VirtAddr::new(va), crate::fs::PATH_MAX)
}

/// Read one little-endian u32 from user space.
pub fn user_u32(va: u32) -> KResult<u32> {
    let mut buf = [0u8; 4];
    copy_from_user(va, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Write one little-endian u32 to user space.
pub fn put_user_u32(va: u32, value: u32) -> KResult<()> {
    copy_to_user(va, &value.to_le_bytes())
}

/// Read a NULL-terminated array of user string pointers (argv/envp).
pub fn user_string_array(va: u32, max: usize) -> KResult<alloc::vec::Vec<String>> {
    let mut out = alloc::vec::Vec::new();
    if va == 0 {
        return Ok(out);
    }
    for i in 0..max {
        let ptr = user_u32(va + (i * 4) as u32)?;
        if ptr == 0 {
            return Ok(out);
        }
        out.push(user_cstring(ptr)?);
    }
    Err(Errno::E2big)
}

/// Copy `buf` to user space through a bounce buffer sized by the
/// caller-provided capacity; returns the bytes written.
pub fn copy_out_limited(va: u32, cap: usize, data: &[u8]) -> KResult<usize> {
    let n = cap.min(data.len());
    copy_to_user(va, &data[..n])?;
    Ok(n)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Route one system call. Returns the accumulator value for user mode:
/// non-negative results or a negative errno in `-1..=-4095`.
pub fn dispatch(nr: u32, args: [u32; 6]) -> isize {
    let result = route(nr, args);
    match result {
        Ok(value) => value,
        Err(e) => e.as_neg(),
    }
}

fn route(nr: u32, a: [u32; 6]) -> KResult<isize> {
    if nr >= NR_SYSCALLS {
        return Err(Errno::Enosys);
    }
    match nr {
        SYS_EXIT => proc::sys_exit(a[0] as i32),
        SYS_FORK => proc::sys_fork(),
        SYS_READ => file::sys_read(a[0] as i32, a[1], a[2] as usize),
        SYS_WRITE => file::sys_write(a[0] as i32, a[1], a[2] as usize),
        SYS_OPEN => file::sys_open(a[0], a[1], a[2]),
        SYS_CLOSE => file::sys_close(a[0] as i32),
        SYS_WAITPID => proc::sys_waitpid(a[0] as i32, a[1], a[2] as i32),
        SYS_CREAT => file::sys_creat(a[0], a[1]),
        SYS_LINK => file::sys_link(a[0], a[1]),
        SYS_UNLINK => file::sys_unlink(a[0]),
        SYS_EXECVE => proc::sys_execve(a[0], a[1], a[2]),
        SYS_CHDIR => file::sys_chdir(a[0]),
        SYS_TIME => time::sys_time(a[0]),
        SYS_MKNOD => file::sys_mknod(a[0], a[1], a[2]),
        SYS_CHMOD => file::sys_chmod(a[0], a[1]),
        SYS_CHOWN => file::sys_chown(a[0], a[1], a[2]),
        SYS_LSEEK => file::sys_lseek(a[0] as i32, a[1] as i32 as i64, a[2] as i32),
        SYS_GETPID => proc::sys_getpid(),
        SYS_MOUNT => file::sys_mount(a[0], a[1], a[2], a[3]),
        SYS_UMOUNT => file::sys_umount(a[0]),
        SYS_SETUID => id::sys_setuid(a[0]),
        SYS_GETUID => id::sys_getuid(),
        SYS_PTRACE => Err(Errno::Enosys),
        SYS_ALARM => time::sys_alarm(a[0]),
        SYS_PAUSE => proc::sys_pause(),
        SYS_UTIME => file::sys_utime(a[0], a[1]),
        SYS_ACCESS => file::sys_access(a[0], a[1]),
        SYS_NICE => id::sys_nice(a[0] as i32),
        SYS_SYNC => file::sys_sync(),
        SYS_KILL => sig::sys_kill(a[0] as i32, a[1] as i32),
        SYS_RENAME => file::sys_rename(a[0], a[1]),
        SYS_MKDIR => file::sys_mkdir(a[0], a[1]),
        SYS_RMDIR => file::sys_rmdir(a[0]),
        SYS_DUP => file::sys_dup(a[0] as i32),
        SYS_PIPE => file::sys_pipe(a[0]),
        SYS_TIMES => time::sys_times(a[0]),
        SYS_BRK => mem::sys_brk(a[0]),
        SYS_SETGID => id::sys_setgid(a[0]),
        SYS_GETGID => id::sys_getgid(),
        SYS_SIGNAL => sig::sys_signal(a[0] as i32, a[1]),
        SYS_GETEUID => id::sys_geteuid(),
        SYS_GETEGID => id::sys_getegid(),
        SYS_IOCTL => file::sys_ioctl(a[0] as i32, a[1], a[2]),
        SYS_FCNTL => file::sys_fcntl(a[0] as i32, a[1], a[2]),
        SYS_SETPGID => id::sys_setpgid(a[0] as i32, a[1] as i32),
        SYS_UMASK => file::sys_umask(a[0]),
        SYS_CHROOT => Err(Errno::Enosys),
        SYS_DUP2 => file::sys_dup2(a[0] as i32, a[1] as i32),
        SYS_GETPPID => proc::sys_getppid(),
        SYS_GETPGRP => id::sys_getpgid(0),
        SYS_SETSID => id::sys_setsid(),
        SYS_SIGACTION => sig::sys_sigaction(a[0] as i32, a[1], a[2]),
        SYS_SIGSUSPEND => sig::sys_sigsuspend(a[0]),
        SYS_SIGPENDING => sig::sys_sigpending(a[0]),
        SYS_SETHOSTNAME => id::sys_sethostname(a[0], a[1] as usize),
        SYS_SETRLIMIT => id::sys_setrlimit(a[0], a[1]),
        SYS_GETRLIMIT => id::sys_getrlimit(a[0], a[1]),
        SYS_GETRUSAGE => time::sys_getrusage(a[0] as i32, a[1]),
        SYS_GETTIMEOFDAY => time::sys_gettimeofday(a[0], a[1]),
        SYS_SETTIMEOFDAY => time::sys_settimeofday(a[0], a[1]),
        SYS_SYMLINK => file::sys_symlink(a[0], a[1]),
        SYS_READLINK => file::sys_readlink(a[0], a[1], a[2] as usize),
        SYS_MMAP => mem::sys_mmap(a[0], a[1] as usize, a[2], a[3], a[4] as i32, a[5]),
        SYS_MUNMAP => mem::sys_munmap(a[0], a[1] as usize),
        SYS_TRUNCATE => file::sys_truncate(a[0], a[1]),
        SYS_FTRUNCATE => file::sys_ftruncate(a[0] as i32, a[1]),
        SYS_FCHMOD => file::sys_fchmod(a[0] as i32, a[1]),
        SYS_FCHOWN => file::sys_fchown(a[0] as i32, a[1], a[2]),
        SYS_GETPRIORITY => id::sys_getpriority(),
        SYS_SETPRIORITY => id::sys_setpriority(a[2] as i32),
        SYS_STATFS => file::sys_statfs(a[0], a[1]),
        SYS_SETITIMER => time::sys_setitimer(a[0] as i32, a[1], a[2]),
        SYS_GETITIMER => time::sys_getitimer(a[0] as i32, a[1]),
        SYS_STAT => file::sys_stat(a[0], a[1], true),
        SYS_LSTAT => file::sys_stat(a[0], a[1], false),
        SYS_FSTAT => file::sys_fstat(a[0] as i32, a[1]),
        SYS_WAIT4 => proc::sys_wait4(a[0] as i32, a[1], a[2] as i32, a[3]),
        SYS_SYSINFO => Err(Errno::Enosys),
        // Only reachable outside the trap path (which restores the
        // frame itself); a stray call is an error.
        SYS_SIGRETURN => Err(Errno::Einval),
        SYS_FSYNC => file::sys_fsync(a[0] as i32),
        SYS_SETDOMAINNAME => id::sys_setdomainname(a[0], a[1] as usize),
        SYS_UNAME => id::sys_uname(a[0]),
        SYS_MPROTECT => mem::sys_mprotect(a[0], a[1] as usize, a[2]),
        SYS_SIGPROCMASK => sig::sys_sigprocmask(a[0] as i32, a[1], a[2]),
        SYS_GETPGID => id::sys_getpgid(a[0] as i32),
        SYS_FCHDIR => file::sys_fchdir(a[0] as i32),
        SYS_SETFSUID => id::sys_setfsuid(a[0]),
        SYS_SETFSGID => id::sys_setfsgid(a[0]),
        SYS_GETDENTS => file::sys_getdents(a[0] as i32, a[1], a[2] as usize),
        SYS_GETSID => id::sys_getsid(a[0] as i32),
        SYS_FDATASYNC => file::sys_fsync(a[0] as i32),
        SYS_NANOSLEEP => time::sys_nanosleep(a[0], a[1]),
        SYS_GETCWD => file::sys_getcwd(a[0], a[1] as usize),
        SYS_SETXATTR => file::sys_setxattr(a[0], a[1], a[2], a[3] as usize, a[4] as i32),
        SYS_GETXATTR => file::sys_getxattr(a[0], a[1], a[2], a[3] as usize),
        SYS_LISTXATTR => file::sys_listxattr(a[0], a[1], a[2] as usize),
        SYS_REMOVEXATTR => file::sys_removexattr(a[0], a[1]),
        SYS_OPENAT => file::sys_openat(a[0] as i32, a[1], a[2], a[3]),
        SYS_MKDIRAT => file::sys_mkdirat(a[0] as i32, a[1], a[2]),
        SYS_MKNODAT => file::sys_mknodat(a[0] as i32, a[1], a[2], a[3]),
        SYS_FCHOWNAT => file::sys_fchownat(a[0] as i32, a[1], a[2], a[3]),
        SYS_UNLINKAT => file::sys_unlinkat(a[0] as i32, a[1], a[2]),
        SYS_RENAMEAT => file::sys_renameat(a[0] as i32, a[1], a[2] as i32, a[3]),
        SYS_LINKAT => file::sys_linkat(a[0] as i32, a[1], a[2] as i32, a[3]),
        SYS_SYMLINKAT => file::sys_symlinkat(a[0], a[1] as i32, a[2]),
        SYS_READLINKAT => file::sys_readlinkat(a[0] as i32, a[1], a[2], a[3] as usize),
        SYS_FCHMODAT => file::sys_fchmodat(a[0] as i32, a[1], a[2]),
        SYS_FACCESSAT => file::sys_faccessat(a[0] as i32, a[1], a[2]),
        _ => Err(Errno::Enosys),
    }
}

/// Resolve an `*at` directory descriptor to a base path for relative
/// lookups.
pub fn at_base(dirfd: i32, path: &str) -> KResult<String> {
    if path.starts_with('/') || dirfd == AT_FDCWD {
        return Ok(crate::process::current_cwd());
    }
    let file = crate::process::with_current(|p| p.file(dirfd as usize))??;
    if !file.inode.is_dir() {
        return Err(Errno::Enotdir);
    }
    Ok(file.path.clone())
}

/// Bounce buffer for syscall reads.
pub(crate) fn bounce(len: usize) -> alloc::vec::Vec<u8> {
    vec![0u8; len.min(64 * 1024)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_numbers_are_enosys() {
        crate::process::testutil::boot(400);
        assert_eq!(dispatch(307 + 1, [0; 6]), Errno::Enosys.as_neg());
        assert_eq!(dispatch(99999, [0; 6]), Errno::Enosys.as_neg());
        assert_eq!(dispatch(SYS_PTRACE, [0; 6]), Errno::Enosys.as_neg());
    }

    #[test]
    fn getpid_dispatches() {
        crate::process::testutil::boot(400);
        assert_eq!(dispatch(SYS_GETPID, [0; 6]), 0);
    }

    #[test]
    fn null_user_pointers_fault() {
        crate::process::testutil::boot(400);
        let mut buf = [0u8; 4];
        assert_eq!(copy_from_user(0, &mut buf), Err(Errno::Efault));
        assert_eq!(copy_to_user(0, &buf), Err(Errno::Efault));
        // Kernel-range addresses fault too.
        assert_eq!(copy_to_user(0xF800_0000, &buf), Err(Errno::Efault));
    }
}
