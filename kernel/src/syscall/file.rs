//! File and filesystem system calls

use alloc::string::String;
use alloc::sync::Arc;

use crate::error::{Errno, KResult};
use crate::fs::file::{self, OpenFile, O_CLOEXEC};
use crate::fs::perm::{self, Access, Cred};
use crate::fs::{self, namei, FileType, Inode, MountFlags, S_IFMT};
use crate::process::{self, Fd};

use super::{
    at_base, copy_from_user, copy_to_user, put_user_u32, user_cstring,
};

fn cred() -> Cred {
    process::current_cred()
}

fn cwd() -> String {
    process::current_cwd()
}

fn fd_file(fd: i32) -> KResult<Arc<OpenFile>> {
    if fd < 0 {
        return Err(Errno::Ebadf);
    }
    process::with_current(|p| p.file(fd as usize))?
}

fn install_fd(file: Arc<OpenFile>, cloexec: bool) -> KResult<isize> {
    process::with_current(|p| {
        let fd = p.free_fd(0)?;
        p.files[fd] = Some(Fd { file, cloexec });
        Ok(fd as isize)
    })?
}

fn resolve(path: &str) -> KResult<Arc<Inode>> {
    namei::resolve(path, Some(&cwd()), Some(&cred()))
}

fn resolve_no_follow(path: &str) -> KResult<Arc<Inode>> {
    namei::resolve_no_follow(path, Some(&cwd()), Some(&cred()))
}

/// Persist attribute changes made through a live handle.
fn flush_attrs(inode: &Arc<Inode>) -> KResult<()> {
    inode.mark_dirty();
    if let Some(sb) = &inode.sb {
        sb.ops.write_inode(inode)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Descriptor IO
// ---------------------------------------------------------------------------

pub fn sys_read(fd: i32, buf_ptr: u32, len: usize) -> KResult<isize> {
    let file = fd_file(fd)?;
    let mut buf = super::bounce(len);
    let n = file.read(&mut buf)?;
    copy_to_user(buf_ptr, &buf[..n])?;
    Ok(n as isize)
}

pub fn sys_write(fd: i32, buf_ptr: u32, len: usize) -> KResult<isize> {
    let file = fd_file(fd)?;
    let mut buf = super::bounce(len);
    copy_from_user(buf_ptr, &mut buf)?;
    let n = file.write(&buf)?;
    Ok(n as isize)
}

pub fn sys_open(path_ptr: u32, flags: u32, mode: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    open_common(&path, flags, mode, &cwd())
}

fn open_common(path: &str, flags: u32, mode: u32, base: &str) -> KResult<isize> {
    let umask = process::with_current(|p| p.umask).unwrap_or(0o022);
    let file = file::open(path, flags, mode & !umask, Some(base), &cred())?;
    install_fd(file, flags & O_CLOEXEC != 0)
}

pub fn sys_creat(path_ptr: u32, mode: u32) -> KResult<isize> {
    sys_open(
        path_ptr,
        file::O_CREAT | file::O_WRONLY | file::O_TRUNC,
        mode,
    )
}

pub fn sys_close(fd: i32) -> KResult<isize> {
    process::with_current(|p| {
        if fd < 0 || fd as usize >= p.files.len() || p.files[fd as usize].is_none() {
            return Err(Errno::Ebadf);
        }
        p.files[fd as usize] = None;
        Ok(0)
    })?
}

pub fn sys_lseek(fd: i32, offset: i64, whence: i32) -> KResult<isize> {
    let file = fd_file(fd)?;
    file.seek(offset, whence).map(|pos| pos as isize)
}

pub fn sys_dup(fd: i32) -> KResult<isize> {
    let file = fd_file(fd)?;
    install_fd(file, false)
}

pub fn sys_dup2(old: i32, new: i32) -> KResult<isize> {
    let file = fd_file(old)?;
    if new < 0 || new as usize >= process::FD_LIMIT {
        return Err(Errno::Ebadf);
    }
    if old == new {
        return Ok(new as isize);
    }
    process::with_current(|p| {
        p.files[new as usize] = Some(Fd {
            file,
            cloexec: false,
        });
    })?;
    Ok(new as isize)
}

// fcntl commands
const F_DUPFD: u32 = 0;
const F_GETFD: u32 = 1;
const F_SETFD: u32 = 2;
const F_GETFL: u32 = 3;
const F_SETFL: u32 = 4;
const FD_CLOEXEC: u32 = 1;

pub fn sys_fcntl(fd: i32, cmd: u32, arg: u32) -> KResult<isize> {
    match cmd {
        F_DUPFD => {
            let file = fd_file(fd)?;
            process::with_current(|p| {
                let slot = p.free_fd(arg as usize)?;
                p.files[slot] = Some(Fd {
                    file,
                    cloexec: false,
                });
                Ok(slot as isize)
            })?
        }
        F_GETFD => process::with_current(|p| {
            p.files
                .get(fd as usize)
                .and_then(|s| s.as_ref())
                .map(|f| if f.cloexec { FD_CLOEXEC as isize } else { 0 })
                .ok_or(Errno::Ebadf)
        })?,
        F_SETFD => process::with_current(|p| {
            p.files
                .get_mut(fd as usize)
                .and_then(|s| s.as_mut())
                .map(|f| {
                    f.cloexec = arg & FD_CLOEXEC != 0;
                    0
                })
                .ok_or(Errno::Ebadf)
        })?,
        F_GETFL => {
            let file = fd_file(fd)?;
            Ok(file.flags as isize)
        }
        F_SETFL => {
            // Only the append and nonblock bits are mutable, and the
            // open-file flags are fixed at open in this kernel.
            fd_file(fd)?;
            let _ = arg;
            Ok(0)
        }
        _ => Err(Errno::Einval),
    }
}

pub fn sys_ioctl(fd: i32, cmd: u32, arg: u32) -> KResult<isize> {
    let file = fd_file(fd)?;
    file.inode
        .ops
        .ioctl(&file.inode, cmd, arg)
        .map(|v| v as isize)
}

pub fn sys_pipe(fds_ptr: u32) -> KResult<isize> {
    let me = cred();
    let (r, w) = fs::pipe::create_pipe(me.euid, me.egid)?;
    let rfd = install_fd(r, false)?;
    let wfd = match install_fd(w, false) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = process::with_current(|p| p.files[rfd as usize] = None);
            return Err(e);
        }
    };
    put_user_u32(fds_ptr, rfd as u32)?;
    put_user_u32(fds_ptr + 4, wfd as u32)?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Namespace operations
// ---------------------------------------------------------------------------

pub fn sys_link(old_ptr: u32, new_ptr: u32) -> KResult<isize> {
    let old = user_cstring(old_ptr)?;
    let new = user_cstring(new_ptr)?;
    link_common(&old, &new, &cwd())
}

fn link_common(old: &str, new: &str, base: &str) -> KResult<isize> {
    let cred = cred();
    let src = namei::resolve(old, Some(base), Some(&cred))?;
    let (dir, name) = namei::resolve_parent(new, Some(base), Some(&cred))?;
    perm::check(&dir.attr.read(), &cred, Access::Write, false)?;
    dir.ops.link(&src, &dir, &name)?;
    Ok(0)
}

pub fn sys_unlink(path_ptr: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    unlink_common(&path, &cwd())
}

fn unlink_common(path: &str, base: &str) -> KResult<isize> {
    let cred = cred();
    let (dir, name) = namei::resolve_parent(path, Some(base), Some(&cred))?;
    perm::check(&dir.attr.read(), &cred, Access::Write, false)?;
    dir.ops.unlink(&dir, &name)?;
    Ok(0)
}

pub fn sys_symlink(target_ptr: u32, link_ptr: u32) -> KResult<isize> {
    let target = user_cstring(target_ptr)?;
    let link = user_cstring(link_ptr)?;
    symlink_common(&target, &link, &cwd())
}

fn symlink_common(target: &str, link: &str, base: &str) -> KResult<isize> {
    let cred = cred();
    let (dir, name) = namei::resolve_parent(link, Some(base), Some(&cred))?;
    perm::check(&dir.attr.read(), &cred, Access::Write, false)?;
    dir.ops.symlink(&dir, &name, &target, cred.euid, cred.egid)?;
    Ok(0)
}

pub fn sys_readlink(path_ptr: u32, buf_ptr: u32, len: usize) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    readlink_common(&path, buf_ptr, len, &cwd())
}

fn readlink_common(path: &str, buf_ptr: u32, len: usize, base: &str) -> KResult<isize> {
    let inode = namei::resolve_no_follow(path, Some(base), Some(&cred()))?;
    let target = inode.ops.readlink(&inode)?;
    // readlink does not NUL-terminate.
    let n = super::copy_out_limited(buf_ptr, len, target.as_bytes())?;
    Ok(n as isize)
}

pub fn sys_rename(old_ptr: u32, new_ptr: u32) -> KResult<isize> {
    let old = user_cstring(old_ptr)?;
    let new = user_cstring(new_ptr)?;
    rename_common(&old, &new, &cwd())
}

fn rename_common(old: &str, new: &str, base: &str) -> KResult<isize> {
    let cred = cred();
    let (old_dir, old_name) = namei::resolve_parent(old, Some(base), Some(&cred))?;
    let (new_dir, new_name) = namei::resolve_parent(new, Some(base), Some(&cred))?;
    perm::check(&old_dir.attr.read(), &cred, Access::Write, false)?;
    perm::check(&new_dir.attr.read(), &cred, Access::Write, false)?;
    old_dir.ops.rename(&old_dir, &old_name, &new_dir, &new_name)?;
    Ok(0)
}

pub fn sys_mkdir(path_ptr: u32, mode: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    mkdir_common(&path, mode, &cwd())
}

fn mkdir_common(path: &str, mode: u32, base: &str) -> KResult<isize> {
    let cred = cred();
    let umask = process::with_current(|p| p.umask).unwrap_or(0o022);
    let (dir, name) = namei::resolve_parent(path, Some(base), Some(&cred))?;
    perm::check(&dir.attr.read(), &cred, Access::Write, false)?;
    dir.ops
        .mkdir(&dir, &name, mode & !umask & 0o7777, cred.euid, cred.egid)?;
    Ok(0)
}

pub fn sys_rmdir(path_ptr: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let cred = cred();
    let (dir, name) = namei::resolve_parent(&path, Some(&cwd()), Some(&cred))?;
    perm::check(&dir.attr.read(), &cred, Access::Write, false)?;
    dir.ops.rmdir(&dir, &name)?;
    Ok(0)
}

pub fn sys_mknod(path_ptr: u32, mode: u32, dev: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    mknod_common(&path, mode, dev, &cwd())
}

fn mknod_common(path: &str, mode: u32, dev: u32, base: &str) -> KResult<isize> {
    let cred = cred();
    if cred.euid != 0 {
        return Err(Errno::Eperm);
    }
    let (dir, name) = namei::resolve_parent(path, Some(base), Some(&cred))?;
    dir.ops.mknod(&dir, &name, mode, dev, cred.euid, cred.egid)?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

fn chmod_inode(inode: &Arc<Inode>, mode: u32) -> KResult<isize> {
    let cred = cred();
    {
        let mut attr = inode.attr.write();
        if cred.euid != 0 && cred.euid != attr.uid {
            return Err(Errno::Eperm);
        }
        attr.mode = (attr.mode & S_IFMT) | (mode & 0o7777);
        attr.ctime = crate::time::unix_time();
    }
    flush_attrs(inode)?;
    Ok(0)
}

fn chown_inode(inode: &Arc<Inode>, uid: u32, gid: u32) -> KResult<isize> {
    let cred = cred();
    if cred.euid != 0 {
        return Err(Errno::Eperm);
    }
    {
        let mut attr = inode.attr.write();
        if uid != u32::MAX {
            attr.uid = uid;
        }
        if gid != u32::MAX {
            attr.gid = gid;
        }
        attr.ctime = crate::time::unix_time();
    }
    flush_attrs(inode)?;
    Ok(0)
}

pub fn sys_chmod(path_ptr: u32, mode: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    chmod_inode(&resolve(&path)?, mode)
}

pub fn sys_fchmod(fd: i32, mode: u32) -> KResult<isize> {
    chmod_inode(&fd_file(fd)?.inode, mode)
}

pub fn sys_chown(path_ptr: u32, uid: u32, gid: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    chown_inode(&resolve(&path)?, uid, gid)
}

pub fn sys_fchown(fd: i32, uid: u32, gid: u32) -> KResult<isize> {
    chown_inode(&fd_file(fd)?.inode, uid, gid)
}

pub fn sys_utime(path_ptr: u32, times_ptr: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let inode = resolve(&path)?;
    let (atime, mtime) = if times_ptr == 0 {
        let now = crate::time::unix_time();
        (now, now)
    } else {
        let mut raw = [0u8; 8];
        copy_from_user(times_ptr, &mut raw)?;
        (
            i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
            i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as i64,
        )
    };
    {
        let mut attr = inode.attr.write();
        attr.atime = atime;
        attr.mtime = mtime;
    }
    flush_attrs(&inode)?;
    Ok(0)
}

pub fn sys_truncate(path_ptr: u32, length: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let inode = resolve(&path)?;
    perm::check(&inode.attr.read(), &cred(), Access::Write, false)?;
    inode.ops.truncate(&inode, length as u64)?;
    Ok(0)
}

pub fn sys_ftruncate(fd: i32, length: u32) -> KResult<isize> {
    let file = fd_file(fd)?;
    if !file.mode.writable() {
        return Err(Errno::Ebadf);
    }
    file.inode.ops.truncate(&file.inode, length as u64)?;
    Ok(0)
}

pub fn sys_access(path_ptr: u32, amode: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    access_common(&path, amode, &cwd())
}

fn access_common(path: &str, amode: u32, base: &str) -> KResult<isize> {
    let cred = cred();
    let inode = namei::resolve(path, Some(base), Some(&cred))?;
    let attr = inode.attr.read();
    // R_OK 4, W_OK 2, X_OK 1 checked against the real ids; F_OK (0) is
    // the resolution itself.
    if amode & 4 != 0 {
        perm::check(&attr, &cred, Access::Read, true)?;
    }
    if amode & 2 != 0 {
        perm::check(&attr, &cred, Access::Write, true)?;
    }
    if amode & 1 != 0 {
        perm::check(&attr, &cred, Access::Exec, true)?;
    }
    Ok(0)
}

pub fn sys_umask(mask: u32) -> KResult<isize> {
    process::with_current(|p| {
        let old = p.umask;
        p.umask = mask & 0o777;
        Ok(old as isize)
    })?
}

// ---------------------------------------------------------------------------
// stat family
// ---------------------------------------------------------------------------

/// Serialized `struct stat`: fixed little-endian layout, 88 bytes.
fn stat_bytes(inode: &Inode) -> [u8; 88] {
    let attr = inode.attr.read();
    let mut raw = [0u8; 88];
    let dev = inode.sb.as_ref().map(|sb| sb.magic).unwrap_or(0);
    raw[0..4].copy_from_slice(&dev.to_le_bytes());
    raw[4..8].copy_from_slice(&(inode.ino as u32).to_le_bytes());
    raw[8..12].copy_from_slice(&attr.mode.to_le_bytes());
    raw[12..16].copy_from_slice(&attr.nlink.to_le_bytes());
    raw[16..20].copy_from_slice(&attr.uid.to_le_bytes());
    raw[20..24].copy_from_slice(&attr.gid.to_le_bytes());
    raw[24..28].copy_from_slice(&attr.rdev.to_le_bytes());
    raw[32..40].copy_from_slice(&attr.size.to_le_bytes());
    let blksize = inode
        .sb
        .as_ref()
        .map(|sb| sb.block_size)
        .unwrap_or(crate::mm::PAGE_SIZE as u32);
    raw[40..44].copy_from_slice(&blksize.to_le_bytes());
    raw[48..56].copy_from_slice(&attr.blocks.to_le_bytes());
    raw[56..60].copy_from_slice(&(attr.atime as i32).to_le_bytes());
    raw[64..68].copy_from_slice(&(attr.mtime as i32).to_le_bytes());
    raw[72..76].copy_from_slice(&(attr.ctime as i32).to_le_bytes());
    raw
}

pub fn sys_stat(path_ptr: u32, stat_ptr: u32, follow: bool) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let inode = if follow {
        resolve(&path)?
    } else {
        resolve_no_follow(&path)?
    };
    copy_to_user(stat_ptr, &stat_bytes(&inode))?;
    Ok(0)
}

pub fn sys_fstat(fd: i32, stat_ptr: u32) -> KResult<isize> {
    let file = fd_file(fd)?;
    copy_to_user(stat_ptr, &stat_bytes(&file.inode))?;
    Ok(0)
}

pub fn sys_statfs(path_ptr: u32, buf_ptr: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let inode = resolve(&path)?;
    let sb = inode.sb.clone().ok_or(Errno::Enodev)?;
    let st = sb.ops.statfs(&sb)?;
    let mut raw = [0u8; 64];
    raw[0..4].copy_from_slice(&sb.magic.to_le_bytes());
    raw[4..8].copy_from_slice(&st.block_size.to_le_bytes());
    raw[8..16].copy_from_slice(&st.blocks.to_le_bytes());
    raw[16..24].copy_from_slice(&st.blocks_free.to_le_bytes());
    raw[24..32].copy_from_slice(&st.blocks_avail.to_le_bytes());
    raw[32..40].copy_from_slice(&st.files.to_le_bytes());
    raw[40..48].copy_from_slice(&st.files_free.to_le_bytes());
    raw[48..52].copy_from_slice(&st.name_max.to_le_bytes());
    copy_to_user(buf_ptr, &raw)?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

pub fn sys_chdir(path_ptr: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let cred = cred();
    let normalized = namei::normalize(&path, &cwd())?;
    let inode = namei::resolve(&normalized, None, Some(&cred))?;
    if !inode.is_dir() {
        return Err(Errno::Enotdir);
    }
    perm::check(&inode.attr.read(), &cred, Access::Exec, false)?;
    process::with_current(|p| {
        p.cwd = Some(inode.clone());
        p.cwd_path = normalized;
    })?;
    Ok(0)
}

pub fn sys_fchdir(fd: i32) -> KResult<isize> {
    let file = fd_file(fd)?;
    if !file.inode.is_dir() {
        return Err(Errno::Enotdir);
    }
    process::with_current(|p| {
        p.cwd = Some(file.inode.clone());
        p.cwd_path = file.path.clone();
    })?;
    Ok(0)
}

pub fn sys_getcwd(buf_ptr: u32, len: usize) -> KResult<isize> {
    let path = cwd();
    let bytes = path.as_bytes();
    if len < bytes.len() + 1 {
        return Err(Errno::Erange);
    }
    copy_to_user(buf_ptr, bytes)?;
    copy_to_user(buf_ptr + bytes.len() as u32, &[0])?;
    Ok(bytes.len() as isize + 1)
}

/// `struct linux_dirent` record: inode, next offset, record length,
/// NUL-terminated name, type byte last.
pub fn sys_getdents(fd: i32, buf_ptr: u32, len: usize) -> KResult<isize> {
    let file = fd_file(fd)?;
    if !file.inode.is_dir() {
        return Err(Errno::Enotdir);
    }
    // Smallest possible record: header plus a one-byte name.
    if len < 16 {
        return Err(Errno::Einval);
    }
    let mut written = 0usize;
    loop {
        let offset_before = *file.offset.lock();
        let Some(entry) = file.readdir()? else { break };
        let reclen = (8 + 2 + entry.name.len() + 2 + 3) & !3;
        if written + reclen > len {
            // Roll back the cursor; this entry goes in the next batch.
            *file.offset.lock() = offset_before;
            break;
        }
        let mut rec = alloc::vec![0u8; reclen];
        rec[0..4].copy_from_slice(&(entry.ino as u32).to_le_bytes());
        let next_off = *file.offset.lock() as u32;
        rec[4..8].copy_from_slice(&next_off.to_le_bytes());
        rec[8..10].copy_from_slice(&(reclen as u16).to_le_bytes());
        rec[10..10 + entry.name.len()].copy_from_slice(entry.name.as_bytes());
        rec[reclen - 1] = entry
            .file_type
            .map(|t| match t {
                FileType::Regular => 8,
                FileType::Directory => 4,
                FileType::CharDevice => 2,
                FileType::BlockDevice => 6,
                FileType::Fifo => 1,
                FileType::Socket => 12,
                FileType::Symlink => 10,
            })
            .unwrap_or(0);
        copy_to_user(buf_ptr + written as u32, &rec)?;
        written += reclen;
    }
    Ok(written as isize)
}

// ---------------------------------------------------------------------------
// Mounts and sync
// ---------------------------------------------------------------------------

pub fn sys_mount(source_ptr: u32, target_ptr: u32, type_ptr: u32, flags: u32) -> KResult<isize> {
    if cred().euid != 0 {
        return Err(Errno::Eperm);
    }
    let target = user_cstring(target_ptr)?;
    let fstype = user_cstring(type_ptr)?;
    let source = if source_ptr != 0 {
        Some(user_cstring(source_ptr)?)
    } else {
        None
    };
    let dev = match source.as_deref() {
        Some(path) if !path.is_empty() => {
            let name = path.rsplit('/').next().unwrap_or(path);
            Some(fs::blockdev::find_disk(name).ok_or(Errno::Enodev)?)
        }
        _ => None,
    };
    let mount_flags = MountFlags::from_bits_truncate(flags);
    fs::mount(&fstype, &target, dev, mount_flags, "")?;
    Ok(0)
}

pub fn sys_umount(target_ptr: u32) -> KResult<isize> {
    if cred().euid != 0 {
        return Err(Errno::Eperm);
    }
    let target = user_cstring(target_ptr)?;
    fs::unmount(&target)?;
    Ok(0)
}

pub fn sys_sync() -> KResult<isize> {
    fs::sync_all()?;
    Ok(0)
}

pub fn sys_fsync(fd: i32) -> KResult<isize> {
    let file = fd_file(fd)?;
    if let Some(sb) = &file.inode.sb {
        sb.ops.write_inode(&file.inode)?;
        sb.ops.sync(sb)?;
    }
    Ok(0)
}

// ---------------------------------------------------------------------------
// Extended attributes
// ---------------------------------------------------------------------------

pub fn sys_setxattr(
    path_ptr: u32,
    name_ptr: u32,
    value_ptr: u32,
    len: usize,
    flags: i32,
) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let name = user_cstring(name_ptr)?;
    let mut value = super::bounce(len);
    copy_from_user(value_ptr, &mut value)?;
    let inode = resolve(&path)?;
    perm::check(&inode.attr.read(), &cred(), Access::Write, false)?;
    inode.ops.setxattr(&inode, &name, &value, flags)?;
    Ok(0)
}

pub fn sys_getxattr(path_ptr: u32, name_ptr: u32, buf_ptr: u32, len: usize) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let name = user_cstring(name_ptr)?;
    let inode = resolve(&path)?;
    let value = inode.ops.getxattr(&inode, &name)?;
    if len == 0 {
        return Ok(value.len() as isize);
    }
    if len < value.len() {
        return Err(Errno::Erange);
    }
    copy_to_user(buf_ptr, &value)?;
    Ok(value.len() as isize)
}

pub fn sys_listxattr(path_ptr: u32, buf_ptr: u32, len: usize) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let inode = resolve(&path)?;
    let names = inode.ops.listxattr(&inode)?;
    let mut packed = alloc::vec::Vec::new();
    for name in names {
        packed.extend_from_slice(name.as_bytes());
        packed.push(0);
    }
    if len == 0 {
        return Ok(packed.len() as isize);
    }
    if len < packed.len() {
        return Err(Errno::Erange);
    }
    copy_to_user(buf_ptr, &packed)?;
    Ok(packed.len() as isize)
}

pub fn sys_removexattr(path_ptr: u32, name_ptr: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let name = user_cstring(name_ptr)?;
    let inode = resolve(&path)?;
    perm::check(&inode.attr.read(), &cred(), Access::Write, false)?;
    inode.ops.removexattr(&inode, &name)?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// *at variants
// ---------------------------------------------------------------------------

pub fn sys_openat(dirfd: i32, path_ptr: u32, flags: u32, mode: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let base = at_base(dirfd, &path)?;
    open_common(&path, flags, mode, &base)
}

pub fn sys_mkdirat(dirfd: i32, path_ptr: u32, mode: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let base = at_base(dirfd, &path)?;
    mkdir_common(&path, mode, &base)
}

pub fn sys_mknodat(dirfd: i32, path_ptr: u32, mode: u32, dev: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let base = at_base(dirfd, &path)?;
    mknod_common(&path, mode, dev, &base)
}

pub fn sys_fchownat(dirfd: i32, path_ptr: u32, uid: u32, gid: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let base = at_base(dirfd, &path)?;
    let inode = namei::resolve(&path, Some(&base), Some(&cred()))?;
    chown_inode(&inode, uid, gid)
}

/// unlinkat flag selecting rmdir behavior.
const AT_REMOVEDIR: u32 = 0x200;

pub fn sys_unlinkat(dirfd: i32, path_ptr: u32, flags: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let base = at_base(dirfd, &path)?;
    if flags & AT_REMOVEDIR != 0 {
        let cred = cred();
        let (dir, name) = namei::resolve_parent(&path, Some(&base), Some(&cred))?;
        perm::check(&dir.attr.read(), &cred, Access::Write, false)?;
        dir.ops.rmdir(&dir, &name)?;
        Ok(0)
    } else {
        unlink_common(&path, &base)
    }
}

pub fn sys_renameat(old_dirfd: i32, old_ptr: u32, new_dirfd: i32, new_ptr: u32) -> KResult<isize> {
    let old = user_cstring(old_ptr)?;
    let new = user_cstring(new_ptr)?;
    let old_base = at_base(old_dirfd, &old)?;
    let new_base = at_base(new_dirfd, &new)?;
    let cred = cred();
    let (old_dir, old_name) = namei::resolve_parent(&old, Some(&old_base), Some(&cred))?;
    let (new_dir, new_name) = namei::resolve_parent(&new, Some(&new_base), Some(&cred))?;
    old_dir.ops.rename(&old_dir, &old_name, &new_dir, &new_name)?;
    Ok(0)
}

pub fn sys_linkat(old_dirfd: i32, old_ptr: u32, new_dirfd: i32, new_ptr: u32) -> KResult<isize> {
    let old = user_cstring(old_ptr)?;
    let new = user_cstring(new_ptr)?;
    let old_base = at_base(old_dirfd, &old)?;
    let new_base = at_base(new_dirfd, &new)?;
    let cred = cred();
    let src = namei::resolve(&old, Some(&old_base), Some(&cred))?;
    let (dir, name) = namei::resolve_parent(&new, Some(&new_base), Some(&cred))?;
    dir.ops.link(&src, &dir, &name)?;
    Ok(0)
}

pub fn sys_symlinkat(target_ptr: u32, dirfd: i32, link_ptr: u32) -> KResult<isize> {
    let target = user_cstring(target_ptr)?;
    let link = user_cstring(link_ptr)?;
    let base = at_base(dirfd, &link)?;
    symlink_common(&target, &link, &base)
}

pub fn sys_readlinkat(dirfd: i32, path_ptr: u32, buf_ptr: u32, len: usize) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let base = at_base(dirfd, &path)?;
    readlink_common(&path, buf_ptr, len, &base)
}

pub fn sys_fchmodat(dirfd: i32, path_ptr: u32, mode: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let base = at_base(dirfd, &path)?;
    let inode = namei::resolve(&path, Some(&base), Some(&cred()))?;
    chmod_inode(&inode, mode)
}

pub fn sys_faccessat(dirfd: i32, path_ptr: u32, amode: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let base = at_base(dirfd, &path)?;
    access_common(&path, amode, &base)
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, SYS_CLOSE, SYS_GETCWD, SYS_OPEN, SYS_READ, SYS_WRITE};
    use super::*;
    use crate::fs::ext2::mkfs::{self, MkfsOptions};
    use crate::fs::RamDisk;
    use crate::mm::paging::PageFlags;
    use crate::mm::{paging, VirtAddr};
    use crate::process::testutil;

    fn boot_fs() {
        testutil::boot(900);
        fs::init();
        let disk = RamDisk::new("ram0", 512, 8192);
        mkfs::format(&*disk, MkfsOptions::default()).unwrap();
        fs::mount("ext2", "/", Some(disk), MountFlags::empty(), "").unwrap();
    }

    fn map_user_page(va: u32) {
        let dir = crate::syscall::current_dir();
        crate::mm::frame::with_allocator(|alloc| {
            let frame = alloc.alloc().unwrap();
            crate::mm::phys::zero_frame(frame);
            paging::map(
                alloc,
                dir,
                frame,
                VirtAddr::new(va),
                PageFlags::WRITABLE | PageFlags::USER,
            )
            .unwrap();
        });
    }

    fn put_cstr(va: u32, s: &str) {
        copy_to_user(va, s.as_bytes()).unwrap();
        copy_to_user(va + s.len() as u32, &[0]).unwrap();
    }

    #[test]
    fn open_write_read_via_dispatch() {
        boot_fs();
        let base = 0x0810_0000u32;
        map_user_page(base);
        put_cstr(base, "/hello.txt");
        copy_to_user(base + 0x100, b"kernel bytes").unwrap();

        let fd = dispatch(
            SYS_OPEN,
            [base, file::O_CREAT | file::O_RDWR, 0o644, 0, 0, 0],
        );
        assert!(fd >= 0);
        let n = dispatch(SYS_WRITE, [fd as u32, base + 0x100, 12, 0, 0, 0]);
        assert_eq!(n, 12);
        assert_eq!(dispatch(SYS_CLOSE, [fd as u32, 0, 0, 0, 0, 0]), 0);

        let fd = dispatch(SYS_OPEN, [base, file::O_RDONLY, 0, 0, 0, 0]);
        assert!(fd >= 0);
        let n = dispatch(SYS_READ, [fd as u32, base + 0x200, 64, 0, 0, 0]);
        assert_eq!(n, 12);
        let mut back = [0u8; 12];
        copy_from_user(base + 0x200, &mut back).unwrap();
        assert_eq!(&back, b"kernel bytes");
    }

    #[test]
    fn bad_descriptors_are_ebadf() {
        boot_fs();
        assert_eq!(
            dispatch(SYS_READ, [99, 0x0810_0000, 4, 0, 0, 0]),
            Errno::Ebadf.as_neg()
        );
        assert_eq!(dispatch(SYS_CLOSE, [99, 0, 0, 0, 0, 0]), Errno::Ebadf.as_neg());
    }

    #[test]
    fn dup_shares_offset() {
        boot_fs();
        let f = file::open(
            "/shared",
            file::O_CREAT | file::O_RDWR,
            0o644,
            None,
            &Cred::root(),
        )
        .unwrap();
        f.write(b"abcdef").unwrap();
        let fd = install_fd(f, false).unwrap();
        let dup = sys_dup(fd as i32).unwrap();
        assert_ne!(fd, dup);

        // Seek through one descriptor is visible through the other.
        sys_lseek(fd as i32, 2, crate::fs::file::SEEK_SET).unwrap();
        let via_dup = fd_file(dup as i32).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(via_dup.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"cd");
    }

    #[test]
    fn getcwd_and_chdir_round_trip() {
        boot_fs();
        let base = 0x0811_0000u32;
        map_user_page(base);
        let root = namei::resolve("/", None, None).unwrap();
        root.ops.mkdir(&root, "work", 0o755, 0, 0).unwrap();
        put_cstr(base, "/work");
        assert_eq!(dispatch(super::super::SYS_CHDIR, [base, 0, 0, 0, 0, 0]), 0);
        let n = dispatch(SYS_GETCWD, [base + 0x100, 64, 0, 0, 0, 0]);
        assert_eq!(n, 6); // "/work" + NUL
        let path = user_cstring(base + 0x100).unwrap();
        assert_eq!(path, "/work");
        // Relative resolution now uses the new cwd.
        let fd = dispatch(
            SYS_OPEN,
            [{
                put_cstr(base + 0x200, "rel.txt");
                base + 0x200
            }, file::O_CREAT | file::O_WRONLY, 0o644, 0, 0, 0],
        );
        assert!(fd >= 0);
        assert!(namei::resolve("/work/rel.txt", None, None).is_ok());
    }

    #[test]
    fn getdents_encodes_records() {
        boot_fs();
        let base = 0x0812_0000u32;
        map_user_page(base);
        for name in ["aa", "bb"] {
            let path = alloc::format!("/{}", name);
            file::open(
                &path,
                file::O_CREAT | file::O_WRONLY,
                0o644,
                None,
                &Cred::root(),
            )
            .unwrap();
        }
        put_cstr(base, "/");
        let fd = dispatch(SYS_OPEN, [base, file::O_RDONLY, 0, 0, 0, 0]);
        let n = dispatch(super::super::SYS_GETDENTS, [fd as u32, base + 0x100, 512, 0, 0, 0]);
        assert!(n > 0);
        // First record is ".": ino then reclen then the name.
        let mut rec = [0u8; 16];
        copy_from_user(base + 0x100, &mut rec).unwrap();
        let reclen = u16::from_le_bytes([rec[8], rec[9]]);
        assert!(reclen >= 12);
        assert_eq!(rec[10], b'.');
    }

    #[test]
    fn umask_applies_to_create() {
        boot_fs();
        process::with_current(|p| p.umask = 0o077).unwrap();
        let base = 0x0813_0000u32;
        map_user_page(base);
        put_cstr(base, "/masked");
        let fd = dispatch(
            SYS_OPEN,
            [base, file::O_CREAT | file::O_WRONLY, 0o666, 0, 0, 0],
        );
        assert!(fd >= 0);
        let inode = namei::resolve("/masked", None, None).unwrap();
        assert_eq!(inode.attr.read().mode & 0o777, 0o600);
    }
}
