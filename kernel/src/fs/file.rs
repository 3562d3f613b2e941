//! Open files
//!
//! An open file binds an inode, the access mode it was opened with, and
//! the current byte offset. Descriptors produced by `dup`/`fork` share
//! the same open file, so the offset lives behind a lock and moves for
//! every sharer at once.

use alloc::string::String;
use alloc::sync::Arc;

use spin::Mutex;

use super::namei;
use super::perm::{self, Access, Cred};
use super::{FileType, Inode, S_IFMT, S_IFREG};
use crate::error::{Errno, KResult};

// open(2) flag values (i386 ABI).
pub const O_RDONLY: u32 = 0o0;
pub const O_WRONLY: u32 = 0o1;
pub const O_RDWR: u32 = 0o2;
pub const O_ACCMODE: u32 = 0o3;
pub const O_CREAT: u32 = 0o100;
pub const O_EXCL: u32 = 0o200;
pub const O_NOCTTY: u32 = 0o400;
pub const O_TRUNC: u32 = 0o1000;
pub const O_APPEND: u32 = 0o2000;
pub const O_NONBLOCK: u32 = 0o4000;
pub const O_DIRECTORY: u32 = 0o200000;
pub const O_NOFOLLOW: u32 = 0o400000;
pub const O_CLOEXEC: u32 = 0o2000000;

/// Parsed access mode of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn from_flags(flags: u32) -> KResult<Self> {
        match flags & O_ACCMODE {
            O_RDONLY => Ok(Self::ReadOnly),
            O_WRONLY => Ok(Self::WriteOnly),
            O_RDWR => Ok(Self::ReadWrite),
            _ => Err(Errno::Einval),
        }
    }

    pub fn readable(self) -> bool {
        self != Self::WriteOnly
    }

    pub fn writable(self) -> bool {
        self != Self::ReadOnly
    }
}

/// Raw open flags kept on the file (append, nonblock).
pub type OpenFlags = u32;

/// lseek whence encodings.
pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// One open file, shared by every descriptor dup'd from it.
pub struct OpenFile {
    pub inode: Arc<Inode>,
    pub mode: AccessMode,
    pub flags: OpenFlags,
    /// Current byte offset; doubles as the readdir cursor for
    /// directories.
    pub offset: Mutex<u64>,
    /// Path the file was opened under (getcwd via fd, diagnostics).
    pub path: String,
}

impl core::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OpenFile").field("path", &self.path).finish()
    }
}

impl OpenFile {
    pub fn new(inode: Arc<Inode>, mode: AccessMode, flags: OpenFlags, path: String) -> Arc<Self> {
        Arc::new(Self {
            inode,
            mode,
            flags,
            offset: Mutex::new(0),
            path,
        })
    }

    /// Read from the current offset, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        if !self.mode.readable() {
            return Err(Errno::Ebadf);
        }
        if self.inode.is_dir() {
            return Err(Errno::Eisdir);
        }
        let mut offset = self.offset.lock();
        let n = self.inode.ops.read(&self.inode, *offset, buf)?;
        *offset += n as u64;
        Ok(n)
    }

    /// Write at the current offset (or the end with O_APPEND),
    /// advancing it.
    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        if !self.mode.writable() {
            return Err(Errno::Ebadf);
        }
        let mut offset = self.offset.lock();
        if self.flags & O_APPEND != 0 {
            *offset = self.inode.size();
        }
        let n = self.inode.ops.write(&self.inode, *offset, buf)?;
        *offset += n as u64;
        Ok(n)
    }

    /// Positioned read; the shared offset does not move.
    pub fn pread(&self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        if !self.mode.readable() {
            return Err(Errno::Ebadf);
        }
        self.inode.ops.read(&self.inode, pos, buf)
    }

    /// Reposition the offset. Pipes and FIFOs cannot seek.
    pub fn seek(&self, offset: i64, whence: i32) -> KResult<u64> {
        if matches!(
            self.inode.file_type(),
            Some(FileType::Fifo) | Some(FileType::Socket)
        ) {
            return Err(Errno::Espipe);
        }
        let mut cur = self.offset.lock();
        let base = match whence {
            SEEK_SET => 0,
            SEEK_CUR => *cur as i64,
            SEEK_END => self.inode.size() as i64,
            _ => return Err(Errno::Einval),
        };
        let target = base.checked_add(offset).ok_or(Errno::Einval)?;
        if target < 0 {
            return Err(Errno::Einval);
        }
        *cur = target as u64;
        Ok(*cur)
    }

    /// Read the next directory entry at the cursor.
    pub fn readdir(&self) -> KResult<Option<super::DirEntry>> {
        if !self.inode.is_dir() {
            return Err(Errno::Enotdir);
        }
        let mut offset = self.offset.lock();
        match self.inode.ops.readdir(&self.inode, *offset)? {
            Some((entry, next)) => {
                *offset = next;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }
}

/// Path-level open: resolution, permission enforcement, creation.
///
/// `create_mode` already has the caller's umask applied. Returns the
/// open file; installing it into a descriptor slot is the caller's job.
pub fn open(
    path: &str,
    flags: u32,
    create_mode: u32,
    cwd: Option<&str>,
    cred: &Cred,
) -> KResult<Arc<OpenFile>> {
    let mode = AccessMode::from_flags(flags)?;
    let resolved = if flags & O_NOFOLLOW != 0 {
        namei::resolve_no_follow(path, cwd, Some(cred))
    } else {
        namei::resolve(path, cwd, Some(cred))
    };

    let inode = match resolved {
        Ok(inode) => {
            if flags & (O_CREAT | O_EXCL) == O_CREAT | O_EXCL {
                return Err(Errno::Eexist);
            }
            inode
        }
        Err(Errno::Enoent) if flags & O_CREAT != 0 => {
            let (dir, name) = namei::resolve_parent(path, cwd, Some(cred))?;
            perm::check(&dir.attr.read(), cred, Access::Write, false)?;
            let file_mode = (create_mode & !S_IFMT) | S_IFREG;
            dir.ops.create(&dir, &name, file_mode, cred.euid, cred.egid)?
        }
        Err(e) => return Err(e),
    };

    if inode.is_symlink() {
        return Err(Errno::Eloop);
    }
    if flags & O_DIRECTORY != 0 && !inode.is_dir() {
        return Err(Errno::Enotdir);
    }
    if inode.is_dir() && mode.writable() {
        return Err(Errno::Eisdir);
    }

    {
        let attr = inode.attr.read();
        if mode.readable() {
            perm::check(&attr, cred, Access::Read, false)?;
        }
        if mode.writable() || flags & O_TRUNC != 0 {
            perm::check(&attr, cred, Access::Write, false)?;
        }
    }

    if flags & O_TRUNC != 0 && inode.file_type() == Some(FileType::Regular) {
        inode.ops.truncate(&inode, 0)?;
    }

    let normalized = namei::normalize(path, cwd.unwrap_or("/"))?;
    Ok(OpenFile::new(inode, mode, flags, normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_parsing() {
        assert_eq!(AccessMode::from_flags(O_RDONLY).unwrap(), AccessMode::ReadOnly);
        assert_eq!(
            AccessMode::from_flags(O_WRONLY | O_CREAT).unwrap(),
            AccessMode::WriteOnly
        );
        assert_eq!(AccessMode::from_flags(O_RDWR).unwrap(), AccessMode::ReadWrite);
        assert!(AccessMode::from_flags(3).is_err());
    }

    #[test]
    fn mode_capabilities() {
        assert!(AccessMode::ReadOnly.readable());
        assert!(!AccessMode::ReadOnly.writable());
        assert!(AccessMode::ReadWrite.readable());
        assert!(AccessMode::ReadWrite.writable());
    }
}
