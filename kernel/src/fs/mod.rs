//! Virtual filesystem layer
//!
//! The unified interface every concrete filesystem implements. Exactly
//! one level of dispatch: a [`FilesystemType`] constructs superblocks,
//! a [`SuperOps`] manages on-disk inodes for one mounted instance, and
//! an [`InodeOps`] carries the per-object operations. In-memory inodes
//! are shared-ownership handles ([`alloc::sync::Arc`]) with interior
//! mutability for the attributes and dirty flag; dropping the last
//! reference writes the inode back (or frees it on disk when its link
//! count reached zero).

pub mod blockdev;
pub mod devfs;
pub mod ext2;
pub mod file;
pub mod namei;
pub mod perm;
pub mod pipe;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use bitflags::bitflags;
use spin::{Mutex, RwLock};

use crate::error::{Errno, KResult};

pub use blockdev::{BlockDevice, RamDisk};
pub use file::{AccessMode, OpenFile, OpenFlags};

/// Maximum path length.
pub const PATH_MAX: usize = 4096;
/// Maximum length of one path component.
pub const NAME_MAX: usize = 255;
/// Symbolic links followed per resolution before ELOOP.
pub const SYMLOOP_MAX: usize = 8;
/// Slots in the filesystem-type table.
pub const FS_TABLE_SIZE: usize = 8;
/// Slots in the mount table.
pub const MOUNT_TABLE_SIZE: usize = 8;

// ---------------------------------------------------------------------------
// Mode bits
// ---------------------------------------------------------------------------

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;
pub const S_ISVTX: u32 = 0o1000;

pub const S_IRUSR: u32 = 0o400;
pub const S_IWUSR: u32 = 0o200;
pub const S_IXUSR: u32 = 0o100;
pub const S_IRGRP: u32 = 0o040;
pub const S_IWGRP: u32 = 0o020;
pub const S_IXGRP: u32 = 0o010;
pub const S_IROTH: u32 = 0o004;
pub const S_IWOTH: u32 = 0o002;
pub const S_IXOTH: u32 = 0o001;

/// Object kinds as encoded in the mode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Symlink,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Option<Self> {
        match mode & S_IFMT {
            S_IFREG => Some(Self::Regular),
            S_IFDIR => Some(Self::Directory),
            S_IFCHR => Some(Self::CharDevice),
            S_IFBLK => Some(Self::BlockDevice),
            S_IFIFO => Some(Self::Fifo),
            S_IFSOCK => Some(Self::Socket),
            S_IFLNK => Some(Self::Symlink),
            _ => None,
        }
    }

    pub fn to_mode(self) -> u32 {
        match self {
            Self::Regular => S_IFREG,
            Self::Directory => S_IFDIR,
            Self::CharDevice => S_IFCHR,
            Self::BlockDevice => S_IFBLK,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
            Self::Symlink => S_IFLNK,
        }
    }
}

bitflags! {
    /// Mount flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const RDONLY = 1 << 0;
        const NOEXEC = 1 << 3;
        const SYNCHRONOUS = 1 << 4;
        const NOATIME = 1 << 10;
    }
}

// ---------------------------------------------------------------------------
// In-memory objects
// ---------------------------------------------------------------------------

/// Mutable attributes of an in-memory inode.
#[derive(Debug, Clone, Default)]
pub struct InodeAttr {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    /// 512-byte sectors occupied.
    pub blocks: u64,
    /// Device number for char/block nodes.
    pub rdev: u32,
}

/// The in-memory representative of one filesystem object.
pub struct Inode {
    /// On-disk inode number (0 for anonymous objects such as pipes).
    pub ino: u64,
    /// Owning superblock; `None` for anonymous objects.
    pub sb: Option<Arc<Superblock>>,
    pub attr: RwLock<InodeAttr>,
    dirty: core::sync::atomic::AtomicBool,
    pub ops: Box<dyn InodeOps>,
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Inode").field("ino", &self.ino).finish()
    }
}

impl Inode {
    pub fn new(
        ino: u64,
        sb: Option<Arc<Superblock>>,
        attr: InodeAttr,
        ops: Box<dyn InodeOps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            sb,
            attr: RwLock::new(attr),
            dirty: core::sync::atomic::AtomicBool::new(false),
            ops,
        })
    }

    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_mode(self.attr.read().mode)
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == Some(FileType::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(FileType::Symlink)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, core::sync::atomic::Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, core::sync::atomic::Ordering::Release);
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.attr.read().size
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        let Some(sb) = self.sb.clone() else { return };
        sb.forget_inode(self.ino);
        let nlink = self.attr.read().nlink;
        if nlink == 0 {
            sb.ops.delete_inode(self);
        } else if self.is_dirty() {
            if let Err(e) = sb.ops.write_inode(self) {
                log::warn!("fs: writeback of inode {} failed: {}", self.ino, e);
            }
        }
    }
}

/// One entry produced by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub file_type: Option<FileType>,
}

/// Filesystem statistics (`statfs`).
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

// ---------------------------------------------------------------------------
// Capability traits
// ---------------------------------------------------------------------------

/// Per-object operations. A concrete filesystem implements these for its
/// inodes; defaults return the errno a filesystem without the capability
/// would.
#[allow(unused_variables)]
pub trait InodeOps: Send + Sync {
    fn lookup(&self, dir: &Inode, name: &str) -> KResult<Arc<Inode>> {
        Err(Errno::Enotdir)
    }

    fn create(
        &self,
        dir: &Inode,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> KResult<Arc<Inode>> {
        Err(Errno::Enotsup)
    }

    fn link(&self, src: &Arc<Inode>, dir: &Inode, name: &str) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    fn unlink(&self, dir: &Inode, name: &str) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    fn symlink(&self, dir: &Inode, name: &str, target: &str, uid: u32, gid: u32) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    fn readlink(&self, inode: &Inode) -> KResult<String> {
        Err(Errno::Einval)
    }

    fn mkdir(&self, dir: &Inode, name: &str, mode: u32, uid: u32, gid: u32) -> KResult<Arc<Inode>> {
        Err(Errno::Enotsup)
    }

    fn rmdir(&self, dir: &Inode, name: &str) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    fn mknod(
        &self,
        dir: &Inode,
        name: &str,
        mode: u32,
        rdev: u32,
        uid: u32,
        gid: u32,
    ) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    fn rename(
        &self,
        old_dir: &Inode,
        old_name: &str,
        new_dir: &Inode,
        new_name: &str,
    ) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    fn read(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        Err(Errno::Einval)
    }

    fn write(&self, inode: &Inode, offset: u64, buf: &[u8]) -> KResult<usize> {
        Err(Errno::Einval)
    }

    /// Read the entry at byte cursor `pos`; returns the entry and the
    /// next cursor, or `None` at end of directory.
    fn readdir(&self, dir: &Inode, pos: u64) -> KResult<Option<(DirEntry, u64)>> {
        Err(Errno::Enotdir)
    }

    fn truncate(&self, inode: &Inode, size: u64) -> KResult<()> {
        Err(Errno::Einval)
    }

    fn setxattr(&self, inode: &Inode, name: &str, value: &[u8], flags: i32) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    fn getxattr(&self, inode: &Inode, name: &str) -> KResult<Vec<u8>> {
        Err(Errno::Enotsup)
    }

    fn listxattr(&self, inode: &Inode) -> KResult<Vec<String>> {
        Err(Errno::Enotsup)
    }

    fn removexattr(&self, inode: &Inode, name: &str) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    fn ioctl(&self, inode: &Inode, cmd: u32, arg: u32) -> KResult<i32> {
        Err(Errno::Enotty)
    }
}

/// Per-superblock operations.
#[allow(unused_variables)]
pub trait SuperOps: Send + Sync {
    /// Construct the in-memory inode for `ino`, filled from disk.
    fn read_inode(&self, sb: &Arc<Superblock>, ino: u64) -> KResult<Arc<Inode>>;

    /// Flush a dirty inode back to disk.
    fn write_inode(&self, inode: &Inode) -> KResult<()> {
        Ok(())
    }

    /// Final disposal of an inode whose link count reached zero.
    fn delete_inode(&self, inode: &Inode) {}

    fn statfs(&self, sb: &Superblock) -> KResult<StatFs> {
        Err(Errno::Enotsup)
    }

    /// Flush all dirty filesystem state.
    fn sync(&self, sb: &Superblock) -> KResult<()> {
        Ok(())
    }

    fn remount(&self, sb: &Superblock, flags: MountFlags) -> KResult<()> {
        Err(Errno::Enotsup)
    }

    /// Clean unmount bookkeeping.
    fn unmount(&self, sb: &Superblock) -> KResult<()> {
        Ok(())
    }
}

/// A mounted filesystem instance.
pub struct Superblock {
    /// Filesystem magic (diagnostics only).
    pub magic: u32,
    pub block_size: u32,
    pub flags: RwLock<MountFlags>,
    /// Inode number of the filesystem root.
    pub root_ino: u64,
    pub ops: Box<dyn SuperOps>,
    /// Live in-memory inodes of this superblock, so every path to the
    /// same object shares one handle.
    icache: Mutex<BTreeMap<u64, Weak<Inode>>>,
}

impl Superblock {
    pub fn new(magic: u32, block_size: u32, flags: MountFlags, root_ino: u64, ops: Box<dyn SuperOps>) -> Arc<Self> {
        Arc::new(Self {
            magic,
            block_size,
            flags: RwLock::new(flags),
            root_ino,
            ops,
            icache: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.read().contains(MountFlags::RDONLY)
    }

    /// The shared in-memory inode for `ino`, reading it from disk on
    /// first use.
    pub fn inode(self: &Arc<Self>, ino: u64) -> KResult<Arc<Inode>> {
        if let Some(existing) = self.icache.lock().get(&ino).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let inode = self.ops.read_inode(self, ino)?;
        self.icache.lock().insert(ino, Arc::downgrade(&inode));
        Ok(inode)
    }

    /// The root inode.
    pub fn root(self: &Arc<Self>) -> KResult<Arc<Inode>> {
        self.inode(self.root_ino)
    }

    fn forget_inode(&self, ino: u64) {
        let mut cache = self.icache.lock();
        if let Some(slot) = cache.get(&ino) {
            if slot.upgrade().is_none() {
                cache.remove(&ino);
            }
        }
    }
}

/// A named filesystem implementation (one slot in the type table).
pub trait FilesystemType: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build a superblock for a mount of this type.
    fn mount(
        &self,
        dev: Option<Arc<dyn BlockDevice>>,
        flags: MountFlags,
        data: &str,
    ) -> KResult<Arc<Superblock>>;
}

// ---------------------------------------------------------------------------
// Mount and type tables
// ---------------------------------------------------------------------------

/// One mount-table slot.
pub struct Mount {
    pub point: String,
    pub sb: Arc<Superblock>,
    pub root: Arc<Inode>,
}

/// Kernel-wide VFS state: the fixed-size type and mount tables.
pub struct VfsState {
    types: Vec<&'static dyn FilesystemType>,
    mounts: Vec<Mount>,
}

impl VfsState {
    pub const fn new() -> Self {
        Self {
            types: Vec::new(),
            mounts: Vec::new(),
        }
    }
}

impl Default for VfsState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "none")]
mod global {
    use spin::Mutex;

    use super::VfsState;

    static VFS: Mutex<VfsState> = Mutex::new(VfsState::new());

    pub fn with<R>(f: impl FnOnce(&mut VfsState) -> R) -> R {
        f(&mut VFS.lock())
    }
}

#[cfg(not(target_os = "none"))]
mod global {
    use std::cell::RefCell;

    use super::VfsState;

    std::thread_local! {
        static VFS: RefCell<VfsState> = RefCell::new(VfsState::new());
    }

    pub fn with<R>(f: impl FnOnce(&mut VfsState) -> R) -> R {
        VFS.with(|v| f(&mut v.borrow_mut()))
    }
}

/// Register the built-in filesystem types (boot, or per-test setup).
pub fn init() {
    if let Err(e) = ext2::init() {
        log::warn!("vfs: ext2 registration failed: {}", e);
    }
    if let Err(e) = devfs::init() {
        log::warn!("vfs: devfs registration failed: {}", e);
    }
}

/// Register a filesystem type. EINVAL for empty names, ENOSPC when the
/// table is full, EEXIST for duplicate names.
pub fn register(fs: &'static dyn FilesystemType) -> KResult<()> {
    global::with(|vfs| {
        if fs.name().is_empty() {
            return Err(Errno::Einval);
        }
        if vfs.types.iter().any(|t| t.name() == fs.name()) {
            return Err(Errno::Eexist);
        }
        if vfs.types.len() == FS_TABLE_SIZE {
            return Err(Errno::Enospc);
        }
        vfs.types.push(fs);
        Ok(())
    })
}

/// Mount a filesystem of the named type at `point`.
///
/// The root mount uses `point == "/"`. Any other mount point must
/// resolve to an existing directory.
pub fn mount(
    type_name: &str,
    point: &str,
    dev: Option<Arc<dyn BlockDevice>>,
    flags: MountFlags,
    data: &str,
) -> KResult<()> {
    let fs = global::with(|vfs| {
        vfs.types
            .iter()
            .copied()
            .find(|t| t.name() == type_name)
            .ok_or(Errno::Enodev)
    })?;

    let point = namei::normalize(point, "/")?;
    if point != "/" {
        let dir = namei::resolve(&point, None, None)?;
        if !dir.is_dir() {
            return Err(Errno::Enotdir);
        }
    }
    if global::with(|vfs| vfs.mounts.iter().any(|m| m.point == point)) {
        return Err(Errno::Ebusy);
    }

    let sb = fs.mount(dev, flags, data)?;
    let root = sb.root()?;
    global::with(|vfs| {
        if vfs.mounts.len() == MOUNT_TABLE_SIZE {
            return Err(Errno::Enospc);
        }
        vfs.mounts.push(Mount {
            point,
            sb,
            root,
        });
        Ok(())
    })
}

/// Unmount the filesystem at `point`, flushing it first.
pub fn unmount(point: &str) -> KResult<()> {
    let point = namei::normalize(point, "/")?;
    let mount = global::with(|vfs| {
        // Refuse while another mount lives below this one.
        if vfs
            .mounts
            .iter()
            .any(|m| m.point != point && namei::is_prefix(&point, &m.point))
        {
            return Err(Errno::Ebusy);
        }
        let index = vfs
            .mounts
            .iter()
            .position(|m| m.point == point)
            .ok_or(Errno::Einval)?;
        Ok(vfs.mounts.remove(index))
    })?;
    mount.sb.ops.sync(&mount.sb)?;
    mount.sb.ops.unmount(&mount.sb)?;
    Ok(())
}

/// The mount whose point is the longest prefix of `path`, with the
/// remainder of the path relative to it.
pub fn mount_for<'p>(path: &'p str) -> KResult<(Arc<Superblock>, Arc<Inode>, &'p str)> {
    global::with(|vfs| {
        let mut best: Option<&Mount> = None;
        for m in &vfs.mounts {
            if namei::is_prefix(&m.point, path)
                && best.map_or(true, |b| m.point.len() > b.point.len())
            {
                best = Some(m);
            }
        }
        let m = best.ok_or(Errno::Enoent)?;
        let rest = &path[m.point.len()..];
        Ok((m.sb.clone(), m.root.clone(), rest.trim_start_matches('/')))
    })
}

/// Sync every mounted filesystem.
pub fn sync_all() -> KResult<()> {
    let sbs: Vec<Arc<Superblock>> =
        global::with(|vfs| vfs.mounts.iter().map(|m| m.sb.clone()).collect());
    for sb in sbs {
        sb.ops.sync(&sb)?;
    }
    Ok(())
}

/// Tear down all mounts (tests and shutdown).
pub fn unmount_all() {
    let mounts: Vec<Mount> = global::with(|vfs| core::mem::take(&mut vfs.mounts));
    for m in mounts.into_iter().rev() {
        let _ = m.sb.ops.sync(&m.sb);
        let _ = m.sb.ops.unmount(&m.sb);
    }
}
