//! Device filesystem
//!
//! A synthetic filesystem exposing registered drivers as inodes. The
//! root directory is backed by the global device table; the `fd/`
//! subdirectory exposes the calling process's open descriptors as the
//! inodes they refer to.

use alloc::boxed::Box;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{
    DirEntry, FileType, FilesystemType, Inode, InodeAttr, InodeOps, MountFlags, Superblock,
    SuperOps, S_IFBLK, S_IFCHR, S_IFDIR,
};
use crate::error::{Errno, KResult};

/// devfs superblock magic.
pub const DEVFS_MAGIC: u32 = 0x1373;

/// Kind of device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Char,
    Block,
}

/// Operations a registered driver provides.
#[allow(unused_variables)]
pub trait DeviceOps: Send + Sync {
    fn read(&self, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        Err(Errno::Enotsup)
    }

    fn write(&self, offset: u64, buf: &[u8]) -> KResult<usize> {
        Err(Errno::Enotsup)
    }

    fn ioctl(&self, cmd: u32, arg: u32) -> KResult<i32> {
        Err(Errno::Enotty)
    }
}

/// One entry of the device table.
#[derive(Clone)]
pub struct Device {
    pub name: String,
    pub major: u32,
    pub minor: u32,
    pub class: DeviceClass,
    pub ops: Arc<dyn DeviceOps>,
}

impl Device {
    fn rdev(&self) -> u32 {
        (self.major << 8) | (self.minor & 0xff)
    }
}

#[cfg(target_os = "none")]
mod table {
    use alloc::vec::Vec;
    use spin::RwLock;

    use super::Device;

    static DEVICES: RwLock<Vec<Device>> = RwLock::new(Vec::new());

    pub fn with<R>(f: impl FnOnce(&mut Vec<Device>) -> R) -> R {
        f(&mut DEVICES.write())
    }
}

#[cfg(not(target_os = "none"))]
mod table {
    use alloc::vec::Vec;
    use std::cell::RefCell;

    use super::Device;

    std::thread_local! {
        static DEVICES: RefCell<Vec<Device>> = const { RefCell::new(Vec::new()) };
    }

    pub fn with<R>(f: impl FnOnce(&mut Vec<Device>) -> R) -> R {
        DEVICES.with(|d| f(&mut d.borrow_mut()))
    }
}

/// Register a device in the global table. EEXIST on duplicate names.
pub fn register_device(dev: Device) -> KResult<()> {
    table::with(|devices| {
        if devices.iter().any(|d| d.name == dev.name) {
            return Err(Errno::Eexist);
        }
        devices.push(dev);
        Ok(())
    })
}

fn device_at(index: usize) -> Option<Device> {
    table::with(|devices| devices.get(index).cloned())
}

fn device_named(name: &str) -> Option<(usize, Device)> {
    table::with(|devices| {
        devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.name == name)
            .map(|(i, d)| (i, d.clone()))
    })
}

// Inode numbering: 1 root, 2 "fd" directory, 3+i device i.
const INO_ROOT: u64 = 1;
const INO_FD: u64 = 2;
const INO_DEV_BASE: u64 = 3;

/// The registrable filesystem type instance.
pub static DEVFS_TYPE: DevFs = DevFs;

/// Register devfs with the VFS type table.
pub fn init() -> KResult<()> {
    super::register(&DEVFS_TYPE)
}

/// The devfs filesystem type.
pub struct DevFs;

impl FilesystemType for DevFs {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn mount(
        &self,
        _dev: Option<Arc<dyn super::BlockDevice>>,
        flags: MountFlags,
        _data: &str,
    ) -> KResult<Arc<Superblock>> {
        Ok(Superblock::new(
            DEVFS_MAGIC,
            crate::mm::PAGE_SIZE as u32,
            flags,
            INO_ROOT,
            Box::new(DevSuper),
        ))
    }
}

struct DevSuper;

impl SuperOps for DevSuper {
    fn read_inode(&self, sb: &Arc<Superblock>, ino: u64) -> KResult<Arc<Inode>> {
        let now = crate::time::unix_time();
        let dir_attr = |mode| InodeAttr {
            mode: S_IFDIR | mode,
            nlink: 2,
            atime: now,
            mtime: now,
            ctime: now,
            ..InodeAttr::default()
        };
        match ino {
            INO_ROOT => Ok(Inode::new(ino, Some(sb.clone()), dir_attr(0o755), Box::new(DevRoot))),
            INO_FD => Ok(Inode::new(ino, Some(sb.clone()), dir_attr(0o500), Box::new(FdDir))),
            _ => {
                let dev =
                    device_at((ino - INO_DEV_BASE) as usize).ok_or(Errno::Enoent)?;
                let type_bits = match dev.class {
                    DeviceClass::Char => S_IFCHR,
                    DeviceClass::Block => S_IFBLK,
                };
                let attr = InodeAttr {
                    mode: type_bits | 0o666,
                    nlink: 1,
                    rdev: dev.rdev(),
                    atime: now,
                    mtime: now,
                    ctime: now,
                    ..InodeAttr::default()
                };
                Ok(Inode::new(
                    ino,
                    Some(sb.clone()),
                    attr,
                    Box::new(DevNode { dev }),
                ))
            }
        }
    }
}

/// Root directory: `fd/` plus every registered device.
struct DevRoot;

impl InodeOps for DevRoot {
    fn lookup(&self, dir: &Inode, name: &str) -> KResult<Arc<Inode>> {
        let sb = dir.sb.as_ref().ok_or(Errno::Eio)?;
        if name == "fd" {
            return sb.inode(INO_FD);
        }
        let (index, _) = device_named(name).ok_or(Errno::Enoent)?;
        sb.inode(INO_DEV_BASE + index as u64)
    }

    fn readdir(&self, _dir: &Inode, pos: u64) -> KResult<Option<(DirEntry, u64)>> {
        // Cursor: 0 "fd", then one slot per device-table entry.
        if pos == 0 {
            return Ok(Some((
                DirEntry {
                    ino: INO_FD,
                    name: String::from("fd"),
                    file_type: Some(FileType::Directory),
                },
                1,
            )));
        }
        match device_at(pos as usize - 1) {
            Some(dev) => Ok(Some((
                DirEntry {
                    ino: INO_DEV_BASE + pos - 1,
                    name: dev.name.clone(),
                    file_type: Some(match dev.class {
                        DeviceClass::Char => FileType::CharDevice,
                        DeviceClass::Block => FileType::BlockDevice,
                    }),
                },
                pos + 1,
            ))),
            None => Ok(None),
        }
    }
}

/// `fd/` directory: descriptors of the calling process.
struct FdDir;

impl InodeOps for FdDir {
    fn lookup(&self, _dir: &Inode, name: &str) -> KResult<Arc<Inode>> {
        let fd: usize = name.parse().map_err(|_| Errno::Enoent)?;
        crate::process::with_current(|proc| {
            proc.files
                .get(fd)
                .and_then(|slot| slot.as_ref())
                .map(|f| f.file.inode.clone())
                .ok_or(Errno::Enoent)
        })?
    }

    fn readdir(&self, _dir: &Inode, pos: u64) -> KResult<Option<(DirEntry, u64)>> {
        crate::process::with_current(|proc| {
            for fd in pos as usize..proc.files.len() {
                if let Some(slot) = proc.files[fd].as_ref() {
                    return Some((
                        DirEntry {
                            ino: slot.file.inode.ino,
                            name: fd.to_string(),
                            file_type: slot.file.inode.file_type(),
                        },
                        fd as u64 + 1,
                    ));
                }
            }
            None
        })
        .map_err(|_| Errno::Enoent)
    }
}

/// One device node; reads and writes go straight to the driver.
struct DevNode {
    dev: Device,
}

impl InodeOps for DevNode {
    fn read(&self, _inode: &Inode, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        self.dev.ops.read(offset, buf)
    }

    fn write(&self, _inode: &Inode, offset: u64, buf: &[u8]) -> KResult<usize> {
        self.dev.ops.write(offset, buf)
    }

    fn ioctl(&self, _inode: &Inode, cmd: u32, arg: u32) -> KResult<i32> {
        self.dev.ops.ioctl(cmd, arg)
    }
}

#[cfg(test)]
mod tests {
    use spin::Mutex;

    use super::*;

    struct EchoDev {
        last: Mutex<Vec<u8>>,
    }

    impl DeviceOps for EchoDev {
        fn read(&self, _offset: u64, buf: &mut [u8]) -> KResult<usize> {
            let last = self.last.lock();
            let n = last.len().min(buf.len());
            buf[..n].copy_from_slice(&last[..n]);
            Ok(n)
        }

        fn write(&self, _offset: u64, buf: &[u8]) -> KResult<usize> {
            *self.last.lock() = buf.to_vec();
            Ok(buf.len())
        }
    }

    fn mounted_devfs() -> Arc<Superblock> {
        // Registration may collide when tests share a thread.
        let _ = register_device(Device {
            name: String::from("echo0"),
            major: 10,
            minor: 1,
            class: DeviceClass::Char,
            ops: Arc::new(EchoDev {
                last: Mutex::new(Vec::new()),
            }),
        });
        DevFs.mount(None, MountFlags::empty(), "").unwrap()
    }

    #[test]
    fn device_appears_under_root() {
        let sb = mounted_devfs();
        let root = sb.root().unwrap();
        let node = root.ops.lookup(&root, "echo0").unwrap();
        assert_eq!(node.file_type(), Some(FileType::CharDevice));
        assert_eq!(node.attr.read().rdev, (10 << 8) | 1);
    }

    #[test]
    fn device_io_reaches_driver() {
        let sb = mounted_devfs();
        let root = sb.root().unwrap();
        let node = root.ops.lookup(&root, "echo0").unwrap();
        node.ops.write(&node, 0, b"ping").unwrap();
        let mut buf = [0u8; 8];
        let n = node.ops.read(&node, 0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn readdir_lists_fd_then_devices() {
        let sb = mounted_devfs();
        let root = sb.root().unwrap();
        let (first, next) = root.ops.readdir(&root, 0).unwrap().unwrap();
        assert_eq!(first.name, "fd");
        let (second, _) = root.ops.readdir(&root, next).unwrap().unwrap();
        assert_eq!(second.name, "echo0");
    }

    #[test]
    fn missing_device_is_enoent() {
        let sb = mounted_devfs();
        let root = sb.root().unwrap();
        assert_eq!(
            root.ops.lookup(&root, "nosuch").unwrap_err(),
            Errno::Enoent
        );
    }
}
