//! Inodes and file operations
//!
//! The bridge between the VFS traits and the on-disk layout: inode
//! table IO with checksum validation, file reads and writes through the
//! block map, truncation in both directions, and the directory
//! operations (create, link, unlink, mkdir, rmdir, mknod, rename,
//! symlink) built on the dirent layer.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::fs::{
    DirEntry, FileType, Inode, InodeAttr, InodeOps, Superblock, S_IFBLK, S_IFCHR, S_IFDIR,
    S_IFLNK, S_IFMT, S_IFREG,
};

use super::{
    dir, extent, file_type_to_mode_bits, mode_to_file_type, xattr, DiskInode, Ext2Fs,
    EXT2_NDIR_BLOCKS,
};

/// Sectors (512 bytes) per filesystem block.
fn sectors_per_block(fs: &Ext2Fs) -> u32 {
    fs.block_size / 512
}

/// Locate an inode in its group's inode table.
pub fn inode_location(fs: &Ext2Fs, ino: u32) -> KResult<(u64, usize)> {
    if ino == 0 || ino > fs.sup.lock().inodes_count() {
        return Err(Errno::Einval);
    }
    let group = fs.inode_group(ino);
    let index = ((ino - 1) % fs.inodes_per_group) as u64;
    let table = fs
        .groups
        .lock()
        .get(group as usize)
        .ok_or(Errno::Einval)?
        .inode_table();
    let byte = index * fs.inode_size as u64;
    let block = table + byte / fs.block_size as u64;
    Ok((block, (byte % fs.block_size as u64) as usize))
}

/// Read one raw inode, validating its checksum.
pub fn read_disk_inode(fs: &Ext2Fs, ino: u32) -> KResult<DiskInode> {
    let (block, offset) = inode_location(fs, ino)?;
    let data = fs.read_block(block)?;
    let raw = data[offset..offset + fs.inode_size as usize].to_vec();
    let di = DiskInode::from_raw(raw);
    if !di.checksum_valid(fs.csum_seed, ino) {
        fs.mark_error();
        return Err(Errno::Eio);
    }
    Ok(di)
}

/// Write one raw inode, refreshing its checksum.
pub fn write_disk_inode(fs: &Ext2Fs, ino: u32, di: &mut DiskInode) -> KResult<()> {
    fs.write_guard()?;
    di.update_checksum(fs.csum_seed, ino);
    let (block, offset) = inode_location(fs, ino)?;
    let mut data = fs.read_block(block)?;
    data[offset..offset + fs.inode_size as usize].copy_from_slice(&di.raw);
    fs.write_block(block, &data)
}

fn attr_from_disk(di: &DiskInode) -> InodeAttr {
    let mode = di.mode() as u32;
    let rdev = match mode & S_IFMT {
        S_IFCHR | S_IFBLK => di.block_slot(0),
        _ => 0,
    };
    InodeAttr {
        mode,
        nlink: di.links_count() as u32,
        uid: di.uid(),
        gid: di.gid(),
        size: di.size(),
        atime: di.atime() as i64,
        mtime: di.mtime() as i64,
        ctime: di.ctime() as i64,
        blocks: di.blocks() as u64,
        rdev,
    }
}

/// Build the in-memory inode for `ino`.
pub fn read_vfs_inode(fs: &Arc<Ext2Fs>, sb: &Arc<Superblock>, ino: u32) -> KResult<Arc<Inode>> {
    let di = read_disk_inode(fs, ino)?;
    if di.links_count() == 0 && di.dtime() != 0 {
        return Err(Errno::Enoent);
    }
    Ok(Inode::new(
        ino as u64,
        Some(sb.clone()),
        attr_from_disk(&di),
        Box::new(Ext2InodeOps { fs: fs.clone() }),
    ))
}

/// Push the VFS-visible attributes back into the inode table
/// (`SuperOps::write_inode`).
pub fn write_back(fs: &Ext2Fs, inode: &Inode) -> KResult<()> {
    if fs.is_readonly() {
        return Ok(());
    }
    let ino = inode.ino as u32;
    let mut di = read_disk_inode(fs, ino)?;
    let attr = inode.attr.read();
    di.set_mode(attr.mode as u16);
    di.set_uid(attr.uid);
    di.set_gid(attr.gid);
    di.set_size(attr.size);
    di.set_links_count(attr.nlink as u16);
    di.set_atime(attr.atime as u32);
    di.set_mtime(attr.mtime as u32);
    di.set_ctime(attr.ctime as u32);
    write_disk_inode(fs, ino, &mut di)?;
    inode.clear_dirty();
    Ok(())
}

/// Free everything an unlinked inode still owns
/// (`SuperOps::delete_inode`).
pub fn delete(fs: &Ext2Fs, inode: &Inode) -> KResult<()> {
    if fs.is_readonly() {
        return Ok(());
    }
    let ino = inode.ino as u32;
    let mut di = read_disk_inode(fs, ino)?;
    let was_dir = di.mode() as u32 & S_IFMT == S_IFDIR;

    release_blocks(fs, ino, &mut di, 0)?;
    if di.file_acl() != 0 {
        fs.free_block(di.file_acl() as u64)?;
        di.set_file_acl(0);
    }
    di.set_size(0);
    di.set_blocks(0);
    di.set_dtime(crate::time::unix_time() as u32);
    di.set_links_count(0);
    write_disk_inode(fs, ino, &mut di)?;
    fs.free_inode(ino, was_dir)
}

/// Free every data block with logical index >= `from_lblk`, through
/// either mapping scheme. Returns blocks freed (data + metadata).
pub fn release_blocks(fs: &Ext2Fs, ino: u32, di: &mut DiskInode, from_lblk: u64) -> KResult<u64> {
    let freed = if di.uses_extents() {
        extent::release_from(fs, ino, di, from_lblk)?
    } else {
        release_classic(fs, di, from_lblk)?
    };
    let spb = sectors_per_block(fs) as u64;
    di.set_blocks((di.blocks() as u64).saturating_sub(freed * spb) as u32);
    Ok(freed)
}

/// Free an entire indirect subtree. `level` is the number of pointer
/// levels below `block` (1 = a block of data pointers). Iterative with
/// an explicit stack.
fn free_subtree(fs: &Ext2Fs, block: u64, level: u32) -> KResult<u64> {
    let mut freed = 0u64;
    let mut stack: Vec<(u64, u32)> = vec![(block, level)];
    while let Some((blk, lvl)) = stack.pop() {
        let data = fs.read_block(blk)?;
        for i in 0..(fs.block_size as usize / 4) {
            let ptr = super::get_u32(&data, i * 4);
            if ptr == 0 {
                continue;
            }
            if lvl == 1 {
                fs.free_block(ptr as u64)?;
                freed += 1;
            } else {
                stack.push((ptr as u64, lvl - 1));
            }
        }
        fs.free_block(blk)?;
        freed += 1;
    }
    Ok(freed)
}

/// Classic-scheme release: direct slots, then each indirect range,
/// descending the single partial path with a loop instead of
/// recursion.
fn release_classic(fs: &Ext2Fs, di: &mut DiskInode, from_lblk: u64) -> KResult<u64> {
    let k = fs.block_size as u64 / 4;
    let mut freed = 0u64;

    // Direct slots.
    for slot in 0..EXT2_NDIR_BLOCKS {
        if (slot as u64) < from_lblk {
            continue;
        }
        let b = di.block_slot(slot);
        if b != 0 {
            fs.free_block(b as u64)?;
            di.set_block_slot(slot, 0);
            freed += 1;
        }
    }

    // (slot, first logical block, span, levels of indirection)
    let ranges = [
        (super::EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS as u64, k, 1u32),
        (super::EXT2_DIND_BLOCK, EXT2_NDIR_BLOCKS as u64 + k, k * k, 2),
        (
            super::EXT2_TIND_BLOCK,
            EXT2_NDIR_BLOCKS as u64 + k + k * k,
            k * k * k,
            3,
        ),
    ];

    for (slot, start, span, levels) in ranges {
        let root = di.block_slot(slot);
        if root == 0 || from_lblk >= start + span {
            continue;
        }
        if from_lblk <= start {
            freed += free_subtree(fs, root as u64, levels)?;
            di.set_block_slot(slot, 0);
            continue;
        }

        // Partial: walk down the single boundary path.
        let mut cur = root as u64;
        let mut rel = from_lblk - start;
        let mut lvl = levels;
        loop {
            let mut data = fs.read_block(cur)?;
            if lvl == 1 {
                for i in rel as usize..k as usize {
                    let ptr = super::get_u32(&data, i * 4);
                    if ptr != 0 {
                        fs.free_block(ptr as u64)?;
                        super::put_u32(&mut data, i * 4, 0);
                        freed += 1;
                    }
                }
                fs.write_block(cur, &data)?;
                break;
            }
            let child_span = span_for(k, lvl - 1);
            let idx = (rel / child_span) as usize;
            // Whole subtrees to the right of the boundary go away.
            for i in idx + 1..k as usize {
                let ptr = super::get_u32(&data, i * 4);
                if ptr != 0 {
                    freed += free_subtree(fs, ptr as u64, lvl - 1)?;
                    super::put_u32(&mut data, i * 4, 0);
                }
            }
            let next = super::get_u32(&data, idx * 4);
            if rel % child_span == 0 && next != 0 {
                freed += free_subtree(fs, next as u64, lvl - 1)?;
                super::put_u32(&mut data, idx * 4, 0);
                fs.write_block(cur, &data)?;
                break;
            }
            fs.write_block(cur, &data)?;
            if next == 0 {
                break;
            }
            cur = next as u64;
            rel %= child_span;
            lvl -= 1;
        }
    }
    Ok(freed)
}

fn span_for(k: u64, levels: u32) -> u64 {
    let mut span = 1;
    for _ in 0..levels {
        span *= k;
    }
    span
}

/// Initialize a fresh on-disk inode.
pub fn new_disk_inode(fs: &Ext2Fs, mode: u32, uid: u32, gid: u32) -> DiskInode {
    let mut di = DiskInode::new_empty(fs.inode_size);
    let now = crate::time::unix_time() as u32;
    di.set_mode(mode as u16);
    di.set_uid(uid);
    di.set_gid(gid);
    di.set_links_count(1);
    di.set_atime(now);
    di.set_mtime(now);
    di.set_ctime(now);
    if fs.inode_size > 128 {
        // i_extra_isize
        super::put_u16(&mut di.raw, 128, 32);
    }
    // Regular files and directories on an extent filesystem start with
    // an empty extent root.
    if fs.has_extents && matches!(mode & S_IFMT, S_IFREG | S_IFDIR) {
        extent::init_root(&mut di);
    }
    di
}

// ---------------------------------------------------------------------------
// The InodeOps implementation
// ---------------------------------------------------------------------------

/// VFS operations for ext2 inodes. Stateless: every operation works on
/// the on-disk inode so concurrent handles stay coherent.
pub struct Ext2InodeOps {
    pub fs: Arc<Ext2Fs>,
}

impl Ext2InodeOps {
    fn sb_of(&self, inode: &Inode) -> KResult<Arc<Superblock>> {
        inode.sb.clone().ok_or(Errno::Eio)
    }

    /// Create a child object in `dir` and return its inode number.
    fn make_entry(
        &self,
        dir: &Inode,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
    ) -> KResult<u32> {
        let fs = &self.fs;
        fs.write_guard()?;
        if !dir.is_dir() {
            return Err(Errno::Enotdir);
        }
        let dir_ino = dir.ino as u32;
        let mut dir_di = read_disk_inode(fs, dir_ino)?;
        if dir::lookup(fs, dir_ino, &dir_di, name)?.is_some() {
            return Err(Errno::Eexist);
        }

        let is_dir = mode & S_IFMT == S_IFDIR;
        let ino = fs.alloc_inode(fs.inode_group(dir_ino), is_dir)?;
        let mut di = new_disk_inode(fs, mode, uid, gid);
        if matches!(mode & S_IFMT, S_IFCHR | S_IFBLK) {
            di.set_block_slot(0, rdev);
        }

        let result = (|| -> KResult<()> {
            if is_dir {
                let fresh = dir::init_dir(fs, ino, dir_ino, &mut di)?;
                di.set_blocks(di.blocks() + fresh * sectors_per_block(fs));
                di.set_links_count(2);
            }
            write_disk_inode(fs, ino, &mut di)?;

            let fresh = dir::insert(
                fs,
                dir_ino,
                &mut dir_di,
                name,
                ino,
                mode_to_file_type(mode),
            )?;
            dir_di.set_blocks(dir_di.blocks() + fresh * sectors_per_block(fs));
            if is_dir {
                dir_di.set_links_count(dir_di.links_count() + 1);
            }
            dir_di.set_mtime(crate::time::unix_time() as u32);
            write_disk_inode(fs, dir_ino, &mut dir_di)?;

            // Mirror the directory growth into the live handle.
            let mut attr = dir.attr.write();
            attr.size = dir_di.size();
            attr.blocks = dir_di.blocks() as u64;
            attr.nlink = dir_di.links_count() as u32;
            attr.mtime = dir_di.mtime() as i64;
            Ok(())
        })();

        match result {
            Ok(()) => Ok(ino),
            Err(e) => {
                let _ = fs.free_inode(ino, is_dir);
                Err(e)
            }
        }
    }
}

impl InodeOps for Ext2InodeOps {
    fn lookup(&self, dir: &Inode, name: &str) -> KResult<Arc<Inode>> {
        if !dir.is_dir() {
            return Err(Errno::Enotdir);
        }
        let di = read_disk_inode(&self.fs, dir.ino as u32)?;
        let (ino, _ft) =
            dir::lookup(&self.fs, dir.ino as u32, &di, name)?.ok_or(Errno::Enoent)?;
        self.sb_of(dir)?.inode(ino as u64)
    }

    fn create(
        &self,
        dir: &Inode,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> KResult<Arc<Inode>> {
        let mode = (mode & !S_IFMT) | S_IFREG;
        let ino = self.make_entry(dir, name, mode, uid, gid, 0)?;
        self.sb_of(dir)?.inode(ino as u64)
    }

    fn link(&self, src: &Arc<Inode>, dir: &Inode, name: &str) -> KResult<()> {
        let fs = &self.fs;
        fs.write_guard()?;
        if src.is_dir() {
            return Err(Errno::Eperm);
        }
        let dir_ino = dir.ino as u32;
        let src_ino = src.ino as u32;
        let mut dir_di = read_disk_inode(fs, dir_ino)?;
        let fresh = dir::insert(
            fs,
            dir_ino,
            &mut dir_di,
            name,
            src_ino,
            mode_to_file_type(src.attr.read().mode),
        )?;
        dir_di.set_blocks(dir_di.blocks() + fresh * sectors_per_block(fs));
        write_disk_inode(fs, dir_ino, &mut dir_di)?;
        dir.attr.write().size = dir_di.size();

        let mut src_di = read_disk_inode(fs, src_ino)?;
        src_di.set_links_count(src_di.links_count() + 1);
        src_di.set_ctime(crate::time::unix_time() as u32);
        write_disk_inode(fs, src_ino, &mut src_di)?;
        let mut attr = src.attr.write();
        attr.nlink = src_di.links_count() as u32;
        attr.ctime = src_di.ctime() as i64;
        Ok(())
    }

    fn unlink(&self, dir: &Inode, name: &str) -> KResult<()> {
        let fs = &self.fs;
        fs.write_guard()?;
        let dir_ino = dir.ino as u32;
        let dir_di = read_disk_inode(fs, dir_ino)?;
        let (ino, _ft) =
            dir::lookup(fs, dir_ino, &dir_di, name)?.ok_or(Errno::Enoent)?;

        // Deleting directories goes through rmdir.
        let target = self.sb_of(dir)?.inode(ino as u64)?;
        if target.is_dir() {
            return Err(Errno::Eisdir);
        }

        dir::remove(fs, dir_ino, &dir_di, name)?;

        let mut target_di = read_disk_inode(fs, ino)?;
        let links = target_di.links_count().saturating_sub(1);
        target_di.set_links_count(links);
        target_di.set_ctime(crate::time::unix_time() as u32);
        write_disk_inode(fs, ino, &mut target_di)?;
        let mut attr = target.attr.write();
        attr.nlink = links as u32;
        attr.ctime = target_di.ctime() as i64;
        // The on-disk free happens when the last in-memory reference
        // drops (delete_inode).
        Ok(())
    }

    fn symlink(&self, dir: &Inode, name: &str, target: &str, uid: u32, gid: u32) -> KResult<()> {
        let fs = &self.fs;
        fs.write_guard()?;
        if target.is_empty() || target.len() >= crate::fs::PATH_MAX {
            return Err(Errno::Einval);
        }
        let ino = self.make_entry(dir, name, S_IFLNK | 0o777, uid, gid, 0)?;
        let mut di = read_disk_inode(fs, ino)?;

        if target.len() <= 59 {
            // Fast symlink: the target lives in the i_block area.
            di.set_flags(di.flags() & !super::EXT4_EXTENTS_FL);
            let area = di.block_area_mut();
            area.fill(0);
            area[..target.len()].copy_from_slice(target.as_bytes());
        } else {
            let (pblk, fresh) = fs.bmap_alloc(ino, &mut di, 0)?;
            let mut block = vec![0u8; fs.block_size as usize];
            block[..target.len()].copy_from_slice(target.as_bytes());
            fs.write_block(pblk, &block)?;
            di.set_blocks(di.blocks() + fresh * sectors_per_block(fs));
        }
        di.set_size(target.len() as u64);
        write_disk_inode(fs, ino, &mut di)
    }

    fn readlink(&self, inode: &Inode) -> KResult<String> {
        if !inode.is_symlink() {
            return Err(Errno::Einval);
        }
        let fs = &self.fs;
        let di = read_disk_inode(fs, inode.ino as u32)?;
        let len = di.size() as usize;
        if len == 0 || len >= crate::fs::PATH_MAX {
            return Err(Errno::Eio);
        }
        let bytes = if len <= 59 && di.blocks() == 0 {
            di.block_area()[..len].to_vec()
        } else {
            let pblk = fs
                .bmap(inode.ino as u32, &di, 0)?
                .ok_or(Errno::Eio)?;
            fs.read_block(pblk)?[..len].to_vec()
        };
        String::from_utf8(bytes).map_err(|_| Errno::Eio)
    }

    fn mkdir(&self, dir: &Inode, name: &str, mode: u32, uid: u32, gid: u32) -> KResult<Arc<Inode>> {
        let mode = (mode & !S_IFMT) | S_IFDIR;
        let ino = self.make_entry(dir, name, mode, uid, gid, 0)?;
        self.sb_of(dir)?.inode(ino as u64)
    }

    fn rmdir(&self, dir: &Inode, name: &str) -> KResult<()> {
        let fs = &self.fs;
        fs.write_guard()?;
        if name == "." || name == ".." {
            return Err(Errno::Einval);
        }
        let dir_ino = dir.ino as u32;
        let dir_di = read_disk_inode(fs, dir_ino)?;
        let (ino, _ft) =
            dir::lookup(fs, dir_ino, &dir_di, name)?.ok_or(Errno::Enoent)?;

        let target = self.sb_of(dir)?.inode(ino as u64)?;
        if !target.is_dir() {
            return Err(Errno::Enotdir);
        }
        let target_di = read_disk_inode(fs, ino)?;
        if !dir::is_empty(fs, ino, &target_di)? {
            return Err(Errno::Enotempty);
        }

        dir::remove(fs, dir_ino, &dir_di, name)?;

        // The removed directory loses "." and its name; the parent
        // loses "..".
        let mut target_di = target_di;
        target_di.set_links_count(0);
        target_di.set_ctime(crate::time::unix_time() as u32);
        write_disk_inode(fs, ino, &mut target_di)?;
        target.attr.write().nlink = 0;

        let mut parent_di = read_disk_inode(fs, dir_ino)?;
        parent_di.set_links_count(parent_di.links_count().saturating_sub(1));
        write_disk_inode(fs, dir_ino, &mut parent_di)?;
        dir.attr.write().nlink = parent_di.links_count() as u32;
        Ok(())
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
        if !matches!(
            mode & S_IFMT,
            S_IFCHR | S_IFBLK | crate::fs::S_IFIFO | crate::fs::S_IFSOCK | S_IFREG
        ) {
            return Err(Errno::Einval);
        }
        self.make_entry(dir, name, mode, uid, gid, rdev).map(|_| ())
    }

    fn rename(
        &self,
        old_dir: &Inode,
        old_name: &str,
        new_dir: &Inode,
        new_name: &str,
    ) -> KResult<()> {
        let fs = &self.fs;
        fs.write_guard()?;
        let old_ino = old_dir.ino as u32;
        let new_ino = new_dir.ino as u32;
        let old_di = read_disk_inode(fs, old_ino)?;
        let (moved, ft) =
            dir::lookup(fs, old_ino, &old_di, old_name)?.ok_or(Errno::Enoent)?;
        let moved_is_dir = ft == super::FT_DIR;

        // Replace an existing target.
        let new_di = read_disk_inode(fs, new_ino)?;
        if let Some((existing, _)) = dir::lookup(fs, new_ino, &new_di, new_name)? {
            if existing == moved {
                return Ok(());
            }
            let existing_inode = self.sb_of(new_dir)?.inode(existing as u64)?;
            if existing_inode.is_dir() {
                self.rmdir(new_dir, new_name)?;
            } else {
                self.unlink(new_dir, new_name)?;
            }
        }

        dir::remove(fs, old_ino, &old_di, old_name)?;
        let mut new_di = read_disk_inode(fs, new_ino)?;
        let fresh = dir::insert(fs, new_ino, &mut new_di, new_name, moved, ft)?;
        new_di.set_blocks(new_di.blocks() + fresh * sectors_per_block(fs));
        write_disk_inode(fs, new_ino, &mut new_di)?;
        new_dir.attr.write().size = new_di.size();

        // A moved directory's ".." must follow it, and the parents'
        // link counts move with it.
        if moved_is_dir && old_ino != new_ino {
            let moved_di = read_disk_inode(fs, moved)?;
            dir::remove(fs, moved, &moved_di, "..")?;
            let mut moved_di = read_disk_inode(fs, moved)?;
            dir::insert(fs, moved, &mut moved_di, "..", new_ino, super::FT_DIR)?;
            write_disk_inode(fs, moved, &mut moved_di)?;

            let mut old_parent = read_disk_inode(fs, old_ino)?;
            old_parent.set_links_count(old_parent.links_count().saturating_sub(1));
            write_disk_inode(fs, old_ino, &mut old_parent)?;
            old_dir.attr.write().nlink = old_parent.links_count() as u32;

            let mut new_parent = read_disk_inode(fs, new_ino)?;
            new_parent.set_links_count(new_parent.links_count() + 1);
            write_disk_inode(fs, new_ino, &mut new_parent)?;
            new_dir.attr.write().nlink = new_parent.links_count() as u32;
        }
        Ok(())
    }

    fn read(&self, inode: &Inode, offset: u64, buf: &mut [u8]) -> KResult<usize> {
        let fs = &self.fs;
        let ino = inode.ino as u32;
        let di = read_disk_inode(fs, ino)?;
        let size = di.size();
        if offset >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let bs = fs.block_size as u64;

        let mut done = 0usize;
        while done < want {
            let pos = offset + done as u64;
            let lblk = pos / bs;
            let in_block = (pos % bs) as usize;
            let take = (want - done).min(bs as usize - in_block);
            match fs.bmap(ino, &di, lblk)? {
                Some(pblk) => {
                    let data = fs.read_block(pblk)?;
                    buf[done..done + take].copy_from_slice(&data[in_block..in_block + take]);
                }
                None => {
                    // Hole: reads as zeros.
                    buf[done..done + take].fill(0);
                }
            }
            done += take;
        }
        Ok(want)
    }

    fn write(&self, inode: &Inode, offset: u64, buf: &[u8]) -> KResult<usize> {
        let fs = &self.fs;
        fs.write_guard()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let ino = inode.ino as u32;
        let mut di = read_disk_inode(fs, ino)?;
        let bs = fs.block_size as u64;
        let mut allocated = 0u32;

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let lblk = pos / bs;
            let in_block = (pos % bs) as usize;
            let take = (buf.len() - done).min(bs as usize - in_block);

            let (pblk, fresh) = fs.bmap_alloc(ino, &mut di, lblk)?;
            allocated += fresh;
            if take == bs as usize {
                fs.write_block(pblk, &buf[done..done + take])?;
            } else {
                let mut data = if fresh > 0 {
                    vec![0u8; bs as usize]
                } else {
                    fs.read_block(pblk)?
                };
                data[in_block..in_block + take].copy_from_slice(&buf[done..done + take]);
                fs.write_block(pblk, &data)?;
            }
            done += take;
        }

        let end = offset + buf.len() as u64;
        if end > di.size() {
            di.set_size(end);
        }
        di.set_blocks(di.blocks() + allocated * sectors_per_block(fs));
        di.set_mtime(crate::time::unix_time() as u32);
        write_disk_inode(fs, ino, &mut di)?;

        let mut attr = inode.attr.write();
        attr.size = di.size();
        attr.blocks = di.blocks() as u64;
        attr.mtime = di.mtime() as i64;
        Ok(buf.len())
    }

    fn readdir(&self, dir_inode: &Inode, pos: u64) -> KResult<Option<(DirEntry, u64)>> {
        let fs = &self.fs;
        if !dir_inode.is_dir() {
            return Err(Errno::Enotdir);
        }
        let ino = dir_inode.ino as u32;
        let di = read_disk_inode(fs, ino)?;
        match dir::readdir_at(fs, ino, &di, pos)? {
            Some((entry, next)) => {
                let file_type = if fs.has_filetype {
                    FileType::from_mode(file_type_to_mode_bits(entry.file_type))
                } else {
                    None
                };
                Ok(Some((
                    DirEntry {
                        ino: entry.ino as u64,
                        name: entry.name,
                        file_type,
                    },
                    next,
                )))
            }
            None => Ok(None),
        }
    }

    fn truncate(&self, inode: &Inode, size: u64) -> KResult<()> {
        let fs = &self.fs;
        fs.write_guard()?;
        let ino = inode.ino as u32;
        let mut di = read_disk_inode(fs, ino)?;
        let old = di.size();
        if size < old {
            let bs = fs.block_size as u64;
            let boundary = crate::util::div_ceil64(size, bs);
            release_blocks(fs, ino, &mut di, boundary)?;
            // Zero the tail of the straddling block so stale bytes do
            // not resurface if the file grows back.
            if size % bs != 0 {
                if let Some(pblk) = fs.bmap(ino, &di, size / bs)? {
                    let mut data = fs.read_block(pblk)?;
                    data[(size % bs) as usize..].fill(0);
                    fs.write_block(pblk, &data)?;
                }
            }
        }
        di.set_size(size);
        di.set_mtime(crate::time::unix_time() as u32);
        write_disk_inode(fs, ino, &mut di)?;

        let mut attr = inode.attr.write();
        attr.size = size;
        attr.blocks = di.blocks() as u64;
        attr.mtime = di.mtime() as i64;
        Ok(())
    }

    fn setxattr(&self, inode: &Inode, name: &str, value: &[u8], flags: i32) -> KResult<()> {
        xattr::set(&self.fs, inode, name, value, flags)
    }

    fn getxattr(&self, inode: &Inode, name: &str) -> KResult<Vec<u8>> {
        xattr::get(&self.fs, inode, name)
    }

    fn listxattr(&self, inode: &Inode) -> KResult<Vec<String>> {
        xattr::list(&self.fs, inode)
    }

    fn removexattr(&self, inode: &Inode, name: &str) -> KResult<()> {
        xattr::remove(&self.fs, inode, name)
    }
}
