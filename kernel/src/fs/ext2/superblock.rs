//! Superblock handling and mount
//!
//! Mount validates the magic, revision, feature words, and geometry,
//! loads the block-group descriptor table, and (for writable mounts)
//! bumps the mount count, stamps the mount time, and clears the
//! valid-state flag until a clean unmount restores it. Unsupported
//! incompat features refuse the mount outright; unsupported ro-compat
//! features refuse anything but a read-only mount.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::fs::blockdev::{self, BlockDevice};
use crate::fs::{FilesystemType, MountFlags, StatFs, Superblock, SuperOps};

use super::{
    csum, Ext2Fs, Ext2Super, GroupDesc, EXT2_MAGIC, EXT2_ROOT_INO, EXT2_VALID_FS,
    INCOMPAT_CSUM_SEED, INCOMPAT_SUPPORTED, RO_COMPAT_METADATA_CSUM, RO_COMPAT_SUPPORTED,
    SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE,
};

/// The ext2 filesystem type (one slot in the VFS type table).
pub struct Ext2FsType;

impl FilesystemType for Ext2FsType {
    fn name(&self) -> &'static str {
        "ext2"
    }

    fn mount(
        &self,
        dev: Option<Arc<dyn BlockDevice>>,
        flags: MountFlags,
        _data: &str,
    ) -> KResult<Arc<Superblock>> {
        let dev = dev.ok_or(Errno::Enodev)?;
        let rdonly = flags.contains(MountFlags::RDONLY);
        let fs = Arc::new(open_fs(dev, rdonly)?);

        if !rdonly {
            let mut sup = fs.sup.lock();
            let new_mnt_count = sup.mnt_count() + 1;
            sup.set_mnt_count(new_mnt_count);
            sup.set_mtime(crate::time::unix_time() as u32);
            // Cleared now, restored on clean unmount; an unclean stop
            // leaves it for fsck to notice.
            let new_state = sup.state() & !EXT2_VALID_FS;
            sup.set_state(new_state);
            sup.update_checksum();
            let raw = sup.raw.clone();
            drop(sup);
            blockdev::write_at(&*fs.dev, SUPERBLOCK_OFFSET, &raw)?;
        }

        let block_size = fs.block_size;
        Ok(Superblock::new(
            EXT2_MAGIC as u32,
            block_size,
            flags,
            EXT2_ROOT_INO as u64,
            Box::new(Ext2SuperOps { fs }),
        ))
    }
}

/// Read and validate the on-disk structures.
pub fn open_fs(dev: Arc<dyn BlockDevice>, rdonly: bool) -> KResult<Ext2Fs> {
    let mut raw = vec![0u8; SUPERBLOCK_SIZE];
    blockdev::read_at(&*dev, SUPERBLOCK_OFFSET, &mut raw).map_err(|_| Errno::Eio)?;
    let sup = Ext2Super::from_raw(raw);

    if sup.magic() != EXT2_MAGIC || sup.rev_level() > 1 {
        return Err(Errno::Einval);
    }
    if !sup.checksum_valid() {
        return Err(Errno::Einval);
    }
    if sup.feature_incompat() & !INCOMPAT_SUPPORTED != 0 {
        return Err(Errno::Enotsup);
    }
    if !rdonly && sup.feature_ro_compat() & !RO_COMPAT_SUPPORTED != 0 {
        return Err(Errno::Enotsup);
    }

    // Geometry.
    if sup.log_block_size() > 2 {
        return Err(Errno::Einval);
    }
    let block_size = sup.block_size();
    let inode_size = sup.inode_size();
    if inode_size < 128 || inode_size as u32 > block_size || !inode_size.is_power_of_two() {
        return Err(Errno::Einval);
    }
    if sup.blocks_per_group() == 0
        || sup.inodes_per_group() == 0
        || sup.blocks_per_group() > block_size * 8
        || sup.inodes_per_group() > block_size * 8
        || sup.first_data_block() as u64 >= sup.blocks_count()
    {
        return Err(Errno::Einval);
    }
    if sup.has_incompat(super::INCOMPAT_64BIT) && sup.desc_size() < 64 {
        return Err(Errno::Einval);
    }
    let groups_count = sup.group_count();
    if groups_count as u64 * sup.inodes_per_group() as u64 != sup.inodes_count() as u64 {
        return Err(Errno::Einval);
    }

    // Checksum seed.
    let csum_seed = if sup.has_incompat(INCOMPAT_CSUM_SEED) {
        Some(sup.checksum_seed())
    } else if sup.has_ro_compat(RO_COMPAT_METADATA_CSUM) {
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(sup.uuid());
        Some(csum::crc32c(!0, &uuid))
    } else {
        None
    };

    let fs = Ext2Fs {
        block_size,
        inode_size,
        desc_size: sup.desc_size(),
        groups_count,
        blocks_per_group: sup.blocks_per_group(),
        inodes_per_group: sup.inodes_per_group(),
        first_data_block: sup.first_data_block(),
        csum_seed,
        has_filetype: sup.has_incompat(super::INCOMPAT_FILETYPE),
        has_extents: sup.has_incompat(super::INCOMPAT_EXTENTS),
        readonly: core::sync::atomic::AtomicBool::new(rdonly),
        sup: spin::Mutex::new(sup),
        groups: spin::Mutex::new(Vec::new()),
        dev,
    };

    let groups = read_group_descriptors(&fs)?;
    *fs.groups.lock() = groups;
    Ok(fs)
}

/// The block-group descriptor table starts in the block after the
/// superblock.
pub fn gdt_first_block(fs: &Ext2Fs) -> u64 {
    fs.first_data_block as u64 + 1
}

fn read_group_descriptors(fs: &Ext2Fs) -> KResult<Vec<GroupDesc>> {
    let desc_size = fs.desc_size as usize;
    let per_block = fs.block_size as usize / desc_size;
    let desc_blocks = crate::util::div_ceil(fs.groups_count, per_block as u32);

    let mut groups = Vec::with_capacity(fs.groups_count as usize);
    for blk in 0..desc_blocks {
        let data = fs.read_block(gdt_first_block(fs) + blk as u64)?;
        for slot in 0..per_block {
            let index = blk as usize * per_block + slot;
            if index == fs.groups_count as usize {
                break;
            }
            let raw = data[slot * desc_size..(slot + 1) * desc_size].to_vec();
            let gd = GroupDesc::from_raw(raw);
            if let Some(seed) = fs.csum_seed {
                let expected = csum::group_desc_csum(seed, index as u32, &gd.raw);
                if gd.checksum() != expected {
                    return Err(Errno::Einval);
                }
            }
            groups.push(gd);
        }
    }
    Ok(groups)
}

/// Flush the superblock and the descriptor table.
pub fn flush_metadata(fs: &Ext2Fs) -> KResult<()> {
    if fs.is_readonly() {
        return Ok(());
    }
    let desc_size = fs.desc_size as usize;
    let per_block = fs.block_size as usize / desc_size;

    {
        let mut sup = fs.sup.lock();
        sup.set_wtime(crate::time::unix_time() as u32);
        sup.update_checksum();
        let raw = sup.raw.clone();
        drop(sup);
        blockdev::write_at(&*fs.dev, SUPERBLOCK_OFFSET, &raw)?;
    }

    let groups = fs.groups.lock();
    let desc_blocks = crate::util::div_ceil(fs.groups_count, per_block as u32);
    for blk in 0..desc_blocks {
        let mut data = vec![0u8; fs.block_size as usize];
        for slot in 0..per_block {
            let index = blk as usize * per_block + slot;
            if index >= groups.len() {
                break;
            }
            data[slot * desc_size..(slot + 1) * desc_size]
                .copy_from_slice(&groups[index].raw);
        }
        fs.write_block(gdt_first_block(fs) + blk as u64, &data)?;
    }
    fs.dev.flush()
}

/// VFS superblock operations for a mounted ext2 instance.
pub struct Ext2SuperOps {
    pub fs: Arc<Ext2Fs>,
}

impl SuperOps for Ext2SuperOps {
    fn read_inode(
        &self,
        sb: &Arc<Superblock>,
        ino: u64,
    ) -> KResult<Arc<crate::fs::Inode>> {
        super::inode::read_vfs_inode(&self.fs, sb, ino as u32)
    }

    fn write_inode(&self, inode: &crate::fs::Inode) -> KResult<()> {
        super::inode::write_back(&self.fs, inode)
    }

    fn delete_inode(&self, inode: &crate::fs::Inode) {
        if let Err(e) = super::inode::delete(&self.fs, inode) {
            log::warn!("ext2: freeing inode {} failed: {}", inode.ino, e);
        }
    }

    fn statfs(&self, _sb: &Superblock) -> KResult<StatFs> {
        let sup = self.fs.sup.lock();
        Ok(StatFs {
            block_size: self.fs.block_size,
            blocks: sup.blocks_count(),
            blocks_free: sup.free_blocks_count(),
            blocks_avail: sup.free_blocks_count().saturating_sub(sup.r_blocks_count() as u64),
            files: sup.inodes_count() as u64,
            files_free: sup.free_inodes_count() as u64,
            name_max: super::dir::EXT2_NAME_MAX as u32,
        })
    }

    fn sync(&self, _sb: &Superblock) -> KResult<()> {
        flush_metadata(&self.fs)
    }

    fn remount(&self, sb: &Superblock, flags: MountFlags) -> KResult<()> {
        let want_ro = flags.contains(MountFlags::RDONLY);
        if want_ro && !self.fs.is_readonly() {
            flush_metadata(&self.fs)?;
        }
        self.fs
            .readonly
            .store(want_ro, core::sync::atomic::Ordering::Release);
        *sb.flags.write() = flags;
        Ok(())
    }

    fn unmount(&self, _sb: &Superblock) -> KResult<()> {
        if self.fs.is_readonly() {
            return Ok(());
        }
        {
            let mut sup = self.fs.sup.lock();
            let state = sup.state();
            sup.set_state(state | EXT2_VALID_FS);
        }
        flush_metadata(&self.fs)
    }
}

/// Whether `group` carries a superblock backup under the sparse-super
/// rule: groups 0, 1, and powers of 3, 5, and 7.
pub fn group_has_super(sup: &Ext2Super, group: u32) -> bool {
    if !sup.has_ro_compat(super::RO_COMPAT_SPARSE_SUPER) {
        return true;
    }
    if group <= 1 {
        return true;
    }
    for base in [3u32, 5, 7] {
        let mut power = base;
        while power <= group {
            if power == group {
                return true;
            }
            match power.checked_mul(base) {
                Some(next) => power = next,
                None => break,
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_super_rule() {
        let mut sup = Ext2Super::new_empty();
        sup.set_feature_ro_compat(super::super::RO_COMPAT_SPARSE_SUPER);
        let with_backup: Vec<u32> = (0..50).filter(|&g| group_has_super(&sup, g)).collect();
        assert_eq!(with_backup, alloc::vec![0, 1, 3, 5, 7, 9, 25, 27, 49]);

        // Without sparse_super every group has one.
        let dense = Ext2Super::new_empty();
        assert!(group_has_super(&dense, 13));
    }
}
