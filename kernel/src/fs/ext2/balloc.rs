//! Block and inode allocation
//!
//! Allocation picks a preferred block group (the caller passes a goal
//! block or the parent directory's group), scans that group's bitmap
//! for the first clear bit, and falls back to scanning every group.
//! Free-count bookkeeping runs at both the group and superblock level,
//! and with metadata checksums enabled the bitmap and descriptor
//! checksums are refreshed before the write goes out.

use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::util::bitarray;

use super::{csum, Ext2Fs};

impl Ext2Fs {
    /// Load the block bitmap of `group`, validating its checksum.
    pub fn read_block_bitmap(&self, group: u32) -> KResult<Vec<u8>> {
        let (location, stored) = {
            let groups = self.groups.lock();
            let gd = groups.get(group as usize).ok_or(Errno::Einval)?;
            (gd.block_bitmap(), gd.block_bitmap_csum())
        };
        let bitmap = self.read_block(location)?;
        if let Some(seed) = self.csum_seed {
            let nbytes = (self.blocks_per_group as usize) / 8;
            let crc = csum::bitmap_csum(seed, &bitmap, nbytes);
            if stored != crc as u16 {
                self.mark_error();
                return Err(Errno::Eio);
            }
        }
        Ok(bitmap)
    }

    /// Write back the block bitmap of `group`, refreshing checksums.
    pub fn write_block_bitmap(&self, group: u32, bitmap: &[u8]) -> KResult<()> {
        let location = {
            let mut groups = self.groups.lock();
            let gd = groups.get_mut(group as usize).ok_or(Errno::Einval)?;
            if let Some(seed) = self.csum_seed {
                let nbytes = (self.blocks_per_group as usize) / 8;
                gd.set_block_bitmap_csum(csum::bitmap_csum(seed, bitmap, nbytes));
            }
            gd.block_bitmap()
        };
        self.write_block(location, bitmap)?;
        self.group_desc_dirty(group);
        Ok(())
    }

    /// Load the inode bitmap of `group`, validating its checksum.
    pub fn read_inode_bitmap(&self, group: u32) -> KResult<Vec<u8>> {
        let (location, stored) = {
            let groups = self.groups.lock();
            let gd = groups.get(group as usize).ok_or(Errno::Einval)?;
            (gd.inode_bitmap(), gd.inode_bitmap_csum())
        };
        let bitmap = self.read_block(location)?;
        if let Some(seed) = self.csum_seed {
            let nbytes = (self.inodes_per_group as usize + 7) / 8;
            let crc = csum::bitmap_csum(seed, &bitmap, nbytes);
            if stored != crc as u16 {
                self.mark_error();
                return Err(Errno::Eio);
            }
        }
        Ok(bitmap)
    }

    /// Write back the inode bitmap of `group`, refreshing checksums.
    pub fn write_inode_bitmap(&self, group: u32, bitmap: &[u8]) -> KResult<()> {
        let location = {
            let mut groups = self.groups.lock();
            let gd = groups.get_mut(group as usize).ok_or(Errno::Einval)?;
            if let Some(seed) = self.csum_seed {
                let nbytes = (self.inodes_per_group as usize + 7) / 8;
                gd.set_inode_bitmap_csum(csum::bitmap_csum(seed, bitmap, nbytes));
            }
            gd.inode_bitmap()
        };
        self.write_block(location, bitmap)?;
        self.group_desc_dirty(group);
        Ok(())
    }

    /// Recompute one group descriptor's checksum after a change. The
    /// descriptor table itself is flushed by `sync`.
    pub fn group_desc_dirty(&self, group: u32) {
        if let Some(seed) = self.csum_seed {
            let mut groups = self.groups.lock();
            if let Some(gd) = groups.get_mut(group as usize) {
                let crc = csum::group_desc_csum(seed, group, &gd.raw);
                gd.set_checksum(crc);
            }
        }
    }

    /// Allocate one block, preferring the group containing `goal`.
    pub fn alloc_block(&self, goal: u64) -> KResult<u64> {
        self.write_guard()?;
        let preferred = if goal >= self.first_data_block as u64
            && goal < self.sup.lock().blocks_count()
        {
            self.block_group(goal)
        } else {
            0
        };

        let mut order: Vec<u32> = Vec::with_capacity(self.groups_count as usize);
        order.push(preferred);
        for g in 0..self.groups_count {
            if g != preferred {
                order.push(g);
            }
        }

        for group in order {
            if self.groups.lock()[group as usize].free_blocks() == 0 {
                continue;
            }
            let mut bitmap = self.read_block_bitmap(group)?;
            let in_group = self.blocks_in_group(group) as usize;
            if let Some(bit) = bitarray::find_first_zero(&bitmap, in_group) {
                bitarray::set_bit(&mut bitmap, bit);
                self.write_block_bitmap(group, &bitmap)?;
                {
                    let mut groups = self.groups.lock();
                    let gd = &mut groups[group as usize];
                    gd.set_free_blocks(gd.free_blocks() - 1);
                }
                self.group_desc_dirty(group);
                {
                    let mut sup = self.sup.lock();
                    let free = sup.free_blocks_count();
                    sup.set_free_blocks_count(free - 1);
                }
                return Ok(self.group_first_block(group) + bit as u64);
            }
        }
        Err(Errno::Enospc)
    }

    /// Return one block to the free pool.
    pub fn free_block(&self, block: u64) -> KResult<()> {
        self.write_guard()?;
        if block < self.first_data_block as u64 || block >= self.sup.lock().blocks_count() {
            return Err(Errno::Einval);
        }
        let group = self.block_group(block);
        let bit = (block - self.group_first_block(group)) as usize;

        let mut bitmap = self.read_block_bitmap(group)?;
        if !bitarray::clear_bit(&mut bitmap, bit) {
            // Freeing a free block: corruption somewhere above us.
            self.mark_error();
            return Err(Errno::Eio);
        }
        self.write_block_bitmap(group, &bitmap)?;
        {
            let mut groups = self.groups.lock();
            let gd = &mut groups[group as usize];
            gd.set_free_blocks(gd.free_blocks() + 1);
        }
        self.group_desc_dirty(group);
        {
            let mut sup = self.sup.lock();
            let free = sup.free_blocks_count();
            sup.set_free_blocks_count(free + 1);
        }
        Ok(())
    }

    /// Allocate an inode, preferring `preferred_group` (the parent
    /// directory's group). `is_dir` maintains the used-directories
    /// count.
    pub fn alloc_inode(&self, preferred_group: u32, is_dir: bool) -> KResult<u32> {
        self.write_guard()?;
        let first_ino = self.sup.lock().first_ino();

        let mut order: Vec<u32> = Vec::with_capacity(self.groups_count as usize);
        order.push(preferred_group.min(self.groups_count - 1));
        for g in 0..self.groups_count {
            if g != order[0] {
                order.push(g);
            }
        }

        for group in order {
            if self.groups.lock()[group as usize].free_inodes() == 0 {
                continue;
            }
            let mut bitmap = self.read_inode_bitmap(group)?;
            let per_group = self.inodes_per_group as usize;
            let mut start = 0usize;
            // Reserved inodes live at the front of group 0.
            if group == 0 {
                start = (first_ino - 1) as usize;
            }
            let found = (start..per_group).find(|&i| !bitarray::test_bit(&bitmap, i));
            if let Some(bit) = found {
                bitarray::set_bit(&mut bitmap, bit);
                self.write_inode_bitmap(group, &bitmap)?;
                {
                    let mut groups = self.groups.lock();
                    let gd = &mut groups[group as usize];
                    gd.set_free_inodes(gd.free_inodes() - 1);
                    if is_dir {
                        gd.set_used_dirs(gd.used_dirs() + 1);
                    }
                }
                self.group_desc_dirty(group);
                {
                    let mut sup = self.sup.lock();
                    let free = sup.free_inodes_count();
                    sup.set_free_inodes_count(free - 1);
                }
                return Ok(group * self.inodes_per_group + bit as u32 + 1);
            }
        }
        Err(Errno::Enospc)
    }

    /// Check the free-count invariant of one group: set bits plus the
    /// descriptor's free count must equal the group's block total.
    pub fn check_group_invariant(&self, group: u32) -> KResult<bool> {
        let bitmap = self.read_block_bitmap(group)?;
        let in_group = self.blocks_in_group(group) as usize;
        let used = crate::util::bitarray::popcount(&bitmap, in_group);
        let free = self.groups.lock()[group as usize].free_blocks();
        Ok(used + free == in_group as u32)
    }

    /// Release an inode number.
    pub fn free_inode(&self, ino: u32, was_dir: bool) -> KResult<()> {
        self.write_guard()?;
        if ino == 0 || ino > self.sup.lock().inodes_count() {
            return Err(Errno::Einval);
        }
        let group = self.inode_group(ino);
        let bit = ((ino - 1) % self.inodes_per_group) as usize;

        let mut bitmap = self.read_inode_bitmap(group)?;
        if !bitarray::clear_bit(&mut bitmap, bit) {
            self.mark_error();
            return Err(Errno::Eio);
        }
        self.write_inode_bitmap(group, &bitmap)?;
        {
            let mut groups = self.groups.lock();
            let gd = &mut groups[group as usize];
            gd.set_free_inodes(gd.free_inodes() + 1);
            if was_dir {
                gd.set_used_dirs(gd.used_dirs().saturating_sub(1));
            }
        }
        self.group_desc_dirty(group);
        {
            let mut sup = self.sup.lock();
            let free = sup.free_inodes_count();
            sup.set_free_inodes_count(free + 1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::super::mkfs::{self, MkfsOptions};
    use super::super::superblock::open_fs;
    use super::super::Ext2Fs;
    use crate::error::Errno;
    use crate::fs::RamDisk;

    fn fs_with(opts: MkfsOptions) -> Ext2Fs {
        let disk = RamDisk::new("ram0", 512, 8192);
        mkfs::format(&*disk, opts).unwrap();
        open_fs(disk, false).unwrap()
    }

    #[test]
    fn alloc_free_keeps_counts_consistent() {
        let fs = fs_with(MkfsOptions::default());
        let sb_free = fs.sup.lock().free_blocks_count();

        let mut taken = Vec::new();
        for _ in 0..100 {
            taken.push(fs.alloc_block(0).unwrap());
        }
        assert_eq!(fs.sup.lock().free_blocks_count(), sb_free - 100);
        for g in 0..fs.groups_count {
            assert!(fs.check_group_invariant(g).unwrap());
        }

        for block in &taken {
            fs.free_block(*block).unwrap();
        }
        assert_eq!(fs.sup.lock().free_blocks_count(), sb_free);
        for g in 0..fs.groups_count {
            assert!(fs.check_group_invariant(g).unwrap());
        }
    }

    #[test]
    fn allocated_blocks_are_distinct() {
        let fs = fs_with(MkfsOptions::default());
        let mut seen = alloc::collections::BTreeSet::new();
        for _ in 0..64 {
            let block = fs.alloc_block(0).unwrap();
            assert!(seen.insert(block), "block {} handed out twice", block);
        }
    }

    #[test]
    fn double_free_is_detected() {
        let fs = fs_with(MkfsOptions::default());
        let block = fs.alloc_block(0).unwrap();
        fs.free_block(block).unwrap();
        assert_eq!(fs.free_block(block), Err(Errno::Eio));
    }

    #[test]
    fn inode_allocation_skips_reserved_range() {
        let fs = fs_with(MkfsOptions::default());
        let first_ino = fs.sup.lock().first_ino();
        let ino = fs.alloc_inode(0, false).unwrap();
        assert!(ino >= first_ino);
        fs.free_inode(ino, false).unwrap();
        // The slot comes back.
        assert_eq!(fs.alloc_inode(0, false).unwrap(), ino);
    }

    #[test]
    fn checksummed_bitmaps_survive_the_round_trip() {
        let fs = fs_with(MkfsOptions {
            metadata_csum: true,
            inode_size: 256,
            ..MkfsOptions::default()
        });
        let block = fs.alloc_block(0).unwrap();
        // Reads re-validate the checksum the write refreshed.
        fs.read_block_bitmap(fs.block_group(block)).unwrap();
        fs.free_block(block).unwrap();
        fs.read_block_bitmap(fs.block_group(block)).unwrap();
    }

    #[test]
    fn readonly_refuses_allocation() {
        let disk = RamDisk::new("ram0", 512, 8192);
        mkfs::format(&*disk, MkfsOptions::default()).unwrap();
        let fs = open_fs(disk, true).unwrap();
        assert_eq!(fs.alloc_block(0), Err(Errno::Erofs));
    }
}
