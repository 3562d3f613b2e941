//! Logical-to-physical block mapping
//!
//! The inode either carries the classical scheme (12 direct slots plus
//! single, double, and triple indirect chains of block pointers) or an
//! extent tree. Chain walks are iterative: the path is computed up
//! front as at most three indexes, so a corrupted chain cannot recurse
//! the kernel stack away.

use crate::error::{Errno, KResult};

use super::{
    DiskInode, Ext2Fs, EXT2_DIND_BLOCK, EXT2_IND_BLOCK, EXT2_NDIR_BLOCKS, EXT2_TIND_BLOCK,
};

/// Pointers per indirect block.
fn addr_per_block(fs: &Ext2Fs) -> u64 {
    fs.block_size as u64 / 4
}

/// The slot and per-level indexes addressing `lblk`, or EFBIG past the
/// triple-indirect limit.
fn chain_for(fs: &Ext2Fs, lblk: u64) -> KResult<(usize, [u64; 3], usize)> {
    let k = addr_per_block(fs);
    if lblk < EXT2_NDIR_BLOCKS as u64 {
        return Ok((lblk as usize, [0; 3], 0));
    }
    let mut rest = lblk - EXT2_NDIR_BLOCKS as u64;
    if rest < k {
        return Ok((EXT2_IND_BLOCK, [rest, 0, 0], 1));
    }
    rest -= k;
    if rest < k * k {
        return Ok((EXT2_DIND_BLOCK, [rest / k, rest % k, 0], 2));
    }
    rest -= k * k;
    if rest < k * k * k {
        return Ok((EXT2_TIND_BLOCK, [rest / (k * k), (rest / k) % k, rest % k], 3));
    }
    Err(Errno::Efbig)
}

fn read_ptr(fs: &Ext2Fs, block: u64, index: u64) -> KResult<u32> {
    let data = fs.read_block(block)?;
    let off = index as usize * 4;
    Ok(u32::from_le_bytes([
        data[off],
        data[off + 1],
        data[off + 2],
        data[off + 3],
    ]))
}

fn write_ptr(fs: &Ext2Fs, block: u64, index: u64, value: u32) -> KResult<()> {
    let mut data = fs.read_block(block)?;
    let off = index as usize * 4;
    data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    fs.write_block(block, &data)
}

impl Ext2Fs {
    /// Resolve `lblk` without allocating. `Ok(None)` is a hole.
    pub fn bmap(&self, ino: u32, di: &DiskInode, lblk: u64) -> KResult<Option<u64>> {
        if di.flags() & super::EXT4_INLINE_DATA_FL != 0 {
            return Err(Errno::Enotsup);
        }
        if di.uses_extents() {
            return super::extent::lookup(self, ino, di, lblk);
        }

        let (slot, indexes, depth) = chain_for(self, lblk)?;
        let mut b = di.block_slot(slot);
        for level in 0..depth {
            if b == 0 {
                return Ok(None);
            }
            b = read_ptr(self, b as u64, indexes[level])?;
        }
        Ok(if b == 0 { None } else { Some(b as u64) })
    }

    /// Resolve `lblk`, allocating the data block (and any missing
    /// indirect blocks) on the way. Returns the physical block and the
    /// number of blocks newly allocated.
    pub fn bmap_alloc(&self, ino: u32, di: &mut DiskInode, lblk: u64) -> KResult<(u64, u32)> {
        if di.flags() & super::EXT4_INLINE_DATA_FL != 0 {
            return Err(Errno::Enotsup);
        }
        if di.uses_extents() {
            return super::extent::bmap_alloc(self, ino, di, lblk);
        }

        let (slot, indexes, depth) = chain_for(self, lblk)?;
        let mut allocated = 0u32;
        // Allocation goal: the previous slot's block, else the inode's
        // own group.
        let goal_base = self.group_first_block(self.inode_group(ino));

        let mut b = di.block_slot(slot);
        if b == 0 {
            let goal = if slot > 0 && slot <= EXT2_NDIR_BLOCKS {
                di.block_slot(slot - 1) as u64
            } else {
                goal_base
            };
            let fresh = self.alloc_block(if goal != 0 { goal } else { goal_base })?;
            if depth > 0 {
                self.zero_block(fresh)?;
            }
            di.set_block_slot(slot, fresh as u32);
            allocated += 1;
            b = fresh as u32;
        }

        for level in 0..depth {
            let parent = b as u64;
            b = read_ptr(self, parent, indexes[level])?;
            if b == 0 {
                let fresh = self.alloc_block(parent)?;
                if level + 1 < depth {
                    self.zero_block(fresh)?;
                }
                write_ptr(self, parent, indexes[level], fresh as u32)?;
                allocated += 1;
                b = fresh as u32;
            }
        }
        Ok((b as u64, allocated))
    }
}
