//! Volume formatter
//!
//! Builds a fresh, consistent volume on a block device: superblock,
//! descriptor table, bitmaps, inode tables, and a root directory, with
//! the selected optional features. The boot ramdisk and the driver's
//! own tests are its main consumers; the layout is the classic one
//! (no flex_bg, no meta_bg), with superblock backups in the
//! sparse-super groups.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::fs::blockdev::{self, BlockDevice};
use crate::util::bitarray;

use super::superblock::group_has_super;
use super::{
    csum, dir, extent, DiskInode, Ext2Super, EXT2_GOOD_OLD_FIRST_INO, EXT2_MAGIC, EXT2_ROOT_INO,
    EXT2_VALID_FS, FT_DIR, INCOMPAT_64BIT, INCOMPAT_EXTENTS, INCOMPAT_FILETYPE,
    RO_COMPAT_LARGE_FILE, RO_COMPAT_METADATA_CSUM, RO_COMPAT_SPARSE_SUPER, SUPERBLOCK_OFFSET,
};

/// Formatting options.
#[derive(Debug, Clone, Copy)]
pub struct MkfsOptions {
    pub block_size: u32,
    pub inode_size: u16,
    /// Extent-mapped inodes instead of indirect chains.
    pub extents: bool,
    /// CRC32C metadata checksums everywhere.
    pub metadata_csum: bool,
    /// 64-bit block counts and wide group descriptors.
    pub sixty_four_bit: bool,
}

impl Default for MkfsOptions {
    fn default() -> Self {
        Self {
            block_size: 1024,
            inode_size: 128,
            extents: false,
            metadata_csum: false,
            sixty_four_bit: false,
        }
    }
}

/// Deterministic volume UUID (the formatter has no entropy source).
const VOLUME_UUID: [u8; 16] = [
    0x3a, 0x5f, 0x00, 0xd1, 0x77, 0x21, 0x4c, 0x9e, 0x8a, 0x02, 0x16, 0xee, 0x42, 0x7b, 0x90,
    0x55,
];

struct Geometry {
    bs: u32,
    blocks_count: u64,
    first_data_block: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u16,
    desc_size: u16,
    groups: u32,
    desc_blocks: u32,
    itb_blocks: u32,
}

fn geometry(dev: &dyn BlockDevice, opts: &MkfsOptions) -> KResult<Geometry> {
    let bs = opts.block_size;
    if !matches!(bs, 1024 | 2048 | 4096) {
        return Err(Errno::Einval);
    }
    if opts.inode_size < 128 || !opts.inode_size.is_power_of_two() || opts.inode_size as u32 > bs
    {
        return Err(Errno::Einval);
    }
    let total_bytes = dev.block_count() * dev.block_size() as u64;
    let blocks_count = total_bytes / bs as u64;
    let first_data_block = if bs == 1024 { 1 } else { 0 };
    if blocks_count < 64 {
        return Err(Errno::Einval);
    }
    let blocks_per_group = bs * 8;
    let groups = crate::util::div_ceil64(
        blocks_count - first_data_block as u64,
        blocks_per_group as u64,
    ) as u32;

    // One bitmap block must cover the inodes too; a quarter of the
    // data blocks is plenty for the sizes this formatter serves.
    let mut inodes_per_group =
        ((blocks_count / groups as u64 / 4) as u32 / 8 * 8).clamp(16, bs * 8);
    let desc_size: u16 = if opts.sixty_four_bit { 64 } else { 32 };
    let itb_blocks =
        crate::util::div_ceil(inodes_per_group * opts.inode_size as u32, bs);
    inodes_per_group = inodes_per_group.min(itb_blocks * bs / opts.inode_size as u32);
    // Re-round to a byte boundary of the bitmap.
    inodes_per_group = inodes_per_group / 8 * 8;

    Ok(Geometry {
        bs,
        blocks_count,
        first_data_block,
        blocks_per_group,
        inodes_per_group,
        inode_size: opts.inode_size,
        desc_size,
        groups,
        desc_blocks: crate::util::div_ceil(groups * desc_size as u32, bs),
        itb_blocks: crate::util::div_ceil(inodes_per_group * opts.inode_size as u32, bs),
    })
}

/// Format `dev` in place.
pub fn format(dev: &dyn BlockDevice, opts: MkfsOptions) -> KResult<()> {
    let geo = geometry(dev, &opts)?;
    let now = crate::time::unix_time() as u32;

    let mut sup = Ext2Super::new_empty();
    sup.set_magic(EXT2_MAGIC);
    sup.set_rev_level(1);
    sup.set_first_ino_raw(EXT2_GOOD_OLD_FIRST_INO);
    sup.set_inode_size_raw(geo.inode_size);
    sup.set_log_block_size(geo.bs.trailing_zeros() - 10);
    sup.set_log_cluster_size(geo.bs.trailing_zeros() - 10);
    sup.set_first_data_block(geo.first_data_block);
    sup.set_blocks_per_group(geo.blocks_per_group);
    sup.set_clusters_per_group(geo.blocks_per_group);
    sup.set_inodes_per_group(geo.inodes_per_group);
    sup.set_inodes_count(geo.inodes_per_group * geo.groups);
    sup.set_state(EXT2_VALID_FS);
    sup.set_max_mnt_count(0xffff);
    sup.set_mtime(0);
    sup.set_wtime(now);
    sup.set_lastcheck(now);
    sup.set_uuid(&VOLUME_UUID);

    let mut incompat = INCOMPAT_FILETYPE;
    if opts.extents {
        incompat |= INCOMPAT_EXTENTS;
    }
    if opts.sixty_four_bit {
        incompat |= INCOMPAT_64BIT;
        sup.set_desc_size_raw(geo.desc_size);
    }
    sup.set_feature_incompat(incompat);
    let mut ro_compat = RO_COMPAT_SPARSE_SUPER | RO_COMPAT_LARGE_FILE;
    if opts.metadata_csum {
        ro_compat |= RO_COMPAT_METADATA_CSUM;
    }
    sup.set_feature_ro_compat(ro_compat);
    sup.set_blocks_count(geo.blocks_count);

    let seed = if opts.metadata_csum {
        Some(csum::crc32c(!0, &VOLUME_UUID))
    } else {
        None
    };

    // Per-group layout and bitmaps.
    let mut descriptors: Vec<Vec<u8>> = Vec::new();
    let mut total_free_blocks = 0u64;
    let root_data_block;
    {
        // Group 0 carries the root directory right after its inode
        // table.
        let overhead0 = 1 + geo.desc_blocks + 2 + geo.itb_blocks;
        root_data_block = geo.first_data_block as u64 + overhead0 as u64;
    }

    for g in 0..geo.groups {
        let start = geo.first_data_block as u64 + g as u64 * geo.blocks_per_group as u64;
        let in_group = (geo.blocks_count - start).min(geo.blocks_per_group as u64) as u32;
        let has_super = group_has_super(&sup, g);
        let meta = if has_super { 1 + geo.desc_blocks } else { 0 };

        let block_bitmap_at = start + meta as u64;
        let inode_bitmap_at = block_bitmap_at + 1;
        let inode_table_at = inode_bitmap_at + 1;
        let used = meta + 2 + geo.itb_blocks + if g == 0 { 1 } else { 0 };

        // Block bitmap: metadata plus padding past the group end.
        let mut bbitmap = vec![0u8; geo.bs as usize];
        for bit in 0..used as usize {
            bitarray::set_bit(&mut bbitmap, bit);
        }
        for bit in in_group as usize..geo.blocks_per_group as usize {
            bitarray::set_bit(&mut bbitmap, bit);
        }
        blockdev::write_at(dev, block_bitmap_at * geo.bs as u64, &bbitmap)?;

        // Inode bitmap: reserved inodes in group 0, padding at the
        // tail.
        let mut ibitmap = vec![0u8; geo.bs as usize];
        if g == 0 {
            for bit in 0..(EXT2_GOOD_OLD_FIRST_INO - 1) as usize {
                bitarray::set_bit(&mut ibitmap, bit);
            }
        }
        for bit in geo.inodes_per_group as usize..geo.bs as usize * 8 {
            bitarray::set_bit(&mut ibitmap, bit);
        }
        blockdev::write_at(dev, inode_bitmap_at * geo.bs as u64, &ibitmap)?;

        // Inode table starts zeroed (fresh device); nothing to write.

        let free_blocks = in_group - used;
        let free_inodes = if g == 0 {
            geo.inodes_per_group - EXT2_GOOD_OLD_FIRST_INO
        } else {
            geo.inodes_per_group
        };
        total_free_blocks += free_blocks as u64;

        let mut gd = super::GroupDesc::new_empty(geo.desc_size);
        gd.set_block_bitmap(block_bitmap_at);
        gd.set_inode_bitmap(inode_bitmap_at);
        gd.set_inode_table(inode_table_at);
        gd.set_free_blocks(free_blocks);
        gd.set_free_inodes(free_inodes);
        gd.set_used_dirs(if g == 0 { 1 } else { 0 });
        if let Some(seed) = seed {
            gd.set_block_bitmap_csum(csum::bitmap_csum(
                seed,
                &bbitmap,
                geo.blocks_per_group as usize / 8,
            ));
            gd.set_inode_bitmap_csum(csum::bitmap_csum(
                seed,
                &ibitmap,
                (geo.inodes_per_group as usize + 7) / 8,
            ));
            gd.set_checksum(csum::group_desc_csum(seed, g, &gd.raw));
        }
        descriptors.push(gd.raw);
    }

    sup.set_free_blocks_count(total_free_blocks);
    sup.set_free_inodes_count(
        geo.inodes_per_group * geo.groups - EXT2_GOOD_OLD_FIRST_INO,
    );

    // Root directory: inode 2 plus one data block of entries.
    let mut root = DiskInode::new_empty(geo.inode_size);
    root.set_mode((crate::fs::S_IFDIR | 0o755) as u16);
    root.set_links_count(2);
    root.set_size(geo.bs as u64);
    root.set_blocks(geo.bs / 512);
    root.set_atime(now);
    root.set_mtime(now);
    root.set_ctime(now);
    if geo.inode_size > 128 {
        super::put_u16(&mut root.raw, 128, 32);
    }
    if opts.extents {
        extent::init_root(&mut root);
        let area = root.block_area_mut();
        extent::ExtentHeader {
            entries: 1,
            max: extent::ROOT_MAX_ENTRIES,
            depth: 0,
            generation: 0,
        }
        .encode(area);
        // One extent covering the single directory block.
        super::put_u32(area, 12, 0);
        super::put_u16(area, 16, 1);
        super::put_u16(area, 18, (root_data_block >> 32) as u16);
        super::put_u32(area, 20, root_data_block as u32);
    } else {
        root.set_block_slot(0, root_data_block as u32);
    }
    root.update_checksum(seed, EXT2_ROOT_INO);

    // Write the root inode into group 0's table.
    let itable0 = geo.first_data_block as u64 + 1 + geo.desc_blocks as u64 + 2;
    let root_off =
        itable0 * geo.bs as u64 + (EXT2_ROOT_INO as u64 - 1) * geo.inode_size as u64;
    blockdev::write_at(dev, root_off, &root.raw)?;

    // Root directory block: "." and "..", both the root itself.
    let mut root_block = vec![0u8; geo.bs as usize];
    let usable = if seed.is_some() {
        geo.bs as usize - dir::TAIL_SIZE
    } else {
        geo.bs as usize
    };
    let dot_len = dir::rec_len_for(1);
    encode_dirent(&mut root_block, 0, EXT2_ROOT_INO, dot_len as u16, FT_DIR, ".");
    encode_dirent(
        &mut root_block,
        dot_len,
        EXT2_ROOT_INO,
        (usable - dot_len) as u16,
        FT_DIR,
        "..",
    );
    if let Some(seed) = seed {
        let iseed = csum::inode_seed(seed, EXT2_ROOT_INO, 0);
        let tail = geo.bs as usize - dir::TAIL_SIZE;
        root_block[tail + 4..tail + 6].copy_from_slice(&(dir::TAIL_SIZE as u16).to_le_bytes());
        root_block[tail + 7] = 0xde;
        let crc = csum::dirent_block_csum(iseed, &root_block);
        root_block[tail + 8..tail + 12].copy_from_slice(&crc.to_le_bytes());
    }
    blockdev::write_at(dev, root_data_block * geo.bs as u64, &root_block)?;

    // Descriptor tables and superblocks, primary plus backups.
    let desc_size = geo.desc_size as usize;
    let per_block = geo.bs as usize / desc_size;
    for g in 0..geo.groups {
        if !group_has_super(&sup, g) {
            continue;
        }
        let start = geo.first_data_block as u64 + g as u64 * geo.blocks_per_group as u64;
        sup.update_checksum();
        if g == 0 {
            blockdev::write_at(dev, SUPERBLOCK_OFFSET, &sup.raw)?;
        } else {
            blockdev::write_at(dev, start * geo.bs as u64, &sup.raw)?;
        }
        for blk in 0..geo.desc_blocks as usize {
            let mut data = vec![0u8; geo.bs as usize];
            for slot in 0..per_block {
                let index = blk * per_block + slot;
                if index >= descriptors.len() {
                    break;
                }
                data[slot * desc_size..(slot + 1) * desc_size]
                    .copy_from_slice(&descriptors[index]);
            }
            blockdev::write_at(
                dev,
                (start + 1 + blk as u64) * geo.bs as u64,
                &data,
            )?;
        }
    }
    dev.flush()
}

fn encode_dirent(block: &mut [u8], off: usize, ino: u32, rec_len: u16, ft: u8, name: &str) {
    block[off..off + 4].copy_from_slice(&ino.to_le_bytes());
    block[off + 4..off + 6].copy_from_slice(&rec_len.to_le_bytes());
    block[off + 6] = name.len() as u8;
    block[off + 7] = ft;
    block[off + 8..off + 8 + name.len()].copy_from_slice(name.as_bytes());
}
