//! ext2-family on-disk driver
//!
//! Implements the classic ext2 layout plus the optional 64-bit,
//! extent, and metadata-checksum features: superblock and block-group
//! descriptors, block and inode bitmaps, indirect and extent block
//! mapping, packed directory records, and an xattr block.
//!
//! On-disk structures are kept as raw little-endian byte images with
//! typed accessors, so what is checksummed and written is always
//! exactly what was read.

pub mod balloc;
pub mod bmap;
pub mod csum;
pub mod dir;
pub mod extent;
pub mod inode;
pub mod mkfs;
pub mod superblock;
pub mod xattr;

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Errno, KResult};
use crate::fs::blockdev::{self, BlockDevice};

/// ext2 superblock magic.
pub const EXT2_MAGIC: u16 = 0xef53;
/// Byte offset of the primary superblock.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// Size of the on-disk superblock image.
pub const SUPERBLOCK_SIZE: usize = 1024;
/// First non-reserved inode on revision-0 filesystems.
pub const EXT2_GOOD_OLD_FIRST_INO: u32 = 11;
/// Root directory inode.
pub const EXT2_ROOT_INO: u32 = 2;
/// Inode size on revision-0 filesystems.
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;
/// Number of direct block slots in an inode.
pub const EXT2_NDIR_BLOCKS: usize = 12;
/// Index of the single indirect slot.
pub const EXT2_IND_BLOCK: usize = 12;
/// Index of the double indirect slot.
pub const EXT2_DIND_BLOCK: usize = 13;
/// Index of the triple indirect slot.
pub const EXT2_TIND_BLOCK: usize = 14;

// Filesystem states.
pub const EXT2_VALID_FS: u16 = 1;
pub const EXT2_ERROR_FS: u16 = 2;

// Incompat features.
pub const INCOMPAT_FILETYPE: u32 = 0x0002;
pub const INCOMPAT_EXTENTS: u32 = 0x0040;
pub const INCOMPAT_64BIT: u32 = 0x0080;
pub const INCOMPAT_CSUM_SEED: u32 = 0x2000;
/// Everything this driver can mount.
pub const INCOMPAT_SUPPORTED: u32 =
    INCOMPAT_FILETYPE | INCOMPAT_EXTENTS | INCOMPAT_64BIT | INCOMPAT_CSUM_SEED;

// Ro-compat features.
pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x0001;
pub const RO_COMPAT_LARGE_FILE: u32 = 0x0002;
pub const RO_COMPAT_HUGE_FILE: u32 = 0x0008;
pub const RO_COMPAT_GDT_CSUM: u32 = 0x0010;
pub const RO_COMPAT_METADATA_CSUM: u32 = 0x0400;
/// Ro-compat features safe for read-write mounts.
pub const RO_COMPAT_SUPPORTED: u32 =
    RO_COMPAT_SPARSE_SUPER | RO_COMPAT_LARGE_FILE | RO_COMPAT_HUGE_FILE | RO_COMPAT_METADATA_CSUM;

// Inode flags.
pub const EXT4_EXTENTS_FL: u32 = 0x0008_0000;
pub const EXT4_INLINE_DATA_FL: u32 = 0x1000_0000;

// Directory-entry file types.
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;
pub const FT_CHRDEV: u8 = 3;
pub const FT_BLKDEV: u8 = 4;
pub const FT_FIFO: u8 = 5;
pub const FT_SOCK: u8 = 6;
pub const FT_SYMLINK: u8 = 7;

fn get_u16(raw: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([raw[off], raw[off + 1]])
}

fn get_u32(raw: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]])
}

fn put_u16(raw: &mut [u8], off: usize, value: u16) {
    raw[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(raw: &mut [u8], off: usize, value: u32) {
    raw[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

// ---------------------------------------------------------------------------
// Superblock
// ---------------------------------------------------------------------------

/// The on-disk superblock as a raw 1024-byte image with typed
/// accessors.
#[derive(Clone)]
pub struct Ext2Super {
    pub raw: Vec<u8>,
}

macro_rules! sb_field_u32 {
    ($get:ident, $set:ident, $off:expr) => {
        pub fn $get(&self) -> u32 {
            get_u32(&self.raw, $off)
        }

        pub fn $set(&mut self, value: u32) {
            put_u32(&mut self.raw, $off, value);
        }
    };
}

macro_rules! sb_field_u16 {
    ($get:ident, $set:ident, $off:expr) => {
        pub fn $get(&self) -> u16 {
            get_u16(&self.raw, $off)
        }

        pub fn $set(&mut self, value: u16) {
            put_u16(&mut self.raw, $off, value);
        }
    };
}

impl Ext2Super {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        debug_assert_eq!(raw.len(), SUPERBLOCK_SIZE);
        Self { raw }
    }

    pub fn new_empty() -> Self {
        Self {
            raw: vec![0u8; SUPERBLOCK_SIZE],
        }
    }

    sb_field_u32!(inodes_count, set_inodes_count, 0);
    sb_field_u32!(blocks_count_lo, set_blocks_count_lo, 4);
    sb_field_u32!(r_blocks_count, set_r_blocks_count, 8);
    sb_field_u32!(free_blocks_count_lo, set_free_blocks_count_lo, 12);
    sb_field_u32!(free_inodes_count, set_free_inodes_count, 16);
    sb_field_u32!(first_data_block, set_first_data_block, 20);
    sb_field_u32!(log_block_size, set_log_block_size, 24);
    sb_field_u32!(log_cluster_size, set_log_cluster_size, 28);
    sb_field_u32!(blocks_per_group, set_blocks_per_group, 32);
    sb_field_u32!(clusters_per_group, set_clusters_per_group, 36);
    sb_field_u32!(inodes_per_group, set_inodes_per_group, 40);
    sb_field_u32!(mtime, set_mtime, 44);
    sb_field_u32!(wtime, set_wtime, 48);
    sb_field_u16!(mnt_count, set_mnt_count, 52);
    sb_field_u16!(max_mnt_count, set_max_mnt_count, 54);
    sb_field_u16!(magic, set_magic, 56);
    sb_field_u16!(state, set_state, 58);
    sb_field_u16!(errors, set_errors, 60);
    sb_field_u32!(lastcheck, set_lastcheck, 64);
    sb_field_u32!(rev_level, set_rev_level, 76);
    sb_field_u32!(first_ino_raw, set_first_ino_raw, 84);
    sb_field_u16!(inode_size_raw, set_inode_size_raw, 88);
    sb_field_u32!(feature_compat, set_feature_compat, 92);
    sb_field_u32!(feature_incompat, set_feature_incompat, 96);
    sb_field_u32!(feature_ro_compat, set_feature_ro_compat, 100);
    sb_field_u16!(desc_size_raw, set_desc_size_raw, 254);
    sb_field_u32!(blocks_count_hi, set_blocks_count_hi, 336);
    sb_field_u32!(free_blocks_count_hi, set_free_blocks_count_hi, 344);
    sb_field_u32!(checksum_seed, set_checksum_seed, 624);
    sb_field_u32!(checksum, set_checksum, 1020);

    pub fn uuid(&self) -> &[u8] {
        &self.raw[104..120]
    }

    pub fn set_uuid(&mut self, uuid: &[u8; 16]) {
        self.raw[104..120].copy_from_slice(uuid);
    }

    pub fn block_size(&self) -> u32 {
        1024 << self.log_block_size()
    }

    pub fn has_incompat(&self, feature: u32) -> bool {
        self.feature_incompat() & feature != 0
    }

    pub fn has_ro_compat(&self, feature: u32) -> bool {
        self.feature_ro_compat() & feature != 0
    }

    /// Total blocks, honoring the 64-bit feature.
    pub fn blocks_count(&self) -> u64 {
        let hi = if self.has_incompat(INCOMPAT_64BIT) {
            self.blocks_count_hi() as u64
        } else {
            0
        };
        (hi << 32) | self.blocks_count_lo() as u64
    }

    pub fn set_blocks_count(&mut self, count: u64) {
        self.set_blocks_count_lo(count as u32);
        if self.has_incompat(INCOMPAT_64BIT) {
            self.set_blocks_count_hi((count >> 32) as u32);
        }
    }

    pub fn free_blocks_count(&self) -> u64 {
        let hi = if self.has_incompat(INCOMPAT_64BIT) {
            self.free_blocks_count_hi() as u64
        } else {
            0
        };
        (hi << 32) | self.free_blocks_count_lo() as u64
    }

    pub fn set_free_blocks_count(&mut self, count: u64) {
        self.set_free_blocks_count_lo(count as u32);
        if self.has_incompat(INCOMPAT_64BIT) {
            self.set_free_blocks_count_hi((count >> 32) as u32);
        }
    }

    pub fn inode_size(&self) -> u16 {
        if self.rev_level() == 0 {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            self.inode_size_raw()
        }
    }

    pub fn first_ino(&self) -> u32 {
        if self.rev_level() == 0 {
            EXT2_GOOD_OLD_FIRST_INO
        } else {
            self.first_ino_raw()
        }
    }

    /// Group-descriptor size: 32 bytes classic, `s_desc_size` with the
    /// 64-bit feature.
    pub fn desc_size(&self) -> u16 {
        if self.has_incompat(INCOMPAT_64BIT) {
            self.desc_size_raw().max(32)
        } else {
            32
        }
    }

    pub fn group_count(&self) -> u32 {
        let data_blocks = self.blocks_count() - self.first_data_block() as u64;
        crate::util::div_ceil64(data_blocks, self.blocks_per_group() as u64) as u32
    }

    /// Refresh the stored checksum (no-op without METADATA_CSUM).
    pub fn update_checksum(&mut self) {
        if self.has_ro_compat(RO_COMPAT_METADATA_CSUM) {
            let csum = csum::superblock_csum(&self.raw);
            self.set_checksum(csum);
        }
    }

    /// Validate the stored checksum.
    pub fn checksum_valid(&self) -> bool {
        if !self.has_ro_compat(RO_COMPAT_METADATA_CSUM) {
            return true;
        }
        self.checksum() == csum::superblock_csum(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Group descriptors
// ---------------------------------------------------------------------------

/// One block-group descriptor (raw image, 32 or 64 bytes).
#[derive(Clone)]
pub struct GroupDesc {
    pub raw: Vec<u8>,
}

impl GroupDesc {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn new_empty(desc_size: u16) -> Self {
        Self {
            raw: vec![0u8; desc_size as usize],
        }
    }

    fn wide(&self) -> bool {
        self.raw.len() >= 64
    }

    fn get64(&self, lo_off: usize, hi_off: usize) -> u64 {
        let lo = get_u32(&self.raw, lo_off) as u64;
        let hi = if self.wide() {
            get_u32(&self.raw, hi_off) as u64
        } else {
            0
        };
        (hi << 32) | lo
    }

    fn put64(&mut self, lo_off: usize, hi_off: usize, value: u64) {
        put_u32(&mut self.raw, lo_off, value as u32);
        if self.wide() {
            put_u32(&mut self.raw, hi_off, (value >> 32) as u32);
        }
    }

    fn get32_split(&self, lo_off: usize, hi_off: usize) -> u32 {
        let lo = get_u16(&self.raw, lo_off) as u32;
        let hi = if self.wide() {
            get_u16(&self.raw, hi_off) as u32
        } else {
            0
        };
        (hi << 16) | lo
    }

    fn put32_split(&mut self, lo_off: usize, hi_off: usize, value: u32) {
        put_u16(&mut self.raw, lo_off, value as u16);
        if self.wide() {
            put_u16(&mut self.raw, hi_off, (value >> 16) as u16);
        }
    }

    pub fn block_bitmap(&self) -> u64 {
        self.get64(0, 32)
    }

    pub fn set_block_bitmap(&mut self, block: u64) {
        self.put64(0, 32, block);
    }

    pub fn inode_bitmap(&self) -> u64 {
        self.get64(4, 36)
    }

    pub fn set_inode_bitmap(&mut self, block: u64) {
        self.put64(4, 36, block);
    }

    pub fn inode_table(&self) -> u64 {
        self.get64(8, 40)
    }

    pub fn set_inode_table(&mut self, block: u64) {
        self.put64(8, 40, block);
    }

    pub fn free_blocks(&self) -> u32 {
        self.get32_split(12, 44)
    }

    pub fn set_free_blocks(&mut self, count: u32) {
        self.put32_split(12, 44, count);
    }

    pub fn free_inodes(&self) -> u32 {
        self.get32_split(14, 46)
    }

    pub fn set_free_inodes(&mut self, count: u32) {
        self.put32_split(14, 46, count);
    }

    pub fn used_dirs(&self) -> u32 {
        self.get32_split(16, 48)
    }

    pub fn set_used_dirs(&mut self, count: u32) {
        self.put32_split(16, 48, count);
    }

    pub fn block_bitmap_csum(&self) -> u16 {
        get_u16(&self.raw, 24)
    }

    pub fn set_block_bitmap_csum(&mut self, csum: u32) {
        put_u16(&mut self.raw, 24, csum as u16);
        if self.wide() {
            put_u16(&mut self.raw, 56, (csum >> 16) as u16);
        }
    }

    pub fn inode_bitmap_csum(&self) -> u16 {
        get_u16(&self.raw, 26)
    }

    pub fn set_inode_bitmap_csum(&mut self, csum: u32) {
        put_u16(&mut self.raw, 26, csum as u16);
        if self.wide() {
            put_u16(&mut self.raw, 58, (csum >> 16) as u16);
        }
    }

    pub fn checksum(&self) -> u16 {
        get_u16(&self.raw, 30)
    }

    pub fn set_checksum(&mut self, csum: u16) {
        put_u16(&mut self.raw, 30, csum);
    }
}

// ---------------------------------------------------------------------------
// On-disk inode
// ---------------------------------------------------------------------------

/// One on-disk inode as a raw image with typed accessors.
#[derive(Clone)]
pub struct DiskInode {
    pub raw: Vec<u8>,
}

impl DiskInode {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self { raw }
    }

    pub fn new_empty(inode_size: u16) -> Self {
        Self {
            raw: vec![0u8; inode_size as usize],
        }
    }

    pub fn mode(&self) -> u16 {
        get_u16(&self.raw, 0)
    }

    pub fn set_mode(&mut self, mode: u16) {
        put_u16(&mut self.raw, 0, mode);
    }

    pub fn uid(&self) -> u32 {
        get_u16(&self.raw, 2) as u32 | ((get_u16(&self.raw, 120) as u32) << 16)
    }

    pub fn set_uid(&mut self, uid: u32) {
        put_u16(&mut self.raw, 2, uid as u16);
        put_u16(&mut self.raw, 120, (uid >> 16) as u16);
    }

    pub fn gid(&self) -> u32 {
        get_u16(&self.raw, 24) as u32 | ((get_u16(&self.raw, 122) as u32) << 16)
    }

    pub fn set_gid(&mut self, gid: u32) {
        put_u16(&mut self.raw, 24, gid as u16);
        put_u16(&mut self.raw, 122, (gid >> 16) as u16);
    }

    /// File size; the high half (offset 108) applies to regular files.
    pub fn size(&self) -> u64 {
        let lo = get_u32(&self.raw, 4) as u64;
        let is_reg = self.mode() & 0xf000 == 0x8000;
        if is_reg {
            lo | ((get_u32(&self.raw, 108) as u64) << 32)
        } else {
            lo
        }
    }

    pub fn set_size(&mut self, size: u64) {
        put_u32(&mut self.raw, 4, size as u32);
        if self.mode() & 0xf000 == 0x8000 {
            put_u32(&mut self.raw, 108, (size >> 32) as u32);
        }
    }

    pub fn atime(&self) -> u32 {
        get_u32(&self.raw, 8)
    }

    pub fn set_atime(&mut self, t: u32) {
        put_u32(&mut self.raw, 8, t);
    }

    pub fn ctime(&self) -> u32 {
        get_u32(&self.raw, 12)
    }

    pub fn set_ctime(&mut self, t: u32) {
        put_u32(&mut self.raw, 12, t);
    }

    pub fn mtime(&self) -> u32 {
        get_u32(&self.raw, 16)
    }

    pub fn set_mtime(&mut self, t: u32) {
        put_u32(&mut self.raw, 16, t);
    }

    pub fn dtime(&self) -> u32 {
        get_u32(&self.raw, 20)
    }

    pub fn set_dtime(&mut self, t: u32) {
        put_u32(&mut self.raw, 20, t);
    }

    pub fn links_count(&self) -> u16 {
        get_u16(&self.raw, 26)
    }

    pub fn set_links_count(&mut self, links: u16) {
        put_u16(&mut self.raw, 26, links);
    }

    /// Occupied 512-byte sectors.
    pub fn blocks(&self) -> u32 {
        get_u32(&self.raw, 28)
    }

    pub fn set_blocks(&mut self, blocks: u32) {
        put_u32(&mut self.raw, 28, blocks);
    }

    pub fn flags(&self) -> u32 {
        get_u32(&self.raw, 32)
    }

    pub fn set_flags(&mut self, flags: u32) {
        put_u32(&mut self.raw, 32, flags);
    }

    pub fn block_slot(&self, index: usize) -> u32 {
        get_u32(&self.raw, 40 + index * 4)
    }

    pub fn set_block_slot(&mut self, index: usize, value: u32) {
        put_u32(&mut self.raw, 40 + index * 4, value);
    }

    /// The 60-byte i_block area (extent tree root, fast symlink body).
    pub fn block_area(&self) -> &[u8] {
        &self.raw[40..100]
    }

    pub fn block_area_mut(&mut self) -> &mut [u8] {
        &mut self.raw[40..100]
    }

    pub fn generation(&self) -> u32 {
        get_u32(&self.raw, 100)
    }

    pub fn set_generation(&mut self, generation: u32) {
        put_u32(&mut self.raw, 100, generation);
    }

    pub fn file_acl(&self) -> u32 {
        get_u32(&self.raw, 104)
    }

    pub fn set_file_acl(&mut self, block: u32) {
        put_u32(&mut self.raw, 104, block);
    }

    pub fn uses_extents(&self) -> bool {
        self.flags() & EXT4_EXTENTS_FL != 0
    }

    /// Refresh the stored checksum fields.
    pub fn update_checksum(&mut self, seed: Option<u32>, ino: u32) {
        let Some(seed) = seed else { return };
        let crc = csum::inode_csum(seed, ino, self.generation(), &self.raw);
        put_u16(&mut self.raw, 124, crc as u16);
        if self.raw.len() > 128 {
            // i_checksum_hi sits right after i_extra_isize.
            put_u16(&mut self.raw, 130, (crc >> 16) as u16);
        }
    }

    pub fn checksum_valid(&self, seed: Option<u32>, ino: u32) -> bool {
        let Some(seed) = seed else { return true };
        let crc = csum::inode_csum(seed, ino, self.generation(), &self.raw);
        if get_u16(&self.raw, 124) != crc as u16 {
            return false;
        }
        if self.raw.len() > 128 && get_u16(&self.raw, 130) != (crc >> 16) as u16 {
            return false;
        }
        true
    }
}

/// The registrable filesystem type instance.
pub static EXT2_FS_TYPE: superblock::Ext2FsType = superblock::Ext2FsType;

/// Register ext2 with the VFS type table.
pub fn init() -> KResult<()> {
    crate::fs::register(&EXT2_FS_TYPE)
}

/// Map a directory-entry file type to the mode bits and back.
pub fn file_type_to_mode_bits(ft: u8) -> u32 {
    match ft {
        FT_REG_FILE => crate::fs::S_IFREG,
        FT_DIR => crate::fs::S_IFDIR,
        FT_CHRDEV => crate::fs::S_IFCHR,
        FT_BLKDEV => crate::fs::S_IFBLK,
        FT_FIFO => crate::fs::S_IFIFO,
        FT_SOCK => crate::fs::S_IFSOCK,
        FT_SYMLINK => crate::fs::S_IFLNK,
        _ => 0,
    }
}

pub fn mode_to_file_type(mode: u32) -> u8 {
    match mode & crate::fs::S_IFMT {
        crate::fs::S_IFREG => FT_REG_FILE,
        crate::fs::S_IFDIR => FT_DIR,
        crate::fs::S_IFCHR => FT_CHRDEV,
        crate::fs::S_IFBLK => FT_BLKDEV,
        crate::fs::S_IFIFO => FT_FIFO,
        crate::fs::S_IFSOCK => FT_SOCK,
        crate::fs::S_IFLNK => FT_SYMLINK,
        _ => FT_UNKNOWN,
    }
}

// ---------------------------------------------------------------------------
// In-memory filesystem state
// ---------------------------------------------------------------------------

/// One mounted ext2 instance.
pub struct Ext2Fs {
    pub dev: Arc<dyn BlockDevice>,
    pub sup: Mutex<Ext2Super>,
    pub groups: Mutex<Vec<GroupDesc>>,
    pub block_size: u32,
    pub inode_size: u16,
    pub desc_size: u16,
    pub groups_count: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub first_data_block: u32,
    pub(super) csum_seed: Option<u32>,
    pub has_filetype: bool,
    pub has_extents: bool,
    pub readonly: core::sync::atomic::AtomicBool,
}

impl core::fmt::Debug for Ext2Fs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ext2Fs").field("block_size", &self.block_size).finish()
    }
}

impl Ext2Fs {
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn write_guard(&self) -> KResult<()> {
        if self.is_readonly() {
            Err(Errno::Erofs)
        } else {
            Ok(())
        }
    }

    /// Read one filesystem block.
    pub fn read_block(&self, block: u64) -> KResult<Vec<u8>> {
        let mut buf = vec![0u8; self.block_size as usize];
        blockdev::read_at(&*self.dev, block * self.block_size as u64, &mut buf)?;
        Ok(buf)
    }

    /// Write one filesystem block.
    pub fn write_block(&self, block: u64, buf: &[u8]) -> KResult<()> {
        debug_assert_eq!(buf.len(), self.block_size as usize);
        blockdev::write_at(&*self.dev, block * self.block_size as u64, buf)
    }

    /// Zero one filesystem block.
    pub fn zero_block(&self, block: u64) -> KResult<()> {
        let zeros = vec![0u8; self.block_size as usize];
        self.write_block(block, &zeros)
    }

    /// The group a block lives in.
    pub fn block_group(&self, block: u64) -> u32 {
        ((block - self.first_data_block as u64) / self.blocks_per_group as u64) as u32
    }

    /// First block of a group.
    pub fn group_first_block(&self, group: u32) -> u64 {
        self.first_data_block as u64 + group as u64 * self.blocks_per_group as u64
    }

    /// Number of blocks in a (possibly short, final) group.
    pub fn blocks_in_group(&self, group: u32) -> u32 {
        let total = self.sup.lock().blocks_count();
        let first = self.group_first_block(group);
        let span = total - first;
        span.min(self.blocks_per_group as u64) as u32
    }

    /// The group an inode lives in.
    pub fn inode_group(&self, ino: u32) -> u32 {
        (ino - 1) / self.inodes_per_group
    }

    /// Mark the superblock with an error state (on-disk corruption
    /// found while mounted).
    pub fn mark_error(&self) {
        let mut sup = self.sup.lock();
        let new_state = sup.state() | EXT2_ERROR_FS;
        sup.set_state(new_state);
        sup.update_checksum();
        let raw = sup.raw.clone();
        drop(sup);
        let _ = blockdev::write_at(&*self.dev, SUPERBLOCK_OFFSET, &raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_accessors_round_trip() {
        let mut sup = Ext2Super::new_empty();
        sup.set_magic(EXT2_MAGIC);
        sup.set_log_block_size(2);
        sup.set_blocks_per_group(32768);
        assert_eq!(sup.magic(), EXT2_MAGIC);
        assert_eq!(sup.block_size(), 4096);
        assert_eq!(sup.blocks_per_group(), 32768);
    }

    #[test]
    fn sixty_four_bit_counts_split_across_halves() {
        let mut sup = Ext2Super::new_empty();
        sup.set_feature_incompat(INCOMPAT_64BIT);
        sup.set_desc_size_raw(64);
        sup.set_blocks_count(0x1_2345_6789);
        assert_eq!(sup.blocks_count_lo(), 0x2345_6789);
        assert_eq!(sup.blocks_count_hi(), 1);
        assert_eq!(sup.blocks_count(), 0x1_2345_6789);
        assert_eq!(sup.desc_size(), 64);
    }

    #[test]
    fn group_desc_wide_fields() {
        let mut gd = GroupDesc::new_empty(64);
        gd.set_block_bitmap(0x1_0000_0010);
        gd.set_free_blocks(0x1_2345);
        assert_eq!(gd.block_bitmap(), 0x1_0000_0010);
        assert_eq!(gd.free_blocks(), 0x1_2345);

        let mut narrow = GroupDesc::new_empty(32);
        narrow.set_block_bitmap(0x10);
        narrow.set_free_blocks(77);
        assert_eq!(narrow.block_bitmap(), 0x10);
        assert_eq!(narrow.free_blocks(), 77);
    }

    #[test]
    fn disk_inode_size_uses_high_half_for_regular_files() {
        let mut ino = DiskInode::new_empty(256);
        ino.set_mode(0x81a4); // S_IFREG | 0644
        ino.set_size(0x1_0000_0001);
        assert_eq!(ino.size(), 0x1_0000_0001);

        let mut dir = DiskInode::new_empty(256);
        dir.set_mode(0x41ed); // S_IFDIR | 0755
        dir.set_size(4096);
        assert_eq!(dir.size(), 4096);
    }

    #[test]
    fn inode_checksum_round_trip() {
        let mut ino = DiskInode::new_empty(128);
        ino.set_mode(0x81a4);
        ino.set_size(1234);
        ino.set_generation(9);
        ino.update_checksum(Some(0xabcd), 12);
        assert!(ino.checksum_valid(Some(0xabcd), 12));
        ino.set_size(999);
        assert!(!ino.checksum_valid(Some(0xabcd), 12));
        assert!(ino.checksum_valid(None, 12), "no feature, no check");
    }

    #[test]
    fn file_type_mapping_round_trips() {
        for ft in [FT_REG_FILE, FT_DIR, FT_CHRDEV, FT_BLKDEV, FT_FIFO, FT_SOCK, FT_SYMLINK] {
            assert_eq!(mode_to_file_type(file_type_to_mode_bits(ft)), ft);
        }
    }
}
