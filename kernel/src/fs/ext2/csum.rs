//! Metadata checksums
//!
//! With the METADATA_CSUM ro-compat feature every piece of metadata
//! carries a CRC32C: the superblock over its first 1020 bytes, group
//! descriptors seeded with the group number, bitmaps over their
//! in-group span, inodes seeded with number and generation, extent
//! blocks and directory-block tails with the owning inode's seed.
//!
//! The CRC here is the raw Castagnoli update (no final inversion), so
//! the caller supplies `!0` where the on-disk format expects it.

use super::Ext2Fs;

/// Castagnoli polynomial, reflected.
const CRC32C_POLY: u32 = 0x82f6_3b78;

fn table() -> &'static [u32; 256] {
    static TABLE: spin::Once<[u32; 256]> = spin::Once::new();
    TABLE.call_once(|| {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ CRC32C_POLY
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    })
}

/// One CRC32C update pass over `data`.
pub fn crc32c(mut crc: u32, data: &[u8]) -> u32 {
    let table = table();
    for &byte in data {
        crc = (crc >> 8) ^ table[((crc ^ byte as u32) & 0xff) as usize];
    }
    crc
}

/// Superblock checksum: CRC32C(~0) over bytes 0..1020.
pub fn superblock_csum(raw: &[u8]) -> u32 {
    crc32c(!0, &raw[..1020])
}

/// Group-descriptor checksum: seeded with the little-endian group
/// number, taken over the descriptor with its checksum field (offset
/// 30) zeroed.
pub fn group_desc_csum(seed: u32, group: u32, raw_desc: &[u8]) -> u16 {
    let mut crc = crc32c(seed, &group.to_le_bytes());
    crc = crc32c(crc, &raw_desc[..30]);
    crc = crc32c(crc, &[0, 0]);
    if raw_desc.len() > 32 {
        crc = crc32c(crc, &raw_desc[32..]);
    }
    (crc & 0xffff) as u16
}

/// Bitmap checksum over the first `nbytes` of the bitmap block.
pub fn bitmap_csum(seed: u32, bitmap: &[u8], nbytes: usize) -> u32 {
    crc32c(seed, &bitmap[..nbytes])
}

/// The per-inode checksum seed: filesystem seed folded with the inode
/// number and generation.
pub fn inode_seed(seed: u32, ino: u32, generation: u32) -> u32 {
    let crc = crc32c(seed, &ino.to_le_bytes());
    crc32c(crc, &generation.to_le_bytes())
}

/// Inode checksum over the raw inode with the checksum fields zeroed
/// (lo at 124, hi at 130 when the inode is large enough).
pub fn inode_csum(seed: u32, ino: u32, generation: u32, raw: &[u8]) -> u32 {
    let iseed = inode_seed(seed, ino, generation);
    let mut crc = crc32c(iseed, &raw[..124]);
    crc = crc32c(crc, &[0, 0]);
    crc = crc32c(crc, &raw[126..128.min(raw.len())]);
    if raw.len() > 128 {
        crc = crc32c(crc, &raw[128..130]);
        crc = crc32c(crc, &[0, 0]);
        crc = crc32c(crc, &raw[132..]);
    }
    crc
}

/// Extent-block checksum over everything before the tail.
pub fn extent_block_csum(iseed: u32, block: &[u8], tail_offset: usize) -> u32 {
    crc32c(iseed, &block[..tail_offset])
}

/// Directory-block checksum over everything before the 12-byte tail.
pub fn dirent_block_csum(iseed: u32, block: &[u8]) -> u32 {
    crc32c(iseed, &block[..block.len() - 12])
}

impl Ext2Fs {
    /// The filesystem checksum seed, when metadata checksums are on.
    pub fn csum_seed(&self) -> Option<u32> {
        self.csum_seed
    }

    /// Per-inode seed helper.
    pub fn inode_csum_seed(&self, ino: u32, generation: u32) -> Option<u32> {
        self.csum_seed.map(|s| inode_seed(s, ino, generation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32c_known_vectors() {
        // Standard CRC-32C test vector: "123456789" -> 0xE3069283
        // (reported with the customary pre/post inversion).
        let crc = crc32c(!0, b"123456789") ^ !0u32;
        assert_eq!(crc, 0xe306_9283);
        // 32 zero bytes -> 0x8A9136AA.
        let crc = crc32c(!0, &[0u8; 32]) ^ !0u32;
        assert_eq!(crc, 0x8a91_36aa);
    }

    #[test]
    fn group_desc_csum_ignores_stored_checksum() {
        let mut desc = [0u8; 32];
        desc[0] = 0x12;
        let a = group_desc_csum(0x1234, 5, &desc);
        desc[30] = 0xff;
        desc[31] = 0xff;
        let b = group_desc_csum(0x1234, 5, &desc);
        assert_eq!(a, b);
    }

    #[test]
    fn inode_csum_ignores_checksum_fields() {
        let mut raw = [0u8; 128];
        raw[0] = 0xa5;
        let a = inode_csum(7, 12, 1, &raw);
        raw[124] = 0xde;
        raw[125] = 0xad;
        let b = inode_csum(7, 12, 1, &raw);
        assert_eq!(a, b);
    }

    #[test]
    fn seeds_differ_per_inode() {
        assert_ne!(inode_seed(1, 2, 3), inode_seed(1, 3, 2));
    }
}
