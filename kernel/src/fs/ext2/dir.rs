//! Directory entries
//!
//! A directory's data blocks hold packed records `{inode, rec_len,
//! name_len, file_type, name}` with 4-byte alignment; the final record
//! stretches to the block end, so the records of one block always sum
//! to the block size. Deletion merges the dead record into its
//! predecessor (or tombstones the first record with inode 0); insertion
//! reuses tombstones and oversized padding before the directory grows
//! by a block. With metadata checksums every block ends in a 12-byte
//! tail record carrying the checksum.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Errno, KResult};

use super::{csum, get_u16, get_u32, put_u16, put_u32, DiskInode, Ext2Fs, FT_DIR};

/// Longest directory entry name.
pub const EXT2_NAME_MAX: usize = 255;
/// Fixed header bytes of a record.
pub const DIRENT_HEADER: usize = 8;
/// Size of the checksum tail record.
pub const TAIL_SIZE: usize = 12;
/// file_type byte marking the tail record.
const TAIL_FT: u8 = 0xde;

/// Bytes a record with `name_len` needs.
pub fn rec_len_for(name_len: usize) -> usize {
    DIRENT_HEADER + (name_len + 3) / 4 * 4
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirent {
    pub ino: u32,
    pub rec_len: u16,
    pub file_type: u8,
    pub name: String,
}

fn decode_at(block: &[u8], off: usize) -> KResult<Dirent> {
    if off + DIRENT_HEADER > block.len() {
        return Err(Errno::Eio);
    }
    let rec_len = get_u16(block, off + 4);
    let name_len = block[off + 6] as usize;
    if rec_len < DIRENT_HEADER as u16
        || rec_len as usize % 4 != 0
        || off + rec_len as usize > block.len()
        || DIRENT_HEADER + name_len > rec_len as usize
    {
        return Err(Errno::Eio);
    }
    let name_bytes = &block[off + DIRENT_HEADER..off + DIRENT_HEADER + name_len];
    Ok(Dirent {
        ino: get_u32(block, off),
        rec_len,
        file_type: block[off + 7],
        name: String::from_utf8_lossy(name_bytes).into_owned(),
    })
}

fn encode_at(block: &mut [u8], off: usize, ino: u32, rec_len: u16, file_type: u8, name: &str) {
    put_u32(block, off, ino);
    put_u16(block, off + 4, rec_len);
    block[off + 6] = name.len() as u8;
    block[off + 7] = file_type;
    block[off + DIRENT_HEADER..off + DIRENT_HEADER + name.len()]
        .copy_from_slice(name.as_bytes());
}

/// Usable bytes of a directory block (the tail is reserved with
/// metadata checksums).
pub fn usable_len(fs: &Ext2Fs) -> usize {
    let bs = fs.block_size as usize;
    if fs.csum_seed.is_some() {
        bs - TAIL_SIZE
    } else {
        bs
    }
}

/// Stamp the checksum tail of a directory block.
pub fn seal_block(fs: &Ext2Fs, ino: u32, generation: u32, block: &mut [u8]) {
    let Some(seed) = fs.inode_csum_seed(ino, generation) else {
        return;
    };
    let bs = block.len();
    let tail = bs - TAIL_SIZE;
    put_u32(block, tail, 0);
    put_u16(block, tail + 4, TAIL_SIZE as u16);
    block[tail + 6] = 0;
    block[tail + 7] = TAIL_FT;
    let crc = csum::dirent_block_csum(seed, block);
    put_u32(block, tail + 8, crc);
}

/// Validate the checksum tail of a directory block.
pub fn check_block(fs: &Ext2Fs, ino: u32, generation: u32, block: &[u8]) -> KResult<()> {
    let Some(seed) = fs.inode_csum_seed(ino, generation) else {
        return Ok(());
    };
    let tail = block.len() - TAIL_SIZE;
    if block[tail + 7] != TAIL_FT
        || get_u32(block, tail + 8) != csum::dirent_block_csum(seed, block)
    {
        fs.mark_error();
        return Err(Errno::Eio);
    }
    Ok(())
}

/// Walk every record of every data block, calling `visit` with
/// `(block index, offset, entry)`. Stops early when `visit` returns
/// `false`.
fn scan<F: FnMut(u64, usize, &Dirent) -> bool>(
    fs: &Ext2Fs,
    ino: u32,
    di: &DiskInode,
    mut visit: F,
) -> KResult<()> {
    let bs = fs.block_size as u64;
    let blocks = di.size() / bs;
    let usable = usable_len(fs);
    for lblk in 0..blocks {
        let Some(pblk) = fs.bmap(ino, di, lblk)? else {
            continue;
        };
        let data = fs.read_block(pblk)?;
        check_block(fs, ino, di.generation(), &data)?;
        let mut off = 0usize;
        while off < usable {
            let entry = decode_at(&data, off)?;
            if !visit(lblk, off, &entry) {
                return Ok(());
            }
            off += entry.rec_len as usize;
        }
        if off != usable && off != fs.block_size as usize {
            fs.mark_error();
            return Err(Errno::Eio);
        }
    }
    Ok(())
}

/// Find `name`, returning its inode and file type.
pub fn lookup(fs: &Ext2Fs, ino: u32, di: &DiskInode, name: &str) -> KResult<Option<(u32, u8)>> {
    let mut found = None;
    scan(fs, ino, di, |_, _, entry| {
        if entry.ino != 0 && entry.name == name {
            found = Some((entry.ino, entry.file_type));
            false
        } else {
            true
        }
    })?;
    Ok(found)
}

/// Read the live entry at byte cursor `pos`, returning it with the
/// next cursor.
pub fn readdir_at(
    fs: &Ext2Fs,
    ino: u32,
    di: &DiskInode,
    pos: u64,
) -> KResult<Option<(Dirent, u64)>> {
    let bs = fs.block_size as u64;
    let usable = usable_len(fs) as u64;
    let blocks = di.size() / bs;
    let mut cursor = pos;

    while cursor < blocks * bs {
        let lblk = cursor / bs;
        let mut off = (cursor % bs) as u64;
        if off >= usable {
            cursor = (lblk + 1) * bs;
            continue;
        }
        let Some(pblk) = fs.bmap(ino, di, lblk)? else {
            cursor = (lblk + 1) * bs;
            continue;
        };
        let data = fs.read_block(pblk)?;
        check_block(fs, ino, di.generation(), &data)?;
        while off < usable {
            let entry = decode_at(&data, off as usize)?;
            let next = lblk * bs + off + entry.rec_len as u64;
            if entry.ino != 0 {
                let next = if next % bs >= usable { (lblk + 1) * bs } else { next };
                return Ok(Some((entry, next)));
            }
            off += entry.rec_len as u64;
        }
        cursor = (lblk + 1) * bs;
    }
    Ok(None)
}

/// Insert `name -> ino`. Reuses a tombstone or carves the padding of a
/// live entry; otherwise the directory grows by one block. Returns the
/// number of blocks newly allocated.
pub fn insert(
    fs: &Ext2Fs,
    dir_ino: u32,
    di: &mut DiskInode,
    name: &str,
    ino: u32,
    file_type: u8,
) -> KResult<u32> {
    fs.write_guard()?;
    if name.len() > EXT2_NAME_MAX || name.is_empty() {
        return Err(Errno::Enametoolong);
    }
    if lookup(fs, dir_ino, di, name)?.is_some() {
        return Err(Errno::Eexist);
    }
    let needed = rec_len_for(name.len());
    let ft = if fs.has_filetype { file_type } else { 0 };

    // Pass 1: a slot in the existing blocks.
    let mut slot: Option<(u64, usize, Dirent)> = None;
    scan(fs, dir_ino, di, |lblk, off, entry| {
        let fits = if entry.ino == 0 {
            entry.rec_len as usize >= needed
        } else {
            entry.rec_len as usize >= rec_len_for(entry.name.len()) + needed
        };
        if fits {
            slot = Some((lblk, off, entry.clone()));
            false
        } else {
            true
        }
    })?;

    if let Some((lblk, off, entry)) = slot {
        let pblk = fs.bmap(dir_ino, di, lblk)?.ok_or(Errno::Eio)?;
        let mut data = fs.read_block(pblk)?;
        if entry.ino == 0 {
            encode_at(&mut data, off, ino, entry.rec_len, ft, name);
        } else {
            let keep = rec_len_for(entry.name.len());
            let carved = entry.rec_len as usize - keep;
            encode_at(
                &mut data,
                off,
                entry.ino,
                keep as u16,
                entry.file_type,
                &entry.name,
            );
            encode_at(&mut data, off + keep, ino, carved as u16, ft, name);
        }
        seal_block(fs, dir_ino, di.generation(), &mut data);
        fs.write_block(pblk, &data)?;
        return Ok(0);
    }

    // Pass 2: extend the directory.
    let bs = fs.block_size as usize;
    let new_lblk = di.size() / bs as u64;
    let (pblk, fresh) = fs.bmap_alloc(dir_ino, di, new_lblk)?;
    let mut data = alloc::vec![0u8; bs];
    encode_at(&mut data, 0, ino, usable_len(fs) as u16, ft, name);
    seal_block(fs, dir_ino, di.generation(), &mut data);
    fs.write_block(pblk, &data)?;
    di.set_size(di.size() + bs as u64);
    Ok(fresh)
}

/// Remove `name`. The record merges into its predecessor, or becomes a
/// tombstone when it leads its block. Returns the unlinked inode and
/// its file type.
pub fn remove(fs: &Ext2Fs, dir_ino: u32, di: &DiskInode, name: &str) -> KResult<(u32, u8)> {
    fs.write_guard()?;
    let mut target: Option<(u64, usize, Dirent)> = None;
    let mut prev_off: Option<usize> = None;
    let mut prev_in_block: Option<usize> = None;
    let mut prev_block: u64 = u64::MAX;

    scan(fs, dir_ino, di, |lblk, off, entry| {
        if lblk != prev_block {
            prev_in_block = None;
            prev_block = lblk;
        }
        if entry.ino != 0 && entry.name == name {
            target = Some((lblk, off, entry.clone()));
            prev_off = prev_in_block;
            return false;
        }
        prev_in_block = Some(off);
        true
    })?;

    let (lblk, off, entry) = target.ok_or(Errno::Enoent)?;
    let pblk = fs.bmap(dir_ino, di, lblk)?.ok_or(Errno::Eio)?;
    let mut data = fs.read_block(pblk)?;

    match prev_off {
        Some(prev) => {
            let prev_entry = decode_at(&data, prev)?;
            put_u16(
                &mut data,
                prev + 4,
                prev_entry.rec_len + entry.rec_len,
            );
        }
        None => {
            // First record of the block: tombstone.
            put_u32(&mut data, off, 0);
        }
    }
    seal_block(fs, dir_ino, di.generation(), &mut data);
    fs.write_block(pblk, &data)?;
    Ok((entry.ino, entry.file_type))
}

/// Write the initial `.` and `..` records of a fresh directory block.
pub fn init_dir(fs: &Ext2Fs, ino: u32, parent_ino: u32, di: &mut DiskInode) -> KResult<u32> {
    let bs = fs.block_size as usize;
    let (pblk, fresh) = fs.bmap_alloc(ino, di, 0)?;
    let mut data = alloc::vec![0u8; bs];
    let dot_len = rec_len_for(1);
    encode_at(&mut data, 0, ino, dot_len as u16, FT_DIR, ".");
    encode_at(
        &mut data,
        dot_len,
        parent_ino,
        (usable_len(fs) - dot_len) as u16,
        FT_DIR,
        "..",
    );
    seal_block(fs, ino, di.generation(), &mut data);
    fs.write_block(pblk, &data)?;
    di.set_size(bs as u64);
    Ok(fresh)
}

/// True when the directory holds nothing but `.` and `..`.
pub fn is_empty(fs: &Ext2Fs, ino: u32, di: &DiskInode) -> KResult<bool> {
    let mut empty = true;
    scan(fs, ino, di, |_, _, entry| {
        if entry.ino != 0 && entry.name != "." && entry.name != ".." {
            empty = false;
            false
        } else {
            true
        }
    })?;
    Ok(empty)
}

/// Every live entry (tests, fsck-style invariant checks).
pub fn all_entries(fs: &Ext2Fs, ino: u32, di: &DiskInode) -> KResult<Vec<Dirent>> {
    let mut out = Vec::new();
    scan(fs, ino, di, |_, _, entry| {
        if entry.ino != 0 {
            out.push(entry.clone());
        }
        true
    })?;
    Ok(out)
}

/// Sum of `rec_len` over all records of every block (tests: must equal
/// the directory size modulo the checksum tails).
pub fn rec_len_sum(fs: &Ext2Fs, ino: u32, di: &DiskInode) -> KResult<u64> {
    let mut sum = 0u64;
    scan(fs, ino, di, |_, _, entry| {
        sum += entry.rec_len as u64;
        true
    })?;
    if fs.csum_seed.is_some() {
        // Count the tail records too; they complete each block.
        sum += (di.size() / fs.block_size as u64) * TAIL_SIZE as u64;
    }
    Ok(sum)
}
