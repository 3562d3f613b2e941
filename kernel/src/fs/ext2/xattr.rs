//! Extended attributes
//!
//! A single xattr block hangs off the inode's `i_file_acl`: a 32-byte
//! header, a packed entry table growing down from offset 32, and the
//! values packed upward from the end of the block. Names are stored
//! with the usual prefix compression (`user.`, `trusted.`, ...).

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::fs::Inode;

use super::{csum, get_u16, get_u32, put_u16, put_u32, Ext2Fs};

/// xattr block magic.
pub const XATTR_MAGIC: u32 = 0xea02_0000;
/// Header size.
const HEADER: usize = 32;
/// Entry header size (before the name).
const ENTRY_HEADER: usize = 16;

/// setxattr flag: fail if the attribute exists.
pub const XATTR_CREATE: i32 = 1;
/// setxattr flag: fail unless the attribute exists.
pub const XATTR_REPLACE: i32 = 2;

const PREFIXES: &[(u8, &str)] = &[
    (1, "user."),
    (4, "trusted."),
    (6, "security."),
    (7, "system."),
];

fn split_prefix(name: &str) -> (u8, &str) {
    for (index, prefix) in PREFIXES {
        if let Some(rest) = name.strip_prefix(prefix) {
            return (*index, rest);
        }
    }
    (0, name)
}

fn join_prefix(index: u8, suffix: &str) -> String {
    for (i, prefix) in PREFIXES {
        if *i == index {
            let mut s = String::from(*prefix);
            s.push_str(suffix);
            return s;
        }
    }
    suffix.to_string()
}

/// One decoded attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name_index: u8,
    name: String,
    value: Vec<u8>,
}

fn block_csum(fs: &Ext2Fs, block_nr: u64, data: &[u8]) -> Option<u32> {
    let seed = fs.csum_seed?;
    let mut crc = csum::crc32c(seed, &block_nr.to_le_bytes());
    crc = csum::crc32c(crc, &data[..16]);
    crc = csum::crc32c(crc, &[0, 0, 0, 0]);
    crc = csum::crc32c(crc, &data[20..]);
    Some(crc)
}

fn parse_block(fs: &Ext2Fs, block_nr: u64, data: &[u8]) -> KResult<Vec<Entry>> {
    if get_u32(data, 0) != XATTR_MAGIC {
        return Err(Errno::Eio);
    }
    if let Some(expected) = block_csum(fs, block_nr, data) {
        if get_u32(data, 16) != expected {
            fs.mark_error();
            return Err(Errno::Eio);
        }
    }

    let mut entries = Vec::new();
    let mut off = HEADER;
    while off + ENTRY_HEADER <= data.len() {
        let name_len = data[off] as usize;
        if name_len == 0 && data[off + 1] == 0 {
            break; // terminator
        }
        let name_index = data[off + 1];
        let value_offs = get_u16(data, off + 2) as usize;
        let value_size = get_u32(data, off + 8) as usize;
        if off + ENTRY_HEADER + name_len > data.len()
            || value_offs + value_size > data.len()
        {
            return Err(Errno::Eio);
        }
        let name =
            String::from_utf8_lossy(&data[off + ENTRY_HEADER..off + ENTRY_HEADER + name_len])
                .into_owned();
        entries.push(Entry {
            name_index,
            name,
            value: data[value_offs..value_offs + value_size].to_vec(),
        });
        off += ENTRY_HEADER + (name_len + 3) / 4 * 4;
    }
    Ok(entries)
}

fn build_block(fs: &Ext2Fs, block_nr: u64, entries: &[Entry]) -> KResult<Vec<u8>> {
    let bs = fs.block_size as usize;
    let mut data = vec![0u8; bs];
    put_u32(&mut data, 0, XATTR_MAGIC);
    put_u32(&mut data, 4, 1); // refcount
    put_u32(&mut data, 8, 1); // blocks

    let mut entry_off = HEADER;
    let mut value_off = bs;
    for entry in entries {
        let name_bytes = entry.name.as_bytes();
        let esize = ENTRY_HEADER + (name_bytes.len() + 3) / 4 * 4;
        value_off = value_off
            .checked_sub((entry.value.len() + 3) / 4 * 4)
            .ok_or(Errno::Enospc)?;
        if entry_off + esize + 4 > value_off {
            return Err(Errno::Enospc);
        }
        data[entry_off] = name_bytes.len() as u8;
        data[entry_off + 1] = entry.name_index;
        put_u16(&mut data, entry_off + 2, value_off as u16);
        put_u32(&mut data, entry_off + 4, 0);
        put_u32(&mut data, entry_off + 8, entry.value.len() as u32);
        data[entry_off + ENTRY_HEADER..entry_off + ENTRY_HEADER + name_bytes.len()]
            .copy_from_slice(name_bytes);
        data[value_off..value_off + entry.value.len()].copy_from_slice(&entry.value);
        entry_off += esize;
    }

    if let Some(crc) = block_csum(fs, block_nr, &data) {
        put_u32(&mut data, 16, crc);
    }
    Ok(data)
}

fn load(fs: &Ext2Fs, inode: &Inode) -> KResult<(u64, Vec<Entry>)> {
    let di = super::inode::read_disk_inode(fs, inode.ino as u32)?;
    let block = di.file_acl() as u64;
    if block == 0 {
        return Ok((0, Vec::new()));
    }
    let data = fs.read_block(block)?;
    Ok((block, parse_block(fs, block, &data)?))
}

fn store(fs: &Ext2Fs, inode: &Inode, block: u64, entries: &[Entry]) -> KResult<()> {
    let ino = inode.ino as u32;
    let mut di = super::inode::read_disk_inode(fs, ino)?;

    if entries.is_empty() {
        if block != 0 {
            fs.free_block(block)?;
            di.set_file_acl(0);
            di.set_blocks(
                di.blocks()
                    .saturating_sub(fs.block_size / 512),
            );
            super::inode::write_disk_inode(fs, ino, &mut di)?;
            inode.attr.write().blocks = di.blocks() as u64;
        }
        return Ok(());
    }

    let block = if block != 0 {
        block
    } else {
        let fresh = fs.alloc_block(fs.group_first_block(fs.inode_group(ino)))?;
        di.set_file_acl(fresh as u32);
        di.set_blocks(di.blocks() + fs.block_size / 512);
        super::inode::write_disk_inode(fs, ino, &mut di)?;
        inode.attr.write().blocks = di.blocks() as u64;
        fresh
    };
    let data = build_block(fs, block, entries)?;
    fs.write_block(block, &data)
}

/// Set (or create) one attribute.
pub fn set(fs: &Ext2Fs, inode: &Inode, name: &str, value: &[u8], flags: i32) -> KResult<()> {
    fs.write_guard()?;
    if name.is_empty() || name.len() > 255 {
        return Err(Errno::Einval);
    }
    let (name_index, suffix) = split_prefix(name);
    let (block, mut entries) = load(fs, inode)?;

    let existing = entries
        .iter()
        .position(|e| e.name_index == name_index && e.name == suffix);
    match existing {
        Some(_) if flags & XATTR_CREATE != 0 => return Err(Errno::Eexist),
        None if flags & XATTR_REPLACE != 0 => return Err(Errno::Enodata),
        Some(i) => entries[i].value = value.to_vec(),
        None => entries.push(Entry {
            name_index,
            name: suffix.to_string(),
            value: value.to_vec(),
        }),
    }
    store(fs, inode, block, &entries)
}

/// Read one attribute's value.
pub fn get(fs: &Ext2Fs, inode: &Inode, name: &str) -> KResult<Vec<u8>> {
    let (name_index, suffix) = split_prefix(name);
    let (_block, entries) = load(fs, inode)?;
    entries
        .into_iter()
        .find(|e| e.name_index == name_index && e.name == suffix)
        .map(|e| e.value)
        .ok_or(Errno::Enodata)
}

/// List every attribute name.
pub fn list(fs: &Ext2Fs, inode: &Inode) -> KResult<Vec<String>> {
    let (_block, entries) = load(fs, inode)?;
    Ok(entries
        .iter()
        .map(|e| join_prefix(e.name_index, &e.name))
        .collect())
}

/// Remove one attribute; the block is freed with the last one.
pub fn remove(fs: &Ext2Fs, inode: &Inode, name: &str) -> KResult<()> {
    fs.write_guard()?;
    let (name_index, suffix) = split_prefix(name);
    let (block, mut entries) = load(fs, inode)?;
    let index = entries
        .iter()
        .position(|e| e.name_index == name_index && e.name == suffix)
        .ok_or(Errno::Enodata)?;
    entries.remove(index);
    store(fs, inode, block, &entries)
}
