//! Extent trees
//!
//! An extent-mapped inode roots a small tree in its 60-byte i_block
//! area: a 12-byte header plus up to four entries, branching through
//! index nodes stored in data blocks down to leaves of extents
//! `{logical start, length, 48-bit physical start}`. All walks are
//! iterative with an explicit path, so a corrupted tree cannot overrun
//! the kernel stack; depth and magic are validated at every node.

use alloc::vec::Vec;

use crate::error::{Errno, KResult};

use super::{csum, get_u16, get_u32, put_u16, put_u32, DiskInode, Ext2Fs};

/// Extent node magic.
pub const EXT_MAGIC: u16 = 0xf30a;
/// Maximum length of an initialized extent.
pub const EXT_INIT_MAX_LEN: u16 = 32768;
/// Entries in the in-inode root node.
pub const ROOT_MAX_ENTRIES: u16 = 4;
/// Deepest tree this driver accepts.
const MAX_DEPTH: u16 = 4;

/// Decoded node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentHeader {
    pub entries: u16,
    pub max: u16,
    pub depth: u16,
    pub generation: u32,
}

impl ExtentHeader {
    pub fn decode(buf: &[u8]) -> KResult<Self> {
        if get_u16(buf, 0) != EXT_MAGIC {
            return Err(Errno::Eio);
        }
        let hdr = Self {
            entries: get_u16(buf, 2),
            max: get_u16(buf, 4),
            depth: get_u16(buf, 6),
            generation: get_u32(buf, 8),
        };
        if hdr.entries > hdr.max || hdr.depth > MAX_DEPTH {
            return Err(Errno::Eio);
        }
        Ok(hdr)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        put_u16(buf, 0, EXT_MAGIC);
        put_u16(buf, 2, self.entries);
        put_u16(buf, 4, self.max);
        put_u16(buf, 6, self.depth);
        put_u32(buf, 8, self.generation);
    }
}

/// One leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub lblk: u32,
    /// Initialized length in blocks.
    pub len: u16,
    pub pblk: u64,
}

impl Extent {
    fn decode(buf: &[u8], index: usize) -> Self {
        let off = 12 + index * 12;
        let raw_len = get_u16(buf, off + 4);
        let len = if raw_len > EXT_INIT_MAX_LEN {
            raw_len - EXT_INIT_MAX_LEN
        } else {
            raw_len
        };
        let hi = get_u16(buf, off + 6) as u64;
        let lo = get_u32(buf, off + 8) as u64;
        Self {
            lblk: get_u32(buf, off),
            len,
            pblk: (hi << 32) | lo,
        }
    }

    fn encode(&self, buf: &mut [u8], index: usize) {
        let off = 12 + index * 12;
        put_u32(buf, off, self.lblk);
        put_u16(buf, off + 4, self.len);
        put_u16(buf, off + 6, (self.pblk >> 32) as u16);
        put_u32(buf, off + 8, self.pblk as u32);
    }

    fn contains(&self, lblk: u64) -> bool {
        lblk >= self.lblk as u64 && lblk < self.lblk as u64 + self.len as u64
    }
}

/// One index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExtentIdx {
    lblk: u32,
    child: u64,
}

impl ExtentIdx {
    fn decode(buf: &[u8], index: usize) -> Self {
        let off = 12 + index * 12;
        let lo = get_u32(buf, off + 4) as u64;
        let hi = get_u16(buf, off + 8) as u64;
        Self {
            lblk: get_u32(buf, off),
            child: (hi << 32) | lo,
        }
    }

    fn encode(&self, buf: &mut [u8], index: usize) {
        let off = 12 + index * 12;
        put_u32(buf, off, self.lblk);
        put_u32(buf, off + 4, self.child as u32);
        put_u16(buf, off + 8, (self.child >> 32) as u16);
        put_u16(buf, off + 10, 0);
    }
}

/// Entries that fit one tree block, leaving room for the checksum tail
/// when metadata checksums are on.
fn block_max_entries(fs: &Ext2Fs) -> u16 {
    let tail = if fs.csum_seed.is_some() { 4 } else { 0 };
    ((fs.block_size as usize - 12 - tail) / 12) as u16
}

fn tail_offset(hdr_max: u16) -> usize {
    12 + hdr_max as usize * 12
}

/// Read and validate one tree block.
fn read_node(fs: &Ext2Fs, ino: u32, generation: u32, block: u64) -> KResult<Vec<u8>> {
    let data = fs.read_block(block)?;
    let hdr = ExtentHeader::decode(&data)?;
    if let Some(seed) = fs.inode_csum_seed(ino, generation) {
        let stored = get_u32(&data, tail_offset(hdr.max));
        if stored != csum::extent_block_csum(seed, &data, tail_offset(hdr.max)) {
            fs.mark_error();
            return Err(Errno::Eio);
        }
    }
    Ok(data)
}

/// Stamp the checksum tail and write one tree block.
fn write_node(fs: &Ext2Fs, ino: u32, generation: u32, block: u64, data: &mut [u8]) -> KResult<()> {
    let hdr = ExtentHeader::decode(data)?;
    if let Some(seed) = fs.inode_csum_seed(ino, generation) {
        let off = tail_offset(hdr.max);
        let crc = csum::extent_block_csum(seed, data, off);
        put_u32(data, off, crc);
    }
    fs.write_block(block, data)
}

/// Initialize an empty root in the inode's block area.
pub fn init_root(di: &mut DiskInode) {
    let area = di.block_area_mut();
    area.fill(0);
    ExtentHeader {
        entries: 0,
        max: ROOT_MAX_ENTRIES,
        depth: 0,
        generation: 0,
    }
    .encode(area);
    di.set_flags(di.flags() | super::EXT4_EXTENTS_FL);
}

/// Last entry index with `lblk <=` target, if any.
fn find_slot(buf: &[u8], entries: u16, lblk: u64) -> Option<usize> {
    let mut found = None;
    for i in 0..entries as usize {
        let key = get_u32(buf, 12 + i * 12) as u64;
        if key <= lblk {
            found = Some(i);
        } else {
            break;
        }
    }
    found
}

/// Resolve `lblk` through the tree. `Ok(None)` is a hole.
pub fn lookup(fs: &Ext2Fs, ino: u32, di: &DiskInode, lblk: u64) -> KResult<Option<u64>> {
    let mut node: Vec<u8> = di.block_area().to_vec();
    let mut expected_depth: Option<u16> = None;

    loop {
        let hdr = ExtentHeader::decode(&node)?;
        if let Some(expected) = expected_depth {
            if hdr.depth != expected {
                fs.mark_error();
                return Err(Errno::Eio);
            }
        }
        if hdr.depth == 0 {
            let Some(slot) = find_slot(&node, hdr.entries, lblk) else {
                return Ok(None);
            };
            let extent = Extent::decode(&node, slot);
            if extent.contains(lblk) {
                return Ok(Some(extent.pblk + (lblk - extent.lblk as u64)));
            }
            return Ok(None);
        }
        let Some(slot) = find_slot(&node, hdr.entries, lblk) else {
            return Ok(None);
        };
        let idx = ExtentIdx::decode(&node, slot);
        node = read_node(fs, ino, di.generation(), idx.child)?;
        expected_depth = Some(hdr.depth - 1);
    }
}

/// Every leaf extent in the tree, in tree order, together with the
/// block numbers of all interior/leaf tree nodes.
pub fn collect(fs: &Ext2Fs, ino: u32, di: &DiskInode) -> KResult<(Vec<Extent>, Vec<u64>)> {
    let mut extents = Vec::new();
    let mut nodes = Vec::new();
    // Iterative DFS over (node bytes, next entry to visit).
    let root: Vec<u8> = di.block_area().to_vec();
    let mut stack: Vec<(Vec<u8>, usize)> = alloc::vec![(root, 0)];

    while let Some((node, next)) = stack.pop() {
        let hdr = ExtentHeader::decode(&node)?;
        if hdr.depth == 0 {
            for i in 0..hdr.entries as usize {
                extents.push(Extent::decode(&node, i));
            }
            continue;
        }
        if next < hdr.entries as usize {
            let idx = ExtentIdx::decode(&node, next);
            stack.push((node, next + 1));
            if stack.len() > MAX_DEPTH as usize + 1 {
                fs.mark_error();
                return Err(Errno::Eio);
            }
            nodes.push(idx.child);
            let child = read_node(fs, ino, di.generation(), idx.child)?;
            stack.push((child, 0));
        }
    }
    extents.sort_by_key(|e| e.lblk);
    Ok((extents, nodes))
}

/// Map `lblk`, allocating a block and inserting it into the tree when
/// it is a hole. Returns the physical block and the number of fresh
/// blocks (data plus any new tree nodes).
pub fn bmap_alloc(fs: &Ext2Fs, ino: u32, di: &mut DiskInode, lblk: u64) -> KResult<(u64, u32)> {
    if let Some(existing) = lookup(fs, ino, di, lblk)? {
        return Ok((existing, 0));
    }
    // Goal: right after the previous logical block when it is mapped.
    let goal = match lblk.checked_sub(1).map(|prev| lookup(fs, ino, di, prev)) {
        Some(Ok(Some(prev))) => prev + 1,
        _ => self_goal(fs, ino),
    };
    let pblk = fs.alloc_block(goal)?;
    let fresh_nodes = insert(fs, ino, di, lblk, pblk)?;
    Ok((pblk, 1 + fresh_nodes))
}

fn self_goal(fs: &Ext2Fs, ino: u32) -> u64 {
    fs.group_first_block(fs.inode_group(ino))
}

/// Insert the single-block extent `lblk -> pblk`. Returns the number
/// of tree blocks allocated (splits, root growth).
pub fn insert(fs: &Ext2Fs, ino: u32, di: &mut DiskInode, lblk: u64, pblk: u64) -> KResult<u32> {
    let generation = di.generation();
    let mut fresh = 0u32;

    loop {
        // Descend to the leaf, recording the path of block addresses.
        let mut path: Vec<(u64, usize)> = Vec::new(); // (block, slot in parent)
        let mut node: Vec<u8> = di.block_area().to_vec();
        let mut in_inode = true;
        let mut cur_block = 0u64;

        loop {
            let hdr = ExtentHeader::decode(&node)?;
            if hdr.depth == 0 {
                break;
            }
            let slot = match find_slot(&node, hdr.entries, lblk) {
                Some(s) => s,
                None if hdr.entries > 0 => 0,
                None => {
                    fs.mark_error();
                    return Err(Errno::Eio);
                }
            };
            let idx = ExtentIdx::decode(&node, slot);
            path.push((cur_block, slot));
            cur_block = idx.child;
            node = read_node(fs, ino, generation, cur_block)?;
            in_inode = false;
        }

        let hdr = ExtentHeader::decode(&node)?;

        // Try to merge with the preceding extent.
        if let Some(slot) = find_slot(&node, hdr.entries, lblk) {
            let mut prev = Extent::decode(&node, slot);
            if prev.lblk as u64 + prev.len as u64 == lblk
                && prev.pblk + prev.len as u64 == pblk
                && prev.len < EXT_INIT_MAX_LEN
            {
                prev.len += 1;
                prev.encode(&mut node, slot);
                write_leaf(fs, ino, generation, di, in_inode, cur_block, &mut node)?;
                return Ok(fresh);
            }
        }

        if hdr.entries < hdr.max {
            let insert_at = find_slot(&node, hdr.entries, lblk).map(|s| s + 1).unwrap_or(0);
            // Shift entries up.
            for i in (insert_at..hdr.entries as usize).rev() {
                let e = Extent::decode(&node, i);
                e.encode(&mut node, i + 1);
            }
            Extent {
                lblk: lblk as u32,
                len: 1,
                pblk,
            }
            .encode(&mut node, insert_at);
            let mut new_hdr = hdr;
            new_hdr.entries += 1;
            new_hdr.encode(&mut node);
            write_leaf(fs, ino, generation, di, in_inode, cur_block, &mut node)?;

            // First entries keyed upward: parents index by lowest key.
            if insert_at == 0 {
                fixup_parent_keys(fs, ino, generation, di, &path, lblk as u32)?;
            }
            return Ok(fresh);
        }

        // The leaf is full.
        if in_inode {
            fresh += grow_root(fs, ino, generation, di)?;
            continue; // retry with the deeper tree
        }
        fresh += split_leaf(
            fs, ino, generation, di, &path, cur_block, &mut node, lblk, pblk,
        )?;
        return Ok(fresh);
    }
}

/// Split a full leaf: the upper half of its extents moves to a fresh
/// sibling, the new extent lands in whichever half owns its key, and
/// the sibling is hooked into the parents.
#[allow(clippy::too_many_arguments)]
fn split_leaf(
    fs: &Ext2Fs,
    ino: u32,
    generation: u32,
    di: &mut DiskInode,
    path: &[(u64, usize)],
    leaf_block: u64,
    leaf: &mut Vec<u8>,
    lblk: u64,
    pblk: u64,
) -> KResult<u32> {
    let hdr = ExtentHeader::decode(leaf)?;
    let mut entries: Vec<Extent> = (0..hdr.entries as usize)
        .map(|i| Extent::decode(leaf, i))
        .collect();
    let at = entries
        .iter()
        .position(|e| e.lblk as u64 > lblk)
        .unwrap_or(entries.len());
    entries.insert(
        at,
        Extent {
            lblk: lblk as u32,
            len: 1,
            pblk,
        },
    );

    let split = entries.len() / 2;
    let upper = entries.split_off(split);

    let sibling = fs.alloc_block(self_goal(fs, ino))?;
    let mut sibling_node = alloc::vec![0u8; fs.block_size as usize];
    ExtentHeader {
        entries: upper.len() as u16,
        max: block_max_entries(fs),
        depth: 0,
        generation,
    }
    .encode(&mut sibling_node);
    for (i, e) in upper.iter().enumerate() {
        e.encode(&mut sibling_node, i);
    }
    write_node(fs, ino, generation, sibling, &mut sibling_node)?;

    let mut lower_hdr = hdr;
    lower_hdr.entries = entries.len() as u16;
    lower_hdr.encode(leaf);
    for (i, e) in entries.iter().enumerate() {
        e.encode(leaf, i);
    }
    write_node(fs, ino, generation, leaf_block, leaf)?;

    let entry = ExtentIdx {
        lblk: upper[0].lblk,
        child: sibling,
    };
    insert_index_entry(fs, ino, generation, di, path, entry).map(|grown| grown + 1)
}

fn write_leaf(
    fs: &Ext2Fs,
    ino: u32,
    generation: u32,
    di: &mut DiskInode,
    in_inode: bool,
    block: u64,
    node: &mut [u8],
) -> KResult<()> {
    if in_inode {
        di.block_area_mut().copy_from_slice(&node[..60]);
        Ok(())
    } else {
        write_node(fs, ino, generation, block, node)
    }
}

/// Rewrite the lowest-key index entries along the path after an insert
/// at slot 0.
fn fixup_parent_keys(
    fs: &Ext2Fs,
    ino: u32,
    generation: u32,
    di: &mut DiskInode,
    path: &[(u64, usize)],
    new_key: u32,
) -> KResult<()> {
    for &(block, slot) in path.iter().rev() {
        if block == 0 {
            // Root in the inode.
            let mut area = di.block_area().to_vec();
            let mut idx = ExtentIdx::decode(&area, slot);
            if new_key < idx.lblk {
                idx.lblk = new_key;
                idx.encode(&mut area, slot);
                di.block_area_mut().copy_from_slice(&area[..60]);
            }
        } else {
            let mut node = read_node(fs, ino, generation, block)?;
            let mut idx = ExtentIdx::decode(&node, slot);
            if new_key < idx.lblk {
                idx.lblk = new_key;
                idx.encode(&mut node, slot);
                write_node(fs, ino, generation, block, &mut node)?;
            }
        }
    }
    Ok(())
}

/// Move the root's entries into a fresh block and turn the root into a
/// one-entry index node a level deeper.
fn grow_root(fs: &Ext2Fs, ino: u32, generation: u32, di: &mut DiskInode) -> KResult<u32> {
    let root: Vec<u8> = di.block_area().to_vec();
    let hdr = ExtentHeader::decode(&root)?;

    let child_block = fs.alloc_block(self_goal(fs, ino))?;
    let mut child = alloc::vec![0u8; fs.block_size as usize];
    ExtentHeader {
        entries: hdr.entries,
        max: block_max_entries(fs),
        depth: hdr.depth,
        generation,
    }
    .encode(&mut child);
    child[12..12 + hdr.entries as usize * 12]
        .copy_from_slice(&root[12..12 + hdr.entries as usize * 12]);
    write_node(fs, ino, generation, child_block, &mut child)?;

    let first_key = if hdr.entries > 0 {
        get_u32(&root, 12)
    } else {
        0
    };
    let area = di.block_area_mut();
    area.fill(0);
    ExtentHeader {
        entries: 1,
        max: ROOT_MAX_ENTRIES,
        depth: hdr.depth + 1,
        generation,
    }
    .encode(area);
    ExtentIdx {
        lblk: first_key,
        child: child_block,
    }
    .encode(area, 0);
    Ok(1)
}

/// Insert an index entry into the parents along `path`, bottom up,
/// growing the root or adding sibling index nodes as needed. Returns
/// the number of tree blocks allocated.
fn insert_index_entry(
    fs: &Ext2Fs,
    ino: u32,
    generation: u32,
    di: &mut DiskInode,
    path: &[(u64, usize)],
    mut entry: ExtentIdx,
) -> KResult<u32> {
    let mut fresh = 0u32;
    for level in (0..path.len()).rev() {
        let (block, _slot) = path[level];
        let in_inode = block == 0;
        let mut node: Vec<u8> = if in_inode {
            di.block_area().to_vec()
        } else {
            read_node(fs, ino, generation, block)?
        };
        let hdr = ExtentHeader::decode(&node)?;
        if hdr.entries < hdr.max {
            let at = find_slot(&node, hdr.entries, entry.lblk as u64)
                .map(|s| s + 1)
                .unwrap_or(0);
            for i in (at..hdr.entries as usize).rev() {
                let e = ExtentIdx::decode(&node, i);
                e.encode(&mut node, i + 1);
            }
            entry.encode(&mut node, at);
            let mut new_hdr = hdr;
            new_hdr.entries += 1;
            new_hdr.encode(&mut node);
            if in_inode {
                di.block_area_mut().copy_from_slice(&node[..60]);
            } else {
                write_node(fs, ino, generation, block, &mut node)?;
            }
            return Ok(fresh);
        }
        if in_inode {
            // Full root: push its entries down one level, then insert
            // into the pushed-down child, which has block-sized room.
            // Inserting into the new root directly would hook a node of
            // the wrong depth.
            fresh += grow_root(fs, ino, generation, di)?;
            let area = di.block_area().to_vec();
            let pushed = ExtentIdx::decode(&area, 0);
            let mut child = read_node(fs, ino, generation, pushed.child)?;
            let child_hdr = ExtentHeader::decode(&child)?;
            let at = find_slot(&child, child_hdr.entries, entry.lblk as u64)
                .map(|s| s + 1)
                .unwrap_or(0);
            for i in (at..child_hdr.entries as usize).rev() {
                let e = ExtentIdx::decode(&child, i);
                e.encode(&mut child, i + 1);
            }
            entry.encode(&mut child, at);
            let mut new_hdr = child_hdr;
            new_hdr.entries += 1;
            new_hdr.encode(&mut child);
            write_node(fs, ino, generation, pushed.child, &mut child)?;
            return Ok(fresh);
        }
        // Full interior block: create a sibling index node holding the
        // entry and propagate one level up.
        let upper = fs.alloc_block(self_goal(fs, ino))?;
        fresh += 1;
        let mut fresh_node = alloc::vec![0u8; fs.block_size as usize];
        ExtentHeader {
            entries: 1,
            max: block_max_entries(fs),
            depth: hdr.depth,
            generation,
        }
        .encode(&mut fresh_node);
        entry.encode(&mut fresh_node, 0);
        write_node(fs, ino, generation, upper, &mut fresh_node)?;
        entry = ExtentIdx {
            lblk: entry.lblk,
            child: upper,
        };
    }
    // An empty path means the root itself was the full leaf, handled
    // above by growth.
    Err(Errno::Eio)
}

/// Free every extent and tree node at or past `from_lblk`, rebuilding
/// the tree from the surviving extents. Returns the number of blocks
/// freed.
pub fn release_from(fs: &Ext2Fs, ino: u32, di: &mut DiskInode, from_lblk: u64) -> KResult<u64> {
    let (extents, nodes) = collect(fs, ino, di)?;
    let mut freed = 0u64;

    let mut survivors: Vec<Extent> = Vec::new();
    for e in extents {
        let start = e.lblk as u64;
        let end = start + e.len as u64;
        if end <= from_lblk {
            survivors.push(e);
            continue;
        }
        let keep = from_lblk.saturating_sub(start).min(e.len as u64) as u16;
        for i in keep as u64..e.len as u64 {
            fs.free_block(e.pblk + i)?;
            freed += 1;
        }
        if keep > 0 {
            survivors.push(Extent {
                lblk: e.lblk,
                len: keep,
                pblk: e.pblk,
            });
        }
    }

    for node in nodes {
        fs.free_block(node)?;
        freed += 1;
    }

    init_root(di);
    for e in survivors {
        // Reinsert whole extents; tree nodes allocated here are new.
        let mut remaining = e.len;
        let mut lblk = e.lblk as u64;
        let mut pblk = e.pblk;
        while remaining > 0 {
            insert(fs, ino, di, lblk, pblk)?;
            lblk += 1;
            pblk += 1;
            remaining -= 1;
        }
    }
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::super::mkfs::{self, MkfsOptions};
    use super::super::superblock::open_fs;
    use super::*;
    use crate::fs::RamDisk;

    fn extent_fs() -> Ext2Fs {
        let disk = RamDisk::new("ram0", 512, 8192); // 4 MiB
        mkfs::format(
            &*disk,
            MkfsOptions {
                block_size: 1024,
                extents: true,
                metadata_csum: true,
                ..MkfsOptions::default()
            },
        )
        .unwrap();
        open_fs(disk, false).unwrap()
    }

    fn fresh_inode(fs: &Ext2Fs) -> DiskInode {
        let mut di = DiskInode::new_empty(fs.inode_size);
        di.set_mode(0x81a4);
        init_root(&mut di);
        di
    }

    #[test]
    fn empty_tree_is_all_holes() {
        let fs = extent_fs();
        let di = fresh_inode(&fs);
        assert_eq!(lookup(&fs, 12, &di, 0).unwrap(), None);
        assert_eq!(lookup(&fs, 12, &di, 1000).unwrap(), None);
    }

    #[test]
    fn adjacent_allocations_merge_into_one_extent() {
        let fs = extent_fs();
        let mut di = fresh_inode(&fs);
        let mut mapped = Vec::new();
        for lblk in 0..8 {
            let (pblk, _) = bmap_alloc(&fs, 12, &mut di, lblk).unwrap();
            mapped.push(pblk);
        }
        // Contiguous physical allocation collapses into one extent.
        let (extents, nodes) = collect(&fs, 12, &di).unwrap();
        assert!(nodes.is_empty(), "tree still fits the inode root");
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].len, 8);
        for (lblk, pblk) in mapped.iter().enumerate() {
            assert_eq!(lookup(&fs, 12, &di, lblk as u64).unwrap(), Some(*pblk));
        }
    }

    #[test]
    fn scattered_extents_fill_root_then_grow() {
        let fs = extent_fs();
        let mut di = fresh_inode(&fs);
        // Widely spaced logical blocks cannot merge, forcing one
        // extent each: 4 fit in the root, the fifth grows the tree.
        for i in 0..5u64 {
            bmap_alloc(&fs, 12, &mut di, i * 100).unwrap();
        }
        let hdr = ExtentHeader::decode(di.block_area()).unwrap();
        assert_eq!(hdr.depth, 1, "root grew into an index node");
        for i in 0..5u64 {
            assert!(lookup(&fs, 12, &di, i * 100).unwrap().is_some());
            assert_eq!(lookup(&fs, 12, &di, i * 100 + 1).unwrap(), None);
        }
    }

    #[test]
    fn release_frees_and_trims() {
        let fs = extent_fs();
        let mut di = fresh_inode(&fs);
        for lblk in 0..10 {
            bmap_alloc(&fs, 12, &mut di, lblk).unwrap();
        }
        let free_before = fs.sup.lock().free_blocks_count();
        let freed = release_from(&fs, 12, &mut di, 4).unwrap();
        assert_eq!(freed, 6);
        assert_eq!(
            fs.sup.lock().free_blocks_count(),
            free_before + 6
        );
        for lblk in 0..4 {
            assert!(lookup(&fs, 12, &di, lblk).unwrap().is_some());
        }
        for lblk in 4..10 {
            assert_eq!(lookup(&fs, 12, &di, lblk).unwrap(), None);
        }
    }

    #[test]
    fn release_everything_resets_root() {
        let fs = extent_fs();
        let mut di = fresh_inode(&fs);
        for i in 0..6u64 {
            bmap_alloc(&fs, 12, &mut di, i * 50).unwrap();
        }
        let before = fs.sup.lock().free_blocks_count();
        let freed = release_from(&fs, 12, &mut di, 0).unwrap();
        assert!(freed >= 6, "data plus tree nodes");
        assert_eq!(fs.sup.lock().free_blocks_count(), before + freed);
        let hdr = ExtentHeader::decode(di.block_area()).unwrap();
        assert_eq!(hdr.entries, 0);
        assert_eq!(hdr.depth, 0);
    }

    #[test]
    fn corrupt_magic_is_eio() {
        let fs = extent_fs();
        let mut di = fresh_inode(&fs);
        di.block_area_mut()[0] = 0;
        assert_eq!(lookup(&fs, 12, &di, 0), Err(Errno::Eio));
    }
}
