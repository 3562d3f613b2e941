//! Process memory regions
//!
//! Bookkeeping for `mmap` areas: a per-process list of pairwise
//! disjoint, page-aligned regions kept sorted by base address. `munmap`
//! may split a region when the unmapped range covers only part of it.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::{VirtAddr, PAGE_SIZE, PROCESS_BREAK_LIMIT, USER_STACK_TOP};
use crate::error::{Errno, KResult};

bitflags! {
    /// mmap protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags! {
    /// mmap flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED    = 1 << 0;
        const PRIVATE   = 1 << 1;
        const FIXED     = 1 << 4;
        const ANONYMOUS = 1 << 5;
    }
}

/// File backing of a region.
#[derive(Clone)]
pub struct RegionBacking {
    pub inode: Arc<crate::fs::Inode>,
    pub offset: u64,
}

/// One mapped region. Base and length are page-aligned.
#[derive(Clone)]
pub struct MemRegion {
    pub base: u32,
    pub len: u32,
    pub prot: Prot,
    pub flags: MapFlags,
    pub backing: Option<RegionBacking>,
}

impl MemRegion {
    pub fn end(&self) -> u32 {
        self.base + self.len
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && addr < self.end()
    }
}

/// The sorted region list of one process.
#[derive(Clone, Default)]
pub struct RegionList {
    regions: Vec<MemRegion>,
}

impl RegionList {
    pub const fn new() -> Self {
        Self {
            regions: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Region containing `addr`, if any.
    pub fn find(&self, addr: u32) -> Option<&MemRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    /// True when `[base, base+len)` overlaps an existing region.
    pub fn overlaps(&self, base: u32, len: u32) -> bool {
        self.regions
            .iter()
            .any(|r| base < r.end() && r.base < base + len)
    }

    /// Lowest page-aligned gap of `len` bytes in the mmap window
    /// `[PROCESS_BREAK_LIMIT, USER_STACK_TOP)`.
    pub fn find_free(&self, len: u32) -> KResult<u32> {
        debug_assert!(len % PAGE_SIZE as u32 == 0);
        let mut base = PROCESS_BREAK_LIMIT;
        for r in &self.regions {
            if r.end() <= base {
                continue;
            }
            if r.base >= base + len {
                break;
            }
            base = r.end();
        }
        if base + len > USER_STACK_TOP {
            return Err(Errno::Enomem);
        }
        Ok(base)
    }

    /// Insert a region. Fails with EINVAL on misalignment, EEXIST on
    /// overlap.
    pub fn insert(&mut self, region: MemRegion) -> KResult<()> {
        if region.len == 0
            || !VirtAddr::new(region.base).is_page_aligned()
            || region.len % PAGE_SIZE as u32 != 0
        {
            return Err(Errno::Einval);
        }
        if self.overlaps(region.base, region.len) {
            return Err(Errno::Eexist);
        }
        let pos = self
            .regions
            .iter()
            .position(|r| r.base > region.base)
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, region);
        Ok(())
    }

    /// Remove `[base, base+len)` from the list, splitting any region the
    /// range only partially covers. Returns the removed page bases so
    /// the caller can unmap and free the frames.
    pub fn remove_range(&mut self, base: u32, len: u32) -> KResult<Vec<u32>> {
        if !VirtAddr::new(base).is_page_aligned() || len == 0 || len % PAGE_SIZE as u32 != 0 {
            return Err(Errno::Einval);
        }
        let end = base + len;
        let mut removed = Vec::new();
        let mut replacement: Vec<MemRegion> = Vec::new();

        for r in self.regions.drain(..) {
            if r.end() <= base || r.base >= end {
                replacement.push(r);
                continue;
            }
            // Collect the covered pages.
            let cut_start = r.base.max(base);
            let cut_end = r.end().min(end);
            for page in (cut_start..cut_end).step_by(PAGE_SIZE) {
                removed.push(page);
            }
            // Keep the uncovered head and tail.
            if r.base < cut_start {
                let mut head = r.clone();
                head.len = cut_start - r.base;
                replacement.push(head);
            }
            if r.end() > cut_end {
                let mut tail = r.clone();
                if let Some(b) = tail.backing.as_mut() {
                    b.offset += (cut_end - r.base) as u64;
                }
                tail.base = cut_end;
                tail.len = r.end() - cut_end;
                replacement.push(tail);
            }
        }
        self.regions = replacement;
        Ok(removed)
    }

    /// Apply a protection change over `[base, base+len)`. The range must
    /// be fully covered by existing regions.
    pub fn protect_range(&mut self, base: u32, len: u32, prot: Prot) -> KResult<Vec<u32>> {
        if !VirtAddr::new(base).is_page_aligned() || len % PAGE_SIZE as u32 != 0 {
            return Err(Errno::Einval);
        }
        let end = base + len;
        let mut covered = 0u32;
        for r in &self.regions {
            if r.end() <= base || r.base >= end {
                continue;
            }
            covered += r.end().min(end) - r.base.max(base);
        }
        if covered != len {
            return Err(Errno::Enomem);
        }

        let mut pages = Vec::new();
        let mut updated: Vec<MemRegion> = Vec::new();
        for r in self.regions.drain(..) {
            if r.end() <= base || r.base >= end {
                updated.push(r);
                continue;
            }
            let cut_start = r.base.max(base);
            let cut_end = r.end().min(end);
            if r.base < cut_start {
                let mut head = r.clone();
                head.len = cut_start - r.base;
                updated.push(head);
            }
            let mut mid = r.clone();
            if let Some(b) = mid.backing.as_mut() {
                b.offset += (cut_start - r.base) as u64;
            }
            mid.base = cut_start;
            mid.len = cut_end - cut_start;
            mid.prot = prot;
            for page in (cut_start..cut_end).step_by(PAGE_SIZE) {
                pages.push(page);
            }
            updated.push(mid);
            if r.end() > cut_end {
                let mut tail = r.clone();
                if let Some(b) = tail.backing.as_mut() {
                    b.offset += (cut_end - r.base) as u64;
                }
                tail.base = cut_end;
                tail.len = r.end() - cut_end;
                updated.push(tail);
            }
        }
        updated.sort_by_key(|r| r.base);
        self.regions = updated;
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(base: u32, len: u32) -> MemRegion {
        MemRegion {
            base,
            len,
            prot: Prot::READ | Prot::WRITE,
            flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            backing: None,
        }
    }

    #[test]
    fn insert_keeps_regions_sorted_and_disjoint() {
        let mut list = RegionList::new();
        list.insert(anon(0xB002_0000, 0x2000)).unwrap();
        list.insert(anon(0xB000_0000, 0x1000)).unwrap();
        let bases: Vec<u32> = list.iter().map(|r| r.base).collect();
        assert_eq!(bases, alloc::vec![0xB000_0000, 0xB002_0000]);
        assert_eq!(
            list.insert(anon(0xB002_1000, 0x1000)).unwrap_err(),
            Errno::Eexist
        );
    }

    #[test]
    fn find_free_skips_existing_regions() {
        let mut list = RegionList::new();
        let a = list.find_free(0x2000).unwrap();
        assert_eq!(a, PROCESS_BREAK_LIMIT);
        list.insert(anon(a, 0x2000)).unwrap();
        let b = list.find_free(0x1000).unwrap();
        assert_eq!(b, a + 0x2000);
    }

    #[test]
    fn map_unmap_round_trip_restores_list() {
        // mmap then munmap over the same range leaves the region array
        // as it started.
        let mut list = RegionList::new();
        list.insert(anon(0xB000_0000, 0x1000)).unwrap();
        let snapshot: Vec<(u32, u32)> = list.iter().map(|r| (r.base, r.len)).collect();

        list.insert(anon(0xB010_0000, 0x2000)).unwrap();
        let removed = list.remove_range(0xB010_0000, 0x2000).unwrap();
        assert_eq!(removed.len(), 2);
        let after: Vec<(u32, u32)> = list.iter().map(|r| (r.base, r.len)).collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn partial_unmap_splits_region() {
        let mut list = RegionList::new();
        list.insert(anon(0xB000_0000, 0x4000)).unwrap();
        let removed = list.remove_range(0xB000_1000, 0x1000).unwrap();
        assert_eq!(removed, alloc::vec![0xB000_1000]);
        let spans: Vec<(u32, u32)> = list.iter().map(|r| (r.base, r.len)).collect();
        assert_eq!(
            spans,
            alloc::vec![(0xB000_0000, 0x1000), (0xB000_2000, 0x2000)]
        );
    }

    #[test]
    fn mprotect_requires_full_coverage() {
        let mut list = RegionList::new();
        list.insert(anon(0xB000_0000, 0x2000)).unwrap();
        assert_eq!(
            list.protect_range(0xB000_0000, 0x4000, Prot::READ).unwrap_err(),
            Errno::Enomem
        );
        let pages = list
            .protect_range(0xB000_1000, 0x1000, Prot::READ)
            .unwrap();
        assert_eq!(pages, alloc::vec![0xB000_1000]);
        assert_eq!(list.find(0xB000_1000).unwrap().prot, Prot::READ);
        assert_eq!(
            list.find(0xB000_0000).unwrap().prot,
            Prot::READ | Prot::WRITE
        );
    }
}
