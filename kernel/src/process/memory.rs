//! Process memory operations: brk, mmap, munmap, mprotect
//!
//! The program break grows by installing zeroed user pages and shrinks
//! by unmapping and freeing them; it may not cross the break limit or
//! run into an mmap region. Anonymous mappings are placed in the mmap
//! window above the break limit. MAP_PRIVATE file mappings read the
//! backing inode once at map time; MAP_SHARED is accepted but writes
//! are never flushed back.

use alloc::sync::Arc;

use crate::error::{Errno, KResult};
use crate::fs::OpenFile;
use crate::mm::paging::{self, PageFlags};
use crate::mm::region::{MapFlags, MemRegion, Prot, RegionBacking};
use crate::mm::{frame, uaccess, VirtAddr, PAGE_SIZE, PROCESS_BREAK_LIMIT};
use crate::task::sched;
use crate::util::align_up;

use super::{with_current, with_process};

fn prot_to_flags(prot: Prot) -> PageFlags {
    let mut flags = PageFlags::USER;
    if prot.contains(Prot::WRITE) {
        flags |= PageFlags::WRITABLE;
    }
    flags
}

fn current_dir() -> paging::PageDir {
    sched::with_scheduler(|s| {
        s.task(s.current_pid())
            .map(|t| t.page_dir)
            .expect("current task missing")
    })
}

/// Set the program break. `brk(0)` queries; on success the new break is
/// returned. Growth maps zeroed pages; shrinking frees them.
pub fn brk(new_brk: u32) -> KResult<u32> {
    let pid = sched::current_pid();
    let (old_brk, brk_start) = with_process(pid, |p| (p.brk, p.brk_start))?;
    if new_brk == 0 {
        return Ok(old_brk);
    }
    if new_brk < brk_start || new_brk >= PROCESS_BREAK_LIMIT {
        return Err(Errno::Enomem);
    }
    let overlap = with_process(pid, |p| {
        let lo = old_brk.min(new_brk);
        let hi = align_up(old_brk.max(new_brk), PAGE_SIZE as u32);
        hi > lo && p.regions.overlaps(lo, hi - lo)
    })?;
    if overlap {
        return Err(Errno::Enomem);
    }

    let dir = current_dir();
    let old_top = align_up(old_brk, PAGE_SIZE as u32);
    let new_top = align_up(new_brk, PAGE_SIZE as u32);

    frame::with_allocator(|alloc| -> KResult<()> {
        if new_top > old_top {
            let mut mapped = old_top;
            while mapped < new_top {
                let frame = match alloc.alloc() {
                    Ok(f) => f,
                    Err(e) => {
                        // Roll the partial growth back.
                        let mut va = old_top;
                        while va < mapped {
                            if let Some(f) = paging::unmap(dir, VirtAddr::new(va)) {
                                alloc.free(f);
                            }
                            va += PAGE_SIZE as u32;
                        }
                        return Err(e);
                    }
                };
                crate::mm::phys::zero_frame(frame);
                paging::map(
                    alloc,
                    dir,
                    frame,
                    VirtAddr::new(mapped),
                    PageFlags::WRITABLE | PageFlags::USER,
                )?;
                paging::invalidate(VirtAddr::new(mapped));
                mapped += PAGE_SIZE as u32;
            }
        } else {
            let mut va = new_top;
            while va < old_top {
                if let Some(frame) = paging::unmap(dir, VirtAddr::new(va)) {
                    alloc.free(frame);
                }
                paging::invalidate(VirtAddr::new(va));
                va += PAGE_SIZE as u32;
            }
        }
        Ok(())
    })?;

    with_process(pid, |p| p.brk = new_brk)?;
    Ok(new_brk)
}

/// Map `len` bytes. `file` carries the backing open file for file
/// mappings; `offset` is the file offset (page-aligned).
pub fn mmap(
    addr_hint: u32,
    len: usize,
    prot: Prot,
    flags: MapFlags,
    file: Option<Arc<OpenFile>>,
    offset: u64,
) -> KResult<u32> {
    if len == 0 || offset % PAGE_SIZE as u64 != 0 {
        return Err(Errno::Einval);
    }
    if flags.contains(MapFlags::SHARED) == flags.contains(MapFlags::PRIVATE) {
        return Err(Errno::Einval);
    }
    if flags.contains(MapFlags::ANONYMOUS) != file.is_none() {
        return Err(Errno::Einval);
    }
    let len = align_up(len as u32, PAGE_SIZE as u32);

    let base = with_current(|p| -> KResult<u32> {
        if flags.contains(MapFlags::FIXED) {
            if !VirtAddr::new(addr_hint).is_page_aligned() {
                return Err(Errno::Einval);
            }
            if p.regions.overlaps(addr_hint, len) {
                return Err(Errno::Einval);
            }
            Ok(addr_hint)
        } else {
            p.regions.find_free(len)
        }
    })??;

    let dir = current_dir();
    let page_flags = prot_to_flags(prot);

    frame::with_allocator(|alloc| -> KResult<()> {
        let mut mapped = 0u32;
        while mapped < len {
            let frame = match alloc.alloc() {
                Ok(f) => f,
                Err(e) => {
                    let mut va = base;
                    while va < base + mapped {
                        if let Some(f) = paging::unmap(dir, VirtAddr::new(va)) {
                            alloc.free(f);
                        }
                        va += PAGE_SIZE as u32;
                    }
                    return Err(e);
                }
            };
            crate::mm::phys::zero_frame(frame);
            // Mapped writable first so file contents can land, then
            // tightened below if the protection asks for it.
            paging::map(
                alloc,
                dir,
                frame,
                VirtAddr::new(base + mapped),
                PageFlags::WRITABLE | PageFlags::USER,
            )?;
            paging::invalidate(VirtAddr::new(base + mapped));
            mapped += PAGE_SIZE as u32;
        }
        Ok(())
    })?;

    if let Some(file) = &file {
        // Populate from the backing inode one page at a time.
        let mut buf = alloc::vec![0u8; PAGE_SIZE];
        let mut off = 0u32;
        while off < len {
            let n = file.pread(offset + off as u64, &mut buf)?;
            uaccess::write_bytes(dir, VirtAddr::new(base + off), &buf[..n])?;
            if n < PAGE_SIZE {
                break;
            }
            off += PAGE_SIZE as u32;
        }
    }

    if !prot.contains(Prot::WRITE) {
        // Drop the write bit now that the pages are populated.
        remap_range(dir, base, len, page_flags)?;
    }

    with_current(|p| {
        p.regions.insert(MemRegion {
            base,
            len,
            prot,
            flags,
            backing: file.map(|f| RegionBacking {
                inode: f.inode.clone(),
                offset,
            }),
        })
    })??;

    Ok(base)
}

/// Remove mappings over `[addr, addr+len)`, splitting partially covered
/// regions.
pub fn munmap(addr: u32, len: usize) -> KResult<()> {
    let pages = with_current(|p| p.regions.remove_range(addr, align_up(len as u32, PAGE_SIZE as u32)))??;
    let dir = current_dir();
    frame::with_allocator(|alloc| {
        for page in pages {
            if let Some(frame) = paging::unmap(dir, VirtAddr::new(page)) {
                alloc.free(frame);
            }
            paging::invalidate(VirtAddr::new(page));
        }
    });
    Ok(())
}

/// Change the protection of `[addr, addr+len)`; the range must be fully
/// mapped.
pub fn mprotect(addr: u32, len: usize, prot: Prot) -> KResult<()> {
    let pages =
        with_current(|p| p.regions.protect_range(addr, align_up(len as u32, PAGE_SIZE as u32), prot))??;
    let dir = current_dir();
    let flags = prot_to_flags(prot);
    remap_pages(dir, &pages, flags)
}

fn remap_range(dir: paging::PageDir, base: u32, len: u32, flags: PageFlags) -> KResult<()> {
    let mut va = base;
    while va < base + len {
        remap_one(dir, va, flags)?;
        va += PAGE_SIZE as u32;
    }
    Ok(())
}

fn remap_pages(dir: paging::PageDir, pages: &[u32], flags: PageFlags) -> KResult<()> {
    for &va in pages {
        remap_one(dir, va, flags)?;
    }
    Ok(())
}

fn remap_one(dir: paging::PageDir, va: u32, flags: PageFlags) -> KResult<()> {
    let va = VirtAddr::new(va);
    let pa = paging::phys_of(dir, va).ok_or(Errno::Enomem)?;
    frame::with_allocator(|alloc| paging::map(alloc, dir, pa.frame_base(), va, flags))?;
    paging::invalidate(va);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use crate::mm::phys;

    fn set_brk_start(start: u32) {
        with_current(|p| {
            p.brk_start = start;
            p.brk = start;
        })
        .unwrap();
    }

    #[test]
    fn brk_grows_and_shrinks() {
        testutil::boot(800);
        set_brk_start(0x0900_0000);
        let dir = current_dir();

        assert_eq!(brk(0).unwrap(), 0x0900_0000);
        assert_eq!(brk(0x0900_3000).unwrap(), 0x0900_3000);
        // Pages exist and are zeroed.
        let pa = paging::phys_of(dir, VirtAddr::new(0x0900_2000)).unwrap();
        assert_eq!(phys::read_u32(pa), 0);

        assert_eq!(brk(0x0900_1000).unwrap(), 0x0900_1000);
        assert!(paging::phys_of(dir, VirtAddr::new(0x0900_2000)).is_none());
        assert!(paging::phys_of(dir, VirtAddr::new(0x0900_0000)).is_some());
    }

    #[test]
    fn brk_respects_limits() {
        testutil::boot(800);
        set_brk_start(0x0900_0000);
        assert_eq!(brk(0x08ff_0000), Err(Errno::Enomem));
        assert_eq!(brk(PROCESS_BREAK_LIMIT), Err(Errno::Enomem));
    }

    #[test]
    fn anonymous_mmap_is_page_aligned_and_usable() {
        testutil::boot(800);
        let addr = mmap(
            0,
            8192,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
        )
        .unwrap();
        assert!(addr >= PROCESS_BREAK_LIMIT);
        assert_eq!(addr % PAGE_SIZE as u32, 0);

        let dir = current_dir();
        // Every byte of the range is backed.
        uaccess::write_bytes(dir, VirtAddr::new(addr), &[0xab; 8192]).unwrap();
        let mut back = [0u8; 16];
        uaccess::read_bytes(dir, VirtAddr::new(addr + 8192 - 16), &mut back).unwrap();
        assert_eq!(back, [0xab; 16]);
    }

    #[test]
    fn munmap_unmaps_and_faults_after() {
        testutil::boot(800);
        let addr = mmap(
            0,
            8192,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
        )
        .unwrap();
        let dir = current_dir();
        munmap(addr, 8192).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            uaccess::read_bytes(dir, VirtAddr::new(addr), &mut buf),
            Err(Errno::Efault)
        );
        // Region list restored.
        assert!(with_current(|p| p.regions.is_empty()).unwrap());
    }

    #[test]
    fn mmap_munmap_restores_region_array() {
        testutil::boot(800);
        let before: alloc::vec::Vec<(u32, u32)> =
            with_current(|p| p.regions.iter().map(|r| (r.base, r.len)).collect()).unwrap();
        let addr = mmap(
            0,
            4096,
            Prot::READ,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
        )
        .unwrap();
        munmap(addr, 4096).unwrap();
        let after: alloc::vec::Vec<(u32, u32)> =
            with_current(|p| p.regions.iter().map(|r| (r.base, r.len)).collect()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn mprotect_changes_pte_flags() {
        testutil::boot(800);
        let addr = mmap(
            0,
            4096,
            Prot::READ | Prot::WRITE,
            MapFlags::PRIVATE | MapFlags::ANONYMOUS,
            None,
            0,
        )
        .unwrap();
        let dir = current_dir();
        uaccess::write_bytes(dir, VirtAddr::new(addr), b"data").unwrap();

        let before = paging::phys_of(dir, VirtAddr::new(addr)).unwrap();
        mprotect(addr, 4096, Prot::READ).unwrap();
        // Same frame, still present, region protection updated.
        assert_eq!(paging::phys_of(dir, VirtAddr::new(addr)), Some(before));
        assert_eq!(
            with_current(|p| p.regions.find(addr).unwrap().prot).unwrap(),
            Prot::READ
        );
    }

    #[test]
    fn mmap_rejects_conflicting_flags() {
        testutil::boot(800);
        assert_eq!(
            mmap(0, 4096, Prot::READ, MapFlags::ANONYMOUS, None, 0),
            Err(Errno::Einval)
        );
        assert_eq!(
            mmap(
                0,
                0,
                Prot::READ,
                MapFlags::PRIVATE | MapFlags::ANONYMOUS,
                None,
                0
            ),
            Err(Errno::Einval)
        );
    }
}
