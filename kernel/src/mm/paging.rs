//! Two-level i386 paging
//!
//! A page directory is one frame of 1024 PDEs; each present PDE points
//! at one frame of 1024 PTEs. All entries are raw little-endian u32
//! words written through [`phys`], so the same code runs bit-exact on
//! bare metal and against the host RAM model.
//!
//! The kernel quarter (directory indexes 768 and up) is backed by page
//! tables allocated once at boot and shared by reference into every
//! address space, so a kernel mapping installed anywhere is visible
//! everywhere. User tables are private and deep-copied by
//! [`clone_dir`].
//!
//! After any modification of the currently loaded directory the caller
//! must issue [`invalidate`] or [`flush_all`].

use alloc::vec::Vec;

use bitflags::bitflags;

use super::frame::FrameAllocator;
use super::{phys, PhysAddr, VirtAddr, PAGE_SIZE};
use crate::error::{Errno, KResult};

bitflags! {
    /// PDE/PTE flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY    = 1 << 6;
    }
}

/// Mask selecting the frame address in an entry.
const ADDR_MASK: u32 = 0xffff_f000;
/// Mask selecting the flag bits.
const FLAG_MASK: u32 = 0x0fff;

/// First kernel-shared directory index (0xC0000000 >> 22).
pub const KERNEL_PDE_BASE: usize = 768;
/// Number of kernel-shared directory slots (the top quarter).
pub const KERNEL_PDE_COUNT: usize = 256;
/// Directory entries per table.
const ENTRIES: usize = 1024;

/// Handle to a page directory (the physical frame holding its PDEs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDir(pub PhysAddr);

/// Kernel-shared paging state: the PDE words for the top quarter.
struct KernelTables {
    pdes: [u32; KERNEL_PDE_COUNT],
}

#[cfg(target_os = "none")]
mod state {
    use super::KernelTables;

    static KERNEL: spin::Once<KernelTables> = spin::Once::new();
    static CURRENT: core::sync::atomic::AtomicU32 = core::sync::atomic::AtomicU32::new(0);

    pub fn set_kernel(tables: KernelTables) {
        KERNEL.call_once(|| tables);
    }

    pub fn with_kernel<R>(f: impl FnOnce(&KernelTables) -> R) -> R {
        f(KERNEL.get().expect("paging not initialized"))
    }

    pub fn set_current(pd: u32) {
        CURRENT.store(pd, core::sync::atomic::Ordering::SeqCst);
    }

    pub fn current() -> u32 {
        CURRENT.load(core::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(not(target_os = "none"))]
mod state {
    use std::cell::{Cell, RefCell};

    use super::KernelTables;

    std::thread_local! {
        static KERNEL: RefCell<Option<KernelTables>> = const { RefCell::new(None) };
        static CURRENT: Cell<u32> = const { Cell::new(0) };
    }

    pub fn set_kernel(tables: KernelTables) {
        KERNEL.with(|k| *k.borrow_mut() = Some(tables));
    }

    pub fn with_kernel<R>(f: impl FnOnce(&KernelTables) -> R) -> R {
        KERNEL.with(|k| f(k.borrow().as_ref().expect("paging not initialized")))
    }

    pub fn set_current(pd: u32) {
        CURRENT.with(|c| c.set(pd));
    }

    pub fn current() -> u32 {
        CURRENT.with(|c| c.get())
    }
}

/// Build the kernel-shared page tables and the initial kernel directory,
/// then make it current. The window tables identity-map low physical
/// memory at the high-half offset; the remaining kernel tables start
/// empty and fill as the heap and scratch regions are mapped.
pub fn init(alloc: &mut FrameAllocator) -> KResult<PageDir> {
    let mut pdes = [0u32; KERNEL_PDE_COUNT];
    for (slot, pde) in pdes.iter_mut().enumerate() {
        let table = alloc.alloc()?;
        phys::zero_frame(table);
        *pde = table.as_u32()
            | (PageFlags::PRESENT | PageFlags::WRITABLE).bits();

        // Identity window: the first 16 tables map phys 0..64 MiB.
        if slot < (super::KERNEL_WINDOW_LEN as usize / (ENTRIES * PAGE_SIZE)) {
            for pti in 0..ENTRIES {
                let pa = (slot * ENTRIES + pti) * PAGE_SIZE;
                phys::write_u32(
                    PhysAddr::new(table.as_u32() + (pti * 4) as u32),
                    pa as u32 | (PageFlags::PRESENT | PageFlags::WRITABLE).bits(),
                );
            }
        }
    }
    state::set_kernel(KernelTables { pdes });

    let dir = new_directory(alloc)?;
    load(dir);
    Ok(dir)
}

/// Allocate a fresh directory containing only the kernel mappings.
pub fn new_directory(alloc: &mut FrameAllocator) -> KResult<PageDir> {
    let frame = alloc.alloc()?;
    phys::zero_frame(frame);
    state::with_kernel(|k| {
        for (slot, &pde) in k.pdes.iter().enumerate() {
            let index = KERNEL_PDE_BASE + slot;
            phys::write_u32(PhysAddr::new(frame.as_u32() + (index * 4) as u32), pde);
        }
    });
    Ok(PageDir(frame))
}

fn pde_addr(pd: PageDir, va: VirtAddr) -> PhysAddr {
    PhysAddr::new(pd.0.as_u32() + (va.pd_index() * 4) as u32)
}

fn read_pde(pd: PageDir, va: VirtAddr) -> u32 {
    phys::read_u32(pde_addr(pd, va))
}

fn pte_addr(table: PhysAddr, va: VirtAddr) -> PhysAddr {
    PhysAddr::new((table.as_u32() & ADDR_MASK) + (va.pt_index() * 4) as u32)
}

/// Walk `pd` and return the physical address backing `va`, or `None` if
/// no present mapping exists.
pub fn phys_of(pd: PageDir, va: VirtAddr) -> Option<PhysAddr> {
    let pde = read_pde(pd, va);
    if pde & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    let pte = phys::read_u32(pte_addr(PhysAddr::new(pde), va));
    if pte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    Some(PhysAddr::new((pte & ADDR_MASK) | va.page_offset() as u32))
}

/// Install a mapping from `va` to `pa`. Allocates the page table on
/// demand when the PDE is absent. The caller is responsible for the TLB.
pub fn map(
    alloc: &mut FrameAllocator,
    pd: PageDir,
    pa: PhysAddr,
    va: VirtAddr,
    flags: PageFlags,
) -> KResult<()> {
    let mut pde = read_pde(pd, va);
    if pde & PageFlags::PRESENT.bits() == 0 {
        let table = alloc.alloc()?;
        phys::zero_frame(table);
        pde = table.as_u32()
            | (PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER).bits();
        phys::write_u32(pde_addr(pd, va), pde);
    }
    let entry = (pa.frame_base().as_u32()) | (flags | PageFlags::PRESENT).bits() & FLAG_MASK;
    phys::write_u32(pte_addr(PhysAddr::new(pde), va), entry);
    Ok(())
}

/// Remove the mapping at `va`, leaving the page table in place. Returns
/// the frame that was mapped, if any.
pub fn unmap(pd: PageDir, va: VirtAddr) -> Option<PhysAddr> {
    let pde = read_pde(pd, va);
    if pde & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    let addr = pte_addr(PhysAddr::new(pde), va);
    let pte = phys::read_u32(addr);
    if pte & PageFlags::PRESENT.bits() == 0 {
        return None;
    }
    phys::write_u32(addr, 0);
    Some(PhysAddr::new(pte & ADDR_MASK))
}

/// Deep-copy a directory for `fork`: kernel tables are shared by
/// reference, every user table and every frame it maps is duplicated.
/// On failure all frames taken so far are returned before the error
/// propagates.
pub fn clone_dir(alloc: &mut FrameAllocator, src: PageDir) -> KResult<PageDir> {
    let dir = alloc.alloc()?;
    phys::zero_frame(dir);
    let mut taken: Vec<PhysAddr> = Vec::new();

    let result = (|| -> KResult<()> {
        for pdi in 0..ENTRIES {
            let pde = phys::read_u32(PhysAddr::new(src.0.as_u32() + (pdi * 4) as u32));
            if pde & PageFlags::PRESENT.bits() == 0 {
                continue;
            }
            let slot = PhysAddr::new(dir.as_u32() + (pdi * 4) as u32);
            if pdi >= KERNEL_PDE_BASE {
                // Kernel quarter: share the table by reference.
                phys::write_u32(slot, pde);
                continue;
            }
            let new_table = alloc.alloc()?;
            taken.push(new_table);
            phys::zero_frame(new_table);
            for pti in 0..ENTRIES {
                let pte =
                    phys::read_u32(PhysAddr::new((pde & ADDR_MASK) + (pti * 4) as u32));
                if pte & PageFlags::PRESENT.bits() == 0 {
                    continue;
                }
                let new_frame = alloc.alloc()?;
                taken.push(new_frame);
                phys::copy_frame(new_frame, PhysAddr::new(pte & ADDR_MASK));
                phys::write_u32(
                    PhysAddr::new(new_table.as_u32() + (pti * 4) as u32),
                    new_frame.as_u32() | (pte & FLAG_MASK),
                );
            }
            phys::write_u32(slot, new_table.as_u32() | (pde & FLAG_MASK));
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(PageDir(dir)),
        Err(e) => {
            for frame in taken {
                alloc.free(frame);
            }
            alloc.free(dir);
            Err(e)
        }
    }
}

/// Free every user frame and user page table in `pd`. Kernel tables are
/// shared and untouched.
pub fn free_user(alloc: &mut FrameAllocator, pd: PageDir) {
    for pdi in 0..KERNEL_PDE_BASE {
        let slot = PhysAddr::new(pd.0.as_u32() + (pdi * 4) as u32);
        let pde = phys::read_u32(slot);
        if pde & PageFlags::PRESENT.bits() == 0 {
            continue;
        }
        for pti in 0..ENTRIES {
            let pte = phys::read_u32(PhysAddr::new((pde & ADDR_MASK) + (pti * 4) as u32));
            if pte & PageFlags::PRESENT.bits() != 0 {
                alloc.free(PhysAddr::new(pte & ADDR_MASK));
            }
        }
        alloc.free(PhysAddr::new(pde & ADDR_MASK));
        phys::write_u32(slot, 0);
    }
}

/// Tear down an entire directory: user frames, user tables, and the
/// directory frame itself.
pub fn destroy(alloc: &mut FrameAllocator, pd: PageDir) {
    free_user(alloc, pd);
    alloc.free(pd.0);
}

/// Make `pd` the current address space. The software handle and the
/// hardware register move together.
pub fn load(pd: PageDir) {
    state::set_current(pd.0.as_u32());
    #[cfg(target_os = "none")]
    crate::arch::load_page_dir(pd.0.as_u32());
}

/// The currently loaded directory.
pub fn current() -> PageDir {
    PageDir(PhysAddr::new(state::current()))
}

/// Invalidate the cached translation for one page of the current
/// directory.
pub fn invalidate(_va: VirtAddr) {
    #[cfg(target_os = "none")]
    crate::arch::invlpg(_va.as_u32());
}

/// Invalidate every cached translation by reloading the current
/// directory.
pub fn flush_all() {
    #[cfg(target_os = "none")]
    crate::arch::load_page_dir(state::current());
}

/// Install a scratch mapping in the kernel-shared tables (bare metal
/// frame copies).
#[cfg(target_os = "none")]
pub fn map_scratch(va: VirtAddr, pa: PhysAddr) {
    scratch_entry(va, pa.frame_base().as_u32()
        | (PageFlags::PRESENT | PageFlags::WRITABLE).bits());
}

/// Remove a scratch mapping.
#[cfg(target_os = "none")]
pub fn unmap_scratch(va: VirtAddr) {
    scratch_entry(va, 0);
}

#[cfg(target_os = "none")]
fn scratch_entry(va: VirtAddr, entry: u32) {
    state::with_kernel(|k| {
        let pde = k.pdes[va.pd_index() - KERNEL_PDE_BASE];
        phys::write_u32(pte_addr(PhysAddr::new(pde), va), entry);
    });
}
