//! Memory management
//!
//! Four layers, leaves first:
//! - [`phys`]: raw access to physical frames (identity window on bare
//!   metal, an in-memory RAM model on the host).
//! - [`frame`]: the physical frame allocator (bump pointer + free stack).
//! - [`paging`]: two-level i386 page directories, mapping primitives and
//!   the deep clone used by `fork`.
//! - [`heap`]: the kernel hole allocator living in a fixed virtual
//!   region above the paging layer.
//!
//! [`region`] tracks per-process mmap areas on top of paging.

pub mod frame;
pub mod heap;
pub mod paging;
pub mod phys;
pub mod region;
pub mod uaccess;

use crate::error::{Errno, KResult};

/// Size of a page / physical frame (4 KiB).
pub const PAGE_SIZE: usize = 4096;
/// log2(PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

// ---------------------------------------------------------------------------
// Fixed virtual layout
// ---------------------------------------------------------------------------

/// Physical load address of the kernel image.
pub const KERNEL_PADDR: u32 = 0x0010_0000;
/// Virtual address the kernel image runs at.
pub const KERNEL_VADDR: u32 = 0xC010_0000;
/// Base of the high-half window that maps low physical memory.
pub const KERNEL_WINDOW_VADDR: u32 = 0xC000_0000;
/// Size of the high-half window (16 statically allocated page tables).
pub const KERNEL_WINDOW_LEN: u32 = 0x0400_0000;

/// Kernel heap data region.
pub const KHEAP_DATA_VADDR: u32 = 0xD000_0000;
/// Virtual span reserved for the kernel heap (256 MiB).
pub const KHEAP_DATA_LEN: u32 = 0x1000_0000;
/// Kernel heap hole index.
pub const KHEAP_INDEX_VADDR: u32 = 0xE000_0000;
/// Capacity of the hole index.
pub const KHEAP_INDEX_NELEM: usize = 0x8000;

/// Frame free-stack region.
pub const PAGE_STACK_VADDR: u32 = 0xE040_0000;

/// Staging area for `execve` argument/environment copying.
pub const EXEC_DATA_VADDR: u32 = 0xFF41_0000;
/// Scratch mappings used when copying foreign frames.
pub const SCRATCH_VADDR: u32 = 0xFF40_0000;

/// User addresses must lie below this bound.
pub const TASK_LOCAL_BOUND: u32 = 0xF000_0000;
/// The program break may not grow past this address.
pub const PROCESS_BREAK_LIMIT: u32 = 0xB000_0000;
/// Top of the per-task user stack (grows down from the user-code limit).
pub const USER_STACK_TOP: u32 = 0xEFFF_F000;
/// Default user stack size (64 KiB).
pub const USER_STACK_LEN: u32 = 0x1_0000;

/// Least upper memory (KiB) the kernel will boot with.
pub const MIN_MEMORY_KIB: u32 = 512;

// ---------------------------------------------------------------------------
// Address newtypes
// ---------------------------------------------------------------------------

/// A 32-bit physical byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysAddr(pub u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Address of the containing frame (low 12 bits masked).
    pub const fn frame_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    pub const fn offset_in_frame(self) -> usize {
        (self.0 & (PAGE_SIZE as u32 - 1)) as usize
    }

    pub const fn is_frame_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u32 == 0
    }
}

/// A 32-bit virtual byte address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(pub u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Page-directory index (top 10 bits).
    pub const fn pd_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// Page-table index (middle 10 bits).
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x3ff) as usize
    }

    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    pub const fn page_offset(self) -> usize {
        (self.0 & (PAGE_SIZE as u32 - 1)) as usize
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE as u32 == 0
    }

    pub const fn is_user(self) -> bool {
        self.0 < TASK_LOCAL_BOUND && self.0 >= PAGE_SIZE as u32
    }
}

/// Initialize the memory subsystem from the boot-reported upper memory.
///
/// Order matters: the physical model and frame allocator come up first,
/// then the kernel page tables, then the heap (which draws frames from
/// the allocator). Panics if less than [`MIN_MEMORY_KIB`] is available.
pub fn init(mem_upper_kib: u32) -> KResult<()> {
    if mem_upper_kib < MIN_MEMORY_KIB {
        panic!(
            "too little memory available: {} KiB, at least {} KiB is required",
            mem_upper_kib, MIN_MEMORY_KIB
        );
    }
    phys::init(mem_upper_kib);
    frame::init(mem_upper_kib);
    frame::with_allocator(paging::init).map_err(|_| Errno::Enomem)?;
    heap::init(mem_upper_kib);
    log::info!("mm: {} KiB upper memory", mem_upper_kib);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_decomposition() {
        let va = VirtAddr::new(0xC010_1234);
        assert_eq!(va.pd_index(), 0xC010_1234usize >> 22);
        assert_eq!(va.pt_index(), 0x101);
        assert_eq!(va.page_offset(), 0x234);
        assert_eq!(va.page_base().as_u32(), 0xC010_1000);
    }

    #[test]
    fn frame_masking() {
        let pa = PhysAddr::new(0x0012_3fff);
        assert_eq!(pa.frame_base().as_u32(), 0x0012_3000);
        assert!(!pa.is_frame_aligned());
        assert!(pa.frame_base().is_frame_aligned());
    }
}
