//! Physical frame access
//!
//! Every read or write of raw physical memory funnels through this
//! module. On bare metal, frames inside the high-half window are reached
//! by the fixed virtual offset; frames above it are mapped briefly into
//! one of a small pool of scratch slots, with the TLB entry invalidated
//! on release. On the host the "physical memory" is a sparse in-memory
//! model, so the paging and allocator logic is exercised bit-exact by
//! ordinary unit tests.

use super::{PhysAddr, PAGE_SIZE};

#[cfg(not(target_os = "none"))]
mod backing {
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;
    use std::cell::RefCell;

    use super::{PhysAddr, PAGE_SIZE};

    std::thread_local! {
        /// Sparse model of physical RAM, one zero-filled frame per entry.
        /// Thread-local so concurrently running tests cannot see each
        /// other's frames.
        static FRAMES: RefCell<BTreeMap<u32, Box<[u8; PAGE_SIZE]>>> =
            RefCell::new(BTreeMap::new());
    }

    pub fn with_frame<R>(pa: PhysAddr, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let base = pa.frame_base().as_u32();
        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            let frame = frames
                .entry(base)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            f(frame)
        })
    }

    pub fn reset() {
        FRAMES.with(|frames| frames.borrow_mut().clear());
    }
}

#[cfg(target_os = "none")]
mod backing {
    use spin::Mutex;

    use super::{PhysAddr, PAGE_SIZE};
    use crate::mm::{KERNEL_WINDOW_LEN, KERNEL_WINDOW_VADDR, SCRATCH_VADDR};

    /// Scratch slots for frames outside the high-half window.
    const SCRATCH_SLOTS: usize = 4;

    static SCRATCH: Mutex<[bool; SCRATCH_SLOTS]> = Mutex::new([false; SCRATCH_SLOTS]);

    fn take_slot() -> usize {
        loop {
            let mut slots = SCRATCH.lock();
            if let Some(i) = slots.iter().position(|used| !used) {
                slots[i] = true;
                return i;
            }
            drop(slots);
            core::hint::spin_loop();
        }
    }

    fn release_slot(i: usize) {
        SCRATCH.lock()[i] = false;
    }

    pub fn with_frame<R>(pa: PhysAddr, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
        let base = pa.frame_base().as_u32();
        if base < KERNEL_WINDOW_LEN {
            let ptr = (base + KERNEL_WINDOW_VADDR) as *mut [u8; PAGE_SIZE];
            unsafe { f(&mut *ptr) }
        } else {
            let slot = take_slot();
            let vaddr = SCRATCH_VADDR + (slot * PAGE_SIZE) as u32;
            crate::mm::paging::map_scratch(crate::mm::VirtAddr::new(vaddr), PhysAddr::new(base));
            crate::arch::invlpg(vaddr);
            let result = unsafe { f(&mut *(vaddr as *mut [u8; PAGE_SIZE])) };
            crate::mm::paging::unmap_scratch(crate::mm::VirtAddr::new(vaddr));
            crate::arch::invlpg(vaddr);
            release_slot(slot);
            result
        }
    }
}

/// Initialize the physical access layer. On the host this clears the RAM
/// model so each boot (or test) starts from zeroed memory.
pub fn init(_mem_upper_kib: u32) {
    #[cfg(not(target_os = "none"))]
    backing::reset();
}

/// Run `f` over the frame containing `pa`.
pub fn with_frame<R>(pa: PhysAddr, f: impl FnOnce(&mut [u8; PAGE_SIZE]) -> R) -> R {
    backing::with_frame(pa, f)
}

/// Read a naturally aligned u32 at physical address `pa`.
pub fn read_u32(pa: PhysAddr) -> u32 {
    debug_assert!(pa.as_u32() % 4 == 0);
    with_frame(pa, |frame| {
        let off = pa.offset_in_frame();
        u32::from_le_bytes([frame[off], frame[off + 1], frame[off + 2], frame[off + 3]])
    })
}

/// Write a naturally aligned u32 at physical address `pa`.
pub fn write_u32(pa: PhysAddr, value: u32) {
    debug_assert!(pa.as_u32() % 4 == 0);
    with_frame(pa, |frame| {
        let off = pa.offset_in_frame();
        frame[off..off + 4].copy_from_slice(&value.to_le_bytes());
    });
}

/// Copy bytes out of physical memory. The range may not cross a frame
/// boundary.
pub fn read_bytes(pa: PhysAddr, buf: &mut [u8]) {
    debug_assert!(pa.offset_in_frame() + buf.len() <= PAGE_SIZE);
    with_frame(pa, |frame| {
        let off = pa.offset_in_frame();
        buf.copy_from_slice(&frame[off..off + buf.len()]);
    });
}

/// Copy bytes into physical memory. The range may not cross a frame
/// boundary.
pub fn write_bytes(pa: PhysAddr, buf: &[u8]) {
    debug_assert!(pa.offset_in_frame() + buf.len() <= PAGE_SIZE);
    with_frame(pa, |frame| {
        let off = pa.offset_in_frame();
        frame[off..off + buf.len()].copy_from_slice(buf);
    });
}

/// Zero the frame containing `pa`.
pub fn zero_frame(pa: PhysAddr) {
    with_frame(pa, |frame| frame.fill(0));
}

/// Copy one whole frame to another.
pub fn copy_frame(dst: PhysAddr, src: PhysAddr) {
    let mut buf = [0u8; PAGE_SIZE];
    read_bytes(src.frame_base(), &mut buf);
    write_bytes(dst.frame_base(), &buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip() {
        let pa = PhysAddr::new(0x0050_0010);
        write_u32(pa, 0xdead_beef);
        assert_eq!(read_u32(pa), 0xdead_beef);
    }

    #[test]
    fn frames_start_zeroed() {
        let pa = PhysAddr::new(0x0077_0000);
        assert_eq!(read_u32(pa), 0);
    }

    #[test]
    fn copy_frame_duplicates_contents() {
        let src = PhysAddr::new(0x0060_0000);
        let dst = PhysAddr::new(0x0061_0000);
        write_u32(src, 0x1234_5678);
        write_u32(PhysAddr::new(src.as_u32() + PAGE_SIZE as u32 - 4), 0x9abc_def0);
        copy_frame(dst, src);
        assert_eq!(read_u32(dst), 0x1234_5678);
        assert_eq!(
            read_u32(PhysAddr::new(dst.as_u32() + PAGE_SIZE as u32 - 4)),
            0x9abc_def0
        );
    }
}
