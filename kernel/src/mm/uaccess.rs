//! User-memory access
//!
//! Kernel reads and writes of user address spaces go through the page
//! tables, one page at a time, so a bad user pointer surfaces as EFAULT
//! instead of a kernel fault.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::paging::{self, PageDir};
use super::{phys, VirtAddr, PAGE_SIZE};
use crate::error::{Errno, KResult};

/// Copy bytes out of `pd` at `va`.
pub fn read_bytes(pd: PageDir, va: VirtAddr, buf: &mut [u8]) -> KResult<()> {
    let mut addr = va.as_u32();
    let mut done = 0usize;
    while done < buf.len() {
        let pa = paging::phys_of(pd, VirtAddr::new(addr)).ok_or(Errno::Efault)?;
        let in_page = PAGE_SIZE - pa.offset_in_frame();
        let take = in_page.min(buf.len() - done);
        phys::read_bytes(pa, &mut buf[done..done + take]);
        done += take;
        addr = addr.wrapping_add(take as u32);
    }
    Ok(())
}

/// Copy bytes into `pd` at `va`.
pub fn write_bytes(pd: PageDir, va: VirtAddr, buf: &[u8]) -> KResult<()> {
    let mut addr = va.as_u32();
    let mut done = 0usize;
    while done < buf.len() {
        let pa = paging::phys_of(pd, VirtAddr::new(addr)).ok_or(Errno::Efault)?;
        let in_page = PAGE_SIZE - pa.offset_in_frame();
        let take = in_page.min(buf.len() - done);
        phys::write_bytes(pa, &buf[done..done + take]);
        done += take;
        addr = addr.wrapping_add(take as u32);
    }
    Ok(())
}

/// Read a NUL-terminated string (at most `max` bytes) out of `pd`.
pub fn read_cstring(pd: PageDir, va: VirtAddr, max: usize) -> KResult<String> {
    let mut out = Vec::new();
    let mut addr = va.as_u32();
    while out.len() < max {
        let pa = paging::phys_of(pd, VirtAddr::new(addr)).ok_or(Errno::Efault)?;
        let in_page = PAGE_SIZE - pa.offset_in_frame();
        let take = in_page.min(max - out.len());
        let mut chunk = vec![0u8; take];
        phys::read_bytes(pa, &mut chunk);
        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            out.extend_from_slice(&chunk[..nul]);
            return String::from_utf8(out).map_err(|_| Errno::Einval);
        }
        out.extend_from_slice(&chunk);
        addr = addr.wrapping_add(take as u32);
    }
    Err(Errno::Enametoolong)
}

/// Zero a span of user memory.
pub fn zero_bytes(pd: PageDir, va: VirtAddr, len: usize) -> KResult<()> {
    let zeros = [0u8; PAGE_SIZE];
    let mut addr = va.as_u32();
    let mut left = len;
    while left > 0 {
        let pa = paging::phys_of(pd, VirtAddr::new(addr)).ok_or(Errno::Efault)?;
        let in_page = PAGE_SIZE - pa.offset_in_frame();
        let take = in_page.min(left);
        phys::write_bytes(pa, &zeros[..take]);
        left -= take;
        addr = addr.wrapping_add(take as u32);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::FrameAllocator;
    use crate::mm::paging::PageFlags;

    fn setup() -> (FrameAllocator, PageDir) {
        crate::mm::phys::init(0);
        let storage = alloc::boxed::Box::leak(alloc::vec![0u32; 600].into_boxed_slice());
        let base = 0x0100_0000u32;
        let mut alloc = FrameAllocator::new(base, base + 600 * PAGE_SIZE as u32, storage);
        let _kernel = paging::init(&mut alloc).unwrap();
        let pd = paging::new_directory(&mut alloc).unwrap();
        (alloc, pd)
    }

    fn map_user(alloc: &mut FrameAllocator, pd: PageDir, va: u32) {
        let frame = alloc.alloc().unwrap();
        paging::map(
            alloc,
            pd,
            frame,
            VirtAddr::new(va),
            PageFlags::WRITABLE | PageFlags::USER,
        )
        .unwrap();
    }

    #[test]
    fn round_trip_across_page_boundary() {
        let (mut alloc, pd) = setup();
        map_user(&mut alloc, pd, 0x0800_0000);
        map_user(&mut alloc, pd, 0x0800_1000);
        let data: Vec<u8> = (0..600).map(|i| (i % 256) as u8).collect();
        let va = VirtAddr::new(0x0800_0000 + PAGE_SIZE as u32 - 300);
        write_bytes(pd, va, &data).unwrap();
        let mut back = vec![0u8; 600];
        read_bytes(pd, va, &mut back).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn unmapped_access_is_efault() {
        let (_alloc, pd) = setup();
        let mut buf = [0u8; 4];
        assert_eq!(
            read_bytes(pd, VirtAddr::new(0x0900_0000), &mut buf),
            Err(Errno::Efault)
        );
        assert_eq!(
            write_bytes(pd, VirtAddr::new(0x0900_0000), &buf),
            Err(Errno::Efault)
        );
    }

    #[test]
    fn cstring_stops_at_nul() {
        let (mut alloc, pd) = setup();
        map_user(&mut alloc, pd, 0x0800_0000);
        let va = VirtAddr::new(0x0800_0000);
        write_bytes(pd, va, b"hello\0world").unwrap();
        assert_eq!(read_cstring(pd, va, 64).unwrap(), "hello");
    }

    #[test]
    fn unterminated_cstring_is_rejected() {
        let (mut alloc, pd) = setup();
        map_user(&mut alloc, pd, 0x0800_0000);
        let va = VirtAddr::new(0x0800_0000);
        write_bytes(pd, va, &[b'x'; 32]).unwrap();
        assert_eq!(read_cstring(pd, va, 16), Err(Errno::Enametoolong));
    }
}
