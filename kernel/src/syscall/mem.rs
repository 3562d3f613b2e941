//! Memory system calls

use crate::error::{Errno, KResult};
use crate::mm::region::{MapFlags, Prot};
use crate::process::{self, memory};

/// Map mmap prot bits (PROT_READ 1, PROT_WRITE 2, PROT_EXEC 4).
fn prot_from(raw: u32) -> Prot {
    Prot::from_bits_truncate(raw)
}

pub fn sys_brk(addr: u32) -> KResult<isize> {
    memory::brk(addr).map(|brk| brk as isize)
}

pub fn sys_mmap(
    addr: u32,
    len: usize,
    prot: u32,
    flags: u32,
    fd: i32,
    offset: u32,
) -> KResult<isize> {
    let flags = MapFlags::from_bits_truncate(flags);
    let file = if flags.contains(MapFlags::ANONYMOUS) {
        if fd != -1 {
            return Err(Errno::Einval);
        }
        None
    } else {
        Some(process::with_current(|p| p.file(fd as usize))??)
    };
    if let Some(f) = &file {
        if !f.mode.readable() {
            return Err(Errno::Eacces);
        }
    }
    memory::mmap(addr, len, prot_from(prot), flags, file, offset as u64)
        .map(|base| base as isize)
}

pub fn sys_munmap(addr: u32, len: usize) -> KResult<isize> {
    memory::munmap(addr, len)?;
    Ok(0)
}

pub fn sys_mprotect(addr: u32, len: usize, prot: u32) -> KResult<isize> {
    memory::mprotect(addr, len, prot_from(prot))?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, SYS_BRK, SYS_MMAP, SYS_MUNMAP};
    use super::*;
    use crate::mm::{uaccess, VirtAddr, PROCESS_BREAK_LIMIT};
    use crate::process::testutil;

    const MAP_PRIVATE: u32 = 2;
    const MAP_ANONYMOUS: u32 = 0x20;
    const PROT_RW: u32 = 3;

    #[test]
    fn anonymous_mmap_munmap_via_dispatch() {
        testutil::boot(900);
        crate::process::with_current(|p| {
            p.brk_start = 0x0900_0000;
            p.brk = 0x0900_0000;
        })
        .unwrap();

        let addr = dispatch(
            SYS_MMAP,
            [0, 8192, PROT_RW, MAP_PRIVATE | MAP_ANONYMOUS, (-1i32) as u32, 0],
        );
        assert!(addr > 0);
        let addr = addr as u32;
        assert!(addr >= PROCESS_BREAK_LIMIT);
        assert_eq!(addr % crate::mm::PAGE_SIZE as u32, 0);

        // Every byte is readable and writable.
        let dir = crate::syscall::current_dir();
        uaccess::write_bytes(dir, VirtAddr::new(addr), &[7u8; 8192]).unwrap();
        let mut back = [0u8; 4];
        uaccess::read_bytes(dir, VirtAddr::new(addr + 8188), &mut back).unwrap();
        assert_eq!(back, [7; 4]);

        assert_eq!(dispatch(SYS_MUNMAP, [addr, 8192, 0, 0, 0, 0]), 0);
        assert_eq!(
            uaccess::read_bytes(dir, VirtAddr::new(addr), &mut back),
            Err(Errno::Efault)
        );
    }

    #[test]
    fn brk_query_and_grow() {
        testutil::boot(900);
        crate::process::with_current(|p| {
            p.brk_start = 0x0900_0000;
            p.brk = 0x0900_0000;
        })
        .unwrap();
        assert_eq!(dispatch(SYS_BRK, [0, 0, 0, 0, 0, 0]), 0x0900_0000);
        assert_eq!(
            dispatch(SYS_BRK, [0x0900_2000, 0, 0, 0, 0, 0]),
            0x0900_2000
        );
        // The fresh pages are zeroed and usable.
        let dir = crate::syscall::current_dir();
        let mut buf = [1u8; 4];
        uaccess::read_bytes(dir, VirtAddr::new(0x0900_1000), &mut buf).unwrap();
        assert_eq!(buf, [0; 4]);
    }

    #[test]
    fn mmap_rejects_anonymous_with_fd() {
        testutil::boot(900);
        assert_eq!(
            dispatch(
                SYS_MMAP,
                [0, 4096, PROT_RW, MAP_PRIVATE | MAP_ANONYMOUS, 3, 0]
            ),
            Errno::Einval.as_neg()
        );
    }
}
