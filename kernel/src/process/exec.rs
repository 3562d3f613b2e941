//! execve
//!
//! Replaces the calling task's image: a fresh page directory receives
//! the ELF sections and a new user stack with `argv`/`envp`; the old
//! user mappings are torn down only after the new image is complete, so
//! a failed exec leaves the caller untouched.

use alloc::string::String;
use alloc::vec::Vec;

use crate::elf;
use crate::error::{Errno, KResult};
use crate::fs::perm::{self, Access};
use crate::fs::{namei, FileType};
use crate::mm::frame::FrameAllocator;
use crate::mm::paging::{self, PageDir, PageFlags};
use crate::mm::{frame, uaccess, VirtAddr, PAGE_SIZE, USER_STACK_LEN, USER_STACK_TOP};
use crate::task::sched;

use super::{current_cred, current_cwd, with_process};

/// The user-visible entry state of a fresh image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecImage {
    pub entry: u32,
    pub user_esp: u32,
}

/// Execute `path` in place of the current process image.
pub fn execve(path: &str, argv: &[String], envp: &[String]) -> KResult<ExecImage> {
    let pid = sched::current_pid();
    let cred = current_cred();
    let cwd = current_cwd();

    let inode = namei::resolve(path, Some(&cwd), Some(&cred))?;
    if inode.file_type() != Some(FileType::Regular) {
        return Err(Errno::Eacces);
    }
    perm::check(&inode.attr.read(), &cred, Access::Exec, false)?;

    let (new_dir, image, user_esp) = frame::with_allocator(|alloc| {
        let new_dir = paging::new_directory(alloc)?;
        let result = (|| -> KResult<(elf::LoadedImage, u32)> {
            let image = elf::load(alloc, new_dir, &inode)?;
            let esp = build_user_stack(alloc, new_dir, argv, envp)?;
            Ok((image, esp))
        })();
        match result {
            Ok((image, esp)) => Ok((new_dir, image, esp)),
            Err(e) => {
                paging::destroy(alloc, new_dir);
                Err(e)
            }
        }
    })?;

    // Point of no return: swap the address space.
    let old_dir = sched::with_scheduler(|s| {
        let task = s.task_mut(pid).expect("current task missing");
        let old = task.page_dir;
        task.page_dir = new_dir;
        task.context.eip = image.entry;
        task.context.esp = user_esp;
        old
    });
    paging::load(new_dir);
    frame::with_allocator(|alloc| paging::destroy(alloc, old_dir));

    with_process(pid, |proc| {
        proc.signals.reset_handlers();
        proc.regions = crate::mm::region::RegionList::new();
        proc.brk_start = image.brk_start;
        proc.brk = image.brk_start;
        for slot in proc.files.iter_mut() {
            if slot.as_ref().map(|f| f.cloexec).unwrap_or(false) {
                *slot = None;
            }
        }
    })?;

    Ok(ExecImage {
        entry: image.entry,
        user_esp,
    })
}

/// Map the user stack and lay out `argc`/`argv`/`envp` on it.
///
/// Layout, from the returned esp upward: `argc`, the argv pointer array
/// (NULL terminated), the envp pointer array (NULL terminated), then
/// the string bytes near the stack top.
fn build_user_stack(
    alloc: &mut FrameAllocator,
    dir: PageDir,
    argv: &[String],
    envp: &[String],
) -> KResult<u32> {
    let mut va = USER_STACK_TOP - USER_STACK_LEN;
    while va < USER_STACK_TOP {
        let frame = alloc.alloc()?;
        crate::mm::phys::zero_frame(frame);
        paging::map(
            alloc,
            dir,
            frame,
            VirtAddr::new(va),
            PageFlags::WRITABLE | PageFlags::USER,
        )?;
        va += PAGE_SIZE as u32;
    }

    let mut sp = USER_STACK_TOP;
    let mut push_string = |sp: &mut u32, s: &str| -> KResult<u32> {
        let bytes = s.as_bytes();
        *sp -= bytes.len() as u32 + 1;
        uaccess::write_bytes(dir, VirtAddr::new(*sp), bytes)?;
        uaccess::write_bytes(dir, VirtAddr::new(*sp + bytes.len() as u32), &[0])?;
        Ok(*sp)
    };

    let mut argv_ptrs = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_ptrs.push(push_string(&mut sp, arg)?);
    }
    let mut envp_ptrs = Vec::with_capacity(envp.len());
    for env in envp {
        envp_ptrs.push(push_string(&mut sp, env)?);
    }

    sp &= !3;
    let mut push_u32 = |sp: &mut u32, value: u32| -> KResult<()> {
        *sp -= 4;
        uaccess::write_bytes(dir, VirtAddr::new(*sp), &value.to_le_bytes())
    };

    push_u32(&mut sp, 0)?; // envp terminator
    for &ptr in envp_ptrs.iter().rev() {
        push_u32(&mut sp, ptr)?;
    }
    push_u32(&mut sp, 0)?; // argv terminator
    for &ptr in argv_ptrs.iter().rev() {
        push_u32(&mut sp, ptr)?;
    }
    push_u32(&mut sp, argv.len() as u32)?;
    Ok(sp)
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::super::testutil;
    use super::*;
    use crate::mm::phys;

    fn read_u32_user(dir: PageDir, va: u32) -> u32 {
        let mut buf = [0u8; 4];
        uaccess::read_bytes(dir, VirtAddr::new(va), &mut buf).unwrap();
        u32::from_le_bytes(buf)
    }

    fn read_cstr_user(dir: PageDir, va: u32) -> String {
        uaccess::read_cstring(dir, VirtAddr::new(va), 256).unwrap()
    }

    #[test]
    fn stack_layout_matches_abi() {
        let mut alloc = testutil::boot(800);
        let dir = paging::new_directory(&mut alloc).unwrap();
        let argv = ["prog".to_string(), "-v".to_string()];
        let envp = ["HOME=/root".to_string()];

        let esp = build_user_stack(&mut alloc, dir, &argv, &envp).unwrap();
        assert_eq!(esp % 4, 0);

        let argc = read_u32_user(dir, esp);
        assert_eq!(argc, 2);
        let argv0 = read_u32_user(dir, esp + 4);
        let argv1 = read_u32_user(dir, esp + 8);
        let argv_null = read_u32_user(dir, esp + 12);
        assert_eq!(read_cstr_user(dir, argv0), "prog");
        assert_eq!(read_cstr_user(dir, argv1), "-v");
        assert_eq!(argv_null, 0);
        let envp0 = read_u32_user(dir, esp + 16);
        let envp_null = read_u32_user(dir, esp + 20);
        assert_eq!(read_cstr_user(dir, envp0), "HOME=/root");
        assert_eq!(envp_null, 0);
    }

    #[test]
    fn stack_pages_are_mapped_over_whole_window() {
        let mut alloc = testutil::boot(800);
        let dir = paging::new_directory(&mut alloc).unwrap();
        build_user_stack(&mut alloc, dir, &[], &[]).unwrap();
        let bottom = USER_STACK_TOP - USER_STACK_LEN;
        assert!(paging::phys_of(dir, VirtAddr::new(bottom)).is_some());
        assert!(paging::phys_of(dir, VirtAddr::new(USER_STACK_TOP - 4)).is_some());
        assert!(paging::phys_of(dir, VirtAddr::new(USER_STACK_TOP)).is_none());
        let pa = phys::read_u32(
            paging::phys_of(dir, VirtAddr::new(bottom)).unwrap(),
        );
        assert_eq!(pa, 0, "stack starts zeroed");
    }
}
