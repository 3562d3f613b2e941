//! fork
//!
//! Deep-copies the caller: page directory (kernel tables shared, every
//! user page duplicated), descriptor table (shared open files), signal
//! actions and blocked mask, credentials, and working directory.
//! Pending signals and interval timers start clear in the child. The
//! child's saved context equals the parent's; the syscall return path
//! makes the child see 0 while the parent gets the child's pid.

use crate::error::{Errno, KResult};
use crate::mm::{frame, paging};
use crate::task::{sched, Pid};

use super::{with_process, with_table, Process};

/// Create a child of the current process. Returns the child's pid.
pub fn fork() -> KResult<Pid> {
    let parent = sched::current_pid();

    frame::with_allocator(|alloc| {
        let (parent_dir, parent_ctx) = sched::with_scheduler(|s| {
            s.task(parent)
                .map(|t| (t.page_dir, t.context))
                .ok_or(Errno::Esrch)
        })?;

        let child_dir = paging::clone_dir(alloc, parent_dir)?;

        let child = match sched::with_scheduler(|s| s.spawn(parent, child_dir, parent_ctx.eip))
        {
            Ok(pid) => pid,
            Err(e) => {
                paging::destroy(alloc, child_dir);
                return Err(e);
            }
        };
        sched::with_scheduler(|s| {
            if let Some(task) = s.task_mut(child) {
                task.context = parent_ctx;
            }
        });

        let child_proc = with_process(parent, |p| Process::fork_from(p))?;
        with_table(|t| t.insert(child, child_proc))?;
        bump_ancestors(parent);
        Ok(child)
    })
}

/// Record one new descendant on the parent and every ancestor up to and
/// including pid 0.
fn bump_ancestors(parent: Pid) {
    let mut cur = parent;
    loop {
        let _ = with_process(cur, |p| p.children += 1);
        if cur == 0 {
            break;
        }
        cur = match sched::with_scheduler(|s| s.task(cur).map(|t| t.ppid)) {
            Some(ppid) => ppid,
            None => break,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;
    use crate::mm::paging::PageFlags;
    use crate::mm::{phys, VirtAddr, PAGE_SIZE};
    use crate::signal::{SigHandler, SIGUSR1};
    use crate::task::TaskState;

    #[test]
    fn fork_duplicates_address_space() {
        // The child's address space, read back page by page, equals the
        // parent's, and the two diverge on the next write.
        let mut alloc = testutil::boot(800);
        let parent_dir = sched::with_scheduler(|s| s.task(0).unwrap().page_dir);
        for i in 0..4 {
            let frame = alloc.alloc().unwrap();
            let va = VirtAddr::new(0x0800_0000 + i * PAGE_SIZE as u32);
            paging::map(
                &mut alloc,
                parent_dir,
                frame,
                va,
                PageFlags::WRITABLE | PageFlags::USER,
            )
            .unwrap();
            phys::write_u32(frame, 0x1000 + i);
        }

        let child = fork().unwrap();
        let child_dir = sched::with_scheduler(|s| s.task(child).unwrap().page_dir);

        for i in 0..4 {
            let va = VirtAddr::new(0x0800_0000 + i * PAGE_SIZE as u32);
            let ppage = paging::phys_of(parent_dir, va).unwrap();
            let cpage = paging::phys_of(child_dir, va).unwrap();
            assert_ne!(ppage, cpage);
            assert_eq!(phys::read_u32(ppage), phys::read_u32(cpage));
        }

        // Divergence on write.
        let va = VirtAddr::new(0x0800_0000);
        let cpage = paging::phys_of(child_dir, va).unwrap();
        phys::write_u32(cpage, 0xffff_ffff);
        let ppage = paging::phys_of(parent_dir, va).unwrap();
        assert_eq!(phys::read_u32(ppage), 0x1000);
    }

    #[test]
    fn fork_copies_signal_dispositions_but_not_pending() {
        testutil::boot(800);
        super::super::with_current(|p| {
            p.signals.actions[SIGUSR1 as usize].handler = SigHandler::Handler(0x4242);
            p.signals
                .post(SIGUSR1, crate::signal::SigInfo::kernel(SIGUSR1));
        })
        .unwrap();

        let child = fork().unwrap();
        let (handler, pending) = with_process(child, |p| {
            (
                p.signals.actions[SIGUSR1 as usize].handler,
                p.signals.pending,
            )
        })
        .unwrap();
        assert_eq!(handler, SigHandler::Handler(0x4242));
        assert!(pending.is_empty());
    }

    #[test]
    fn fork_shares_open_files() {
        testutil::boot(800);
        let (r, w) = crate::fs::pipe::create_pipe(0, 0).unwrap();
        super::super::with_current(|p| {
            p.files[3] = Some(super::super::Fd {
                file: r,
                cloexec: false,
            });
            p.files[4] = Some(super::super::Fd {
                file: w,
                cloexec: false,
            });
        })
        .unwrap();

        let child = fork().unwrap();
        // Parent writes through its descriptor, child reads through the
        // shared open file.
        let wfile = super::super::with_current(|p| p.file(4).unwrap()).unwrap();
        wfile.write(b"A").unwrap();
        let rfile = with_process(child, |p| p.file(3).unwrap()).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(rfile.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'A');
    }

    #[test]
    fn fork_tracks_descendants_for_wait() {
        testutil::boot(800);
        let child = fork().unwrap();
        assert_eq!(super::super::with_process(0, |p| p.children).unwrap(), 1);
        // Grandchild bumps both ancestors. Run it "as" the child by
        // advancing the scheduler onto it.
        sched::with_scheduler(|s| {
            while s.current_pid() != child {
                s.schedule().expect("child must become runnable");
            }
        });
        let _grandchild = fork().unwrap();
        assert_eq!(super::super::with_process(child, |p| p.children).unwrap(), 1);
        assert_eq!(super::super::with_process(0, |p| p.children).unwrap(), 2);
    }

    #[test]
    fn forked_child_is_ready() {
        testutil::boot(800);
        let child = fork().unwrap();
        assert_eq!(
            sched::with_scheduler(|s| s.task(child).unwrap().state),
            TaskState::Ready
        );
        assert_eq!(
            sched::with_scheduler(|s| s.task(child).unwrap().ppid),
            0
        );
    }
}
