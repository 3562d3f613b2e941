//! Process-control system calls

use crate::error::{Errno, KResult};
use crate::process::{self, exec, exit, fork, wait};
use crate::task::{sched, TaskState};

use super::{put_user_u32, user_cstring, user_string_array};

/// Arguments/environment entries accepted by execve.
const ARG_MAX_ENTRIES: usize = 1024;

pub fn sys_exit(code: i32) -> KResult<isize> {
    let pid = exit::exit(code)?;
    // The task never returns to user mode; give the CPU away.
    sched::relax();
    Ok(pid as isize)
}

pub fn sys_fork() -> KResult<isize> {
    fork::fork().map(|pid| pid as isize)
}

pub fn sys_getpid() -> KResult<isize> {
    Ok(sched::current_pid() as isize)
}

pub fn sys_getppid() -> KResult<isize> {
    let pid = sched::current_pid();
    let ppid = sched::with_scheduler(|s| s.task(pid).map(|t| t.ppid)).ok_or(Errno::Esrch)?;
    Ok(ppid as isize)
}

pub fn sys_waitpid(pid: i32, status_ptr: u32, options: i32) -> KResult<isize> {
    sys_wait4(pid, status_ptr, options, 0)
}

pub fn sys_wait4(pid: i32, status_ptr: u32, options: i32, rusage_ptr: u32) -> KResult<isize> {
    match wait::wait4(pid, options)? {
        Some(result) => {
            if status_ptr != 0 {
                put_user_u32(status_ptr, result.status as u32)?;
            }
            if rusage_ptr != 0 {
                write_rusage(rusage_ptr, &result.rusage)?;
            }
            Ok(result.pid as isize)
        }
        None => Ok(0),
    }
}

/// struct rusage layout: two struct timeval (sec, usec), the rest
/// zeroed.
pub(super) fn write_rusage(va: u32, usage: &process::Rusage) -> KResult<()> {
    let mut raw = [0u8; 72];
    let hz = crate::time::HZ;
    let (usec, ssec) = (usage.utime_ticks / hz, usage.stime_ticks / hz);
    let (uusec, susec) = (
        (usage.utime_ticks % hz) * crate::time::TICK_US,
        (usage.stime_ticks % hz) * crate::time::TICK_US,
    );
    raw[0..4].copy_from_slice(&(usec as u32).to_le_bytes());
    raw[4..8].copy_from_slice(&(uusec as u32).to_le_bytes());
    raw[8..12].copy_from_slice(&(ssec as u32).to_le_bytes());
    raw[12..16].copy_from_slice(&(susec as u32).to_le_bytes());
    super::copy_to_user(va, &raw)
}

pub fn sys_execve(path_ptr: u32, argv_ptr: u32, envp_ptr: u32) -> KResult<isize> {
    let path = user_cstring(path_ptr)?;
    let argv = user_string_array(argv_ptr, ARG_MAX_ENTRIES)?;
    let envp = user_string_array(envp_ptr, ARG_MAX_ENTRIES)?;
    let image = exec::execve(&path, &argv, &envp)?;
    // The trap frame is rewritten by the arch layer from the task
    // context; the accumulator of a successful exec is zero.
    let _ = image;
    Ok(0)
}

pub fn sys_pause() -> KResult<isize> {
    let pid = sched::current_pid();
    process::with_current(|p| p.paused = true)?;
    sched::with_scheduler(|s| {
        if let Some(task) = s.task_mut(pid) {
            task.state = TaskState::Paused;
        }
    });
    // Spin-yield until a signal wakes the task, then report EINTR the
    // way pause always does.
    loop {
        let paused = process::with_current(|p| p.paused)?;
        if !paused {
            break;
        }
        let deliverable =
            process::with_current(|p| !p.signals.deliverable().is_empty())?;
        if deliverable {
            process::with_current(|p| p.paused = false)?;
            sched::with_scheduler(|s| s.wake(pid));
            break;
        }
        sched::relax();
        #[cfg(not(target_os = "none"))]
        break; // no interrupts can arrive in a host unit test
    }
    Err(Errno::Eintr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::paging::PageFlags;
    use crate::mm::{paging, VirtAddr, PAGE_SIZE};
    use crate::process::testutil;
    use crate::syscall::{dispatch, SYS_FORK, SYS_GETPID, SYS_GETPPID, SYS_WAIT4};

    fn map_user_page(va: u32) {
        let dir = crate::syscall::current_dir();
        crate::mm::frame::with_allocator(|alloc| {
            let frame = alloc.alloc().unwrap();
            crate::mm::phys::zero_frame(frame);
            paging::map(
                alloc,
                dir,
                frame,
                VirtAddr::new(va),
                PageFlags::WRITABLE | PageFlags::USER,
            )
            .unwrap();
        });
        let _ = PAGE_SIZE;
    }

    #[test]
    fn fork_wait_round_trip_through_dispatch() {
        testutil::boot(900);
        map_user_page(0x0810_0000);

        let child = dispatch(SYS_FORK, [0; 6]);
        assert!(child > 0);

        // Run the child to completion.
        crate::task::sched::with_scheduler(|s| {
            while s.current_pid() != child as i32 {
                s.schedule().expect("child runnable");
            }
        });
        crate::process::exit::exit(9).unwrap();
        crate::task::sched::with_scheduler(|s| {
            while s.current_pid() != 0 {
                s.schedule().expect("parent runnable");
            }
        });

        let status_ptr = 0x0810_0000u32;
        let reaped = dispatch(SYS_WAIT4, [child as u32, status_ptr, 0, 0, 0, 0]);
        assert_eq!(reaped, child);
        assert_eq!(crate::syscall::user_u32(status_ptr).unwrap(), 9 << 8);
    }

    #[test]
    fn pid_calls_report_identity() {
        testutil::boot(900);
        assert_eq!(dispatch(SYS_GETPID, [0; 6]), 0);
        let child = dispatch(SYS_FORK, [0; 6]);
        crate::task::sched::with_scheduler(|s| {
            while s.current_pid() != child as i32 {
                s.schedule().expect("child runnable");
            }
        });
        assert_eq!(dispatch(SYS_GETPID, [0; 6]), child);
        assert_eq!(dispatch(SYS_GETPPID, [0; 6]), 0);
    }

    #[test]
    fn pause_returns_eintr_once_signalled() {
        testutil::boot(900);
        // Pre-post the signal: on the host the pause loop cannot block.
        crate::process::with_current(|p| {
            p.signals.post(
                crate::signal::SIGUSR1,
                crate::signal::SigInfo::kernel(crate::signal::SIGUSR1),
            );
        })
        .unwrap();
        assert_eq!(sys_pause(), Err(Errno::Eintr));
        assert!(!crate::process::with_current(|p| p.paused).unwrap());
    }
}
