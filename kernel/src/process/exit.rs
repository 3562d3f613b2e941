//! exit
//!
//! Sets the termination flag with the encoded wait status, closes every
//! descriptor, marks the task terminated, and queues SIGCHLD to the
//! parent. The process slot and address space stay around until the
//! parent reaps them with `wait4`; pid 0 is the kernel's bootstrap task
//! and never exits.

use crate::error::KResult;
use crate::task::{sched, Pid, TaskState};

use super::{notify_parent, with_process};

/// Terminate the calling process with `code`. The wait status seen by
/// the parent is `(code & 0xff) << 8`.
pub fn exit(code: i32) -> KResult<Pid> {
    let pid = sched::current_pid();
    debug_assert!(pid != 0, "pid 0 cannot exit");

    with_process(pid, |proc| {
        proc.terminated = true;
        proc.wait_status = (code & 0xff) << 8;
        proc.paused = false;
        // Closing the descriptors drops the open-file references now;
        // a shared pipe end closes when the last sharer goes.
        for slot in proc.files.iter_mut() {
            *slot = None;
        }
    })?;

    sched::with_scheduler(|s| {
        if let Some(task) = s.task_mut(pid) {
            task.state = TaskState::Terminated;
        }
    });
    notify_parent(pid);
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::super::{fork::fork, testutil, with_process};
    use super::*;
    use crate::signal::SIGCHLD;

    fn run_as(pid: Pid) {
        sched::with_scheduler(|s| {
            while s.current_pid() != pid {
                s.schedule().expect("target task must be runnable");
            }
        });
    }

    #[test]
    fn exit_encodes_wait_status() {
        testutil::boot(800);
        let child = fork().unwrap();
        run_as(child);
        exit(7).unwrap();
        let status = with_process(child, |p| p.wait_status).unwrap();
        assert_eq!(status, 7 << 8);
        // Truncation to one byte.
        run_as(0);
        let child2 = fork().unwrap();
        run_as(child2);
        exit(0x1ff).unwrap();
        assert_eq!(
            with_process(child2, |p| p.wait_status).unwrap(),
            0xff << 8
        );
    }

    #[test]
    fn exit_closes_descriptors_and_signals_parent() {
        testutil::boot(800);
        let (r, w) = crate::fs::pipe::create_pipe(0, 0).unwrap();
        let child = fork().unwrap();
        // Give only the child the write end, keep the read end here.
        with_process(child, |p| {
            p.files[5] = Some(super::super::Fd {
                file: w.clone(),
                cloexec: false,
            });
        })
        .unwrap();
        drop(w);

        run_as(child);
        exit(0).unwrap();

        // Write end died with the child: EOF on the read side.
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        // Parent got SIGCHLD.
        assert!(
            with_process(0, |p| p.signals.pending.contains(SIGCHLD)).unwrap()
        );
    }

    #[test]
    fn exited_task_is_terminated_not_freed() {
        testutil::boot(800);
        let child = fork().unwrap();
        run_as(child);
        exit(1).unwrap();
        assert_eq!(
            sched::with_scheduler(|s| s.task(child).unwrap().state),
            crate::task::TaskState::Terminated
        );
        assert!(super::super::with_table(|t| t.is_live(child)).unwrap());
    }
}
