//! wait4 / waitpid
//!
//! Reaps terminated children: matches the pid/pgid selector, copies the
//! wait status and resource usage, folds the child's usage into the
//! caller's child-usage account, decrements the descendant counters up
//! the ancestor chain, and frees the child's task, address space, and
//! process slot.

use crate::error::{Errno, KResult};
use crate::mm::{frame, paging};
use crate::task::{sched, Pid};

use super::{with_process, with_table, Rusage};

/// waitpid option: return immediately when no child has exited.
pub const WNOHANG: i32 = 1;
/// waitpid option: also report stopped children (accepted, unused).
pub const WUNTRACED: i32 = 2;

/// Result of a successful wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitResult {
    pub pid: Pid,
    pub status: i32,
    pub rusage: Rusage,
}

/// Wait for a child matching `selector`:
/// - `-1`: any child,
/// - `0`: any child in the caller's process group,
/// - `> 0`: exactly that pid,
/// - `< -1`: any child in process group `-selector`.
///
/// Blocks until a matching child terminates unless WNOHANG is set, in
/// which case `Ok(None)` reports "nothing yet". ECHILD when the caller
/// has no children at all; EINTR when a deliverable signal arrives
/// while blocking.
pub fn wait4(selector: Pid, options: i32) -> KResult<Option<WaitResult>> {
    let me = sched::current_pid();
    if selector > 0 && !with_table(|t| t.is_live(selector))? {
        return Err(Errno::Esrch);
    }

    loop {
        if with_process(me, |p| p.children)? == 0 {
            return Err(Errno::Echild);
        }
        if let Some(found) = find_terminated_child(me, selector)? {
            return Ok(Some(reap(me, found)?));
        }
        if options & WNOHANG != 0 {
            return Ok(None);
        }
        // A deliverable signal interrupts the wait.
        let interrupted =
            with_process(me, |p| !p.signals.deliverable().is_empty())?;
        if interrupted {
            return Err(Errno::Eintr);
        }
        sched::relax();
    }
}

/// First terminated child of `me` matching the selector.
fn find_terminated_child(me: Pid, selector: Pid) -> KResult<Option<Pid>> {
    let my_pgid = with_process(me, |p| p.pgid)?;
    let candidates: alloc::vec::Vec<Pid> = sched::with_scheduler(|s| {
        s.live_pids()
            .into_iter()
            .filter(|&pid| pid != me && s.task(pid).map(|t| t.ppid) == Some(me))
            .collect()
    });

    with_table(|table| {
        for pid in candidates {
            let Ok(proc) = table.get(pid) else { continue };
            if !proc.terminated {
                continue;
            }
            let matches = match selector {
                -1 => true,
                0 => proc.pgid == my_pgid,
                s if s > 0 => pid == s,
                s => proc.pgid == -s,
            };
            if matches {
                return Some(pid);
            }
        }
        None
    })
    .map_err(|_| Errno::Esrch)
}

/// Collect the child's status and free everything it still owns.
fn reap(me: Pid, child: Pid) -> KResult<WaitResult> {
    let (status, child_usage, child_cusage) =
        with_process(child, |p| (p.wait_status, p.rusage, p.cusage))?;

    with_process(me, |p| {
        p.cusage.add(&child_usage);
        p.cusage.add(&child_cusage);
    })?;

    // One fewer descendant for every ancestor of the child.
    let mut cur = sched::with_scheduler(|s| s.task(child).map(|t| t.ppid)).unwrap_or(0);
    loop {
        let _ = with_process(cur, |p| p.children = p.children.saturating_sub(1));
        if cur == 0 {
            break;
        }
        cur = match sched::with_scheduler(|s| s.task(cur).map(|t| t.ppid)) {
            Some(ppid) => ppid,
            None => break,
        };
    }

    let dir = sched::with_scheduler(|s| s.task(child).map(|t| t.page_dir));
    sched::with_scheduler(|s| s.free(child));
    if let Some(dir) = dir {
        frame::with_allocator(|alloc| paging::destroy(alloc, dir));
    }
    with_table(|t| t.remove(child))?;

    Ok(WaitResult {
        pid: child,
        status,
        rusage: child_usage,
    })
}
