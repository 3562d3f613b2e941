//! Round-robin scheduler
//!
//! Single CPU, cooperative with timer preemption. The arena owns every
//! task; the ring threads runnable candidates through `next` links and
//! the cursor names the running task. Switches happen only at the
//! well-defined points (timer tick return, syscall return, explicit
//! yield), and the context save/restore itself is an arch hook.

use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::mm::paging::PageDir;

use super::{Pid, Task, TaskContext, TaskState, PROCESS_LIMIT};

/// A decided context switch, handed to the arch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Switch {
    pub from: Pid,
    pub to: Pid,
    pub to_page_dir: PageDir,
}

/// Scheduler state: task arena plus ring cursor.
pub struct Scheduler {
    tasks: Vec<Option<Task>>,
    current: Pid,
    /// Nonzero while preemption is disabled (critical sections).
    no_preempt: u32,
}

impl Scheduler {
    /// Create the scheduler with the bootstrap task (pid 0) running on
    /// the given page directory. Pid 0 never exits.
    pub fn new(boot_dir: PageDir) -> Self {
        let mut tasks: Vec<Option<Task>> = (0..PROCESS_LIMIT).map(|_| None).collect();
        tasks[0] = Some(Task {
            pid: 0,
            ppid: 0,
            context: TaskContext::default(),
            page_dir: boot_dir,
            state: TaskState::Running,
            next: Some(0),
        });
        Self {
            tasks,
            current: 0,
            no_preempt: 0,
        }
    }

    pub fn current_pid(&self) -> Pid {
        self.current
    }

    /// Borrow a task by pid.
    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(pid as usize).and_then(|t| t.as_ref())
    }

    /// Mutably borrow a task by pid.
    pub fn task_mut(&mut self, pid: Pid) -> Option<&mut Task> {
        self.tasks.get_mut(pid as usize).and_then(|t| t.as_mut())
    }

    /// True when the pid names a live task.
    pub fn is_live(&self, pid: Pid) -> bool {
        pid >= 0 && self.task(pid).is_some()
    }

    /// Create a task with the given parent, page directory, and entry
    /// point, linked into the ring right after the current task.
    pub fn spawn(&mut self, ppid: Pid, page_dir: PageDir, entry_eip: u32) -> KResult<Pid> {
        let pid = self
            .tasks
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, slot)| slot.is_none())
            .map(|(i, _)| i as Pid)
            .ok_or(Errno::Eagain)?;

        let after = self
            .task(self.current)
            .and_then(|t| t.next)
            .unwrap_or(self.current);
        self.tasks[pid as usize] = Some(Task {
            pid,
            ppid,
            context: TaskContext {
                eip: entry_eip,
                ..TaskContext::default()
            },
            page_dir,
            state: TaskState::Ready,
            next: Some(after),
        });
        if let Some(cur) = self.task_mut(self.current) {
            cur.next = Some(pid);
        }
        Ok(pid)
    }

    /// Unlink a task from the ring and drop it from the arena. The page
    /// directory is the caller's to free. Pid 0 cannot be freed.
    pub fn free(&mut self, pid: Pid) {
        if pid == 0 || !self.is_live(pid) {
            return;
        }
        // Find the ring predecessor.
        let mut prev = pid;
        loop {
            let next = self.task(prev).and_then(|t| t.next).unwrap_or(pid);
            if next == pid {
                break;
            }
            prev = next;
        }
        let successor = self.task(pid).and_then(|t| t.next);
        if let Some(p) = self.task_mut(prev) {
            p.next = if successor == Some(pid) { Some(prev) } else { successor };
        }
        self.tasks[pid as usize] = None;
        if self.current == pid {
            self.current = prev;
        }
    }

    /// Disable preemption (nestable).
    pub fn preempt_disable(&mut self) {
        self.no_preempt += 1;
    }

    /// Re-enable preemption.
    pub fn preempt_enable(&mut self) {
        debug_assert!(self.no_preempt > 0);
        self.no_preempt -= 1;
    }

    /// Pick the next runnable task, advancing the cursor round-robin.
    /// Returns the switch to perform, or `None` when the current task
    /// keeps the CPU (no other candidate, or preemption disabled).
    pub fn schedule(&mut self) -> Option<Switch> {
        if self.no_preempt > 0 {
            return None;
        }
        let from = self.current;
        let mut candidate = self.task(from).and_then(|t| t.next)?;
        loop {
            if candidate != from {
                if let Some(t) = self.task(candidate) {
                    if matches!(t.state, TaskState::Ready) {
                        break;
                    }
                }
            }
            if candidate == from {
                return None;
            }
            candidate = self.task(candidate).and_then(|t| t.next)?;
        }

        if let Some(old) = self.task_mut(from) {
            if old.state == TaskState::Running {
                old.state = TaskState::Ready;
            }
        }
        let to_dir = {
            let new = self.task_mut(candidate)?;
            new.state = TaskState::Running;
            new.page_dir
        };
        self.current = candidate;
        Some(Switch {
            from,
            to: candidate,
            to_page_dir: to_dir,
        })
    }

    /// Voluntarily give up the CPU.
    pub fn yield_now(&mut self) -> Option<Switch> {
        self.schedule()
    }

    /// Mark a paused task runnable again (signal wakeup).
    pub fn wake(&mut self, pid: Pid) {
        if let Some(t) = self.task_mut(pid) {
            if t.state == TaskState::Paused {
                t.state = TaskState::Ready;
            }
        }
    }

    /// Pids of live tasks, in arena order.
    pub fn live_pids(&self) -> Vec<Pid> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_some())
            .map(|(i, _)| i as Pid)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Global scheduler instance
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod global {
    use spin::Mutex;

    use super::Scheduler;

    static SCHEDULER: Mutex<Option<Scheduler>> = Mutex::new(None);

    pub fn set(sched: Scheduler) {
        *SCHEDULER.lock() = Some(sched);
    }

    pub fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
        let mut guard = SCHEDULER.lock();
        f(guard.as_mut().expect("scheduler not initialized"))
    }

    pub fn is_initialized() -> bool {
        SCHEDULER.lock().is_some()
    }
}

#[cfg(not(target_os = "none"))]
mod global {
    use std::cell::RefCell;

    use super::Scheduler;

    std::thread_local! {
        static SCHEDULER: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
    }

    pub fn set(sched: Scheduler) {
        SCHEDULER.with(|s| *s.borrow_mut() = Some(sched));
    }

    pub fn with<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
        SCHEDULER.with(|s| {
            f(s.borrow_mut()
                .as_mut()
                .expect("scheduler not initialized"))
        })
    }

    pub fn is_initialized() -> bool {
        SCHEDULER.with(|s| s.borrow().is_some())
    }
}

/// Install the global scheduler (boot, or per-test setup).
pub fn init(boot_dir: PageDir) {
    global::set(Scheduler::new(boot_dir));
}

/// Run `f` against the global scheduler.
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    global::with(f)
}

/// Pid of the running task; 0 before the scheduler exists (boot path).
pub fn current_pid() -> Pid {
    if global::is_initialized() {
        global::with(|s| s.current_pid())
    } else {
        0
    }
}

/// Give up the CPU inside a wait loop. Falls back to a spin hint when
/// the scheduler is not up (boot, host unit tests).
pub fn relax() {
    if global::is_initialized() {
        if let Some(switch) = global::with(|s| s.yield_now()) {
            crate::task::perform_switch(switch);
            return;
        }
    }
    core::hint::spin_loop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PhysAddr;

    fn dir(n: u32) -> PageDir {
        PageDir(PhysAddr::new(n * 0x1000))
    }

    #[test]
    fn bootstrap_task_is_running() {
        let sched = Scheduler::new(dir(1));
        assert_eq!(sched.current_pid(), 0);
        assert_eq!(sched.task(0).unwrap().state, TaskState::Running);
    }

    #[test]
    fn round_robin_cycles_through_ready_tasks() {
        let mut sched = Scheduler::new(dir(1));
        let a = sched.spawn(0, dir(2), 0x1000).unwrap();
        let b = sched.spawn(0, dir(3), 0x2000).unwrap();

        let s1 = sched.schedule().unwrap();
        let s2 = sched.schedule().unwrap();
        let s3 = sched.schedule().unwrap();
        // Every live task gets the CPU once per revolution.
        let mut seen = alloc::vec![s1.to, s2.to, s3.to];
        seen.sort_unstable();
        assert_eq!(seen, alloc::vec![0, a, b]);
    }

    #[test]
    fn paused_tasks_are_skipped_until_woken() {
        let mut sched = Scheduler::new(dir(1));
        let a = sched.spawn(0, dir(2), 0).unwrap();
        sched.task_mut(a).unwrap().state = TaskState::Paused;
        assert!(sched.schedule().is_none(), "only pid 0 is runnable");
        sched.wake(a);
        assert_eq!(sched.schedule().unwrap().to, a);
    }

    #[test]
    fn preemption_guard_blocks_switches() {
        let mut sched = Scheduler::new(dir(1));
        sched.spawn(0, dir(2), 0).unwrap();
        sched.preempt_disable();
        assert!(sched.schedule().is_none());
        sched.preempt_enable();
        assert!(sched.schedule().is_some());
    }

    #[test]
    fn free_unlinks_from_ring() {
        let mut sched = Scheduler::new(dir(1));
        let a = sched.spawn(0, dir(2), 0).unwrap();
        let b = sched.spawn(0, dir(3), 0).unwrap();
        sched.free(a);
        assert!(!sched.is_live(a));
        // Ring still reaches b and wraps to 0.
        let s = sched.schedule().unwrap();
        assert_eq!(s.to, b);
        let s = sched.schedule().unwrap();
        assert_eq!(s.to, 0);
    }

    #[test]
    fn pid_slots_are_reused() {
        let mut sched = Scheduler::new(dir(1));
        let a = sched.spawn(0, dir(2), 0).unwrap();
        sched.free(a);
        let b = sched.spawn(0, dir(3), 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn spawn_fails_when_arena_full() {
        let mut sched = Scheduler::new(dir(1));
        for _ in 1..PROCESS_LIMIT {
            sched.spawn(0, dir(9), 0).unwrap();
        }
        assert_eq!(sched.spawn(0, dir(9), 0).unwrap_err(), Errno::Eagain);
    }

    #[test]
    fn terminated_tasks_never_get_the_cpu() {
        let mut sched = Scheduler::new(dir(1));
        let a = sched.spawn(0, dir(2), 0).unwrap();
        let b = sched.spawn(0, dir(3), 0).unwrap();
        sched.task_mut(a).unwrap().state = TaskState::Terminated;
        for _ in 0..4 {
            if let Some(s) = sched.schedule() {
                assert_ne!(s.to, a);
            }
        }
        let _ = b;
    }
}
