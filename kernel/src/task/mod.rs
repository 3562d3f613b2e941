//! Tasks and scheduling
//!
//! A task is the minimal schedulable unit: saved stack/instruction
//! state plus the owning page directory. Tasks live in an arena indexed
//! by pid and form a logical ring through `next` links; the scheduler
//! cursor is a pid, not a pointer.

pub mod sched;

pub use sched::{current_pid, with_scheduler, Scheduler};

use crate::mm::paging::PageDir;

/// Process identifier. Slot index into the task arena and process
/// table.
pub type Pid = i32;

/// Upper bound on concurrently existing tasks/processes.
pub const PROCESS_LIMIT: usize = 64;

/// Saved execution state of a suspended task.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskContext {
    pub esp: u32,
    pub ebp: u32,
    pub eip: u32,
}

/// Task life-cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable, waiting for the cursor.
    Ready,
    /// Currently executing.
    Running,
    /// Suspended by `pause`, `sigsuspend`, or a blocking read.
    Paused,
    /// Exited or killed; waiting to be reaped.
    Terminated,
}

/// One schedulable task.
#[derive(Debug)]
pub struct Task {
    pub pid: Pid,
    pub ppid: Pid,
    pub context: TaskContext,
    pub page_dir: PageDir,
    pub state: TaskState,
    /// Next pid in the scheduling ring.
    pub next: Option<Pid>,
}

/// Carry out a decided switch: load the target address space and hand
/// the saved context to the arch layer. On the host only the address
/// space handle moves (there is no real context to swap).
pub fn perform_switch(switch: sched::Switch) {
    crate::mm::paging::load(switch.to_page_dir);
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::arch::x86::context::switch_tasks(switch);
}
