//! Process model
//!
//! A process is the POSIX-visible object keyed by pid: descriptor
//! table, signal state, memory regions, working directory, program
//! break, credentials, resource usage, and interval timers. The
//! scheduler task with the same pid carries the execution state; a
//! process slot is live exactly when its task is.

pub mod exec;
pub mod exit;
pub mod fork;
pub mod memory;
pub mod wait;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Errno, KResult};
use crate::fs::perm::Cred;
use crate::fs::{Inode, OpenFile};
use crate::mm::region::RegionList;
use crate::signal::deliver::{triage, Disposition, SignalState};
use crate::signal::{self, SigInfo, SIGCHLD};
use crate::task::{sched, Pid, TaskState, PROCESS_LIMIT};

/// Per-process descriptor-table size.
pub const FD_LIMIT: usize = 256;

/// Interval timer slots.
pub const ITIMER_REAL: usize = 0;
pub const ITIMER_VIRTUAL: usize = 1;
pub const ITIMER_PROF: usize = 2;

/// One descriptor: the shared open file plus per-descriptor flags.
#[derive(Clone)]
pub struct Fd {
    pub file: Arc<OpenFile>,
    pub cloexec: bool,
}

/// Real, effective, and saved ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub euid: u32,
    pub suid: u32,
    pub gid: u32,
    pub egid: u32,
    pub sgid: u32,
}

impl Credentials {
    pub const fn root() -> Self {
        Self {
            uid: 0,
            euid: 0,
            suid: 0,
            gid: 0,
            egid: 0,
            sgid: 0,
        }
    }

    /// The credential view permission checks use.
    pub fn as_cred(&self) -> Cred {
        Cred {
            uid: self.uid,
            gid: self.gid,
            euid: self.euid,
            egid: self.egid,
        }
    }
}

/// Accumulated CPU time, in timer ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rusage {
    pub utime_ticks: u64,
    pub stime_ticks: u64,
}

impl Rusage {
    pub fn add(&mut self, other: &Rusage) {
        self.utime_ticks += other.utime_ticks;
        self.stime_ticks += other.stime_ticks;
    }
}

/// One interval timer, in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ITimer {
    /// Remaining time until expiry; 0 disarms.
    pub value_us: u64,
    /// Reload value on expiry; 0 makes the timer one-shot.
    pub interval_us: u64,
}

/// The process control block.
pub struct Process {
    pub files: Vec<Option<Fd>>,
    pub signals: SignalState,
    pub regions: RegionList,
    pub cwd: Option<Arc<Inode>>,
    pub cwd_path: String,
    /// Bottom of the break region (end of the loaded image).
    pub brk_start: u32,
    /// Current program break.
    pub brk: u32,
    pub creds: Credentials,
    pub pgid: Pid,
    pub sid: Pid,
    pub umask: u32,
    pub rusage: Rusage,
    /// Resource usage of reaped children.
    pub cusage: Rusage,
    pub itimers: [ITimer; 3],
    /// Set while suspended in `pause`/`sigsuspend`.
    pub paused: bool,
    /// Set by `exit` or a fatal signal; cleared when reaped.
    pub terminated: bool,
    pub wait_status: i32,
    /// Live descendants, maintained by `fork` and `wait`.
    pub children: u32,
}

impl Process {
    /// A fresh process (boot task or post-exec image).
    pub fn new(pid: Pid) -> Self {
        let mut files = Vec::with_capacity(FD_LIMIT);
        files.resize_with(FD_LIMIT, || None);
        Self {
            files,
            signals: SignalState::default(),
            regions: RegionList::new(),
            cwd: None,
            cwd_path: String::from("/"),
            brk_start: 0,
            brk: 0,
            creds: Credentials::root(),
            pgid: pid,
            sid: pid,
            umask: 0o022,
            rusage: Rusage::default(),
            cusage: Rusage::default(),
            itimers: [ITimer::default(); 3],
            paused: false,
            terminated: false,
            wait_status: 0,
            children: 0,
        }
    }

    /// The child image produced by `fork`: shares open files, copies
    /// the action table and blocked mask, clears pending signals and
    /// timers.
    pub fn fork_from(parent: &Process) -> Self {
        Self {
            files: parent.files.clone(),
            signals: SignalState {
                actions: parent.signals.actions,
                blocked: parent.signals.blocked,
                pending: signal::SigSet::empty(),
                info: None,
            },
            regions: parent.regions.clone(),
            cwd: parent.cwd.clone(),
            cwd_path: parent.cwd_path.clone(),
            brk_start: parent.brk_start,
            brk: parent.brk,
            creds: parent.creds,
            pgid: parent.pgid,
            sid: parent.sid,
            umask: parent.umask,
            rusage: Rusage::default(),
            cusage: Rusage::default(),
            itimers: [ITimer::default(); 3],
            paused: false,
            terminated: false,
            wait_status: 0,
            children: 0,
        }
    }

    /// Lowest free descriptor slot at or above `from`.
    pub fn free_fd(&self, from: usize) -> KResult<usize> {
        (from..FD_LIMIT)
            .find(|&fd| self.files[fd].is_none())
            .ok_or(Errno::Emfile)
    }

    /// The open file behind a descriptor.
    pub fn file(&self, fd: usize) -> KResult<Arc<OpenFile>> {
        self.files
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .map(|f| f.file.clone())
            .ok_or(Errno::Ebadf)
    }

    /// True when this process leads its session.
    pub fn is_session_leader(&self, pid: Pid) -> bool {
        self.sid == pid
    }
}

/// The fixed-size process table.
pub struct ProcessTable {
    slots: Vec<Option<Process>>,
}

impl ProcessTable {
    fn new() -> Self {
        let mut slots = Vec::with_capacity(PROCESS_LIMIT);
        slots.resize_with(PROCESS_LIMIT, || None);
        Self { slots }
    }

    pub fn get(&self, pid: Pid) -> KResult<&Process> {
        self.slots
            .get(pid as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Errno::Esrch)
    }

    pub fn get_mut(&mut self, pid: Pid) -> KResult<&mut Process> {
        self.slots
            .get_mut(pid as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Errno::Esrch)
    }

    pub fn insert(&mut self, pid: Pid, proc: Process) {
        self.slots[pid as usize] = Some(proc);
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Process> {
        self.slots.get_mut(pid as usize).and_then(|s| s.take())
    }

    pub fn is_live(&self, pid: Pid) -> bool {
        pid >= 0 && (pid as usize) < PROCESS_LIMIT && self.slots[pid as usize].is_some()
    }

    /// Live pids, ascending.
    pub fn live_pids(&self) -> Vec<Pid> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_some())
            .map(|(i, _)| i as Pid)
            .collect()
    }
}

#[cfg(target_os = "none")]
mod global {
    use spin::Mutex;

    use super::ProcessTable;

    static TABLE: Mutex<Option<ProcessTable>> = Mutex::new(None);

    pub fn set(table: ProcessTable) {
        *TABLE.lock() = Some(table);
    }

    pub fn is_initialized() -> bool {
        TABLE.lock().is_some()
    }

    pub fn with<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> Option<R> {
        TABLE.lock().as_mut().map(f)
    }
}

#[cfg(not(target_os = "none"))]
mod global {
    use std::cell::RefCell;

    use super::ProcessTable;

    std::thread_local! {
        static TABLE: RefCell<Option<ProcessTable>> = const { RefCell::new(None) };
    }

    pub fn set(table: ProcessTable) {
        TABLE.with(|t| *t.borrow_mut() = Some(table));
    }

    pub fn is_initialized() -> bool {
        TABLE.with(|t| t.borrow().is_some())
    }

    pub fn with<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> Option<R> {
        TABLE.with(|t| t.borrow_mut().as_mut().map(f))
    }
}

/// Create the process table with the bootstrap process (pid 0), which
/// never exits.
pub fn init() {
    let mut table = ProcessTable::new();
    table.insert(0, Process::new(0));
    global::set(table);
}

/// Run `f` against the process table. ESRCH before [`init`].
pub fn with_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> KResult<R> {
    global::with(f).ok_or(Errno::Esrch)
}

/// Run `f` on the current process.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> KResult<R> {
    let pid = sched::current_pid();
    with_process(pid, f)
}

/// Run `f` on the process `pid`.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> KResult<R> {
    with_table(|table| table.get_mut(pid).map(f))?
}

/// Credentials of the current process (root before init, for the boot
/// path).
pub fn current_cred() -> Cred {
    with_current(|p| p.creds.as_cred()).unwrap_or(Cred::root())
}

/// Current working directory path of the calling process.
pub fn current_cwd() -> String {
    with_current(|p| p.cwd_path.clone()).unwrap_or_else(|_| String::from("/"))
}

/// Signals whose default action is immediate termination even through
/// `kill` (hardware-fault class).
fn is_fault_signal(sig: i32) -> bool {
    matches!(
        sig,
        signal::SIGFPE
            | signal::SIGILL
            | signal::SIGSEGV
            | signal::SIGBUS
            | signal::SIGABRT
            | signal::SIGTRAP
            | signal::SIGSYS
    )
}

/// Deliver `sig` to process `pid` (`kill`).
///
/// SIGKILL, and fault-class signals left at their default disposition,
/// terminate the target immediately. Anything else is marked pending
/// and the target is woken if it was paused; the actual delivery
/// happens at the target's next return to user mode.
pub fn send_signal(pid: Pid, sig: i32) -> KResult<()> {
    if sig == 0 {
        // Permission probe only.
        return with_table(|t| t.get(pid).map(|_| ()))?;
    }
    let sig = signal::check_signal(sig)?;
    let sender = sched::current_pid();
    let sender_uid = current_cred().uid;

    let force = with_table(|table| -> KResult<bool> {
        let proc = table.get_mut(pid)?;
        let action = proc.signals.actions[sig as usize];
        let force = sig == signal::SIGKILL
            || (is_fault_signal(sig) && action.handler == signal::SigHandler::Default);
        if force {
            proc.terminated = true;
            proc.wait_status = sig;
            proc.paused = false;
        } else {
            proc.signals.post(sig, SigInfo::user(sig, sender, sender_uid));
            proc.paused = false;
        }
        Ok(force)
    })??;

    sched::with_scheduler(|s| {
        if force {
            if let Some(task) = s.task_mut(pid) {
                task.state = TaskState::Terminated;
            }
        } else {
            s.wake(pid);
        }
    });
    Ok(())
}

/// Send `sig` to every member of process group `pgid`. Returns the
/// number of processes signalled.
pub fn send_signal_group(pgid: Pid, sig: i32) -> KResult<usize> {
    let members: Vec<Pid> = with_table(|table| {
        table
            .live_pids()
            .into_iter()
            .filter(|&pid| table.get(pid).map(|p| p.pgid == pgid).unwrap_or(false))
            .collect()
    })?;
    if members.is_empty() {
        return Err(Errno::Esrch);
    }
    for pid in &members {
        send_signal(*pid, sig)?;
    }
    Ok(members.len())
}

/// Post a signal to the current process, ignoring failures (used from
/// paths such as pipe writes that must not themselves fail on a missing
/// process table).
pub fn raise_current(sig: i32) {
    let pid = sched::current_pid();
    let _ = send_signal(pid, sig);
}

/// The per-return-to-user delivery point: triage pending signals and
/// apply state transitions for terminate/stop/continue outcomes. A
/// `Handler` outcome is returned for the arch layer to build the user
/// frame.
pub fn deliver_signals(pid: Pid) -> Disposition {
    let disposition = match with_process(pid, |proc| triage(&mut proc.signals)) {
        Ok(d) => d,
        Err(_) => return Disposition::None,
    };
    match disposition {
        Disposition::Terminate { status } => {
            let _ = with_process(pid, |proc| {
                proc.terminated = true;
                proc.wait_status = status;
            });
            sched::with_scheduler(|s| {
                if let Some(task) = s.task_mut(pid) {
                    task.state = TaskState::Terminated;
                }
            });
            notify_parent(pid);
        }
        Disposition::Stop => {
            let _ = with_process(pid, |proc| proc.paused = true);
            sched::with_scheduler(|s| {
                if let Some(task) = s.task_mut(pid) {
                    task.state = TaskState::Paused;
                }
            });
        }
        Disposition::Continue => {
            let _ = with_process(pid, |proc| proc.paused = false);
            sched::with_scheduler(|s| s.wake(pid));
        }
        _ => {}
    }
    disposition
}

/// Queue SIGCHLD to the parent of `pid` and wake it if it is blocked in
/// `wait`.
pub fn notify_parent(pid: Pid) {
    let ppid = sched::with_scheduler(|s| s.task(pid).map(|t| t.ppid));
    if let Some(ppid) = ppid {
        let _ = with_process(ppid, |parent| {
            parent
                .signals
                .post(SIGCHLD, SigInfo::kernel(SIGCHLD));
            parent.paused = false;
        });
        sched::with_scheduler(|s| s.wake(ppid));
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::mm::frame::FrameAllocator;
    use crate::mm::paging;
    use crate::mm::PAGE_SIZE;

    /// Bring up phys + paging + scheduler + process table on this test
    /// thread and return the allocator the page tables came from.
    pub fn boot(frames: usize) -> FrameAllocator {
        // Tests may share a thread (--test-threads=1): drop any mounts
        // a previous test left behind before resetting the RAM model.
        crate::fs::unmount_all();
        crate::mm::phys::init(0);
        let storage =
            alloc::boxed::Box::leak(alloc::vec![0u32; frames].into_boxed_slice());
        let base = 0x0100_0000u32;
        let mut alloc =
            FrameAllocator::new(base, base + (frames * PAGE_SIZE) as u32, storage);
        let boot_dir = paging::init(&mut alloc).unwrap();
        crate::task::sched::init(boot_dir);
        super::init();
        alloc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_starts_with_pid_zero() {
        testutil::boot(400);
        assert!(with_table(|t| t.is_live(0)).unwrap());
        assert!(!with_table(|t| t.is_live(5)).unwrap());
    }

    #[test]
    fn fd_slots_allocate_lowest_first() {
        testutil::boot(400);
        with_current(|p| {
            assert_eq!(p.free_fd(0).unwrap(), 0);
            let (r, _w) = crate::fs::pipe::create_pipe(0, 0).unwrap();
            p.files[0] = Some(Fd {
                file: r,
                cloexec: false,
            });
            assert_eq!(p.free_fd(0).unwrap(), 1);
            assert_eq!(p.free_fd(1).unwrap(), 1);
        })
        .unwrap();
    }

    #[test]
    fn kill_posts_pending_and_wakes() {
        let mut alloc = testutil::boot(500);
        let dir = crate::mm::paging::new_directory(&mut alloc).unwrap();
        let child = sched::with_scheduler(|s| s.spawn(0, dir, 0)).unwrap();
        with_table(|t| t.insert(child, Process::new(child))).unwrap();
        sched::with_scheduler(|s| s.task_mut(child).unwrap().state = TaskState::Paused);

        send_signal(child, signal::SIGUSR1).unwrap();
        assert!(with_process(child, |p| p.signals.pending.contains(signal::SIGUSR1)).unwrap());
        assert_eq!(
            sched::with_scheduler(|s| s.task(child).unwrap().state),
            TaskState::Ready
        );
    }

    #[test]
    fn sigkill_terminates_immediately() {
        let mut alloc = testutil::boot(500);
        let dir = crate::mm::paging::new_directory(&mut alloc).unwrap();
        let child = sched::with_scheduler(|s| s.spawn(0, dir, 0)).unwrap();
        with_table(|t| t.insert(child, Process::new(child))).unwrap();

        send_signal(child, signal::SIGKILL).unwrap();
        let (term, status) =
            with_process(child, |p| (p.terminated, p.wait_status)).unwrap();
        assert!(term);
        assert_eq!(status, signal::SIGKILL);
        assert_eq!(
            sched::with_scheduler(|s| s.task(child).unwrap().state),
            TaskState::Terminated
        );
    }

    #[test]
    fn kill_missing_process_is_esrch() {
        testutil::boot(400);
        assert_eq!(send_signal(42, signal::SIGTERM), Err(Errno::Esrch));
    }

    #[test]
    fn delivery_terminates_on_default_action() {
        let mut alloc = testutil::boot(500);
        let dir = crate::mm::paging::new_directory(&mut alloc).unwrap();
        let child = sched::with_scheduler(|s| s.spawn(0, dir, 0)).unwrap();
        with_table(|t| t.insert(child, Process::new(child))).unwrap();

        send_signal(child, signal::SIGTERM).unwrap();
        match deliver_signals(child) {
            Disposition::Terminate { status } => assert_eq!(status, signal::SIGTERM),
            other => panic!("expected terminate, got {:?}", other),
        }
        assert!(with_process(child, |p| p.terminated).unwrap());
    }

    #[test]
    fn group_signal_reaches_all_members() {
        let mut alloc = testutil::boot(500);
        let mut pids = Vec::new();
        for _ in 0..3 {
            let dir = crate::mm::paging::new_directory(&mut alloc).unwrap();
            let pid = sched::with_scheduler(|s| s.spawn(0, dir, 0)).unwrap();
            let mut proc = Process::new(pid);
            proc.pgid = 7;
            with_table(|t| t.insert(pid, proc)).unwrap();
            pids.push(pid);
        }
        assert_eq!(send_signal_group(7, signal::SIGUSR2).unwrap(), 3);
        for pid in pids {
            assert!(
                with_process(pid, |p| p.signals.pending.contains(signal::SIGUSR2)).unwrap()
            );
        }
    }
}
