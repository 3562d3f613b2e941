//! Signal sets, actions, and numbers
//!
//! Classic Linux i386 signal numbers 1-31 plus realtime signals up to
//! [`NSIG`]. A [`SigSet`] is a bitmap with bit `n` meaning signal
//! number `n`; pending and blocked masks are sigsets on the process.
//! SIGKILL and SIGSTOP can never be caught, blocked, or ignored.

pub mod deliver;

use crate::error::{Errno, KResult};
use crate::task::Pid;

pub const SIGHUP: i32 = 1;
pub const SIGINT: i32 = 2;
pub const SIGQUIT: i32 = 3;
pub const SIGILL: i32 = 4;
pub const SIGTRAP: i32 = 5;
pub const SIGABRT: i32 = 6;
pub const SIGBUS: i32 = 7;
pub const SIGFPE: i32 = 8;
pub const SIGKILL: i32 = 9;
pub const SIGUSR1: i32 = 10;
pub const SIGSEGV: i32 = 11;
pub const SIGUSR2: i32 = 12;
pub const SIGPIPE: i32 = 13;
pub const SIGALRM: i32 = 14;
pub const SIGTERM: i32 = 15;
pub const SIGSTKFLT: i32 = 16;
pub const SIGCHLD: i32 = 17;
pub const SIGCONT: i32 = 18;
pub const SIGSTOP: i32 = 19;
pub const SIGTSTP: i32 = 20;
pub const SIGTTIN: i32 = 21;
pub const SIGTTOU: i32 = 22;
pub const SIGURG: i32 = 23;
pub const SIGXCPU: i32 = 24;
pub const SIGXFSZ: i32 = 25;
pub const SIGVTALRM: i32 = 26;
pub const SIGPROF: i32 = 27;
pub const SIGWINCH: i32 = 28;
pub const SIGIO: i32 = 29;
pub const SIGPWR: i32 = 30;
pub const SIGSYS: i32 = 31;

/// First realtime signal.
pub const SIGRTMIN: i32 = 32;
/// Number of signal slots per process.
pub const NSIG: usize = 48;

// sigprocmask how values
pub const SIG_BLOCK: i32 = 0;
pub const SIG_UNBLOCK: i32 = 1;
pub const SIG_SETMASK: i32 = 2;

// sigaction flags (subset honored at delivery)
pub const SA_NOCLDSTOP: u32 = 0x0000_0001;
pub const SA_SIGINFO: u32 = 0x0000_0004;
pub const SA_RESTART: u32 = 0x1000_0000;
pub const SA_NODEFER: u32 = 0x4000_0000;
pub const SA_RESETHAND: u32 = 0x8000_0000;

/// A set of signals as a bitmap (bit n = signal n).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigSet(pub u64);

impl SigSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn full() -> Self {
        Self(!0)
    }

    pub fn add(&mut self, sig: i32) {
        if (1..NSIG as i32).contains(&sig) {
            self.0 |= 1 << sig;
        }
    }

    pub fn remove(&mut self, sig: i32) {
        self.0 &= !(1u64 << sig);
    }

    pub fn contains(&self, sig: i32) -> bool {
        (1..NSIG as i32).contains(&sig) && self.0 & (1 << sig) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Lowest numbered signal in the set, if any.
    pub fn lowest(&self) -> Option<i32> {
        if self.0 == 0 {
            None
        } else {
            Some(self.0.trailing_zeros() as i32)
        }
    }

    /// Strip SIGKILL and SIGSTOP, which cannot be masked.
    pub fn sanitized(mut self) -> Self {
        self.remove(SIGKILL);
        self.remove(SIGSTOP);
        self
    }
}

/// The disposition of one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigHandler {
    /// SIG_DFL
    #[default]
    Default,
    /// SIG_IGN
    Ignore,
    /// User handler entry point.
    Handler(u32),
}

/// One slot of the per-process action table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigAction {
    pub handler: SigHandler,
    pub mask: SigSet,
    pub flags: u32,
}

/// What the kernel does when a signal with SIG_DFL is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

/// Default disposition table.
pub fn default_action(sig: i32) -> DefaultAction {
    match sig {
        SIGCHLD | SIGURG | SIGWINCH | SIGIO | SIGPWR => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        _ => DefaultAction::Terminate,
    }
}

/// Why a signal was generated, as reported through `siginfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub code: i32,
    pub pid: Pid,
    pub uid: u32,
    pub addr: u32,
}

/// si_code: sent by `kill`.
pub const SI_USER: i32 = 0x100;
/// si_code: sent by the kernel.
pub const SI_KERNEL: i32 = 0x101;
/// si_code: sent by a timer expiry.
pub const SI_TIMER: i32 = 0x103;

impl SigInfo {
    pub fn user(signo: i32, pid: Pid, uid: u32) -> Self {
        Self {
            signo,
            code: SI_USER,
            pid,
            uid,
            addr: 0,
        }
    }

    pub fn kernel(signo: i32) -> Self {
        Self {
            signo,
            code: SI_KERNEL,
            pid: 0,
            uid: 0,
            addr: 0,
        }
    }
}

/// Validate a signal number from user space.
pub fn check_signal(sig: i32) -> KResult<i32> {
    if (1..NSIG as i32).contains(&sig) {
        Ok(sig)
    } else {
        Err(Errno::Einval)
    }
}

/// True for the signals whose disposition may never change.
pub fn is_unblockable(sig: i32) -> bool {
    sig == SIGKILL || sig == SIGSTOP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigset_bit_operations() {
        let mut set = SigSet::empty();
        set.add(SIGINT);
        set.add(SIGTERM);
        assert!(set.contains(SIGINT));
        assert!(!set.contains(SIGHUP));
        set.remove(SIGINT);
        assert!(!set.contains(SIGINT));
        assert!(set.contains(SIGTERM));
    }

    #[test]
    fn lowest_picks_smallest_number() {
        let mut set = SigSet::empty();
        set.add(SIGTERM);
        set.add(SIGINT);
        assert_eq!(set.lowest(), Some(SIGINT));
        assert_eq!(SigSet::empty().lowest(), None);
    }

    #[test]
    fn sanitize_strips_kill_and_stop() {
        let set = SigSet::full().sanitized();
        assert!(!set.contains(SIGKILL));
        assert!(!set.contains(SIGSTOP));
        assert!(set.contains(SIGINT));
    }

    #[test]
    fn default_dispositions() {
        assert_eq!(default_action(SIGCHLD), DefaultAction::Ignore);
        assert_eq!(default_action(SIGSTOP), DefaultAction::Stop);
        assert_eq!(default_action(SIGCONT), DefaultAction::Continue);
        assert_eq!(default_action(SIGUSR1), DefaultAction::Terminate);
        assert_eq!(default_action(SIGRTMIN), DefaultAction::Terminate);
    }

    #[test]
    fn signal_validation() {
        assert!(check_signal(SIGHUP).is_ok());
        assert!(check_signal(NSIG as i32 - 1).is_ok());
        assert_eq!(check_signal(0), Err(Errno::Einval));
        assert_eq!(check_signal(NSIG as i32), Err(Errno::Einval));
        assert_eq!(check_signal(-3), Err(Errno::Einval));
    }
}
