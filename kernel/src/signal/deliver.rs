//! Signal delivery
//!
//! The per-process signal state and the triage performed at every
//! return to user mode: compute `deliverable = pending & !blocked`,
//! take the lowest numbered signal, and decide between the default
//! action, discarding, and running a user handler. The actual handler
//! frame and trampoline are built by the arch layer from the
//! [`Disposition`] returned here.

use super::{
    default_action, DefaultAction, SigAction, SigHandler, SigInfo, SigSet, NSIG, SA_NODEFER,
    SA_RESETHAND, SIGKILL,
};

/// Per-process signal state embedded in the process slot.
#[derive(Debug, Clone)]
pub struct SignalState {
    pub actions: [SigAction; NSIG],
    pub blocked: SigSet,
    pub pending: SigSet,
    /// Info for the most recently posted signal.
    pub info: Option<SigInfo>,
}

impl Default for SignalState {
    fn default() -> Self {
        Self {
            actions: [SigAction::default(); NSIG],
            blocked: SigSet::empty(),
            pending: SigSet::empty(),
            info: None,
        }
    }
}

impl SignalState {
    /// Record `sig` as pending.
    pub fn post(&mut self, sig: i32, info: SigInfo) {
        self.pending.add(sig);
        self.info = Some(info);
    }

    /// Signals that may be delivered right now.
    pub fn deliverable(&self) -> SigSet {
        SigSet(self.pending.0 & !self.blocked.sanitized().0)
    }

    /// Reset every caught handler to the default disposition (`execve`).
    pub fn reset_handlers(&mut self) {
        for action in self.actions.iter_mut() {
            if matches!(action.handler, SigHandler::Handler(_)) {
                *action = SigAction::default();
            }
        }
    }
}

/// Outcome of one delivery pass, applied by the return-to-user path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing deliverable; resume the interrupted context.
    None,
    /// Process must terminate with the given wait status.
    Terminate { status: i32 },
    /// Process enters the stopped state.
    Stop,
    /// A paused/stopped process resumes.
    Continue,
    /// Jump to a user handler with a trampoline frame.
    Handler {
        entry: u32,
        sig: i32,
        flags: u32,
        /// Mask to restore when the handler returns.
        old_mask: SigSet,
        /// Present when the action requested SA_SIGINFO.
        info: Option<SigInfo>,
    },
}

/// Deliver the lowest pending unblocked signal, if any.
///
/// Ignored signals are consumed in the same pass, so a single call
/// settles everything deliverable right now. SIGKILL always terminates,
/// regardless of the action table.
pub fn triage(state: &mut SignalState) -> Disposition {
    loop {
        let sig = match state.deliverable().lowest() {
            Some(sig) => sig,
            None => return Disposition::None,
        };
        state.pending.remove(sig);

        if sig == SIGKILL {
            return Disposition::Terminate { status: sig };
        }

        let action = state.actions[sig as usize];
        match action.handler {
            SigHandler::Ignore => continue,
            SigHandler::Default => match default_action(sig) {
                DefaultAction::Ignore => continue,
                DefaultAction::Terminate => {
                    return Disposition::Terminate { status: sig };
                }
                DefaultAction::Stop => return Disposition::Stop,
                DefaultAction::Continue => return Disposition::Continue,
            },
            SigHandler::Handler(entry) => {
                let old_mask = state.blocked;
                let mut new_mask = SigSet(state.blocked.0 | action.mask.0);
                if action.flags & SA_NODEFER == 0 {
                    new_mask.add(sig);
                }
                state.blocked = new_mask.sanitized();
                if action.flags & SA_RESETHAND != 0 {
                    state.actions[sig as usize] = SigAction::default();
                }
                let info = if action.flags & super::SA_SIGINFO != 0 {
                    state.info
                } else {
                    None
                };
                return Disposition::Handler {
                    entry,
                    sig,
                    flags: action.flags,
                    old_mask,
                    info,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{SIGCHLD, SIGINT, SIGSTOP, SIGTERM, SIGUSR1, SA_SIGINFO};
    use super::*;

    #[test]
    fn blocked_signal_stays_pending() {
        let mut state = SignalState::default();
        state.blocked.add(SIGINT);
        state.post(SIGINT, SigInfo::user(SIGINT, 1, 0));
        assert_eq!(triage(&mut state), Disposition::None);
        assert!(state.pending.contains(SIGINT));

        // Unblocking delivers it exactly once.
        state.blocked.remove(SIGINT);
        state.actions[SIGINT as usize].handler = SigHandler::Handler(0x1000);
        match triage(&mut state) {
            Disposition::Handler { entry, sig, .. } => {
                assert_eq!(entry, 0x1000);
                assert_eq!(sig, SIGINT);
            }
            other => panic!("expected handler, got {:?}", other),
        }
        assert_eq!(triage(&mut state), Disposition::None);
    }

    #[test]
    fn default_terminate_reports_signal_status() {
        let mut state = SignalState::default();
        state.post(SIGTERM, SigInfo::kernel(SIGTERM));
        assert_eq!(
            triage(&mut state),
            Disposition::Terminate { status: SIGTERM }
        );
    }

    #[test]
    fn sigkill_ignores_the_action_table() {
        let mut state = SignalState::default();
        // A handler slot for SIGKILL must never be honored.
        state.actions[SIGKILL as usize].handler = SigHandler::Handler(0xdead);
        state.blocked = SigSet::full();
        state.post(SIGKILL, SigInfo::kernel(SIGKILL));
        assert_eq!(
            triage(&mut state),
            Disposition::Terminate { status: SIGKILL }
        );
    }

    #[test]
    fn ignored_signals_are_consumed_in_one_pass() {
        let mut state = SignalState::default();
        state.actions[SIGUSR1 as usize].handler = SigHandler::Ignore;
        state.post(SIGUSR1, SigInfo::kernel(SIGUSR1));
        state.post(SIGCHLD, SigInfo::kernel(SIGCHLD)); // default ignore
        assert_eq!(triage(&mut state), Disposition::None);
        assert!(state.pending.is_empty());
    }

    #[test]
    fn lowest_signal_wins() {
        let mut state = SignalState::default();
        state.actions[SIGINT as usize].handler = SigHandler::Handler(0x10);
        state.actions[SIGTERM as usize].handler = SigHandler::Handler(0x20);
        state.post(SIGTERM, SigInfo::kernel(SIGTERM));
        state.post(SIGINT, SigInfo::kernel(SIGINT));
        match triage(&mut state) {
            Disposition::Handler { sig, .. } => assert_eq!(sig, SIGINT),
            other => panic!("expected handler, got {:?}", other),
        }
        assert!(state.pending.contains(SIGTERM));
    }

    #[test]
    fn handler_masks_itself_until_return() {
        let mut state = SignalState::default();
        state.actions[SIGUSR1 as usize].handler = SigHandler::Handler(0x10);
        state.post(SIGUSR1, SigInfo::kernel(SIGUSR1));
        let disposition = triage(&mut state);
        match disposition {
            Disposition::Handler { old_mask, .. } => {
                assert!(!old_mask.contains(SIGUSR1));
                assert!(state.blocked.contains(SIGUSR1));
            }
            other => panic!("expected handler, got {:?}", other),
        }
        // A second SIGUSR1 stays pending while the handler runs.
        state.post(SIGUSR1, SigInfo::kernel(SIGUSR1));
        assert_eq!(triage(&mut state), Disposition::None);
        // sigreturn restores the mask and the second delivery happens.
        state.blocked = SigSet::empty();
        assert!(matches!(triage(&mut state), Disposition::Handler { .. }));
    }

    #[test]
    fn resethand_restores_default() {
        let mut state = SignalState::default();
        state.actions[SIGUSR1 as usize] = SigAction {
            handler: SigHandler::Handler(0x10),
            mask: SigSet::empty(),
            flags: SA_RESETHAND,
        };
        state.post(SIGUSR1, SigInfo::kernel(SIGUSR1));
        assert!(matches!(triage(&mut state), Disposition::Handler { .. }));
        assert_eq!(
            state.actions[SIGUSR1 as usize].handler,
            SigHandler::Default
        );
    }

    #[test]
    fn siginfo_passed_only_when_requested() {
        let mut state = SignalState::default();
        state.actions[SIGUSR1 as usize] = SigAction {
            handler: SigHandler::Handler(0x10),
            mask: SigSet::empty(),
            flags: SA_SIGINFO,
        };
        let info = SigInfo::user(SIGUSR1, 7, 100);
        state.post(SIGUSR1, info);
        match triage(&mut state) {
            Disposition::Handler { info: Some(i), .. } => assert_eq!(i.pid, 7),
            other => panic!("expected siginfo handler, got {:?}", other),
        }
    }

    #[test]
    fn stop_and_continue_dispositions() {
        let mut state = SignalState::default();
        state.post(SIGSTOP, SigInfo::kernel(SIGSTOP));
        assert_eq!(triage(&mut state), Disposition::Stop);
        state.post(super::super::SIGCONT, SigInfo::kernel(super::super::SIGCONT));
        assert_eq!(triage(&mut state), Disposition::Continue);
    }
}
