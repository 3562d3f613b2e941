//! Signal system calls

use crate::error::{Errno, KResult};
use crate::process::{self};
use crate::signal::{
    self, check_signal, is_unblockable, SigAction, SigHandler, SigSet, SIG_BLOCK, SIG_SETMASK,
    SIG_UNBLOCK,
};
use crate::task::sched;

use super::{copy_from_user, copy_to_user, user_u32};

/// SIG_DFL/SIG_IGN encodings in the user ABI.
const SIG_DFL_PTR: u32 = 0;
const SIG_IGN_PTR: u32 = 1;

fn handler_from_user(ptr: u32) -> SigHandler {
    match ptr {
        SIG_DFL_PTR => SigHandler::Default,
        SIG_IGN_PTR => SigHandler::Ignore,
        entry => SigHandler::Handler(entry),
    }
}

fn handler_to_user(handler: SigHandler) -> u32 {
    match handler {
        SigHandler::Default => SIG_DFL_PTR,
        SigHandler::Ignore => SIG_IGN_PTR,
        SigHandler::Handler(entry) => entry,
    }
}

pub fn sys_kill(pid: i32, sig: i32) -> KResult<isize> {
    if sig != 0 {
        check_signal(sig)?;
    }
    // Negative pids address a whole process group.
    if pid == 0 {
        let pgid = process::with_current(|p| p.pgid)?;
        process::send_signal_group(pgid, sig)?;
    } else if pid < -1 {
        process::send_signal_group(-pid, sig)?;
    } else if pid == -1 {
        return Err(Errno::Enotsup);
    } else {
        kill_permission(pid)?;
        process::send_signal(pid, sig)?;
    }
    Ok(0)
}

/// The caller may signal the target when root or when the real or
/// effective uid matches the target's.
fn kill_permission(target: crate::task::Pid) -> KResult<()> {
    let me = process::current_cred();
    if me.euid == 0 {
        return Ok(());
    }
    let target_uid = process::with_process(target, |p| p.creds.uid)?;
    if me.uid == target_uid || me.euid == target_uid {
        Ok(())
    } else {
        Err(Errno::Eperm)
    }
}

pub fn sys_signal(sig: i32, handler_ptr: u32) -> KResult<isize> {
    let sig = check_signal(sig)?;
    if is_unblockable(sig) {
        return Err(Errno::Einval);
    }
    let old = process::with_current(|p| {
        let old = p.signals.actions[sig as usize].handler;
        p.signals.actions[sig as usize] = SigAction {
            handler: handler_from_user(handler_ptr),
            mask: SigSet::empty(),
            flags: 0,
        };
        old
    })?;
    Ok(handler_to_user(old) as isize)
}

/// `struct sigaction`: handler, 64-bit mask, flags.
const SIGACTION_SIZE: usize = 16;

pub fn sys_sigaction(sig: i32, act_ptr: u32, old_ptr: u32) -> KResult<isize> {
    let sig = check_signal(sig)?;
    if is_unblockable(sig) && act_ptr != 0 {
        return Err(Errno::Einval);
    }
    let old = process::with_current(|p| p.signals.actions[sig as usize])?;
    if old_ptr != 0 {
        let mut raw = [0u8; SIGACTION_SIZE];
        raw[0..4].copy_from_slice(&handler_to_user(old.handler).to_le_bytes());
        raw[4..12].copy_from_slice(&old.mask.0.to_le_bytes());
        raw[12..16].copy_from_slice(&old.flags.to_le_bytes());
        copy_to_user(old_ptr, &raw)?;
    }
    if act_ptr != 0 {
        let mut raw = [0u8; SIGACTION_SIZE];
        copy_from_user(act_ptr, &mut raw)?;
        let handler = handler_from_user(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        let mask = SigSet(u64::from_le_bytes([
            raw[4], raw[5], raw[6], raw[7], raw[8], raw[9], raw[10], raw[11],
        ]))
        .sanitized();
        let flags = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
        process::with_current(|p| {
            p.signals.actions[sig as usize] = SigAction {
                handler,
                mask,
                flags,
            };
        })?;
    }
    Ok(0)
}

pub fn sys_sigprocmask(how: i32, set_ptr: u32, old_ptr: u32) -> KResult<isize> {
    let old = process::with_current(|p| p.signals.blocked)?;
    if old_ptr != 0 {
        copy_to_user(old_ptr, &old.0.to_le_bytes())?;
    }
    if set_ptr != 0 {
        let mut raw = [0u8; 8];
        copy_from_user(set_ptr, &mut raw)?;
        let set = SigSet(u64::from_le_bytes(raw)).sanitized();
        process::with_current(|p| {
            p.signals.blocked = match how {
                SIG_BLOCK => SigSet(p.signals.blocked.0 | set.0),
                SIG_UNBLOCK => SigSet(p.signals.blocked.0 & !set.0),
                SIG_SETMASK => set,
                _ => return Err(Errno::Einval),
            };
            Ok(())
        })??;
    }
    Ok(0)
}

pub fn sys_sigpending(set_ptr: u32) -> KResult<isize> {
    let pending = process::with_current(|p| {
        SigSet(p.signals.pending.0 & p.signals.blocked.0)
    })?;
    copy_to_user(set_ptr, &pending.0.to_le_bytes())?;
    Ok(0)
}

pub fn sys_sigsuspend(mask_ptr: u32) -> KResult<isize> {
    let mask = SigSet(user_u32(mask_ptr)? as u64 | ((user_u32(mask_ptr + 4)? as u64) << 32))
        .sanitized();
    let pid = sched::current_pid();

    let saved = process::with_current(|p| {
        let saved = p.signals.blocked;
        p.signals.blocked = mask;
        p.paused = true;
        saved
    })?;
    sched::with_scheduler(|s| {
        if let Some(task) = s.task_mut(pid) {
            task.state = crate::task::TaskState::Paused;
        }
    });

    loop {
        let deliverable =
            process::with_current(|p| !p.signals.deliverable().is_empty())?;
        if deliverable || !process::with_current(|p| p.paused)? {
            break;
        }
        sched::relax();
        #[cfg(not(target_os = "none"))]
        break; // host unit tests cannot receive interrupts
    }

    // The handler (or default action) runs against the temporary mask;
    // the caller's mask comes back afterwards.
    process::with_current(|p| {
        p.paused = false;
        p.signals.blocked = saved;
    })?;
    sched::with_scheduler(|s| s.wake(pid));
    Err(Errno::Eintr)
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, SYS_KILL, SYS_SIGACTION, SYS_SIGPROCMASK};
    use super::*;
    use crate::mm::paging::PageFlags;
    use crate::mm::{paging, VirtAddr};
    use crate::process::testutil;
    use crate::signal::{SIGINT, SIGKILL, SIGUSR1};

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
    }

    #[test]
    fn sigaction_round_trips_through_memory() {
        testutil::boot(900);
        let base = 0x0814_0000u32;
        map_user_page(base);

        // Install handler 0x5000 with SIGUSR1 masked during delivery.
        let mut act = [0u8; 16];
        act[0..4].copy_from_slice(&0x5000u32.to_le_bytes());
        act[4..12].copy_from_slice(&(1u64 << SIGUSR1).to_le_bytes());
        copy_to_user(base, &act).unwrap();
        assert_eq!(
            dispatch(SYS_SIGACTION, [SIGINT as u32, base, base + 0x20, 0, 0, 0]),
            0
        );
        // Old action was the default.
        let mut old = [0u8; 16];
        crate::syscall::copy_from_user(base + 0x20, &mut old).unwrap();
        assert_eq!(u32::from_le_bytes([old[0], old[1], old[2], old[3]]), 0);

        let action =
            process::with_current(|p| p.signals.actions[SIGINT as usize]).unwrap();
        assert_eq!(action.handler, SigHandler::Handler(0x5000));
        assert!(action.mask.contains(SIGUSR1));
    }

    #[test]
    fn sigaction_refuses_kill_and_stop() {
        testutil::boot(900);
        let base = 0x0814_0000u32;
        map_user_page(base);
        copy_to_user(base, &[0u8; 16]).unwrap();
        assert_eq!(
            dispatch(SYS_SIGACTION, [SIGKILL as u32, base, 0, 0, 0, 0]),
            Errno::Einval.as_neg()
        );
    }

    #[test]
    fn procmask_blocks_and_unblocks() {
        testutil::boot(900);
        let base = 0x0814_0000u32;
        map_user_page(base);

        copy_to_user(base, &(1u64 << SIGINT).to_le_bytes()).unwrap();
        assert_eq!(
            dispatch(SYS_SIGPROCMASK, [SIG_BLOCK as u32, base, 0, 0, 0, 0]),
            0
        );
        assert!(process::with_current(|p| p.signals.blocked.contains(SIGINT)).unwrap());

        // kill marks it pending, delivery defers.
        assert_eq!(dispatch(SYS_KILL, [0u32.wrapping_sub(0), 0, 0, 0, 0, 0]), 0);
        let me = sched::current_pid();
        process::send_signal(me, SIGINT).unwrap();
        assert_eq!(
            process::deliver_signals(me),
            crate::signal::deliver::Disposition::None
        );

        assert_eq!(
            dispatch(SYS_SIGPROCMASK, [SIG_UNBLOCK as u32, base, 0, 0, 0, 0]),
            0
        );
        // Default action for SIGINT is terminate.
        assert!(matches!(
            process::deliver_signals(me),
            crate::signal::deliver::Disposition::Terminate { .. }
        ));
    }

    #[test]
    fn kill_zero_probes_group() {
        testutil::boot(900);
        // Signal 0 to our own group: permission probe only.
        assert_eq!(dispatch(SYS_KILL, [0, 0, 0, 0, 0, 0]), 0);
    }
}
