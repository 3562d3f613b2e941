//! Identity, session, and miscellaneous system calls

use spin::Mutex;

use crate::error::{Errno, KResult};
use crate::process::{self};
use crate::task::{sched, Pid};

use super::{copy_from_user, copy_to_user};

pub fn sys_getuid() -> KResult<isize> {
    Ok(process::with_current(|p| p.creds.uid)? as isize)
}

pub fn sys_geteuid() -> KResult<isize> {
    Ok(process::with_current(|p| p.creds.euid)? as isize)
}

pub fn sys_getgid() -> KResult<isize> {
    Ok(process::with_current(|p| p.creds.gid)? as isize)
}

pub fn sys_getegid() -> KResult<isize> {
    Ok(process::with_current(|p| p.creds.egid)? as isize)
}

/// Root may become anyone; everyone else only their own real uid.
pub fn sys_setuid(uid: u32) -> KResult<isize> {
    process::with_current(|p| {
        if p.creds.euid != 0 && p.creds.uid != uid {
            return Err(Errno::Eperm);
        }
        p.creds.uid = uid;
        p.creds.euid = uid;
        p.creds.suid = uid;
        Ok(0)
    })?
}

pub fn sys_setgid(gid: u32) -> KResult<isize> {
    process::with_current(|p| {
        if p.creds.euid != 0 && p.creds.gid != gid {
            return Err(Errno::Eperm);
        }
        p.creds.gid = gid;
        p.creds.egid = gid;
        p.creds.sgid = gid;
        Ok(0)
    })?
}

pub fn sys_setfsuid(uid: u32) -> KResult<isize> {
    // No separate filesystem uid is kept; report the effective uid the
    // way the original did.
    let _ = uid;
    sys_geteuid()
}

pub fn sys_setfsgid(gid: u32) -> KResult<isize> {
    let _ = gid;
    sys_getegid()
}

pub fn sys_setpgid(pid: Pid, pgid: Pid) -> KResult<isize> {
    if pgid < 0 {
        return Err(Errno::Einval);
    }
    let me = sched::current_pid();
    let target = if pid == 0 { me } else { pid };
    let new_pgid = if pgid == 0 { target } else { pgid };
    process::with_process(target, |p| {
        // A session leader's group never changes.
        if p.is_session_leader(target) {
            return Err(Errno::Eperm);
        }
        p.pgid = new_pgid;
        Ok(0)
    })?
}

pub fn sys_getpgid(pid: Pid) -> KResult<isize> {
    let target = if pid == 0 { sched::current_pid() } else { pid };
    Ok(process::with_process(target, |p| p.pgid)? as isize)
}

pub fn sys_getsid(pid: Pid) -> KResult<isize> {
    let target = if pid == 0 { sched::current_pid() } else { pid };
    Ok(process::with_process(target, |p| p.sid)? as isize)
}

/// Detach into a new session. Fails for process-group leaders.
pub fn sys_setsid() -> KResult<isize> {
    let me = sched::current_pid();
    let leads_group = process::with_table(|table| {
        table
            .live_pids()
            .into_iter()
            .any(|pid| pid != me && table.get(pid).map(|p| p.pgid == me).unwrap_or(false))
    })?;
    if leads_group {
        return Err(Errno::Eperm);
    }
    process::with_current(|p| {
        p.pgid = me;
        p.sid = me;
    })?;
    Ok(me as isize)
}

// ---------------------------------------------------------------------------
// Priorities (single round-robin class: stored, not scheduled on)
// ---------------------------------------------------------------------------

static NICE: Mutex<i32> = Mutex::new(0);

pub fn sys_nice(increment: i32) -> KResult<isize> {
    let mut nice = NICE.lock();
    *nice = (*nice + increment).clamp(-20, 19);
    Ok(*nice as isize)
}

pub fn sys_getpriority() -> KResult<isize> {
    // getpriority reports 20 - nice so the result stays non-negative.
    Ok((20 - *NICE.lock()) as isize)
}

pub fn sys_setpriority(value: i32) -> KResult<isize> {
    if !(-20..=19).contains(&value) {
        return Err(Errno::Einval);
    }
    *NICE.lock() = value;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Host and domain names, uname
// ---------------------------------------------------------------------------

const NAME_LEN: usize = 64;

static HOSTNAME: Mutex<([u8; NAME_LEN], usize)> = Mutex::new(([0; NAME_LEN], 0));
static DOMAINNAME: Mutex<([u8; NAME_LEN], usize)> = Mutex::new(([0; NAME_LEN], 0));

fn set_name(
    target: &Mutex<([u8; NAME_LEN], usize)>,
    name_ptr: u32,
    len: usize,
) -> KResult<isize> {
    if process::current_cred().euid != 0 {
        return Err(Errno::Eperm);
    }
    if len > NAME_LEN {
        return Err(Errno::Einval);
    }
    let mut buf = [0u8; NAME_LEN];
    copy_from_user(name_ptr, &mut buf[..len])?;
    *target.lock() = (buf, len);
    Ok(0)
}

pub fn sys_sethostname(name_ptr: u32, len: usize) -> KResult<isize> {
    set_name(&HOSTNAME, name_ptr, len)
}

pub fn sys_setdomainname(name_ptr: u32, len: usize) -> KResult<isize> {
    set_name(&DOMAINNAME, name_ptr, len)
}

/// `struct utsname`: five fixed 65-byte fields.
pub fn sys_uname(buf_ptr: u32) -> KResult<isize> {
    let field = |index: u32, value: &[u8]| -> KResult<()> {
        let mut raw = [0u8; 65];
        let n = value.len().min(64);
        raw[..n].copy_from_slice(&value[..n]);
        copy_to_user(buf_ptr + index * 65, &raw)
    };
    field(0, b"Ferrite")?;
    let (host, host_len) = *HOSTNAME.lock();
    field(1, &host[..host_len])?;
    field(2, env!("CARGO_PKG_VERSION").as_bytes())?;
    field(3, b"monolithic")?;
    field(4, b"i386")?;
    Ok(0)
}

// ---------------------------------------------------------------------------
// Resource limits (fixed table, enforced at the call sites)
// ---------------------------------------------------------------------------

/// RLIMIT_* indexes understood here.
const RLIM_NLIMITS: u32 = 16;
/// RLIM_INFINITY for the 32-bit ABI.
const RLIM_INFINITY: u32 = u32::MAX;

pub fn sys_getrlimit(resource: u32, rlim_ptr: u32) -> KResult<isize> {
    if resource >= RLIM_NLIMITS {
        return Err(Errno::Einval);
    }
    // RLIMIT_NOFILE (7) reflects the fixed descriptor table; everything
    // else is unlimited.
    let (cur, max) = if resource == 7 {
        (process::FD_LIMIT as u32, process::FD_LIMIT as u32)
    } else {
        (RLIM_INFINITY, RLIM_INFINITY)
    };
    copy_to_user(rlim_ptr, &cur.to_le_bytes())?;
    copy_to_user(rlim_ptr + 4, &max.to_le_bytes())?;
    Ok(0)
}

pub fn sys_setrlimit(resource: u32, _rlim_ptr: u32) -> KResult<isize> {
    if resource >= RLIM_NLIMITS {
        return Err(Errno::Einval);
    }
    // Limits are compile-time constants in this kernel; accept and
    // ignore, as the original did.
    Ok(0)
}
