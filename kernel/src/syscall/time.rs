//! Time system calls

use crate::error::{Errno, KResult};
use crate::process::{self, ITimer, ITIMER_PROF, ITIMER_REAL, ITIMER_VIRTUAL};
use crate::time;

use super::{copy_from_user, copy_to_user, put_user_u32};

pub fn sys_time(out_ptr: u32) -> KResult<isize> {
    let now = time::unix_time();
    if out_ptr != 0 {
        put_user_u32(out_ptr, now as u32)?;
    }
    Ok(now as isize)
}

pub fn sys_gettimeofday(tv_ptr: u32, _tz_ptr: u32) -> KResult<isize> {
    if tv_ptr != 0 {
        let (sec, usec) = time::unix_time_us();
        put_user_u32(tv_ptr, sec as u32)?;
        put_user_u32(tv_ptr + 4, usec)?;
    }
    Ok(0)
}

pub fn sys_settimeofday(tv_ptr: u32, _tz_ptr: u32) -> KResult<isize> {
    if process::current_cred().euid != 0 {
        return Err(Errno::Eperm);
    }
    if tv_ptr != 0 {
        let secs = super::user_u32(tv_ptr)?;
        time::set_unix_time(secs as i64);
    }
    Ok(0)
}

/// `struct tms`: four clock_t tick counts.
pub fn sys_times(buf_ptr: u32) -> KResult<isize> {
    let (rusage, cusage) = process::with_current(|p| (p.rusage, p.cusage))?;
    if buf_ptr != 0 {
        put_user_u32(buf_ptr, rusage.utime_ticks as u32)?;
        put_user_u32(buf_ptr + 4, rusage.stime_ticks as u32)?;
        put_user_u32(buf_ptr + 8, cusage.utime_ticks as u32)?;
        put_user_u32(buf_ptr + 12, cusage.stime_ticks as u32)?;
    }
    Ok(time::ticks() as isize)
}

pub fn sys_getrusage(who: i32, usage_ptr: u32) -> KResult<isize> {
    // RUSAGE_SELF 0, RUSAGE_CHILDREN -1.
    let usage = match who {
        0 => process::with_current(|p| p.rusage)?,
        -1 => process::with_current(|p| p.cusage)?,
        _ => return Err(Errno::Einval),
    };
    super::proc::write_rusage(usage_ptr, &usage)?;
    Ok(0)
}

pub fn sys_alarm(seconds: u32) -> KResult<isize> {
    let previous = process::with_current(|p| {
        let old = p.itimers[ITIMER_REAL];
        p.itimers[ITIMER_REAL] = ITimer {
            value_us: seconds as u64 * 1_000_000,
            interval_us: 0,
        };
        old
    })?;
    Ok(previous.value_us.div_ceil(1_000_000) as isize)
}

fn timer_slot(which: i32) -> KResult<usize> {
    match which as usize {
        ITIMER_REAL | ITIMER_VIRTUAL | ITIMER_PROF => Ok(which as usize),
        _ => Err(Errno::Einval),
    }
}

/// `struct itimerval`: interval timeval then value timeval.
pub fn sys_setitimer(which: i32, new_ptr: u32, old_ptr: u32) -> KResult<isize> {
    let slot = timer_slot(which)?;
    let old = process::with_current(|p| p.itimers[slot])?;
    if old_ptr != 0 {
        write_itimerval(old_ptr, &old)?;
    }
    if new_ptr != 0 {
        let mut raw = [0u8; 16];
        copy_from_user(new_ptr, &mut raw)?;
        let interval = timeval_us(&raw[0..8]);
        let value = timeval_us(&raw[8..16]);
        process::with_current(|p| {
            p.itimers[slot] = ITimer {
                value_us: value,
                interval_us: interval,
            };
        })?;
    }
    Ok(0)
}

pub fn sys_getitimer(which: i32, out_ptr: u32) -> KResult<isize> {
    let slot = timer_slot(which)?;
    let timer = process::with_current(|p| p.itimers[slot])?;
    write_itimerval(out_ptr, &timer)?;
    Ok(0)
}

fn timeval_us(raw: &[u8]) -> u64 {
    let sec = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as u64;
    let usec = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as u64;
    sec * 1_000_000 + usec
}

fn write_itimerval(va: u32, timer: &ITimer) -> KResult<()> {
    let mut raw = [0u8; 16];
    raw[0..4].copy_from_slice(&((timer.interval_us / 1_000_000) as u32).to_le_bytes());
    raw[4..8].copy_from_slice(&((timer.interval_us % 1_000_000) as u32).to_le_bytes());
    raw[8..12].copy_from_slice(&((timer.value_us / 1_000_000) as u32).to_le_bytes());
    raw[12..16].copy_from_slice(&((timer.value_us % 1_000_000) as u32).to_le_bytes());
    copy_to_user(va, &raw)
}

/// `struct timespec` in, remaining time out on EINTR.
pub fn sys_nanosleep(req_ptr: u32, _rem_ptr: u32) -> KResult<isize> {
    let mut raw = [0u8; 8];
    copy_from_user(req_ptr, &mut raw)?;
    let sec = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64;
    let nsec = i32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as i64;
    time::nanosleep(sec, nsec)?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::super::{dispatch, SYS_ALARM, SYS_GETITIMER, SYS_SETITIMER, SYS_TIME};
    use super::*;
    use crate::mm::paging::PageFlags;
    use crate::mm::{paging, VirtAddr};
    use crate::process::testutil;

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
    fn time_reports_epoch() {
        testutil::boot(900);
        crate::time::set_unix_time(1_700_000_000);
        let t = dispatch(SYS_TIME, [0; 6]);
        assert_eq!(t, 1_700_000_000);
    }

    #[test]
    fn alarm_replaces_and_reports_previous() {
        testutil::boot(900);
        assert_eq!(dispatch(SYS_ALARM, [30, 0, 0, 0, 0, 0]), 0);
        assert_eq!(dispatch(SYS_ALARM, [5, 0, 0, 0, 0, 0]), 30);
        let timer =
            process::with_current(|p| p.itimers[ITIMER_REAL]).unwrap();
        assert_eq!(timer.value_us, 5_000_000);
        assert_eq!(timer.interval_us, 0);
    }

    #[test]
    fn itimer_round_trips_through_memory() {
        testutil::boot(900);
        let base = 0x0815_0000u32;
        map_user_page(base);

        let mut raw = [0u8; 16];
        raw[0..4].copy_from_slice(&1u32.to_le_bytes()); // interval 1.5s
        raw[4..8].copy_from_slice(&500_000u32.to_le_bytes());
        raw[8..12].copy_from_slice(&2u32.to_le_bytes()); // value 2s
        crate::syscall::copy_to_user(base, &raw).unwrap();
        assert_eq!(
            dispatch(SYS_SETITIMER, [ITIMER_REAL as u32, base, 0, 0, 0, 0]),
            0
        );
        assert_eq!(
            dispatch(SYS_GETITIMER, [ITIMER_REAL as u32, base + 0x20, 0, 0, 0, 0]),
            0
        );
        let mut back = [0u8; 16];
        crate::syscall::copy_from_user(base + 0x20, &mut back).unwrap();
        assert_eq!(timeval_us(&back[0..8]), 1_500_000);
        assert_eq!(timeval_us(&back[8..16]), 2_000_000);
    }
}
