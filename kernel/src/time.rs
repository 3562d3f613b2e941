//! Time keeping
//!
//! A single tick counter driven by the timer interrupt at [`HZ`], plus
//! a boot-time Unix epoch offset supplied by the RTC collaborator (or
//! `settimeofday`). Interval timers count down in microseconds and
//! deliver their signal on expiry.

use crate::process::{ITIMER_PROF, ITIMER_REAL, ITIMER_VIRTUAL};
use crate::signal::{SIGALRM, SIGPROF, SIGVTALRM};
use crate::task::sched;

/// Timer interrupt rate.
pub const HZ: u64 = 1000;
/// Microseconds per tick.
pub const TICK_US: u64 = 1_000_000 / HZ;

#[cfg(target_os = "none")]
mod clock {
    use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

    static TICKS: AtomicU64 = AtomicU64::new(0);
    static BOOT_EPOCH: AtomicI64 = AtomicI64::new(0);

    pub fn ticks() -> u64 {
        TICKS.load(Ordering::Relaxed)
    }

    pub fn bump_tick() {
        TICKS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn epoch() -> i64 {
        BOOT_EPOCH.load(Ordering::Relaxed)
    }

    pub fn set_epoch(secs: i64) {
        BOOT_EPOCH.store(secs, Ordering::Relaxed);
    }
}

#[cfg(not(target_os = "none"))]
mod clock {
    use std::cell::Cell;

    std::thread_local! {
        static TICKS: Cell<u64> = const { Cell::new(0) };
        static BOOT_EPOCH: Cell<i64> = const { Cell::new(0) };
    }

    pub fn ticks() -> u64 {
        TICKS.with(|t| t.get())
    }

    pub fn bump_tick() {
        TICKS.with(|t| t.set(t.get() + 1));
    }

    pub fn epoch() -> i64 {
        BOOT_EPOCH.with(|e| e.get())
    }

    pub fn set_epoch(secs: i64) {
        BOOT_EPOCH.with(|e| e.set(secs));
    }
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    clock::ticks()
}

/// Seconds since the Unix epoch.
pub fn unix_time() -> i64 {
    clock::epoch() + (ticks() / HZ) as i64
}

/// Microseconds into the current second.
pub fn unix_time_us() -> (i64, u32) {
    let t = ticks();
    (clock::epoch() + (t / HZ) as i64, ((t % HZ) * TICK_US) as u32)
}

/// Record the wall-clock time (boot RTC read, `settimeofday`).
pub fn set_unix_time(secs: i64) {
    let elapsed = (ticks() / HZ) as i64;
    clock::set_epoch(secs - elapsed);
}

/// The timer-interrupt body: count the tick, charge the running
/// process, and run down its interval timers. Called with interrupts
/// off; scheduling happens in the caller after this returns.
pub fn on_tick(user_mode: bool) {
    clock::bump_tick();

    let pid = sched::current_pid();
    let _ = crate::process::with_process(pid, |proc| {
        if user_mode {
            proc.rusage.utime_ticks += 1;
        } else {
            proc.rusage.stime_ticks += 1;
        }

        let mut expired = [false; 3];
        for (slot, fired) in expired.iter_mut().enumerate() {
            let run = match slot {
                ITIMER_REAL => true,
                ITIMER_VIRTUAL => user_mode,
                // ITIMER_PROF counts user and system time.
                _ => true,
            };
            if !run {
                continue;
            }
            let timer = &mut proc.itimers[slot];
            if timer.value_us == 0 {
                continue;
            }
            if timer.value_us <= TICK_US {
                timer.value_us = timer.interval_us;
                *fired = true;
            } else {
                timer.value_us -= TICK_US;
            }
        }

        for (slot, fired) in expired.iter().enumerate() {
            if !*fired {
                continue;
            }
            let sig = match slot {
                ITIMER_REAL => SIGALRM,
                ITIMER_VIRTUAL => SIGVTALRM,
                ITIMER_PROF => SIGPROF,
                _ => unreachable!("three interval timers"),
            };
            proc.signals
                .post(sig, crate::signal::SigInfo::kernel(sig));
            proc.paused = false;
        }
    });
}

/// Sleep for the given duration by yielding until the deadline, or
/// until a deliverable signal arrives (EINTR).
pub fn nanosleep(secs: i64, nsecs: i64) -> crate::error::KResult<()> {
    use crate::error::Errno;

    if secs < 0 || !(0..1_000_000_000).contains(&nsecs) {
        return Err(Errno::Einval);
    }
    let total_ticks = secs as u64 * HZ + (nsecs as u64 * HZ).div_ceil(1_000_000_000);
    let deadline = ticks() + total_ticks;
    while ticks() < deadline {
        let pending = crate::process::with_current(|p| !p.signals.deliverable().is_empty())
            .unwrap_or(false);
        if pending {
            return Err(Errno::Eintr);
        }
        sched::relax();
        // Off-target there is no timer interrupt to advance the clock.
        #[cfg(not(target_os = "none"))]
        clock::bump_tick();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ITimer;

    #[test]
    fn epoch_tracks_tick_count() {
        crate::process::testutil::boot(400);
        set_unix_time(1_000_000);
        let t0 = unix_time();
        for _ in 0..HZ {
            on_tick(false);
        }
        assert_eq!(unix_time(), t0 + 1);
    }

    #[test]
    fn tick_charges_rusage_by_mode() {
        crate::process::testutil::boot(400);
        let before = crate::process::with_current(|p| p.rusage).unwrap();
        on_tick(true);
        on_tick(true);
        on_tick(false);
        let after = crate::process::with_current(|p| p.rusage).unwrap();
        assert_eq!(after.utime_ticks - before.utime_ticks, 2);
        assert_eq!(after.stime_ticks - before.stime_ticks, 1);
    }

    #[test]
    fn itimer_real_fires_sigalrm_and_reloads() {
        crate::process::testutil::boot(400);
        crate::process::with_current(|p| {
            p.itimers[ITIMER_REAL] = ITimer {
                value_us: TICK_US,
                interval_us: 5 * TICK_US,
            };
        })
        .unwrap();

        on_tick(false);
        let (pending, reload) = crate::process::with_current(|p| {
            (
                p.signals.pending.contains(SIGALRM),
                p.itimers[ITIMER_REAL].value_us,
            )
        })
        .unwrap();
        assert!(pending);
        assert_eq!(reload, 5 * TICK_US, "periodic timer reloads");
    }

    #[test]
    fn oneshot_itimer_disarms() {
        crate::process::testutil::boot(400);
        crate::process::with_current(|p| {
            p.itimers[ITIMER_REAL] = ITimer {
                value_us: TICK_US,
                interval_us: 0,
            };
        })
        .unwrap();
        on_tick(false);
        on_tick(false);
        let value =
            crate::process::with_current(|p| p.itimers[ITIMER_REAL].value_us).unwrap();
        assert_eq!(value, 0);
    }

    #[test]
    fn nanosleep_interrupted_by_signal() {
        crate::process::testutil::boot(400);
        crate::process::with_current(|p| {
            p.signals.post(
                crate::signal::SIGUSR1,
                crate::signal::SigInfo::kernel(crate::signal::SIGUSR1),
            );
        })
        .unwrap();
        assert_eq!(nanosleep(1, 0), Err(crate::error::Errno::Eintr));
    }

    #[test]
    fn nanosleep_completes_without_signals() {
        crate::process::testutil::boot(400);
        // Host ticks advance inside the sleep loop.
        assert!(nanosleep(0, 5_000_000).is_ok());
    }
}
