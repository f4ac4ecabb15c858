//! The timer tick.
//!
//! IRQ 0 fires [`HZ`] times a second. Each tick charges the running
//! process, retires per-process timeouts (waking timed sleeps with the
//! distinguished timed-out indication), winds down the three interval
//! timers, and every [`LOAD_FREQ`] ticks samples the load average.
//!
//! [`HZ`]: crate::config::HZ
//! [`LOAD_FREQ`]: crate::config::LOAD_FREQ

use core::sync::atomic::Ordering;

use crate::config::{HZ, LOAD_FREQ};
use crate::kstat::{KSTAT, sample_loadavg};
use crate::proc::sleep::wakeup_proc;
use crate::proc::{ProcState, ProcTable};
use crate::sched;
use crate::signal::{SIGALRM, SIGPROF, SIGVTALRM, send_sig};

/// Ticks since boot.
#[must_use]
pub fn jiffies() -> u32 {
    KSTAT.ticks.load(Ordering::Relaxed)
}

/// Seconds since boot.
#[must_use]
pub fn uptime() -> u32 {
    KSTAT.uptime.load(Ordering::Relaxed)
}

/// Converts a (seconds, nanoseconds) pair to ticks, rounding up.
#[must_use]
pub fn timespec_to_ticks(sec: u32, nsec: u32) -> u32 {
    let tick_ns = 1_000_000_000 / HZ;
    sec.saturating_mul(HZ)
        .saturating_add(nsec.div_ceil(tick_ns))
}

/// Converts ticks back to a (seconds, nanoseconds) pair.
#[must_use]
pub fn ticks_to_timespec(ticks: u32) -> (u32, u32) {
    (ticks / HZ, (ticks % HZ) * (1_000_000_000 / HZ))
}

/// One timer interrupt: the body of the IRQ 0 handler.
///
/// `user_mode` says whether the tick interrupted ring 3 (charges utime
/// and the virtual timer) or the kernel (stime).
pub fn do_tick(table: &mut ProcTable, user_mode: bool) {
    let ticks = KSTAT.ticks.fetch_add(1, Ordering::Relaxed) + 1;
    if ticks % HZ == 0 {
        KSTAT.uptime.fetch_add(1, Ordering::Relaxed);
    }

    // Charge the running process and its quantum.
    {
        let p = table.current_mut();
        if user_mode {
            p.usage.utime += 1;
            KSTAT.cpu_user.fetch_add(1, Ordering::Relaxed);
        } else {
            p.usage.stime += 1;
            KSTAT.cpu_system.fetch_add(1, Ordering::Relaxed);
        }
    }
    sched::tick(table);

    // Interval timers of the running process.
    let current = table.current;
    let mut raise = [false; 3];
    {
        let p = table.get_mut(current);
        if p.it_real.0 > 0 {
            p.it_real.0 -= 1;
            if p.it_real.0 == 0 {
                raise[0] = true;
                p.it_real.0 = p.it_real.1;
            }
        }
        if user_mode && p.it_virt.0 > 0 {
            p.it_virt.0 -= 1;
            if p.it_virt.0 == 0 {
                raise[1] = true;
                p.it_virt.0 = p.it_virt.1;
            }
        }
        if p.it_prof.0 > 0 {
            p.it_prof.0 -= 1;
            if p.it_prof.0 == 0 {
                raise[2] = true;
                p.it_prof.0 = p.it_prof.1;
            }
        }
    }
    if raise[0] {
        let _ = send_sig(table, current, SIGALRM);
    }
    if raise[1] {
        let _ = send_sig(table, current, SIGVTALRM);
    }
    if raise[2] {
        let _ = send_sig(table, current, SIGPROF);
    }

    // Per-process sleep timeouts.
    let expired: alloc::vec::Vec<usize> = table
        .live_slots()
        .filter(|&s| table.get(s).timeout > 0)
        .collect();
    for slot in expired {
        let fired = {
            let p = table.get_mut(slot);
            p.timeout -= 1;
            p.timeout == 0 && p.state == ProcState::Sleeping
        };
        if fired {
            table.get_mut(slot).timed_out = true;
            wakeup_proc(table, slot);
        }
    }

    if ticks % LOAD_FREQ == 0 {
        sample_loadavg(table.running());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEF_PRIORITY;
    use crate::proc::sleep::{SleepKind, sleep};
    use crate::proc::tests::booted;
    use crate::proc::{INIT, ProcFlags};
    use crate::signal::sigmask;

    #[test]
    fn tick_charges_time_and_quantum() {
        let mut t = booted();
        t.get_mut(INIT).cpu_count = DEF_PRIORITY;
        do_tick(&mut t, true);
        assert_eq!(t.get(INIT).usage.utime, 1);
        assert_eq!(t.get(INIT).cpu_count, DEF_PRIORITY - 1);
        do_tick(&mut t, false);
        assert_eq!(t.get(INIT).usage.stime, 1);
    }

    #[test]
    fn timeout_wakes_with_timed_out_flag() {
        let mut t = booted();
        t.get_mut(INIT).timeout = 2;
        sleep(&mut t, 0x7777, SleepKind::Interruptible);
        assert_eq!(t.get(INIT).state, ProcState::Sleeping);

        do_tick(&mut t, false);
        assert_eq!(t.get(INIT).state, ProcState::Sleeping, "one tick left");
        do_tick(&mut t, false);
        assert_eq!(t.get(INIT).state, ProcState::Running);
        assert!(t.get(INIT).timed_out, "wake must be distinguishable");
    }

    #[test]
    fn timeout_respects_uninterruptible_sleep() {
        let mut t = booted();
        t.get_mut(INIT).timeout = 1;
        sleep(&mut t, 0x8888, SleepKind::Uninterruptible);
        do_tick(&mut t, false);
        assert_eq!(
            t.get(INIT).state,
            ProcState::Sleeping,
            "uninterruptible sleeps ignore timeouts"
        );
        assert!(t.get(INIT).flags.contains(ProcFlags::NOTINTERRUPT));
    }

    #[test]
    fn real_itimer_posts_sigalrm_and_reloads() {
        let mut t = booted();
        t.get_mut(INIT).it_real = (2, 3);
        do_tick(&mut t, false);
        assert_eq!(t.get(INIT).sigpending & sigmask(SIGALRM), 0);
        do_tick(&mut t, false);
        assert_ne!(t.get(INIT).sigpending & sigmask(SIGALRM), 0);
        assert_eq!(t.get(INIT).it_real.0, 3, "interval timer reloads");
    }

    #[test]
    fn virtual_itimer_only_counts_user_ticks() {
        let mut t = booted();
        t.get_mut(INIT).it_virt = (1, 0);
        do_tick(&mut t, false);
        assert_eq!(t.get(INIT).it_virt.0, 1, "kernel ticks do not count");
        do_tick(&mut t, true);
        assert_ne!(t.get(INIT).sigpending & sigmask(SIGVTALRM), 0);
    }

    #[test]
    fn timespec_conversion_round_trips() {
        assert_eq!(timespec_to_ticks(1, 0), HZ);
        assert_eq!(timespec_to_ticks(0, 10_000_000), 1);
        assert_eq!(timespec_to_ticks(0, 1), 1, "sub-tick rounds up");
        assert_eq!(ticks_to_timespec(HZ + 1), (1, 10_000_000));
    }
}
