//! Kernel statistics counters.
//!
//! One global block of counters the tick handler, IRQ dispatcher and
//! scheduler update; `sysinfo`-style syscalls and the load average read
//! them back.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Fixed-point shift for the load averages.
pub const FSHIFT: u32 = 11;

/// 1.0 in load-average fixed point.
pub const FIXED_1: u32 = 1 << FSHIFT;

/// e^(-5s/1min) in fixed point.
pub const EXP_1: u32 = 1884;

/// e^(-5s/5min) in fixed point.
pub const EXP_5: u32 = 2014;

/// e^(-5s/15min) in fixed point.
pub const EXP_15: u32 = 2037;

/// The global counters.
#[derive(Debug, Default)]
pub struct KStat {
    /// Timer ticks since boot.
    pub ticks: AtomicU32,
    /// Seconds since boot.
    pub uptime: AtomicU32,
    /// Hardware interrupts serviced.
    pub irqs: AtomicUsize,
    /// Context switches performed.
    pub ctxt: AtomicUsize,
    /// Ticks spent in user mode.
    pub cpu_user: AtomicU32,
    /// Ticks spent in kernel mode.
    pub cpu_system: AtomicU32,
    /// Load averages over 1, 5 and 15 minutes, fixed point.
    pub loadavg: [AtomicU32; 3],
    /// Processes forked since boot.
    pub forks: AtomicUsize,
}

/// The one instance.
pub static KSTAT: KStat = KStat {
    ticks: AtomicU32::new(0),
    uptime: AtomicU32::new(0),
    irqs: AtomicUsize::new(0),
    ctxt: AtomicUsize::new(0),
    cpu_user: AtomicU32::new(0),
    cpu_system: AtomicU32::new(0),
    loadavg: [AtomicU32::new(0), AtomicU32::new(0), AtomicU32::new(0)],
    forks: AtomicUsize::new(0),
};

/// Applies one 5-second load sample: `load = load*exp + active*(1-exp)`
/// in fixed point, for each of the three horizons.
pub fn sample_loadavg(active: usize) {
    let active_fixed = (active as u32) << FSHIFT;
    for (slot, exp) in KSTAT.loadavg.iter().zip([EXP_1, EXP_5, EXP_15]) {
        let old = slot.load(Ordering::Relaxed);
        let new = (old * exp + active_fixed * (FIXED_1 - exp)) >> FSHIFT;
        slot.store(new, Ordering::Relaxed);
    }
}

/// Reads a load average as (integer, centi) parts for display.
#[must_use]
pub fn loadavg_parts(which: usize) -> (u32, u32) {
    let v = KSTAT.loadavg[which].load(Ordering::Relaxed);
    (v >> FSHIFT, ((v & (FIXED_1 - 1)) * 100) >> FSHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_average_converges_toward_active_count() {
        // Reset, then feed a constant load of 2 runnable processes.
        for s in &KSTAT.loadavg {
            s.store(0, Ordering::Relaxed);
        }
        for _ in 0..200 {
            sample_loadavg(2);
        }
        let (int1, _) = loadavg_parts(0);
        assert!(int1 >= 1, "1-min average must approach 2, got {int1}");
        // The 15-minute horizon reacts more slowly.
        let one = KSTAT.loadavg[0].load(Ordering::Relaxed);
        let fifteen = KSTAT.loadavg[2].load(Ordering::Relaxed);
        assert!(one > fifteen, "slow horizon must lag the fast one");
    }
}
