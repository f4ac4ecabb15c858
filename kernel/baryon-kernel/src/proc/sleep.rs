//! Sleep, wakeup and the sleeping resource lock.
//!
//! A wait channel is an arbitrary word identity hashed into a bucket of
//! the process table's sleep hash. Sleepers are inserted at the bucket
//! head, so wakeup order is LIFO, and `wakeup` wakes *every* matching
//! sleeper — the thundering herd re-checks its condition. A woken
//! process gets a fresh quantum.

use crate::proc::{ProcState, ProcTable};
use crate::sched;
use crate::signal;

/// Sleep kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepKind {
    /// Signals wake the sleeper early; `sleep` reports the signal.
    Interruptible,
    /// Only an explicit wakeup ends the sleep. For short waits that
    /// are guaranteed to complete (buffer I/O, resource locks).
    Uninterruptible,
}

/// Puts the current process to sleep on `channel`.
///
/// For interruptible sleeps a deliverable pending signal aborts the
/// sleep, before or after it happens, and its number is returned;
/// otherwise 0.
pub fn sleep(table: &mut ProcTable, channel: usize, kind: SleepKind) -> i32 {
    let slot = table.current;

    if kind == SleepKind::Interruptible {
        let sig = signal::issig(table, slot);
        if sig != 0 {
            return sig;
        }
    }

    if table.get(slot).state == ProcState::Sleeping {
        baryon_core::kwarn!("process {} is already sleeping", table.get(slot).pid);
        return 0;
    }

    table.sleep_insert(slot, channel);
    if kind == SleepKind::Uninterruptible {
        table
            .get_mut(slot)
            .flags
            .insert(crate::proc::ProcFlags::NOTINTERRUPT);
    }
    table.not_runnable(slot, ProcState::Sleeping);

    sched::do_sched(table);

    if kind == SleepKind::Interruptible {
        signal::issig(table, slot)
    } else {
        0
    }
}

/// Wakes every process sleeping on `channel`.
pub fn wakeup(table: &mut ProcTable, channel: usize) {
    for slot in table.sleepers_on(channel) {
        table.sleep_unlink(slot);
        let p = table.get_mut(slot);
        p.cpu_count = p.priority;
        p.flags.remove(crate::proc::ProcFlags::NOTINTERRUPT);
        table.runnable(slot);
        table.need_resched = true;
    }
}

/// Targeted wake of one process (signal delivery).
///
/// No-op unless the target is interruptibly sleeping or stopped.
pub fn wakeup_proc(table: &mut ProcTable, slot: usize) {
    let p = table.get(slot);
    if p.state != ProcState::Sleeping && p.state != ProcState::Stopped {
        return;
    }
    if p.flags.contains(crate::proc::ProcFlags::NOTINTERRUPT) {
        return;
    }
    // Stopped processes carry no channel.
    table.sleep_unlink(slot);
    let p = table.get_mut(slot);
    p.cpu_count = p.priority;
    table.runnable(slot);
    table.need_resched = true;
}

/// A sleeping mutual-exclusion lock for longer-lived critical regions
/// (superblock updates, fd-slot allocation).
///
/// Not recursive: a holder must not re-acquire. Contenders sleep
/// uninterruptibly on the resource's channel identity.
#[derive(Debug, Default)]
pub struct Resource {
    locked: bool,
    wanted: bool,
}

impl Resource {
    /// An unlocked resource.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: false,
            wanted: false,
        }
    }

    /// True while some process holds the resource.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

/// Acquires `res`, sleeping on contention.
pub fn lock_resource(table: &mut ProcTable, res: &mut Resource, channel: usize) {
    while res.locked {
        res.wanted = true;
        sleep(table, channel, SleepKind::Uninterruptible);
    }
    res.locked = true;
}

/// Releases `res` and wakes contenders.
pub fn unlock_resource(table: &mut ProcTable, res: &mut Resource, channel: usize) {
    res.locked = false;
    if res.wanted {
        res.wanted = false;
        wakeup(table, channel);
    }
}

/// Bit-area latches shared between syscall context and bottom halves.
///
/// `lock_area` returns the previous state of the requested bits, so a
/// bottom half can tell whether it interrupted a holder and defer.
#[derive(Debug, Default)]
pub struct AreaLatch(u32);

/// Bottom-half area bit.
pub const AREA_BH: u32 = 0x1;

/// Timer-callout area bit.
pub const AREA_CALLOUT: u32 = 0x2;

impl AreaLatch {
    /// An empty latch set.
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    /// Sets `bits`, returning their previous state.
    pub fn lock_area(&mut self, bits: u32) -> u32 {
        let prev = self.0 & bits;
        self.0 |= bits;
        prev
    }

    /// Clears `bits`, returning their previous state.
    pub fn unlock_area(&mut self, bits: u32) -> u32 {
        let prev = self.0 & bits;
        self.0 &= !bits;
        prev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::tests::booted;
    use crate::proc::{IDLE, INIT, ProcFlags};
    use crate::signal::SIGUSR1;

    #[test]
    fn sleep_then_wakeup_round_trip() {
        let mut t = booted();
        assert_eq!(t.current, INIT);
        let sig = sleep(&mut t, 0xCAFE, SleepKind::Interruptible);
        assert_eq!(sig, 0);
        assert_eq!(t.get(INIT).state, ProcState::Sleeping);
        assert_eq!(t.get(INIT).sleep_channel, Some(0xCAFE));
        // With init asleep the CPU fell back to idle.
        assert_eq!(t.current, IDLE);

        t.get_mut(INIT).cpu_count = 0;
        wakeup(&mut t, 0xCAFE);
        assert_eq!(t.get(INIT).state, ProcState::Running);
        assert_eq!(
            t.get(INIT).cpu_count,
            t.get(INIT).priority,
            "a wake replenishes the quantum"
        );
        assert!(t.need_resched);
        t.assert_consistent();
    }

    #[test]
    fn wakeup_on_other_channel_is_noop() {
        let mut t = booted();
        sleep(&mut t, 0x1000, SleepKind::Interruptible);
        wakeup(&mut t, 0x2000);
        assert_eq!(t.get(INIT).state, ProcState::Sleeping);
    }

    #[test]
    fn colliding_channels_wake_only_exact_matches() {
        // Two channels in the same bucket (differ by SLEEP_BUCKETS).
        let mut t = booted();
        let a = t.get_proc_free().unwrap();
        t.get_mut(a).pid = 5;
        t.get_mut(a).ppid = 1;
        t.runnable(a);

        let c1 = 0x40;
        let c2 = 0x40 + crate::config::SLEEP_BUCKETS;
        sleep(&mut t, c1, SleepKind::Interruptible); // init sleeps on c1
        t.current = a;
        sleep(&mut t, c2, SleepKind::Interruptible); // a sleeps on c2

        wakeup(&mut t, c2);
        assert_eq!(t.get(a).state, ProcState::Running);
        assert_eq!(t.get(INIT).state, ProcState::Sleeping);
    }

    #[test]
    fn pending_signal_preempts_interruptible_sleep() {
        let mut t = booted();
        crate::signal::send_sig(&mut t, INIT, SIGUSR1).unwrap();
        // Default disposition for SIGUSR1 terminates, so it is
        // deliverable and the sleep must not happen.
        let sig = sleep(&mut t, 0xBEEF, SleepKind::Interruptible);
        assert_eq!(sig, SIGUSR1);
        assert_eq!(t.get(INIT).state, ProcState::Running);
    }

    #[test]
    fn uninterruptible_sleep_ignores_signals() {
        let mut t = booted();
        let sig = sleep(&mut t, 0xD00D, SleepKind::Uninterruptible);
        assert_eq!(sig, 0);
        assert!(t.get(INIT).flags.contains(ProcFlags::NOTINTERRUPT));

        // A targeted wake (signal path) must not disturb it.
        wakeup_proc(&mut t, INIT);
        assert_eq!(t.get(INIT).state, ProcState::Sleeping);

        // An explicit channel wakeup does, and clears the flag.
        wakeup(&mut t, 0xD00D);
        assert_eq!(t.get(INIT).state, ProcState::Running);
        assert!(!t.get(INIT).flags.contains(ProcFlags::NOTINTERRUPT));
    }

    #[test]
    fn resource_contention_marks_wanted() {
        let mut t = booted();
        let mut res = Resource::new();
        lock_resource(&mut t, &mut res, 0x9999);
        assert!(res.is_locked());
        unlock_resource(&mut t, &mut res, 0x9999);
        assert!(!res.is_locked());
    }

    #[test]
    fn area_latch_reports_previous_state() {
        let mut area = AreaLatch::new();
        assert_eq!(area.lock_area(AREA_BH), 0);
        assert_eq!(area.lock_area(AREA_BH), AREA_BH, "second take sees it held");
        assert_eq!(area.unlock_area(AREA_BH), AREA_BH);
        assert_eq!(area.unlock_area(AREA_BH), 0);
    }
}
