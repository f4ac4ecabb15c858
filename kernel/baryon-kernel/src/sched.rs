//! The round-robin scheduler.
//!
//! Every process carries a `priority` (its full quantum in ticks) and
//! `cpu_count`, the ticks it has left. Selection picks the runnable
//! process with the most quantum remaining; when everyone is at zero,
//! all runnable processes are replenished and the scan repeats. The
//! idle process runs when nothing else can.

use crate::kstat::KSTAT;
use crate::proc::{IDLE, ProcTable};
use core::sync::atomic::Ordering;

/// Picks the next process and switches to it.
///
/// Called from explicit yield points: sleeping, return-to-user with
/// `need_resched` set, and exit. If the choice is the current process,
/// no switch happens.
pub fn do_sched(table: &mut ProcTable) {
    table.need_resched = false;

    let selected = loop {
        let mut count = -1;
        let mut selected = IDLE;
        for slot in table.run_list() {
            if table.get(slot).cpu_count > count {
                count = table.get(slot).cpu_count;
                selected = slot;
            }
        }
        if count != 0 {
            break selected;
        }
        // Every runnable process exhausted its quantum: replenish.
        let runnable: alloc::vec::Vec<usize> = table.run_list().collect();
        for slot in runnable {
            let p = table.get_mut(slot);
            p.cpu_count = p.priority;
        }
    };

    if selected != table.current {
        context_switch(table, selected);
    }
}

/// Swaps the CPU to `next`: bookkeeping here, register state in the
/// architecture layer.
fn context_switch(table: &mut ProcTable, next: usize) {
    KSTAT.ctxt.fetch_add(1, Ordering::Relaxed);
    let prev = table.current;
    table.current = next;

    #[cfg(all(target_os = "none", target_arch = "x86"))]
    {
        let next_task = table.get(next).task;
        let prev_task: *mut crate::proc::TaskState = &raw mut table.get_mut(prev).task;
        // SAFETY: Both slots are live table entries; the switch runs
        // with interrupts disabled and returns when this process is
        // scheduled again.
        unsafe {
            crate::arch::switch::switch_to(prev_task, &next_task);
        }
    }
    #[cfg(not(all(target_os = "none", target_arch = "x86")))]
    {
        // Host build: selection and accounting only; control returns to
        // the caller immediately.
        let _ = prev;
    }
}

/// Timer-tick hook: charge the current process one tick and flag a
/// reschedule when its quantum runs out.
pub fn tick(table: &mut ProcTable) {
    let p = table.current_mut();
    if p.cpu_count > 0 {
        p.cpu_count -= 1;
    }
    if p.cpu_count == 0 {
        table.need_resched = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEF_PRIORITY;
    use crate::proc::tests::booted;
    use crate::proc::{INIT, ProcState};

    fn spawn_runnable(t: &mut ProcTable, pid: i32, quantum: i32) -> usize {
        let s = t.get_proc_free().unwrap();
        t.get_mut(s).pid = pid;
        t.get_mut(s).ppid = 1;
        t.get_mut(s).cpu_count = quantum;
        t.runnable(s);
        s
    }

    #[test]
    fn picks_largest_remaining_quantum() {
        let mut t = booted();
        t.get_mut(INIT).cpu_count = 5;
        let fat = spawn_runnable(&mut t, 2, 15);
        let _thin = spawn_runnable(&mut t, 3, 3);

        do_sched(&mut t);
        assert_eq!(t.current, fat);
        assert!(!t.need_resched);
    }

    #[test]
    fn replenishes_when_all_quanta_are_zero() {
        let mut t = booted();
        t.get_mut(INIT).cpu_count = 0;
        let other = spawn_runnable(&mut t, 2, 0);

        do_sched(&mut t);
        assert_eq!(t.get(INIT).cpu_count, DEF_PRIORITY);
        assert_eq!(t.get(other).cpu_count, DEF_PRIORITY);
        assert_ne!(t.current, IDLE, "someone runnable must be chosen");
    }

    #[test]
    fn idles_when_nothing_is_runnable() {
        let mut t = booted();
        t.not_runnable(INIT, ProcState::Sleeping);
        t.get_mut(INIT).sleep_channel = Some(1);
        // Re-link into the hash so the invariant holds.
        t.get_mut(INIT).sleep_channel = None;
        t.sleep_insert(INIT, 1);

        do_sched(&mut t);
        assert_eq!(t.current, IDLE);
        t.assert_consistent();
    }

    #[test]
    fn quantum_depletion_requests_resched() {
        let mut t = booted();
        t.get_mut(INIT).cpu_count = 2;
        tick(&mut t);
        assert!(!t.need_resched);
        tick(&mut t);
        assert!(t.need_resched, "hitting zero flags a reschedule");
    }

    #[test]
    fn context_switches_are_counted() {
        use core::sync::atomic::Ordering;
        let mut t = booted();
        let before = KSTAT.ctxt.load(Ordering::Relaxed);
        let other = spawn_runnable(&mut t, 2, 30);
        do_sched(&mut t);
        assert_eq!(t.current, other);
        assert!(KSTAT.ctxt.load(Ordering::Relaxed) > before);
    }
}
