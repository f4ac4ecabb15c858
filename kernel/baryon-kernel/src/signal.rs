//! Signal generation, masking and delivery.
//!
//! Pending and blocked sets are 32-bit masks indexed by signal number
//! (bit N-1 for signal N). Generation (`send_sig`) drops effectively
//! ignored signals at the source, handles the SIGCONT/stop interplay,
//! and wakes interruptible sleepers. Selection (`issig`) returns the
//! lowest deliverable signal. Delivery (`prepare_delivery`) computes
//! the user-stack handler frame — whose return address is the
//! trampoline that issues `sigreturn` — and applies the handler mask;
//! the architecture layer writes the frame out.

use baryon_core::{Errno, Result};
use bitflags::bitflags;

use crate::proc::sleep::wakeup_proc;
use crate::proc::{INIT, ProcFlags, ProcState, ProcTable};

/// Signals 1..=31; 32 slots with 0 unused.
pub const NSIG: usize = 32;

/// Hangup.
pub const SIGHUP: i32 = 1;
/// Interrupt.
pub const SIGINT: i32 = 2;
/// Quit (core).
pub const SIGQUIT: i32 = 3;
/// Illegal instruction (core).
pub const SIGILL: i32 = 4;
/// Trace trap (core).
pub const SIGTRAP: i32 = 5;
/// Abort (core).
pub const SIGABRT: i32 = 6;
/// Bus error (core).
pub const SIGBUS: i32 = 7;
/// FP exception (core).
pub const SIGFPE: i32 = 8;
/// Kill, unblockable.
pub const SIGKILL: i32 = 9;
/// User signal 1.
pub const SIGUSR1: i32 = 10;
/// Segmentation violation (core).
pub const SIGSEGV: i32 = 11;
/// User signal 2.
pub const SIGUSR2: i32 = 12;
/// Broken pipe.
pub const SIGPIPE: i32 = 13;
/// Alarm clock.
pub const SIGALRM: i32 = 14;
/// Software termination.
pub const SIGTERM: i32 = 15;
/// Stack fault.
pub const SIGSTKFLT: i32 = 16;
/// Child stopped or terminated.
pub const SIGCHLD: i32 = 17;
/// Continue if stopped.
pub const SIGCONT: i32 = 18;
/// Stop, unblockable.
pub const SIGSTOP: i32 = 19;
/// Terminal stop.
pub const SIGTSTP: i32 = 20;
/// Background read.
pub const SIGTTIN: i32 = 21;
/// Background write.
pub const SIGTTOU: i32 = 22;
/// Urgent socket data.
pub const SIGURG: i32 = 23;
/// CPU limit exceeded (core).
pub const SIGXCPU: i32 = 24;
/// File-size limit exceeded (core).
pub const SIGXFSZ: i32 = 25;
/// Virtual alarm.
pub const SIGVTALRM: i32 = 26;
/// Profiling alarm.
pub const SIGPROF: i32 = 27;
/// Window size change.
pub const SIGWINCH: i32 = 28;
/// Async I/O.
pub const SIGIO: i32 = 29;
/// Power failure.
pub const SIGPWR: i32 = 30;
/// Unused / bad syscall (core).
pub const SIGUNUSED: i32 = 31;

/// Bit for signal `n`.
#[must_use]
pub const fn sigmask(n: i32) -> u32 {
    1 << (n - 1)
}

/// Signals that may be blocked: everything but KILL and STOP.
pub const SIG_BLOCKABLE: u32 = !(sigmask(SIGKILL) | sigmask(SIGSTOP));

const STOP_SIGNALS: u32 =
    sigmask(SIGSTOP) | sigmask(SIGTSTP) | sigmask(SIGTTIN) | sigmask(SIGTTOU);

bitflags! {
    /// `sigaction` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaFlags: u32 {
        /// No SIGCHLD when children stop.
        const NOCLDSTOP = 0x0000_0001;
        /// Do not turn children into zombies.
        const NOCLDWAIT = 0x0000_0002;
        /// Run the handler on the alternate stack.
        const ONSTACK = 0x0800_0000;
        /// Restart interrupted syscalls instead of EINTR.
        const RESTART = 0x1000_0000;
        /// Do not block the signal during its own handler.
        const NODEFER = 0x4000_0000;
        /// Reset to the default disposition on delivery.
        const RESETHAND = 0x8000_0000;
    }
}

/// Where a signal goes when it is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handler {
    /// The per-signal default action.
    #[default]
    Default,
    /// Discard.
    Ignore,
    /// A user handler at this address.
    User(u32),
}

/// One signal's disposition.
#[derive(Debug, Clone, Copy, Default)]
pub struct SigAction {
    /// What happens on delivery.
    pub handler: Handler,
    /// Signals additionally blocked while the handler runs.
    pub mask: u32,
    /// Behavior flags.
    pub flags: SaFlags,
    /// User-supplied return stub; 0 means the kernel trampoline.
    pub restorer: u32,
}

impl Default for SaFlags {
    fn default() -> Self {
        SaFlags::empty()
    }
}

/// Saved processor state at the moment a signal (or trap) interrupted
/// the process; the i386 `sigcontext` layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SigContext {
    /// Segment registers.
    pub gs: u32,
    /// Segment registers.
    pub fs: u32,
    /// Segment registers.
    pub es: u32,
    /// Segment registers.
    pub ds: u32,
    /// General registers, pusha order.
    pub edi: u32,
    /// General registers, pusha order.
    pub esi: u32,
    /// General registers, pusha order.
    pub ebp: u32,
    /// Kernel ESP at trap time.
    pub esp: u32,
    /// General registers, pusha order.
    pub ebx: u32,
    /// General registers, pusha order.
    pub edx: u32,
    /// General registers, pusha order.
    pub ecx: u32,
    /// Syscall number / return value register.
    pub eax: u32,
    /// Trap number.
    pub trapno: u32,
    /// Error code pushed by the CPU.
    pub err: u32,
    /// Faulting / resume instruction pointer.
    pub eip: u32,
    /// Code segment.
    pub cs: u32,
    /// Flags.
    pub eflags: u32,
    /// User ESP at trap time.
    pub esp_at_signal: u32,
    /// Stack segment.
    pub ss: u32,
    /// The blocked mask before delivery, restored by `sigreturn`.
    pub oldmask: u32,
}

/// What the default action of a signal is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    /// Kill the process.
    Terminate,
    /// Kill the process and flag a core dump.
    CoreDump,
    /// Stop the process.
    Stop,
    /// Continue a stopped process.
    Continue,
    /// Do nothing.
    Ignore,
}

/// SUSv2 default action per signal.
#[must_use]
pub fn default_action(sig: i32) -> DefaultAction {
    match sig {
        SIGQUIT | SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGXCPU | SIGXFSZ
        | SIGUNUSED => DefaultAction::CoreDump,
        SIGCHLD | SIGURG | SIGWINCH | SIGPWR => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        _ => DefaultAction::Terminate,
    }
}

fn effectively_ignored(table: &ProcTable, slot: usize, sig: i32) -> bool {
    match table.get(slot).sigactions[sig as usize].handler {
        Handler::Ignore => true,
        Handler::Default => default_action(sig) == DefaultAction::Ignore,
        Handler::User(_) => false,
    }
}

/// Raises `sig` on the process in `slot`.
///
/// Effectively ignored signals (except SIGCHLD, which `wait` may be
/// watching for) are dropped at the source. SIGCONT resumes a stopped
/// target and clears pending stop signals; a stop signal clears a
/// pending SIGCONT. An interruptible sleeper is woken.
pub fn send_sig(table: &mut ProcTable, slot: usize, sig: i32) -> Result<()> {
    if !(1..NSIG as i32).contains(&sig) {
        return Err(Errno::EINVAL);
    }
    let state = table.get(slot).state;
    if state == ProcState::Unused || state == ProcState::Zombie {
        return Err(Errno::ESRCH);
    }
    if table.get(slot).flags.contains(ProcFlags::KPROC) {
        return Ok(());
    }

    if effectively_ignored(table, slot, sig) && sig != SIGCHLD {
        return Ok(());
    }

    if sig == SIGCONT {
        table.get_mut(slot).sigpending &= !STOP_SIGNALS;
        if table.get(slot).state == ProcState::Stopped {
            let p = table.get_mut(slot);
            p.cpu_count = p.priority;
            table.runnable(slot);
            table.need_resched = true;
        }
    }
    if sigmask(sig) & STOP_SIGNALS != 0 {
        table.get_mut(slot).sigpending &= !sigmask(SIGCONT);
    }

    table.get_mut(slot).sigpending |= sigmask(sig);

    if table.get(slot).state == ProcState::Sleeping
        && !table.get(slot).flags.contains(ProcFlags::NOTINTERRUPT)
    {
        wakeup_proc(table, slot);
    }
    Ok(())
}

/// Returns the lowest-numbered deliverable signal for `slot`, or 0.
///
/// A deliverable signal is pending, not blocked, not already executing
/// its handler, and not destined to be ignored by default. Signals the
/// default would ignore are discarded here, which keeps the pending
/// set free of them.
pub fn issig(table: &mut ProcTable, slot: usize) -> i32 {
    if table.get(slot).flags.contains(ProcFlags::KPROC) {
        return 0;
    }
    for sig in 1..NSIG as i32 {
        let bit = sigmask(sig);
        let p = table.get(slot);
        if p.sigpending & bit == 0 {
            continue;
        }
        if p.sigblocked & bit != 0 || p.sigexecuting & bit != 0 {
            continue;
        }
        if p.sigactions[sig as usize].handler == Handler::Default
            && default_action(sig) == DefaultAction::Ignore
            && sig != SIGCHLD
        {
            table.get_mut(slot).sigpending &= !bit;
            continue;
        }
        return sig;
    }
    0
}

/// The handler frame the architecture layer writes to the user stack.
#[derive(Debug, Clone, Copy)]
pub struct SigFrame {
    /// Handler entry point.
    pub handler: u32,
    /// The signal number, the handler's argument.
    pub signum: i32,
    /// Return address for the handler: the trampoline (or the
    /// `sa_restorer` stub the process registered).
    pub ret: u32,
    /// The context to restore at `sigreturn`.
    pub context: SigContext,
}

/// What delivering a signal amounts to.
#[derive(Debug, Clone, Copy)]
pub enum Disposition {
    /// Push this frame and enter the handler.
    HandlerFrame(SigFrame),
    /// Kill the process; `core` flags a dump.
    Terminate {
        /// Whether the default action requests a core dump.
        core: bool,
    },
    /// Stop the process and notify the parent.
    Stop,
    /// Nothing to do.
    Ignored,
}

/// Delivers `sig` to the current process: clears the pending bit and
/// decides between a handler frame and a default action.
///
/// `context` is the trap frame the signal interrupts; `trampoline` is
/// the per-process address of the kernel return stub.
pub fn prepare_delivery(
    table: &mut ProcTable,
    slot: usize,
    sig: i32,
    context: &SigContext,
    trampoline: u32,
) -> Disposition {
    let bit = sigmask(sig);
    table.get_mut(slot).sigpending &= !bit;

    let action = table.get(slot).sigactions[sig as usize];
    match action.handler {
        Handler::Ignore => Disposition::Ignored,
        Handler::Default => match default_action(sig) {
            DefaultAction::Ignore | DefaultAction::Continue => Disposition::Ignored,
            DefaultAction::Terminate => Disposition::Terminate { core: false },
            DefaultAction::CoreDump => Disposition::Terminate { core: true },
            DefaultAction::Stop => Disposition::Stop,
        },
        Handler::User(handler) => {
            let p = table.get_mut(slot);
            let mut saved = *context;
            saved.oldmask = p.sigblocked;
            p.sigcontexts[sig as usize] = saved;

            let mut add = action.mask & SIG_BLOCKABLE;
            if !action.flags.contains(SaFlags::NODEFER) {
                add |= bit;
            }
            p.sigexecuting |= add;
            p.sigblocked |= add;

            if action.flags.contains(SaFlags::RESETHAND) {
                p.sigactions[sig as usize].handler = Handler::Default;
            }

            let ret = if action.restorer != 0 {
                action.restorer
            } else {
                trampoline
            };
            Disposition::HandlerFrame(SigFrame {
                handler,
                signum: sig,
                ret,
                context: saved,
            })
        }
    }
}

/// `sigreturn`: restores the context saved when `sig` was delivered.
///
/// Un-blocks what delivery blocked, clears the executing bits, and
/// hands back the context plus the syscall result that was in flight
/// (so an interrupted syscall propagates `EINTR` or restarts).
pub fn sigreturn(table: &mut ProcTable, slot: usize, sig: i32) -> Result<(SigContext, isize)> {
    if !(1..NSIG as i32).contains(&sig) {
        return Err(Errno::EINVAL);
    }
    let saved = table.get(slot).sigcontexts[sig as usize];
    let p = table.get_mut(slot);
    p.sigblocked = saved.oldmask & SIG_BLOCKABLE;
    p.sigexecuting &= saved.oldmask;
    let result = p.saved_result;
    Ok((saved, result))
}

/// Permission rule for `kill(2)`: root, or a real/effective uid match
/// with the target's real/saved uid.
fn may_signal(table: &ProcTable, sender: usize, target: usize) -> bool {
    let s = table.get(sender);
    let t = table.get(target);
    s.cred.euid == 0
        || s.cred.euid == t.cred.uid
        || s.cred.uid == t.cred.uid
        || s.cred.euid == t.suid
}

/// The `kill(2)` fan-out.
///
/// `pid > 0` one process; `pid == 0` the sender's process group;
/// `pid == -1` everyone except init and the sender; `pid < -1` the
/// process group `-pid`. `sig == 0` probes permissions only.
pub fn kill(table: &mut ProcTable, sender: usize, pid: i32, sig: i32) -> Result<()> {
    if !(0..NSIG as i32).contains(&sig) {
        return Err(Errno::EINVAL);
    }

    let deliver = |table: &mut ProcTable, slot: usize| -> Result<()> {
        if !may_signal(table, sender, slot) {
            return Err(Errno::EPERM);
        }
        if sig != 0 {
            send_sig(table, slot, sig)?;
        }
        Ok(())
    };

    if pid > 0 {
        let slot = table.find_pid(pid).ok_or(Errno::ESRCH)?;
        deliver(table, slot)
    } else {
        let init_pid = table.get(INIT).pid;
        let sender_pid = table.get(sender).pid;
        let pgrp = if pid == 0 {
            Some(table.get(sender).pgid)
        } else if pid < -1 {
            Some(-pid)
        } else {
            None // -1: everyone
        };
        let targets: alloc::vec::Vec<usize> = table
            .live_slots()
            .filter(|&s| {
                let p = table.get(s);
                if p.state == ProcState::Zombie {
                    return false;
                }
                match pgrp {
                    Some(g) => p.pgid == g,
                    None => p.pid != init_pid && p.pid != sender_pid,
                }
            })
            .collect();
        let mut hit = false;
        let mut denied = false;
        for slot in targets {
            match deliver(table, slot) {
                Ok(()) => hit = true,
                Err(Errno::EPERM) => denied = true,
                Err(_) => {}
            }
        }
        if hit {
            Ok(())
        } else if denied {
            Err(Errno::EPERM)
        } else {
            Err(Errno::ESRCH)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::tests::booted;

    fn spawn(t: &mut ProcTable, pid: i32) -> usize {
        let s = t.get_proc_free().unwrap();
        t.get_mut(s).pid = pid;
        t.get_mut(s).ppid = 1;
        t.get_mut(s).pgid = pid;
        t.get_mut(s).sid = 1;
        t.runnable(s);
        s
    }

    #[test]
    fn ignored_signals_are_dropped_at_source() {
        let mut t = booted();
        let s = spawn(&mut t, 5);
        // SIGWINCH defaults to ignore.
        send_sig(&mut t, s, SIGWINCH).unwrap();
        assert_eq!(t.get(s).sigpending, 0, "default-ignored must not pend");

        t.get_mut(s).sigactions[SIGTERM as usize].handler = Handler::Ignore;
        send_sig(&mut t, s, SIGTERM).unwrap();
        assert_eq!(t.get(s).sigpending, 0, "explicitly ignored must not pend");

        // SIGCHLD pends regardless, for wait4.
        send_sig(&mut t, s, SIGCHLD).unwrap();
        assert_eq!(t.get(s).sigpending, sigmask(SIGCHLD));
    }

    #[test]
    fn issig_returns_lowest_unblocked() {
        let mut t = booted();
        let s = spawn(&mut t, 5);
        send_sig(&mut t, s, SIGTERM).unwrap();
        send_sig(&mut t, s, SIGHUP).unwrap();
        assert_eq!(issig(&mut t, s), SIGHUP);

        t.get_mut(s).sigblocked = sigmask(SIGHUP);
        assert_eq!(issig(&mut t, s), SIGTERM);
    }

    #[test]
    fn sigcont_resumes_stopped_and_clears_stops() {
        let mut t = booted();
        let s = spawn(&mut t, 5);
        t.not_runnable(s, ProcState::Stopped);
        t.get_mut(s).sigpending = sigmask(SIGTSTP);

        send_sig(&mut t, s, SIGCONT).unwrap();
        assert_eq!(t.get(s).state, ProcState::Running);
        assert_eq!(t.get(s).sigpending & STOP_SIGNALS, 0);

        // And the reverse: a stop signal clears a pending SIGCONT.
        t.get_mut(s).sigactions[SIGCONT as usize].handler = Handler::User(0x1000);
        send_sig(&mut t, s, SIGCONT).unwrap();
        send_sig(&mut t, s, SIGSTOP).unwrap();
        assert_eq!(t.get(s).sigpending & sigmask(SIGCONT), 0);
    }

    #[test]
    fn sleeping_target_wakes_for_delivery() {
        let mut t = booted();
        // init sleeps interruptibly.
        crate::proc::sleep::sleep(
            &mut t,
            0xAA,
            crate::proc::sleep::SleepKind::Interruptible,
        );
        assert_eq!(t.get(crate::proc::INIT).state, ProcState::Sleeping);
        send_sig(&mut t, crate::proc::INIT, SIGTERM).unwrap();
        assert_eq!(t.get(crate::proc::INIT).state, ProcState::Running);
    }

    #[test]
    fn handler_mask_applies_during_delivery() {
        let mut t = booted();
        let s = spawn(&mut t, 5);
        t.get_mut(s).sigactions[SIGUSR1 as usize] = SigAction {
            handler: Handler::User(0x0804_9000),
            mask: sigmask(SIGUSR2),
            flags: SaFlags::empty(),
            restorer: 0,
        };
        send_sig(&mut t, s, SIGUSR1).unwrap();
        let ctx = SigContext {
            eip: 0x0804_8000,
            esp_at_signal: 0xBFFF_F000,
            ..SigContext::default()
        };
        let d = prepare_delivery(&mut t, s, SIGUSR1, &ctx, 0xB000_0000);
        let frame = match d {
            Disposition::HandlerFrame(f) => f,
            other => panic!("expected a handler frame, got {other:?}"),
        };
        assert_eq!(frame.handler, 0x0804_9000);
        assert_eq!(frame.signum, SIGUSR1);
        assert_eq!(frame.ret, 0xB000_0000, "kernel trampoline is the return");

        // Executing = {USR1, USR2}; both blocked; executing ⊆ blocked.
        let p = t.get(s);
        assert_eq!(p.sigexecuting, sigmask(SIGUSR1) | sigmask(SIGUSR2));
        assert_eq!(p.sigexecuting & !p.sigblocked, 0);

        // A second SIGUSR1 pends but is not deliverable.
        send_sig(&mut t, s, SIGUSR1).unwrap();
        assert_eq!(issig(&mut t, s), 0);

        // sigreturn restores the context and the old mask; the pending
        // SIGUSR1 becomes deliverable.
        let (restored, _) = sigreturn(&mut t, s, SIGUSR1).unwrap();
        assert_eq!(restored.eip, 0x0804_8000);
        assert_eq!(t.get(s).sigexecuting, 0);
        assert_eq!(t.get(s).sigblocked, 0);
        assert_eq!(issig(&mut t, s), SIGUSR1);
    }

    #[test]
    fn nodefer_and_resethand() {
        let mut t = booted();
        let s = spawn(&mut t, 5);
        t.get_mut(s).sigactions[SIGUSR1 as usize] = SigAction {
            handler: Handler::User(0x1000),
            mask: 0,
            flags: SaFlags::NODEFER | SaFlags::RESETHAND,
            restorer: 0,
        };
        send_sig(&mut t, s, SIGUSR1).unwrap();
        let ctx = SigContext::default();
        let _ = prepare_delivery(&mut t, s, SIGUSR1, &ctx, 0xB000_0000);
        // NODEFER: the signal itself is not blocked.
        assert_eq!(t.get(s).sigexecuting & sigmask(SIGUSR1), 0);
        // RESETHAND: disposition back to default after one shot.
        assert_eq!(
            t.get(s).sigactions[SIGUSR1 as usize].handler,
            Handler::Default
        );
    }

    #[test]
    fn default_actions_classify() {
        assert_eq!(default_action(SIGSEGV), DefaultAction::CoreDump);
        assert_eq!(default_action(SIGTERM), DefaultAction::Terminate);
        assert_eq!(default_action(SIGSTOP), DefaultAction::Stop);
        assert_eq!(default_action(SIGCONT), DefaultAction::Continue);
        assert_eq!(default_action(SIGCHLD), DefaultAction::Ignore);
    }

    #[test]
    fn kill_minus_one_spares_init_and_caller() {
        let mut t = booted();
        let a = spawn(&mut t, 5);
        let b = spawn(&mut t, 6);
        // Caller is `a`.
        kill(&mut t, a, -1, SIGTERM).unwrap();
        assert_eq!(t.get(a).sigpending, 0, "caller spared");
        assert_eq!(
            t.get(crate::proc::INIT).sigpending & sigmask(SIGTERM),
            0,
            "init spared"
        );
        assert_eq!(t.get(b).sigpending & sigmask(SIGTERM), sigmask(SIGTERM));
    }

    #[test]
    fn kill_pgrp_and_permission() {
        let mut t = booted();
        let a = spawn(&mut t, 5);
        let b = spawn(&mut t, 6);
        t.get_mut(b).pgid = 5;
        // Unprivileged sender with a different uid.
        let sender = spawn(&mut t, 7);
        t.get_mut(sender).cred.uid = 1000;
        t.get_mut(sender).cred.euid = 1000;
        assert_eq!(kill(&mut t, sender, 5, SIGTERM).unwrap_err(), Errno::EPERM);

        // Group kill from a root-owned process reaches both members.
        kill(&mut t, crate::proc::INIT, -5, SIGTERM).unwrap();
        assert_ne!(t.get(a).sigpending & sigmask(SIGTERM), 0);
        assert_ne!(t.get(b).sigpending & sigmask(SIGTERM), 0);

        // Probe with signal 0: permission only, nothing pends.
        let before = t.get(a).sigpending;
        kill(&mut t, crate::proc::INIT, 5, 0).unwrap();
        assert_eq!(t.get(a).sigpending, before);

        // Nonexistent pid.
        assert_eq!(
            kill(&mut t, crate::proc::INIT, 999, SIGTERM).unwrap_err(),
            Errno::ESRCH
        );
    }
}
