//! The process table.
//!
//! A fixed arena of [`NR_PROCS`] slots; the run list and the sleep-hash
//! chains are index links threaded through the records. Slot 0 is the
//! idle process (PID 0), slot 1 is init (PID 1). A process's slot
//! outlives its death as a zombie until the parent reaps it with
//! `wait4`, at which point the slot returns to `Unused`.

pub mod sleep;

use baryon_core::id::Pid;
use baryon_fs::file::FileIdx;
use baryon_fs::inode::InodeIdx;
use baryon_fs::perms::{Cred, NGROUPS_MAX};
use baryon_mm::mapper::AddressSpace;
use baryon_mm::vma::VmaTable;
use bitflags::bitflags;

use baryon_core::{Errno, Result};

use crate::config::{DEF_PRIORITY, MAX_PID_VALUE, NR_PROCS, OPEN_MAX, SLEEP_BUCKETS};
use crate::signal::{NSIG, SigAction, SigContext};

/// Wait-channel identity base for per-process channels (`wait4`,
/// `exit` notification).
pub const CHANNEL_PROC_BASE: usize = 0x5052_0000;

/// Slot of the idle process.
pub const IDLE: usize = 0;

/// Slot of init.
pub const INIT: usize = 1;

/// Scheduling and lifetime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Slot is free.
    Unused,
    /// On the run list.
    Running,
    /// Waiting on a channel.
    Sleeping,
    /// Exited, slot retained for the parent.
    Zombie,
    /// Stopped by a job-control signal.
    Stopped,
    /// The idle process.
    Idle,
}

bitflags! {
    /// Per-process flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcFlags: u32 {
        /// Kernel-internal process.
        const KPROC = 0x0001;
        /// Has performed an `execve`.
        const PEXEC = 0x0002;
        /// Permission checks use the real uid (`access(2)`).
        const USEREAL = 0x0004;
        /// Sleeping uninterruptibly; signals do not wake it.
        const NOTINTERRUPT = 0x0008;
    }
}

/// Resource-limit slots, Linux i386 numbering.
pub const RLIM_NLIMITS: usize = 10;

/// An "unlimited" resource limit.
pub const RLIM_INFINITY: u32 = u32::MAX;

/// One resource limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RLimit {
    /// Current (soft) limit.
    pub cur: u32,
    /// Maximum (hard) limit.
    pub max: u32,
}

impl Default for RLimit {
    fn default() -> Self {
        Self {
            cur: RLIM_INFINITY,
            max: RLIM_INFINITY,
        }
    }
}

/// Resource usage counters (`getrusage`, `times`).
#[derive(Debug, Clone, Copy, Default)]
pub struct Rusage {
    /// Ticks in user mode.
    pub utime: u32,
    /// Ticks in kernel mode.
    pub stime: u32,
    /// Minor page faults.
    pub minflt: u32,
    /// Major page faults.
    pub majflt: u32,
}

impl Rusage {
    /// Accumulates `other` (reaping a child).
    pub fn fold(&mut self, other: &Rusage) {
        self.utime += other.utime;
        self.stime += other.stime;
        self.minflt += other.minflt;
        self.majflt += other.majflt;
    }
}

/// Architectural task state: what the context switch saves and loads.
/// The layout is fixed — the switch assembly addresses the first two
/// fields by offset.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TaskState {
    /// Kernel stack pointer at suspension.
    pub esp: u32,
    /// Resume instruction pointer.
    pub eip: u32,
    /// Page-directory physical address.
    pub cr3: u32,
    /// Top of the kernel stack (ring-0 stack on privilege change).
    pub esp0: u32,
}

/// Close-on-exec bits, one per fd slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloexecSet([u32; OPEN_MAX / 32]);

impl CloexecSet {
    /// Sets or clears the bit for `fd`.
    pub fn set(&mut self, fd: usize, on: bool) {
        if on {
            self.0[fd / 32] |= 1 << (fd % 32);
        } else {
            self.0[fd / 32] &= !(1 << (fd % 32));
        }
    }

    /// Reads the bit for `fd`.
    #[must_use]
    pub fn get(&self, fd: usize) -> bool {
        self.0[fd / 32] & (1 << (fd % 32)) != 0
    }
}

/// One process.
pub struct Process {
    /// Process id.
    pub pid: Pid,
    /// Parent process id.
    pub ppid: Pid,
    /// Process group id.
    pub pgid: Pid,
    /// Session id.
    pub sid: Pid,
    /// Lifetime state.
    pub state: ProcState,
    /// Flag bits.
    pub flags: ProcFlags,
    /// Credentials used by permission checks.
    pub cred: Cred,
    /// Saved set-user-id.
    pub suid: u16,
    /// Saved set-group-id.
    pub sgid: u16,
    /// File-creation mask.
    pub umask: u16,
    /// Per-process fd array: indexes into the global open-file table.
    pub fd: [FileIdx; OPEN_MAX],
    /// Close-on-exec flags, parallel to `fd`.
    pub cloexec: CloexecSet,
    /// Root directory for path resolution.
    pub root: Option<InodeIdx>,
    /// Working directory.
    pub cwd: Option<InodeIdx>,
    /// Virtual memory regions.
    pub vmas: VmaTable,
    /// The page directory.
    pub space: Option<AddressSpace>,
    /// Signals raised but not yet delivered (bit N-1 = signal N).
    pub sigpending: u32,
    /// Signals blocked from delivery.
    pub sigblocked: u32,
    /// Signals whose handlers are on the stack right now.
    pub sigexecuting: u32,
    /// Disposition per signal.
    pub sigactions: [SigAction; NSIG],
    /// Saved context per signal, restored by `sigreturn`.
    pub sigcontexts: [SigContext; NSIG],
    /// The in-flight syscall result a signal interrupted.
    pub saved_result: isize,
    /// Scheduling priority (the full quantum, in ticks).
    pub priority: i32,
    /// Remaining quantum.
    pub cpu_count: i32,
    /// Channel this process sleeps on.
    pub sleep_channel: Option<usize>,
    /// Ticks until a timed sleep expires (0 = none).
    pub timeout: u32,
    /// Distinguishes a timeout wake from a real one.
    pub timed_out: bool,
    /// `alarm`/`setitimer` real timer: remaining ticks and reload.
    pub it_real: (u32, u32),
    /// Virtual interval timer: remaining and reload.
    pub it_virt: (u32, u32),
    /// Profiling interval timer: remaining and reload.
    pub it_prof: (u32, u32),
    /// Resource limits.
    pub rlim: [RLimit; RLIM_NLIMITS],
    /// Own usage.
    pub usage: Rusage,
    /// Reaped children's usage.
    pub cusage: Rusage,
    /// Exit code (valid for zombies): status byte and signal byte.
    pub exit_code: i32,
    /// Tick of creation.
    pub start_time: u32,
    /// Architectural context.
    pub task: TaskState,
    pub(crate) next_run: Option<u32>,
    pub(crate) prev_run: Option<u32>,
    pub(crate) next_sleep: Option<u32>,
    pub(crate) prev_sleep: Option<u32>,
}

impl Default for Process {
    fn default() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            pgid: 0,
            sid: 0,
            state: ProcState::Unused,
            flags: ProcFlags::empty(),
            cred: Cred {
                uid: 0,
                euid: 0,
                gid: 0,
                egid: 0,
                groups: [0; NGROUPS_MAX],
                ngroups: 0,
            },
            suid: 0,
            sgid: 0,
            umask: 0o022,
            fd: [FileIdx::NONE; OPEN_MAX],
            cloexec: CloexecSet::default(),
            root: None,
            cwd: None,
            vmas: VmaTable::new(),
            space: None,
            sigpending: 0,
            sigblocked: 0,
            sigexecuting: 0,
            sigactions: [SigAction::default(); NSIG],
            sigcontexts: [SigContext::default(); NSIG],
            saved_result: 0,
            priority: DEF_PRIORITY,
            cpu_count: DEF_PRIORITY,
            sleep_channel: None,
            timeout: 0,
            timed_out: false,
            it_real: (0, 0),
            it_virt: (0, 0),
            it_prof: (0, 0),
            rlim: [RLimit::default(); RLIM_NLIMITS],
            usage: Rusage::default(),
            cusage: Rusage::default(),
            exit_code: 0,
            start_time: 0,
            task: TaskState::default(),
            next_run: None,
            prev_run: None,
            next_sleep: None,
            prev_sleep: None,
        }
    }
}

impl Process {
    /// True for session leaders.
    #[must_use]
    pub fn is_session_leader(&self) -> bool {
        self.pid == self.pgid && self.pid == self.sid
    }

    /// The wait channel other processes use to wait for this one.
    #[must_use]
    pub fn channel(slot: usize) -> usize {
        CHANNEL_PROC_BASE + slot
    }
}

/// The process table, run list and sleep hash.
pub struct ProcTable {
    slots: alloc::vec::Vec<Process>,
    run_head: Option<u32>,
    sleep_hash: [Option<u32>; SLEEP_BUCKETS],
    /// Slot of the process currently on the CPU.
    pub current: usize,
    /// Set when a reschedule should happen at the next return to user
    /// mode.
    pub need_resched: bool,
    last_pid: Pid,
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcTable {
    /// Creates the table with the idle process in slot 0.
    #[must_use]
    pub fn new() -> Self {
        let mut slots = alloc::vec::Vec::with_capacity(NR_PROCS);
        for _ in 0..NR_PROCS {
            slots.push(Process::default());
        }
        let mut t = Self {
            slots,
            run_head: None,
            sleep_hash: [None; SLEEP_BUCKETS],
            current: IDLE,
            need_resched: false,
            last_pid: 0,
        };
        let idle = &mut t.slots[IDLE];
        idle.state = ProcState::Idle;
        idle.pid = 0;
        idle.flags = ProcFlags::KPROC;
        t
    }

    /// Access to a slot.
    #[must_use]
    pub fn get(&self, slot: usize) -> &Process {
        &self.slots[slot]
    }

    /// Mutable access to a slot.
    pub fn get_mut(&mut self, slot: usize) -> &mut Process {
        &mut self.slots[slot]
    }

    /// The running process.
    #[must_use]
    pub fn current(&self) -> &Process {
        &self.slots[self.current]
    }

    /// The running process, mutable.
    pub fn current_mut(&mut self) -> &mut Process {
        let c = self.current;
        &mut self.slots[c]
    }

    /// Iterates the slots of live (non-`Unused`) processes.
    pub fn live_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state != ProcState::Unused)
            .map(|(i, _)| i)
    }

    /// Finds the slot holding `pid`.
    #[must_use]
    pub fn find_pid(&self, pid: Pid) -> Option<usize> {
        self.live_slots().find(|&s| self.slots[s].pid == pid)
    }

    /// Claims a free slot.
    ///
    /// Per POSIX the caller maps exhaustion to `EAGAIN`, not `ENOMEM`.
    pub fn get_proc_free(&mut self) -> Result<usize> {
        self.slots
            .iter()
            .position(|p| p.state == ProcState::Unused)
            .ok_or(Errno::EAGAIN)
    }

    /// Picks the next unused PID, scanning upward from the last one,
    /// wrapping at [`MAX_PID_VALUE`], and skipping values still alive
    /// as a pid, pgid or sid.
    pub fn get_unused_pid(&mut self) -> Pid {
        loop {
            self.last_pid += 1;
            if self.last_pid > MAX_PID_VALUE {
                self.last_pid = INIT as Pid + 1;
            }
            let candidate = self.last_pid;
            let taken = self.live_slots().any(|s| {
                let p = &self.slots[s];
                p.pid == candidate || p.pgid == candidate || p.sid == candidate
            });
            if !taken {
                return candidate;
            }
        }
    }

    // ── Run list ────────────────────────────────────────────────────

    /// Puts a process on the run list.
    pub fn runnable(&mut self, slot: usize) {
        if self.slots[slot].state == ProcState::Running {
            baryon_core::kwarn!("process {} is already running", self.slots[slot].pid);
            return;
        }
        let s = slot as u32;
        self.slots[slot].prev_run = None;
        self.slots[slot].next_run = self.run_head;
        if let Some(h) = self.run_head {
            self.slots[h as usize].prev_run = Some(s);
        }
        self.run_head = Some(s);
        self.slots[slot].state = ProcState::Running;
    }

    /// Takes a process off the run list into `state`.
    pub fn not_runnable(&mut self, slot: usize, state: ProcState) {
        let (prev, next) = (self.slots[slot].prev_run, self.slots[slot].next_run);
        if let Some(n) = next {
            self.slots[n as usize].prev_run = prev;
        }
        if let Some(p) = prev {
            self.slots[p as usize].next_run = next;
        }
        if self.run_head == Some(slot as u32) {
            self.run_head = next;
        }
        self.slots[slot].prev_run = None;
        self.slots[slot].next_run = None;
        self.slots[slot].state = state;
    }

    /// Iterates run-list members, head first.
    pub fn run_list(&self) -> impl Iterator<Item = usize> + '_ {
        RunIter {
            table: self,
            cur: self.run_head,
        }
    }

    /// Counts runnable processes (the load-average sample).
    #[must_use]
    pub fn running(&self) -> usize {
        self.run_list().count()
    }

    // ── Sleep hash plumbing (used by the sleep module) ──────────────

    pub(crate) fn bucket_of(addr: usize) -> usize {
        addr % SLEEP_BUCKETS
    }

    pub(crate) fn sleep_insert(&mut self, slot: usize, addr: usize) {
        let b = Self::bucket_of(addr);
        let s = slot as u32;
        self.slots[slot].prev_sleep = None;
        self.slots[slot].next_sleep = self.sleep_hash[b];
        if let Some(h) = self.sleep_hash[b] {
            self.slots[h as usize].prev_sleep = Some(s);
        }
        self.sleep_hash[b] = Some(s);
        self.slots[slot].sleep_channel = Some(addr);
    }

    pub(crate) fn sleep_unlink(&mut self, slot: usize) {
        let Some(addr) = self.slots[slot].sleep_channel.take() else {
            return;
        };
        let b = Self::bucket_of(addr);
        let (prev, next) = (self.slots[slot].prev_sleep, self.slots[slot].next_sleep);
        if let Some(n) = next {
            self.slots[n as usize].prev_sleep = prev;
        }
        if let Some(p) = prev {
            self.slots[p as usize].next_sleep = next;
        }
        if self.sleep_hash[b] == Some(slot as u32) {
            self.sleep_hash[b] = next;
        }
        self.slots[slot].prev_sleep = None;
        self.slots[slot].next_sleep = None;
    }

    pub(crate) fn sleepers_on(&self, addr: usize) -> alloc::vec::Vec<usize> {
        let mut out = alloc::vec::Vec::new();
        let mut cur = self.sleep_hash[Self::bucket_of(addr)];
        while let Some(i) = cur {
            if self.slots[i as usize].sleep_channel == Some(addr) {
                out.push(i as usize);
            }
            cur = self.slots[i as usize].next_sleep;
        }
        out
    }

    // ── Lifecycle helpers ───────────────────────────────────────────

    /// Reparents every child of `slot` to init.
    pub fn orphan_children(&mut self, slot: usize) {
        let pid = self.slots[slot].pid;
        let init_pid = self.slots[INIT].pid;
        for s in 0..self.slots.len() {
            if self.slots[s].state != ProcState::Unused && self.slots[s].ppid == pid {
                self.slots[s].ppid = init_pid;
            }
        }
    }

    /// Marks `slot` a zombie with `code` and takes it off the run
    /// list.
    pub fn make_zombie(&mut self, slot: usize, code: i32) {
        if self.slots[slot].state == ProcState::Running {
            self.not_runnable(slot, ProcState::Zombie);
        } else {
            self.sleep_unlink(slot);
            self.slots[slot].state = ProcState::Zombie;
        }
        self.slots[slot].exit_code = code;
    }

    /// Finds a child of `parent` matching the `wait4` pid filter:
    /// `-1` any child, `0` same process group, `> 0` that pid,
    /// `< -1` that process group.
    #[must_use]
    pub fn find_child(&self, parent: usize, pid: Pid, want: ProcState) -> Option<usize> {
        let ppid = self.slots[parent].pid;
        let pgrp = self.slots[parent].pgid;
        self.live_slots().find(|&s| {
            let p = &self.slots[s];
            if p.ppid != ppid || s == parent {
                return false;
            }
            let selected = match pid {
                -1 => true,
                0 => p.pgid == pgrp,
                n if n > 0 => p.pid == n,
                n => p.pgid == -n,
            };
            selected && p.state == want
        })
    }

    /// True if `parent` has any child the `wait4` filter selects,
    /// regardless of state.
    #[must_use]
    pub fn has_child(&self, parent: usize, pid: Pid) -> bool {
        let ppid = self.slots[parent].pid;
        let pgrp = self.slots[parent].pgid;
        self.live_slots().any(|s| {
            let p = &self.slots[s];
            if p.ppid != ppid || s == parent {
                return false;
            }
            match pid {
                -1 => true,
                0 => p.pgid == pgrp,
                n if n > 0 => p.pid == n,
                n => p.pgid == -n,
            }
        })
    }

    /// Releases a zombie's slot, folding its usage into the parent.
    /// Returns `(pid, exit_code)`.
    pub fn remove_zombie(&mut self, parent: usize, zombie: usize) -> (Pid, i32) {
        let pid = self.slots[zombie].pid;
        let code = self.slots[zombie].exit_code;
        let usage = self.slots[zombie].usage;
        self.slots[parent].cusage.fold(&usage);
        self.slots[zombie] = Process::default();
        (pid, code)
    }

    /// Verifies the run-list invariant: a process is on the run list
    /// iff its state is `Running`, and exactly slot 0 is `Idle`.
    ///
    /// # Panics
    ///
    /// Panics on the first violation.
    pub fn assert_consistent(&self) {
        let on_list: alloc::vec::Vec<usize> = self.run_list().collect();
        for s in 0..self.slots.len() {
            let running = self.slots[s].state == ProcState::Running;
            assert_eq!(
                on_list.contains(&s),
                running,
                "slot {s}: run-list membership disagrees with state"
            );
            if self.slots[s].state == ProcState::Sleeping {
                assert!(
                    self.slots[s].sleep_channel.is_some(),
                    "slot {s}: sleeping without a channel"
                );
            }
        }
        assert_eq!(self.slots[IDLE].state, ProcState::Idle, "slot 0 must idle");
        assert_eq!(self.slots[IDLE].pid, 0);
    }
}

/// The global process table.
static PROC_TABLE: crate::cell::KCell<Option<ProcTable>> = crate::cell::KCell::new(None);

/// Installs a fresh process table. Called once at boot (and per test).
pub fn init() {
    PROC_TABLE.with(|t| *t = Some(ProcTable::new()));
}

/// Tears the global table down (kexec, tests).
pub fn teardown() {
    PROC_TABLE.with(|t| *t = None);
}

/// Runs `f` with the global process table.
///
/// # Panics
///
/// Panics if the table has not been initialized.
pub fn with_proc<R>(f: impl FnOnce(&mut ProcTable) -> R) -> R {
    PROC_TABLE.with(|t| f(t.as_mut().expect("process table not initialized")))
}

struct RunIter<'a> {
    table: &'a ProcTable,
    cur: Option<u32>,
}

impl Iterator for RunIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let c = self.cur?;
        self.cur = self.table.slots[c as usize].next_run;
        Some(c as usize)
    }
}
