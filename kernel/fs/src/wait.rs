//! Blocking seam between the VFS and the process layer.
//!
//! The VFS sleeps on wait channels (buffer completion, locked inodes,
//! full pipes) but cannot depend on the process crate without a cycle,
//! so the kernel installs the scheduler's `sleep`/`wakeup` pair here at
//! boot, the same way the console function is registered with the
//! logger. Before installation — and on the host, where drivers
//! complete synchronously — sleeping reports an interrupt so callers
//! bail out instead of spinning.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Channel-identity base for inode locks (offset by slot index).
pub const CHANNEL_INODE_BASE: usize = 0x4940_0000;

/// Channel-identity base for buffer locks (offset by buffer index).
pub const CHANNEL_BUFFER_BASE: usize = 0x4250_0000;

/// Channel-identity base for pipe ends (offset by 2 × pipe index).
pub const CHANNEL_PIPE_BASE: usize = 0x5049_0000;

/// Channel identity of the open-file-table resource lock.
pub const CHANNEL_FILE_TABLE: usize = 0x4644_0000;

/// Channel identity `select(2)` sleepers share; drivers wake it on any
/// readiness change.
pub const CHANNEL_SELECT: usize = 0x534C_0000;

/// Sleep on `channel`; returns 0 on a normal wakeup or the interrupting
/// signal number for interruptible sleeps.
pub type SleepFn = fn(channel: usize, interruptible: bool) -> i32;

/// Wake every process sleeping on `channel`.
pub type WakeFn = fn(channel: usize);

fn null_sleep(_channel: usize, _interruptible: bool) -> i32 {
    // No scheduler: report an interrupt so the caller unwinds.
    1
}

fn null_wake(_channel: usize) {}

static SLEEP_FN: AtomicPtr<()> = AtomicPtr::new(null_sleep as *mut ());
static WAKE_FN: AtomicPtr<()> = AtomicPtr::new(null_wake as *mut ());

/// Installs the scheduler's sleep and wakeup entry points.
///
/// # Safety
///
/// Both functions must stay valid for the kernel's lifetime and be
/// callable from any non-interrupt context.
pub unsafe fn init(sleep: SleepFn, wake: WakeFn) {
    SLEEP_FN.store(sleep as *mut (), Ordering::Release);
    WAKE_FN.store(wake as *mut (), Ordering::Release);
}

/// Sleeps uninterruptibly on `channel`.
pub fn sleep_on(channel: usize) {
    let f = SLEEP_FN.load(Ordering::Acquire);
    // SAFETY: Only valid SleepFn pointers are stored.
    let f: SleepFn = unsafe { core::mem::transmute(f) };
    f(channel, false);
}

/// Sleeps interruptibly on `channel`; returns the signal number that
/// interrupted the sleep, or 0.
pub fn sleep_on_interruptible(channel: usize) -> i32 {
    let f = SLEEP_FN.load(Ordering::Acquire);
    // SAFETY: Only valid SleepFn pointers are stored.
    let f: SleepFn = unsafe { core::mem::transmute(f) };
    f(channel, true)
}

/// Wakes every sleeper on `channel`.
pub fn wake_up(channel: usize) {
    let f = WAKE_FN.load(Ordering::Acquire);
    // SAFETY: Only valid WakeFn pointers are stored.
    let f: WakeFn = unsafe { core::mem::transmute(f) };
    f(channel);
}
