//! Interrupt-disabling lock for data shared with interrupt handlers.
//!
//! On the single-CPU target, masking interrupts around the critical
//! section is what keeps an ISR from re-entering list splicing; the spin
//! flag only guards against misuse. The guard saves EFLAGS on entry and
//! restores it on drop, so nested acquisition composes with sections
//! that already run with interrupts off. On the host (tests) this is a
//! plain spin lock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(all(target_os = "none", target_arch = "x86"))]
#[inline]
fn irq_save() -> u32 {
    let flags: u32;
    // SAFETY: pushfd/pop reads EFLAGS; cli only masks interrupts.
    unsafe {
        core::arch::asm!("pushfd; pop {0}; cli", out(reg) flags, options(nomem));
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86"))]
#[inline]
fn irq_restore(flags: u32) {
    // SAFETY: Restores the EFLAGS value saved by `irq_save`.
    unsafe {
        core::arch::asm!("push {0}; popfd", in(reg) flags, options(nomem));
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86")))]
fn irq_save() -> u32 {
    0
}

#[cfg(not(all(target_os = "none", target_arch = "x86")))]
fn irq_restore(_flags: u32) {}

/// A lock that disables interrupts for the duration of the guard.
pub struct IrqLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Exclusive access is enforced by the flag plus masked interrupts.
unsafe impl<T: Send> Send for IrqLock<T> {}
unsafe impl<T: Send> Sync for IrqLock<T> {}

impl<T> IrqLock<T> {
    /// Creates a new unlocked lock wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Disables interrupts and acquires the lock.
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let flags = irq_save();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqLockGuard { lock: self, flags };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire without spinning, still saving EFLAGS.
    pub fn try_lock(&self) -> Option<IrqLockGuard<'_, T>> {
        let flags = irq_save();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqLockGuard { lock: self, flags })
        } else {
            irq_restore(flags);
            None
        }
    }
}

/// RAII guard restoring EFLAGS and releasing the [`IrqLock`] on drop.
pub struct IrqLockGuard<'a, T> {
    lock: &'a IrqLock<T>,
    flags: u32,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        irq_restore(self.flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusion() {
        let lock = IrqLock::new(0u32);
        {
            let mut g = lock.lock();
            *g = 9;
            assert!(lock.try_lock().is_none());
        }
        assert_eq!(*lock.lock(), 9);
    }
}
