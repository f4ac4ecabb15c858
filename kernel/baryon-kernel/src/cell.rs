//! Single-CPU global cell.
//!
//! The kernel's big tables are plain globals on a uniprocessor: kernel
//! code is non-preemptive, so at most one context touches a table at a
//! time, and the short ISR-shared sections use interrupt-disabling
//! locks instead. [`KCell`] encodes that rule — it hands out a mutable
//! borrow with no blocking, and panics if a borrow is ever nested,
//! turning a broken invariant into a loud failure instead of silent
//! corruption.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

/// A globally shared value with panic-checked exclusive access.
pub struct KCell<T> {
    busy: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: Access is serialized by the busy flag (panicking, not
// blocking, on overlap) and the single-CPU execution model.
unsafe impl<T: Send> Sync for KCell<T> {}

impl<T> KCell<T> {
    /// Creates a cell.
    pub const fn new(value: T) -> Self {
        Self {
            busy: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Runs `f` with exclusive access to the value.
    ///
    /// # Panics
    ///
    /// Panics on re-entry — a kernel path tried to borrow a table it
    /// (or its caller) already holds.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        assert!(
            self.busy
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
            "nested borrow of a kernel table"
        );
        // SAFETY: The busy flag guarantees exclusivity until reset.
        let result = f(unsafe { &mut *self.value.get() });
        self.busy.store(false, Ordering::Release);
        result
    }

    /// Like [`Self::with`], but returns `None` instead of panicking
    /// when the cell is busy (panic/diagnostic paths).
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return None;
        }
        // SAFETY: As in `with`.
        let result = f(unsafe { &mut *self.value.get() });
        self.busy.store(false, Ordering::Release);
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static CELL: KCell<u32> = KCell::new(0);

    #[test]
    fn exclusive_access_round_trip() {
        CELL.with(|v| *v = 7);
        assert_eq!(CELL.with(|v| *v), 7);
    }

    #[test]
    fn try_with_refuses_reentry() {
        let c = KCell::new(1);
        c.with(|_| {
            assert!(c.try_with(|_| ()).is_none());
        });
        assert!(c.try_with(|_| ()).is_some());
    }
}
