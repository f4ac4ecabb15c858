//! Synchronization primitives.
//!
//! The kernel targets a single CPU, so two kinds of short-term exclusion
//! suffice: [`SpinLock`] for data never touched from interrupt context,
//! and [`IrqLock`] which additionally disables interrupts for data
//! shared with ISRs. Longer-lived exclusion (superblock updates, fd-slot
//! allocation) uses the sleeping resource lock in the kernel crate.

mod irqlock;
mod spinlock;

pub use irqlock::{IrqLock, IrqLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
