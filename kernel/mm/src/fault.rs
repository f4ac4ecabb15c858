//! Page-fault classification.
//!
//! The CPU pushes an error code with bits for present-violation, write
//! access and user mode. Combined with the faulting address's vma (or
//! lack of one) and the backing frame's copy-on-write state, that is
//! enough to decide the handler's action; the decision itself is pure
//! and lives here, the actual frame work happens in the trap handler.

use bitflags::bitflags;

use crate::vma::{Prot, Vma};

bitflags! {
    /// The page-fault error code pushed by the CPU.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Set: protection violation on a present page. Clear: not present.
        const PRESENT = 1 << 0;
        /// Set: the access was a write.
        const WRITE = 1 << 1;
        /// Set: the access came from user mode.
        const USER = 1 << 2;
    }
}

/// What the page-fault handler should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Allocate a frame, fill it from the backing file at the region
    /// offset, install with the region's protection.
    DemandFile,
    /// Allocate a zero-filled frame and install it read-write.
    DemandZero,
    /// Resolve a write to a copy-on-write frame.
    CowCopy,
    /// The access is simply not allowed: deliver SIGSEGV.
    Segv,
    /// Fault in supervisor mode: kernel bug, panic with a register dump.
    Panic,
}

/// Classifies a fault.
///
/// `vma` is the region containing the faulting address, if any;
/// `frame_is_cow` tells whether a present mapping's frame carries the
/// copy-on-write bit.
#[must_use]
pub fn classify(code: FaultCode, vma: Option<&Vma>, frame_is_cow: bool) -> FaultAction {
    let Some(vma) = vma else {
        return if code.contains(FaultCode::USER) {
            FaultAction::Segv
        } else {
            FaultAction::Panic
        };
    };

    if code.contains(FaultCode::WRITE) && !vma.prot.contains(Prot::WRITE) {
        return if code.contains(FaultCode::USER) {
            FaultAction::Segv
        } else {
            FaultAction::Panic
        };
    }

    if code.contains(FaultCode::PRESENT) {
        // A protection violation on a present page inside a writable
        // region is the copy-on-write case; anything else is a stray
        // protection fault.
        if code.contains(FaultCode::WRITE) && frame_is_cow {
            return FaultAction::CowCopy;
        }
        return if code.contains(FaultCode::USER) {
            FaultAction::Segv
        } else {
            FaultAction::Panic
        };
    }

    if vma.inode.is_some() {
        FaultAction::DemandFile
    } else {
        FaultAction::DemandZero
    }
}
