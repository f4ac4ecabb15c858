//! Physical access through the kernel's fixed high mapping.
//!
//! All physical memory is mapped at [`KERNEL_BASE`], so a frame's
//! contents are reachable at `phys + KERNEL_BASE` — the kernel window.
//!
//! [`KERNEL_BASE`]: baryon_core::addr::KERNEL_BASE

use baryon_core::addr::{PhysAddr, VirtAddr};
use baryon_mm::mapper::PhysAccess;
use baryon_mm::paging::PageTable;

/// [`PhysAccess`] through the fixed window.
pub struct KernelWindow;

impl PhysAccess for KernelWindow {
    fn table_ptr(&mut self, frame: PhysAddr) -> *mut PageTable {
        frame.to_virt().as_u32() as *mut PageTable
    }

    fn page_ptr(&mut self, frame: PhysAddr) -> *mut u8 {
        frame.to_virt().as_u32() as *mut u8
    }

    fn flush_tlb(&mut self, virt: VirtAddr) {
        // SAFETY: INVLPG only drops the TLB entry for the given page.
        unsafe {
            core::arch::asm!("invlpg [{0}]", in(reg) virt.as_u32(), options(nostack));
        }
    }
}

/// Loads a new page directory (full TLB flush).
pub fn load_cr3(dir: PhysAddr) {
    // SAFETY: The directory was built by the mapper and includes the
    // kernel half.
    unsafe {
        core::arch::asm!("mov cr3, {0}", in(reg) dir.as_u32(), options(nostack));
    }
}
