//! i386 bring-up: segment tables, trap gates, the 8259 pair, the PIT,
//! the context switch and the signal trampoline.

pub mod gdt;
pub mod idt;
pub mod phys;
pub mod pic;
pub mod pit;
pub mod port;
pub mod serial;
pub mod switch;
pub mod trampoline;
pub mod traps;

use baryon_core::Result;
use baryon_core::addr::VirtAddr;
use baryon_mm::mapper::AddressSpace;

use crate::proc::ProcTable;
use crate::signal::SigContext;

/// Enables interrupts.
#[inline]
pub fn sti() {
    // SAFETY: STI only sets the interrupt flag.
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
}

/// Disables interrupts.
#[inline]
pub fn cli() {
    // SAFETY: CLI only clears the interrupt flag.
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
}

/// Halts until the next interrupt — the idle loop body.
#[inline]
pub fn halt() {
    // SAFETY: HLT waits for an interrupt with no other effect.
    unsafe { core::arch::asm!("hlt", options(nomem, nostack)) };
}

/// Clones the parent's user mappings copy-on-write into a fresh
/// address space for the child, copies the kernel stack, and rewrites
/// the child's saved EAX so it returns zero from the fork trap.
pub fn fork_address_space(table: &mut ProcTable, parent: usize, child: usize) -> Result<()> {
    let parent_space = table.get(parent).space.expect("parent has no address space");
    let (child_space, child_cr3) = crate::boot::with_frames(|frames| {
        let mut pa = phys::KernelWindow;
        let space = AddressSpace::new(frames, &mut pa)?;
        space.copy_kernel_entries(&crate::boot::kernel_space(), &mut pa);
        // Shared regions alias; everything else goes copy-on-write.
        let vmas = table.get(parent).vmas.duplicate();
        parent_space.clone_user(&space, frames, &mut pa, &|addr: VirtAddr| {
            vmas.find_region(addr.as_u32())
                .is_some_and(|v| v.share == baryon_mm::vma::Share::Shared)
        })?;
        Ok::<_, baryon_core::Errno>((space, space.dir_phys().as_u32()))
    })?;

    // A fresh kernel stack for the child, with the parent's trap frame
    // copied to its top; the child resumes in `fork_return`, which
    // unwinds that frame straight back to user mode.
    let kstack = crate::boot::with_frames(baryon_mm::frame::FrameTable::get_free_page)?;
    let child_esp0 =
        kstack.phys().to_virt().as_u32() + baryon_core::addr::PAGE_SIZE as u32;
    let parent_esp0 = table.get(parent).task.esp0;
    // SAFETY: Both stacks are mapped through the kernel window; the
    // frame occupies the top TRAP_FRAME_SIZE bytes of each.
    unsafe {
        core::ptr::copy_nonoverlapping(
            (parent_esp0 - crate::boot::TRAP_FRAME_SIZE) as *const u8,
            (child_esp0 - crate::boot::TRAP_FRAME_SIZE) as *mut u8,
            crate::boot::TRAP_FRAME_SIZE as usize,
        );
    }

    {
        let c = table.get_mut(child);
        c.space = Some(child_space);
        c.task.cr3 = child_cr3;
        c.task.esp0 = child_esp0;
        c.task.esp = child_esp0 - crate::boot::TRAP_FRAME_SIZE;
        c.task.eip = traps::fork_return_entry();
    }
    // Zero the copied frame's EAX slot so fork returns 0 in the child.
    switch::set_child_retval(table, child, 0);
    Ok(())
}

/// Tears page-table entries for `[start, end)` out of the current
/// address space (munmap).
pub fn unmap_user_range(start: u32, end: u32) {
    crate::boot::with_frames(|frames| {
        crate::proc::with_proc(|t| {
            let Some(space) = t.current().space else {
                return;
            };
            let mut pa = phys::KernelWindow;
            let mut at = start;
            while at < end {
                let _ = space.unmap_page(frames, &mut pa, VirtAddr::new(at));
                at += baryon_core::addr::PAGE_SIZE as u32;
            }
        });
    });
}

/// Applies a protection change to installed pages in `[start, end)`.
pub fn protect_user_range(start: u32, end: u32, writable: bool) {
    crate::boot::with_frames(|_frames| {
        crate::proc::with_proc(|t| {
            let Some(space) = t.current().space else {
                return;
            };
            let mut pa = phys::KernelWindow;
            let mut at = start;
            while at < end {
                let _ = space.protect_page(&mut pa, VirtAddr::new(at), writable);
                at += baryon_core::addr::PAGE_SIZE as u32;
            }
        });
    });
}

/// Rebuilds the trap frame from a saved signal context; executed on
/// the way out of `sigreturn`.
pub fn restore_sigcontext(context: &SigContext) {
    switch::write_trap_frame(context);
}

/// Pulls the reset line via the keyboard controller, the traditional
/// i386 restart.
pub fn machine_restart() -> ! {
    cli();
    loop {
        // SAFETY: Port 0x64 command 0xFE asserts CPU reset.
        unsafe { port::outb(0x64, 0xFE) };
        halt();
    }
}
