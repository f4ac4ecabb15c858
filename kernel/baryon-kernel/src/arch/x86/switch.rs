//! The context switch.
//!
//! Software task switching: the outgoing process's kernel stack
//! pointer and resume address are saved in its task state, the TSS
//! ring-0 stack and CR3 are retargeted, and control jumps onto the
//! incoming process's kernel stack. Interrupts are disabled across the
//! whole exchange.

use crate::proc::{ProcTable, TaskState};
use crate::signal::SigContext;

/// Performs the switch from `prev` (whose state is saved through the
/// pointer) to `next`.
///
/// # Safety
///
/// Both task states must describe live kernel stacks; interrupts must
/// be disabled. Returns when `prev` is scheduled again.
pub unsafe fn switch_to(prev: *mut TaskState, next: &TaskState) {
    super::gdt::set_kernel_stack(next.esp0);
    super::phys::load_cr3(baryon_core::addr::PhysAddr::new(next.cr3));
    // SAFETY: Saves ESP/EIP into prev and jumps to next's saved pair;
    // the "1:" label is where prev resumes later.
    unsafe {
        core::arch::asm!(
            "mov [{prev} + 0], esp",   // prev.esp
            "lea eax, [2f]",
            "mov [{prev} + 4], eax",   // prev.eip
            "mov esp, {next_esp}",
            "jmp {next_eip}",
            "2:",
            prev = in(reg) prev,
            next_esp = in(reg) next.esp,
            next_eip = in(reg) next.eip,
            out("eax") _,
        );
    }
}

/// Rewrites the saved EAX in a child's copied trap frame so `fork`
/// returns `value` there. The frame sits at the top of the child's
/// kernel stack.
pub fn set_child_retval(table: &mut ProcTable, child: usize, value: u32) {
    let esp0 = table.get(child).task.esp0;
    // The trap frame's EAX slot: see the layout in `traps.rs` — eax is
    // the 12th saved word from the frame base.
    let frame_base = esp0 - crate::boot::TRAP_FRAME_SIZE;
    let eax_slot = frame_base + 11 * 4;
    // SAFETY: The child's kernel stack was just built by fork and is
    // mapped in the kernel window.
    unsafe { core::ptr::write(eax_slot as *mut u32, value) };
}

/// Overwrites the current trap frame from a restored signal context
/// (`sigreturn`).
pub fn write_trap_frame(context: &SigContext) {
    crate::boot::with_current_trap_frame(|frame| {
        frame[4] = context.edi;
        frame[5] = context.esi;
        frame[6] = context.ebp;
        frame[8] = context.ebx;
        frame[9] = context.edx;
        frame[10] = context.ecx;
        frame[14] = context.eip;
        frame[16] = context.eflags;
        frame[17] = context.esp_at_signal;
    });
}
