//! Low-level trap, IRQ and syscall entry.
//!
//! Each stub pushes its vector (and a dummy error code where the CPU
//! pushes none), saves the register file in `sigcontext` order, and
//! calls the common Rust dispatcher with a pointer to the saved frame.
//! Returns restore the frame and `iretd`.

use baryon_core::addr::VirtAddr;
use baryon_mm::fault::{FaultAction, FaultCode, classify};
use baryon_mm::frame::FrameFlags;

use crate::irq::TRAPS;
use crate::proc::with_proc;
use crate::signal::{SIGSEGV, SigContext, send_sig};

/// One naked entry stub.
pub type Stub = unsafe extern "C" fn();

macro_rules! exception_stub {
    ($name:ident, $vector:expr, has_err) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push {v}",
                "jmp {common}",
                v = const $vector,
                common = sym trap_common,
            );
        }
    };
    ($name:ident, $vector:expr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0", // fabricated error code
                "push {v}",
                "jmp {common}",
                v = const $vector,
                common = sym trap_common,
            );
        }
    };
}

macro_rules! irq_stub {
    ($name:ident, $line:expr) => {
        #[unsafe(naked)]
        unsafe extern "C" fn $name() {
            core::arch::naked_asm!(
                "push 0",
                "push {v}", // line number travels in the trapno slot
                "jmp {common}",
                v = const 0x100 + $line,
                common = sym trap_common,
            );
        }
    };
}

exception_stub!(exc0, 0);
exception_stub!(exc1, 1);
exception_stub!(exc2, 2);
exception_stub!(exc3, 3);
exception_stub!(exc4, 4);
exception_stub!(exc5, 5);
exception_stub!(exc6, 6);
exception_stub!(exc7, 7);
exception_stub!(exc8, 8, has_err);
exception_stub!(exc9, 9);
exception_stub!(exc10, 10, has_err);
exception_stub!(exc11, 11, has_err);
exception_stub!(exc12, 12, has_err);
exception_stub!(exc13, 13, has_err);
exception_stub!(exc14, 14, has_err);
exception_stub!(exc15, 15);
exception_stub!(exc16, 16);
exception_stub!(exc17, 17, has_err);
exception_stub!(exc18, 18);
exception_stub!(exc19, 19);
exception_stub!(exc20, 20);
exception_stub!(exc21, 21);
exception_stub!(exc22, 22);
exception_stub!(exc23, 23);
exception_stub!(exc24, 24);
exception_stub!(exc25, 25);
exception_stub!(exc26, 26);
exception_stub!(exc27, 27);
exception_stub!(exc28, 28);
exception_stub!(exc29, 29);
exception_stub!(exc30, 30);
exception_stub!(exc31, 31);

irq_stub!(irq0, 0);
irq_stub!(irq1, 1);
irq_stub!(irq2, 2);
irq_stub!(irq3, 3);
irq_stub!(irq4, 4);
irq_stub!(irq5, 5);
irq_stub!(irq6, 6);
irq_stub!(irq7, 7);
irq_stub!(irq8, 8);
irq_stub!(irq9, 9);
irq_stub!(irq10, 10);
irq_stub!(irq11, 11);
irq_stub!(irq12, 12);
irq_stub!(irq13, 13);
irq_stub!(irq14, 14);
irq_stub!(irq15, 15);

/// Exception entry points, indexed by vector.
pub static EXCEPTION_STUBS: [Stub; 32] = [
    exc0, exc1, exc2, exc3, exc4, exc5, exc6, exc7, exc8, exc9, exc10, exc11, exc12, exc13,
    exc14, exc15, exc16, exc17, exc18, exc19, exc20, exc21, exc22, exc23, exc24, exc25, exc26,
    exc27, exc28, exc29, exc30, exc31,
];

/// IRQ entry points, indexed by line.
pub static IRQ_STUBS: [Stub; 16] = [
    irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12, irq13,
    irq14, irq15,
];

/// The shared save/dispatch/restore path. The stack already holds
/// trapno and err plus the CPU frame; this saves segments and general
/// registers to complete a `SigContext`, then calls [`handle_trap`].
#[unsafe(naked)]
unsafe extern "C" fn trap_common() {
    core::arch::naked_asm!(
        "pusha",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, 0x10", // kernel data
        "mov ds, ax",
        "mov es, ax",
        "push esp",
        "call {handler}",
        "add esp, 4",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popa",
        "add esp, 8", // trapno + err
        "iretd",
        handler = sym handle_trap,
    );
}

/// The syscall gate: same frame shape, dispatched by number in EAX.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    core::arch::naked_asm!(
        "push 0",
        "push 0x80",
        "pusha",
        "push ds",
        "push es",
        "push fs",
        "push gs",
        "mov ax, 0x10",
        "mov ds, ax",
        "mov es, ax",
        "push esp",
        "call {handler}",
        "add esp, 4",
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popa",
        "add esp, 8",
        "iretd",
        handler = sym handle_syscall,
    );
}

/// Where a forked child starts: ESP already points at its copied trap
/// frame, so the restore tail of the common stub finishes the job.
#[unsafe(naked)]
unsafe extern "C" fn fork_return() {
    core::arch::naked_asm!(
        "pop gs",
        "pop fs",
        "pop es",
        "pop ds",
        "popa",
        "add esp, 8",
        "iretd",
    );
}

/// The child's resume address for the context switch.
pub(crate) fn fork_return_entry() -> u32 {
    fork_return as usize as u32
}

/// The saved frame as laid out by the stubs; field order mirrors the
/// pushes above, ending in the CPU's iret frame.
#[repr(C)]
struct TrapFrame {
    gs: u32,
    fs: u32,
    es: u32,
    ds: u32,
    edi: u32,
    esi: u32,
    ebp: u32,
    esp_dummy: u32,
    ebx: u32,
    edx: u32,
    ecx: u32,
    eax: u32,
    trapno: u32,
    err: u32,
    eip: u32,
    cs: u32,
    eflags: u32,
    // Present only when the trap came from ring 3:
    user_esp: u32,
    user_ss: u32,
}

fn context_of(frame: &TrapFrame) -> SigContext {
    SigContext {
        gs: frame.gs,
        fs: frame.fs,
        es: frame.es,
        ds: frame.ds,
        edi: frame.edi,
        esi: frame.esi,
        ebp: frame.ebp,
        esp: frame.esp_dummy,
        ebx: frame.ebx,
        edx: frame.edx,
        ecx: frame.ecx,
        eax: frame.eax,
        trapno: frame.trapno,
        err: frame.err,
        eip: frame.eip,
        cs: frame.cs,
        eflags: frame.eflags,
        esp_at_signal: frame.user_esp,
        ss: frame.user_ss,
        oldmask: 0,
    }
}

extern "C" fn handle_trap(frame: *mut TrapFrame) {
    // SAFETY: The stub passes a pointer to the frame it just built on
    // this stack.
    let frame = unsafe { &mut *frame };
    let from_user = frame.cs & 3 == 3;
    let sc = context_of(frame);

    if frame.trapno >= 0x100 {
        // A hardware interrupt line.
        let line = (frame.trapno - 0x100) as usize;
        crate::boot::dispatch_irq(line, &sc, from_user);
        return;
    }

    match frame.trapno {
        14 => page_fault(frame, from_user),
        n => {
            let name = TRAPS
                .get(n as usize)
                .map_or("unknown", |(name, _)| *name);
            if from_user {
                baryon_core::kwarn!(
                    "trap '{name}' at {:#010x}, signalling the process",
                    frame.eip
                );
                with_proc(|t| {
                    let me = t.current;
                    let _ = send_sig(t, me, SIGSEGV);
                });
            } else {
                crate::panic::panic_with_context(name, &sc);
            }
        }
    }
}

fn page_fault(frame: &mut TrapFrame, from_user: bool) {
    let addr = {
        let cr2: u32;
        // SAFETY: CR2 holds the faulting linear address.
        unsafe { core::arch::asm!("mov {0}, cr2", out(reg) cr2, options(nomem, nostack)) };
        VirtAddr::new(cr2)
    };
    let code = FaultCode::from_bits_truncate(frame.err);

    let action = with_proc(|t| {
        let p = t.current();
        let vma = p.vmas.find_region(addr.as_u32()).copied();
        let frame_is_cow = p.space.and_then(|space| {
            crate::boot::with_frames(|frames| {
                let mut pa = super::phys::KernelWindow;
                space
                    .translate(&mut pa, addr)
                    .map(|pte| frames.get(pte.frame().into()).flags.contains(FrameFlags::COW))
            })
        });
        classify(code, vma.as_ref(), frame_is_cow.unwrap_or(false))
    });

    match action {
        FaultAction::CowCopy => {
            let r = with_proc(|t| {
                let space = t.current().space.expect("fault without address space");
                crate::boot::with_frames_reclaiming(|frames| {
                    let mut pa = super::phys::KernelWindow;
                    space.cow_fault(frames, &mut pa, addr).map(|_| ())
                })
            });
            if r.is_err() {
                deliver_segv();
            } else {
                with_proc(|t| t.current_mut().usage.minflt += 1);
            }
        }
        FaultAction::DemandZero => {
            let r = with_proc(|t| {
                let space = t.current().space.expect("fault without address space");
                crate::boot::with_frames_reclaiming(|frames| {
                    let mut pa = super::phys::KernelWindow;
                    space.map_page(
                        frames,
                        &mut pa,
                        addr,
                        None,
                        baryon_mm::paging::PageFlags::RW | baryon_mm::paging::PageFlags::USER,
                    )
                })
            });
            if r.is_err() {
                deliver_segv();
            } else {
                with_proc(|t| t.current_mut().usage.minflt += 1);
            }
        }
        FaultAction::DemandFile => {
            if crate::boot::demand_file_page(addr).is_err() {
                deliver_segv();
            } else {
                with_proc(|t| t.current_mut().usage.majflt += 1);
            }
        }
        FaultAction::Segv => deliver_segv(),
        FaultAction::Panic => {
            let sc = context_of(frame);
            let _ = from_user;
            crate::panic::panic_with_context("page fault in kernel mode", &sc);
        }
    }
}

/// Builds the handler invocation on the user stack: pushes the
/// trampoline return address and the signal number, then redirects the
/// trap frame into the handler.
fn push_signal_frame(frame: &mut TrapFrame, f: &crate::signal::SigFrame) {
    let words = super::trampoline::frame_words(f.ret, f.signum);
    let mut esp = frame.user_esp;
    for w in words.iter().rev() {
        esp -= 4;
        // SAFETY: The user stack is mapped in the current address
        // space; a bad ESP faults into the page-fault handler like any
        // user access.
        unsafe { core::ptr::write(esp as *mut u32, *w) };
    }
    frame.user_esp = esp;
    frame.eip = f.handler;
}

fn deliver_segv() {
    with_proc(|t| {
        let me = t.current;
        let _ = send_sig(t, me, SIGSEGV);
    });
}

extern "C" fn handle_syscall(frame: *mut TrapFrame) {
    // SAFETY: As in handle_trap.
    let frame = unsafe { &mut *frame };
    let nr = frame.eax as usize;

    #[cfg(feature = "ebp-arg")]
    let a6 = frame.ebp as usize;
    #[cfg(not(feature = "ebp-arg"))]
    let a6 = 0;

    let result = crate::syscall::dispatch(
        nr,
        frame.ebx as usize,
        frame.ecx as usize,
        frame.edx as usize,
        frame.esi as usize,
        frame.edi as usize,
        a6,
    );

    // Return-to-user is a preemption point.
    with_proc(|t| {
        if t.need_resched {
            crate::sched::do_sched(t);
        }
    });

    let result = deliver_pending_signals(frame, result);
    frame.eax = result as u32;
}

/// Delivers deliverable signals on the way back to user mode and
/// settles the fate of an `ERESTART`ed syscall: rewind the two-byte
/// `int 0x80` under `SA_RESTART`, `EINTR` otherwise.
fn deliver_pending_signals(frame: &mut TrapFrame, result: isize) -> isize {
    use crate::signal::{Disposition, SaFlags, prepare_delivery};

    let restartable = result == baryon_core::Errno::ERESTART.as_neg();
    let mut result = result;
    loop {
        let sig = with_proc(|t| {
            let me = t.current;
            crate::signal::issig(t, me)
        });
        if sig == 0 {
            if restartable {
                // Nothing interrupted after all: re-issue transparently.
                frame.eip -= 2;
                return frame.eax as i32 as isize;
            }
            return result;
        }

        if restartable {
            let wants_restart = with_proc(|t| {
                t.current().sigactions[sig as usize]
                    .flags
                    .contains(SaFlags::RESTART)
            });
            result = if wants_restart {
                frame.eip -= 2;
                frame.eax as i32 as isize
            } else {
                baryon_core::Errno::EINTR.as_neg()
            };
        }
        frame.eax = result as u32;
        with_proc(|t| t.current_mut().saved_result = result);

        let ctx = context_of(frame);
        let disposition = with_proc(|t| {
            let me = t.current;
            prepare_delivery(t, me, sig, &ctx, super::trampoline::TRAMPOLINE_ADDR)
        });
        match disposition {
            Disposition::HandlerFrame(f) => {
                push_signal_frame(frame, &f);
                return result;
            }
            Disposition::Terminate { core } => {
                let code = sig | i32::from(core) * 0x80;
                crate::syscall::proc::do_exit(code);
            }
            Disposition::Stop => {
                with_proc(|t| {
                    let me = t.current;
                    t.not_runnable(me, crate::proc::ProcState::Stopped);
                    let ppid = t.get(me).ppid;
                    if let Some(parent) = t.find_pid(ppid) {
                        let _ = crate::signal::send_sig(t, parent, crate::signal::SIGCHLD);
                    }
                    crate::sched::do_sched(t);
                });
            }
            Disposition::Ignored => {}
        }
    }
}
