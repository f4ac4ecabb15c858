//! Kernel panic: register dump and halt.

use core::panic::PanicInfo;

use baryon_core::{kfatal, kprintln};

use crate::signal::SigContext;

/// Panics with a saved trap context — the supervisor-fault path.
pub fn panic_with_context(reason: &str, sc: &SigContext) -> ! {
    kfatal!("kernel {reason}");
    kprintln!(
        "eip={:#010x} eflags={:#010x} err={:#x} trap={}",
        sc.eip,
        sc.eflags,
        sc.err,
        sc.trapno
    );
    kprintln!(
        "eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}",
        sc.eax,
        sc.ebx,
        sc.ecx,
        sc.edx
    );
    kprintln!(
        "esi={:#010x} edi={:#010x} ebp={:#010x} esp={:#010x}",
        sc.esi,
        sc.edi,
        sc.ebp,
        sc.esp
    );
    halt_forever();
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    kfatal!("kernel panic: {info}");
    halt_forever();
}

fn halt_forever() -> ! {
    crate::arch::x86::cli();
    loop {
        crate::arch::x86::halt();
    }
}
