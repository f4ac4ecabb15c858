//! The signal-return trampoline.
//!
//! A handler returns like any C function, so its return address must
//! lead somewhere that issues `sigreturn`. That somewhere is this
//! eight-byte snippet, copied once into every process's address space
//! at a fixed page below the stack:
//!
//! ```text
//!     pop  ebx        ; the signal number becomes argument 1
//!     mov  eax, 119   ; __NR_sigreturn
//!     int  0x80
//! ```

use baryon_core::Result;
use baryon_core::addr::VirtAddr;
use baryon_mm::mapper::AddressSpace;
use baryon_mm::paging::PageFlags;

/// Where the trampoline page sits in every process.
pub const TRAMPOLINE_ADDR: u32 = 0xBFFF_E000;

/// The machine code.
pub const TRAMPOLINE_CODE: [u8; 8] = [
    0x5B, // pop ebx
    0xB8, 119, 0x00, 0x00, 0x00, // mov eax, 119
    0xCD, 0x80, // int 0x80
];

/// Maps the trampoline page (read-only, user) into an address space
/// and copies the snippet in.
pub fn install(
    space: &AddressSpace,
    frames: &mut baryon_mm::frame::FrameTable,
    phys: &mut dyn baryon_mm::mapper::PhysAccess,
) -> Result<()> {
    let frame = space.map_page(
        frames,
        phys,
        VirtAddr::new(TRAMPOLINE_ADDR),
        None,
        PageFlags::USER,
    )?;
    let dst = phys.page_ptr(frame.phys());
    // SAFETY: The fresh frame is mapped through the kernel window and
    // exclusively ours until the process runs.
    unsafe {
        core::ptr::copy_nonoverlapping(TRAMPOLINE_CODE.as_ptr(), dst, TRAMPOLINE_CODE.len());
    }
    Ok(())
}

/// The words pushed on the user stack for a handler invocation, top of
/// stack first: the trampoline return address, then the signal number
/// as the handler's argument.
#[must_use]
pub fn frame_words(ret: u32, signum: i32) -> [u32; 2] {
    [ret, signum as u32]
}
