//! Multiboot 1 entry for the Baryon kernel.
//!
//! The loader drops us in 32-bit protected mode with paging off, EAX
//! holding the multiboot magic and EBX the physical address of the
//! info structure. This stub provides the header the loader scans for,
//! a boot stack, and a minimal boot page directory (identity plus the
//! 3 GiB high half as 4 MiB pages) so the kernel proper can run at its
//! linked addresses before it builds the real tables.

#![no_std]
#![no_main]

use core::arch::global_asm;

/// The loader checks these three words in the first 8 KiB.
const MB_MAGIC: u32 = 0x1BAD_B002;
/// Request a memory map and page alignment.
const MB_FLAGS: u32 = 0x0000_0003;
const MB_CHECKSUM: u32 = 0u32.wrapping_sub(MB_MAGIC).wrapping_sub(MB_FLAGS);

#[unsafe(link_section = ".multiboot")]
#[unsafe(no_mangle)]
static MULTIBOOT_HEADER: [u32; 3] = [MB_MAGIC, MB_FLAGS, MB_CHECKSUM];

global_asm!(
    r#"
    .section .boot, "ax"
    .globl _start
    .code32
_start:
    cli
    /* Build the boot page directory: entry i -> i*4MiB (PS|RW|P), and
       the kernel half 768.. -> same frames, so the high-linked kernel
       is reachable the moment CR3 loads. */
    lea edi, [boot_page_dir - 0xC0000000]
    xor ecx, ecx
1:
    mov eax, ecx
    shl eax, 22
    or  eax, 0x83          /* present | rw | 4 MiB */
    mov [edi + ecx*4], eax
    mov [edi + 768*4 + ecx*4], eax
    inc ecx
    cmp ecx, 256           /* map the first gigabyte both ways */
    jb  1b

    mov eax, edi
    mov cr3, eax
    mov eax, cr4
    or  eax, 0x10          /* PSE for the 4 MiB pages */
    mov cr4, eax
    mov eax, cr0
    or  eax, 0x80000000    /* paging on */
    mov cr0, eax

    lea eax, [2f]
    jmp eax                /* onto the high half */
2:
    lea esp, [boot_stack_top]
    push ebx               /* multiboot info (physical) */
    call rust_entry
3:
    hlt
    jmp 3b

    .section .bss
    .align 4096
boot_page_dir:
    .skip 4096
boot_stack:
    .skip 16384
boot_stack_top:
"#
);

/// Hands over to the kernel. EBX travels as the only argument.
#[unsafe(no_mangle)]
extern "C" fn rust_entry(info_addr: u32) -> ! {
    // SAFETY: Called exactly once from `_start`, on the boot stack,
    // with the boot page tables active.
    unsafe { baryon_kernel::kernel_init(info_addr) }
}
