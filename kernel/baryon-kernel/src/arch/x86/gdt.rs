//! The global descriptor table and the task-state segment.
//!
//! Flat 4 GiB code/data segments for rings 0 and 3 plus one TSS whose
//! only live fields are `esp0`/`ss0` — the kernel stack the CPU loads
//! on a ring-3 → ring-0 transition. The context switch repoints the
//! TSS descriptor at the incoming process's state.

use core::mem::size_of;

/// Kernel code selector.
pub const KERNEL_CS: u16 = 0x08;
/// Kernel data selector.
pub const KERNEL_DS: u16 = 0x10;
/// User code selector (RPL 3).
pub const USER_CS: u16 = 0x1B;
/// User data selector (RPL 3).
pub const USER_DS: u16 = 0x23;
/// TSS selector.
pub const TSS_SEL: u16 = 0x28;

/// One segment descriptor.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct SegDesc {
    limit_lo: u16,
    base_lo: u16,
    base_mid: u8,
    access: u8,
    flags_limit_hi: u8,
    base_hi: u8,
}

impl SegDesc {
    const fn flat(access: u8) -> Self {
        Self {
            limit_lo: 0xffff,
            base_lo: 0,
            base_mid: 0,
            access,
            flags_limit_hi: 0xCF, // 4 KiB granularity, 32-bit, limit 0xf____
            base_hi: 0,
        }
    }

    fn system(base: u32, limit: u32, access: u8) -> Self {
        Self {
            limit_lo: (limit & 0xffff) as u16,
            base_lo: (base & 0xffff) as u16,
            base_mid: ((base >> 16) & 0xff) as u8,
            access,
            flags_limit_hi: ((limit >> 16) & 0x0f) as u8,
            base_hi: ((base >> 24) & 0xff) as u8,
        }
    }
}

/// The hardware task-state segment. Only the ring-0 stack fields are
/// used; the context switch is software.
#[derive(Clone, Copy)]
#[repr(C, packed)]
pub struct Tss {
    prev: u32,
    /// Ring-0 stack pointer loaded on privilege transition.
    pub esp0: u32,
    /// Ring-0 stack segment.
    pub ss0: u32,
    unused: [u32; 22],
    /// Offset of the I/O bitmap (past the limit: no bitmap).
    pub iomap_base: u16,
    trailer: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            prev: 0,
            esp0: 0,
            ss0: KERNEL_DS as u32,
            unused: [0; 22],
            iomap_base: size_of::<Tss>() as u16,
            trailer: 0,
        }
    }
}

const NR_GDT_ENTRIES: usize = 6;

static mut GDT: [SegDesc; NR_GDT_ENTRIES] = [
    SegDesc {
        limit_lo: 0,
        base_lo: 0,
        base_mid: 0,
        access: 0,
        flags_limit_hi: 0,
        base_hi: 0,
    }, // null
    SegDesc::flat(0x9A), // kernel code
    SegDesc::flat(0x92), // kernel data
    SegDesc::flat(0xFA), // user code
    SegDesc::flat(0xF2), // user data
    SegDesc {
        limit_lo: 0,
        base_lo: 0,
        base_mid: 0,
        access: 0,
        flags_limit_hi: 0,
        base_hi: 0,
    }, // TSS, filled at init
];

static mut TSS: Tss = Tss::new();

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Builds the descriptors, loads GDTR, reloads the segment registers
/// and LTRs the TSS.
pub fn init() {
    // SAFETY: Single-CPU early boot; nothing else touches the tables.
    unsafe {
        let tss_base = &raw const TSS as u32;
        GDT[TSS_SEL as usize / 8] =
            SegDesc::system(tss_base, size_of::<Tss>() as u32 - 1, 0x89);

        let ptr = DescriptorPointer {
            limit: (size_of::<[SegDesc; NR_GDT_ENTRIES]>() - 1) as u16,
            base: &raw const GDT as u32,
        };
        core::arch::asm!(
            "lgdt [{ptr}]",
            "mov ds, {sel:x}",
            "mov es, {sel:x}",
            "mov fs, {sel:x}",
            "mov gs, {sel:x}",
            "mov ss, {sel:x}",
            // Far-return to reload CS.
            "push {cs}",
            "lea {tmp}, [2f]",
            "push {tmp}",
            "retf",
            "2:",
            ptr = in(reg) &ptr,
            sel = in(reg) u32::from(KERNEL_DS),
            cs = const KERNEL_CS as i32,
            tmp = out(reg) _,
        );
        core::arch::asm!("ltr {sel:x}", sel = in(reg) u32::from(TSS_SEL));
    }
}

/// Points the TSS ring-0 stack at the incoming process's kernel stack.
pub fn set_kernel_stack(esp0: u32) {
    // SAFETY: Single field store; the CPU reads it at trap time only.
    unsafe {
        let tss = &raw mut TSS;
        (*tss).esp0 = esp0;
    }
}
