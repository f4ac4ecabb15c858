//! Kernel initialization and the glue statics the trap path uses.
//!
//! The boot binary hands over a multiboot info pointer; everything
//! after that follows the dependency order of the subsystems, leaves
//! first: segment tables and gates, the physical frame table, the
//! kernel heap, kernel paging, interrupt plumbing, the process table,
//! the VFS, and finally the idle loop with interrupts open.

use core::sync::atomic::{AtomicU32, Ordering};

use baryon_core::addr::{KERNEL_BASE, PAGE_SIZE, PhysAddr, VirtAddr, page_align_up};
use baryon_core::{Errno, Result};
use baryon_mm::frame::{Frame, FrameTable, PageTag};
use baryon_mm::mapper::AddressSpace;
use baryon_mm::paging::PageFlags;
use baryon_mm::vma::{Prot, Share};

use crate::arch::x86::{gdt, idt, phys, pic, pit, serial, trampoline};
use crate::cell::KCell;
use crate::config::{BDFLUSH_PCT, BootOptions, HZ};
use crate::irq::IrqTable;
use crate::kstat::KSTAT;
use crate::multiboot::{BootImage, MultibootInfo};
use crate::proc::sleep::{SleepKind, sleep, wakeup};
use crate::proc::{INIT, with_proc};
use crate::signal::SigContext;
use crate::timer;
use crate::vfs::with_vfs;
use baryon_core::{kinfo, kwarn};

/// Words in a full trap frame (segments, pusha, trapno/err, iret with
/// user stack).
pub const TRAP_FRAME_WORDS: usize = 19;

/// Bytes of a full trap frame.
pub const TRAP_FRAME_SIZE: u32 = (TRAP_FRAME_WORDS * 4) as u32;

/// Kernel stack size per process.
pub const KSTACK_SIZE: usize = 2 * PAGE_SIZE;

static FRAMES: KCell<Option<FrameTable>> = KCell::new(None);
static IRQS: KCell<IrqTable> = KCell::new(IrqTable::new());
static PIC: KCell<Option<pic::Pic8259>> = KCell::new(None);
static KERNEL_DIR: AtomicU32 = AtomicU32::new(0);

unsafe extern "C" {
    /// End of the kernel image, from the linker script.
    static __kernel_end: u8;
}

/// Runs `f` with the frame table.
///
/// Nothing inside may allocate from the kernel heap — the allocator
/// itself draws frames through here.
pub fn with_frames<R>(f: impl FnOnce(&mut FrameTable) -> R) -> R {
    FRAMES.with(|t| f(t.as_mut().expect("frame table not initialized")))
}

/// The kernel's own address space (the high-half template).
#[must_use]
pub fn kernel_space() -> AddressSpace {
    let dir = KERNEL_DIR.load(Ordering::Acquire);
    AddressSpace::from_dir(baryon_mm::frame::FrameIdx::from(PhysAddr::new(dir)))
}

/// The IRQ dispatch entry called from the trap stubs, plus the
/// bottom-half run with interrupts re-enabled.
pub fn dispatch_irq(line: usize, sc: &SigContext, from_user: bool) {
    PIC.with(|pic| {
        let pic = pic.as_mut().expect("PIC not initialized");
        IRQS.with(|table| table.dispatch(pic, line, sc));
    });
    let _ = from_user;
    // Bottom halves run once per IRQ return, interrupts open. The
    // active set is claimed first so a nested interrupt can reach the
    // table while the halves run.
    crate::arch::x86::sti();
    let active = IRQS.with(IrqTable::take_active);
    for bh in active.into_iter().flatten() {
        bh();
    }
    crate::arch::x86::cli();
}

/// Registers an IRQ chain entry (drivers call through here).
pub fn register_irq(line: usize, name: &'static str, handler: crate::irq::IrqHandler) -> Result<()> {
    IRQS.with(|t| t.register_irq(line, name, handler))?;
    PIC.with(|p| {
        if let Some(pic) = p.as_mut() {
            crate::irq::IrqController::unmask(pic, line);
        }
    });
    Ok(())
}

fn timer_irq(_line: usize, sc: &SigContext) {
    let from_user = sc.cs & 3 == 3;
    with_proc(|t| timer::do_tick(t, from_user));
    // The flush daemon's cadence: once a second, step the dirty-buffer
    // write-back.
    if timer::jiffies() % HZ == 0 {
        with_vfs(|v| {
            let _ = v.buffers.flush_step(&mut v.devices, BDFLUSH_PCT);
        });
    }
}

fn kernel_sleep(channel: usize, interruptible: bool) -> i32 {
    let kind = if interruptible {
        SleepKind::Interruptible
    } else {
        SleepKind::Uninterruptible
    };
    with_proc(|t| sleep(t, channel, kind))
}

fn kernel_wake(channel: usize) {
    with_proc(|t| wakeup(t, channel));
}

/// Frame allocation with the OOM recovery the buffer cache provides:
/// when the free list is dry, clean buffers are reclaimed — outside
/// the frame borrow, because releasing their payload memory walks back
/// through the allocator — and the operation retries once.
pub fn with_frames_reclaiming<R>(
    f: impl Fn(&mut FrameTable) -> baryon_core::Result<R>,
) -> baryon_core::Result<R> {
    match with_frames(&f) {
        Err(baryon_core::Errno::ENOMEM) => {
            let got = with_vfs(|v| v.buffers.reclaim(baryon_fs::buffer::NR_BUF_RECLAIM));
            if got == 0 {
                return Err(baryon_core::Errno::ENOMEM);
            }
            with_frames(&f)
        }
        other => other,
    }
}

/// Entry from the boot binary: `info_addr` is the physical address of
/// the multiboot information structure.
///
/// # Safety
///
/// Must be called exactly once, on the boot stack, with the boot
/// page tables active (kernel high half mapped).
///
/// # Panics
///
/// Panics when a core table cannot be built — there is no system to
/// fall back to.
pub unsafe fn kernel_init(info_addr: u32) -> ! {
    serial::init();
    kinfo!("Baryon starting");

    gdt::init();
    idt::init();

    // The whole of physical memory is visible through the kernel
    // window; multiboot parsing reads straight out of it.
    let info = {
        // SAFETY: The window covers all RAM the loader described.
        let bytes = unsafe {
            core::slice::from_raw_parts(KERNEL_BASE as *const u8, 0x4000_0000 - PAGE_SIZE)
        };
        let image = BootImage::new(bytes, 0);
        MultibootInfo::parse(&image, info_addr).expect("bad multiboot information")
    };
    let (options, unknown) = BootOptions::parse(&info.cmdline);
    if unknown > 0 {
        kwarn!("{unknown} unrecognized boot option(s) ignored");
    }
    kinfo!("cmdline: {}", info.cmdline);

    init_frames(&info);
    crate::heap::init();
    init_kernel_paging(&info);

    // Interrupt plumbing: PIC remapped and masked, PIT at HZ, the
    // timer chain registered.
    PIC.with(|p| *p = Some(pic::Pic8259::init()));
    pit::init();
    IRQS.with(|t| t.register_irq(0, "timer", timer_irq))
        .expect("timer line");
    PIC.with(|p| crate::irq::IrqController::unmask(p.as_mut().unwrap(), 0));

    // Process table, then the VFS (whose blocking seam needs the
    // sleep/wakeup pair). The root device must exist before the root
    // mount, so the ramdisk is built first and registered inside the
    // VFS bring-up.
    crate::proc::init();
    // SAFETY: The hooks live as long as the kernel.
    unsafe { baryon_fs::wait::init(kernel_sleep, kernel_wake) };

    let root_disk = build_ramdisk(&options, &info);
    let root_cfg = crate::vfs::RootConfig::from_options(&options);
    kinfo!(
        "root: {} on {} ({})",
        root_cfg.fstype,
        root_cfg.dev,
        if root_cfg.readonly { "ro" } else { "rw" }
    );
    if let Some(console) = &options.console {
        // Console selection belongs to the character drivers; the
        // chosen name is recorded so their registration can honor it.
        kinfo!("console: {}", console.as_str());
    }
    crate::vfs::init(root_cfg, root_disk).expect("root filesystem");

    spawn_init();

    KSTAT.uptime.store(0, Ordering::Relaxed);
    kinfo!("entering the idle loop");
    idle_loop();
}

fn init_frames(info: &MultibootInfo) {
    let ram_bytes = info.available_bytes().min(u64::from(u32::MAX)) as u32;
    let nframes = (ram_bytes as usize) / PAGE_SIZE;

    // The frame records live right after the kernel image.
    // SAFETY: Linker-provided symbol; only its address is taken.
    let kernel_end = page_align_up(unsafe { &raw const __kernel_end } as u32);
    let table_bytes = nframes * core::mem::size_of::<Frame>();
    // SAFETY: The range past the image is unused RAM, mapped through
    // the kernel window, claimed here once.
    let storage = unsafe {
        core::slice::from_raw_parts_mut(kernel_end as *mut Frame, nframes)
    };
    let mut table = FrameTable::new(storage);

    for entry in info.mmap.iter().filter(|e| e.is_available()) {
        let start = entry.base.min(u64::from(u32::MAX)) as u32;
        let end = (entry.base + entry.len).min(u64::from(u32::MAX)) as u32;
        table.add_available(PhysAddr::new(start), PhysAddr::new(end));
    }
    // The image, the frame table itself, and the conventional low
    // memory the BIOS still owns.
    table.reserve_range(PhysAddr::new(0), PhysAddr::new(0x0001_0000));
    table.reserve_range(
        PhysAddr::new(0x0010_0000),
        // The image is linked high; its physical end is the window
        // offset, plus the frame records just placed after it.
        PhysAddr::new(kernel_end.wrapping_sub(KERNEL_BASE) + table_bytes as u32),
    );
    for module in &info.modules {
        table.reserve_range(PhysAddr::new(module.start), PhysAddr::new(module.end));
    }

    kinfo!(
        "{} frames tracked, {} free",
        table.total(),
        table.free()
    );
    FRAMES.with(|t| *t = Some(table));
}

fn init_kernel_paging(info: &MultibootInfo) {
    let ram_bytes = info.available_bytes().min(u64::from(u32::MAX)) as u32;
    with_frames(|frames| {
        let mut pa = phys::KernelWindow;
        let space = AddressSpace::new(frames, &mut pa).expect("kernel page directory");
        // Map every physical page into the high half.
        let mut at = 0u32;
        while at < ram_bytes {
            let p = PhysAddr::new(at);
            let f = baryon_mm::frame::FrameIdx::from(p);
            // Kernel mappings reference frames without owning them.
            space
                .map_page(
                    frames,
                    &mut pa,
                    p.to_virt(),
                    Some(f),
                    PageFlags::RW,
                )
                .ok();
            at = at.wrapping_add(PAGE_SIZE as u32);
            if at == 0 {
                break;
            }
        }
        KERNEL_DIR.store(space.dir_phys().as_u32(), Ordering::Release);
        phys::load_cr3(space.dir_phys());
    });
    kinfo!("kernel paging up");
}

/// Builds the ramdisk block device when `ramdisksize=` asks for one
/// or the loader passed an initrd module. Registered by the VFS
/// bring-up so it exists before the root mount.
fn build_ramdisk(
    options: &BootOptions,
    info: &MultibootInfo,
) -> Option<baryon_fs::device::BlockDevice> {
    use baryon_fs::device::{BlockDevice, MinorMap};
    if options.ramdisksize.is_none() && info.modules.is_empty() {
        return None;
    }
    let blksize = 1024;
    let size_kb = options.ramdisksize.unwrap_or(4096);
    let disk = if let Some(module) = info.modules.first() {
        // The initrd module becomes /dev/ram0.
        let len = (module.end - module.start) as usize;
        // SAFETY: The module range was reserved out of the free list at
        // frame-table init and is mapped through the window.
        let image = unsafe {
            core::slice::from_raw_parts(PhysAddr::new(module.start).to_virt().as_u32() as *const u8, len)
        };
        baryon_fs::ramdisk::RamDisk::from_image(image.to_vec(), blksize)
    } else {
        baryon_fs::ramdisk::RamDisk::new(size_kb as usize * 1024, blksize)
    };
    kinfo!("ramdisk: {size_kb} KiB");
    let mut minors = MinorMap::default();
    minors.set(0);
    Some(BlockDevice {
        name: "ramdisk",
        major: 1,
        minors,
        blksize,
        driver: alloc::sync::Arc::new(disk),
        queue: baryon_fs::blkqueue::RequestQueue::new(),
    })
}

/// Builds the init process: slot 1, PID 1, a fresh address space with
/// the trampoline installed and a user stack region. The image itself
/// comes from the external program loader; until it runs, init parks
/// in the kernel.
fn spawn_init() {
    with_proc(|t| {
        let slot = t.get_proc_free().expect("empty process table");
        assert_eq!(slot, INIT, "init must land in slot 1");
        let pid = t.get_unused_pid();
        {
            let p = t.get_mut(slot);
            p.pid = pid;
            p.ppid = 0;
            p.pgid = pid;
            p.sid = pid;
            p.start_time = timer::jiffies();
        }

        let space = with_frames(|frames| -> Result<AddressSpace> {
            let mut pa = phys::KernelWindow;
            let space = AddressSpace::new(frames, &mut pa)?;
            space.copy_kernel_entries(&kernel_space(), &mut pa);
            trampoline::install(&space, frames, &mut pa)?;
            Ok(space)
        })
        .expect("init address space");

        // A one-page stack region below the trampoline; the loader
        // grows it when it builds argv/envp.
        let stack_top = trampoline::TRAMPOLINE_ADDR - PAGE_SIZE as u32;
        t.get_mut(slot)
            .vmas
            .insert(baryon_mm::vma::Vma {
                start: stack_top - PAGE_SIZE as u32,
                end: stack_top,
                prot: Prot::READ | Prot::WRITE,
                share: Share::Private,
                offset: 0,
                section: baryon_mm::vma::Section::Stack,
                inode: None,
                open_mode: 0,
            })
            .expect("init stack region");

        // Kernel stack and task state.
        let kstack = with_frames(FrameTable::get_free_page).expect("init kernel stack");
        let esp0 = kstack.phys().to_virt().as_u32() + PAGE_SIZE as u32;
        {
            let p = t.get_mut(slot);
            p.space = Some(space);
            p.task.cr3 = space.dir_phys().as_u32();
            p.task.esp0 = esp0;
            p.task.esp = esp0 - TRAP_FRAME_SIZE;
            p.task.eip = init_thread as usize as u32;
        }
        let root = with_vfs(|v| {
            let root = v.root;
            v.inodes.grab(root);
            v.inodes.grab(root);
            root
        });
        {
            let p = t.get_mut(slot);
            p.root = Some(root);
            p.cwd = Some(root);
        }
        t.runnable(slot);
    });
    kinfo!("init spawned (pid 1)");
}

/// Where the init process starts until the program loader replaces its
/// image: yield forever.
extern "C" fn init_thread() -> ! {
    kinfo!("init: waiting for a program loader");
    loop {
        with_proc(|t| {
            let me = t.current;
            sleep(t, crate::proc::Process::channel(me), SleepKind::Interruptible);
        });
    }
}

fn idle_loop() -> ! {
    crate::arch::x86::sti();
    loop {
        crate::arch::x86::halt();
        with_proc(|t| {
            if t.need_resched {
                crate::sched::do_sched(t);
            }
        });
    }
}

/// Runs `f` over the current process's saved trap frame (top of its
/// kernel stack), for `sigreturn`.
pub fn with_current_trap_frame(f: impl FnOnce(&mut [u32; TRAP_FRAME_WORDS])) {
    let esp0 = with_proc(|t| t.current().task.esp0);
    let base = esp0 - TRAP_FRAME_SIZE;
    // SAFETY: The frame was built by the trap entry on this stack.
    let frame = unsafe { &mut *(base as *mut [u32; TRAP_FRAME_WORDS]) };
    f(frame);
}

/// Demand-pages a file-backed mapping: reads the page through the
/// filesystem, consulting the page hash for shared mappings so a
/// cached frame is reused instead of re-read.
pub fn demand_file_page(addr: VirtAddr) -> Result<()> {
    let page = addr.page_base();
    let (token, file_off, prot, share) = with_proc(|t| {
        let p = t.current();
        let vma = p.vmas.find_region(page.as_u32()).ok_or(Errno::EFAULT)?;
        let token = vma.inode.ok_or(Errno::EFAULT)?;
        Ok((
            token,
            vma.offset + (page.as_u32() - vma.start),
            vma.prot,
            vma.share,
        ))
    })?;
    let ino = baryon_fs::inode::InodeIdx::new(token);

    let (dev, num) = with_vfs(|v| {
        let i = v.inodes.get(ino);
        (i.dev, i.num)
    });
    let tag = PageTag {
        dev,
        inode: num,
        offset: file_off,
    };

    // Shared mappings may alias an already-cached frame.
    if share == Share::Shared {
        if let Some(frame) = with_frames(|f| f.search_page_hash(tag)) {
            return with_proc(|t| {
                let space = t.current().space.ok_or(Errno::EFAULT)?;
                with_frames_reclaiming(|frames| {
                    let mut pa = phys::KernelWindow;
                    frames.ref_frame(frame);
                    match space.map_page(frames, &mut pa, page, Some(frame), prot_flags(prot)) {
                        Ok(_) => Ok(()),
                        Err(e) => {
                            // Keep the closure retry-safe.
                            frames.release_page(frame);
                            Err(e)
                        }
                    }
                })
            });
        }
    }

    // Read the page contents through the filesystem.
    let mut data = alloc::vec![0u8; PAGE_SIZE];
    with_vfs(|v| {
        let sb = v.inodes.get(ino).sb.ok_or(Errno::EFAULT)?;
        let driver = v.mounts.driver(sb)?;
        let mut ctx = v.ctx();
        let n = driver.read(
            &mut ctx,
            ino,
            u64::from(file_off),
            &mut data,
            baryon_fs::file::OpenFlags::empty(),
        )?;
        // Short reads past EOF leave the tail zero-filled.
        let _ = n;
        Ok(())
    })?;

    with_proc(|t| {
        let space = t.current().space.ok_or(Errno::EFAULT)?;
        with_frames_reclaiming(|frames| {
            let frame = frames.get_free_page()?;
            let mut pa = phys::KernelWindow;
            // SAFETY: Fresh frame through the window.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    pa.page_ptr(frame.phys()),
                    PAGE_SIZE,
                );
            }
            if share == Share::Shared {
                frames.insert_page_hash(frame, tag);
            }
            match space.map_page(frames, &mut pa, page, Some(frame), prot_flags(prot)) {
                Ok(_) => Ok(()),
                Err(e) => {
                    // Keep the closure retry-safe.
                    frames.release_page(frame);
                    Err(e)
                }
            }
        })
    })
}

fn prot_flags(prot: Prot) -> PageFlags {
    let mut f = PageFlags::USER;
    if prot.contains(Prot::WRITE) {
        f |= PageFlags::RW;
    }
    f
}

/// Tears the global tables down in reverse init order; the kexec path
/// calls this before jumping to the next kernel.
pub fn teardown_for_kexec() {
    with_vfs(|v| {
        let _ = v.buffers.sync_dev(&mut v.devices, baryon_core::id::DevId::NONE);
    });
    crate::vfs::teardown();
    crate::proc::teardown();
    FRAMES.with(|t| *t = None);
}
