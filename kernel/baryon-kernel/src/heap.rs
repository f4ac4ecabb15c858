//! The kernel heap: the buddy sub-page allocator as `GlobalAlloc`.
//!
//! Requests that fit a sub-page block (and align to 16 or less) go
//! through the buddy levels; bigger or more-aligned requests take
//! whole frames. `kfree` may run from interrupt handlers, so the
//! allocator sits behind an interrupt-disabling lock.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use baryon_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use baryon_core::sync::IrqLock;
use baryon_mm::buddy::{BUDDY_MAX_LEVEL, BuddyAllocator, HEADER_SIZE, PageSource, level_size};
use baryon_mm::frame::{FrameFlags, FrameIdx};

static BUDDY: IrqLock<BuddyAllocator> = IrqLock::new(BuddyAllocator::new());

/// Page source drawing from the frame table and tagging frames as
/// buddy-owned.
struct FramePages;

impl PageSource for FramePages {
    fn alloc_page(&mut self) -> Option<NonNull<u8>> {
        crate::boot::with_frames(|frames| {
            let idx = frames.get_free_page().ok()?;
            frames.set_flags(idx, FrameFlags::BUDDY_LOW, true);
            NonNull::new(idx.phys().to_virt().as_u32() as *mut u8)
        })
    }

    fn free_page(&mut self, page: NonNull<u8>) {
        crate::boot::with_frames(|frames| {
            let phys = VirtAddr::new(page.as_ptr() as u32).to_phys();
            let idx = FrameIdx::from(phys);
            frames.set_flags(idx, FrameFlags::BUDDY_LOW, false);
            frames.release_page(idx);
        });
    }
}

struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= HEADER_SIZE && layout.size() + HEADER_SIZE <= level_size(BUDDY_MAX_LEVEL - 1)
        {
            let mut buddy = BUDDY.lock();
            // SAFETY: FramePages hands out valid page-aligned frames.
            return unsafe { buddy.alloc(layout.size(), &mut FramePages) }
                .map_or(core::ptr::null_mut(), NonNull::as_ptr);
        }
        // Whole frames for big or strongly aligned requests.
        let pages = layout.size().div_ceil(PAGE_SIZE);
        crate::boot::with_frames(|frames| {
            // Contiguity comes from grabbing consecutive free frames;
            // a single page is the common case.
            if pages == 1 {
                frames
                    .get_free_page()
                    .map(|f| f.phys().to_virt().as_u32() as *mut u8)
                    .unwrap_or(core::ptr::null_mut())
            } else {
                alloc_contiguous(frames, pages)
            }
        })
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() <= HEADER_SIZE && layout.size() + HEADER_SIZE <= level_size(BUDDY_MAX_LEVEL - 1)
        {
            let mut buddy = BUDDY.lock();
            if let Some(nn) = NonNull::new(ptr) {
                // SAFETY: The pointer came from the buddy path above.
                unsafe { buddy.free(nn, &mut FramePages) };
            }
            return;
        }
        let pages = layout.size().div_ceil(PAGE_SIZE);
        crate::boot::with_frames(|frames| {
            let base = VirtAddr::new(ptr as u32).to_phys();
            for i in 0..pages {
                let p = PhysAddr::new(base.as_u32() + (i * PAGE_SIZE) as u32);
                frames.release_page(FrameIdx::from(p));
            }
        });
    }
}

/// Largest multi-frame heap allocation, in pages.
const MAX_CONTIG: usize = 64;

fn alloc_contiguous(frames: &mut baryon_mm::frame::FrameTable, pages: usize) -> *mut u8 {
    // Grab frames until a consecutive run appears; give back the rest.
    // No heap use in here — this runs inside the allocator itself.
    if pages > MAX_CONTIG {
        return core::ptr::null_mut();
    }
    let mut held: [Option<FrameIdx>; MAX_CONTIG] = [None; MAX_CONTIG];
    let mut n = 0;
    let mut run_start: Option<usize> = None;
    while n < MAX_CONTIG {
        let Ok(f) = frames.get_free_page() else { break };
        held[n] = Some(f);
        n += 1;
        // Insertion keeps `held[..n]` sorted by frame index.
        let mut i = n - 1;
        while i > 0 && held[i - 1].unwrap().index() > held[i].unwrap().index() {
            held.swap(i - 1, i);
            i -= 1;
        }
        if let Some(w) = (0..n.saturating_sub(pages - 1)).find(|&s| {
            held[s + pages - 1].unwrap().index() - held[s].unwrap().index() == pages - 1
        }) {
            run_start = Some(held[w].unwrap().index());
            break;
        }
    }
    match run_start {
        Some(start) => {
            for f in held.iter().flatten() {
                if f.index() < start || f.index() >= start + pages {
                    frames.release_page(*f);
                }
            }
            FrameIdx::new(start as u32).phys().to_virt().as_u32() as *mut u8
        }
        None => {
            for f in held.iter().flatten() {
                frames.release_page(*f);
            }
            core::ptr::null_mut()
        }
    }
}

#[global_allocator]
static HEAP: KernelHeap = KernelHeap;

/// Nothing to construct — the allocator draws from the frame table —
/// but the boot order calls this to mark the heap live.
pub fn init() {
    baryon_core::kinfo!("kernel heap ready (buddy over the frame table)");
}
