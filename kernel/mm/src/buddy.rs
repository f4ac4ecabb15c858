//! Sub-page buddy allocator.
//!
//! Serves requests smaller than a page from power-of-two blocks of
//! 32..2048 bytes carved out of whole frames; anything larger falls
//! through to the page source. Every block starts with a header
//! `{level, prev, next}`, so a freed block re-enters its per-level free
//! list by address alone. On free, the buddy at
//! `addr ^ (1 << (level + 5))` is searched in the same-level list; if
//! present both coalesce and the merge recurses upward until a whole
//! page re-forms and returns to the page source.

use core::ptr::{self, NonNull};

use baryon_core::addr::PAGE_SIZE;

/// Level whose block size equals a whole page; requests that reach it
/// bypass the free lists.
pub const BUDDY_MAX_LEVEL: usize = 7;

/// Smallest block size (level 0).
pub const BUDDY_MIN_BLOCK: usize = 32;

/// Block size served at `level`.
#[must_use]
pub const fn level_size(level: usize) -> usize {
    BUDDY_MIN_BLOCK << level
}

/// Where the buddy allocator gets and returns whole frames.
///
/// The kernel implementation draws from the frame table and tags the
/// frame `BUDDY_LOW`; host tests hand out aligned heap pages.
pub trait PageSource {
    /// Allocates one page-aligned, page-sized block.
    fn alloc_page(&mut self) -> Option<NonNull<u8>>;
    /// Returns a page previously obtained from [`Self::alloc_page`].
    fn free_page(&mut self, page: NonNull<u8>);
}

#[repr(C)]
struct BlockHeader {
    level: u32,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

/// Size reserved for the in-block header; the usable payload of a
/// level-L block is `level_size(L) - HEADER_SIZE` bytes. On the 32-bit
/// target the header is 12 bytes; host test builds carry 64-bit
/// pointers, so the reservation widens there.
pub const HEADER_SIZE: usize = if core::mem::size_of::<usize>() == 4 {
    16
} else {
    32
};

const _: () = assert!(core::mem::size_of::<BlockHeader>() <= HEADER_SIZE);

/// Per-level allocation counters, in the style of the kernel statistics
/// block.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuddyStats {
    /// Live allocations per level.
    pub count: [usize; BUDDY_MAX_LEVEL],
    /// Total bytes currently handed out (block-size granularity).
    pub mem_used: usize,
    /// Whole pages currently owned by the allocator.
    pub pages: usize,
}

/// The sub-page allocator.
///
/// Not `Sync`; the kernel wraps it in an [`IrqLock`] because `kfree`
/// runs from interrupt handlers.
///
/// [`IrqLock`]: baryon_core::sync::IrqLock
pub struct BuddyAllocator {
    freelist: [*mut BlockHeader; BUDDY_MAX_LEVEL],
    stats: BuddyStats,
}

// SAFETY: The raw list pointers are only touched through &mut self; the
// owner provides the locking.
unsafe impl Send for BuddyAllocator {}

impl BuddyAllocator {
    /// Creates an empty allocator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            freelist: [ptr::null_mut(); BUDDY_MAX_LEVEL],
            stats: BuddyStats {
                count: [0; BUDDY_MAX_LEVEL],
                mem_used: 0,
                pages: 0,
            },
        }
    }

    /// Returns the current counters.
    #[must_use]
    pub fn stats(&self) -> BuddyStats {
        self.stats
    }

    fn level_for(total: usize) -> usize {
        let mut level = 0;
        while level < BUDDY_MAX_LEVEL && level_size(level) < total {
            level += 1;
        }
        level
    }

    /// Allocates `size` usable bytes.
    ///
    /// Returns a pointer past the block header, or `None` when the page
    /// source is exhausted. Requests whose block would exceed 2048 bytes
    /// take a whole page.
    ///
    /// # Safety
    ///
    /// `source` must hand out valid, page-aligned, exclusively-owned
    /// pages, and the same `source` must be used for the matching
    /// [`Self::free`].
    pub unsafe fn alloc(&mut self, size: usize, source: &mut dyn PageSource) -> Option<NonNull<u8>> {
        let level = Self::level_for(size + HEADER_SIZE);
        let block = unsafe { self.allocate_block(level, source) }?;
        if level < BUDDY_MAX_LEVEL {
            self.stats.count[level] += 1;
            self.stats.mem_used += level_size(level);
        }
        // SAFETY: The block is at least HEADER_SIZE + size bytes.
        Some(unsafe { NonNull::new_unchecked(block.cast::<u8>().add(HEADER_SIZE)) })
    }

    /// Frees a block returned by [`Self::alloc`].
    ///
    /// # Safety
    ///
    /// `addr` must come from this allocator and not be freed twice;
    /// `source` must be the one used at allocation time.
    pub unsafe fn free(&mut self, addr: NonNull<u8>, source: &mut dyn PageSource) {
        // SAFETY: alloc() returned addr = header + HEADER_SIZE.
        let block = unsafe { addr.as_ptr().sub(HEADER_SIZE) }.cast::<BlockHeader>();
        // SAFETY: The header was written by allocate_block.
        let level = unsafe { (*block).level } as usize;
        if level < BUDDY_MAX_LEVEL {
            self.stats.count[level] -= 1;
            self.stats.mem_used -= level_size(level);
        }
        unsafe { self.deallocate_block(block, source) };
    }

    unsafe fn allocate_block(
        &mut self,
        level: usize,
        source: &mut dyn PageSource,
    ) -> Option<*mut BlockHeader> {
        if level >= BUDDY_MAX_LEVEL {
            let page = source.alloc_page()?;
            self.stats.pages += 1;
            let block = page.as_ptr().cast::<BlockHeader>();
            // SAFETY: A fresh page holds at least one header.
            unsafe {
                (*block).level = BUDDY_MAX_LEVEL as u32;
                (*block).prev = ptr::null_mut();
                (*block).next = ptr::null_mut();
            }
            return Some(block);
        }

        if !self.freelist[level].is_null() {
            let block = self.freelist[level];
            unsafe { self.unlink(block) };
            // SAFETY: block came off the level's free list.
            unsafe { (*block).level = level as u32 };
            return Some(block);
        }

        // Split a bigger block: keep the low half, free-list the buddy.
        let block = unsafe { self.allocate_block(level + 1, source) }?;
        // SAFETY: block spans level_size(level + 1) bytes, so its high
        // half is a valid level-sized block.
        unsafe {
            (*block).level = level as u32;
            let buddy = Self::buddy_of(block, level);
            (*buddy).level = level as u32;
            self.push(buddy, level);
        }
        Some(block)
    }

    unsafe fn deallocate_block(&mut self, block: *mut BlockHeader, source: &mut dyn PageSource) {
        // SAFETY: Caller guarantees block validity.
        let level = unsafe { (*block).level } as usize;

        if level >= BUDDY_MAX_LEVEL {
            self.stats.pages -= 1;
            // SAFETY: A max-level block is a whole page from the source.
            source.free_page(unsafe { NonNull::new_unchecked(block.cast::<u8>()) });
            return;
        }

        let buddy = unsafe { Self::buddy_of(block, level) };
        if unsafe { self.on_freelist(buddy, level) } {
            // Coalesce: pull the buddy out and merge into the lower of
            // the pair, one level up.
            unsafe {
                self.unlink(buddy);
                let merged = if block < buddy { block } else { buddy };
                (*merged).level = level as u32 + 1;
                self.deallocate_block(merged, source);
            }
        } else {
            unsafe { self.push(block, level) };
        }
    }

    unsafe fn buddy_of(block: *mut BlockHeader, level: usize) -> *mut BlockHeader {
        let mask = 1usize << (level + 5);
        ((block as usize) ^ mask) as *mut BlockHeader
    }

    unsafe fn on_freelist(&self, block: *mut BlockHeader, level: usize) -> bool {
        let mut cur = self.freelist[level];
        while !cur.is_null() {
            if cur == block {
                return true;
            }
            // SAFETY: Free-list nodes hold valid headers.
            cur = unsafe { (*cur).next };
        }
        false
    }

    unsafe fn push(&mut self, block: *mut BlockHeader, level: usize) {
        // SAFETY: Caller guarantees block validity.
        unsafe {
            (*block).prev = ptr::null_mut();
            (*block).next = self.freelist[level];
            if !self.freelist[level].is_null() {
                (*self.freelist[level]).prev = block;
            }
        }
        self.freelist[level] = block;
    }

    unsafe fn unlink(&mut self, block: *mut BlockHeader) {
        // SAFETY: block is on the free list of its level.
        unsafe {
            let level = (*block).level as usize;
            if !(*block).next.is_null() {
                (*(*block).next).prev = (*block).prev;
            }
            if !(*block).prev.is_null() {
                (*(*block).prev).next = (*block).next;
            }
            if self.freelist[level] == block {
                self.freelist[level] = (*block).next;
            }
            (*block).prev = ptr::null_mut();
            (*block).next = ptr::null_mut();
        }
    }

    /// Checks the coalesce invariant: every free block is aligned to its
    /// level size and no two same-level free blocks are buddies.
    ///
    /// # Panics
    ///
    /// Panics on the first violation.
    pub fn assert_consistent(&self) {
        for level in 0..BUDDY_MAX_LEVEL {
            let mut cur = self.freelist[level];
            while !cur.is_null() {
                let addr = cur as usize;
                assert_eq!(
                    addr % level_size(level),
                    0,
                    "free block {addr:#x} misaligned for level {level}"
                );
                let buddy = addr ^ (1 << (level + 5));
                // SAFETY: Walking our own free list.
                unsafe {
                    assert!(
                        !self.on_freelist(buddy as *mut BlockHeader, level),
                        "buddies {addr:#x}/{buddy:#x} both free at level {level}"
                    );
                    cur = (*cur).next;
                }
            }
        }
    }
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;
    use std::collections::HashSet;

    /// Page source backed by the host allocator; tracks outstanding
    /// pages so tests can assert they all come back.
    struct HostPages {
        live: HashSet<usize>,
    }

    impl HostPages {
        fn new() -> Self {
            Self {
                live: HashSet::new(),
            }
        }
    }

    impl PageSource for HostPages {
        fn alloc_page(&mut self) -> Option<NonNull<u8>> {
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: non-zero, valid layout.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            let nn = NonNull::new(ptr)?;
            self.live.insert(ptr as usize);
            Some(nn)
        }

        fn free_page(&mut self, page: NonNull<u8>) {
            assert!(
                self.live.remove(&(page.as_ptr() as usize)),
                "returned page was not allocated"
            );
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: page came from alloc_page with this layout.
            unsafe { std::alloc::dealloc(page.as_ptr(), layout) };
        }
    }

    #[test]
    fn small_alloc_and_coalesce_back_to_page() {
        let mut buddy = BuddyAllocator::new();
        let mut src = HostPages::new();

        let a = unsafe { buddy.alloc(16, &mut src) }.unwrap();
        assert_eq!(src.live.len(), 1);
        let level = BuddyAllocator::level_for(16 + HEADER_SIZE);
        assert_eq!(buddy.stats().count[level], 1);
        buddy.assert_consistent();

        unsafe { buddy.free(a, &mut src) };
        assert_eq!(
            src.live.len(),
            0,
            "full coalescing must return the page to the source"
        );
        assert_eq!(buddy.stats().mem_used, 0);
    }

    #[test]
    fn buddies_do_not_both_sit_free() {
        let mut buddy = BuddyAllocator::new();
        let mut src = HostPages::new();

        let a = unsafe { buddy.alloc(16, &mut src) }.unwrap();
        let b = unsafe { buddy.alloc(16, &mut src) }.unwrap();
        buddy.assert_consistent();
        unsafe { buddy.free(a, &mut src) };
        buddy.assert_consistent();
        unsafe { buddy.free(b, &mut src) };
        assert_eq!(src.live.len(), 0);
    }

    #[test]
    fn level_selection_accounts_for_header() {
        // level_for sees the header-inclusive total.
        assert_eq!(BuddyAllocator::level_for(32), 0);
        assert_eq!(BuddyAllocator::level_for(33), 1);
        assert_eq!(BuddyAllocator::level_for(2048), 6);
        assert_eq!(BuddyAllocator::level_for(2049), BUDDY_MAX_LEVEL);
    }

    #[test]
    fn large_request_takes_whole_page() {
        let mut buddy = BuddyAllocator::new();
        let mut src = HostPages::new();
        let p = unsafe { buddy.alloc(3000, &mut src) }.unwrap();
        assert_eq!(buddy.stats().pages, 1);
        unsafe { buddy.free(p, &mut src) };
        assert_eq!(buddy.stats().pages, 0);
        assert_eq!(src.live.len(), 0);
    }

    #[test]
    fn mixed_sizes_all_return() {
        let mut buddy = BuddyAllocator::new();
        let mut src = HostPages::new();
        let mut blocks = Vec::new();
        for size in [10usize, 40, 100, 200, 500, 1000, 1900, 10, 40] {
            blocks.push(unsafe { buddy.alloc(size, &mut src) }.unwrap());
        }
        buddy.assert_consistent();
        // Free in an interleaved order to exercise partial coalescing.
        for i in [0usize, 2, 4, 6, 8, 1, 3, 5, 7] {
            unsafe { buddy.free(blocks[i], &mut src) };
            buddy.assert_consistent();
        }
        assert_eq!(src.live.len(), 0, "all pages must coalesce and return");
        assert_eq!(buddy.stats().mem_used, 0);
    }

    #[test]
    fn payloads_do_not_overlap() {
        let mut buddy = BuddyAllocator::new();
        let mut src = HostPages::new();
        let a = unsafe { buddy.alloc(48, &mut src) }.unwrap();
        let b = unsafe { buddy.alloc(48, &mut src) }.unwrap();
        // Fill both payloads and verify no cross-talk.
        unsafe {
            core::ptr::write_bytes(a.as_ptr(), 0xAA, 48);
            core::ptr::write_bytes(b.as_ptr(), 0x55, 48);
            for i in 0..48 {
                assert_eq!(*a.as_ptr().add(i), 0xAA);
                assert_eq!(*b.as_ptr().add(i), 0x55);
            }
            buddy.free(a, &mut src);
            buddy.free(b, &mut src);
        }
    }
}
