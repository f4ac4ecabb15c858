//! Physical frame table.
//!
//! One [`Frame`] record per 4 KiB of physical memory, held in a storage
//! slice the boot code places right after the kernel image. The free
//! list and the file-page hash are threaded through the records as
//! index links, so there are no pointers to dangle: a frame is named by
//! its [`FrameIdx`] everywhere.
//!
//! Boot protocol: [`FrameTable::new`] starts with every frame reserved;
//! the caller releases each BIOS-reported available range with
//! [`FrameTable::add_available`], then re-reserves the kernel image and
//! any ranges claimed before paging is enabled with
//! [`FrameTable::reserve_range`].

use baryon_core::addr::{PAGE_SHIFT, PhysAddr};
use baryon_core::id::DevId;
use baryon_core::{Errno, Result};
use bitflags::bitflags;

/// Number of buckets in the file-page hash.
const PAGE_HASH_SIZE: usize = 1024;

bitflags! {
    /// Per-frame state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Frame is pinned and may not be reclaimed.
        const LOCKED = 0x01;
        /// Frame is owned by the sub-page (buddy) allocator.
        const BUDDY_LOW = 0x02;
        /// Frame is permanently reserved and never enters the free list.
        const RESERVED = 0x04;
        /// Frame is shared copy-on-write.
        const COW = 0x08;
    }
}

/// Index of a frame in the table; frame `i` covers physical
/// `[i << 12, (i + 1) << 12)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameIdx(u32);

impl FrameIdx {
    /// Creates an index from a raw frame number.
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw frame number.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the physical base address of the frame.
    #[must_use]
    pub const fn phys(self) -> PhysAddr {
        PhysAddr::new(self.0 << PAGE_SHIFT)
    }
}

impl From<PhysAddr> for FrameIdx {
    fn from(addr: PhysAddr) -> Self {
        Self(addr.frame_index() as u32)
    }
}

/// Identity of a cached file page: which inode, at which page-aligned
/// offset, on which device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTag {
    /// Device holding the file.
    pub dev: DevId,
    /// Inode number of the file.
    pub inode: u32,
    /// Byte offset of the page within the file (page-aligned).
    pub offset: u32,
}

impl PageTag {
    fn bucket(&self) -> usize {
        let h = self
            .inode
            .wrapping_mul(31)
            .wrapping_add(self.offset >> PAGE_SHIFT)
            .wrapping_add(self.dev.as_raw());
        h as usize % PAGE_HASH_SIZE
    }
}

/// A physical frame descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Reference count; 0 means the frame is free (or reserved).
    pub count: u32,
    /// State bits.
    pub flags: FrameFlags,
    /// File-page identity when the frame caches file contents.
    pub tag: Option<PageTag>,
    prev_free: Option<u32>,
    next_free: Option<u32>,
    prev_hash: Option<u32>,
    next_hash: Option<u32>,
}

impl Frame {
    /// A reserved, unlinked frame record (the boot-time initial state).
    pub const EMPTY: Frame = Frame {
        count: 0,
        flags: FrameFlags::RESERVED,
        tag: None,
        prev_free: None,
        next_free: None,
        prev_hash: None,
        next_hash: None,
    };
}

impl Default for Frame {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Hook invoked when the free list runs dry; returns how many frames it
/// released back. The buffer cache registers its clean-page reclaimer
/// here.
pub type ReclaimFn = fn() -> usize;

/// The global frame table.
pub struct FrameTable {
    frames: &'static mut [Frame],
    free_head: Option<u32>,
    free_count: usize,
    hash: [Option<u32>; PAGE_HASH_SIZE],
    reclaim: Option<ReclaimFn>,
}

impl FrameTable {
    /// Builds a table over `storage`, with every frame initially
    /// reserved. The caller releases available ranges afterwards.
    pub fn new(storage: &'static mut [Frame]) -> Self {
        for f in storage.iter_mut() {
            *f = Frame::EMPTY;
        }
        Self {
            frames: storage,
            free_head: None,
            free_count: 0,
            hash: [None; PAGE_HASH_SIZE],
            reclaim: None,
        }
    }

    /// Registers the OOM reclaim hook.
    pub fn set_reclaim_hook(&mut self, hook: ReclaimFn) {
        self.reclaim = Some(hook);
    }

    /// Number of frames tracked.
    #[must_use]
    pub fn total(&self) -> usize {
        self.frames.len()
    }

    /// Number of frames currently on the free list.
    #[must_use]
    pub fn free(&self) -> usize {
        self.free_count
    }

    /// Returns a copy of the frame record.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is out of range.
    #[must_use]
    pub fn get(&self, idx: FrameIdx) -> Frame {
        self.frames[idx.index()]
    }

    /// Marks a physical range available, pushing its frames on the free
    /// list. Partially covered frames at the edges stay reserved.
    pub fn add_available(&mut self, start: PhysAddr, end: PhysAddr) {
        let first = PhysAddr::new(baryon_core::addr::page_align_up(start.as_u32())).frame_index();
        let last = end.frame_index(); // exclusive
        for i in first..last.min(self.frames.len()) {
            let f = &mut self.frames[i];
            if f.flags.contains(FrameFlags::RESERVED) && f.count == 0 && f.next_free.is_none() {
                f.flags = FrameFlags::empty();
                self.push_free(i as u32);
            }
        }
    }

    /// Permanently reserves `[start, end)`; frames already free are
    /// pulled off the free list.
    pub fn reserve_range(&mut self, start: PhysAddr, end: PhysAddr) {
        let first = start.page_base().frame_index();
        let last = PhysAddr::new(baryon_core::addr::page_align_up(end.as_u32())).frame_index();
        for i in first..last.min(self.frames.len()) {
            if !self.frames[i].flags.contains(FrameFlags::RESERVED) {
                if self.frames[i].count == 0 {
                    self.unlink_free(i as u32);
                }
                self.frames[i].flags = FrameFlags::RESERVED;
            }
        }
    }

    /// Allocates a frame off the free-list head.
    ///
    /// On an empty list the reclaim hook runs once; if it yields nothing
    /// the allocation fails with `ENOMEM`.
    pub fn get_free_page(&mut self) -> Result<FrameIdx> {
        if self.free_head.is_none() {
            if let Some(hook) = self.reclaim {
                if hook() == 0 {
                    return Err(Errno::ENOMEM);
                }
            } else {
                return Err(Errno::ENOMEM);
            }
        }
        let idx = self.free_head.ok_or(Errno::ENOMEM)?;
        self.unlink_free(idx);
        let f = &mut self.frames[idx as usize];
        f.count = 1;
        f.flags = FrameFlags::empty();
        f.tag = None;
        Ok(FrameIdx(idx))
    }

    /// Takes an extra reference on a frame.
    pub fn ref_frame(&mut self, idx: FrameIdx) {
        self.frames[idx.index()].count += 1;
    }

    /// Drops one reference; at zero the frame is detached from the page
    /// hash, its flags cleared, and it returns to the free list.
    ///
    /// # Panics
    ///
    /// Panics if the frame's count is already zero — free-page
    /// accounting corruption is fatal.
    pub fn release_page(&mut self, idx: FrameIdx) {
        let i = idx.index();
        assert!(
            self.frames[i].count > 0,
            "release of free frame {i} corrupts the frame accounting"
        );
        self.frames[i].count -= 1;
        if self.frames[i].count == 0 {
            if self.frames[i].tag.is_some() {
                self.unlink_hash(idx);
            }
            self.frames[i].flags = FrameFlags::empty();
            self.push_free(i as u32);
        }
    }

    /// Sets or clears a flag on a frame.
    pub fn set_flags(&mut self, idx: FrameIdx, flags: FrameFlags, on: bool) {
        self.frames[idx.index()].flags.set(flags, on);
    }

    /// Looks up a frame caching the given file page.
    #[must_use]
    pub fn search_page_hash(&self, tag: PageTag) -> Option<FrameIdx> {
        let mut cur = self.hash[tag.bucket()];
        while let Some(i) = cur {
            if self.frames[i as usize].tag == Some(tag) {
                return Some(FrameIdx(i));
            }
            cur = self.frames[i as usize].next_hash;
        }
        None
    }

    /// Tags a frame as caching a file page and inserts it in the hash.
    ///
    /// # Panics
    ///
    /// Panics if the frame already carries a tag.
    pub fn insert_page_hash(&mut self, idx: FrameIdx, tag: PageTag) {
        let i = idx.index();
        assert!(self.frames[i].tag.is_none(), "frame {i} already hashed");
        let bucket = tag.bucket();
        self.frames[i].tag = Some(tag);
        self.frames[i].prev_hash = None;
        self.frames[i].next_hash = self.hash[bucket];
        if let Some(head) = self.hash[bucket] {
            self.frames[head as usize].prev_hash = Some(i as u32);
        }
        self.hash[bucket] = Some(i as u32);
    }

    /// Removes a frame from the page hash (keeps the frame allocated).
    pub fn remove_page_hash(&mut self, idx: FrameIdx) {
        if self.frames[idx.index()].tag.is_some() {
            self.unlink_hash(idx);
        }
    }

    fn unlink_hash(&mut self, idx: FrameIdx) {
        let i = idx.index();
        let tag = self.frames[i].tag.take().expect("frame not hashed");
        let (prev, next) = (self.frames[i].prev_hash, self.frames[i].next_hash);
        if let Some(p) = prev {
            self.frames[p as usize].next_hash = next;
        } else {
            self.hash[tag.bucket()] = next;
        }
        if let Some(n) = next {
            self.frames[n as usize].prev_hash = prev;
        }
        self.frames[i].prev_hash = None;
        self.frames[i].next_hash = None;
    }

    fn push_free(&mut self, i: u32) {
        self.frames[i as usize].prev_free = None;
        self.frames[i as usize].next_free = self.free_head;
        if let Some(head) = self.free_head {
            self.frames[head as usize].prev_free = Some(i);
        }
        self.free_head = Some(i);
        self.free_count += 1;
    }

    fn unlink_free(&mut self, i: u32) {
        let (prev, next) = (
            self.frames[i as usize].prev_free,
            self.frames[i as usize].next_free,
        );
        if let Some(p) = prev {
            self.frames[p as usize].next_free = next;
        } else if self.free_head == Some(i) {
            self.free_head = next;
        } else {
            return; // not on the list
        }
        if let Some(n) = next {
            self.frames[n as usize].prev_free = prev;
        }
        self.frames[i as usize].prev_free = None;
        self.frames[i as usize].next_free = None;
        self.free_count -= 1;
    }

    /// Verifies the frame accounting invariant: a non-reserved frame has
    /// `count == 0` iff it is on the free list, and the free counter
    /// matches the list length.
    ///
    /// # Panics
    ///
    /// Panics on the first violation found.
    pub fn assert_consistent(&self) {
        let mut on_list = 0usize;
        let mut cur = self.free_head;
        while let Some(i) = cur {
            let f = &self.frames[i as usize];
            assert_eq!(f.count, 0, "frame {i} on free list with count != 0");
            assert!(
                !f.flags.contains(FrameFlags::RESERVED),
                "reserved frame {i} on free list"
            );
            on_list += 1;
            assert!(on_list <= self.frames.len(), "free list cycle");
            cur = f.next_free;
        }
        assert_eq!(on_list, self.free_count, "free counter drifted");
        let expect_free = self
            .frames
            .iter()
            .filter(|f| f.count == 0 && !f.flags.contains(FrameFlags::RESERVED))
            .count();
        assert_eq!(on_list, expect_free, "free frame not on free list");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: usize) -> FrameTable {
        let storage = vec![Frame::EMPTY; n].leak();
        let mut t = FrameTable::new(storage);
        t.add_available(PhysAddr::new(0), PhysAddr::new((n as u32) << PAGE_SHIFT));
        t
    }

    #[test]
    fn alloc_release_round_trip() {
        let mut t = table(8);
        assert_eq!(t.free(), 8);
        let f = t.get_free_page().unwrap();
        assert_eq!(t.free(), 7);
        assert_eq!(t.get(f).count, 1);
        t.release_page(f);
        assert_eq!(t.free(), 8);
        t.assert_consistent();
    }

    #[test]
    fn refcount_delays_free() {
        let mut t = table(4);
        let f = t.get_free_page().unwrap();
        t.ref_frame(f);
        t.release_page(f);
        assert_eq!(t.get(f).count, 1, "one reference must remain");
        assert_eq!(t.free(), 3);
        t.release_page(f);
        assert_eq!(t.free(), 4);
        t.assert_consistent();
    }

    #[test]
    fn reserved_never_allocated() {
        let mut t = table(4);
        t.reserve_range(PhysAddr::new(0), PhysAddr::new(0x4000));
        assert_eq!(t.free(), 0);
        assert_eq!(t.get_free_page().unwrap_err(), Errno::ENOMEM);
        t.assert_consistent();
    }

    #[test]
    fn partial_edge_stays_reserved() {
        let storage = vec![Frame::EMPTY; 4].leak();
        let mut t = FrameTable::new(storage);
        // Range starts mid-frame: frame 0 must not become available.
        t.add_available(PhysAddr::new(0x800), PhysAddr::new(0x4000));
        assert_eq!(t.free(), 3);
    }

    #[test]
    fn page_hash_lookup() {
        let mut t = table(8);
        let tag = PageTag {
            dev: DevId::new(3, 0),
            inode: 12,
            offset: 0x2000,
        };
        assert_eq!(t.search_page_hash(tag), None);
        let f = t.get_free_page().unwrap();
        t.insert_page_hash(f, tag);
        assert_eq!(t.search_page_hash(tag), Some(f));

        // A different offset misses.
        let other = PageTag {
            offset: 0x3000,
            ..tag
        };
        assert_eq!(t.search_page_hash(other), None);

        // Release detaches from the hash.
        t.release_page(f);
        assert_eq!(t.search_page_hash(tag), None);
        t.assert_consistent();
    }

    #[test]
    fn hash_collision_chain() {
        let mut t = table(16);
        // Same bucket by construction: identical inode/offset, devs with
        // raw values PAGE_HASH_SIZE apart.
        let t1 = PageTag {
            dev: DevId::from_raw(1),
            inode: 5,
            offset: 0,
        };
        let t2 = PageTag {
            dev: DevId::from_raw(1 + 1024),
            inode: 5,
            offset: 0,
        };
        let f1 = t.get_free_page().unwrap();
        let f2 = t.get_free_page().unwrap();
        t.insert_page_hash(f1, t1);
        t.insert_page_hash(f2, t2);
        assert_eq!(t.search_page_hash(t1), Some(f1));
        assert_eq!(t.search_page_hash(t2), Some(f2));
        t.release_page(f2);
        assert_eq!(t.search_page_hash(t1), Some(f1));
        assert_eq!(t.search_page_hash(t2), None);
    }

    #[test]
    fn oom_consults_reclaim_hook() {
        use core::sync::atomic::{AtomicBool, Ordering};
        static HOOK_RAN: AtomicBool = AtomicBool::new(false);
        fn no_reclaim() -> usize {
            HOOK_RAN.store(true, Ordering::Relaxed);
            0
        }
        let mut t = table(1);
        t.set_reclaim_hook(no_reclaim);
        let f = t.get_free_page().unwrap();
        assert_eq!(t.get_free_page().unwrap_err(), Errno::ENOMEM);
        assert!(
            HOOK_RAN.load(Ordering::Relaxed),
            "reclaim hook must run before OOM"
        );
        t.release_page(f);
        assert!(t.get_free_page().is_ok());
    }

    #[test]
    #[should_panic(expected = "corrupts the frame accounting")]
    fn double_release_panics() {
        let mut t = table(2);
        let f = t.get_free_page().unwrap();
        t.release_page(f);
        t.release_page(f);
    }
}
