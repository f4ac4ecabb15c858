//! Per-process virtual memory regions.
//!
//! A process's address space is described by a bounded, sorted list of
//! disjoint half-open regions. The list answers "what backs this
//! address" for the page-fault handler, finds gaps for `mmap`, and is
//! split at page boundaries by `munmap`/`mprotect`.

use baryon_core::addr::{PAGE_SIZE, VirtAddr, page_align_up};
use baryon_core::{Errno, Result};
use bitflags::bitflags;
use planck_noalloc::vec::ArrayVec;

/// Maximum regions per process.
pub const VMA_REGIONS: usize = 64;

/// `mmap` placements start at 1 GiB.
pub const MMAP_START: u32 = 0x4000_0000;

/// Top of the user address space (the kernel half begins here).
pub const USER_TOP: u32 = 0xC000_0000;

bitflags! {
    /// Region protection bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        /// Readable.
        const READ = 0x1;
        /// Writable.
        const WRITE = 0x2;
        /// Executable.
        const EXEC = 0x4;
    }
}

/// Share mode of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Share {
    /// Writes are private to this process (copy-on-write across fork).
    Private,
    /// Writes are visible to every mapper of the backing object.
    Shared,
}

/// What part of the image a region belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Program text.
    Text,
    /// Initialized data.
    Data,
    /// Zero-initialized data.
    Bss,
    /// The brk-grown heap.
    Heap,
    /// The main stack.
    Stack,
    /// An `mmap` mapping.
    Mmap,
    /// System V shared memory attach.
    Shm,
}

/// A contiguous region `[start, end)` with uniform backing.
#[derive(Debug, Clone, Copy)]
pub struct Vma {
    /// First address of the region.
    pub start: u32,
    /// One past the last address.
    pub end: u32,
    /// Protection bits.
    pub prot: Prot,
    /// Share mode.
    pub share: Share,
    /// Byte offset into the backing file at `start`.
    pub offset: u32,
    /// Section tag.
    pub section: Section,
    /// Opaque inode-table token of the backing file, if file-backed.
    /// The owner of the vma list interprets it; `None` means anonymous.
    pub inode: Option<u32>,
    /// Open mode the file was mapped with.
    pub open_mode: u8,
}

impl Vma {
    /// Returns true if `addr` falls inside the region.
    #[must_use]
    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// The sorted region list of one process.
#[derive(Debug)]
pub struct VmaTable {
    regions: ArrayVec<Vma, VMA_REGIONS>,
    /// Lower watermark of the heap (set by exec, fixed afterwards).
    pub brk_lower: u32,
    /// Current program break.
    pub brk: u32,
}

impl Default for VmaTable {
    fn default() -> Self {
        Self::new()
    }
}

impl VmaTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: ArrayVec::new(),
            brk_lower: 0,
            brk: 0,
        }
    }

    /// Number of regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns true if no regions exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Iterates the regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.regions.iter()
    }

    /// Copies the table for fork: same regions, same heap bounds.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        let mut copy = Self::new();
        for v in self.regions.iter() {
            copy.regions.push(*v);
        }
        copy.brk_lower = self.brk_lower;
        copy.brk = self.brk;
        copy
    }

    /// Removes every region (exec teardown).
    pub fn clear(&mut self) {
        while self.regions.pop().is_some() {}
        self.brk_lower = 0;
        self.brk = 0;
    }

    /// Returns the region containing `addr`.
    #[must_use]
    pub fn find_region(&self, addr: u32) -> Option<&Vma> {
        self.regions.iter().find(|v| v.contains(addr))
    }

    /// Inserts a region, keeping the list sorted.
    ///
    /// Fails with `EINVAL` on a malformed or overlapping region and
    /// `ENOMEM` when the table is full.
    pub fn insert(&mut self, vma: Vma) -> Result<()> {
        if vma.end <= vma.start {
            return Err(Errno::EINVAL);
        }
        if self.intersects(vma.start, vma.end) {
            return Err(Errno::EINVAL);
        }
        if self.regions.is_full() {
            return Err(Errno::ENOMEM);
        }
        let pos = self
            .regions
            .iter()
            .position(|v| v.start > vma.start)
            .unwrap_or(self.regions.len());
        self.regions.insert(pos, vma);
        Ok(())
    }

    /// Returns true if any region intersects `[start, end)`.
    #[must_use]
    pub fn intersects(&self, start: u32, end: u32) -> bool {
        self.regions.iter().any(|v| v.start < end && start < v.end)
    }

    /// Finds the lowest gap of `len` bytes at or above [`MMAP_START`].
    ///
    /// Fails with `ENOMEM` when the user half has no such gap.
    pub fn find_unmapped(&self, len: u32) -> Result<u32> {
        let len = page_align_up(len);
        if len == 0 || len > USER_TOP - MMAP_START {
            return Err(Errno::ENOMEM);
        }
        let mut candidate = MMAP_START;
        for v in self.regions.iter() {
            if v.end <= candidate {
                continue;
            }
            if v.start >= candidate && v.start - candidate >= len {
                return Ok(candidate);
            }
            candidate = page_align_up(v.end.max(candidate));
        }
        if USER_TOP - candidate >= len {
            Ok(candidate)
        } else {
            Err(Errno::ENOMEM)
        }
    }

    /// Removes `[start, end)` from the table, splitting regions that
    /// straddle a boundary. Returns the number of regions touched.
    ///
    /// `start` and `end` must be page-aligned.
    pub fn unmap_range(&mut self, start: u32, end: u32) -> Result<usize> {
        if start % PAGE_SIZE as u32 != 0 || end <= start {
            return Err(Errno::EINVAL);
        }
        let mut touched = 0;
        let mut i = 0;
        while i < self.regions.len() {
            let v = self.regions[i];
            if v.end <= start || v.start >= end {
                i += 1;
                continue;
            }
            touched += 1;
            let keep_low = v.start < start;
            let keep_high = v.end > end;
            match (keep_low, keep_high) {
                (false, false) => {
                    self.regions.remove(i);
                }
                (true, false) => {
                    self.regions[i].end = start;
                    i += 1;
                }
                (false, true) => {
                    let delta = end - v.start;
                    self.regions[i].start = end;
                    self.regions[i].offset = v.offset.wrapping_add(delta);
                    i += 1;
                }
                (true, true) => {
                    // Split in two around the hole.
                    if self.regions.is_full() {
                        return Err(Errno::ENOMEM);
                    }
                    self.regions[i].end = start;
                    let mut high = v;
                    high.start = end;
                    high.offset = v.offset.wrapping_add(end - v.start);
                    self.regions.insert(i + 1, high);
                    i += 2;
                }
            }
        }
        Ok(touched)
    }

    /// Changes the protection of `[start, end)`, splitting at the
    /// boundaries. Fails with `ENOMEM` if the range is not fully mapped.
    pub fn protect_range(&mut self, start: u32, end: u32, prot: Prot) -> Result<()> {
        if start % PAGE_SIZE as u32 != 0 || end <= start {
            return Err(Errno::EINVAL);
        }
        // POSIX: the whole range must be mapped.
        let mut addr = start;
        while addr < end {
            let v = self.find_region(addr).ok_or(Errno::ENOMEM)?;
            addr = v.end;
        }

        let mut i = 0;
        while i < self.regions.len() {
            let v = self.regions[i];
            if v.end <= start || v.start >= end {
                i += 1;
                continue;
            }
            if v.start < start {
                // Carve off the untouched low part.
                if self.regions.is_full() {
                    return Err(Errno::ENOMEM);
                }
                self.regions[i].end = start;
                let mut high = v;
                high.start = start;
                high.offset = v.offset.wrapping_add(start - v.start);
                self.regions.insert(i + 1, high);
                i += 1;
                continue;
            }
            if v.end > end {
                // Carve off the untouched high part.
                if self.regions.is_full() {
                    return Err(Errno::ENOMEM);
                }
                let mut high = v;
                high.start = end;
                high.offset = v.offset.wrapping_add(end - v.start);
                self.regions[i].end = end;
                self.regions.insert(i + 1, high);
            }
            self.regions[i].prot = prot;
            i += 1;
        }
        Ok(())
    }

    /// Moves the program break to `new_brk`.
    ///
    /// Verifies that no foreign region intersects the growth and extends
    /// (or shrinks) the heap region. Returns the new break.
    pub fn expand_heap(&mut self, new_brk: u32) -> Result<u32> {
        if new_brk < self.brk_lower {
            return Err(Errno::EINVAL);
        }
        let old_end = page_align_up(self.brk);
        let new_end = page_align_up(new_brk);
        if new_end > old_end {
            // Growth must not collide with anything but the heap itself.
            let heap_end = self
                .regions
                .iter()
                .find(|v| v.section == Section::Heap)
                .map_or(self.brk_lower, |v| v.end);
            if self
                .regions
                .iter()
                .any(|v| v.section != Section::Heap && v.start < new_end && heap_end < v.end)
            {
                return Err(Errno::ENOMEM);
            }
        }
        match self
            .regions
            .iter()
            .position(|v| v.section == Section::Heap)
        {
            Some(i) if new_end > self.brk_lower => {
                self.regions[i].end = new_end.max(self.regions[i].start + PAGE_SIZE as u32);
            }
            Some(i) => {
                self.regions.remove(i);
            }
            None if new_end > page_align_up(self.brk_lower) => {
                self.insert(Vma {
                    start: page_align_up(self.brk_lower),
                    end: new_end,
                    prot: Prot::READ | Prot::WRITE,
                    share: Share::Private,
                    offset: 0,
                    section: Section::Heap,
                    inode: None,
                    open_mode: 0,
                })?;
            }
            None => {}
        }
        self.brk = new_brk;
        Ok(new_brk)
    }

    /// Verifies the ordering invariant: regions are sorted, disjoint and
    /// well-formed.
    ///
    /// # Panics
    ///
    /// Panics on the first violation.
    pub fn assert_consistent(&self) {
        let mut prev_end = 0u32;
        for v in self.regions.iter() {
            assert!(v.end > v.start, "empty region {:#x}", v.start);
            assert!(
                v.start >= prev_end,
                "regions out of order or overlapping at {:#x}",
                v.start
            );
            prev_end = v.end;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anon(start: u32, end: u32, section: Section) -> Vma {
        Vma {
            start,
            end,
            prot: Prot::READ | Prot::WRITE,
            share: Share::Private,
            offset: 0,
            section,
            inode: None,
            open_mode: 0,
        }
    }

    #[test]
    fn insert_sorted_and_disjoint() {
        let mut t = VmaTable::new();
        t.insert(anon(0x3000, 0x5000, Section::Data)).unwrap();
        t.insert(anon(0x1000, 0x2000, Section::Text)).unwrap();
        t.assert_consistent();
        assert_eq!(t.len(), 2);
        assert_eq!(t.iter().next().unwrap().start, 0x1000);

        // Overlap rejected.
        assert_eq!(
            t.insert(anon(0x1800, 0x2800, Section::Data)).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn find_region_boundaries() {
        let mut t = VmaTable::new();
        t.insert(anon(0x1000, 0x3000, Section::Text)).unwrap();
        assert!(t.find_region(0x0fff).is_none());
        assert!(t.find_region(0x1000).is_some());
        assert!(t.find_region(0x2fff).is_some());
        assert!(t.find_region(0x3000).is_none(), "end is exclusive");
    }

    #[test]
    fn gap_search_starts_at_mmap_base() {
        let mut t = VmaTable::new();
        assert_eq!(t.find_unmapped(0x1000).unwrap(), MMAP_START);
        t.insert(anon(MMAP_START, MMAP_START + 0x4000, Section::Mmap))
            .unwrap();
        assert_eq!(t.find_unmapped(0x1000).unwrap(), MMAP_START + 0x4000);

        // A gap between regions is found first-fit.
        t.insert(anon(
            MMAP_START + 0x6000,
            MMAP_START + 0x8000,
            Section::Mmap,
        ))
        .unwrap();
        assert_eq!(t.find_unmapped(0x2000).unwrap(), MMAP_START + 0x4000);
        assert_eq!(t.find_unmapped(0x3000).unwrap(), MMAP_START + 0x8000);
    }

    #[test]
    fn unmap_splits_straddling_region() {
        let mut t = VmaTable::new();
        let mut v = anon(0x1000, 0x6000, Section::Mmap);
        v.offset = 0;
        v.inode = Some(7);
        t.insert(v).unwrap();

        t.unmap_range(0x3000, 0x4000).unwrap();
        t.assert_consistent();
        assert_eq!(t.len(), 2);
        let regions: Vec<_> = t.iter().copied().collect();
        assert_eq!((regions[0].start, regions[0].end), (0x1000, 0x3000));
        assert_eq!((regions[1].start, regions[1].end), (0x4000, 0x6000));
        // File offset advances across the hole.
        assert_eq!(regions[1].offset, 0x3000);
    }

    #[test]
    fn protect_range_splits_at_boundaries() {
        let mut t = VmaTable::new();
        t.insert(anon(0x1000, 0x5000, Section::Mmap)).unwrap();
        t.protect_range(0x2000, 0x3000, Prot::READ).unwrap();
        t.assert_consistent();
        assert_eq!(t.len(), 3);
        assert_eq!(t.find_region(0x1000).unwrap().prot, Prot::READ | Prot::WRITE);
        assert_eq!(t.find_region(0x2000).unwrap().prot, Prot::READ);
        assert_eq!(t.find_region(0x3000).unwrap().prot, Prot::READ | Prot::WRITE);
    }

    #[test]
    fn protect_unmapped_range_fails() {
        let mut t = VmaTable::new();
        t.insert(anon(0x1000, 0x2000, Section::Mmap)).unwrap();
        assert_eq!(
            t.protect_range(0x1000, 0x4000, Prot::READ).unwrap_err(),
            Errno::ENOMEM
        );
    }

    #[test]
    fn heap_growth_and_collision() {
        let mut t = VmaTable::new();
        t.brk_lower = 0x0810_0000;
        t.brk = 0x0810_0000;
        t.expand_heap(0x0810_4000).unwrap();
        let heap = t.find_region(0x0810_2000).unwrap();
        assert_eq!(heap.section, Section::Heap);
        assert_eq!(heap.end, 0x0810_4000);

        // A foreign mapping right above blocks further growth.
        t.insert(anon(0x0810_4000, 0x0810_5000, Section::Mmap))
            .unwrap();
        assert_eq!(t.expand_heap(0x0810_8000).unwrap_err(), Errno::ENOMEM);

        // Shrinking below the lower watermark is invalid.
        assert_eq!(t.expand_heap(0x0800_0000).unwrap_err(), Errno::EINVAL);
    }
}
