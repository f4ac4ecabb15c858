//! i386 two-level page-table structures.
//!
//! A page directory and a page table are both 1024 4-byte entries; a
//! virtual address splits into a 10-bit directory index, a 10-bit table
//! index and a 12-bit page offset. The kernel half starts at directory
//! entry [`KERNEL_PDE_BASE`] and is shared between processes by copying
//! directory entries at fork.

use baryon_core::addr::{KERNEL_BASE, PhysAddr, VirtAddr};
use bitflags::bitflags;

/// Entries per directory or table.
pub const ENTRIES: usize = 1024;

/// First directory index belonging to the kernel half (3 GiB split).
pub const KERNEL_PDE_BASE: usize = (KERNEL_BASE >> 22) as usize;

bitflags! {
    /// Page directory / table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Mapping is present.
        const PRESENT = 1 << 0;
        /// Writes allowed.
        const RW = 1 << 1;
        /// User-mode access allowed.
        const USER = 1 << 2;
        /// Set by hardware on access.
        const ACCESSED = 1 << 5;
        /// Set by hardware on write.
        const DIRTY = 1 << 6;
    }
}

/// One page-directory or page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// An absent mapping.
    pub const NONE: PageEntry = PageEntry(0);

    /// Builds an entry from a page-aligned frame address and flags.
    #[must_use]
    pub fn new(frame: PhysAddr, flags: PageFlags) -> Self {
        debug_assert!(frame.is_page_aligned());
        Self(frame.as_u32() | flags.bits())
    }

    /// Returns true if the present bit is set.
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    /// Returns the frame address part.
    #[must_use]
    pub const fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & 0xffff_f000)
    }

    /// Returns the flag part.
    #[must_use]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Returns the entry with `flags` added or removed.
    #[must_use]
    pub fn with_flags(self, flags: PageFlags, on: bool) -> Self {
        if on {
            Self(self.0 | flags.bits())
        } else {
            Self(self.0 & !flags.bits())
        }
    }
}

/// A page-aligned array of 1024 entries, used for both levels.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The raw entries.
    pub entries: [PageEntry; ENTRIES],
}

impl PageTable {
    /// An all-absent table.
    pub const fn empty() -> Self {
        Self {
            entries: [PageEntry::NONE; ENTRIES],
        }
    }

    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries = [PageEntry::NONE; ENTRIES];
    }
}

/// Directory index of a virtual address (top 10 bits).
#[must_use]
pub const fn dir_index(addr: VirtAddr) -> usize {
    (addr.as_u32() >> 22) as usize
}

/// Table index of a virtual address (middle 10 bits).
#[must_use]
pub const fn table_index(addr: VirtAddr) -> usize {
    ((addr.as_u32() >> 12) & 0x3ff) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_split() {
        let v = VirtAddr::new(0x0804_8123);
        assert_eq!(dir_index(v), 0x20);
        assert_eq!(table_index(v), 0x48);
        assert_eq!(v.page_offset(), 0x123);
    }

    #[test]
    fn kernel_split_at_768() {
        assert_eq!(KERNEL_PDE_BASE, 768);
        assert_eq!(dir_index(VirtAddr::new(KERNEL_BASE)), 768);
        assert_eq!(dir_index(VirtAddr::new(KERNEL_BASE - 1)), 767);
    }

    #[test]
    fn entry_round_trip() {
        let e = PageEntry::new(
            PhysAddr::new(0x0012_3000),
            PageFlags::PRESENT | PageFlags::RW | PageFlags::USER,
        );
        assert!(e.is_present());
        assert_eq!(e.frame(), PhysAddr::new(0x0012_3000));
        assert!(e.flags().contains(PageFlags::RW));

        let ro = e.with_flags(PageFlags::RW, false);
        assert!(!ro.flags().contains(PageFlags::RW));
        assert_eq!(ro.frame(), e.frame());
    }
}
