//! Per-process address spaces: installing, removing and cloning
//! mappings.
//!
//! The mapper is generic over a [`PhysAccess`] that turns a frame
//! address into a pointer the kernel can dereference — the fixed
//! high-half window on the target, a fake backing store in host tests —
//! so the demand-allocation and copy-on-write logic runs under
//! `cargo test`.
//!
//! Reference counting rule: a present leaf mapping owns exactly one
//! reference on its frame. [`AddressSpace::map_page`] takes that
//! reference over from the caller (or creates it when it allocates the
//! frame itself); [`AddressSpace::unmap_page`] drops it.

use baryon_core::addr::{PAGE_SIZE, PhysAddr, VirtAddr};
use baryon_core::{Errno, Result};

use crate::frame::{FrameFlags, FrameIdx, FrameTable};
use crate::paging::{
    ENTRIES, KERNEL_PDE_BASE, PageEntry, PageFlags, PageTable, dir_index, table_index,
};

/// Access to physical pages by virtual window.
pub trait PhysAccess {
    /// Returns a pointer to the page table stored in `frame`.
    fn table_ptr(&mut self, frame: PhysAddr) -> *mut PageTable;

    /// Returns a pointer to the raw bytes of `frame`.
    fn page_ptr(&mut self, frame: PhysAddr) -> *mut u8;

    /// Invalidates the TLB entry for `virt` (no-op where irrelevant).
    fn flush_tlb(&mut self, virt: VirtAddr);
}

/// Outcome of a copy-on-write fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CowOutcome {
    /// Sole owner: the write bit was restored in place.
    InPlace,
    /// Shared: the faulting process received a private copy.
    Copied(FrameIdx),
}

/// A process's page directory plus the operations on it.
#[derive(Debug, Clone, Copy)]
pub struct AddressSpace {
    dir: FrameIdx,
}

impl AddressSpace {
    /// Allocates and zeroes a fresh page directory.
    pub fn new(frames: &mut FrameTable, phys: &mut dyn PhysAccess) -> Result<Self> {
        let dir = frames.get_free_page()?;
        // SAFETY: The freshly allocated frame is exclusively ours.
        unsafe { (*phys.table_ptr(dir.phys())).zero() };
        Ok(Self { dir })
    }

    /// Wraps an existing directory frame (the boot directory).
    #[must_use]
    pub const fn from_dir(dir: FrameIdx) -> Self {
        Self { dir }
    }

    /// Physical address of the page directory, for CR3.
    #[must_use]
    pub const fn dir_phys(&self) -> PhysAddr {
        self.dir.phys()
    }

    /// Copies the kernel-half directory entries from `kernel`, sharing
    /// the kernel page tables.
    pub fn copy_kernel_entries(&self, kernel: &AddressSpace, phys: &mut dyn PhysAccess) {
        let src = phys.table_ptr(kernel.dir.phys());
        let dst = phys.table_ptr(self.dir.phys());
        for i in KERNEL_PDE_BASE..ENTRIES {
            // SAFETY: Both directories are live table frames.
            unsafe { (*dst).entries[i] = (*src).entries[i] };
        }
    }

    /// Installs a 4 KiB user mapping at `virt`.
    ///
    /// With `frame == None` a zeroed frame is allocated; otherwise the
    /// caller transfers one reference on `frame`. A page-table page is
    /// allocated on demand. Fails with `EEXIST` if `virt` is already
    /// mapped, `ENOMEM` when out of frames.
    pub fn map_page(
        &self,
        frames: &mut FrameTable,
        phys: &mut dyn PhysAccess,
        virt: VirtAddr,
        frame: Option<FrameIdx>,
        flags: PageFlags,
    ) -> Result<FrameIdx> {
        let virt = virt.page_base();
        let table = self.ensure_table(frames, phys, virt)?;
        let ti = table_index(virt);
        // SAFETY: `table` is a live page-table frame.
        unsafe {
            if (*table).entries[ti].is_present() {
                return Err(Errno::EEXIST);
            }
        }
        let target = match frame {
            Some(f) => f,
            None => {
                let f = frames.get_free_page()?;
                // SAFETY: Fresh frame, exclusively ours.
                unsafe { core::ptr::write_bytes(phys.page_ptr(f.phys()), 0, PAGE_SIZE) };
                f
            }
        };
        // SAFETY: ti < ENTRIES and the table frame is live.
        unsafe {
            (*table).entries[ti] = PageEntry::new(target.phys(), flags | PageFlags::PRESENT);
        }
        phys.flush_tlb(virt);
        Ok(target)
    }

    /// Removes the mapping at `virt`, dropping its frame reference.
    ///
    /// Fails with `EINVAL` when nothing is mapped there.
    pub fn unmap_page(
        &self,
        frames: &mut FrameTable,
        phys: &mut dyn PhysAccess,
        virt: VirtAddr,
    ) -> Result<()> {
        let virt = virt.page_base();
        let entry = self.entry_ptr(phys, virt).ok_or(Errno::EINVAL)?;
        // SAFETY: entry_ptr returned a valid present-table slot.
        let pte = unsafe { *entry };
        if !pte.is_present() {
            return Err(Errno::EINVAL);
        }
        // SAFETY: Clearing our own slot.
        unsafe { *entry = PageEntry::NONE };
        frames.release_page(FrameIdx::from(pte.frame()));
        phys.flush_tlb(virt);
        Ok(())
    }

    /// Returns the leaf entry mapping `virt`, if present.
    pub fn translate(&self, phys: &mut dyn PhysAccess, virt: VirtAddr) -> Option<PageEntry> {
        let entry = self.entry_ptr(phys, virt.page_base())?;
        // SAFETY: Valid slot from entry_ptr.
        let pte = unsafe { *entry };
        pte.is_present().then_some(pte)
    }

    /// Sets or clears the write bit on an existing mapping.
    pub fn protect_page(
        &self,
        phys: &mut dyn PhysAccess,
        virt: VirtAddr,
        writable: bool,
    ) -> Result<()> {
        let virt = virt.page_base();
        let entry = self.entry_ptr(phys, virt).ok_or(Errno::EINVAL)?;
        // SAFETY: Valid slot from entry_ptr.
        unsafe {
            if !(*entry).is_present() {
                return Err(Errno::EINVAL);
            }
            *entry = (*entry).with_flags(PageFlags::RW, writable);
        }
        phys.flush_tlb(virt);
        Ok(())
    }

    /// Clones every user mapping into `child` for fork.
    ///
    /// Private mappings are downgraded to read-only on both sides and
    /// their frames marked copy-on-write; mappings for which
    /// `is_shared(addr)` returns true are aliased unchanged. Each cloned
    /// mapping takes its own frame reference.
    pub fn clone_user(
        &self,
        child: &AddressSpace,
        frames: &mut FrameTable,
        phys: &mut dyn PhysAccess,
        is_shared: &dyn Fn(VirtAddr) -> bool,
    ) -> Result<()> {
        let parent_dir = phys.table_ptr(self.dir.phys());
        for di in 0..KERNEL_PDE_BASE {
            // SAFETY: Our own live directory.
            let pde = unsafe { (*parent_dir).entries[di] };
            if !pde.is_present() {
                continue;
            }
            let parent_table = phys.table_ptr(pde.frame());
            for ti in 0..ENTRIES {
                // SAFETY: Present directory entry points at a live table.
                let pte = unsafe { (*parent_table).entries[ti] };
                if !pte.is_present() {
                    continue;
                }
                let virt = VirtAddr::new(((di as u32) << 22) | ((ti as u32) << 12));
                let frame = FrameIdx::from(pte.frame());
                frames.ref_frame(frame);
                if is_shared(virt) {
                    child.map_page(frames, phys, virt, Some(frame), pte.flags())?;
                } else {
                    // Read-only in both; first writer copies.
                    frames.set_flags(frame, FrameFlags::COW, true);
                    // SAFETY: Downgrading our own slot.
                    unsafe {
                        (*parent_table).entries[ti] = pte.with_flags(PageFlags::RW, false);
                    }
                    phys.flush_tlb(virt);
                    child.map_page(
                        frames,
                        phys,
                        virt,
                        Some(frame),
                        pte.flags().difference(PageFlags::RW),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Resolves a write fault on a copy-on-write page at `virt`.
    ///
    /// Sole owner gets the write bit back in place; otherwise a private
    /// copy is made for this address space and one shared reference is
    /// dropped.
    pub fn cow_fault(
        &self,
        frames: &mut FrameTable,
        phys: &mut dyn PhysAccess,
        virt: VirtAddr,
    ) -> Result<CowOutcome> {
        let virt = virt.page_base();
        let entry = self.entry_ptr(phys, virt).ok_or(Errno::EINVAL)?;
        // SAFETY: Valid slot from entry_ptr.
        let pte = unsafe { *entry };
        if !pte.is_present() {
            return Err(Errno::EINVAL);
        }
        let frame = FrameIdx::from(pte.frame());
        if !frames.get(frame).flags.contains(FrameFlags::COW) {
            return Err(Errno::EINVAL);
        }

        if frames.get(frame).count == 1 {
            frames.set_flags(frame, FrameFlags::COW, false);
            // SAFETY: Restoring the write bit on our own slot.
            unsafe { *entry = pte.with_flags(PageFlags::RW, true) };
            phys.flush_tlb(virt);
            return Ok(CowOutcome::InPlace);
        }

        let copy = frames.get_free_page()?;
        // SAFETY: Source is the live shared frame, destination is fresh
        // and exclusively ours; both are full pages.
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys.page_ptr(pte.frame()),
                phys.page_ptr(copy.phys()),
                PAGE_SIZE,
            );
            *entry = PageEntry::new(copy.phys(), pte.flags() | PageFlags::RW);
        }
        phys.flush_tlb(virt);
        // The remaining owner keeps its RO mapping and resolves its own
        // fault later (in place, once the count reaches 1).
        frames.release_page(frame);
        Ok(CowOutcome::Copied(copy))
    }

    /// Tears down every user mapping and user page table, dropping all
    /// frame references. The kernel half and the directory itself stay.
    pub fn release_user(&self, frames: &mut FrameTable, phys: &mut dyn PhysAccess) {
        let dir = phys.table_ptr(self.dir.phys());
        for di in 0..KERNEL_PDE_BASE {
            // SAFETY: Our own live directory.
            let pde = unsafe { (*dir).entries[di] };
            if !pde.is_present() {
                continue;
            }
            let table = phys.table_ptr(pde.frame());
            for ti in 0..ENTRIES {
                // SAFETY: Live table frame.
                let pte = unsafe { (*table).entries[ti] };
                if pte.is_present() {
                    frames.release_page(FrameIdx::from(pte.frame()));
                }
            }
            frames.release_page(FrameIdx::from(pde.frame()));
            // SAFETY: Clearing our own directory slot.
            unsafe { (*dir).entries[di] = PageEntry::NONE };
        }
    }

    /// Drops the directory frame itself. Call after [`Self::release_user`].
    pub fn release_dir(self, frames: &mut FrameTable) {
        frames.release_page(self.dir);
    }

    fn ensure_table(
        &self,
        frames: &mut FrameTable,
        phys: &mut dyn PhysAccess,
        virt: VirtAddr,
    ) -> Result<*mut PageTable> {
        let di = dir_index(virt);
        let dir = phys.table_ptr(self.dir.phys());
        // SAFETY: Our own live directory.
        let pde = unsafe { (*dir).entries[di] };
        if pde.is_present() {
            return Ok(phys.table_ptr(pde.frame()));
        }
        let table_frame = frames.get_free_page()?;
        let table = phys.table_ptr(table_frame.phys());
        // SAFETY: Fresh frame, exclusively ours.
        unsafe {
            (*table).zero();
            (*dir).entries[di] = PageEntry::new(
                table_frame.phys(),
                PageFlags::PRESENT | PageFlags::RW | PageFlags::USER,
            );
        }
        Ok(table)
    }

    fn entry_ptr(&self, phys: &mut dyn PhysAccess, virt: VirtAddr) -> Option<*mut PageEntry> {
        let dir = phys.table_ptr(self.dir.phys());
        // SAFETY: Our own live directory.
        let pde = unsafe { (*dir).entries[dir_index(virt)] };
        if !pde.is_present() {
            return None;
        }
        let table = phys.table_ptr(pde.frame());
        // SAFETY: Present directory entry points at a live table.
        Some(unsafe { &raw mut (*table).entries[table_index(virt)] })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use std::collections::HashMap;

    /// Backing store standing in for physical memory: one boxed page
    /// table (page-sized, page-aligned) per referenced frame.
    struct FakePhys {
        pages: HashMap<u32, Box<PageTable>>,
    }

    impl FakePhys {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
            }
        }

        fn page(&mut self, frame: PhysAddr) -> &mut PageTable {
            self.pages
                .entry(frame.page_base().as_u32())
                .or_insert_with(|| Box::new(PageTable::empty()))
        }
    }

    impl PhysAccess for FakePhys {
        fn table_ptr(&mut self, frame: PhysAddr) -> *mut PageTable {
            core::ptr::from_mut(self.page(frame))
        }

        fn page_ptr(&mut self, frame: PhysAddr) -> *mut u8 {
            self.table_ptr(frame).cast()
        }

        fn flush_tlb(&mut self, _virt: VirtAddr) {}
    }

    fn setup(n: usize) -> (FrameTable, FakePhys) {
        let storage = vec![Frame::EMPTY; n].leak();
        let mut t = FrameTable::new(storage);
        t.add_available(PhysAddr::new(0), PhysAddr::new((n as u32) << 12));
        (t, FakePhys::new())
    }

    const USER_RW: PageFlags = PageFlags::RW.union(PageFlags::USER);

    #[test]
    fn map_translate_unmap() {
        let (mut frames, mut phys) = setup(16);
        let space = AddressSpace::new(&mut frames, &mut phys).unwrap();
        let virt = VirtAddr::new(0x0804_8000);

        let f = space
            .map_page(&mut frames, &mut phys, virt, None, USER_RW)
            .unwrap();
        let pte = space.translate(&mut phys, virt).unwrap();
        assert_eq!(pte.frame(), f.phys());
        assert!(pte.flags().contains(PageFlags::USER | PageFlags::RW));
        assert_eq!(frames.get(f).count, 1);

        // Double map is rejected.
        assert_eq!(
            space
                .map_page(&mut frames, &mut phys, virt, None, USER_RW)
                .unwrap_err(),
            Errno::EEXIST
        );

        space.unmap_page(&mut frames, &mut phys, virt).unwrap();
        assert!(space.translate(&mut phys, virt).is_none());
        assert_eq!(frames.get(f).count, 0, "unmap drops the reference");
        frames.assert_consistent();
    }

    #[test]
    fn demand_table_allocation() {
        let (mut frames, mut phys) = setup(16);
        let before = frames.free();
        let space = AddressSpace::new(&mut frames, &mut phys).unwrap();
        space
            .map_page(&mut frames, &mut phys, VirtAddr::new(0x1000), None, USER_RW)
            .unwrap();
        // Directory + table + leaf = 3 frames.
        assert_eq!(frames.free(), before - 3);
    }

    #[test]
    fn cow_clone_then_fault_copies() {
        let (mut frames, mut phys) = setup(32);
        let parent = AddressSpace::new(&mut frames, &mut phys).unwrap();
        let virt = VirtAddr::new(0x0900_0000);
        let f = parent
            .map_page(&mut frames, &mut phys, virt, None, USER_RW)
            .unwrap();
        // Parent writes a byte pattern.
        // SAFETY: The frame's backing page is live in FakePhys.
        unsafe { *phys.page_ptr(f.phys()).add(100) = 0xAB };

        let child = AddressSpace::new(&mut frames, &mut phys).unwrap();
        parent
            .clone_user(&child, &mut frames, &mut phys, &|_| false)
            .unwrap();

        // Both sides read-only on the shared COW frame.
        assert_eq!(frames.get(f).count, 2);
        assert!(frames.get(f).flags.contains(FrameFlags::COW));
        assert!(!parent
            .translate(&mut phys, virt)
            .unwrap()
            .flags()
            .contains(PageFlags::RW));
        assert!(!child
            .translate(&mut phys, virt)
            .unwrap()
            .flags()
            .contains(PageFlags::RW));

        // Child sees the parent's byte.
        let child_frame = child.translate(&mut phys, virt).unwrap().frame();
        // SAFETY: Live backing page.
        assert_eq!(unsafe { *phys.page_ptr(child_frame).add(100) }, 0xAB);

        // Child write-faults: gets a private copy with the write bit.
        let outcome = child.cow_fault(&mut frames, &mut phys, virt).unwrap();
        let copy = match outcome {
            CowOutcome::Copied(c) => c,
            CowOutcome::InPlace => panic!("two owners must copy"),
        };
        assert_ne!(copy, f);
        assert_eq!(frames.get(f).count, 1);
        assert_eq!(frames.get(copy).count, 1);

        // Child modifies its copy; parent's byte is untouched.
        // SAFETY: Live backing pages.
        unsafe {
            *phys.page_ptr(copy.phys()).add(100) = 0xCD;
            assert_eq!(*phys.page_ptr(f.phys()).add(100), 0xAB);
        }

        // Parent is now sole owner: its fault restores RW in place.
        let outcome = parent.cow_fault(&mut frames, &mut phys, virt).unwrap();
        assert_eq!(outcome, CowOutcome::InPlace);
        assert!(parent
            .translate(&mut phys, virt)
            .unwrap()
            .flags()
            .contains(PageFlags::RW));
        assert!(!frames.get(f).flags.contains(FrameFlags::COW));
    }

    #[test]
    fn shared_mappings_alias_without_cow() {
        let (mut frames, mut phys) = setup(32);
        let parent = AddressSpace::new(&mut frames, &mut phys).unwrap();
        let virt = VirtAddr::new(0x4000_0000);
        let f = parent
            .map_page(&mut frames, &mut phys, virt, None, USER_RW)
            .unwrap();

        let child = AddressSpace::new(&mut frames, &mut phys).unwrap();
        parent
            .clone_user(&child, &mut frames, &mut phys, &|_| true)
            .unwrap();

        assert_eq!(frames.get(f).count, 2);
        assert!(!frames.get(f).flags.contains(FrameFlags::COW));
        // Both stay writable; writes are mutually visible (same frame).
        assert!(parent
            .translate(&mut phys, virt)
            .unwrap()
            .flags()
            .contains(PageFlags::RW));
        assert_eq!(
            child.translate(&mut phys, virt).unwrap().frame(),
            f.phys()
        );
    }

    #[test]
    fn release_user_returns_everything() {
        let (mut frames, mut phys) = setup(32);
        let total_free = frames.free();
        let space = AddressSpace::new(&mut frames, &mut phys).unwrap();
        for i in 0..4u32 {
            space
                .map_page(
                    &mut frames,
                    &mut phys,
                    VirtAddr::new(0x0800_0000 + i * 0x1000),
                    None,
                    USER_RW,
                )
                .unwrap();
        }
        space.release_user(&mut frames, &mut phys);
        space.release_dir(&mut frames);
        assert_eq!(frames.free(), total_free);
        frames.assert_consistent();
    }
}
