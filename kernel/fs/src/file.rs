//! The global open-file table.
//!
//! Every `open(2)` allocates one slot holding the inode, the open
//! flags, the 64-bit seek offset and a share count; `fork` and `dup`
//! raise the count instead of allocating. Per-process `fd[]` arrays map
//! small integers to these slots and live with the process, not here.
//! Slot 0 is never handed out so a zero in a process's fd array can
//! mean "closed".

use baryon_core::{Errno, Result};
use bitflags::bitflags;

use alloc::vec::Vec;

use crate::inode::InodeIdx;

bitflags! {
    /// Open flags, Linux i386 encoding.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open for writing only.
        const O_WRONLY = 0o1;
        /// Open for reading and writing.
        const O_RDWR = 0o2;
        /// Create if absent.
        const O_CREAT = 0o100;
        /// With `O_CREAT`, fail if present.
        const O_EXCL = 0o200;
        /// Do not make the terminal controlling.
        const O_NOCTTY = 0o400;
        /// Truncate on open.
        const O_TRUNC = 0o1000;
        /// Every write goes to the end.
        const O_APPEND = 0o2000;
        /// Never block in I/O operations.
        const O_NONBLOCK = 0o4000;
        /// Fail with `ELOOP` if the final component is a symlink.
        const O_NOFOLLOW = 0o400000;
    }
}

impl OpenFlags {
    /// True if the access mode allows reading.
    #[must_use]
    pub const fn readable(self) -> bool {
        // O_RDONLY is the absence of both write bits.
        !self.contains(OpenFlags::O_WRONLY)
    }

    /// True if the access mode allows writing.
    #[must_use]
    pub const fn writable(self) -> bool {
        self.contains(OpenFlags::O_WRONLY) || self.contains(OpenFlags::O_RDWR)
    }
}

/// Index of an open-file slot (never 0 for a live file).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdx(u32);

impl FileIdx {
    /// The "closed" sentinel.
    pub const NONE: FileIdx = FileIdx(0);

    /// Creates an index from a raw slot number.
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw slot number.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// True if this is the closed sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// One open file.
#[derive(Debug, Clone, Copy)]
pub struct OpenFile {
    /// The inode this file reads and writes.
    pub inode: InodeIdx,
    /// Access mode and status flags.
    pub flags: OpenFlags,
    /// Processes and fds sharing this slot.
    pub count: u32,
    /// Seek position.
    pub offset: u64,
}

/// The global open-file table.
pub struct FileTable {
    slots: Vec<Option<OpenFile>>,
}

impl FileTable {
    /// Creates a table with `n` slots (slot 0 stays unused).
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self {
            slots: alloc::vec![None; n],
        }
    }

    /// Allocates a slot for a freshly opened inode.
    ///
    /// Fails with `ENFILE` when the system-wide table is full.
    pub fn get_new_fd(&mut self, inode: InodeIdx, flags: OpenFlags) -> Result<FileIdx> {
        for n in 1..self.slots.len() {
            if self.slots[n].is_none() {
                self.slots[n] = Some(OpenFile {
                    inode,
                    flags,
                    count: 1,
                    offset: 0,
                });
                return Ok(FileIdx(n as u32));
            }
        }
        Err(Errno::ENFILE)
    }

    /// Access to a live slot.
    pub fn get(&self, idx: FileIdx) -> Result<&OpenFile> {
        self.slots
            .get(idx.index())
            .and_then(|s| s.as_ref())
            .ok_or(Errno::EBADF)
    }

    /// Mutable access to a live slot.
    pub fn get_mut(&mut self, idx: FileIdx) -> Result<&mut OpenFile> {
        self.slots
            .get_mut(idx.index())
            .and_then(|s| s.as_mut())
            .ok_or(Errno::EBADF)
    }

    /// Adds a sharer (fork, dup).
    pub fn dup(&mut self, idx: FileIdx) -> Result<()> {
        self.get_mut(idx)?.count += 1;
        Ok(())
    }

    /// Drops a sharer. Returns the slot's content when the last sharer
    /// left — the caller then releases the inode reference.
    pub fn release_fd(&mut self, idx: FileIdx) -> Result<Option<OpenFile>> {
        let f = self.get_mut(idx)?;
        f.count -= 1;
        if f.count == 0 {
            return Ok(self.slots[idx.index()].take());
        }
        Ok(None)
    }

    /// Counts live slots.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Sum of the share counts of all live slots.
    #[must_use]
    pub fn total_refs(&self) -> u32 {
        self.slots.iter().flatten().map(|f| f.count).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_zero_is_never_used() {
        let mut t = FileTable::new(4);
        let f = t.get_new_fd(InodeIdx::new(1), OpenFlags::O_RDWR).unwrap();
        assert_eq!(f.index(), 1);
        assert!(FileIdx::NONE.is_none());
    }

    #[test]
    fn share_count_governs_release() {
        let mut t = FileTable::new(4);
        let f = t.get_new_fd(InodeIdx::new(1), OpenFlags::empty()).unwrap();
        t.dup(f).unwrap();
        assert!(t.release_fd(f).unwrap().is_none(), "still shared");
        let gone = t.release_fd(f).unwrap().expect("last sharer closes");
        assert_eq!(gone.inode, InodeIdx::new(1));
        assert_eq!(t.get(f).unwrap_err(), Errno::EBADF);
    }

    #[test]
    fn table_exhaustion_is_enfile() {
        let mut t = FileTable::new(3);
        t.get_new_fd(InodeIdx::new(1), OpenFlags::empty()).unwrap();
        t.get_new_fd(InodeIdx::new(2), OpenFlags::empty()).unwrap();
        assert_eq!(
            t.get_new_fd(InodeIdx::new(3), OpenFlags::empty()).unwrap_err(),
            Errno::ENFILE
        );
    }

    #[test]
    fn access_mode_helpers() {
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(!OpenFlags::O_WRONLY.readable());
        assert!(OpenFlags::O_WRONLY.writable());
        assert!(OpenFlags::O_RDWR.readable());
        assert!(OpenFlags::O_RDWR.writable());
    }
}
