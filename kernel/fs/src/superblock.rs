//! Superblocks, the mount ring and filesystem-type registration.
//!
//! One bounded table holds everything mount-related: the registered
//! filesystem types, and one entry per mounted volume carrying its
//! driver, flags, root inode and the directory inode it was grafted on.
//! Mounted entries form a doubly-linked circular list in mount order,
//! the ring `umount` and `sync` walk.

use alloc::sync::Arc;

use baryon_core::id::DevId;
use baryon_core::{Errno, Result};
use bitflags::bitflags;

use crate::fsops::{FsContext, FsDriver, FsFlags, FsType};
use crate::inode::{InodeIdx, iput};

/// Maximum mounted filesystems.
pub const NR_MOUNT_POINTS: usize = 8;

/// Maximum registered filesystem types.
pub const NR_FILESYSTEMS: usize = 8;

bitflags! {
    /// Per-mount flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Volume is mounted read-only.
        const RDONLY = 0x01;
    }
}

/// Index of a mount entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountIdx(u32);

impl MountIdx {
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
}

/// One mounted filesystem.
pub struct MountEntry {
    /// Backing device (`DevId::NONE` for pseudo-filesystems).
    pub dev: DevId,
    /// Mount flags.
    pub flags: MountFlags,
    /// Root inode of the mounted filesystem.
    pub root: Option<InodeIdx>,
    /// The inode the filesystem is mounted on (`None` for the root
    /// filesystem and pseudo-mounts).
    pub dir: Option<InodeIdx>,
    /// The driver instance.
    pub driver: Arc<dyn FsDriver>,
    /// Driver-private token.
    pub private: u32,
    prev: u32,
    next: u32,
}

/// The mount table.
pub struct MountTable {
    fstypes: [Option<FsType>; NR_FILESYSTEMS],
    entries: [Option<MountEntry>; NR_MOUNT_POINTS],
    /// Head of the circular mount list (first mount, normally the root
    /// filesystem).
    head: Option<u32>,
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            fstypes: [None; NR_FILESYSTEMS],
            entries: [const { None }; NR_MOUNT_POINTS],
            head: None,
        }
    }

    /// Registers a filesystem type.
    ///
    /// Fails with `EEXIST` on a duplicate name, `ENOMEM` when the type
    /// table is full.
    pub fn register_fs(&mut self, fstype: FsType) -> Result<()> {
        if self.find_fs(fstype.name).is_some() {
            return Err(Errno::EEXIST);
        }
        let slot = self
            .fstypes
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(Errno::ENOMEM)?;
        *slot = Some(fstype);
        Ok(())
    }

    /// Looks a filesystem type up by name.
    #[must_use]
    pub fn find_fs(&self, name: &str) -> Option<FsType> {
        self.fstypes
            .iter()
            .flatten()
            .find(|t| t.name == name)
            .copied()
    }

    /// Access to a mount entry.
    pub fn get(&self, idx: MountIdx) -> Result<&MountEntry> {
        self.entries[idx.index()].as_ref().ok_or(Errno::EINVAL)
    }

    /// Mutable access to a mount entry.
    pub fn get_mut(&mut self, idx: MountIdx) -> Result<&mut MountEntry> {
        self.entries[idx.index()].as_mut().ok_or(Errno::EINVAL)
    }

    /// Clones the driver handle of a mount.
    pub fn driver(&self, idx: MountIdx) -> Result<Arc<dyn FsDriver>> {
        Ok(Arc::clone(&self.get(idx)?.driver))
    }

    /// Finds the mount for a device.
    #[must_use]
    pub fn find_dev(&self, dev: DevId) -> Option<MountIdx> {
        self.iter().find(|&i| {
            self.entries[i.index()]
                .as_ref()
                .is_some_and(|e| e.dev == dev)
        })
    }

    /// Iterates mounted entries in mount order.
    pub fn iter(&self) -> MountIter<'_> {
        MountIter {
            table: self,
            cur: self.head,
            started: false,
        }
    }

    /// Claims a slot and links it at the ring tail.
    fn insert(&mut self, entry: MountEntry) -> Result<MountIdx> {
        let slot = self
            .entries
            .iter()
            .position(|s| s.is_none())
            .ok_or(Errno::ENOMEM)? as u32;
        let mut entry = entry;
        match self.head {
            None => {
                entry.prev = slot;
                entry.next = slot;
                self.entries[slot as usize] = Some(entry);
                self.head = Some(slot);
            }
            Some(head) => {
                let tail = self.entries[head as usize].as_ref().unwrap().prev;
                entry.prev = tail;
                entry.next = head;
                self.entries[slot as usize] = Some(entry);
                self.entries[tail as usize].as_mut().unwrap().next = slot;
                self.entries[head as usize].as_mut().unwrap().prev = slot;
            }
        }
        Ok(MountIdx(slot))
    }

    fn remove(&mut self, idx: MountIdx) {
        let Some(entry) = self.entries[idx.index()].take() else {
            return;
        };
        if entry.next == idx.0 {
            self.head = None;
        } else {
            self.entries[entry.prev as usize].as_mut().unwrap().next = entry.next;
            self.entries[entry.next as usize].as_mut().unwrap().prev = entry.prev;
            if self.head == Some(idx.0) {
                self.head = Some(entry.next);
            }
        }
    }
}

/// Iterator over the circular mount list.
pub struct MountIter<'a> {
    table: &'a MountTable,
    cur: Option<u32>,
    started: bool,
}

impl Iterator for MountIter<'_> {
    type Item = MountIdx;

    fn next(&mut self) -> Option<MountIdx> {
        let cur = self.cur?;
        if self.started && Some(cur) == self.table.head {
            return None;
        }
        self.started = true;
        self.cur = self.table.entries[cur as usize].as_ref().map(|e| e.next);
        Some(MountIdx(cur))
    }
}

/// Mounts a filesystem of type `fsname` from `dev` onto `dir`
/// (`None` grafts the root filesystem).
///
/// The driver's `read_superblock` must set the entry's root inode; a
/// root that is not a directory fails the mount with `EINVAL`.
pub fn mount(
    ctx: &mut FsContext<'_>,
    fsname: &str,
    dev: DevId,
    dir: Option<InodeIdx>,
    flags: MountFlags,
) -> Result<MountIdx> {
    let fstype = ctx.mounts.find_fs(fsname).ok_or(Errno::ENODEV)?;
    if fstype.flags.contains(FsFlags::REQUIRES_DEV) {
        if dev == DevId::NONE {
            return Err(Errno::ENOTBLK);
        }
        if ctx.mounts.find_dev(dev).is_some() {
            return Err(Errno::EBUSY);
        }
    }
    if let Some(d) = dir {
        if ctx.inodes.get(d).mount.is_some() {
            return Err(Errno::EBUSY);
        }
        if !ctx.inodes.get(d).mode.is_dir() {
            return Err(Errno::ENOTDIR);
        }
    }

    let driver = (fstype.create)()?;
    let idx = ctx.mounts.insert(MountEntry {
        dev,
        flags,
        root: None,
        dir,
        driver: Arc::clone(&driver),
        private: 0,
        prev: 0,
        next: 0,
    })?;

    if let Err(e) = driver.read_superblock(ctx, idx) {
        ctx.mounts.remove(idx);
        return Err(e);
    }

    let root = ctx.mounts.get(idx)?.root.ok_or(Errno::EINVAL)?;
    if !ctx.inodes.get(root).mode.is_dir() {
        ctx.mounts.remove(idx);
        return Err(Errno::EINVAL);
    }
    if let Some(d) = dir {
        ctx.inodes.get_mut(d).mount = Some(idx);
    }
    Ok(idx)
}

/// Unmounts, refusing while inodes of the volume are still referenced
/// beyond the root itself.
pub fn umount(ctx: &mut FsContext<'_>, idx: MountIdx) -> Result<()> {
    let (dev, root, dir) = {
        let e = ctx.mounts.get(idx)?;
        (e.dev, e.root, e.dir)
    };

    if let Some(root) = root {
        // The mount's own root reference is the only one allowed.
        if ctx.inodes.get(root).count > 1 {
            return Err(Errno::EBUSY);
        }
        iput(ctx, root);
    }
    if dev != DevId::NONE {
        ctx.inodes.invalidate_dev(dev)?;
        ctx.buffers.sync_dev(ctx.devices, dev)?;
        ctx.buffers.invalidate_dev(dev);
    }

    let driver = ctx.mounts.driver(idx)?;
    driver.release_superblock(ctx, idx)?;

    if let Some(d) = dir {
        ctx.inodes.get_mut(d).mount = None;
        iput(ctx, d);
    }
    ctx.mounts.remove(idx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nullfs;

    impl FsDriver for Nullfs {
        fn name(&self) -> &'static str {
            "nullfs"
        }
    }

    fn nullfs_type() -> FsType {
        FsType {
            name: "nullfs",
            flags: FsFlags::empty(),
            create: || Ok(Arc::new(Nullfs)),
        }
    }

    #[test]
    fn register_and_find() {
        let mut t = MountTable::new();
        t.register_fs(nullfs_type()).unwrap();
        assert!(t.find_fs("nullfs").is_some());
        assert!(t.find_fs("ext2").is_none());
        assert_eq!(t.register_fs(nullfs_type()).unwrap_err(), Errno::EEXIST);
    }

    #[test]
    fn ring_links_in_mount_order() {
        let mut t = MountTable::new();
        let entry = |dev| MountEntry {
            dev,
            flags: MountFlags::empty(),
            root: None,
            dir: None,
            driver: Arc::new(Nullfs),
            private: 0,
            prev: 0,
            next: 0,
        };
        let a = t.insert(entry(DevId::new(1, 0))).unwrap();
        let b = t.insert(entry(DevId::new(1, 1))).unwrap();
        let c = t.insert(entry(DevId::new(1, 2))).unwrap();
        let order: alloc::vec::Vec<_> = t.iter().collect();
        assert_eq!(order, [a, b, c]);

        // Removing the middle keeps the ring closed.
        t.remove(b);
        let order: alloc::vec::Vec<_> = t.iter().collect();
        assert_eq!(order, [a, c]);
        assert_eq!(t.find_dev(DevId::new(1, 1)), None);
        assert_eq!(t.find_dev(DevId::new(1, 2)), Some(c));

        // Removing the head moves it forward.
        t.remove(a);
        let order: alloc::vec::Vec<_> = t.iter().collect();
        assert_eq!(order, [c]);
        t.remove(c);
        assert_eq!(t.iter().count(), 0);
    }
}
