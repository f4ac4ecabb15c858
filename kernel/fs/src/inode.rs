//! The in-memory inode table.
//!
//! A bounded arena of inode slots hashed by `(device, inode number)`.
//! Slots with a zero reference count stay in the hash — the cache — and
//! sit on the free list for reuse; `iget` revives a cached slot or
//! claims the least-recently-freed one, calling the filesystem's
//! `read_inode` on a true miss. Dirty inodes are written back when the
//! last reference goes away, before the slot becomes reclaimable.

use baryon_core::id::DevId;
use baryon_core::{Errno, Result};
use bitflags::bitflags;

use alloc::vec::Vec;

use crate::fsops::FsContext;
use crate::mode::FileMode;
use crate::superblock::MountIdx;
use crate::wait;

/// Inode hash buckets.
const INODE_HASH_SIZE: usize = 256;

bitflags! {
    /// Inode state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InodeFlags: u8 {
        /// Slot is locked; waiters sleep on the inode's channel.
        const LOCKED = 0x01;
        /// In-memory copy differs from backing store.
        const DIRTY = 0x02;
    }
}

/// Index of an inode slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeIdx(u32);

impl InodeIdx {
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

    /// The wait channel identity of this slot's lock.
    #[must_use]
    pub const fn channel(self) -> usize {
        wait::CHANNEL_INODE_BASE + self.0 as usize
    }
}

/// One in-memory inode.
#[derive(Debug, Clone)]
pub struct Inode {
    /// Device the filesystem lives on (`DevId::NONE` for in-core fs).
    pub dev: DevId,
    /// Inode number within the filesystem.
    pub num: u32,
    /// Type and permissions.
    pub mode: FileMode,
    /// Owner.
    pub uid: u16,
    /// Owning group.
    pub gid: u16,
    /// File size in bytes.
    pub size: u64,
    /// Access time.
    pub atime: u32,
    /// Modification time.
    pub mtime: u32,
    /// Change time.
    pub ctime: u32,
    /// Hard link count.
    pub nlink: u16,
    /// Blocks allocated.
    pub blocks: u32,
    /// Device number for device nodes.
    pub rdev: DevId,
    /// References held by fds, cwd/root pointers and the VFS itself.
    pub count: u32,
    /// Lock and dirty bits.
    pub flags: InodeFlags,
    /// The mount this inode belongs to.
    pub sb: Option<MountIdx>,
    /// When a filesystem is mounted *on* this inode, the mount entry —
    /// path traversal crosses over to that filesystem's root.
    pub mount: Option<MountIdx>,
    /// Filesystem-private token.
    pub private: u32,
    pub(crate) in_use: bool,
    pub(crate) on_free: bool,
    pub(crate) prev_hash: Option<u32>,
    pub(crate) next_hash: Option<u32>,
    pub(crate) next_free: Option<u32>,
}

impl Inode {
    const EMPTY: Inode = Inode {
        dev: DevId::NONE,
        num: 0,
        mode: FileMode(0),
        uid: 0,
        gid: 0,
        size: 0,
        atime: 0,
        mtime: 0,
        ctime: 0,
        nlink: 0,
        blocks: 0,
        rdev: DevId::NONE,
        count: 0,
        flags: InodeFlags::empty(),
        sb: None,
        mount: None,
        private: 0,
        in_use: false,
        on_free: false,
        prev_hash: None,
        next_hash: None,
        next_free: None,
    };
}

/// The global inode table.
pub struct InodeTable {
    slots: Vec<Inode>,
    hash: [Option<u32>; INODE_HASH_SIZE],
    free_head: Option<u32>,
    free_tail: Option<u32>,
}

fn bucket(dev: DevId, num: u32) -> usize {
    (dev.as_raw().wrapping_mul(31).wrapping_add(num)) as usize % INODE_HASH_SIZE
}

impl InodeTable {
    /// Creates a table with `n` slots, all free.
    #[must_use]
    pub fn new(n: usize) -> Self {
        let mut t = Self {
            slots: alloc::vec![Inode::EMPTY; n],
            hash: [None; INODE_HASH_SIZE],
            free_head: None,
            free_tail: None,
        };
        for i in (0..n).rev() {
            t.push_free(i as u32);
        }
        t
    }

    /// Immutable access to a slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not in use.
    #[must_use]
    pub fn get(&self, idx: InodeIdx) -> &Inode {
        let s = &self.slots[idx.index()];
        assert!(s.in_use, "access to unused inode slot {}", idx.index());
        s
    }

    /// Mutable access to a slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not in use.
    pub fn get_mut(&mut self, idx: InodeIdx) -> &mut Inode {
        let s = &mut self.slots[idx.index()];
        assert!(s.in_use, "access to unused inode slot {}", idx.index());
        s
    }

    /// Finds a cached inode by identity.
    #[must_use]
    pub fn find(&self, dev: DevId, num: u32) -> Option<InodeIdx> {
        let mut cur = self.hash[bucket(dev, num)];
        while let Some(i) = cur {
            let s = &self.slots[i as usize];
            if s.dev == dev && s.num == num {
                return Some(InodeIdx(i));
            }
            cur = s.next_hash;
        }
        None
    }

    /// Takes a reference, reviving a cached zero-count slot.
    pub fn grab(&mut self, idx: InodeIdx) {
        let i = idx.index();
        if self.slots[i].count == 0 && self.slots[i].on_free {
            self.unlink_free(i as u32);
        }
        self.slots[i].count += 1;
    }

    /// Claims a slot for a new identity.
    ///
    /// Reuses the least-recently-freed cached slot; fails with `ENFILE`
    /// when every slot holds a live reference.
    pub fn alloc(&mut self, dev: DevId, num: u32, sb: Option<MountIdx>) -> Result<InodeIdx> {
        let i = self.free_head.ok_or(Errno::ENFILE)?;
        self.unlink_free(i);
        if self.slots[i as usize].in_use {
            // Evict the cached identity.
            self.unlink_hash(i);
        }
        let slot = &mut self.slots[i as usize];
        *slot = Inode {
            dev,
            num,
            sb,
            count: 1,
            in_use: true,
            ..Inode::EMPTY
        };
        self.link_hash(i, bucket(dev, num));
        Ok(InodeIdx(i))
    }

    /// Drops one reference. Returns `true` when it was the last one —
    /// the caller then writes the inode back if dirty and decides
    /// between [`Self::cache`] and [`Self::evict`].
    pub fn release(&mut self, idx: InodeIdx) -> bool {
        let s = self.get_mut(idx);
        assert!(s.count > 0, "inode release underflow");
        s.count -= 1;
        s.count == 0
    }

    /// Keeps a zero-count slot in the hash for revival and queues it
    /// for reuse.
    pub fn cache(&mut self, idx: InodeIdx) {
        assert_eq!(self.get(idx).count, 0);
        if !self.get(idx).on_free {
            self.push_free(idx.0);
        }
    }

    /// Discards a zero-count slot entirely.
    pub fn evict(&mut self, idx: InodeIdx) {
        assert_eq!(self.get(idx).count, 0);
        self.unlink_hash(idx.0);
        self.slots[idx.index()].in_use = false;
        if !self.get_raw_on_free(idx.0) {
            self.push_free(idx.0);
        }
    }

    fn get_raw_on_free(&self, i: u32) -> bool {
        self.slots[i as usize].on_free
    }

    /// Discards every cached (count == 0) inode of `dev`; returns
    /// `EBUSY` if any referenced inode remains.
    pub fn invalidate_dev(&mut self, dev: DevId) -> Result<()> {
        let n = self.slots.len();
        for i in 0..n {
            if self.slots[i].in_use && self.slots[i].dev == dev {
                if self.slots[i].count > 0 {
                    return Err(Errno::EBUSY);
                }
                if self.slots[i].on_free {
                    self.unlink_free(i as u32);
                }
                self.unlink_hash(i as u32);
                self.slots[i].in_use = false;
                self.push_free(i as u32);
            }
        }
        Ok(())
    }

    /// Counts slots holding at least one reference.
    #[must_use]
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use && s.count > 0).count()
    }

    fn link_hash(&mut self, i: u32, bucket: usize) {
        self.slots[i as usize].prev_hash = None;
        self.slots[i as usize].next_hash = self.hash[bucket];
        if let Some(head) = self.hash[bucket] {
            self.slots[head as usize].prev_hash = Some(i);
        }
        self.hash[bucket] = Some(i);
    }

    fn unlink_hash(&mut self, i: u32) {
        let s = &self.slots[i as usize];
        let (prev, next, b) = (s.prev_hash, s.next_hash, bucket(s.dev, s.num));
        if let Some(p) = prev {
            self.slots[p as usize].next_hash = next;
        } else if self.hash[b] == Some(i) {
            self.hash[b] = next;
        }
        if let Some(nx) = next {
            self.slots[nx as usize].prev_hash = prev;
        }
        self.slots[i as usize].prev_hash = None;
        self.slots[i as usize].next_hash = None;
    }

    fn push_free(&mut self, i: u32) {
        self.slots[i as usize].on_free = true;
        self.slots[i as usize].next_free = None;
        match self.free_tail {
            Some(t) => self.slots[t as usize].next_free = Some(i),
            None => self.free_head = Some(i),
        }
        self.free_tail = Some(i);
    }

    fn unlink_free(&mut self, i: u32) {
        self.slots[i as usize].on_free = false;
        // Singly linked; walk from the head.
        if self.free_head == Some(i) {
            self.free_head = self.slots[i as usize].next_free;
            if self.free_head.is_none() {
                self.free_tail = None;
            }
            self.slots[i as usize].next_free = None;
            return;
        }
        let mut cur = self.free_head;
        while let Some(c) = cur {
            if self.slots[c as usize].next_free == Some(i) {
                self.slots[c as usize].next_free = self.slots[i as usize].next_free;
                if self.free_tail == Some(i) {
                    self.free_tail = Some(c);
                }
                self.slots[i as usize].next_free = None;
                return;
            }
            cur = self.slots[c as usize].next_free;
        }
    }
}

/// Gets a referenced inode for `(mount, number)`, reading it in on a
/// cache miss.
pub fn iget(ctx: &mut FsContext<'_>, sb: MountIdx, num: u32) -> Result<InodeIdx> {
    let dev = ctx.mounts.get(sb)?.dev;
    if let Some(idx) = ctx.inodes.find(dev, num) {
        ctx.inodes.grab(idx);
        return Ok(idx);
    }
    let idx = ctx.inodes.alloc(dev, num, Some(sb))?;
    let driver = ctx.mounts.driver(sb)?;
    if let Err(e) = driver.read_inode(ctx, idx) {
        let _ = ctx.inodes.release(idx);
        ctx.inodes.evict(idx);
        return Err(e);
    }
    Ok(idx)
}

/// Releases a reference; the last one writes a dirty inode back and
/// frees the on-volume inode when its link count reached zero.
pub fn iput(ctx: &mut FsContext<'_>, idx: InodeIdx) {
    if !ctx.inodes.release(idx) {
        return;
    }
    let sb = ctx.inodes.get(idx).sb;
    let Some(sb) = sb else {
        ctx.inodes.evict(idx);
        return;
    };
    let Ok(driver) = ctx.mounts.driver(sb) else {
        ctx.inodes.evict(idx);
        return;
    };
    if ctx.inodes.get(idx).nlink == 0 {
        let _ = driver.ifree(ctx, idx);
        ctx.inodes.evict(idx);
        return;
    }
    if ctx.inodes.get(idx).flags.contains(InodeFlags::DIRTY) {
        if driver.write_inode(ctx, idx).is_ok() {
            ctx.inodes
                .get_mut(idx)
                .flags
                .remove(InodeFlags::DIRTY);
        }
    }
    ctx.inodes.cache(idx);
}

/// Locks an inode, sleeping while another holder has it.
pub fn lock_inode(ctx: &mut FsContext<'_>, idx: InodeIdx) {
    while ctx.inodes.get(idx).flags.contains(InodeFlags::LOCKED) {
        wait::sleep_on(idx.channel());
    }
    ctx.inodes.get_mut(idx).flags.insert(InodeFlags::LOCKED);
}

/// Unlocks an inode and wakes waiters.
pub fn unlock_inode(ctx: &mut FsContext<'_>, idx: InodeIdx) {
    ctx.inodes.get_mut(idx).flags.remove(InodeFlags::LOCKED);
    wait::wake_up(idx.channel());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_find_release_cycle() {
        let mut t = InodeTable::new(4);
        let dev = DevId::new(3, 0);
        let a = t.alloc(dev, 10, None).unwrap();
        assert_eq!(t.find(dev, 10), Some(a));
        assert_eq!(t.get(a).count, 1);

        // Second reference via grab.
        t.grab(a);
        assert_eq!(t.get(a).count, 2);
        assert!(!t.release(a));
        assert!(t.release(a), "last reference");
        t.cache(a);

        // Still findable while cached; revived by grab.
        assert_eq!(t.find(dev, 10), Some(a));
        t.grab(a);
        assert_eq!(t.get(a).count, 1);
    }

    #[test]
    fn exhaustion_yields_enfile() {
        let mut t = InodeTable::new(2);
        let dev = DevId::new(3, 0);
        let _a = t.alloc(dev, 1, None).unwrap();
        let _b = t.alloc(dev, 2, None).unwrap();
        assert_eq!(t.alloc(dev, 3, None).unwrap_err(), Errno::ENFILE);
    }

    #[test]
    fn cached_slot_is_reclaimed_oldest_first() {
        let mut t = InodeTable::new(2);
        let dev = DevId::new(3, 0);
        let a = t.alloc(dev, 1, None).unwrap();
        let b = t.alloc(dev, 2, None).unwrap();
        t.release(a);
        t.cache(a);
        t.release(b);
        t.cache(b);

        // New identity reuses slot a (freed first) and evicts ino 1.
        let c = t.alloc(dev, 3, None).unwrap();
        assert_eq!(c, a);
        assert_eq!(t.find(dev, 1), None, "evicted identity must unhash");
        assert_eq!(t.find(dev, 2), Some(b), "ino 2 still cached");
        assert_eq!(t.find(dev, 3), Some(c));
    }

    #[test]
    fn invalidate_dev_spares_other_devices() {
        let mut t = InodeTable::new(4);
        let d1 = DevId::new(3, 0);
        let d2 = DevId::new(3, 1);
        let a = t.alloc(d1, 1, None).unwrap();
        let b = t.alloc(d2, 1, None).unwrap();
        t.release(a);
        t.cache(a);
        t.invalidate_dev(d1).unwrap();
        assert_eq!(t.find(d1, 1), None);
        assert_eq!(t.find(d2, 1), Some(b));

        // Busy inode blocks invalidation.
        assert_eq!(t.invalidate_dev(d2).unwrap_err(), Errno::EBUSY);
    }
}
