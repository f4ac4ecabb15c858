//! The buffered block cache.
//!
//! A bounded arena of buffers, each bound to one `(device, block)`
//! identity at a time. Three lists thread through the arena: the hash
//! chains for lookup, the LRU free list (every released buffer, reused
//! from the head, re-inserted at the tail), and the dirty list feeding
//! write-back. At most one buffer exists per `(device, block)`
//! system-wide, and the per-buffer lock serializes I/O on it, which is
//! what bounds in-flight requests to one per block.

use baryon_core::id::DevId;
use baryon_core::{Errno, Result};
use bitflags::bitflags;

use alloc::vec::Vec;

use crate::blkqueue::{add_blk_request, run_blk_request};
use crate::device::{BlkCmd, DeviceTable};
use crate::wait;

/// Buffer hash buckets.
const BUF_HASH_SIZE: usize = 128;

/// Most buffers reclaimed for the page allocator in one shot.
pub const NR_BUF_RECLAIM: usize = 250;

bitflags! {
    /// Buffer state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u8 {
        /// Data reflects the on-device block.
        const VALID = 0x01;
        /// Held by an owner; I/O and rebinding wait on the channel.
        const LOCKED = 0x02;
        /// Data is newer than the on-device block.
        const DIRTY = 0x04;
    }
}

/// Index of a buffer in the cache arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferIdx(u32);

impl BufferIdx {
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

    /// The wait channel identity of this buffer.
    #[must_use]
    pub const fn channel(self) -> usize {
        wait::CHANNEL_BUFFER_BASE + self.0 as usize
    }
}

/// One cache buffer.
#[derive(Debug)]
pub struct Buffer {
    /// Bound device (`DevId::NONE` when unbound).
    pub dev: DevId,
    /// Bound block number.
    pub block: u32,
    /// Block size in bytes.
    pub size: usize,
    /// State bits.
    pub flags: BufFlags,
    data: Vec<u8>,
    io_pending: bool,
    io_error: Option<Errno>,
    /// Group members still in flight when this buffer heads a grouped
    /// read.
    group_outstanding: u32,
    /// Next buffer in the sibling chain of a grouped read.
    pub next_sibling: Option<u32>,
    on_free: bool,
    prev_hash: Option<u32>,
    next_hash: Option<u32>,
    prev_free: Option<u32>,
    next_free: Option<u32>,
    prev_dirty: Option<u32>,
    next_dirty: Option<u32>,
}

impl Buffer {
    fn unbound() -> Self {
        Self {
            dev: DevId::NONE,
            block: 0,
            size: 0,
            flags: BufFlags::empty(),
            data: Vec::new(),
            io_pending: false,
            io_error: None,
            group_outstanding: 0,
            next_sibling: None,
            on_free: false,
            prev_hash: None,
            next_hash: None,
            prev_free: None,
            next_free: None,
            prev_dirty: None,
            next_dirty: None,
        }
    }
}

/// The global buffer cache.
pub struct BufferCache {
    bufs: Vec<Buffer>,
    hash: [Option<u32>; BUF_HASH_SIZE],
    free_head: Option<u32>,
    free_tail: Option<u32>,
    dirty_head: Option<u32>,
    dirty_count: usize,
    default_size: usize,
}

fn bucket(dev: DevId, block: u32) -> usize {
    (dev.as_raw().wrapping_mul(31).wrapping_add(block)) as usize % BUF_HASH_SIZE
}

impl BufferCache {
    /// Creates a cache of `n` buffers with the given default block size.
    #[must_use]
    pub fn new(n: usize, default_size: usize) -> Self {
        let mut c = Self {
            bufs: Vec::new(),
            hash: [None; BUF_HASH_SIZE],
            free_head: None,
            free_tail: None,
            dirty_head: None,
            dirty_count: 0,
            default_size,
        };
        for i in 0..n {
            c.bufs.push(Buffer::unbound());
            c.push_free_tail(i as u32);
        }
        c
    }

    /// Access to a buffer record.
    #[must_use]
    pub fn get(&self, idx: BufferIdx) -> &Buffer {
        &self.bufs[idx.index()]
    }

    /// The buffer's data.
    #[must_use]
    pub fn data(&self, idx: BufferIdx) -> &[u8] {
        &self.bufs[idx.index()].data
    }

    /// The buffer's data, writable.
    pub fn data_mut(&mut self, idx: BufferIdx) -> &mut [u8] {
        &mut self.bufs[idx.index()].data
    }

    /// Number of dirty buffers.
    #[must_use]
    pub fn dirty(&self) -> usize {
        self.dirty_count
    }

    /// Looks a bound buffer up without taking it.
    #[must_use]
    pub fn lookup(&self, dev: DevId, block: u32) -> Option<BufferIdx> {
        let mut cur = self.hash[bucket(dev, block)];
        while let Some(i) = cur {
            let b = &self.bufs[i as usize];
            if b.dev == dev && b.block == block {
                return Some(BufferIdx(i));
            }
            cur = b.next_hash;
        }
        None
    }

    /// Gets the buffer for `(dev, block)` locked, binding a recycled
    /// one on a miss (write-backing a dirty victim first).
    pub fn getblk(
        &mut self,
        devices: &mut DeviceTable,
        dev: DevId,
        block: u32,
        size: usize,
    ) -> Result<BufferIdx> {
        loop {
            if let Some(idx) = self.lookup(dev, block) {
                if self.bufs[idx.index()].flags.contains(BufFlags::LOCKED) {
                    wait::sleep_on(idx.channel());
                    continue;
                }
                self.unlink_free(idx.0);
                self.bufs[idx.index()].flags.insert(BufFlags::LOCKED);
                return Ok(idx);
            }

            let Some(victim) = self.free_head else {
                // Every buffer is held; wait for a release.
                wait::sleep_on(wait::CHANNEL_BUFFER_BASE - 1);
                continue;
            };
            self.unlink_free(victim);
            if self.bufs[victim as usize].flags.contains(BufFlags::DIRTY) {
                if let Err(e) = self.writeback(devices, BufferIdx(victim)) {
                    self.push_free_tail(victim);
                    return Err(e);
                }
            }
            if self.bufs[victim as usize].dev != DevId::NONE {
                self.unlink_hash(victim);
            }
            let size = if size == 0 { self.default_size } else { size };
            let b = &mut self.bufs[victim as usize];
            b.dev = dev;
            b.block = block;
            b.size = size;
            b.flags = BufFlags::LOCKED;
            b.io_error = None;
            b.io_pending = false;
            b.data.clear();
            b.data.resize(size, 0);
            self.link_hash(victim, bucket(dev, block));
            return Ok(BufferIdx(victim));
        }
    }

    /// Reads a block through the cache: returns the locked buffer,
    /// valid, after I/O if it was a miss.
    pub fn bread(
        &mut self,
        devices: &mut DeviceTable,
        dev: DevId,
        block: u32,
        size: usize,
    ) -> Result<BufferIdx> {
        let idx = self.getblk(devices, dev, block, size)?;
        if self.bufs[idx.index()].flags.contains(BufFlags::VALID) {
            return Ok(idx);
        }
        self.bufs[idx.index()].io_pending = true;
        let size = self.bufs[idx.index()].size;
        add_blk_request(devices, BlkCmd::Read, dev, block, size, idx, None)?;
        run_blk_request(devices, self, dev)?;
        while self.bufs[idx.index()].io_pending {
            wait::sleep_on(idx.channel());
        }
        if let Some(e) = self.bufs[idx.index()].io_error {
            self.brelse(idx);
            return Err(e);
        }
        Ok(idx)
    }

    /// Reads `blocks[0]` and queues the rest of the group in one sweep
    /// (grouped read-ahead). Returns the locked buffer of `blocks[0]`;
    /// the read-ahead siblings are released into the cache.
    pub fn gbread(
        &mut self,
        devices: &mut DeviceTable,
        dev: DevId,
        blocks: &[u32],
        size: usize,
    ) -> Result<BufferIdx> {
        let (&first, rest) = blocks.split_first().ok_or(Errno::EINVAL)?;
        let head = self.getblk(devices, dev, first, size)?;

        let mut members: Vec<BufferIdx> = Vec::new();
        if !self.bufs[head.index()].flags.contains(BufFlags::VALID) {
            members.push(head);
        }
        let mut siblings: Vec<BufferIdx> = Vec::new();
        for &blk in rest {
            let idx = self.getblk(devices, dev, blk, size)?;
            siblings.push(idx);
            if !self.bufs[idx.index()].flags.contains(BufFlags::VALID) {
                members.push(idx);
            }
        }

        if !members.is_empty() {
            self.bufs[head.index()].group_outstanding = members.len() as u32;
            // Thread the sibling chain off the head for the duration of
            // the group.
            let mut prev = head;
            for &m in &members {
                if m != head {
                    self.bufs[prev.index()].next_sibling = Some(m.0);
                    prev = m;
                }
            }
            for &m in &members {
                let sz = self.bufs[m.index()].size;
                self.bufs[m.index()].io_pending = true;
                add_blk_request(
                    devices,
                    BlkCmd::Read,
                    dev,
                    self.bufs[m.index()].block,
                    sz,
                    m,
                    Some(head),
                )?;
            }
            run_blk_request(devices, self, dev)?;
            while self.bufs[head.index()].group_outstanding > 0 {
                wait::sleep_on(head.channel());
            }
            // Unthread the chain.
            let mut cur = Some(head.0);
            while let Some(c) = cur {
                cur = self.bufs[c as usize].next_sibling.take();
            }
        }

        for idx in siblings {
            self.brelse(idx);
        }
        if let Some(e) = self.bufs[head.index()].io_error {
            self.brelse(head);
            return Err(e);
        }
        Ok(head)
    }

    /// Marks a held buffer dirty and releases it; write-back happens
    /// asynchronously (flush daemon, eviction, or `sync_dev`).
    pub fn bwrite(&mut self, idx: BufferIdx) {
        self.mark_dirty(idx);
        self.brelse(idx);
    }

    /// Marks a held buffer dirty without releasing it.
    pub fn mark_dirty(&mut self, idx: BufferIdx) {
        let i = idx.index();
        self.bufs[i].flags.insert(BufFlags::VALID);
        if !self.bufs[i].flags.contains(BufFlags::DIRTY) {
            self.bufs[i].flags.insert(BufFlags::DIRTY);
            self.push_dirty(idx.0);
        }
    }

    /// Releases a held buffer: unlocks, wakes waiters, re-inserts at
    /// the LRU tail.
    pub fn brelse(&mut self, idx: BufferIdx) {
        let i = idx.index();
        self.bufs[i].flags.remove(BufFlags::LOCKED);
        if !self.bufs[i].on_free {
            self.push_free_tail(idx.0);
        }
        wait::wake_up(idx.channel());
        wait::wake_up(wait::CHANNEL_BUFFER_BASE - 1);
    }

    /// I/O completion: records the outcome and validates the data.
    pub(crate) fn io_done(&mut self, idx: BufferIdx, errno: Option<Errno>) {
        let b = &mut self.bufs[idx.index()];
        b.io_pending = false;
        b.io_error = errno;
        if errno.is_none() {
            b.flags.insert(BufFlags::VALID);
        }
    }

    /// Counts one grouped-read completion against `head`; true when the
    /// group is done.
    pub(crate) fn group_done(&mut self, head: BufferIdx) -> bool {
        let b = &mut self.bufs[head.index()];
        b.group_outstanding = b.group_outstanding.saturating_sub(1);
        b.group_outstanding == 0
    }

    /// Writes every dirty buffer of `dev` back (all devices when
    /// `DevId::NONE`).
    pub fn sync_dev(&mut self, devices: &mut DeviceTable, dev: DevId) -> Result<()> {
        loop {
            let mut target = None;
            let mut cur = self.dirty_head;
            while let Some(i) = cur {
                let b = &self.bufs[i as usize];
                if (dev == DevId::NONE || b.dev == dev) && !b.flags.contains(BufFlags::LOCKED) {
                    target = Some(i);
                    break;
                }
                cur = b.next_dirty;
            }
            let Some(i) = target else {
                return Ok(());
            };
            self.writeback(devices, BufferIdx(i))?;
        }
    }

    /// One step of the flush daemon: when the dirty fraction exceeds
    /// `threshold_pct`, writes everything back. Returns buffers flushed.
    pub fn flush_step(&mut self, devices: &mut DeviceTable, threshold_pct: usize) -> Result<usize> {
        if self.bufs.is_empty() || self.dirty_count * 100 < threshold_pct * self.bufs.len() {
            return Ok(0);
        }
        let before = self.dirty_count;
        self.sync_dev(devices, DevId::NONE)?;
        Ok(before - self.dirty_count)
    }

    /// Invalidates every unlocked buffer of `dev` (unmount, media
    /// change).
    pub fn invalidate_dev(&mut self, dev: DevId) {
        for i in 0..self.bufs.len() {
            let b = &self.bufs[i];
            if b.dev == dev && !b.flags.contains(BufFlags::LOCKED) {
                self.unlink_hash(i as u32);
                if self.bufs[i].flags.contains(BufFlags::DIRTY) {
                    self.unlink_dirty(i as u32);
                }
                self.bufs[i].flags = BufFlags::empty();
                self.bufs[i].dev = DevId::NONE;
            }
        }
    }

    /// Releases the payload memory of up to `n` clean buffers from the
    /// LRU head, capped at [`NR_BUF_RECLAIM`]. Returns the number
    /// reclaimed; the frame allocator's OOM path calls this.
    pub fn reclaim(&mut self, n: usize) -> usize {
        let n = n.min(NR_BUF_RECLAIM);
        let mut reclaimed = 0;
        let mut cur = self.free_head;
        while let Some(i) = cur {
            if reclaimed >= n {
                break;
            }
            cur = self.bufs[i as usize].next_free;
            let b = &self.bufs[i as usize];
            if b.dev != DevId::NONE
                && b.flags.contains(BufFlags::VALID)
                && !b.flags.intersects(BufFlags::DIRTY | BufFlags::LOCKED)
            {
                self.unlink_hash(i);
                let b = &mut self.bufs[i as usize];
                b.flags = BufFlags::empty();
                b.dev = DevId::NONE;
                b.data = Vec::new();
                reclaimed += 1;
            }
        }
        reclaimed
    }

    fn writeback(&mut self, devices: &mut DeviceTable, idx: BufferIdx) -> Result<()> {
        let i = idx.index();
        let (dev, block, size) = (self.bufs[i].dev, self.bufs[i].block, self.bufs[i].size);
        self.bufs[i].io_pending = true;
        add_blk_request(devices, BlkCmd::Write, dev, block, size, idx, None)?;
        run_blk_request(devices, self, dev)?;
        while self.bufs[i].io_pending {
            wait::sleep_on(idx.channel());
        }
        self.bufs[i].flags.remove(BufFlags::DIRTY);
        self.unlink_dirty(idx.0);
        if let Some(e) = self.bufs[i].io_error.take() {
            return Err(e);
        }
        Ok(())
    }

    // ── List plumbing ───────────────────────────────────────────────

    fn link_hash(&mut self, i: u32, bucket: usize) {
        self.bufs[i as usize].prev_hash = None;
        self.bufs[i as usize].next_hash = self.hash[bucket];
        if let Some(h) = self.hash[bucket] {
            self.bufs[h as usize].prev_hash = Some(i);
        }
        self.hash[bucket] = Some(i);
    }

    fn unlink_hash(&mut self, i: u32) {
        let b = &self.bufs[i as usize];
        if b.dev == DevId::NONE {
            return;
        }
        let (prev, next, bk) = (b.prev_hash, b.next_hash, bucket(b.dev, b.block));
        if let Some(p) = prev {
            self.bufs[p as usize].next_hash = next;
        } else if self.hash[bk] == Some(i) {
            self.hash[bk] = next;
        }
        if let Some(nx) = next {
            self.bufs[nx as usize].prev_hash = prev;
        }
        self.bufs[i as usize].prev_hash = None;
        self.bufs[i as usize].next_hash = None;
    }

    fn push_free_tail(&mut self, i: u32) {
        self.bufs[i as usize].prev_free = self.free_tail;
        self.bufs[i as usize].next_free = None;
        match self.free_tail {
            Some(t) => self.bufs[t as usize].next_free = Some(i),
            None => self.free_head = Some(i),
        }
        self.free_tail = Some(i);
        self.bufs[i as usize].on_free = true;
    }

    fn unlink_free(&mut self, i: u32) {
        if !self.bufs[i as usize].on_free {
            return;
        }
        let (prev, next) = (self.bufs[i as usize].prev_free, self.bufs[i as usize].next_free);
        match prev {
            Some(p) => self.bufs[p as usize].next_free = next,
            None => self.free_head = next,
        }
        match next {
            Some(nx) => self.bufs[nx as usize].prev_free = prev,
            None => self.free_tail = prev,
        }
        self.bufs[i as usize].prev_free = None;
        self.bufs[i as usize].next_free = None;
        self.bufs[i as usize].on_free = false;
    }

    fn push_dirty(&mut self, i: u32) {
        self.bufs[i as usize].prev_dirty = None;
        self.bufs[i as usize].next_dirty = self.dirty_head;
        if let Some(h) = self.dirty_head {
            self.bufs[h as usize].prev_dirty = Some(i);
        }
        self.dirty_head = Some(i);
        self.dirty_count += 1;
    }

    fn unlink_dirty(&mut self, i: u32) {
        let b = &self.bufs[i as usize];
        if b.prev_dirty.is_none() && self.dirty_head != Some(i) {
            return; // not on the dirty list
        }
        let (prev, next) = (b.prev_dirty, b.next_dirty);
        match prev {
            Some(p) => self.bufs[p as usize].next_dirty = next,
            None => self.dirty_head = next,
        }
        if let Some(nx) = next {
            self.bufs[nx as usize].prev_dirty = prev;
        }
        self.bufs[i as usize].prev_dirty = None;
        self.bufs[i as usize].next_dirty = None;
        self.dirty_count -= 1;
    }

    /// Verifies cache invariants: unique `(dev, block)` identities and
    /// every dirty buffer on the dirty list.
    ///
    /// # Panics
    ///
    /// Panics on the first violation.
    pub fn assert_consistent(&self) {
        for (i, b) in self.bufs.iter().enumerate() {
            if b.dev == DevId::NONE {
                continue;
            }
            assert_eq!(
                self.lookup(b.dev, b.block).map(BufferIdx::index),
                Some(self.first_with_identity(b.dev, b.block)),
                "buffer {i} identity not reachable through the hash"
            );
            if b.flags.contains(BufFlags::DIRTY) {
                let mut cur = self.dirty_head;
                let mut found = false;
                while let Some(c) = cur {
                    if c as usize == i {
                        found = true;
                        break;
                    }
                    cur = self.bufs[c as usize].next_dirty;
                }
                assert!(found, "dirty buffer {i} missing from dirty list");
            }
        }
        // No two buffers share an identity.
        for (i, a) in self.bufs.iter().enumerate() {
            if a.dev == DevId::NONE {
                continue;
            }
            for (j, b) in self.bufs.iter().enumerate().skip(i + 1) {
                assert!(
                    !(a.dev == b.dev && a.block == b.block),
                    "buffers {i} and {j} both bound to {}:{}",
                    a.dev,
                    a.block
                );
            }
        }
    }

    fn first_with_identity(&self, dev: DevId, block: u32) -> usize {
        self.bufs
            .iter()
            .position(|b| b.dev == dev && b.block == block)
            .expect("identity exists")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, BlockDriver, MinorMap};
    use crate::ramdisk::RamDisk;
    use alloc::sync::Arc;

    const BLKSIZE: usize = 1024;

    fn setup(nbufs: usize, nblocks: usize) -> (BufferCache, DeviceTable, DevId) {
        let dev = DevId::new(1, 0);
        let mut devices = DeviceTable::new();
        let disk = RamDisk::new(nblocks * BLKSIZE, BLKSIZE);
        let mut minors = MinorMap::default();
        minors.set(0);
        devices
            .register_block(BlockDevice {
                name: "rd",
                major: 1,
                minors,
                blksize: BLKSIZE,
                driver: Arc::new(disk),
                queue: crate::blkqueue::RequestQueue::new(),
            })
            .unwrap();
        (BufferCache::new(nbufs, BLKSIZE), devices, dev)
    }

    #[test]
    fn bread_miss_then_hit() {
        let (mut cache, mut devices, dev) = setup(4, 8);
        let b = cache.bread(&mut devices, dev, 3, BLKSIZE).unwrap();
        assert!(cache.get(b).flags.contains(BufFlags::VALID));
        assert!(cache.get(b).flags.contains(BufFlags::LOCKED));
        cache.data_mut(b).fill(0x5A);
        cache.brelse(b);

        // Hit returns the same buffer with the same bytes (no re-read).
        let b2 = cache.bread(&mut devices, dev, 3, BLKSIZE).unwrap();
        assert_eq!(b2, b);
        assert!(cache.data(b2).iter().all(|&x| x == 0x5A));
        cache.brelse(b2);
        cache.assert_consistent();
    }

    #[test]
    fn dirty_write_visible_before_flush() {
        let (mut cache, mut devices, dev) = setup(4, 8);
        let b = cache.bread(&mut devices, dev, 0, BLKSIZE).unwrap();
        cache.data_mut(b)[..4].copy_from_slice(b"ABCD");
        cache.bwrite(b);
        assert_eq!(cache.dirty(), 1);

        // bread before the flush daemon runs sees the dirty bytes.
        let b2 = cache.bread(&mut devices, dev, 0, BLKSIZE).unwrap();
        assert_eq!(&cache.data(b2)[..4], b"ABCD");
        cache.brelse(b2);
        cache.assert_consistent();
    }

    #[test]
    fn eviction_writes_dirty_victim_back() {
        let (mut cache, mut devices, dev) = setup(2, 8);
        let b = cache.bread(&mut devices, dev, 0, BLKSIZE).unwrap();
        cache.data_mut(b)[0] = 0x77;
        cache.bwrite(b);

        // Two more blocks force the dirty victim out.
        for blk in 1..3 {
            let x = cache.bread(&mut devices, dev, blk, BLKSIZE).unwrap();
            cache.brelse(x);
        }
        assert_eq!(cache.dirty(), 0, "victim must be written back");

        // Re-reading block 0 hits the device and sees the flushed byte.
        let b2 = cache.bread(&mut devices, dev, 0, BLKSIZE).unwrap();
        assert_eq!(cache.data(b2)[0], 0x77);
        cache.brelse(b2);
        cache.assert_consistent();
    }

    #[test]
    fn sync_dev_clears_dirty_list() {
        let (mut cache, mut devices, dev) = setup(4, 8);
        for blk in 0..3 {
            let b = cache.bread(&mut devices, dev, blk, BLKSIZE).unwrap();
            cache.data_mut(b)[0] = blk as u8 + 1;
            cache.bwrite(b);
        }
        assert_eq!(cache.dirty(), 3);
        cache.sync_dev(&mut devices, dev).unwrap();
        assert_eq!(cache.dirty(), 0);
        cache.assert_consistent();
    }

    #[test]
    fn flush_step_honors_threshold() {
        let (mut cache, mut devices, dev) = setup(4, 8);
        let b = cache.bread(&mut devices, dev, 0, BLKSIZE).unwrap();
        cache.bwrite(b);
        // 1 of 4 dirty = 25%: below a 50% threshold, nothing moves.
        assert_eq!(cache.flush_step(&mut devices, 50).unwrap(), 0);
        assert_eq!(cache.flush_step(&mut devices, 25).unwrap(), 1);
        assert_eq!(cache.dirty(), 0);
    }

    #[test]
    fn reclaim_frees_clean_buffers_only() {
        let (mut cache, mut devices, dev) = setup(4, 8);
        let clean = cache.bread(&mut devices, dev, 0, BLKSIZE).unwrap();
        cache.brelse(clean);
        let dirty = cache.bread(&mut devices, dev, 1, BLKSIZE).unwrap();
        cache.data_mut(dirty)[0] = 1;
        cache.bwrite(dirty);

        let got = cache.reclaim(8);
        assert_eq!(got, 1, "only the clean buffer is reclaimable");
        assert!(cache.lookup(dev, 0).is_none(), "reclaimed identity gone");
        assert!(cache.lookup(dev, 1).is_some(), "dirty buffer survives");
        cache.assert_consistent();
    }

    #[test]
    fn gbread_populates_the_group() {
        let (mut cache, mut devices, dev) = setup(8, 16);
        // Seed distinct first bytes on the device.
        for blk in 0..4u32 {
            let b = cache.bread(&mut devices, dev, blk, BLKSIZE).unwrap();
            cache.data_mut(b)[0] = 0x10 + blk as u8;
            cache.bwrite(b);
        }
        cache.sync_dev(&mut devices, dev).unwrap();
        cache.invalidate_dev(dev);

        let head = cache.gbread(&mut devices, dev, &[0, 1, 2, 3], BLKSIZE).unwrap();
        assert_eq!(cache.data(head)[0], 0x10);
        cache.brelse(head);

        // The read-ahead siblings are now cache hits.
        for blk in 1..4u32 {
            let b = cache.lookup(dev, blk).expect("sibling cached");
            assert!(cache.get(b).flags.contains(BufFlags::VALID));
            assert_eq!(cache.data(b)[0], 0x10 + blk as u8);
        }
        cache.assert_consistent();
    }

    /// Driver that fails every transfer, for the EIO path.
    struct BrokenDisk;

    impl BlockDriver for BrokenDisk {
        fn request(
            &self,
            _dev: DevId,
            _cmd: BlkCmd,
            _blk: u32,
            _buf: &mut [u8],
        ) -> Result<bool> {
            Err(Errno::EIO)
        }
    }

    #[test]
    fn driver_error_surfaces_as_eio() {
        let mut devices = DeviceTable::new();
        let mut minors = MinorMap::default();
        minors.set(0);
        devices
            .register_block(BlockDevice {
                name: "bad",
                major: 2,
                minors,
                blksize: BLKSIZE,
                driver: Arc::new(BrokenDisk),
                queue: crate::blkqueue::RequestQueue::new(),
            })
            .unwrap();
        let mut cache = BufferCache::new(2, BLKSIZE);
        let err = cache
            .bread(&mut devices, DevId::new(2, 0), 0, BLKSIZE)
            .unwrap_err();
        assert_eq!(err, Errno::EIO);
    }
}
