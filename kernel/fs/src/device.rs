//! The device model.
//!
//! A major/minor pair names a device; block and character majors live
//! in separate tables. A block device carries its driver callback and
//! its request queue; a character device carries a filesystem-style
//! operation table the VFS dispatches through when a character-special
//! inode is opened.

use alloc::sync::Arc;

use baryon_core::id::DevId;
use baryon_core::{Errno, Result};

use crate::blkqueue::RequestQueue;
use crate::fsops::FsDriver;

/// Block major slots.
pub const NR_BLKDEV: usize = 16;

/// Character major slots.
pub const NR_CHRDEV: usize = 16;

/// Block transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlkCmd {
    /// Device to memory.
    Read,
    /// Memory to device.
    Write,
}

/// A block device driver's strategy callback.
pub trait BlockDriver: Send + Sync {
    /// Services one block transfer.
    ///
    /// Returns `Ok(true)` when the transfer completed synchronously;
    /// `Ok(false)` means the driver accepted it and will complete it
    /// from its interrupt handler via the request queue.
    fn request(&self, dev: DevId, cmd: BlkCmd, block: u32, buf: &mut [u8]) -> Result<bool>;
}

/// 256 minors, one presence bit each.
#[derive(Debug, Clone, Copy, Default)]
pub struct MinorMap([u32; 8]);

impl MinorMap {
    /// Marks `minor` present.
    pub fn set(&mut self, minor: u8) {
        self.0[minor as usize / 32] |= 1 << (minor % 32);
    }

    /// Clears `minor`.
    pub fn clear(&mut self, minor: u8) {
        self.0[minor as usize / 32] &= !(1 << (minor % 32));
    }

    /// Returns true if `minor` is present.
    #[must_use]
    pub fn has(&self, minor: u8) -> bool {
        self.0[minor as usize / 32] & (1 << (minor % 32)) != 0
    }
}

/// A registered block device major.
pub struct BlockDevice {
    /// Driver name.
    pub name: &'static str,
    /// Major number.
    pub major: u8,
    /// Registered minors.
    pub minors: MinorMap,
    /// Device block size in bytes.
    pub blksize: usize,
    /// The strategy routine.
    pub driver: Arc<dyn BlockDriver>,
    /// Pending transfers.
    pub queue: RequestQueue,
}

impl core::fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockDevice")
            .field("name", &self.name)
            .field("major", &self.major)
            .finish_non_exhaustive()
    }
}

/// A registered character device major.
pub struct CharDevice {
    /// Driver name.
    pub name: &'static str,
    /// Major number.
    pub major: u8,
    /// Registered minors.
    pub minors: MinorMap,
    /// Operation table the VFS dispatches through.
    pub ops: Arc<dyn FsDriver>,
}

/// Block and character device tables.
pub struct DeviceTable {
    block: [Option<BlockDevice>; NR_BLKDEV],
    chr: [Option<CharDevice>; NR_CHRDEV],
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTable {
    /// Creates empty tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            block: [const { None }; NR_BLKDEV],
            chr: [const { None }; NR_CHRDEV],
        }
    }

    /// Registers a block major.
    ///
    /// Fails with `EBUSY` if the major is taken, `EINVAL` if out of
    /// range.
    pub fn register_block(&mut self, dev: BlockDevice) -> Result<()> {
        let major = dev.major as usize;
        if major >= NR_BLKDEV {
            return Err(Errno::EINVAL);
        }
        if self.block[major].is_some() {
            return Err(Errno::EBUSY);
        }
        self.block[major] = Some(dev);
        Ok(())
    }

    /// Registers a character major.
    pub fn register_char(&mut self, dev: CharDevice) -> Result<()> {
        let major = dev.major as usize;
        if major >= NR_CHRDEV {
            return Err(Errno::EINVAL);
        }
        if self.chr[major].is_some() {
            return Err(Errno::EBUSY);
        }
        self.chr[major] = Some(dev);
        Ok(())
    }

    /// Unregisters a block major.
    pub fn unregister_block(&mut self, major: u8) -> Result<()> {
        let slot = self
            .block
            .get_mut(major as usize)
            .ok_or(Errno::EINVAL)?;
        if slot.take().is_none() {
            return Err(Errno::ENODEV);
        }
        Ok(())
    }

    /// Looks up the block device owning `dev`.
    pub fn block_dev(&self, dev: DevId) -> Result<&BlockDevice> {
        let d = self.block[dev.major() as usize % NR_BLKDEV]
            .as_ref()
            .ok_or(Errno::ENXIO)?;
        if d.major != dev.major() || !d.minors.has(dev.minor()) {
            return Err(Errno::ENXIO);
        }
        Ok(d)
    }

    /// Mutable lookup of the block device owning `dev`.
    pub fn block_dev_mut(&mut self, dev: DevId) -> Result<&mut BlockDevice> {
        let d = self.block[dev.major() as usize % NR_BLKDEV]
            .as_mut()
            .ok_or(Errno::ENXIO)?;
        if d.major != dev.major() || !d.minors.has(dev.minor()) {
            return Err(Errno::ENXIO);
        }
        Ok(d)
    }

    /// Looks up the character device owning `dev`.
    pub fn char_dev(&self, dev: DevId) -> Result<&CharDevice> {
        let d = self.chr[dev.major() as usize % NR_CHRDEV]
            .as_ref()
            .ok_or(Errno::ENXIO)?;
        if d.major != dev.major() || !d.minors.has(dev.minor()) {
            return Err(Errno::ENXIO);
        }
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDisk;

    impl BlockDriver for NullDisk {
        fn request(&self, _dev: DevId, _cmd: BlkCmd, _blk: u32, _buf: &mut [u8]) -> Result<bool> {
            Ok(true)
        }
    }

    fn disk(major: u8) -> BlockDevice {
        let mut minors = MinorMap::default();
        minors.set(0);
        BlockDevice {
            name: "null",
            major,
            minors,
            blksize: 1024,
            driver: Arc::new(NullDisk),
            queue: RequestQueue::new(),
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut t = DeviceTable::new();
        t.register_block(disk(3)).unwrap();
        assert!(t.block_dev(DevId::new(3, 0)).is_ok());
        assert_eq!(t.block_dev(DevId::new(3, 1)).unwrap_err(), Errno::ENXIO);
        assert_eq!(t.block_dev(DevId::new(4, 0)).unwrap_err(), Errno::ENXIO);
        assert_eq!(t.register_block(disk(3)).unwrap_err(), Errno::EBUSY);
    }

    #[test]
    fn minor_bitmap() {
        let mut m = MinorMap::default();
        m.set(0);
        m.set(64);
        m.set(255);
        assert!(m.has(0) && m.has(64) && m.has(255));
        assert!(!m.has(1) && !m.has(63));
        m.clear(64);
        assert!(!m.has(64));
    }
}
