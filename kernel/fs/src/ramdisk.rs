//! RAM-backed block device.
//!
//! A byte array behind the block-driver interface. Serves the `initrd=`
//! boot path and gives the buffer cache and request queue something
//! synchronous to run against in tests. Every transfer completes in the
//! strategy call itself.

use baryon_core::id::DevId;
use baryon_core::sync::SpinLock;
use baryon_core::{Errno, Result};

use alloc::vec::Vec;

use crate::device::{BlkCmd, BlockDriver};

/// A memory-backed disk.
pub struct RamDisk {
    data: SpinLock<Vec<u8>>,
    blksize: usize,
}

impl RamDisk {
    /// Creates a zero-filled disk of `size` bytes.
    #[must_use]
    pub fn new(size: usize, blksize: usize) -> Self {
        Self {
            data: SpinLock::new(alloc::vec![0u8; size]),
            blksize,
        }
    }

    /// Wraps an existing image (a loaded initrd).
    #[must_use]
    pub fn from_image(image: Vec<u8>, blksize: usize) -> Self {
        Self {
            data: SpinLock::new(image),
            blksize,
        }
    }

    /// Disk capacity in blocks.
    #[must_use]
    pub fn blocks(&self) -> usize {
        self.data.lock().len() / self.blksize
    }
}

impl BlockDriver for RamDisk {
    fn request(&self, _dev: DevId, cmd: BlkCmd, block: u32, buf: &mut [u8]) -> Result<bool> {
        let mut data = self.data.lock();
        let start = block as usize * self.blksize;
        let end = start + buf.len();
        if buf.len() > self.blksize || end > data.len() {
            return Err(Errno::EIO);
        }
        match cmd {
            BlkCmd::Read => buf.copy_from_slice(&data[start..end]),
            BlkCmd::Write => data[start..end].copy_from_slice(buf),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let rd = RamDisk::new(4096, 1024);
        let dev = DevId::new(1, 0);
        let mut block = [0u8; 1024];
        block[..5].copy_from_slice(b"hello");
        assert!(rd.request(dev, BlkCmd::Write, 2, &mut block).unwrap());

        let mut out = [0u8; 1024];
        assert!(rd.request(dev, BlkCmd::Read, 2, &mut out).unwrap());
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn out_of_range_is_eio() {
        let rd = RamDisk::new(2048, 1024);
        let mut buf = [0u8; 1024];
        assert_eq!(
            rd.request(DevId::new(1, 0), BlkCmd::Read, 2, &mut buf).unwrap_err(),
            Errno::EIO
        );
        assert_eq!(rd.blocks(), 2);
    }
}
