//! The filesystem operation table and dispatch context.
//!
//! A mounted filesystem is a [`FsDriver`] trait object. Every operation
//! has a default body returning the conventional "unsupported" errno,
//! so a concrete filesystem implements only what it supports — the
//! trait is the classic vtable of nullable function pointers with the
//! null checks folded into the defaults.
//!
//! Operations receive a [`FsContext`] bundling mutable access to the
//! global VFS tables; the driver object itself holds any per-volume
//! state behind its own interior lock.

use alloc::string::String;
use alloc::sync::Arc;

use baryon_core::id::DevId;
use baryon_core::{Errno, Result};
use bitflags::bitflags;

use crate::buffer::BufferCache;
use crate::device::DeviceTable;
use crate::file::{FileTable, OpenFlags};
use crate::inode::{InodeIdx, InodeTable};
use crate::mode::FileMode;
use crate::superblock::{MountIdx, MountTable};

bitflags! {
    /// Registration-time properties of a filesystem type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FsFlags: u32 {
        /// Must be mounted on a block device.
        const REQUIRES_DEV = 0x01;
        /// Pseudo-filesystem, auto-mounted at registration.
        const KERN_MOUNT = 0x02;
    }
}

/// A registered filesystem type.
#[derive(Clone, Copy)]
pub struct FsType {
    /// Name used by `mount -t`.
    pub name: &'static str,
    /// Registration flags.
    pub flags: FsFlags,
    /// Creates a fresh driver instance for one mounted volume.
    pub create: fn() -> Result<Arc<dyn FsDriver>>,
}

/// One directory entry produced by [`FsDriver::readdir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Inode number within the filesystem.
    pub ino: u32,
    /// Entry name.
    pub name: String,
}

/// Filesystem statistics for `statfs(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    /// Filesystem magic.
    pub fs_type: u32,
    /// Block size.
    pub bsize: u32,
    /// Total data blocks.
    pub blocks: u32,
    /// Free blocks.
    pub bfree: u32,
    /// Free blocks available to unprivileged users.
    pub bavail: u32,
    /// Total inodes.
    pub files: u32,
    /// Free inodes.
    pub ffree: u32,
    /// Maximum name length.
    pub namelen: u32,
}

/// Mutable access to the global VFS tables, assembled per operation by
/// the syscall layer (and directly by tests).
pub struct FsContext<'a> {
    /// The inode table.
    pub inodes: &'a mut InodeTable,
    /// Superblocks, the mount ring and registered filesystem types.
    pub mounts: &'a mut MountTable,
    /// The global open-file table.
    pub files: &'a mut FileTable,
    /// The buffered block cache.
    pub buffers: &'a mut BufferCache,
    /// Block and character device tables.
    pub devices: &'a mut DeviceTable,
}

/// The per-filesystem operation table.
///
/// Offsets into files are 64-bit to carry the large-file variants of
/// the syscall surface. Inode numbers are the filesystem's own 32-bit
/// namespace; the VFS maps `(device, number)` pairs to table slots.
#[allow(unused_variables, reason = "default bodies ignore their arguments")]
pub trait FsDriver: Send + Sync {
    /// Filesystem type name.
    fn name(&self) -> &'static str;

    // ── Superblock operations ───────────────────────────────────────

    /// Reads the superblock and creates the root inode. Called once at
    /// mount; must set the mount entry's root.
    fn read_superblock(&self, ctx: &mut FsContext<'_>, sb: MountIdx) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Writes the superblock back.
    fn write_superblock(&self, ctx: &mut FsContext<'_>, sb: MountIdx) -> Result<()> {
        Ok(())
    }

    /// Releases driver state at unmount.
    fn release_superblock(&self, ctx: &mut FsContext<'_>, sb: MountIdx) -> Result<()> {
        Ok(())
    }

    /// Changes mount flags in place.
    fn remount(&self, ctx: &mut FsContext<'_>, sb: MountIdx, rdonly: bool) -> Result<()> {
        Ok(())
    }

    /// Reports filesystem statistics.
    fn statfs(&self, ctx: &mut FsContext<'_>, sb: MountIdx) -> Result<StatFs> {
        Err(Errno::ENOSYS)
    }

    // ── Inode lifecycle ─────────────────────────────────────────────

    /// Fills the in-memory inode from backing store; the slot already
    /// carries the device and inode number.
    fn read_inode(&self, ctx: &mut FsContext<'_>, ino: InodeIdx) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    /// Writes a dirty inode back.
    fn write_inode(&self, ctx: &mut FsContext<'_>, ino: InodeIdx) -> Result<()> {
        Ok(())
    }

    /// Allocates a fresh on-volume inode, returning its number.
    fn ialloc(&self, ctx: &mut FsContext<'_>, sb: MountIdx, mode: FileMode) -> Result<u32> {
        Err(Errno::ENOSYS)
    }

    /// Releases an on-volume inode whose link count reached zero.
    fn ifree(&self, ctx: &mut FsContext<'_>, ino: InodeIdx) -> Result<()> {
        Err(Errno::ENOSYS)
    }

    // ── Directory operations ────────────────────────────────────────

    /// Looks `name` up in `dir`, returning the child's inode number.
    fn lookup(&self, ctx: &mut FsContext<'_>, dir: InodeIdx, name: &str) -> Result<u32> {
        Err(Errno::ENOTDIR)
    }

    /// Creates a regular file in `dir`.
    fn create(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        mode: FileMode,
    ) -> Result<u32> {
        Err(Errno::EPERM)
    }

    /// Creates a device or fifo node in `dir`.
    fn mknod(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        mode: FileMode,
        rdev: DevId,
    ) -> Result<u32> {
        Err(Errno::EPERM)
    }

    /// Creates a directory in `dir`.
    fn mkdir(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        mode: FileMode,
    ) -> Result<u32> {
        Err(Errno::EPERM)
    }

    /// Removes an empty directory.
    fn rmdir(&self, ctx: &mut FsContext<'_>, dir: InodeIdx, name: &str) -> Result<()> {
        Err(Errno::EPERM)
    }

    /// Removes a non-directory entry.
    fn unlink(&self, ctx: &mut FsContext<'_>, dir: InodeIdx, name: &str) -> Result<()> {
        Err(Errno::EPERM)
    }

    /// Adds a hard link to `target` under `dir`.
    fn link(
        &self,
        ctx: &mut FsContext<'_>,
        target: InodeIdx,
        dir: InodeIdx,
        name: &str,
    ) -> Result<()> {
        Err(Errno::EPERM)
    }

    /// Creates a symbolic link holding `target_path`.
    fn symlink(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        target_path: &str,
    ) -> Result<u32> {
        Err(Errno::EPERM)
    }

    /// Renames `old_name` in `old_dir` to `new_name` in `new_dir`.
    fn rename(
        &self,
        ctx: &mut FsContext<'_>,
        old_dir: InodeIdx,
        old_name: &str,
        new_dir: InodeIdx,
        new_name: &str,
    ) -> Result<()> {
        Err(Errno::EPERM)
    }

    /// Returns the entry at directory position `pos` and the next
    /// position, or `None` at the end.
    fn readdir(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        pos: u32,
    ) -> Result<Option<(DirEntry, u32)>> {
        Err(Errno::ENOTDIR)
    }

    /// Copies the symlink target into `buf`, returning its length.
    fn readlink(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, buf: &mut [u8]) -> Result<usize> {
        Err(Errno::EINVAL)
    }

    // ── File operations ─────────────────────────────────────────────

    /// Per-open setup (pipes count their ends here).
    fn open(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, flags: OpenFlags) -> Result<()> {
        Ok(())
    }

    /// Per-close teardown.
    fn release(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, flags: OpenFlags) -> Result<()> {
        Ok(())
    }

    /// Reads from `off` into `buf`; `flags` carries `O_NONBLOCK`.
    fn read(
        &self,
        ctx: &mut FsContext<'_>,
        ino: InodeIdx,
        off: u64,
        buf: &mut [u8],
        flags: OpenFlags,
    ) -> Result<usize> {
        Err(Errno::EINVAL)
    }

    /// Writes `buf` at `off`.
    fn write(
        &self,
        ctx: &mut FsContext<'_>,
        ino: InodeIdx,
        off: u64,
        buf: &[u8],
        flags: OpenFlags,
    ) -> Result<usize> {
        Err(Errno::EINVAL)
    }

    /// Validates a seek to `off`; seekable files accept as-is.
    fn lseek(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, off: u64) -> Result<u64> {
        Ok(off)
    }

    /// Truncates or extends to `size`.
    fn truncate(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, size: u64) -> Result<()> {
        Err(Errno::EPERM)
    }

    /// Maps a file block number to a device block number.
    fn bmap(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, block: u32) -> Result<u32> {
        Err(Errno::ENOSYS)
    }

    /// Polls readiness for `select(2)`; seekable files are always ready.
    fn select(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, for_write: bool) -> Result<bool> {
        Ok(true)
    }

    /// Device-specific control.
    fn ioctl(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, cmd: u32, arg: u32) -> Result<u32> {
        Err(Errno::ENOTTY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A driver implementing nothing: every default must answer with
    /// its documented sentinel instead of dereferencing a null slot.
    struct Hollow;

    impl FsDriver for Hollow {
        fn name(&self) -> &'static str {
            "hollow"
        }
    }

    #[test]
    fn defaults_report_unsupported() {
        use crate::inode::InodeTable;
        use crate::superblock::MountTable;

        let mut inodes = InodeTable::new(8);
        let mut mounts = MountTable::new();
        let mut files = FileTable::new(8);
        let mut buffers = BufferCache::new(4, 1024);
        let mut devices = DeviceTable::new();
        let mut ctx = FsContext {
            inodes: &mut inodes,
            mounts: &mut mounts,
            files: &mut files,
            buffers: &mut buffers,
            devices: &mut devices,
        };

        let h = Hollow;
        let ino = InodeIdx::new(0);
        assert_eq!(
            h.lookup(&mut ctx, ino, "x").unwrap_err(),
            Errno::ENOTDIR,
            "lookup on a non-directory filesystem"
        );
        assert_eq!(h.create(&mut ctx, ino, "x", FileMode::default()).unwrap_err(), Errno::EPERM);
        assert_eq!(h.read(&mut ctx, ino, 0, &mut [], OpenFlags::empty()).unwrap_err(), Errno::EINVAL);
        assert_eq!(h.ioctl(&mut ctx, ino, 0, 0).unwrap_err(), Errno::ENOTTY);
        assert_eq!(h.bmap(&mut ctx, ino, 0).unwrap_err(), Errno::ENOSYS);
        assert_eq!(h.lseek(&mut ctx, ino, 77).unwrap(), 77);
        assert!(h.select(&mut ctx, ino, false).unwrap());
    }
}
