//! The Baryon virtual filesystem layer.
//!
//! Concrete filesystems plug into three tables the VFS owns: the inode
//! table (hashed by device and inode number), the superblock/mount
//! table, and the global open-file table. Below them sit the buffered
//! block cache and the per-device request queues; above them,
//! [`namei`] turns pathnames into inodes.
//!
//! A mounted filesystem is driven through the [`FsDriver`] trait — the
//! classic table of ~35 nullable operations expressed as default
//! methods that report "unsupported", so concrete filesystems opt in
//! operation by operation. Two in-core filesystems ship with the VFS:
//! [`pipefs`] backing anonymous pipes and [`ramfs`], an in-memory tree
//! used as the boot root and as the test substrate.
//!
//! The crate blocks through the [`wait`] seam instead of depending on
//! the process crate, so the whole layer builds and tests on the host
//! with synchronous drivers.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod blkqueue;
pub mod buffer;
pub mod device;
pub mod file;
pub mod fsops;
pub mod inode;
pub mod mode;
pub mod namei;
pub mod perms;
pub mod pipefs;
pub mod ramdisk;
pub mod ramfs;
pub mod superblock;
pub mod wait;

pub use fsops::{DirEntry, FsContext, FsDriver, FsFlags, FsType, StatFs};
pub use inode::{InodeFlags, InodeIdx, InodeTable};
pub use mode::FileMode;

/// Bytes that can be written to a pipe atomically.
pub const PIPE_BUF: usize = 4096;

/// Nested symlink expansions allowed before `ELOOP`.
pub const MAX_SYMLINKS: u32 = 8;

/// Longest single pathname component.
pub const NAME_MAX: usize = 255;

/// Longest pathname.
pub const PATH_MAX: usize = 1024;
