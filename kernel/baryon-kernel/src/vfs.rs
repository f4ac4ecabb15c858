//! Kernel-side VFS assembly.
//!
//! Owns the global instances of the five VFS tables, glues them into a
//! [`FsContext`] per operation, and keeps the kernel-wide bits that
//! hang off them: the root and pipefs mounts and the fd-slot resource
//! lock. Initialization takes the root selection from the boot command
//! line — `root=` names the device, `rootfstype=` the filesystem type,
//! `ro` mounts it read-only — registers the root block device when one
//! exists, mounts the root, and kern-mounts pipefs.

use alloc::string::String;

use baryon_core::id::DevId;
use baryon_core::{Errno, Result};
use baryon_fs::buffer::BufferCache;
use baryon_fs::device::{BlockDevice, DeviceTable};
use baryon_fs::file::FileTable;
use baryon_fs::fsops::FsContext;
use baryon_fs::inode::{InodeIdx, InodeTable};
use baryon_fs::namei::ResolveBase;
use baryon_fs::pipefs::PipeFs;
use baryon_fs::ramfs::RamFs;
use baryon_fs::superblock::{MountFlags, MountIdx, MountTable, mount};

use crate::cell::KCell;
use crate::config::{BootOptions, NR_BUFFERS, NR_INODES, NR_OPENS};
use crate::proc::sleep::Resource;

/// The device recorded for a pseudo-filesystem root.
const ROOT_PSEUDO_DEV: DevId = DevId::new(0xfe, 0);

/// The device recorded for the pipefs kern-mount.
const PIPEFS_DEV: DevId = DevId::new(0xfd, 0);

/// How the root filesystem is selected, straight from the boot command
/// line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootConfig {
    /// Device named by `root=` (a pseudo device when the root
    /// filesystem needs none).
    pub dev: DevId,
    /// Filesystem type named by `rootfstype=`.
    pub fstype: String,
    /// `ro`: mount the root read-only.
    pub readonly: bool,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            dev: ROOT_PSEUDO_DEV,
            fstype: String::from("ramfs"),
            readonly: false,
        }
    }
}

impl RootConfig {
    /// Derives the root selection from the parsed boot options,
    /// falling back to an in-memory root when a key is absent.
    #[must_use]
    pub fn from_options(options: &BootOptions) -> Self {
        let dev = options
            .root
            .as_ref()
            .and_then(|name| BootOptions::device_for(name.as_str()))
            .unwrap_or(ROOT_PSEUDO_DEV);
        let fstype = options
            .rootfstype
            .as_ref()
            .map_or("ramfs", |t| t.as_str());
        Self {
            dev,
            fstype: String::from(fstype),
            readonly: options.readonly,
        }
    }
}

/// One BSD advisory lock (`flock(2)`).
#[derive(Debug, Clone, Copy)]
pub struct FlockEntry {
    /// The locked inode.
    pub inode: InodeIdx,
    /// The holder.
    pub pid: baryon_core::id::Pid,
    /// Shared (`LOCK_SH`) rather than exclusive.
    pub shared: bool,
}

/// The assembled VFS state.
pub struct Vfs {
    /// The inode table.
    pub inodes: InodeTable,
    /// Superblocks, the mount ring and registered filesystem types.
    pub mounts: MountTable,
    /// The global open-file table.
    pub files: FileTable,
    /// The buffered block cache.
    pub buffers: BufferCache,
    /// Device tables.
    pub devices: DeviceTable,
    /// Serializes open-file slot allocation.
    pub fd_resource: Resource,
    /// Advisory file locks.
    pub locks: alloc::vec::Vec<FlockEntry>,
    /// The root mount.
    pub root_sb: MountIdx,
    /// The pipefs kern-mount backing `pipe(2)`.
    pub pipefs_sb: MountIdx,
    /// The root filesystem's root inode.
    pub root: InodeIdx,
}

impl core::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vfs").finish_non_exhaustive()
    }
}

impl Vfs {
    /// Builds the VFS: registers the in-core filesystem types and the
    /// root block device (when the root lives on one), mounts the root
    /// per `root_cfg`, and kern-mounts pipefs.
    ///
    /// An unregistered `rootfstype=` fails with `ENODEV` — there is no
    /// system without a root.
    pub fn new(root_cfg: &RootConfig, root_disk: Option<BlockDevice>) -> Result<Self> {
        let mut inodes = InodeTable::new(NR_INODES);
        let mut mounts = MountTable::new();
        let mut files = FileTable::new(NR_OPENS);
        let mut buffers = BufferCache::new(NR_BUFFERS, 1024);
        let mut devices = DeviceTable::new();

        if let Some(disk) = root_disk {
            devices.register_block(disk)?;
        }

        let (root_sb, pipefs_sb, root) = {
            let mut ctx = FsContext {
                inodes: &mut inodes,
                mounts: &mut mounts,
                files: &mut files,
                buffers: &mut buffers,
                devices: &mut devices,
            };
            ctx.mounts.register_fs(RamFs::fstype())?;
            ctx.mounts.register_fs(PipeFs::fstype())?;

            let flags = if root_cfg.readonly {
                MountFlags::RDONLY
            } else {
                MountFlags::empty()
            };
            let root_sb = mount(&mut ctx, &root_cfg.fstype, root_cfg.dev, None, flags)?;
            let pipefs_sb = mount(&mut ctx, "pipefs", PIPEFS_DEV, None, MountFlags::empty())?;
            let root = ctx.mounts.get(root_sb)?.root.ok_or(Errno::EINVAL)?;
            (root_sb, pipefs_sb, root)
        };

        Ok(Self {
            inodes,
            mounts,
            files,
            buffers,
            devices,
            fd_resource: Resource::new(),
            locks: alloc::vec::Vec::new(),
            root_sb,
            pipefs_sb,
            root,
        })
    }

    /// A dispatch context over the tables.
    pub fn ctx(&mut self) -> FsContext<'_> {
        FsContext {
            inodes: &mut self.inodes,
            mounts: &mut self.mounts,
            files: &mut self.files,
            buffers: &mut self.buffers,
            devices: &mut self.devices,
        }
    }
}

/// The global VFS.
static VFS: KCell<Option<Vfs>> = KCell::new(None);

/// Initializes the global VFS with the given root selection. Called
/// once at boot (and per test).
pub fn init(root_cfg: RootConfig, root_disk: Option<BlockDevice>) -> Result<()> {
    let vfs = Vfs::new(&root_cfg, root_disk)?;
    VFS.with(|v| *v = Some(vfs));
    Ok(())
}

/// Tears the global VFS down (kexec, tests).
pub fn teardown() {
    VFS.with(|v| *v = None);
}

/// Runs `f` with the global VFS.
///
/// # Panics
///
/// Panics if the VFS has not been initialized.
pub fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
    VFS.with(|v| f(v.as_mut().expect("VFS not initialized")))
}

/// The resolve base for a process, defaulting to the filesystem root
/// when the process has not set its own.
#[must_use]
pub fn base_for(root: Option<InodeIdx>, cwd: Option<InodeIdx>, fs_root: InodeIdx) -> ResolveBase {
    ResolveBase {
        root: root.unwrap_or(fs_root),
        cwd: cwd.unwrap_or(fs_root),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use baryon_fs::device::MinorMap;
    use baryon_fs::ramdisk::RamDisk;

    #[test]
    fn default_config_mounts_a_writable_ramfs_root() {
        let v = Vfs::new(&RootConfig::default(), None).unwrap();
        let entry = v.mounts.get(v.root_sb).unwrap();
        assert_eq!(entry.dev, ROOT_PSEUDO_DEV);
        assert!(!entry.flags.contains(MountFlags::RDONLY));
        assert_eq!(entry.root, Some(v.root));
        assert!(v.inodes.get(v.root).mode.is_dir());
    }

    #[test]
    fn ro_flag_reaches_the_root_mount() {
        let cfg = RootConfig {
            readonly: true,
            ..RootConfig::default()
        };
        let v = Vfs::new(&cfg, None).unwrap();
        assert!(
            v.mounts
                .get(v.root_sb)
                .unwrap()
                .flags
                .contains(MountFlags::RDONLY),
            "`ro` must make the root mount read-only"
        );
    }

    #[test]
    fn unknown_rootfstype_refuses_to_boot() {
        let cfg = RootConfig {
            fstype: String::from("ext2"),
            ..RootConfig::default()
        };
        assert_eq!(Vfs::new(&cfg, None).unwrap_err(), Errno::ENODEV);
    }

    #[test]
    fn cmdline_selection_names_device_type_and_mode() {
        let (options, unknown) = BootOptions::parse("root=/dev/ram0 rootfstype=ramfs ro");
        assert_eq!(unknown, 0);
        let cfg = RootConfig::from_options(&options);
        assert_eq!(cfg.dev, DevId::new(1, 0));
        assert_eq!(cfg.fstype, "ramfs");
        assert!(cfg.readonly);

        // The selected device is registered and recorded on the mount.
        let mut minors = MinorMap::default();
        minors.set(0);
        let disk = BlockDevice {
            name: "ramdisk",
            major: 1,
            minors,
            blksize: 1024,
            driver: alloc::sync::Arc::new(RamDisk::new(64 * 1024, 1024)),
            queue: baryon_fs::blkqueue::RequestQueue::new(),
        };
        let v = Vfs::new(&cfg, Some(disk)).unwrap();
        let entry = v.mounts.get(v.root_sb).unwrap();
        assert_eq!(entry.dev, DevId::new(1, 0));
        assert!(entry.flags.contains(MountFlags::RDONLY));
        assert!(v.devices.block_dev(DevId::new(1, 0)).is_ok());
    }

    #[test]
    fn absent_keys_fall_back_to_the_in_memory_root() {
        let (options, _) = BootOptions::parse("console=/dev/ttyS0");
        let cfg = RootConfig::from_options(&options);
        assert_eq!(cfg, RootConfig::default());
    }
}
