//! In-memory filesystem.
//!
//! A tree of nodes held entirely in kernel memory: regular files are
//! byte vectors, directories are name→node maps, symlinks hold their
//! target string. No on-disk format exists — the driver implements the
//! operation table directly, which makes it both the boot root
//! filesystem and the substrate the VFS tests run on.

use baryon_core::id::DevId;
use baryon_core::sync::SpinLock;
use baryon_core::{Errno, Result};

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::file::OpenFlags;
use crate::fsops::{DirEntry, FsContext, FsDriver, FsFlags, FsType, StatFs};
use crate::inode::{InodeIdx, iget};
use crate::mode::{FileMode, S_IFDIR, S_IFLNK, S_IFREG};
use crate::superblock::MountIdx;

/// Root inode number.
const ROOT_INO: u32 = 1;

/// Magic reported by `statfs`.
const RAMFS_MAGIC: u32 = 0x858458f6;

enum NodeKind {
    File(Vec<u8>),
    Dir(Vec<(String, u32)>),
    Symlink(String),
    Special(DevId),
}

struct Node {
    mode: FileMode,
    uid: u16,
    gid: u16,
    nlink: u16,
    kind: NodeKind,
}

impl Node {
    fn size(&self) -> u64 {
        match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Dir(entries) => entries.len() as u64,
            NodeKind::Symlink(t) => t.len() as u64,
            NodeKind::Special(_) => 0,
        }
    }

    fn dir(&self) -> Result<&Vec<(String, u32)>> {
        match &self.kind {
            NodeKind::Dir(e) => Ok(e),
            _ => Err(Errno::ENOTDIR),
        }
    }

    fn dir_mut(&mut self) -> Result<&mut Vec<(String, u32)>> {
        match &mut self.kind {
            NodeKind::Dir(e) => Ok(e),
            _ => Err(Errno::ENOTDIR),
        }
    }
}

/// One mounted in-memory volume.
pub struct RamFs {
    nodes: SpinLock<Vec<Option<Node>>>,
}

impl RamFs {
    fn new() -> Self {
        Self {
            nodes: SpinLock::new(Vec::new()),
        }
    }

    /// The registration record.
    #[must_use]
    pub fn fstype() -> FsType {
        FsType {
            name: "ramfs",
            flags: FsFlags::KERN_MOUNT,
            create: || Ok(Arc::new(RamFs::new())),
        }
    }

    fn alloc_node(&self, node: Node) -> u32 {
        let mut nodes = self.nodes.lock();
        for (i, slot) in nodes.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(node);
                return (i + 1) as u32;
            }
        }
        nodes.push(Some(node));
        nodes.len() as u32
    }

    fn with_node<R>(&self, num: u32, f: impl FnOnce(&Node) -> Result<R>) -> Result<R> {
        let nodes = self.nodes.lock();
        let node = nodes
            .get(num.wrapping_sub(1) as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Errno::ENOENT)?;
        f(node)
    }

    fn with_node_mut<R>(&self, num: u32, f: impl FnOnce(&mut Node) -> Result<R>) -> Result<R> {
        let mut nodes = self.nodes.lock();
        let node = nodes
            .get_mut(num.wrapping_sub(1) as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Errno::ENOENT)?;
        f(node)
    }

    fn drop_node(&self, num: u32) {
        let mut nodes = self.nodes.lock();
        if let Some(slot) = nodes.get_mut(num.wrapping_sub(1) as usize) {
            *slot = None;
        }
    }

    fn insert_child(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        node: Node,
    ) -> Result<u32> {
        if name.is_empty() || name == "." || name == ".." {
            return Err(Errno::EEXIST);
        }
        let dnum = ctx.inodes.get(dir).num;
        let is_dir = matches!(node.kind, NodeKind::Dir(_));
        let num = self.alloc_node(node);
        let res = self.with_node_mut(dnum, |d| {
            let entries = d.dir_mut()?;
            if entries.iter().any(|(n, _)| n == name) {
                return Err(Errno::EEXIST);
            }
            entries.push((name.to_string(), num));
            if is_dir {
                d.nlink += 1;
            }
            Ok(())
        });
        if let Err(e) = res {
            self.drop_node(num);
            return Err(e);
        }
        let size = self.with_node(dnum, |d| Ok(d.size()))?;
        let di = ctx.inodes.get_mut(dir);
        di.size = size;
        if is_dir {
            di.nlink += 1;
        }
        Ok(num)
    }
}

impl FsDriver for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn read_superblock(&self, ctx: &mut FsContext<'_>, sb: MountIdx) -> Result<()> {
        {
            let mut nodes = self.nodes.lock();
            if nodes.is_empty() {
                nodes.push(Some(Node {
                    mode: FileMode::new(S_IFDIR, 0o755),
                    uid: 0,
                    gid: 0,
                    nlink: 2,
                    kind: NodeKind::Dir(Vec::new()),
                }));
            }
        }
        let root = iget(ctx, sb, ROOT_INO)?;
        ctx.mounts.get_mut(sb)?.root = Some(root);
        Ok(())
    }

    fn statfs(&self, _ctx: &mut FsContext<'_>, _sb: MountIdx) -> Result<StatFs> {
        let nodes = self.nodes.lock();
        let files = nodes.iter().flatten().count() as u32;
        Ok(StatFs {
            fs_type: RAMFS_MAGIC,
            bsize: 4096,
            files,
            namelen: crate::NAME_MAX as u32,
            ..StatFs::default()
        })
    }

    fn read_inode(&self, ctx: &mut FsContext<'_>, ino: InodeIdx) -> Result<()> {
        let num = ctx.inodes.get(ino).num;
        let (mode, uid, gid, nlink, size, rdev) = self.with_node(num, |n| {
            let rdev = match n.kind {
                NodeKind::Special(d) => d,
                _ => DevId::NONE,
            };
            Ok((n.mode, n.uid, n.gid, n.nlink, n.size(), rdev))
        })?;
        let i = ctx.inodes.get_mut(ino);
        i.mode = mode;
        i.uid = uid;
        i.gid = gid;
        i.nlink = nlink;
        i.size = size;
        i.rdev = rdev;
        Ok(())
    }

    fn ifree(&self, ctx: &mut FsContext<'_>, ino: InodeIdx) -> Result<()> {
        self.drop_node(ctx.inodes.get(ino).num);
        Ok(())
    }

    fn lookup(&self, ctx: &mut FsContext<'_>, dir: InodeIdx, name: &str) -> Result<u32> {
        let dnum = ctx.inodes.get(dir).num;
        if name == "." {
            return Ok(dnum);
        }
        if name == ".." {
            // The root's parent is itself; deeper parents are found by
            // scanning for the directory that lists us.
            if dnum == ROOT_INO {
                return Ok(ROOT_INO);
            }
            let nodes = self.nodes.lock();
            for (i, slot) in nodes.iter().enumerate() {
                if let Some(Node { kind: NodeKind::Dir(entries), .. }) = slot {
                    if entries.iter().any(|(_, n)| *n == dnum) {
                        return Ok((i + 1) as u32);
                    }
                }
            }
            return Ok(ROOT_INO);
        }
        self.with_node(dnum, |d| {
            d.dir()?
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, num)| *num)
                .ok_or(Errno::ENOENT)
        })
    }

    fn create(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        mode: FileMode,
    ) -> Result<u32> {
        self.insert_child(
            ctx,
            dir,
            name,
            Node {
                mode: FileMode::new(S_IFREG, mode.perms()),
                uid: 0,
                gid: 0,
                nlink: 1,
                kind: NodeKind::File(Vec::new()),
            },
        )
    }

    fn mknod(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        mode: FileMode,
        rdev: DevId,
    ) -> Result<u32> {
        self.insert_child(
            ctx,
            dir,
            name,
            Node {
                mode,
                uid: 0,
                gid: 0,
                nlink: 1,
                kind: NodeKind::Special(rdev),
            },
        )
    }

    fn mkdir(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        mode: FileMode,
    ) -> Result<u32> {
        self.insert_child(
            ctx,
            dir,
            name,
            Node {
                mode: FileMode::new(S_IFDIR, mode.perms()),
                uid: 0,
                gid: 0,
                nlink: 2,
                kind: NodeKind::Dir(Vec::new()),
            },
        )
    }

    fn rmdir(&self, ctx: &mut FsContext<'_>, dir: InodeIdx, name: &str) -> Result<()> {
        let dnum = ctx.inodes.get(dir).num;
        let victim = self.lookup(ctx, dir, name)?;
        self.with_node(victim, |n| {
            if !n.mode.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            if !n.dir()?.is_empty() {
                return Err(Errno::ENOTEMPTY);
            }
            Ok(())
        })?;
        self.with_node_mut(dnum, |d| {
            let entries = d.dir_mut()?;
            entries.retain(|(n, _)| n != name);
            d.nlink -= 1;
            Ok(())
        })?;
        self.drop_node(victim);
        let dev = ctx.inodes.get(dir).dev;
        if let Some(ci) = ctx.inodes.find(dev, victim) {
            if ctx.inodes.get(ci).count == 0 {
                ctx.inodes.evict(ci);
            } else {
                ctx.inodes.get_mut(ci).nlink = 0;
            }
        }
        let size = self.with_node(dnum, |d| Ok(d.size()))?;
        let di = ctx.inodes.get_mut(dir);
        di.size = size;
        di.nlink -= 1;
        Ok(())
    }

    fn unlink(&self, ctx: &mut FsContext<'_>, dir: InodeIdx, name: &str) -> Result<()> {
        let dnum = ctx.inodes.get(dir).num;
        let victim = self.lookup(ctx, dir, name)?;
        let gone = self.with_node_mut(victim, |n| {
            if n.mode.is_dir() {
                return Err(Errno::EISDIR);
            }
            n.nlink -= 1;
            Ok(n.nlink == 0)
        })?;
        self.with_node_mut(dnum, |d| {
            d.dir_mut()?.retain(|(n, _)| n != name);
            Ok(())
        })?;
        let dev = ctx.inodes.get(dir).dev;
        if let Some(ci) = ctx.inodes.find(dev, victim) {
            if ctx.inodes.get(ci).count == 0 {
                ctx.inodes.evict(ci);
                if gone {
                    self.drop_node(victim);
                }
            } else {
                // A live holder keeps the data; `iput` frees the node
                // when the last reference goes away.
                let cached = ctx.inodes.get_mut(ci);
                cached.nlink = cached.nlink.saturating_sub(1);
            }
        } else if gone {
            self.drop_node(victim);
        }
        let size = self.with_node(dnum, |d| Ok(d.size()))?;
        ctx.inodes.get_mut(dir).size = size;
        Ok(())
    }

    fn link(
        &self,
        ctx: &mut FsContext<'_>,
        target: InodeIdx,
        dir: InodeIdx,
        name: &str,
    ) -> Result<()> {
        let tnum = ctx.inodes.get(target).num;
        if ctx.inodes.get(target).mode.is_dir() {
            return Err(Errno::EPERM);
        }
        let dnum = ctx.inodes.get(dir).num;
        self.with_node_mut(dnum, |d| {
            let entries = d.dir_mut()?;
            if entries.iter().any(|(n, _)| n == name) {
                return Err(Errno::EEXIST);
            }
            entries.push((name.to_string(), tnum));
            Ok(())
        })?;
        self.with_node_mut(tnum, |n| {
            n.nlink += 1;
            Ok(())
        })?;
        ctx.inodes.get_mut(target).nlink += 1;
        Ok(())
    }

    fn symlink(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        name: &str,
        target_path: &str,
    ) -> Result<u32> {
        self.insert_child(
            ctx,
            dir,
            name,
            Node {
                mode: FileMode::new(S_IFLNK, 0o777),
                uid: 0,
                gid: 0,
                nlink: 1,
                kind: NodeKind::Symlink(target_path.to_string()),
            },
        )
    }

    fn rename(
        &self,
        ctx: &mut FsContext<'_>,
        old_dir: InodeIdx,
        old_name: &str,
        new_dir: InodeIdx,
        new_name: &str,
    ) -> Result<()> {
        let moved = self.lookup(ctx, old_dir, old_name)?;
        let old_dnum = ctx.inodes.get(old_dir).num;
        let new_dnum = ctx.inodes.get(new_dir).num;
        // Replace silently if the target name exists (non-directory).
        let existing = self.lookup(ctx, new_dir, new_name).ok();
        if let Some(e) = existing {
            self.with_node(e, |n| if n.mode.is_dir() { Err(Errno::EISDIR) } else { Ok(()) })?;
            self.unlink(ctx, new_dir, new_name)?;
        }
        self.with_node_mut(old_dnum, |d| {
            d.dir_mut()?.retain(|(n, _)| n != old_name);
            Ok(())
        })?;
        self.with_node_mut(new_dnum, |d| {
            d.dir_mut()?.push((new_name.to_string(), moved));
            Ok(())
        })?;
        Ok(())
    }

    fn readdir(
        &self,
        ctx: &mut FsContext<'_>,
        dir: InodeIdx,
        pos: u32,
    ) -> Result<Option<(DirEntry, u32)>> {
        let dnum = ctx.inodes.get(dir).num;
        match pos {
            0 => Ok(Some((DirEntry { ino: dnum, name: ".".to_string() }, 1))),
            1 => {
                let parent = self.lookup(ctx, dir, "..")?;
                Ok(Some((DirEntry { ino: parent, name: "..".to_string() }, 2)))
            }
            n => self.with_node(dnum, |d| {
                let entries = d.dir()?;
                let i = (n - 2) as usize;
                Ok(entries.get(i).map(|(name, num)| {
                    (DirEntry { ino: *num, name: name.clone() }, n + 1)
                }))
            }),
        }
    }

    fn readlink(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, buf: &mut [u8]) -> Result<usize> {
        let num = ctx.inodes.get(ino).num;
        self.with_node(num, |n| match &n.kind {
            NodeKind::Symlink(t) => {
                let len = t.len().min(buf.len());
                buf[..len].copy_from_slice(&t.as_bytes()[..len]);
                Ok(len)
            }
            _ => Err(Errno::EINVAL),
        })
    }

    fn read(
        &self,
        ctx: &mut FsContext<'_>,
        ino: InodeIdx,
        off: u64,
        buf: &mut [u8],
        _flags: OpenFlags,
    ) -> Result<usize> {
        let num = ctx.inodes.get(ino).num;
        self.with_node(num, |n| match &n.kind {
            NodeKind::File(data) => {
                let off = off as usize;
                if off >= data.len() {
                    return Ok(0);
                }
                let len = buf.len().min(data.len() - off);
                buf[..len].copy_from_slice(&data[off..off + len]);
                Ok(len)
            }
            NodeKind::Dir(_) => Err(Errno::EISDIR),
            _ => Err(Errno::EINVAL),
        })
    }

    fn write(
        &self,
        ctx: &mut FsContext<'_>,
        ino: InodeIdx,
        off: u64,
        buf: &[u8],
        _flags: OpenFlags,
    ) -> Result<usize> {
        let num = ctx.inodes.get(ino).num;
        let new_size = self.with_node_mut(num, |n| match &mut n.kind {
            NodeKind::File(data) => {
                let off = off as usize;
                if data.len() < off + buf.len() {
                    data.resize(off + buf.len(), 0);
                }
                data[off..off + buf.len()].copy_from_slice(buf);
                Ok(data.len() as u64)
            }
            NodeKind::Dir(_) => Err(Errno::EISDIR),
            _ => Err(Errno::EINVAL),
        })?;
        let i = ctx.inodes.get_mut(ino);
        i.size = new_size;
        Ok(buf.len())
    }

    fn truncate(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, size: u64) -> Result<()> {
        let num = ctx.inodes.get(ino).num;
        self.with_node_mut(num, |n| match &mut n.kind {
            NodeKind::File(data) => {
                data.resize(size as usize, 0);
                Ok(())
            }
            _ => Err(Errno::EINVAL),
        })?;
        ctx.inodes.get_mut(ino).size = size;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::buffer::BufferCache;
    use crate::device::DeviceTable;
    use crate::file::FileTable;
    use crate::inode::{InodeTable, iput};
    use crate::namei::{ResolveBase, namei, namei_parent};
    use crate::perms::Cred;
    use crate::superblock::{MountFlags, MountTable, mount};

    /// A fully-initialized VFS over one ramfs root, shared by the
    /// namei/permission tests.
    pub(crate) struct Harness {
        pub inodes: InodeTable,
        pub mounts: MountTable,
        pub files: FileTable,
        pub buffers: BufferCache,
        pub devices: DeviceTable,
        pub root: InodeIdx,
    }

    impl Harness {
        pub fn new() -> Self {
            let mut h = Self {
                inodes: InodeTable::new(32),
                mounts: MountTable::new(),
                files: FileTable::new(16),
                buffers: BufferCache::new(4, 1024),
                devices: DeviceTable::new(),
                root: InodeIdx::new(0),
            };
            let mut ctx = h.ctx_parts();
            ctx.mounts.register_fs(RamFs::fstype()).unwrap();
            let sb = mount(
                &mut ctx,
                "ramfs",
                DevId::new(0xfe, 0),
                None,
                MountFlags::empty(),
            )
            .unwrap();
            let root = ctx.mounts.get(sb).unwrap().root.unwrap();
            h.root = root;
            h
        }

        pub fn ctx_parts(&mut self) -> FsContext<'_> {
            FsContext {
                inodes: &mut self.inodes,
                mounts: &mut self.mounts,
                files: &mut self.files,
                buffers: &mut self.buffers,
                devices: &mut self.devices,
            }
        }

        pub fn base(&self) -> ResolveBase {
            ResolveBase {
                root: self.root,
                cwd: self.root,
            }
        }

        /// Creates a file at an absolute path, parents included.
        pub fn create_file(&mut self, path: &str, contents: &[u8]) -> InodeIdx {
            let base = self.base();
            let cred = Cred::root();
            let mut ctx = self.ctx_parts();
            let (dir, name) = namei_parent(&mut ctx, &cred, base, path).unwrap();
            let sb = ctx.inodes.get(dir).sb.unwrap();
            let driver = ctx.mounts.driver(sb).unwrap();
            let num = driver
                .create(&mut ctx, dir, &name, FileMode::new(S_IFREG, 0o644))
                .unwrap();
            let ino = iget(&mut ctx, sb, num).unwrap();
            if !contents.is_empty() {
                driver
                    .write(&mut ctx, ino, 0, contents, OpenFlags::empty())
                    .unwrap();
            }
            iput(&mut ctx, dir);
            ino
        }

        pub fn mkdir(&mut self, path: &str) {
            let base = self.base();
            let cred = Cred::root();
            let mut ctx = self.ctx_parts();
            let (dir, name) = namei_parent(&mut ctx, &cred, base, path).unwrap();
            let sb = ctx.inodes.get(dir).sb.unwrap();
            let driver = ctx.mounts.driver(sb).unwrap();
            driver
                .mkdir(&mut ctx, dir, &name, FileMode::new(S_IFDIR, 0o755))
                .unwrap();
            iput(&mut ctx, dir);
        }

        pub fn symlink(&mut self, path: &str, target: &str) {
            let base = self.base();
            let cred = Cred::root();
            let mut ctx = self.ctx_parts();
            let (dir, name) = namei_parent(&mut ctx, &cred, base, path).unwrap();
            let sb = ctx.inodes.get(dir).sb.unwrap();
            let driver = ctx.mounts.driver(sb).unwrap();
            driver.symlink(&mut ctx, dir, &name, target).unwrap();
            iput(&mut ctx, dir);
        }
    }

    #[test]
    fn lookup_walks_the_tree() {
        let mut h = Harness::new();
        h.mkdir("/etc");
        let created = h.create_file("/etc/passwd", b"root:x:0:0\n");
        let base = h.base();
        let cred = Cred::root();
        let mut ctx = h.ctx_parts();
        let found = namei(&mut ctx, &cred, base, "/etc/passwd", true).unwrap();
        assert_eq!(found, created, "same cached inode slot");
        let mut buf = [0u8; 32];
        let sb = ctx.inodes.get(found).sb.unwrap();
        let driver = ctx.mounts.driver(sb).unwrap();
        let n = driver
            .read(&mut ctx, found, 0, &mut buf, OpenFlags::empty())
            .unwrap();
        assert_eq!(&buf[..n], b"root:x:0:0\n");
    }

    #[test]
    fn missing_component_is_enoent() {
        let mut h = Harness::new();
        h.mkdir("/etc");
        let base = h.base();
        let cred = Cred::root();
        let mut ctx = h.ctx_parts();
        assert_eq!(
            namei(&mut ctx, &cred, base, "/etc/shadow", true).unwrap_err(),
            Errno::ENOENT
        );
        assert_eq!(
            namei(&mut ctx, &cred, base, "/usr/bin/cc", true).unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn file_component_in_the_middle_is_enotdir() {
        let mut h = Harness::new();
        h.create_file("/data", b"x");
        let base = h.base();
        let cred = Cred::root();
        let mut ctx = h.ctx_parts();
        assert_eq!(
            namei(&mut ctx, &cred, base, "/data/inner", true).unwrap_err(),
            Errno::ENOTDIR
        );
    }

    #[test]
    fn symlinks_follow_and_cycle_to_eloop() {
        let mut h = Harness::new();
        h.mkdir("/etc");
        let target = h.create_file("/etc/passwd", b"x");
        h.symlink("/link", "/etc/passwd");
        let base = h.base();
        let cred = Cred::root();
        {
            let mut ctx = h.ctx_parts();
            let via_link = namei(&mut ctx, &cred, base, "/link", true).unwrap();
            assert_eq!(via_link, target);

            // Unfollowed, the link itself comes back.
            let raw = namei(&mut ctx, &cred, base, "/link", false).unwrap();
            assert!(ctx.inodes.get(raw).mode.is_lnk());
        }

        h.symlink("/a", "/b");
        h.symlink("/b", "/a");
        let mut ctx = h.ctx_parts();
        assert_eq!(
            namei(&mut ctx, &cred, base, "/a", true).unwrap_err(),
            Errno::ELOOP
        );
    }

    #[test]
    fn relative_symlink_resolves_from_its_directory() {
        let mut h = Harness::new();
        h.mkdir("/usr");
        let real = h.create_file("/usr/lib.so", b"elf");
        h.symlink("/usr/lib-link", "lib.so");
        let base = h.base();
        let cred = Cred::root();
        let mut ctx = h.ctx_parts();
        let via = namei(&mut ctx, &cred, base, "/usr/lib-link", true).unwrap();
        assert_eq!(via, real);
    }

    #[test]
    fn dotdot_at_root_stays_at_root() {
        let mut h = Harness::new();
        h.mkdir("/etc");
        let base = h.base();
        let cred = Cred::root();
        let mut ctx = h.ctx_parts();
        let r = namei(&mut ctx, &cred, base, "/..", true).unwrap();
        assert_eq!(r, base.root);
        let r2 = namei(&mut ctx, &cred, base, "/etc/../etc/..", true).unwrap();
        assert_eq!(r2, base.root);
    }

    #[test]
    fn search_permission_enforced_per_component() {
        let mut h = Harness::new();
        h.mkdir("/secret");
        h.create_file("/secret/key", b"k");
        // Drop exec for others on /secret.
        let base = h.base();
        let cred_root = Cred::root();
        let mut ctx = h.ctx_parts();
        let dir = namei(&mut ctx, &cred_root, base, "/secret", true).unwrap();
        ctx.inodes.get_mut(dir).mode = FileMode::new(S_IFDIR, 0o700);
        ctx.inodes.get_mut(dir).uid = 0;
        iput(&mut ctx, dir);

        let user = Cred {
            uid: 1000,
            euid: 1000,
            gid: 1000,
            egid: 1000,
            groups: [0; crate::perms::NGROUPS_MAX],
            ngroups: 0,
        };
        assert_eq!(
            namei(&mut ctx, &user, base, "/secret/key", true).unwrap_err(),
            Errno::EACCES
        );
    }

    #[test]
    fn unlink_and_rmdir_behaviors() {
        let mut h = Harness::new();
        h.mkdir("/d");
        h.create_file("/d/f", b"1");
        let base = h.base();
        let cred = Cred::root();
        let mut ctx = h.ctx_parts();

        let d = namei(&mut ctx, &cred, base, "/d", true).unwrap();
        let sb = ctx.inodes.get(d).sb.unwrap();
        let driver = ctx.mounts.driver(sb).unwrap();

        // Non-empty directory refuses rmdir.
        let root = base.root;
        assert_eq!(
            driver.rmdir(&mut ctx, root, "d").unwrap_err(),
            Errno::ENOTEMPTY
        );
        // Unlinking a directory with unlink is EISDIR.
        assert_eq!(driver.unlink(&mut ctx, root, "d").unwrap_err(), Errno::EISDIR);

        driver.unlink(&mut ctx, d, "f").unwrap();
        assert_eq!(
            namei(&mut ctx, &cred, base, "/d/f", true).unwrap_err(),
            Errno::ENOENT
        );
        iput(&mut ctx, d);
        driver.rmdir(&mut ctx, root, "d").unwrap();
        assert_eq!(
            namei(&mut ctx, &cred, base, "/d", true).unwrap_err(),
            Errno::ENOENT
        );
    }

    #[test]
    fn mounting_another_volume_crosses_over_and_back() {
        let mut h = Harness::new();
        h.mkdir("/mnt");
        h.create_file("/marker-on-root", b"r");
        let base = h.base();
        let cred = Cred::root();
        let mut ctx = h.ctx_parts();

        // Graft a second ramfs on /mnt.
        let at = namei(&mut ctx, &cred, base, "/mnt", true).unwrap();
        let sb2 = mount(
            &mut ctx,
            "ramfs",
            DevId::new(0xfe, 1),
            Some(at),
            MountFlags::empty(),
        )
        .unwrap();
        let inner_root = ctx.mounts.get(sb2).unwrap().root.unwrap();

        // Create a file inside the mounted volume through namei.
        let (dir, name) = namei_parent(&mut ctx, &cred, base, "/mnt/inside").unwrap();
        assert_eq!(dir, inner_root, "resolution must land in the new volume");
        let d2 = ctx.mounts.driver(sb2).unwrap();
        d2.create(&mut ctx, dir, &name, FileMode::new(S_IFREG, 0o644))
            .unwrap();
        iput(&mut ctx, dir);

        let f = namei(&mut ctx, &cred, base, "/mnt/inside", true).unwrap();
        assert_eq!(ctx.inodes.get(f).sb, Some(sb2));
        iput(&mut ctx, f);

        // `..` from the mounted root lands back on the outer tree.
        let back = namei(&mut ctx, &cred, base, "/mnt/../marker-on-root", true).unwrap();
        assert!(ctx.inodes.get(back).mode.is_reg());
        assert_ne!(ctx.inodes.get(back).sb, Some(sb2));
    }

    #[test]
    fn rename_moves_between_directories() {
        let mut h = Harness::new();
        h.mkdir("/a");
        h.mkdir("/b");
        h.create_file("/a/x", b"payload");
        let base = h.base();
        let cred = Cred::root();
        let mut ctx = h.ctx_parts();
        let a = namei(&mut ctx, &cred, base, "/a", true).unwrap();
        let b = namei(&mut ctx, &cred, base, "/b", true).unwrap();
        let sb = ctx.inodes.get(a).sb.unwrap();
        let driver = ctx.mounts.driver(sb).unwrap();
        driver.rename(&mut ctx, a, "x", b, "y").unwrap();
        assert_eq!(
            namei(&mut ctx, &cred, base, "/a/x", true).unwrap_err(),
            Errno::ENOENT
        );
        let moved = namei(&mut ctx, &cred, base, "/b/y", true).unwrap();
        assert!(ctx.inodes.get(moved).mode.is_reg());
    }
}
