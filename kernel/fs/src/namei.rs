//! Pathname resolution.
//!
//! Walks a path component by component from the caller's root (absolute
//! paths) or working directory, checking search permission on every
//! directory, crossing mount points in both directions, and expanding
//! symbolic links with a nesting cap that turns cycles into `ELOOP`.
//! Every inode handed back carries a reference the caller releases with
//! `iput`.

use baryon_core::{Errno, Result};

use alloc::string::{String, ToString};

use crate::fsops::FsContext;
use crate::inode::{InodeIdx, iget, iput};
use crate::perms::{Access, Cred, check_permission};
use crate::superblock::MountFlags;
use crate::{MAX_SYMLINKS, NAME_MAX, PATH_MAX};

/// Where a walk starts: the process's root and working directory, both
/// already referenced by the process.
#[derive(Debug, Clone, Copy)]
pub struct ResolveBase {
    /// The process root (`/` after boot, changed by `chroot`).
    pub root: InodeIdx,
    /// The working directory.
    pub cwd: InodeIdx,
}

/// Resolves `path` to an inode, following a final symlink when
/// `follow_last` is set.
pub fn namei(
    ctx: &mut FsContext<'_>,
    cred: &Cred,
    base: ResolveBase,
    path: &str,
    follow_last: bool,
) -> Result<InodeIdx> {
    resolve(ctx, cred, base, path, follow_last, 0)
}

/// Resolves everything but the last component, returning the parent
/// directory and the final name for create/unlink flows.
pub fn namei_parent(
    ctx: &mut FsContext<'_>,
    cred: &Cred,
    base: ResolveBase,
    path: &str,
) -> Result<(InodeIdx, String)> {
    check_path(path)?;
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        // The root itself.
        let root = base.root;
        ctx.inodes.grab(root);
        return Ok((root, ".".to_string()));
    }
    let (dir_part, last) = match trimmed.rfind('/') {
        Some(pos) => (&trimmed[..pos], &trimmed[pos + 1..]),
        None => ("", trimmed),
    };
    if last.len() > NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    let dir = if dir_part.is_empty() {
        if path.starts_with('/') {
            let r = base.root;
            ctx.inodes.grab(r);
            r
        } else {
            let c = base.cwd;
            ctx.inodes.grab(c);
            c
        }
    } else {
        resolve(ctx, cred, base, dir_part, true, 0)?
    };
    if !ctx.inodes.get(dir).mode.is_dir() {
        iput(ctx, dir);
        return Err(Errno::ENOTDIR);
    }
    Ok((dir, last.to_string()))
}

fn check_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }
    if path.len() > PATH_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    Ok(())
}

fn resolve(
    ctx: &mut FsContext<'_>,
    cred: &Cred,
    base: ResolveBase,
    path: &str,
    follow_last: bool,
    depth: u32,
) -> Result<InodeIdx> {
    check_path(path)?;
    if depth > MAX_SYMLINKS {
        return Err(Errno::ELOOP);
    }

    let mut dir = if path.starts_with('/') {
        base.root
    } else {
        base.cwd
    };
    ctx.inodes.grab(dir);

    let components: alloc::vec::Vec<&str> =
        path.split('/').filter(|c| !c.is_empty()).collect();

    for (n, &comp) in components.iter().enumerate() {
        let last = n == components.len() - 1;

        if comp.len() > NAME_MAX {
            iput(ctx, dir);
            return Err(Errno::ENAMETOOLONG);
        }
        if !ctx.inodes.get(dir).mode.is_dir() {
            iput(ctx, dir);
            return Err(Errno::ENOTDIR);
        }
        if let Err(e) = dir_search_permission(ctx, cred, dir) {
            iput(ctx, dir);
            return Err(e);
        }

        // A `..` at the root of a mounted filesystem steps back to the
        // directory the filesystem is mounted on.
        if comp == ".." {
            if let Some(under) = mounted_on(ctx, dir) {
                ctx.inodes.grab(under);
                iput(ctx, dir);
                dir = under;
            }
        }

        let sb = ctx.inodes.get(dir).sb.ok_or(Errno::EINVAL)?;
        let driver = ctx.mounts.driver(sb)?;
        let num = match driver.lookup(ctx, dir, comp) {
            Ok(num) => num,
            Err(e) => {
                iput(ctx, dir);
                return Err(e);
            }
        };
        let mut child = match iget(ctx, sb, num) {
            Ok(c) => c,
            Err(e) => {
                iput(ctx, dir);
                return Err(e);
            }
        };

        // Crossing a mount point: continue at the mounted root.
        if let Some(mnt) = ctx.inodes.get(child).mount {
            if let Ok(entry) = ctx.mounts.get(mnt) {
                if let Some(root) = entry.root {
                    ctx.inodes.grab(root);
                    iput(ctx, child);
                    child = root;
                }
            }
        }

        // Symlink expansion, relative to the containing directory.
        if ctx.inodes.get(child).mode.is_lnk() && (!last || follow_last) {
            let target = match read_link(ctx, child) {
                Ok(t) => t,
                Err(e) => {
                    iput(ctx, child);
                    iput(ctx, dir);
                    return Err(e);
                }
            };
            iput(ctx, child);
            let link_base = ResolveBase {
                root: base.root,
                cwd: dir,
            };
            child = match resolve(ctx, cred, link_base, &target, true, depth + 1) {
                Ok(c) => c,
                Err(e) => {
                    iput(ctx, dir);
                    return Err(e);
                }
            };
        }

        iput(ctx, dir);
        dir = child;
    }

    Ok(dir)
}

/// Reads a symlink target into an owned string.
pub fn read_link(ctx: &mut FsContext<'_>, ino: InodeIdx) -> Result<String> {
    let sb = ctx.inodes.get(ino).sb.ok_or(Errno::EINVAL)?;
    let driver = ctx.mounts.driver(sb)?;
    let mut buf = [0u8; PATH_MAX];
    let n = driver.readlink(ctx, ino, &mut buf)?;
    core::str::from_utf8(&buf[..n])
        .map(ToString::to_string)
        .map_err(|_| Errno::EINVAL)
}

/// If `dir` is the root of a mounted filesystem, returns the inode it
/// is mounted on.
fn mounted_on(ctx: &FsContext<'_>, dir: InodeIdx) -> Option<InodeIdx> {
    let sb = ctx.inodes.get(dir).sb?;
    let entry = ctx.mounts.get(sb).ok()?;
    if entry.root == Some(dir) { entry.dir } else { None }
}

fn dir_search_permission(ctx: &FsContext<'_>, cred: &Cred, dir: InodeIdx) -> Result<()> {
    check_permission(ctx.inodes.get(dir), cred, Access::EXEC, false, false)
}

/// True if writes through this inode's mount are refused.
pub fn mount_is_rdonly(ctx: &FsContext<'_>, ino: InodeIdx) -> bool {
    ctx.inodes
        .get(ino)
        .sb
        .and_then(|sb| ctx.mounts.get(sb).ok())
        .is_some_and(|e| e.flags.contains(MountFlags::RDONLY))
}
