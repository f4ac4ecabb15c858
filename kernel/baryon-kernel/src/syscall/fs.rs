//! File and filesystem syscalls.
//!
//! Handlers snapshot what they need from the process table, run the
//! VFS operation, then write results back — the process table is never
//! held across a potential sleep. Blocking I/O (pipes, fifos) is
//! driven from here: the driver is always called non-blocking and the
//! retry sleep happens at this layer, on the object's wait channel.

use alloc::string::String;
use alloc::sync::Arc;

use baryon_core::id::DevId;
use baryon_core::{Errno, Result};
use baryon_fs::file::{FileIdx, OpenFlags};
use baryon_fs::fsops::FsDriver;
use baryon_fs::inode::{InodeIdx, iget, iput};
use baryon_fs::mode::{FileMode, S_IFBLK, S_IFCHR, S_IFDIR, S_IFREG};
use baryon_fs::namei::{ResolveBase, mount_is_rdonly, namei, namei_parent, read_link};
use baryon_fs::perms::{Access, Cred, check_permission};
use baryon_fs::pipefs::{PipeFs, create_pipe};
use baryon_fs::superblock::{MountFlags, mount as do_mount, umount as do_umount};
use baryon_fs::PATH_MAX;

use crate::config::OPEN_MAX;
use crate::proc::sleep::{SleepKind, lock_resource, sleep, unlock_resource};
use crate::proc::{ProcFlags, with_proc};
use crate::signal::{SIGPIPE, send_sig};
use crate::syscall::ret;
use crate::syscall::userptr::{copy_from_user, copy_to_user, string_from_user};
use crate::vfs::{Vfs, base_for, with_vfs};

/// What a handler needs to know about its caller.
struct Caller {
    cred: Cred,
    base: ResolveBase,
    umask: u16,
    use_real: bool,
}

fn caller() -> Caller {
    let (cred, root, cwd, umask, use_real) = with_proc(|t| {
        let p = t.current();
        (
            p.cred,
            p.root,
            p.cwd,
            p.umask,
            p.flags.contains(ProcFlags::USEREAL),
        )
    });
    let base = with_vfs(|v| base_for(root, cwd, v.root));
    Caller {
        cred,
        base,
        umask,
        use_real,
    }
}

fn user_path(addr: usize) -> Result<String> {
    // Path strings are validated against the caller's vmas by the copy
    // layer on the target.
    with_proc(|t| {
        let vmas = &t.current().vmas;
        string_from_user(vmas, addr, PATH_MAX)
    })
}

/// Maps a user fd to its open-file slot.
fn fd_file(fd: usize) -> Result<FileIdx> {
    with_proc(|t| {
        if fd >= OPEN_MAX {
            return Err(Errno::EBADF);
        }
        let f = t.current().fd[fd];
        if f.is_none() { Err(Errno::EBADF) } else { Ok(f) }
    })
}

/// Installs an open-file slot at the lowest free user fd at or above
/// `from`.
fn install_fd(file: FileIdx, from: usize) -> Result<usize> {
    with_proc(|t| {
        let p = t.current_mut();
        for fd in from..OPEN_MAX {
            if p.fd[fd].is_none() {
                p.fd[fd] = file;
                p.cloexec.set(fd, false);
                return Ok(fd);
            }
        }
        Err(Errno::EMFILE)
    })
}

/// The operation table that drives an inode: its filesystem's, or the
/// character device's when the inode is a character special file.
fn driver_for(v: &mut Vfs, ino: InodeIdx) -> Result<Arc<dyn FsDriver>> {
    let (mode, rdev, sb) = {
        let i = v.inodes.get(ino);
        (i.mode, i.rdev, i.sb)
    };
    if mode.is_chr() {
        return Ok(Arc::clone(&v.devices.char_dev(rdev)?.ops));
    }
    v.mounts.driver(sb.ok_or(Errno::EINVAL)?)
}

/// Allocates a global open-file slot under the fd resource lock and
/// binds it to a user fd.
fn open_file_slot(ino: InodeIdx, flags: OpenFlags) -> Result<usize> {
    let file = with_proc(|t| {
        with_vfs(|v| {
            lock_resource(t, &mut v.fd_resource, baryon_fs::wait::CHANNEL_FILE_TABLE);
            let r = v.files.get_new_fd(ino, flags);
            unlock_resource(t, &mut v.fd_resource, baryon_fs::wait::CHANNEL_FILE_TABLE);
            r
        })
    })?;
    match install_fd(file, 0) {
        Ok(fd) => Ok(fd),
        Err(e) => {
            with_vfs(|v| v.files.release_fd(file).map(|_| ()))?;
            Err(e)
        }
    }
}

/// `open(2)`.
pub fn sys_open(path: usize, flags: usize, mode: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(do_open(path, flags, mode))
}

fn do_open(path: usize, flags: usize, mode: usize) -> Result<isize> {
    let c = caller();
    let path = user_path(path)?;
    let flags = OpenFlags::from_bits_truncate(flags as u32);

    let ino = with_vfs(|v| -> Result<InodeIdx> {
        let mut ctx = v.ctx();
        let follow = !flags.contains(OpenFlags::O_NOFOLLOW);
        match namei(&mut ctx, &c.cred, c.base, &path, follow) {
            Ok(ino) => {
                if flags.contains(OpenFlags::O_CREAT) && flags.contains(OpenFlags::O_EXCL) {
                    iput(&mut ctx, ino);
                    return Err(Errno::EEXIST);
                }
                if ctx.inodes.get(ino).mode.is_lnk() {
                    // O_NOFOLLOW hit a symlink.
                    iput(&mut ctx, ino);
                    return Err(Errno::ELOOP);
                }
                if ctx.inodes.get(ino).mode.is_dir() && flags.writable() {
                    iput(&mut ctx, ino);
                    return Err(Errno::EISDIR);
                }
                let mut want = Access::empty();
                if flags.readable() {
                    want |= Access::READ;
                }
                if flags.writable() {
                    want |= Access::WRITE;
                }
                let rdonly = mount_is_rdonly(&ctx, ino);
                if let Err(e) =
                    check_permission(ctx.inodes.get(ino), &c.cred, want, c.use_real, rdonly)
                {
                    iput(&mut ctx, ino);
                    return Err(e);
                }
                Ok(ino)
            }
            Err(Errno::ENOENT) if flags.contains(OpenFlags::O_CREAT) => {
                let (dir, name) = namei_parent(&mut ctx, &c.cred, c.base, &path)?;
                let rdonly = mount_is_rdonly(&ctx, dir);
                if let Err(e) = check_permission(
                    ctx.inodes.get(dir),
                    &c.cred,
                    Access::WRITE | Access::EXEC,
                    c.use_real,
                    rdonly,
                ) {
                    iput(&mut ctx, dir);
                    return Err(e);
                }
                let sb = ctx.inodes.get(dir).sb.ok_or(Errno::EINVAL)?;
                let driver = ctx.mounts.driver(sb)?;
                let perms = mode as u16 & !c.umask & 0o777;
                let num = driver.create(&mut ctx, dir, &name, FileMode::new(S_IFREG, perms));
                iput(&mut ctx, dir);
                iget(&mut ctx, sb, num?)
            }
            Err(e) => Err(e),
        }
    })?;

    let result = with_vfs(|v| -> Result<()> {
        let driver = driver_for(v, ino)?;
        let mut ctx = v.ctx();
        if flags.contains(OpenFlags::O_TRUNC) && flags.writable() {
            driver.truncate(&mut ctx, ino, 0)?;
        }
        driver.open(&mut ctx, ino, flags)
    });
    if let Err(e) = result {
        with_vfs(|v| iput(&mut v.ctx(), ino));
        return Err(e);
    }

    match open_file_slot(ino, flags) {
        Ok(fd) => Ok(fd as isize),
        Err(e) => {
            with_vfs(|v| {
                let driver = driver_for(v, ino).expect("driver vanished");
                let mut ctx = v.ctx();
                let _ = driver.release(&mut ctx, ino, flags);
                iput(&mut ctx, ino);
            });
            Err(e)
        }
    }
}

/// `creat(2)`: open with `O_CREAT | O_WRONLY | O_TRUNC`.
pub fn sys_creat(path: usize, mode: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    let flags = (OpenFlags::O_CREAT | OpenFlags::O_WRONLY | OpenFlags::O_TRUNC).bits() as usize;
    sys_open(path, flags, mode, 0, 0, 0)
}

/// `close(2)`.
pub fn sys_close(fd: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(do_close(fd))
}

fn do_close(fd: usize) -> Result<isize> {
    let file = fd_file(fd)?;
    with_proc(|t| {
        let p = t.current_mut();
        p.fd[fd] = FileIdx::NONE;
        p.cloexec.set(fd, false);
    });
    close_file(file)?;
    Ok(0)
}

/// Drops one share of an open-file slot, releasing the inode with the
/// last one. Used by `close`, `exit` and error unwinding.
pub(crate) fn close_file(file: FileIdx) -> Result<()> {
    with_vfs(|v| {
        let gone = v.files.release_fd(file)?;
        if let Some(open) = gone {
            let driver = driver_for(v, open.inode)?;
            let mut ctx = v.ctx();
            let _ = driver.release(&mut ctx, open.inode, open.flags);
            iput(&mut ctx, open.inode);
        }
        Ok(())
    })
}

/// Validates an fd as mmap backing and returns its inode token and
/// open mode for the vma record. Writable shared mappings need a
/// writable descriptor.
pub(crate) fn mmap_backing(
    fd: usize,
    want_write: bool,
    share: baryon_mm::vma::Share,
) -> Result<(u32, u8)> {
    let file = fd_file(fd)?;
    with_vfs(|v| {
        let open = *v.files.get(file)?;
        if !open.flags.readable() {
            return Err(Errno::EACCES);
        }
        if want_write && share == baryon_mm::vma::Share::Shared && !open.flags.writable() {
            return Err(Errno::EACCES);
        }
        if !v.inodes.get(open.inode).mode.is_reg() {
            return Err(Errno::ENODEV);
        }
        Ok((open.inode.index() as u32, (open.flags.bits() & 0x3) as u8))
    })
}

enum IoDir {
    Read,
    Write,
}

/// `read(2)`.
pub fn sys_read(fd: usize, buf: usize, count: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(do_io(fd, buf, count, &IoDir::Read))
}

/// `write(2)`.
pub fn sys_write(fd: usize, buf: usize, count: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(do_io(fd, buf, count, &IoDir::Write))
}

fn do_io(fd: usize, buf: usize, count: usize, dir: &IoDir) -> Result<isize> {
    let file = fd_file(fd)?;
    let mut kbuf = alloc::vec![0u8; count];
    if matches!(dir, IoDir::Write) {
        with_proc(|t| copy_from_user(&t.current().vmas, buf, &mut kbuf))?;
    }

    loop {
        let outcome = with_vfs(|v| -> Result<core::result::Result<isize, usize>> {
            let open = *v.files.get(file)?;
            match dir {
                IoDir::Read if !open.flags.readable() => return Err(Errno::EBADF),
                IoDir::Write if !open.flags.writable() => return Err(Errno::EBADF),
                _ => {}
            }
            let ino = open.inode;
            let driver = driver_for(v, ino)?;
            let mut ctx = v.ctx();
            // The driver itself never sleeps: would-block comes back as
            // EAGAIN and the retry sleep happens below, table released.
            let io_flags = open.flags | OpenFlags::O_NONBLOCK;
            let is_fifo = ctx.inodes.get(ino).mode.is_fifo();
            let num = ctx.inodes.get(ino).num;

            let r = match dir {
                IoDir::Read => driver.read(&mut ctx, ino, open.offset, &mut kbuf, io_flags),
                IoDir::Write => {
                    let mut off = open.offset;
                    if open.flags.contains(OpenFlags::O_APPEND) {
                        off = ctx.inodes.get(ino).size;
                    }
                    driver.write(&mut ctx, ino, off, &kbuf, io_flags)
                }
            };
            match r {
                Ok(n) => {
                    let now = crate::syscall::info::current_time();
                    let i = ctx.inodes.get_mut(ino);
                    match dir {
                        IoDir::Read => i.atime = now,
                        IoDir::Write => i.mtime = now,
                    }
                    let f = v.files.get_mut(file)?;
                    if matches!(dir, IoDir::Write) && f.flags.contains(OpenFlags::O_APPEND) {
                        f.offset = v.inodes.get(ino).size;
                    } else {
                        f.offset += n as u64;
                    }
                    Ok(Ok(n as isize))
                }
                Err(Errno::EAGAIN) if !open.flags.contains(OpenFlags::O_NONBLOCK) && is_fifo => {
                    let channel = match dir {
                        IoDir::Read => PipeFs::read_channel(num),
                        IoDir::Write => PipeFs::write_channel(num),
                    };
                    Ok(Err(channel))
                }
                Err(e) => Err(e),
            }
        });

        match outcome {
            Ok(Ok(n)) => {
                if matches!(dir, IoDir::Read) && n > 0 {
                    with_proc(|t| copy_to_user(&t.current().vmas, buf, &kbuf[..n as usize]))?;
                }
                return Ok(n);
            }
            Ok(Err(channel)) => {
                // Blocked: sleep on the object's channel and retry.
                let sig = with_proc(|t| sleep(t, channel, SleepKind::Interruptible));
                if sig != 0 {
                    return Err(Errno::EINTR);
                }
            }
            Err(Errno::EPIPE) => {
                let slot = with_proc(|t| t.current);
                let _ = with_proc(|t| send_sig(t, slot, SIGPIPE));
                return Err(Errno::EPIPE);
            }
            Err(e) => return Err(e),
        }
    }
}

const SEEK_SET: usize = 0;
const SEEK_CUR: usize = 1;
const SEEK_END: usize = 2;

/// `lseek(2)`.
pub fn sys_lseek(fd: usize, off: usize, whence: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(do_lseek(fd, off as i32 as i64, whence).map(|p| p as isize))
}

fn do_lseek(fd: usize, off: i64, whence: usize) -> Result<u64> {
    let file = fd_file(fd)?;
    with_vfs(|v| {
        let open = *v.files.get(file)?;
        let size = v.inodes.get(open.inode).size;
        let from = match whence {
            SEEK_SET => 0,
            SEEK_CUR => open.offset as i64,
            SEEK_END => size as i64,
            _ => return Err(Errno::EINVAL),
        };
        let target = from.checked_add(off).ok_or(Errno::EINVAL)?;
        if target < 0 {
            return Err(Errno::EINVAL);
        }
        let driver = driver_for(v, open.inode)?;
        let mut ctx = v.ctx();
        let accepted = driver.lseek(&mut ctx, open.inode, target as u64)?;
        v.files.get_mut(file)?.offset = accepted;
        Ok(accepted)
    })
}

/// `_llseek(2)`: 64-bit seek, result through a user pointer.
pub fn sys_llseek(fd: usize, hi: usize, lo: usize, result: usize, whence: usize, _a6: usize) -> isize {
    ret((|| {
        let off = ((hi as u64) << 32 | lo as u64) as i64;
        let pos = do_lseek(fd, off, whence)?;
        with_proc(|t| copy_to_user(&t.current().vmas, result, &pos.to_le_bytes()))?;
        Ok(0)
    })())
}

/// `dup(2)`.
pub fn sys_dup(fd: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(do_dup(fd, 0))
}

fn do_dup(fd: usize, from: usize) -> Result<isize> {
    let file = fd_file(fd)?;
    with_vfs(|v| v.files.dup(file))?;
    match install_fd(file, from) {
        Ok(newfd) => Ok(newfd as isize),
        Err(e) => {
            with_vfs(|v| v.files.release_fd(file).map(|_| ()))?;
            Err(e)
        }
    }
}

/// `dup2(2)`.
pub fn sys_dup2(fd: usize, newfd: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        if newfd >= OPEN_MAX {
            return Err(Errno::EBADF);
        }
        if fd == newfd {
            return Ok(newfd as isize);
        }
        // Close whatever occupied the target.
        let old = with_proc(|t| {
            let p = t.current_mut();
            let old = p.fd[newfd];
            p.fd[newfd] = FileIdx::NONE;
            old
        });
        if !old.is_none() {
            close_file(old)?;
        }
        with_vfs(|v| v.files.dup(file))?;
        with_proc(|t| {
            let p = t.current_mut();
            p.fd[newfd] = file;
            p.cloexec.set(newfd, false);
        });
        Ok(newfd as isize)
    })())
}

const F_DUPFD: usize = 0;
const F_GETFD: usize = 1;
const F_SETFD: usize = 2;
const F_GETFL: usize = 3;
const F_SETFL: usize = 4;

/// `fcntl(2)`.
pub fn sys_fcntl(fd: usize, cmd: usize, arg: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        match cmd {
            F_DUPFD => do_dup(fd, arg.min(OPEN_MAX - 1)),
            F_GETFD => Ok(isize::from(u8::from(with_proc(|t| {
                t.current().cloexec.get(fd)
            })))),
            F_SETFD => {
                with_proc(|t| t.current_mut().cloexec.set(fd, arg & 1 != 0));
                Ok(0)
            }
            F_GETFL => with_vfs(|v| Ok(v.files.get(file)?.flags.bits() as isize)),
            F_SETFL => with_vfs(|v| {
                // Only the status flags may change.
                let settable = OpenFlags::O_APPEND | OpenFlags::O_NONBLOCK;
                let f = v.files.get_mut(file)?;
                let keep = f.flags.difference(settable);
                f.flags = keep | (OpenFlags::from_bits_truncate(arg as u32) & settable);
                Ok(0)
            }),
            _ => Err(Errno::EINVAL),
        }
    })())
}

/// `pipe(2)`.
pub fn sys_pipe(fds_ptr: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let (rfile, wfile) = with_vfs(|v| -> Result<(FileIdx, FileIdx)> {
            let sb = v.pipefs_sb;
            let mut ctx = v.ctx();
            let ino = create_pipe(&mut ctx, sb)?;
            let driver = ctx.mounts.driver(sb)?;
            driver.open(&mut ctx, ino, OpenFlags::empty())?;
            driver.open(&mut ctx, ino, OpenFlags::O_WRONLY)?;
            // The write end holds its own inode reference.
            ctx.inodes.grab(ino);
            let rfile = v.files.get_new_fd(ino, OpenFlags::empty())?;
            let wfile = v.files.get_new_fd(ino, OpenFlags::O_WRONLY)?;
            Ok((rfile, wfile))
        })?;
        let rfd = install_fd(rfile, 0)?;
        let wfd = install_fd(wfile, 0)?;
        let out = [(rfd as i32).to_le_bytes(), (wfd as i32).to_le_bytes()].concat();
        with_proc(|t| copy_to_user(&t.current().vmas, fds_ptr, &out))?;
        Ok(0)
    })())
}

// ── Directory operations ────────────────────────────────────────────

fn dir_modify<T>(
    path: usize,
    op: impl FnOnce(
        &mut baryon_fs::fsops::FsContext<'_>,
        &Arc<dyn FsDriver>,
        InodeIdx,
        &str,
    ) -> Result<T>,
) -> Result<T> {
    let c = caller();
    let path = user_path(path)?;
    with_vfs(|v| {
        let mut ctx = v.ctx();
        let (dir, name) = namei_parent(&mut ctx, &c.cred, c.base, &path)?;
        let rdonly = mount_is_rdonly(&ctx, dir);
        if let Err(e) = check_permission(
            ctx.inodes.get(dir),
            &c.cred,
            Access::WRITE | Access::EXEC,
            c.use_real,
            rdonly,
        ) {
            iput(&mut ctx, dir);
            return Err(e);
        }
        let sb = ctx.inodes.get(dir).sb.ok_or(Errno::EINVAL)?;
        let driver = ctx.mounts.driver(sb)?;
        let r = op(&mut ctx, &driver, dir, &name);
        iput(&mut ctx, dir);
        r
    })
}

/// `mkdir(2)`.
pub fn sys_mkdir(path: usize, mode: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    let umask = with_proc(|t| t.current().umask);
    ret(dir_modify(path, |ctx, driver, dir, name| {
        if name == "." || name == ".." {
            return Err(Errno::EEXIST);
        }
        let perms = mode as u16 & !umask & 0o777;
        driver
            .mkdir(ctx, dir, name, FileMode::new(S_IFDIR, perms))
            .map(|_| 0)
    }))
}

/// `rmdir(2)`.
pub fn sys_rmdir(path: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(dir_modify(path, |ctx, driver, dir, name| {
        if name == "." {
            return Err(Errno::EINVAL);
        }
        if name == ".." {
            return Err(Errno::ENOTEMPTY);
        }
        driver.rmdir(ctx, dir, name).map(|()| 0)
    }))
}

/// `unlink(2)`.
pub fn sys_unlink(path: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(dir_modify(path, |ctx, driver, dir, name| {
        driver.unlink(ctx, dir, name).map(|()| 0)
    }))
}

/// `mknod(2)`.
pub fn sys_mknod(path: usize, mode: usize, dev: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    let (umask, euid) = with_proc(|t| (t.current().umask, t.current().cred.euid));
    ret(dir_modify(path, |ctx, driver, dir, name| {
        let kind = mode as u16 & baryon_fs::mode::S_IFMT;
        if (kind == S_IFCHR || kind == S_IFBLK) && euid != 0 {
            return Err(Errno::EPERM);
        }
        let perms = mode as u16 & !umask & 0o777;
        driver
            .mknod(
                ctx,
                dir,
                name,
                FileMode::new(kind, perms),
                DevId::from_raw(dev as u32),
            )
            .map(|_| 0)
    }))
}

/// `symlink(2)`.
pub fn sys_symlink(target: usize, link: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let target = user_path(target)?;
        dir_modify(link, |ctx, driver, dir, name| {
            driver.symlink(ctx, dir, name, &target).map(|_| 0)
        })
    })())
}

/// `link(2)`.
pub fn sys_link(old: usize, new: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let old = user_path(old)?;
        let new = user_path(new)?;
        with_vfs(|v| {
            let mut ctx = v.ctx();
            let target = namei(&mut ctx, &c.cred, c.base, &old, false)?;
            let r = (|| {
                let (dir, name) = namei_parent(&mut ctx, &c.cred, c.base, &new)?;
                if ctx.inodes.get(dir).sb != ctx.inodes.get(target).sb {
                    iput(&mut ctx, dir);
                    return Err(Errno::EXDEV);
                }
                let sb = ctx.inodes.get(dir).sb.ok_or(Errno::EINVAL)?;
                let driver = ctx.mounts.driver(sb)?;
                let r = driver.link(&mut ctx, target, dir, name.as_str());
                iput(&mut ctx, dir);
                r.map(|()| 0)
            })();
            iput(&mut ctx, target);
            r
        })
    })())
}

/// `rename(2)`.
pub fn sys_rename(old: usize, new: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let old = user_path(old)?;
        let new = user_path(new)?;
        with_vfs(|v| {
            let mut ctx = v.ctx();
            let (old_dir, old_name) = namei_parent(&mut ctx, &c.cred, c.base, &old)?;
            let r = (|| {
                let (new_dir, new_name) = namei_parent(&mut ctx, &c.cred, c.base, &new)?;
                if ctx.inodes.get(old_dir).sb != ctx.inodes.get(new_dir).sb {
                    iput(&mut ctx, new_dir);
                    return Err(Errno::EXDEV);
                }
                let sb = ctx.inodes.get(old_dir).sb.ok_or(Errno::EINVAL)?;
                let driver = ctx.mounts.driver(sb)?;
                let r = driver.rename(&mut ctx, old_dir, &old_name, new_dir, &new_name);
                iput(&mut ctx, new_dir);
                r.map(|()| 0)
            })();
            iput(&mut ctx, old_dir);
            r
        })
    })())
}

/// `readlink(2)`.
pub fn sys_readlink(path: usize, buf: usize, size: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let path = user_path(path)?;
        let target = with_vfs(|v| {
            let mut ctx = v.ctx();
            let ino = namei(&mut ctx, &c.cred, c.base, &path, false)?;
            let r = if ctx.inodes.get(ino).mode.is_lnk() {
                read_link(&mut ctx, ino)
            } else {
                Err(Errno::EINVAL)
            };
            iput(&mut ctx, ino);
            r
        })?;
        let n = target.len().min(size);
        with_proc(|t| copy_to_user(&t.current().vmas, buf, &target.as_bytes()[..n]))?;
        Ok(n as isize)
    })())
}

// ── Attributes ──────────────────────────────────────────────────────

/// The i386 `stat` layout, serialized field by field.
struct Stat {
    dev: u16,
    ino: u32,
    mode: u16,
    nlink: u16,
    uid: u16,
    gid: u16,
    rdev: u16,
    size: u32,
    blksize: u32,
    blocks: u32,
    atime: u32,
    mtime: u32,
    ctime: u32,
}

impl Stat {
    fn from_inode(i: &baryon_fs::inode::Inode) -> Self {
        Self {
            dev: i.dev.as_raw() as u16,
            ino: i.num,
            mode: i.mode.0,
            nlink: i.nlink,
            uid: i.uid,
            gid: i.gid,
            rdev: i.rdev.as_raw() as u16,
            size: i.size as u32,
            blksize: 1024,
            blocks: i.blocks,
            atime: i.atime,
            mtime: i.mtime,
            ctime: i.ctime,
        }
    }

    fn emit(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        let mut at = 0;
        let mut put16 = |out: &mut [u8; 64], v: u16| {
            out[at..at + 2].copy_from_slice(&v.to_le_bytes());
            at += 2;
        };
        put16(&mut out, self.dev);
        put16(&mut out, 0); // pad
        let mut at32 = 4;
        let mut put32 = |out: &mut [u8; 64], v: u32| {
            out[at32..at32 + 4].copy_from_slice(&v.to_le_bytes());
            at32 += 4;
        };
        put32(&mut out, self.ino);
        // mode/nlink and uid/gid pack two u16s per word.
        put32(&mut out, u32::from(self.mode) | (u32::from(self.nlink) << 16));
        put32(&mut out, u32::from(self.uid) | (u32::from(self.gid) << 16));
        put32(&mut out, u32::from(self.rdev));
        put32(&mut out, self.size);
        put32(&mut out, self.blksize);
        put32(&mut out, self.blocks);
        put32(&mut out, self.atime);
        put32(&mut out, 0);
        put32(&mut out, self.mtime);
        put32(&mut out, 0);
        put32(&mut out, self.ctime);
        put32(&mut out, 0);
        out
    }

    /// The large-file layout (`struct stat64`), 96 bytes.
    fn emit64(&self) -> [u8; 96] {
        let mut out = [0u8; 96];
        let mut put = |off: usize, v: u32| {
            out[off..off + 4].copy_from_slice(&v.to_le_bytes());
        };
        put(0, u32::from(self.dev));
        put(12, self.ino); // __st_ino
        put(16, u32::from(self.mode));
        put(20, u32::from(self.nlink));
        put(24, u32::from(self.uid));
        put(28, u32::from(self.gid));
        put(32, u32::from(self.rdev));
        put(44, self.size); // low word of the 64-bit size
        put(52, self.blksize);
        put(56, self.blocks);
        put(64, self.atime);
        put(72, self.mtime);
        put(80, self.ctime);
        put(88, self.ino);
        out
    }
}

fn stat_path(path: usize, buf: usize, follow: bool) -> Result<isize> {
    let c = caller();
    let path = user_path(path)?;
    let st = with_vfs(|v| {
        let mut ctx = v.ctx();
        let ino = namei(&mut ctx, &c.cred, c.base, &path, follow)?;
        let st = Stat::from_inode(ctx.inodes.get(ino));
        iput(&mut ctx, ino);
        Ok(st)
    })?;
    with_proc(|t| copy_to_user(&t.current().vmas, buf, &st.emit()))?;
    Ok(0)
}

/// `stat(2)`.
pub fn sys_stat(path: usize, buf: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(stat_path(path, buf, true))
}

/// `lstat(2)`.
pub fn sys_lstat(path: usize, buf: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(stat_path(path, buf, false))
}

/// `fstat(2)`.
pub fn sys_fstat(fd: usize, buf: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        let st = with_vfs(|v| {
            let open = *v.files.get(file)?;
            Ok(Stat::from_inode(v.inodes.get(open.inode)))
        })?;
        with_proc(|t| copy_to_user(&t.current().vmas, buf, &st.emit()))?;
        Ok(0)
    })())
}

fn stat64_path(path: usize, buf: usize, follow: bool) -> Result<isize> {
    let c = caller();
    let path = user_path(path)?;
    let st = with_vfs(|v| {
        let mut ctx = v.ctx();
        let ino = namei(&mut ctx, &c.cred, c.base, &path, follow)?;
        let st = Stat::from_inode(ctx.inodes.get(ino));
        iput(&mut ctx, ino);
        Ok(st)
    })?;
    with_proc(|t| copy_to_user(&t.current().vmas, buf, &st.emit64()))?;
    Ok(0)
}

/// `stat64(2)`.
pub fn sys_stat64(path: usize, buf: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(stat64_path(path, buf, true))
}

/// `lstat64(2)`.
pub fn sys_lstat64(path: usize, buf: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(stat64_path(path, buf, false))
}

/// `fstat64(2)`.
pub fn sys_fstat64(fd: usize, buf: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        let st = with_vfs(|v| {
            let open = *v.files.get(file)?;
            Ok(Stat::from_inode(v.inodes.get(open.inode)))
        })?;
        with_proc(|t| copy_to_user(&t.current().vmas, buf, &st.emit64()))?;
        Ok(0)
    })())
}

/// `truncate64(2)`: length split across two registers.
pub fn sys_truncate64(path: usize, lo: usize, hi: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let len = (lo as u32 as u64) | ((hi as u32 as u64) << 32);
        let c = caller();
        let path = user_path(path)?;
        let ino = with_vfs(|v| namei(&mut v.ctx(), &c.cred, c.base, &path, true))?;
        let r = truncate_inode(ino, len, Some(&c));
        with_vfs(|v| iput(&mut v.ctx(), ino));
        r
    })())
}

/// `ftruncate64(2)`.
pub fn sys_ftruncate64(fd: usize, lo: usize, hi: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let len = (lo as u32 as u64) | ((hi as u32 as u64) << 32);
        let file = fd_file(fd)?;
        let (ino, writable) = with_vfs(|v| {
            let open = v.files.get(file)?;
            Ok((open.inode, open.flags.writable()))
        })?;
        if !writable {
            return Err(Errno::EBADF);
        }
        truncate_inode(ino, len, None)
    })())
}

/// `access(2)`: permission check with the real ids.
pub fn sys_access(path: usize, mode: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let path = user_path(path)?;
        with_vfs(|v| {
            let mut ctx = v.ctx();
            let ino = namei(&mut ctx, &c.cred, c.base, &path, true)?;
            let want = Access::from_bits_truncate(mode as u8 & 0o7);
            let rdonly = mount_is_rdonly(&ctx, ino);
            let r = if want.is_empty() {
                Ok(()) // F_OK: existence
            } else {
                check_permission(ctx.inodes.get(ino), &c.cred, want, true, rdonly)
            };
            iput(&mut ctx, ino);
            r.map(|()| 0)
        })
    })())
}

fn chmod_inode(ino: InodeIdx, mode: u16, cred: &Cred) -> Result<isize> {
    with_vfs(|v| {
        let mut ctx = v.ctx();
        let i = ctx.inodes.get(ino);
        if cred.euid != 0 && cred.euid != i.uid {
            return Err(Errno::EPERM);
        }
        let kind = i.mode.kind();
        let now = crate::syscall::info::current_time();
        let i = ctx.inodes.get_mut(ino);
        i.mode = FileMode::new(kind, mode & 0o7777);
        i.ctime = now;
        i.flags.insert(baryon_fs::inode::InodeFlags::DIRTY);
        Ok(0)
    })
}

/// `chmod(2)`.
pub fn sys_chmod(path: usize, mode: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let path = user_path(path)?;
        let ino = with_vfs(|v| namei(&mut v.ctx(), &c.cred, c.base, &path, true))?;
        let r = chmod_inode(ino, mode as u16, &c.cred);
        with_vfs(|v| iput(&mut v.ctx(), ino));
        r
    })())
}

/// `fchmod(2)`.
pub fn sys_fchmod(fd: usize, mode: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let file = fd_file(fd)?;
        let ino = with_vfs(|v| Ok(v.files.get(file)?.inode))?;
        chmod_inode(ino, mode as u16, &c.cred)
    })())
}

/// `fchown(2)`.
pub fn sys_fchown(fd: usize, uid: usize, gid: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        if c.cred.euid != 0 {
            return Err(Errno::EPERM);
        }
        let file = fd_file(fd)?;
        with_vfs(|v| {
            let ino = v.files.get(file)?.inode;
            let now = crate::syscall::info::current_time();
            let i = v.inodes.get_mut(ino);
            if uid != usize::MAX {
                i.uid = uid as u16;
            }
            if gid != usize::MAX {
                i.gid = gid as u16;
            }
            i.ctime = now;
            Ok(0)
        })
    })())
}

fn truncate_inode(ino: InodeIdx, len: u64, check_write: Option<&Caller>) -> Result<isize> {
    with_vfs(|v| {
        let driver = driver_for(v, ino)?;
        let mut ctx = v.ctx();
        if ctx.inodes.get(ino).mode.is_dir() {
            return Err(Errno::EISDIR);
        }
        if let Some(c) = check_write {
            let rdonly = mount_is_rdonly(&ctx, ino);
            check_permission(ctx.inodes.get(ino), &c.cred, Access::WRITE, c.use_real, rdonly)?;
        }
        driver.truncate(&mut ctx, ino, len)?;
        Ok(0)
    })
}

/// `truncate(2)`.
pub fn sys_truncate(path: usize, len: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let path = user_path(path)?;
        let ino = with_vfs(|v| namei(&mut v.ctx(), &c.cred, c.base, &path, true))?;
        let r = truncate_inode(ino, len as u64, Some(&c));
        with_vfs(|v| iput(&mut v.ctx(), ino));
        r
    })())
}

/// `ftruncate(2)`.
pub fn sys_ftruncate(fd: usize, len: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        let (ino, writable) = with_vfs(|v| {
            let open = v.files.get(file)?;
            Ok((open.inode, open.flags.writable()))
        })?;
        if !writable {
            return Err(Errno::EBADF);
        }
        truncate_inode(ino, len as u64, None)
    })())
}

// ── Working directory and roots ─────────────────────────────────────

fn change_dir_to(ino: InodeIdx, chroot: bool) -> Result<isize> {
    let ok = with_vfs(|v| v.inodes.get(ino).mode.is_dir());
    if !ok {
        with_vfs(|v| iput(&mut v.ctx(), ino));
        return Err(Errno::ENOTDIR);
    }
    let old = with_proc(|t| {
        let p = t.current_mut();
        if chroot {
            p.root.replace(ino)
        } else {
            p.cwd.replace(ino)
        }
    });
    if let Some(old) = old {
        with_vfs(|v| iput(&mut v.ctx(), old));
    }
    Ok(0)
}

/// `chdir(2)`.
pub fn sys_chdir(path: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let path = user_path(path)?;
        let ino = with_vfs(|v| namei(&mut v.ctx(), &c.cred, c.base, &path, true))?;
        change_dir_to(ino, false)
    })())
}

/// `fchdir(2)`.
pub fn sys_fchdir(fd: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        let ino = with_vfs(|v| {
            let ino = v.files.get(file)?.inode;
            v.inodes.grab(ino);
            Ok(ino)
        })?;
        change_dir_to(ino, false)
    })())
}

/// `chroot(2)`.
pub fn sys_chroot(path: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        if c.cred.euid != 0 {
            return Err(Errno::EPERM);
        }
        let path = user_path(path)?;
        let ino = with_vfs(|v| namei(&mut v.ctx(), &c.cred, c.base, &path, true))?;
        change_dir_to(ino, true)
    })())
}

/// `getcwd(2)`: rebuilt by walking `..` upward and matching directory
/// entries by inode number.
pub fn sys_getcwd(buf: usize, size: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let path = with_vfs(|v| -> Result<String> {
            let mut ctx = v.ctx();
            let mut parts: alloc::vec::Vec<String> = alloc::vec::Vec::new();
            let mut at = c.base.cwd;
            ctx.inodes.grab(at);
            while at != c.base.root {
                let sb = ctx.inodes.get(at).sb.ok_or(Errno::ENOENT)?;
                let driver = ctx.mounts.driver(sb)?;
                let my_num = ctx.inodes.get(at).num;
                let parent_num = driver.lookup(&mut ctx, at, "..")?;
                if parent_num == my_num {
                    break;
                }
                let parent = iget(&mut ctx, sb, parent_num)?;
                // Find our name in the parent.
                let mut pos = 0u32;
                let mut name = None;
                while let Some((entry, next)) = driver.readdir(&mut ctx, parent, pos)? {
                    if entry.ino == my_num && entry.name != "." && entry.name != ".." {
                        name = Some(entry.name);
                        break;
                    }
                    pos = next;
                }
                iput(&mut ctx, at);
                at = parent;
                parts.push(name.ok_or(Errno::ENOENT)?);
            }
            iput(&mut ctx, at);
            if parts.is_empty() {
                return Ok(String::from("/"));
            }
            let mut out = String::new();
            for p in parts.iter().rev() {
                out.push('/');
                out.push_str(p);
            }
            Ok(out)
        })?;
        if path.len() + 1 > size {
            return Err(Errno::ERANGE);
        }
        let mut bytes = path.into_bytes();
        bytes.push(0);
        let n = bytes.len();
        with_proc(|t| copy_to_user(&t.current().vmas, buf, &bytes))?;
        Ok(n as isize)
    })())
}

// ── Directory reading ───────────────────────────────────────────────

/// `getdents(2)`: fills `linux_dirent` records.
pub fn sys_getdents(fd: usize, buf: usize, size: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let file = fd_file(fd)?;
        let (out, newpos) = with_vfs(|v| -> Result<(alloc::vec::Vec<u8>, u64)> {
            let open = *v.files.get(file)?;
            let ino = open.inode;
            if !v.inodes.get(ino).mode.is_dir() {
                return Err(Errno::ENOTDIR);
            }
            let mut ctx = v.ctx();
            check_permission(ctx.inodes.get(ino), &c.cred, Access::READ, c.use_real, false)?;
            let driver = ctx.mounts.driver(ctx.inodes.get(ino).sb.ok_or(Errno::EINVAL)?)?;
            let mut out = alloc::vec::Vec::new();
            let mut pos = open.offset as u32;
            while let Some((entry, next)) = driver.readdir(&mut ctx, ino, pos)? {
                // d_ino, d_off, d_reclen, name, NUL.
                let reclen = (4 + 4 + 2 + entry.name.len() + 1 + 3) & !3;
                if out.len() + reclen > size {
                    break;
                }
                out.extend_from_slice(&entry.ino.to_le_bytes());
                out.extend_from_slice(&next.to_le_bytes());
                out.extend_from_slice(&(reclen as u16).to_le_bytes());
                out.extend_from_slice(entry.name.as_bytes());
                out.push(0);
                while out.len() % 4 != 0 {
                    out.push(0);
                }
                pos = next;
            }
            Ok((out, u64::from(pos)))
        })?;
        if out.is_empty() {
            return Ok(0);
        }
        with_proc(|t| copy_to_user(&t.current().vmas, buf, &out))?;
        with_vfs(|v| {
            v.files.get_mut(file)?.offset = newpos;
            Ok(())
        })?;
        Ok(out.len() as isize)
    })())
}

// ── Sync, ioctl, flock ──────────────────────────────────────────────

/// `sync(2)`.
pub fn sys_sync(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_vfs(|v| {
        v.buffers.sync_dev(&mut v.devices, DevId::NONE)?;
        Ok(0)
    }))
}

/// `fsync(2)` / `fdatasync(2)`.
pub fn sys_fsync(fd: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        with_vfs(|v| {
            let dev = {
                let open = v.files.get(file)?;
                v.inodes.get(open.inode).dev
            };
            v.buffers.sync_dev(&mut v.devices, dev)?;
            Ok(0)
        })
    })())
}

/// `ioctl(2)`.
pub fn sys_ioctl(fd: usize, cmd: usize, arg: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        with_vfs(|v| {
            let ino = v.files.get(file)?.inode;
            let driver = driver_for(v, ino)?;
            let mut ctx = v.ctx();
            driver
                .ioctl(&mut ctx, ino, cmd as u32, arg as u32)
                .map(|r| r as isize)
        })
    })())
}

const LOCK_SH: usize = 1;
const LOCK_EX: usize = 2;
const LOCK_NB: usize = 4;
const LOCK_UN: usize = 8;

/// `flock(2)`: BSD advisory whole-file locks.
pub fn sys_flock(fd: usize, op: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        let pid = with_proc(|t| t.current().pid);
        let ino = with_vfs(|v| Ok(v.files.get(file)?.inode))?;
        loop {
            let blocked = with_vfs(|v| -> Result<bool> {
                let shared = op & LOCK_SH != 0;
                if op & LOCK_UN != 0 {
                    v.locks.retain(|l| !(l.inode == ino && l.pid == pid));
                    return Ok(false);
                }
                if op & (LOCK_SH | LOCK_EX) == 0 {
                    return Err(Errno::EINVAL);
                }
                let conflict = v
                    .locks
                    .iter()
                    .any(|l| l.inode == ino && l.pid != pid && !(l.shared && shared));
                if conflict {
                    return Ok(true);
                }
                v.locks.retain(|l| !(l.inode == ino && l.pid == pid));
                v.locks.push(crate::vfs::FlockEntry { inode: ino, pid, shared });
                Ok(false)
            })?;
            if !blocked {
                return Ok(0);
            }
            if op & LOCK_NB != 0 {
                return Err(Errno::EWOULDBLOCK);
            }
            let sig = with_proc(|t| {
                sleep(t, ino.channel(), SleepKind::Interruptible)
            });
            if sig != 0 {
                return Err(Errno::EINTR);
            }
        }
    })())
}

// ── Mounting ────────────────────────────────────────────────────────

/// `mount(2)`.
pub fn sys_mount(dev: usize, dir: usize, fstype: usize, flags: usize, _data: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        if c.cred.euid != 0 {
            return Err(Errno::EPERM);
        }
        let dev_path = user_path(dev)?;
        let dir_path = user_path(dir)?;
        let fsname = user_path(fstype)?;
        let mflags = if flags & 1 != 0 {
            MountFlags::RDONLY
        } else {
            MountFlags::empty()
        };
        with_vfs(|v| {
            let mut ctx = v.ctx();
            // The device argument is a node in the filesystem; pseudo
            // filesystems accept anything.
            let devid = match namei(&mut ctx, &c.cred, c.base, &dev_path, true) {
                Ok(ino) => {
                    let id = if ctx.inodes.get(ino).mode.is_blk() {
                        ctx.inodes.get(ino).rdev
                    } else {
                        DevId::NONE
                    };
                    iput(&mut ctx, ino);
                    id
                }
                Err(_) => DevId::NONE,
            };
            let dir_ino = namei(&mut ctx, &c.cred, c.base, &dir_path, true)?;
            match do_mount(&mut ctx, &fsname, devid, Some(dir_ino), mflags) {
                Ok(_) => Ok(0), // the mount entry owns the dir reference
                Err(e) => {
                    iput(&mut ctx, dir_ino);
                    Err(e)
                }
            }
        })
    })())
}

/// `umount(2)`.
pub fn sys_umount(target: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    sys_umount2(target, 0, 0, 0, 0, 0)
}

/// `umount2(2)`.
pub fn sys_umount2(target: usize, _flags: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        if c.cred.euid != 0 {
            return Err(Errno::EPERM);
        }
        let path = user_path(target)?;
        with_vfs(|v| {
            let mut ctx = v.ctx();
            let ino = namei(&mut ctx, &c.cred, c.base, &path, true)?;
            // The path names the mounted root; find its entry.
            let sb = ctx.inodes.get(ino).sb.ok_or(Errno::EINVAL)?;
            let is_root_of_mount = ctx.mounts.get(sb)?.root == Some(ino);
            iput(&mut ctx, ino);
            if !is_root_of_mount {
                return Err(Errno::EINVAL);
            }
            if sb == ctx_root_sb(v) {
                return Err(Errno::EBUSY);
            }
            let mut ctx = v.ctx();
            do_umount(&mut ctx, sb)?;
            Ok(0)
        })
    })())
}

fn ctx_root_sb(v: &Vfs) -> baryon_fs::superblock::MountIdx {
    v.root_sb
}

// ── select ──────────────────────────────────────────────────────────

/// `select(2)` fd sets are 256 bits.
const FDSET_BYTES: usize = OPEN_MAX / 8;

fn read_fdset(ptr: usize) -> Result<[u8; FDSET_BYTES]> {
    let mut set = [0u8; FDSET_BYTES];
    if ptr != 0 {
        with_proc(|t| copy_from_user(&t.current().vmas, ptr, &mut set))?;
    }
    Ok(set)
}

fn fdset_has(set: &[u8; FDSET_BYTES], fd: usize) -> bool {
    set[fd / 8] & (1 << (fd % 8)) != 0
}

fn fdset_put(set: &mut [u8; FDSET_BYTES], fd: usize) {
    set[fd / 8] |= 1 << (fd % 8);
}

/// `_newselect(2)`: polls the per-file `select` operation, sleeping on
/// the shared readiness channel between rounds. A timeout wake returns
/// zero ready descriptors; a signal interrupts with `EINTR`.
pub fn sys_select(nfds: usize, readfds: usize, writefds: usize, _exceptfds: usize, timeout: usize, _a6: usize) -> isize {
    ret((|| {
        let nfds = nfds.min(OPEN_MAX);
        let want_read = read_fdset(readfds)?;
        let want_write = read_fdset(writefds)?;

        let timeout_ticks = if timeout == 0 {
            None // wait forever
        } else {
            let mut raw = [0u8; 8];
            with_proc(|t| copy_from_user(&t.current().vmas, timeout, &mut raw))?;
            let sec = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            let usec = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
            Some(
                sec.saturating_mul(crate::config::HZ)
                    .saturating_add(usec.div_ceil(1_000_000 / crate::config::HZ)),
            )
        };

        loop {
            let mut got_read = [0u8; FDSET_BYTES];
            let mut got_write = [0u8; FDSET_BYTES];
            let mut count = 0isize;
            for fd in 0..nfds {
                let wr = fdset_has(&want_read, fd);
                let ww = fdset_has(&want_write, fd);
                if !wr && !ww {
                    continue;
                }
                let file = fd_file(fd)?;
                let (r, w) = with_vfs(|v| {
                    let ino = v.files.get(file)?.inode;
                    let driver = driver_for(v, ino)?;
                    let mut ctx = v.ctx();
                    let r = wr && driver.select(&mut ctx, ino, false)?;
                    let w = ww && driver.select(&mut ctx, ino, true)?;
                    Ok((r, w))
                })?;
                if r {
                    fdset_put(&mut got_read, fd);
                    count += 1;
                }
                if w {
                    fdset_put(&mut got_write, fd);
                    count += 1;
                }
            }

            if count > 0 || timeout_ticks == Some(0) {
                if readfds != 0 {
                    with_proc(|t| copy_to_user(&t.current().vmas, readfds, &got_read))?;
                }
                if writefds != 0 {
                    with_proc(|t| copy_to_user(&t.current().vmas, writefds, &got_write))?;
                }
                return Ok(count);
            }

            // Nothing ready: sleep on the shared channel, bounded by
            // the timeout.
            let sig = with_proc(|t| {
                let me = t.current;
                if let Some(ticks) = timeout_ticks {
                    t.get_mut(me).timed_out = false;
                    t.get_mut(me).timeout = ticks;
                }
                sleep(t, baryon_fs::wait::CHANNEL_SELECT, SleepKind::Interruptible)
            });
            let timed_out = with_proc(|t| {
                let me = t.current;
                let out = t.get(me).timed_out;
                t.get_mut(me).timeout = 0;
                out
            });
            if timed_out {
                if readfds != 0 {
                    with_proc(|t| copy_to_user(&t.current().vmas, readfds, &[0u8; FDSET_BYTES]))?;
                }
                if writefds != 0 {
                    with_proc(|t| copy_to_user(&t.current().vmas, writefds, &[0u8; FDSET_BYTES]))?;
                }
                return Ok(0);
            }
            if sig != 0 {
                return Err(Errno::EINTR);
            }
            #[cfg(not(target_os = "none"))]
            return Ok(0); // the host build has no second chance coming
        }
    })())
}

/// `utime(2)`.
pub fn sys_utime(path: usize, times: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let path = user_path(path)?;
        let (atime, mtime) = if times == 0 {
            let now = crate::syscall::info::current_time();
            (now, now)
        } else {
            let mut raw = [0u8; 8];
            with_proc(|t| copy_from_user(&t.current().vmas, times, &mut raw))?;
            (
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            )
        };
        with_vfs(|v| {
            let mut ctx = v.ctx();
            let ino = namei(&mut ctx, &c.cred, c.base, &path, true)?;
            let r = (|| {
                let i = ctx.inodes.get(ino);
                if c.cred.euid != 0 && c.cred.euid != i.uid {
                    return Err(Errno::EPERM);
                }
                let now = crate::syscall::info::current_time();
                let i = ctx.inodes.get_mut(ino);
                i.atime = atime;
                i.mtime = mtime;
                i.ctime = now;
                i.flags.insert(baryon_fs::inode::InodeFlags::DIRTY);
                Ok(0)
            })();
            iput(&mut ctx, ino);
            r
        })
    })())
}

/// `chown(2)`.
pub fn sys_chown(path: usize, uid: usize, gid: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        if c.cred.euid != 0 {
            return Err(Errno::EPERM);
        }
        let path = user_path(path)?;
        with_vfs(|v| {
            let mut ctx = v.ctx();
            let ino = namei(&mut ctx, &c.cred, c.base, &path, true)?;
            let now = crate::syscall::info::current_time();
            let i = ctx.inodes.get_mut(ino);
            if uid != usize::MAX {
                i.uid = uid as u16;
            }
            if gid != usize::MAX {
                i.gid = gid as u16;
            }
            i.ctime = now;
            iput(&mut ctx, ino);
            Ok(0)
        })
    })())
}

// ── statfs ──────────────────────────────────────────────────────────

fn emit_statfs(st: &baryon_fs::fsops::StatFs, buf: usize) -> Result<()> {
    let mut out = [0u8; 64];
    for (i, v) in [
        st.fs_type, st.bsize, st.blocks, st.bfree, st.bavail, st.files, st.ffree, 0, 0,
        st.namelen,
    ]
    .iter()
    .enumerate()
    {
        out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    with_proc(|t| copy_to_user(&t.current().vmas, buf, &out))
}

/// `statfs(2)`.
pub fn sys_statfs(path: usize, buf: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let c = caller();
        let path = user_path(path)?;
        let st = with_vfs(|v| {
            let mut ctx = v.ctx();
            let ino = namei(&mut ctx, &c.cred, c.base, &path, true)?;
            let sb = ctx.inodes.get(ino).sb.ok_or(Errno::EINVAL)?;
            let driver = ctx.mounts.driver(sb)?;
            let r = driver.statfs(&mut ctx, sb);
            iput(&mut ctx, ino);
            r
        })?;
        emit_statfs(&st, buf)?;
        Ok(0)
    })())
}

/// `fstatfs(2)`.
pub fn sys_fstatfs(fd: usize, buf: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let file = fd_file(fd)?;
        let st = with_vfs(|v| {
            let ino = v.files.get(file)?.inode;
            let sb = v.inodes.get(ino).sb.ok_or(Errno::EINVAL)?;
            let driver = v.mounts.driver(sb)?;
            let mut ctx = v.ctx();
            driver.statfs(&mut ctx, sb)
        })?;
        emit_statfs(&st, buf)?;
        Ok(0)
    })())
}
