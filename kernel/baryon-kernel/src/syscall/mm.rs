//! Memory syscalls: the break, mappings and protection.
//!
//! These operate on the caller's vma list; installing and tearing down
//! the actual page-table entries is demand-driven by the fault handler
//! on the target, so the handlers here never touch a frame.

use baryon_core::{Errno, Result};
use baryon_mm::vma::{Prot, Section, Share, Vma};

use baryon_core::addr::{PAGE_SIZE, page_align_up};

use crate::proc::with_proc;
use crate::syscall::ret;
use crate::syscall::userptr::copy_from_user;

const PROT_READ: usize = 1;
const PROT_WRITE: usize = 2;
const PROT_EXEC: usize = 4;

const MAP_SHARED: usize = 0x01;
const MAP_PRIVATE: usize = 0x02;
const MAP_FIXED: usize = 0x10;
const MAP_ANONYMOUS: usize = 0x20;

/// The inode tokens of the caller's file-backed regions, one entry per
/// region.
fn vma_tokens(t: &crate::proc::ProcTable) -> alloc::vec::Vec<u32> {
    t.current().vmas.iter().filter_map(|v| v.inode).collect()
}

/// Rebalances inode references after vma surgery: every file-backed
/// region holds one reference, so splits take extra ones and removed
/// regions drop theirs.
pub(crate) fn rebalance_vma_refs(before: &[u32], after: &[u32]) {
    let count = |list: &[u32], tok: u32| list.iter().filter(|&&t| t == tok).count() as i32;
    let mut seen: alloc::vec::Vec<u32> = alloc::vec::Vec::new();
    for &tok in before.iter().chain(after.iter()) {
        if seen.contains(&tok) {
            continue;
        }
        seen.push(tok);
        let delta = count(after, tok) - count(before, tok);
        crate::vfs::with_vfs(|v| {
            let idx = baryon_fs::inode::InodeIdx::new(tok);
            let mut ctx = v.ctx();
            for _ in 0..delta.max(0) {
                ctx.inodes.grab(idx);
            }
            for _ in 0..(-delta).max(0) {
                baryon_fs::inode::iput(&mut ctx, idx);
            }
        });
    }
}

/// Runs a vma mutation with reference rebalancing around it.
fn with_vma_surgery<R>(f: impl FnOnce(&mut crate::proc::ProcTable) -> Result<R>) -> Result<R> {
    let before = with_proc(|t| vma_tokens(t));
    let r = with_proc(f);
    let after = with_proc(|t| vma_tokens(t));
    rebalance_vma_refs(&before, &after);
    r
}

fn prot_from(raw: usize) -> Prot {
    let mut p = Prot::empty();
    if raw & PROT_READ != 0 {
        p |= Prot::READ;
    }
    if raw & PROT_WRITE != 0 {
        p |= Prot::WRITE;
    }
    if raw & PROT_EXEC != 0 {
        p |= Prot::EXEC;
    }
    p
}

/// `brk(2)`: returns the (possibly unchanged) break, Linux-style.
pub fn sys_brk(addr: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| {
        let p = t.current_mut();
        if addr == 0 {
            return p.vmas.brk as isize;
        }
        match p.vmas.expand_heap(addr as u32) {
            Ok(new_brk) => new_brk as isize,
            Err(_) => p.vmas.brk as isize,
        }
    })
}

fn do_mmap(
    addr: usize,
    len: usize,
    prot: usize,
    flags: usize,
    fd: usize,
    offset: u32,
) -> Result<isize> {
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    let len = page_align_up(len as u32);
    let share = if flags & MAP_SHARED != 0 {
        Share::Shared
    } else if flags & MAP_PRIVATE != 0 {
        Share::Private
    } else {
        return Err(Errno::EINVAL);
    };

    // A file-backed mapping records the open file's inode token; the
    // fault handler reads through it on first touch.
    let backing = if flags & MAP_ANONYMOUS != 0 {
        None
    } else {
        let file = crate::syscall::fs::mmap_backing(fd, prot & PROT_WRITE != 0, share)?;
        Some(file)
    };

    with_vma_surgery(|t| {
        let p = t.current_mut();
        let start = if flags & MAP_FIXED != 0 {
            let a = addr as u32;
            if a % PAGE_SIZE as u32 != 0 {
                return Err(Errno::EINVAL);
            }
            p.vmas.unmap_range(a, a + len)?;
            a
        } else {
            p.vmas.find_unmapped(len)?
        };
        p.vmas.insert(Vma {
            start,
            end: start + len,
            prot: prot_from(prot),
            share,
            offset,
            section: Section::Mmap,
            inode: backing.map(|(ino, _)| ino),
            open_mode: backing.map_or(0, |(_, mode)| mode),
        })?;
        Ok(start as isize)
    })
}

/// `mmap2(2)`: offset argument in pages.
pub fn sys_mmap2(addr: usize, len: usize, prot: usize, flags: usize, fd: usize, pgoff: usize) -> isize {
    ret(do_mmap(
        addr,
        len,
        prot,
        flags,
        fd,
        (pgoff as u32).wrapping_mul(PAGE_SIZE as u32),
    ))
}

/// Old `mmap(2)`: all six arguments packed in a user struct.
pub fn sys_old_mmap(args: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let mut raw = [0u8; 24];
        with_proc(|t| copy_from_user(&t.current().vmas, args, &mut raw))?;
        let word =
            |i: usize| u32::from_le_bytes([raw[i * 4], raw[i * 4 + 1], raw[i * 4 + 2], raw[i * 4 + 3]]);
        do_mmap(
            word(0) as usize,
            word(1) as usize,
            word(2) as usize,
            word(3) as usize,
            word(4) as usize,
            word(5),
        )
    })())
}

/// `munmap(2)`.
pub fn sys_munmap(addr: usize, len: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if len == 0 {
            return Err(Errno::EINVAL);
        }
        let end = page_align_up((addr + len) as u32);
        with_vma_surgery(|t| {
            t.current_mut().vmas.unmap_range(addr as u32, end)?;
            Ok(())
        })?;
        // Installed pages for the range are dropped with the tables on
        // the target.
        #[cfg(target_os = "none")]
        crate::arch::unmap_user_range(addr as u32, end);
        Ok(0)
    })())
}

/// `mprotect(2)`.
pub fn sys_mprotect(addr: usize, len: usize, prot: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let end = page_align_up((addr + len) as u32);
        with_vma_surgery(|t| {
            t.current_mut()
                .vmas
                .protect_range(addr as u32, end, prot_from(prot))?;
            Ok(())
        })?;
        #[cfg(target_os = "none")]
        crate::arch::protect_user_range(addr as u32, end, prot & PROT_WRITE != 0);
        Ok(0)
    })())
}

/// `madvise(2)`: advice is accepted and ignored.
pub fn sys_madvise(_addr: usize, _len: usize, advice: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    // MADV_NORMAL..=MADV_DONTNEED.
    if advice <= 4 {
        0
    } else {
        Errno::EINVAL.as_neg()
    }
}
