//! Process lifecycle and identity syscalls.

use baryon_core::{Errno, Result};
use baryon_fs::file::FileIdx;
use baryon_fs::inode::iput;

use crate::config::{HZ, OPEN_MAX};
use crate::kstat::KSTAT;
use crate::proc::sleep::{SleepKind, sleep, wakeup};
use crate::proc::{Process, ProcFlags, ProcState, RLIM_NLIMITS, with_proc};
use crate::sched;
use crate::signal::{SIGCHLD, SIGCONT, SIGHUP, send_sig};
use crate::syscall::fs::close_file;
use crate::syscall::ret;
use crate::syscall::userptr::{copy_from_user, copy_to_user};
use crate::timer;
use crate::vfs::with_vfs;

/// `fork(2)`.
pub fn sys_fork(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(do_fork())
}

fn do_fork() -> Result<isize> {
    let child_pid = with_proc(|t| -> Result<i32> {
        let parent = t.current;
        let child = t.get_proc_free()?;
        let pid = t.get_unused_pid();

        // Duplicate the parent record field by field; arena links and
        // the scheduler state start fresh.
        let p = t.get(parent);
        let new = Process {
            pid,
            ppid: p.pid,
            pgid: p.pgid,
            sid: p.sid,
            state: ProcState::Unused,
            flags: p.flags.difference(ProcFlags::NOTINTERRUPT),
            cred: p.cred,
            suid: p.suid,
            sgid: p.sgid,
            umask: p.umask,
            fd: p.fd,
            cloexec: p.cloexec,
            root: p.root,
            cwd: p.cwd,
            vmas: p.vmas.duplicate(),
            space: None,
            sigpending: 0,
            sigblocked: p.sigblocked,
            sigexecuting: 0,
            sigactions: p.sigactions,
            sigcontexts: p.sigcontexts,
            saved_result: 0,
            priority: p.priority,
            // The child starts with a full quantum; the parent keeps
            // its remainder.
            cpu_count: p.priority,
            rlim: p.rlim,
            exit_code: 0,
            start_time: timer::jiffies(),
            task: p.task,
            ..Process::default()
        };
        *t.get_mut(child) = new;

        // Share the open files: one extra reference per live fd, plus
        // the directory handles.
        with_vfs(|v| {
            let fds: alloc::vec::Vec<FileIdx> = (0..OPEN_MAX)
                .filter_map(|i| {
                    let f = t.get(child).fd[i];
                    (!f.is_none()).then_some(f)
                })
                .collect();
            for f in fds {
                let _ = v.files.dup(f);
            }
            let mut ctx = v.ctx();
            if let Some(root) = t.get(child).root {
                ctx.inodes.grab(root);
            }
            if let Some(cwd) = t.get(child).cwd {
                ctx.inodes.grab(cwd);
            }
        });

        // Clone the page tables copy-on-write; the arch layer also
        // rewrites the child's saved EAX to zero so the child returns 0
        // from the trap.
        #[cfg(target_os = "none")]
        crate::arch::fork_address_space(t, parent, child)?;

        t.runnable(child);
        KSTAT.forks.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
        Ok(pid)
    })?;
    Ok(child_pid as isize)
}

/// `exit(2)`.
pub fn sys_exit(status: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    do_exit(((status & 0xff) << 8) as i32);
    // A zombie never returns to user mode; the scheduler moved on in
    // `do_exit` on the target. The value satisfies the signature.
    0
}

/// The exit path, also taken by fatal signal delivery (`code` then
/// carries the signal number in the low byte).
pub fn do_exit(code: i32) {
    // Close every open file.
    let fds: alloc::vec::Vec<FileIdx> = with_proc(|t| {
        let p = t.current_mut();
        let mut out = alloc::vec::Vec::new();
        for i in 0..OPEN_MAX {
            if !p.fd[i].is_none() {
                out.push(p.fd[i]);
                p.fd[i] = FileIdx::NONE;
            }
        }
        out
    });
    for f in fds {
        let _ = close_file(f);
    }

    // Drop the references file-backed mappings hold, then the
    // directory handles.
    let tokens = with_proc(|t| {
        let p = t.current_mut();
        let tokens: alloc::vec::Vec<u32> =
            p.vmas.iter().filter_map(|v| v.inode).collect();
        p.vmas.clear();
        tokens
    });
    crate::syscall::mm::rebalance_vma_refs(&tokens, &[]);

    let (root, cwd) = with_proc(|t| {
        let p = t.current_mut();
        (p.root.take(), p.cwd.take())
    });
    with_vfs(|v| {
        let mut ctx = v.ctx();
        if let Some(r) = root {
            iput(&mut ctx, r);
        }
        if let Some(c) = cwd {
            iput(&mut ctx, c);
        }
    });

    with_proc(|t| {
        let slot = t.current;

        // A session leader drags its session down: SIGHUP + SIGCONT to
        // every member, and the controlling terminal is let go.
        if t.get(slot).is_session_leader() {
            let sid = t.get(slot).sid;
            let members: alloc::vec::Vec<usize> = t
                .live_slots()
                .filter(|&s| s != slot && t.get(s).sid == sid)
                .collect();
            for m in members {
                let _ = send_sig(t, m, SIGHUP);
                let _ = send_sig(t, m, SIGCONT);
            }
        }

        t.orphan_children(slot);
        t.make_zombie(slot, code);

        // Tell the parent.
        let ppid = t.get(slot).ppid;
        if let Some(parent) = t.find_pid(ppid) {
            let _ = send_sig(t, parent, SIGCHLD);
            wakeup(t, Process::channel(parent));
        }

        sched::do_sched(t);
    });
}

const WNOHANG: usize = 1;
const WUNTRACED: usize = 2;

/// `waitpid(2)`: the three-argument form of `wait4`.
pub fn sys_waitpid(pid: usize, status: usize, options: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    sys_wait4(pid, status, options, 0, 0, 0)
}

/// `wait4(2)`.
pub fn sys_wait4(pid: usize, status: usize, options: usize, _rusage: usize, _a5: usize, _a6: usize) -> isize {
    ret(do_wait4(pid as i32, status, options))
}

fn do_wait4(pid: i32, status_ptr: usize, options: usize) -> Result<isize> {
    loop {
        let outcome = with_proc(|t| -> Result<Option<(i32, i32)>> {
            let me = t.current;
            if let Some(z) = t.find_child(me, pid, ProcState::Zombie) {
                let (cpid, code) = t.remove_zombie(me, z);
                return Ok(Some((cpid, code)));
            }
            if options & WUNTRACED != 0 {
                if let Some(s) = t.find_child(me, pid, ProcState::Stopped) {
                    let cpid = t.get(s).pid;
                    // Stopped children report 0x7f in the low byte.
                    return Ok(Some((cpid, 0x7f)));
                }
            }
            if !t.has_child(me, pid) {
                return Err(Errno::ECHILD);
            }
            Ok(None)
        })?;

        if let Some((cpid, code)) = outcome {
            if status_ptr != 0 {
                with_proc(|t| {
                    copy_to_user(&t.current().vmas, status_ptr, &code.to_le_bytes())
                })?;
            }
            return Ok(cpid as isize);
        }
        if options & WNOHANG != 0 {
            return Ok(0);
        }
        let sig = with_proc(|t| {
            let me = t.current;
            sleep(t, Process::channel(me), SleepKind::Interruptible)
        });
        if sig != 0 {
            return Err(Errno::EINTR);
        }
    }
}

// ── Identity ────────────────────────────────────────────────────────

/// `getpid(2)`.
pub fn sys_getpid(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().pid as isize)
}

/// `getppid(2)`.
pub fn sys_getppid(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().ppid as isize)
}

/// `getuid(2)`.
pub fn sys_getuid(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().cred.uid as isize)
}

/// `geteuid(2)`.
pub fn sys_geteuid(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().cred.euid as isize)
}

/// `getgid(2)`.
pub fn sys_getgid(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().cred.gid as isize)
}

/// `getegid(2)`.
pub fn sys_getegid(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().cred.egid as isize)
}

/// `setuid(2)`.
pub fn sys_setuid(uid: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        let p = t.current_mut();
        let uid = uid as u16;
        if p.cred.euid == 0 {
            p.cred.uid = uid;
            p.cred.euid = uid;
            p.suid = uid;
        } else if uid == p.cred.uid || uid == p.suid {
            p.cred.euid = uid;
        } else {
            return Err(Errno::EPERM);
        }
        Ok(0)
    }))
}

/// `setgid(2)`.
pub fn sys_setgid(gid: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        let p = t.current_mut();
        let gid = gid as u16;
        if p.cred.euid == 0 {
            p.cred.gid = gid;
            p.cred.egid = gid;
            p.sgid = gid;
        } else if gid == p.cred.gid || gid == p.sgid {
            p.cred.egid = gid;
        } else {
            return Err(Errno::EPERM);
        }
        Ok(0)
    }))
}

/// `setreuid(2)`.
pub fn sys_setreuid(ruid: usize, euid: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        let p = t.current_mut();
        let privileged = p.cred.euid == 0;
        let (old_uid, old_euid) = (p.cred.uid, p.cred.euid);
        if ruid != usize::MAX {
            let ruid = ruid as u16;
            if !privileged && ruid != old_uid && ruid != old_euid {
                return Err(Errno::EPERM);
            }
            p.cred.uid = ruid;
        }
        if euid != usize::MAX {
            let euid = euid as u16;
            if !privileged && euid != old_uid && euid != old_euid && euid != p.suid {
                return Err(Errno::EPERM);
            }
            p.cred.euid = euid;
        }
        Ok(0)
    }))
}

/// `setregid(2)`.
pub fn sys_setregid(rgid: usize, egid: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        let p = t.current_mut();
        let privileged = p.cred.euid == 0;
        let (old_gid, old_egid) = (p.cred.gid, p.cred.egid);
        if rgid != usize::MAX {
            let rgid = rgid as u16;
            if !privileged && rgid != old_gid && rgid != old_egid {
                return Err(Errno::EPERM);
            }
            p.cred.gid = rgid;
        }
        if egid != usize::MAX {
            let egid = egid as u16;
            if !privileged && egid != old_gid && egid != old_egid && egid != p.sgid {
                return Err(Errno::EPERM);
            }
            p.cred.egid = egid;
        }
        Ok(0)
    }))
}

/// `getgroups(2)`.
pub fn sys_getgroups(size: usize, list: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let (groups, n) = with_proc(|t| (t.current().cred.groups, t.current().cred.ngroups));
        if size == 0 {
            return Ok(n as isize);
        }
        if size < n {
            return Err(Errno::EINVAL);
        }
        let mut out = alloc::vec::Vec::with_capacity(n * 2);
        for g in &groups[..n] {
            out.extend_from_slice(&g.to_le_bytes());
        }
        with_proc(|t| copy_to_user(&t.current().vmas, list, &out))?;
        Ok(n as isize)
    })())
}

/// `setgroups(2)`.
pub fn sys_setgroups(size: usize, list: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if size > baryon_fs::perms::NGROUPS_MAX {
            return Err(Errno::EINVAL);
        }
        let privileged = with_proc(|t| t.current().cred.euid == 0);
        if !privileged {
            return Err(Errno::EPERM);
        }
        let mut raw = alloc::vec![0u8; size * 2];
        with_proc(|t| copy_from_user(&t.current().vmas, list, &mut raw))?;
        with_proc(|t| {
            let p = t.current_mut();
            for (i, ch) in raw.chunks_exact(2).enumerate() {
                p.cred.groups[i] = u16::from_le_bytes([ch[0], ch[1]]);
            }
            p.cred.ngroups = size;
        });
        Ok(0)
    })())
}

/// `umask(2)`.
pub fn sys_umask(mask: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| {
        let p = t.current_mut();
        let old = p.umask;
        p.umask = mask as u16 & 0o777;
        old as isize
    })
}

// ── Sessions and process groups ─────────────────────────────────────

/// `setpgid(2)`.
pub fn sys_setpgid(pid: usize, pgid: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        let me = t.current;
        let target = if pid == 0 {
            me
        } else {
            t.find_pid(pid as i32).ok_or(Errno::ESRCH)?
        };
        // Only self or a child may be moved.
        if target != me && t.get(target).ppid != t.get(me).pid {
            return Err(Errno::ESRCH);
        }
        if t.get(target).is_session_leader() {
            return Err(Errno::EPERM);
        }
        let new_pgid = if pgid == 0 {
            t.get(target).pid
        } else {
            pgid as i32
        };
        if new_pgid < 0 {
            return Err(Errno::EINVAL);
        }
        t.get_mut(target).pgid = new_pgid;
        Ok(0)
    }))
}

/// `getpgid(2)`.
pub fn sys_getpgid(pid: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        if pid == 0 {
            return Ok(t.current().pgid as isize);
        }
        let s = t.find_pid(pid as i32).ok_or(Errno::ESRCH)?;
        Ok(t.get(s).pgid as isize)
    }))
}

/// `getpgrp(2)`.
pub fn sys_getpgrp(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().pgid as isize)
}

/// `setsid(2)`.
pub fn sys_setsid(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        let me = t.current;
        let pid = t.get(me).pid;
        // A process-group leader may not start a session.
        if t.live_slots().any(|s| s != me && t.get(s).pgid == pid) || t.get(me).pgid == pid {
            return Err(Errno::EPERM);
        }
        let p = t.get_mut(me);
        p.pgid = pid;
        p.sid = pid;
        Ok(pid as isize)
    }))
}

/// `getsid(2)`.
pub fn sys_getsid(pid: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        if pid == 0 {
            return Ok(t.current().sid as isize);
        }
        let s = t.find_pid(pid as i32).ok_or(Errno::ESRCH)?;
        Ok(t.get(s).sid as isize)
    }))
}

// ── Limits, usage, priority ─────────────────────────────────────────

/// `getrlimit(2)`.
pub fn sys_getrlimit(which: usize, ptr: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if which >= RLIM_NLIMITS {
            return Err(Errno::EINVAL);
        }
        let lim = with_proc(|t| t.current().rlim[which]);
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&lim.cur.to_le_bytes());
        out[4..].copy_from_slice(&lim.max.to_le_bytes());
        with_proc(|t| copy_to_user(&t.current().vmas, ptr, &out))?;
        Ok(0)
    })())
}

/// `setrlimit(2)`.
pub fn sys_setrlimit(which: usize, ptr: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if which >= RLIM_NLIMITS {
            return Err(Errno::EINVAL);
        }
        let mut raw = [0u8; 8];
        with_proc(|t| copy_from_user(&t.current().vmas, ptr, &mut raw))?;
        let cur = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let max = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        with_proc(|t| {
            let p = t.current_mut();
            if (max > p.rlim[which].max || cur > max) && p.cred.euid != 0 {
                return Err(Errno::EPERM);
            }
            p.rlim[which] = crate::proc::RLimit { cur, max };
            Ok(0)
        })
    })())
}

const RUSAGE_SELF: usize = 0;
const RUSAGE_CHILDREN: usize = usize::MAX; // -1

/// `getrusage(2)`: utime/stime as timevals, fault counters.
pub fn sys_getrusage(who: usize, ptr: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let usage = with_proc(|t| match who {
            RUSAGE_SELF => Ok(t.current().usage),
            RUSAGE_CHILDREN => Ok(t.current().cusage),
            _ => Err(Errno::EINVAL),
        })?;
        let tv = |ticks: u32| -> [u8; 8] {
            let mut out = [0u8; 8];
            out[..4].copy_from_slice(&(ticks / HZ).to_le_bytes());
            out[4..].copy_from_slice(&((ticks % HZ) * (1_000_000 / HZ)).to_le_bytes());
            out
        };
        // struct rusage: two timevals then the counters.
        let mut out = alloc::vec::Vec::with_capacity(72);
        out.extend_from_slice(&tv(usage.utime));
        out.extend_from_slice(&tv(usage.stime));
        for v in [0u32, usage.minflt, usage.majflt] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.resize(72, 0);
        with_proc(|t| copy_to_user(&t.current().vmas, ptr, &out))?;
        Ok(0)
    })())
}

/// `getpriority(2)`: reported as 20 - nice.
pub fn sys_getpriority(_which: usize, _who: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().priority as isize)
}

/// `setpriority(2)`.
pub fn sys_setpriority(_which: usize, _who: usize, prio: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        let prio = prio as i32;
        if !(1..=40).contains(&prio) {
            return Err(Errno::EINVAL);
        }
        t.current_mut().priority = prio;
        Ok(0)
    }))
}

/// `personality(2)`: only the Linux personality exists.
pub fn sys_personality(persona: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    if persona == 0 || persona == usize::MAX {
        0
    } else {
        Errno::EINVAL.as_neg()
    }
}

// ── Pausing and timers ──────────────────────────────────────────────

/// `pause(2)`: sleep until a signal is delivered.
pub fn sys_pause(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    loop {
        let sig = with_proc(|t| {
            let me = t.current;
            sleep(t, Process::channel(me), SleepKind::Interruptible)
        });
        if sig != 0 {
            return Errno::EINTR.as_neg();
        }
        #[cfg(not(target_os = "none"))]
        {
            // Host build: no rescheduling loop to resume into.
            return Errno::EINTR.as_neg();
        }
    }
}

/// `alarm(2)`.
pub fn sys_alarm(seconds: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| {
        let p = t.current_mut();
        let remaining = p.it_real.0.div_ceil(HZ);
        p.it_real = ((seconds as u32) * HZ, 0);
        remaining as isize
    })
}

const ITIMER_REAL: usize = 0;
const ITIMER_VIRTUAL: usize = 1;
const ITIMER_PROF: usize = 2;

fn itimer_of(p: &mut Process, which: usize) -> Result<&mut (u32, u32)> {
    match which {
        ITIMER_REAL => Ok(&mut p.it_real),
        ITIMER_VIRTUAL => Ok(&mut p.it_virt),
        ITIMER_PROF => Ok(&mut p.it_prof),
        _ => Err(Errno::EINVAL),
    }
}

fn timeval_ticks(raw: &[u8]) -> u32 {
    let sec = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let usec = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    sec.saturating_mul(HZ)
        .saturating_add(usec.div_ceil(1_000_000 / HZ))
}

fn ticks_timeval(ticks: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&(ticks / HZ).to_le_bytes());
    out[4..].copy_from_slice(&((ticks % HZ) * (1_000_000 / HZ)).to_le_bytes());
    out
}

/// `setitimer(2)`.
pub fn sys_setitimer(which: usize, new: usize, old: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let mut raw = [0u8; 16];
        with_proc(|t| copy_from_user(&t.current().vmas, new, &mut raw))?;
        let interval = timeval_ticks(&raw[..8]);
        let value = timeval_ticks(&raw[8..]);
        let prev = with_proc(|t| {
            let p = t.current_mut();
            let timer = itimer_of(p, which)?;
            let prev = *timer;
            *timer = (value, interval);
            Ok(prev)
        })?;
        if old != 0 {
            let mut out = [0u8; 16];
            out[..8].copy_from_slice(&ticks_timeval(prev.1));
            out[8..].copy_from_slice(&ticks_timeval(prev.0));
            with_proc(|t| copy_to_user(&t.current().vmas, old, &out))?;
        }
        Ok(0)
    })())
}

/// `getitimer(2)`.
pub fn sys_getitimer(which: usize, ptr: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let cur = with_proc(|t| {
            let p = t.current_mut();
            itimer_of(p, which).map(|t| *t)
        })?;
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&ticks_timeval(cur.1));
        out[8..].copy_from_slice(&ticks_timeval(cur.0));
        with_proc(|t| copy_to_user(&t.current().vmas, ptr, &out))?;
        Ok(0)
    })())
}

/// `nanosleep(2)`.
pub fn sys_nanosleep(req: usize, rem: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let mut raw = [0u8; 8];
        with_proc(|t| copy_from_user(&t.current().vmas, req, &mut raw))?;
        let sec = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let nsec = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        if nsec >= 1_000_000_000 {
            return Err(Errno::EINVAL);
        }
        let ticks = timer::timespec_to_ticks(sec, nsec);
        if ticks == 0 {
            return Ok(0);
        }

        let sig = with_proc(|t| {
            let me = t.current;
            t.get_mut(me).timed_out = false;
            t.get_mut(me).timeout = ticks;
            sleep(t, Process::channel(me), SleepKind::Interruptible)
        });

        with_proc(|t| -> Result<isize> {
            let me = t.current;
            let left = t.get(me).timeout;
            t.get_mut(me).timeout = 0;
            if sig != 0 && !t.get(me).timed_out {
                // Interrupted early: report the remaining time.
                if rem != 0 {
                    let (s, ns) = timer::ticks_to_timespec(left);
                    let mut out = [0u8; 8];
                    out[..4].copy_from_slice(&s.to_le_bytes());
                    out[4..].copy_from_slice(&ns.to_le_bytes());
                    copy_to_user(&t.current().vmas, rem, &out)?;
                }
                return Err(Errno::EINTR);
            }
            Ok(0)
        })
    })())
}
