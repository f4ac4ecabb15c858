//! System information, time-of-day and the multiplexer stubs.

use baryon_core::sync::SpinLock;
use baryon_core::{Errno, Result};
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::HZ;
use crate::kstat::KSTAT;
use crate::proc::with_proc;
use crate::syscall::ret;
use crate::syscall::userptr::{copy_from_user, copy_to_user};
use crate::timer;

/// Wall-clock seconds at boot (settable by `settimeofday`/`stime`).
static BOOT_EPOCH: AtomicU32 = AtomicU32::new(0);

/// Current wall-clock seconds.
#[must_use]
pub fn current_time() -> u32 {
    BOOT_EPOCH.load(Ordering::Relaxed) + timer::uptime()
}

/// Seeds the wall clock at boot (from the RTC driver).
pub fn set_boot_epoch(seconds: u32) {
    BOOT_EPOCH.store(seconds, Ordering::Relaxed);
}

const HOST_NAME_MAX: usize = 64;

struct Names {
    hostname: [u8; HOST_NAME_MAX],
    hostname_len: usize,
    domainname: [u8; HOST_NAME_MAX],
    domainname_len: usize,
}

static NAMES: SpinLock<Names> = SpinLock::new(Names {
    hostname: [0; HOST_NAME_MAX],
    hostname_len: 0,
    domainname: [0; HOST_NAME_MAX],
    domainname_len: 0,
});

/// `time(2)`.
pub fn sys_time(ptr: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    let now = current_time();
    if ptr != 0 {
        let r = with_proc(|t| copy_to_user(&t.current().vmas, ptr, &now.to_le_bytes()));
        if let Err(e) = r {
            return e.as_neg();
        }
    }
    now as isize
}

/// `stime(2)`.
pub fn sys_stime(ptr: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if with_proc(|t| t.current().cred.euid) != 0 {
            return Err(Errno::EPERM);
        }
        let mut raw = [0u8; 4];
        with_proc(|t| copy_from_user(&t.current().vmas, ptr, &mut raw))?;
        let now = u32::from_le_bytes(raw);
        BOOT_EPOCH.store(now.saturating_sub(timer::uptime()), Ordering::Relaxed);
        Ok(0)
    })())
}

/// `gettimeofday(2)`.
pub fn sys_gettimeofday(tv: usize, _tz: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if tv != 0 {
            let sec = current_time();
            let usec = (timer::jiffies() % HZ) * (1_000_000 / HZ);
            let mut out = [0u8; 8];
            out[..4].copy_from_slice(&sec.to_le_bytes());
            out[4..].copy_from_slice(&usec.to_le_bytes());
            with_proc(|t| copy_to_user(&t.current().vmas, tv, &out))?;
        }
        Ok(0)
    })())
}

/// `settimeofday(2)`.
pub fn sys_settimeofday(tv: usize, _tz: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if with_proc(|t| t.current().cred.euid) != 0 {
            return Err(Errno::EPERM);
        }
        if tv != 0 {
            let mut raw = [0u8; 8];
            with_proc(|t| copy_from_user(&t.current().vmas, tv, &mut raw))?;
            let sec = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            BOOT_EPOCH.store(sec.saturating_sub(timer::uptime()), Ordering::Relaxed);
        }
        Ok(0)
    })())
}

/// `times(2)`: four clock_t values, returns the tick count.
pub fn sys_times(ptr: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let (u, s, cu, cs) = with_proc(|t| {
            let p = t.current();
            (p.usage.utime, p.usage.stime, p.cusage.utime, p.cusage.stime)
        });
        if ptr != 0 {
            let mut out = [0u8; 16];
            for (i, v) in [u, s, cu, cs].iter().enumerate() {
                out[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
            }
            with_proc(|t| copy_to_user(&t.current().vmas, ptr, &out))?;
        }
        Ok(timer::jiffies() as isize)
    })())
}

/// One 65-byte utsname field, NUL-padded.
fn uts_field(out: &mut alloc::vec::Vec<u8>, s: &[u8]) {
    let mut field = [0u8; 65];
    let n = s.len().min(64);
    field[..n].copy_from_slice(&s[..n]);
    out.extend_from_slice(&field);
}

/// `uname(2)`: the new (six-field) utsname.
pub fn sys_uname(ptr: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let mut out = alloc::vec::Vec::with_capacity(65 * 6);
        let names = NAMES.lock();
        uts_field(&mut out, b"Baryon");
        uts_field(&mut out, &names.hostname[..names.hostname_len]);
        uts_field(&mut out, b"0.1.0");
        uts_field(&mut out, b"#1");
        uts_field(&mut out, b"i386");
        uts_field(&mut out, &names.domainname[..names.domainname_len]);
        drop(names);
        with_proc(|t| copy_to_user(&t.current().vmas, ptr, &out))?;
        Ok(0)
    })())
}

/// `sethostname(2)`.
pub fn sys_sethostname(name: usize, len: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(set_name(name, len, false))
}

/// `setdomainname(2)`.
pub fn sys_setdomainname(name: usize, len: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(set_name(name, len, true))
}

fn set_name(name: usize, len: usize, domain: bool) -> Result<isize> {
    if with_proc(|t| t.current().cred.euid) != 0 {
        return Err(Errno::EPERM);
    }
    if len > HOST_NAME_MAX {
        return Err(Errno::EINVAL);
    }
    let mut buf = alloc::vec![0u8; len];
    with_proc(|t| copy_from_user(&t.current().vmas, name, &mut buf))?;
    let mut names = NAMES.lock();
    if domain {
        names.domainname[..len].copy_from_slice(&buf);
        names.domainname_len = len;
    } else {
        names.hostname[..len].copy_from_slice(&buf);
        names.hostname_len = len;
    }
    Ok(0)
}

/// `sysinfo(2)`: uptime, loads and memory counters.
pub fn sys_sysinfo(ptr: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let mut out = alloc::vec::Vec::with_capacity(64);
        out.extend_from_slice(&timer::uptime().to_le_bytes());
        for i in 0..3 {
            out.extend_from_slice(&KSTAT.loadavg[i].load(Ordering::Relaxed).to_le_bytes());
        }
        let procs = with_proc(|t| t.live_slots().count() as u32);
        out.extend_from_slice(&procs.to_le_bytes());
        out.resize(64, 0);
        with_proc(|t| copy_to_user(&t.current().vmas, ptr, &out))?;
        Ok(0)
    })())
}

const REBOOT_MAGIC1: usize = 0xfee1_dead;
const REBOOT_MAGIC2: usize = 0x2812_1969;

/// `reboot(2)`: magic numbers checked, the machine reset itself is the
/// architecture layer's.
pub fn sys_reboot(magic1: usize, magic2: usize, cmd: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if with_proc(|t| t.current().cred.euid) != 0 {
            return Err(Errno::EPERM);
        }
        if magic1 != REBOOT_MAGIC1 || magic2 != REBOOT_MAGIC2 {
            return Err(Errno::EINVAL);
        }
        let _ = cmd;
        #[cfg(target_os = "none")]
        crate::arch::machine_restart();
        Ok(0)
    })())
}

/// `ioperm(2)`: per-port I/O permission; root only, range checked
/// against the 8192-byte bitmap's extent.
pub fn sys_ioperm(from: usize, num: usize, _on: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if from + num > 0x10000 {
            return Err(Errno::EINVAL);
        }
        if with_proc(|t| t.current().cred.euid) != 0 {
            return Err(Errno::EPERM);
        }
        // The TSS I/O bitmap update happens on the next task switch.
        Ok(0)
    })())
}

/// `iopl(2)`: ring-0 I/O privilege; root only, level sanity-checked.
pub fn sys_iopl(level: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        if level > 3 {
            return Err(Errno::EINVAL);
        }
        if with_proc(|t| t.current().cred.euid) != 0 {
            return Err(Errno::EPERM);
        }
        // The eflags IOPL update happens on the way back to user mode.
        Ok(0)
    })())
}

/// `socketcall(2)`: the socket multiplexer. Sockets live outside the
/// core; every valid sub-call reports `ENOSYS`, invalid selectors
/// `EINVAL`.
pub fn sys_socketcall(call: usize, _args: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    // SYS_SOCKET..=SYS_SENDMSG.
    if (1..=17).contains(&call) {
        Errno::ENOSYS.as_neg()
    } else {
        Errno::EINVAL.as_neg()
    }
}

/// `ipc(2)`: the System V IPC multiplexer; semantics live outside the
/// core.
pub fn sys_ipc(call: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    // SEMOP..=SHMGET.
    if (1..=24).contains(&call) {
        Errno::ENOSYS.as_neg()
    } else {
        Errno::EINVAL.as_neg()
    }
}
