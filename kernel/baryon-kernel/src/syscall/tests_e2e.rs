//! End-to-end syscall scenarios over the initialized global tables.
//!
//! The global process table and VFS are process-wide, so every test
//! here serializes on one mutex and rebuilds the kernel state from
//! scratch. User buffers are the test's own memory — the host copy
//! shim passes pointers straight through.

use std::sync::{Mutex, MutexGuard};

use baryon_core::Errno;

use crate::proc::{INIT, ProcState, with_proc};
use crate::signal::{SIGPIPE, SIGTERM, sigmask};
use crate::syscall::dispatch;
use crate::vfs::with_vfs;

static KERNEL_LOCK: Mutex<()> = Mutex::new(());

/// Brings up fresh global tables with init (pid 1) current.
fn boot_kernel() -> MutexGuard<'static, ()> {
    let guard = KERNEL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    crate::proc::teardown();
    crate::vfs::teardown();
    crate::proc::init();
    crate::vfs::init(crate::vfs::RootConfig::default(), None).expect("vfs");

    with_proc(|t| {
        let slot = t.get_proc_free().unwrap();
        assert_eq!(slot, INIT);
        let pid = t.get_unused_pid();
        let root = with_vfs(|v| {
            let r = v.root;
            v.inodes.grab(r);
            v.inodes.grab(r);
            r
        });
        let p = t.get_mut(slot);
        p.pid = pid;
        p.pgid = pid;
        p.sid = pid;
        p.root = Some(root);
        p.cwd = Some(root);
        t.runnable(slot);
        t.current = INIT;
    });
    guard
}

fn sys(nr: usize, args: &[usize]) -> isize {
    let a = |i: usize| args.get(i).copied().unwrap_or(0);
    dispatch(nr, a(0), a(1), a(2), a(3), a(4), a(5))
}

const NR_EXIT: usize = 1;
const NR_FORK: usize = 2;
const NR_READ: usize = 3;
const NR_WRITE: usize = 4;
const NR_OPEN: usize = 5;
const NR_CLOSE: usize = 6;
const NR_UNLINK: usize = 10;
const NR_LSEEK: usize = 19;
const NR_GETPID: usize = 20;
const NR_KILL: usize = 37;
const NR_MKDIR: usize = 39;
const NR_RMDIR: usize = 40;
const NR_DUP: usize = 41;
const NR_PIPE: usize = 42;
const NR_BRK: usize = 45;
const NR_SYMLINK: usize = 83;
const NR_READLINK: usize = 85;
const NR_MUNMAP: usize = 91;
const NR_STAT: usize = 106;
const NR_WAIT4: usize = 114;
const NR_GETDENTS: usize = 141;
const NR_MMAP2: usize = 192;

const O_RDWR: usize = 0o2;
const O_CREAT: usize = 0o100;
const O_EXCL: usize = 0o200;
const O_NOFOLLOW: usize = 0o400000;

fn path(s: &str) -> (Vec<u8>, usize) {
    let mut v = s.as_bytes().to_vec();
    v.push(0);
    let p = v.as_ptr() as usize;
    (v, p)
}

#[test]
fn open_write_lseek_read_round_trip() {
    let _k = boot_kernel();
    let (_s, p) = path("/data.bin");
    let fd = sys(NR_OPEN, &[p, O_CREAT | O_RDWR, 0o644]);
    assert!(fd >= 0, "open failed: {fd}");

    let payload = b"the quick brown fox";
    let n = sys(NR_WRITE, &[fd as usize, payload.as_ptr() as usize, payload.len()]);
    assert_eq!(n, payload.len() as isize);

    assert_eq!(sys(NR_LSEEK, &[fd as usize, 0, 0]), 0);

    let mut back = [0u8; 32];
    let n = sys(NR_READ, &[fd as usize, back.as_mut_ptr() as usize, back.len()]);
    assert_eq!(n, payload.len() as isize);
    assert_eq!(&back[..n as usize], payload, "bytes must round-trip");

    // EOF reads return 0.
    assert_eq!(
        sys(NR_READ, &[fd as usize, back.as_mut_ptr() as usize, back.len()]),
        0
    );
    assert_eq!(sys(NR_CLOSE, &[fd as usize]), 0);
}

#[test]
fn open_excl_and_bad_fd() {
    let _k = boot_kernel();
    let (_s, p) = path("/once");
    let fd = sys(NR_OPEN, &[p, O_CREAT | O_RDWR, 0o600]);
    assert!(fd >= 0);
    assert_eq!(
        sys(NR_OPEN, &[p, O_CREAT | O_EXCL | O_RDWR, 0o600]),
        Errno::EEXIST.as_neg()
    );
    assert_eq!(sys(NR_CLOSE, &[99]), Errno::EBADF.as_neg());
    let mut b = [0u8; 4];
    assert_eq!(
        sys(NR_READ, &[57, b.as_mut_ptr() as usize, 4]),
        Errno::EBADF.as_neg()
    );
}

#[test]
fn pipe_round_trip_eof_and_epipe() {
    let _k = boot_kernel();
    let mut fds = [0i32; 2];
    assert_eq!(sys(NR_PIPE, &[fds.as_mut_ptr() as usize]), 0);
    let (rfd, wfd) = (fds[0] as usize, fds[1] as usize);

    let msg = b"through the pipe";
    assert_eq!(
        sys(NR_WRITE, &[wfd, msg.as_ptr() as usize, msg.len()]),
        msg.len() as isize
    );
    let mut back = [0u8; 32];
    let n = sys(NR_READ, &[rfd, back.as_mut_ptr() as usize, back.len()]);
    assert_eq!(&back[..n as usize], msg);

    // Writer closes: drained pipe reads EOF.
    assert_eq!(sys(NR_CLOSE, &[wfd]), 0);
    assert_eq!(sys(NR_READ, &[rfd, back.as_mut_ptr() as usize, 8]), 0);

    // Reader closes on a fresh pipe: writes break with EPIPE and raise
    // SIGPIPE.
    let mut fds2 = [0i32; 2];
    assert_eq!(sys(NR_PIPE, &[fds2.as_mut_ptr() as usize]), 0);
    assert_eq!(sys(NR_CLOSE, &[fds2[0] as usize]), 0);
    assert_eq!(
        sys(NR_WRITE, &[fds2[1] as usize, msg.as_ptr() as usize, 1]),
        Errno::EPIPE.as_neg()
    );
    let pending = with_proc(|t| t.current().sigpending);
    assert_ne!(pending & sigmask(SIGPIPE), 0, "EPIPE must raise SIGPIPE");
}

#[test]
fn fork_exit_wait_reaps_the_zombie() {
    let _k = boot_kernel();
    let child_pid = sys(NR_FORK, &[]);
    assert!(child_pid > 1, "fork returns the child pid to the parent");

    // Run as the child long enough to exit with status 42.
    let child_slot = with_proc(|t| t.find_pid(child_pid as i32).unwrap());
    with_proc(|t| t.current = child_slot);
    sys(NR_EXIT, &[42]);
    assert_eq!(
        with_proc(|t| t.get(child_slot).state),
        ProcState::Zombie,
        "exited child parks as a zombie"
    );
    // The scheduler fell back to the parent.
    assert_eq!(with_proc(|t| t.current), INIT);

    let mut status = 0i32;
    let got = sys(NR_WAIT4, &[usize::MAX, &mut status as *mut i32 as usize, 0]);
    assert_eq!(got, child_pid);
    assert_eq!((status >> 8) & 0xff, 42, "exit status travels in bits 8..16");

    // The slot is free again and the next fork reuses it.
    assert_eq!(
        with_proc(|t| t.get(child_slot).state),
        ProcState::Unused
    );
    let second = sys(NR_FORK, &[]);
    assert!(second > 0);
    assert_eq!(
        with_proc(|t| t.find_pid(second as i32).unwrap()),
        child_slot,
        "the reaped slot is reused by the next fork"
    );
}

#[test]
fn wait_with_no_children_is_echild() {
    let _k = boot_kernel();
    assert_eq!(
        sys(NR_WAIT4, &[usize::MAX, 0, 0]),
        Errno::ECHILD.as_neg()
    );
}

#[test]
fn fork_shares_open_files_by_count() {
    let _k = boot_kernel();
    let (_s, p) = path("/shared");
    let fd = sys(NR_OPEN, &[p, O_CREAT | O_RDWR, 0o644]);
    assert!(fd >= 0);
    let refs_before = with_vfs(|v| v.files.total_refs());

    let pid = sys(NR_FORK, &[]);
    assert!(pid > 0);
    assert_eq!(
        with_vfs(|v| v.files.total_refs()),
        refs_before + 1,
        "fork adds one share per open fd"
    );

    // Child closing its copy leaves the parent's usable.
    let child_slot = with_proc(|t| t.find_pid(pid as i32).unwrap());
    with_proc(|t| t.current = child_slot);
    assert_eq!(sys(NR_CLOSE, &[fd as usize]), 0);
    with_proc(|t| t.current = INIT);
    let buf = b"x";
    assert_eq!(sys(NR_WRITE, &[fd as usize, buf.as_ptr() as usize, 1]), 1);
}

#[test]
fn mkdir_boundaries_match_posix() {
    let _k = boot_kernel();
    let (_a, root) = path("/");
    assert_eq!(sys(NR_MKDIR, &[root, 0o755]), Errno::EEXIST.as_neg());

    let (_b, dot) = path(".");
    assert_eq!(sys(NR_RMDIR, &[dot]), Errno::EINVAL.as_neg());
    let (_c, dotdot) = path("..");
    assert_eq!(sys(NR_RMDIR, &[dotdot]), Errno::ENOTEMPTY.as_neg());

    let (_d, pd) = path("/dir");
    assert_eq!(sys(NR_MKDIR, &[pd, 0o755]), 0);
    let (_e, pf) = path("/dir/file");
    let fd = sys(NR_OPEN, &[pf, O_CREAT | O_RDWR, 0o644]);
    assert!(fd >= 0);
    sys(NR_CLOSE, &[fd as usize]);
    assert_eq!(sys(NR_RMDIR, &[pd]), Errno::ENOTEMPTY.as_neg());
    assert_eq!(sys(NR_UNLINK, &[pf]), 0);
    assert_eq!(sys(NR_RMDIR, &[pd]), 0);
}

#[test]
fn nofollow_and_symlink_resolution() {
    let _k = boot_kernel();
    let (_t, pt) = path("/target");
    let fd = sys(NR_OPEN, &[pt, O_CREAT | O_RDWR, 0o644]);
    assert!(fd >= 0);
    sys(NR_CLOSE, &[fd as usize]);

    let (_l, pl) = path("/ln");
    assert_eq!(sys(NR_SYMLINK, &[pt, pl]), 0);

    // Following works; O_NOFOLLOW on the link is ELOOP.
    let fd = sys(NR_OPEN, &[pl, O_RDWR, 0]);
    assert!(fd >= 0);
    sys(NR_CLOSE, &[fd as usize]);
    assert_eq!(sys(NR_OPEN, &[pl, O_NOFOLLOW, 0]), Errno::ELOOP.as_neg());

    let mut buf = [0u8; 32];
    let n = sys(NR_READLINK, &[pl, buf.as_mut_ptr() as usize, buf.len()]);
    assert_eq!(&buf[..n as usize], b"/target");
}

#[test]
fn dup_shares_the_offset() {
    let _k = boot_kernel();
    let (_s, p) = path("/off");
    let fd = sys(NR_OPEN, &[p, O_CREAT | O_RDWR, 0o644]) as usize;
    let fd2 = sys(NR_DUP, &[fd]) as usize;
    assert_ne!(fd, fd2);

    assert_eq!(sys(NR_WRITE, &[fd, b"abcd".as_ptr() as usize, 4]), 4);
    // The duplicate sees the shared offset.
    let mut b = [0u8; 4];
    assert_eq!(sys(NR_READ, &[fd2, b.as_mut_ptr() as usize, 4]), 0, "at EOF");
    assert_eq!(sys(NR_LSEEK, &[fd, 0, 0]), 0);
    assert_eq!(sys(NR_READ, &[fd2, b.as_mut_ptr() as usize, 4]), 4);
    assert_eq!(&b, b"abcd");
}

#[test]
fn stat_and_getdents_walk_a_directory() {
    let _k = boot_kernel();
    let (_d, pd) = path("/etc");
    assert_eq!(sys(NR_MKDIR, &[pd, 0o755]), 0);
    let (_f, pf) = path("/etc/passwd");
    let fd = sys(NR_OPEN, &[pf, O_CREAT | O_RDWR, 0o644]);
    assert_eq!(sys(NR_WRITE, &[fd as usize, b"r".as_ptr() as usize, 1]), 1);
    sys(NR_CLOSE, &[fd as usize]);

    let mut st = [0u8; 64];
    assert_eq!(sys(NR_STAT, &[pf, st.as_mut_ptr() as usize]), 0);
    let size = u32::from_le_bytes([st[20], st[21], st[22], st[23]]);
    assert_eq!(size, 1, "st_size records the write");

    // getdents over /etc finds ".", ".." and "passwd".
    let dfd = sys(NR_OPEN, &[pd, 0, 0]) as usize;
    let mut dents = [0u8; 256];
    let n = sys(NR_GETDENTS, &[dfd, dents.as_mut_ptr() as usize, dents.len()]);
    assert!(n > 0);
    let names: Vec<String> = parse_dirents(&dents[..n as usize]);
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));
    assert!(names.contains(&"passwd".to_string()));
}

fn parse_dirents(mut raw: &[u8]) -> Vec<String> {
    let mut out = Vec::new();
    while raw.len() >= 10 {
        let reclen = u16::from_le_bytes([raw[8], raw[9]]) as usize;
        if reclen == 0 || reclen > raw.len() {
            break;
        }
        let name = raw[10..reclen]
            .iter()
            .take_while(|&&b| b != 0)
            .copied()
            .collect::<Vec<u8>>();
        out.push(String::from_utf8(name).unwrap());
        raw = &raw[reclen..];
    }
    out
}

#[test]
fn kill_minus_one_via_syscall_spares_init_and_caller() {
    let _k = boot_kernel();
    let a = sys(NR_FORK, &[]);
    let b = sys(NR_FORK, &[]);
    assert!(a > 0 && b > 0);

    assert_eq!(sys(NR_KILL, &[usize::MAX, SIGTERM as usize]), 0);
    with_proc(|t| {
        let init_pending = t.get(INIT).sigpending;
        assert_eq!(init_pending & sigmask(SIGTERM), 0, "caller (init) spared");
        for pid in [a, b] {
            let s = t.find_pid(pid as i32).unwrap();
            assert_ne!(t.get(s).sigpending & sigmask(SIGTERM), 0);
        }
    });
}

#[test]
fn brk_and_mmap_manage_the_address_space() {
    let _k = boot_kernel();
    with_proc(|t| {
        let p = t.current_mut();
        p.vmas.brk_lower = 0x0810_0000;
        p.vmas.brk = 0x0810_0000;
    });
    assert_eq!(sys(NR_BRK, &[0]), 0x0810_0000);
    assert_eq!(sys(NR_BRK, &[0x0810_4000]), 0x0810_4000);
    // A failing grow leaves the break untouched.
    assert_eq!(sys(NR_BRK, &[0x0800_0000]), 0x0810_4000);

    // Anonymous private mapping lands at the 1 GiB base.
    let addr = sys(NR_MMAP2, &[0, 0x2000, 3, 0x22, usize::MAX, 0]);
    assert_eq!(addr, 0x4000_0000);
    assert_eq!(sys(NR_MUNMAP, &[addr as usize, 0x2000]), 0);
    with_proc(|t| {
        assert!(t.current().vmas.find_region(0x4000_0000).is_none());
    });
}

#[test]
fn getpid_and_unknown_syscall() {
    let _k = boot_kernel();
    assert_eq!(sys(NR_GETPID, &[]), 1);
    assert_eq!(sys(200, &[]), Errno::ENOSYS.as_neg());
}
