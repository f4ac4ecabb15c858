//! Syscall dispatch.
//!
//! A numbered table compatible with the Linux 2.0/2.2 ABI on i386:
//! `int 0x80` with the number in EAX and up to five arguments in
//! EBX..EDI (a sixth in EBP with the `ebp-arg` build feature). The
//! result goes back in EAX verbatim — non-negative for success,
//! `-errno` for failure. A slot with no handler answers `ENOSYS`.
//!
//! `ERESTART` never reaches user space: the trap return path converts
//! it to a rewound `int 0x80` when the interrupting signal's action has
//! `SA_RESTART`, and to `EINTR` otherwise.

pub mod fs;
pub mod info;
pub mod mm;
pub mod proc;
pub mod sig;
pub mod userptr;

#[cfg(test)]
mod tests_e2e;

use baryon_core::Errno;

/// Syscall numbers 0..=255 are routable.
pub const NR_SYSCALLS: usize = 256;

/// A syscall handler: up to six register arguments, result in EAX
/// encoding.
pub type SyscallFn = fn(usize, usize, usize, usize, usize, usize) -> isize;

/// One table slot.
#[derive(Clone, Copy)]
pub struct SyscallEntry {
    /// The traditional name, for tracing.
    pub name: &'static str,
    /// The handler.
    pub handler: SyscallFn,
}

macro_rules! syscall_table {
    ($($nr:expr => $name:literal $handler:path),+ $(,)?) => {{
        let mut table: [Option<SyscallEntry>; NR_SYSCALLS] = [None; NR_SYSCALLS];
        $(
            table[$nr] = Some(SyscallEntry {
                name: $name,
                handler: $handler,
            });
        )+
        table
    }};
}

/// The dispatch table, Linux i386 numbering.
pub static SYSCALL_TABLE: [Option<SyscallEntry>; NR_SYSCALLS] = syscall_table! {
    1 => "exit" proc::sys_exit,
    2 => "fork" proc::sys_fork,
    3 => "read" fs::sys_read,
    4 => "write" fs::sys_write,
    5 => "open" fs::sys_open,
    6 => "close" fs::sys_close,
    7 => "waitpid" proc::sys_waitpid,
    8 => "creat" fs::sys_creat,
    9 => "link" fs::sys_link,
    10 => "unlink" fs::sys_unlink,
    12 => "chdir" fs::sys_chdir,
    13 => "time" info::sys_time,
    14 => "mknod" fs::sys_mknod,
    15 => "chmod" fs::sys_chmod,
    19 => "lseek" fs::sys_lseek,
    20 => "getpid" proc::sys_getpid,
    21 => "mount" fs::sys_mount,
    22 => "umount" fs::sys_umount,
    23 => "setuid" proc::sys_setuid,
    24 => "getuid" proc::sys_getuid,
    25 => "stime" info::sys_stime,
    27 => "alarm" proc::sys_alarm,
    29 => "pause" proc::sys_pause,
    30 => "utime" fs::sys_utime,
    33 => "access" fs::sys_access,
    36 => "sync" fs::sys_sync,
    37 => "kill" sig::sys_kill,
    38 => "rename" fs::sys_rename,
    39 => "mkdir" fs::sys_mkdir,
    40 => "rmdir" fs::sys_rmdir,
    41 => "dup" fs::sys_dup,
    42 => "pipe" fs::sys_pipe,
    43 => "times" info::sys_times,
    45 => "brk" mm::sys_brk,
    46 => "setgid" proc::sys_setgid,
    47 => "getgid" proc::sys_getgid,
    48 => "signal" sig::sys_signal,
    49 => "geteuid" proc::sys_geteuid,
    50 => "getegid" proc::sys_getegid,
    52 => "umount2" fs::sys_umount2,
    54 => "ioctl" fs::sys_ioctl,
    55 => "fcntl" fs::sys_fcntl,
    57 => "setpgid" proc::sys_setpgid,
    60 => "umask" proc::sys_umask,
    61 => "chroot" fs::sys_chroot,
    63 => "dup2" fs::sys_dup2,
    64 => "getppid" proc::sys_getppid,
    65 => "getpgrp" proc::sys_getpgrp,
    66 => "setsid" proc::sys_setsid,
    67 => "sigaction" sig::sys_sigaction,
    68 => "sgetmask" sig::sys_sgetmask,
    69 => "ssetmask" sig::sys_ssetmask,
    70 => "setreuid" proc::sys_setreuid,
    71 => "setregid" proc::sys_setregid,
    72 => "sigsuspend" sig::sys_sigsuspend,
    73 => "sigpending" sig::sys_sigpending,
    74 => "sethostname" info::sys_sethostname,
    75 => "setrlimit" proc::sys_setrlimit,
    76 => "getrlimit" proc::sys_getrlimit,
    77 => "getrusage" proc::sys_getrusage,
    78 => "gettimeofday" info::sys_gettimeofday,
    79 => "settimeofday" info::sys_settimeofday,
    80 => "getgroups" proc::sys_getgroups,
    81 => "setgroups" proc::sys_setgroups,
    83 => "symlink" fs::sys_symlink,
    85 => "readlink" fs::sys_readlink,
    88 => "reboot" info::sys_reboot,
    90 => "mmap" mm::sys_old_mmap,
    91 => "munmap" mm::sys_munmap,
    92 => "truncate" fs::sys_truncate,
    93 => "ftruncate" fs::sys_ftruncate,
    94 => "fchmod" fs::sys_fchmod,
    95 => "fchown" fs::sys_fchown,
    96 => "getpriority" proc::sys_getpriority,
    97 => "setpriority" proc::sys_setpriority,
    99 => "statfs" fs::sys_statfs,
    100 => "fstatfs" fs::sys_fstatfs,
    101 => "ioperm" info::sys_ioperm,
    102 => "socketcall" info::sys_socketcall,
    104 => "setitimer" proc::sys_setitimer,
    105 => "getitimer" proc::sys_getitimer,
    106 => "stat" fs::sys_stat,
    107 => "lstat" fs::sys_lstat,
    108 => "fstat" fs::sys_fstat,
    110 => "iopl" info::sys_iopl,
    114 => "wait4" proc::sys_wait4,
    116 => "sysinfo" info::sys_sysinfo,
    117 => "ipc" info::sys_ipc,
    118 => "fsync" fs::sys_fsync,
    119 => "sigreturn" sig::sys_sigreturn,
    121 => "setdomainname" info::sys_setdomainname,
    122 => "uname" info::sys_uname,
    125 => "mprotect" mm::sys_mprotect,
    126 => "sigprocmask" sig::sys_sigprocmask,
    132 => "getpgid" proc::sys_getpgid,
    133 => "fchdir" fs::sys_fchdir,
    136 => "personality" proc::sys_personality,
    140 => "_llseek" fs::sys_llseek,
    141 => "getdents" fs::sys_getdents,
    142 => "_newselect" fs::sys_select,
    143 => "flock" fs::sys_flock,
    147 => "getsid" proc::sys_getsid,
    148 => "fdatasync" fs::sys_fsync,
    162 => "nanosleep" proc::sys_nanosleep,
    182 => "chown" fs::sys_chown,
    183 => "getcwd" fs::sys_getcwd,
    192 => "mmap2" mm::sys_mmap2,
    193 => "truncate64" fs::sys_truncate64,
    194 => "ftruncate64" fs::sys_ftruncate64,
    195 => "stat64" fs::sys_stat64,
    196 => "lstat64" fs::sys_lstat64,
    197 => "fstat64" fs::sys_fstat64,
    219 => "madvise" mm::sys_madvise,
    220 => "getdents64" fs::sys_getdents,
    221 => "fcntl64" fs::sys_fcntl,
};

/// Dispatches one syscall.
///
/// `a6` comes from EBP and is only populated under the `ebp-arg`
/// build feature; without it the entry stub passes zero.
#[must_use]
pub fn dispatch(nr: usize, a1: usize, a2: usize, a3: usize, a4: usize, a5: usize, a6: usize) -> isize {
    let Some(entry) = SYSCALL_TABLE.get(nr).and_then(|e| e.as_ref()) else {
        return Errno::ENOSYS.as_neg();
    };
    (entry.handler)(a1, a2, a3, a4, a5, a6)
}

/// Flattens a kernel result into the EAX encoding.
pub(crate) fn ret(res: baryon_core::Result<isize>) -> isize {
    match res {
        Ok(v) => v,
        Err(e) => e.as_neg(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_numbers_answer_enosys() {
        assert_eq!(dispatch(0, 0, 0, 0, 0, 0, 0), Errno::ENOSYS.as_neg());
        assert_eq!(dispatch(255, 0, 0, 0, 0, 0, 0), Errno::ENOSYS.as_neg());
        assert_eq!(dispatch(9999, 0, 0, 0, 0, 0, 0), Errno::ENOSYS.as_neg());
    }

    #[test]
    fn classic_numbers_are_wired() {
        for (nr, name) in [
            (1, "exit"),
            (2, "fork"),
            (3, "read"),
            (4, "write"),
            (5, "open"),
            (6, "close"),
            (11, "execve"),
            (114, "wait4"),
            (119, "sigreturn"),
        ] {
            match SYSCALL_TABLE[nr] {
                Some(e) if nr != 11 => assert_eq!(e.name, name),
                // execve needs the ELF loader, an external collaborator;
                // its slot stays ENOSYS here.
                _ => assert_eq!(nr, 11, "slot {nr} ({name}) must be wired"),
            }
        }
    }
}
