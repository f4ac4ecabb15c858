//! Signal syscalls.

use baryon_core::{Errno, Result};

use crate::proc::sleep::{SleepKind, sleep};
use crate::proc::{Process, with_proc};
use crate::signal::{Handler, NSIG, SIG_BLOCKABLE, SIGKILL, SIGSTOP, SaFlags, SigAction};
use crate::syscall::ret;
use crate::syscall::userptr::{copy_from_user, copy_to_user};

const SIG_DFL: usize = 0;
const SIG_IGN: usize = 1;

const SIG_BLOCK: usize = 0;
const SIG_UNBLOCK: usize = 1;
const SIG_SETMASK: usize = 2;

fn check_signum(sig: usize) -> Result<i32> {
    let sig = sig as i32;
    if !(1..NSIG as i32).contains(&sig) {
        return Err(Errno::EINVAL);
    }
    Ok(sig)
}

fn handler_from_raw(raw: usize) -> Handler {
    match raw {
        SIG_DFL => Handler::Default,
        SIG_IGN => Handler::Ignore,
        addr => Handler::User(addr as u32),
    }
}

fn handler_to_raw(h: Handler) -> u32 {
    match h {
        Handler::Default => SIG_DFL as u32,
        Handler::Ignore => SIG_IGN as u32,
        Handler::User(addr) => addr,
    }
}

/// `kill(2)`.
pub fn sys_kill(pid: usize, sig: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret(with_proc(|t| {
        let me = t.current;
        crate::signal::kill(t, me, pid as i32, sig as i32)?;
        Ok(0)
    }))
}

/// `signal(2)`: the old single-handler interface; installs with
/// `SA_RESETHAND | SA_NODEFER` semantics, per the historic ABI.
pub fn sys_signal(sig: usize, handler: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let sig = check_signum(sig)?;
        if sig == SIGKILL || sig == SIGSTOP {
            return Err(Errno::EINVAL);
        }
        with_proc(|t| {
            let p = t.current_mut();
            let old = p.sigactions[sig as usize].handler;
            p.sigactions[sig as usize] = SigAction {
                handler: handler_from_raw(handler),
                mask: 0,
                flags: SaFlags::RESETHAND | SaFlags::NODEFER,
                restorer: 0,
            };
            Ok(handler_to_raw(old) as isize)
        })
    })())
}

/// The user-space `sigaction` record: handler, mask, flags, restorer.
const SIGACTION_SIZE: usize = 16;

/// `sigaction(2)`.
pub fn sys_sigaction(sig: usize, act: usize, oldact: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let sig = check_signum(sig)?;
        let old = with_proc(|t| t.current().sigactions[sig as usize]);
        if oldact != 0 {
            let mut out = [0u8; SIGACTION_SIZE];
            out[..4].copy_from_slice(&handler_to_raw(old.handler).to_le_bytes());
            out[4..8].copy_from_slice(&old.mask.to_le_bytes());
            out[8..12].copy_from_slice(&old.flags.bits().to_le_bytes());
            out[12..].copy_from_slice(&old.restorer.to_le_bytes());
            with_proc(|t| copy_to_user(&t.current().vmas, oldact, &out))?;
        }
        if act != 0 {
            if sig == SIGKILL || sig == SIGSTOP {
                return Err(Errno::EINVAL);
            }
            let mut raw = [0u8; SIGACTION_SIZE];
            with_proc(|t| copy_from_user(&t.current().vmas, act, &mut raw))?;
            let handler = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
            let mask = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
            let flags = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
            let restorer = u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]);
            with_proc(|t| {
                let p = t.current_mut();
                p.sigactions[sig as usize] = SigAction {
                    handler: handler_from_raw(handler),
                    mask: mask & SIG_BLOCKABLE,
                    flags: SaFlags::from_bits_truncate(flags),
                    restorer,
                };
            });
        }
        Ok(0)
    })())
}

/// `sigprocmask(2)`.
pub fn sys_sigprocmask(how: usize, set: usize, oldset: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let old = with_proc(|t| t.current().sigblocked);
        if oldset != 0 {
            with_proc(|t| copy_to_user(&t.current().vmas, oldset, &old.to_le_bytes()))?;
        }
        if set != 0 {
            let mut raw = [0u8; 4];
            with_proc(|t| copy_from_user(&t.current().vmas, set, &mut raw))?;
            let mask = u32::from_le_bytes(raw) & SIG_BLOCKABLE;
            with_proc(|t| {
                let p = t.current_mut();
                match how {
                    SIG_BLOCK => p.sigblocked |= mask,
                    SIG_UNBLOCK => p.sigblocked &= !mask,
                    SIG_SETMASK => p.sigblocked = mask,
                    _ => return Err(Errno::EINVAL),
                }
                Ok(())
            })?;
        }
        Ok(0)
    })())
}

/// `sigpending(2)`.
pub fn sys_sigpending(set: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    ret((|| {
        let pending = with_proc(|t| {
            let p = t.current();
            p.sigpending & p.sigblocked
        });
        with_proc(|t| copy_to_user(&t.current().vmas, set, &pending.to_le_bytes()))?;
        Ok(0)
    })())
}

/// `sgetmask(2)`.
pub fn sys_sgetmask(_a1: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| t.current().sigblocked as isize)
}

/// `ssetmask(2)`.
pub fn sys_ssetmask(mask: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    with_proc(|t| {
        let p = t.current_mut();
        let old = p.sigblocked;
        p.sigblocked = mask as u32 & SIG_BLOCKABLE;
        old as isize
    })
}

/// `sigsuspend(2)`: swap the mask, sleep until a signal, restore.
pub fn sys_sigsuspend(mask: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    let old = with_proc(|t| {
        let p = t.current_mut();
        let old = p.sigblocked;
        p.sigblocked = mask as u32 & SIG_BLOCKABLE;
        old
    });
    loop {
        let sig = with_proc(|t| {
            let me = t.current;
            sleep(t, Process::channel(me), SleepKind::Interruptible)
        });
        if sig != 0 {
            break;
        }
        #[cfg(not(target_os = "none"))]
        break;
    }
    with_proc(|t| t.current_mut().sigblocked = old);
    Errno::EINTR.as_neg()
}

/// `sigreturn(2)`: the trampoline's way back.
///
/// The architecture layer rebuilds the trap frame from the returned
/// context; here only the signal bookkeeping and the saved in-flight
/// result are handled.
pub fn sys_sigreturn(sig: usize, _a2: usize, _a3: usize, _a4: usize, _a5: usize, _a6: usize) -> isize {
    match with_proc(|t| {
        let me = t.current;
        crate::signal::sigreturn(t, me, sig as i32)
    }) {
        Ok((_context, saved_result)) => {
            #[cfg(target_os = "none")]
            crate::arch::restore_sigcontext(&_context);
            saved_result
        }
        Err(e) => e.as_neg(),
    }
}
