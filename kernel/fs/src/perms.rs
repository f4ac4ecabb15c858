//! Permission checks.
//!
//! Classic uid/gid/other class selection with a root override. The
//! `use_real` flag implements `access(2)` semantics, where the real
//! rather than the effective ids decide; write access additionally
//! respects a read-only mount.

use baryon_core::{Errno, Result};
use bitflags::bitflags;

use crate::inode::Inode;

/// Supplementary groups carried per process.
pub const NGROUPS_MAX: usize = 32;

bitflags! {
    /// Requested access, in permission-bit order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        /// Execute / search.
        const EXEC = 1;
        /// Write.
        const WRITE = 2;
        /// Read.
        const READ = 4;
    }
}

/// The credentials a permission check runs under.
#[derive(Debug, Clone, Copy)]
pub struct Cred {
    /// Real user id.
    pub uid: u16,
    /// Effective user id.
    pub euid: u16,
    /// Real group id.
    pub gid: u16,
    /// Effective group id.
    pub egid: u16,
    /// Supplementary groups (first `ngroups` entries are valid).
    pub groups: [u16; NGROUPS_MAX],
    /// Number of valid supplementary groups.
    pub ngroups: usize,
}

impl Cred {
    /// Root credentials.
    #[must_use]
    pub const fn root() -> Self {
        Self {
            uid: 0,
            euid: 0,
            gid: 0,
            egid: 0,
            groups: [0; NGROUPS_MAX],
            ngroups: 0,
        }
    }

    /// True if `gid` is the effective group or a supplementary one.
    #[must_use]
    pub fn in_group(&self, gid: u16, use_real: bool) -> bool {
        let primary = if use_real { self.gid } else { self.egid };
        primary == gid || self.groups[..self.ngroups].contains(&gid)
    }
}

/// Checks `want` access to `inode` under `cred`.
///
/// `rdonly_mount` is the mount's read-only flag; `use_real` selects the
/// real ids (`access(2)`, `PF_USEREAL`).
pub fn check_permission(
    inode: &Inode,
    cred: &Cred,
    want: Access,
    use_real: bool,
    rdonly_mount: bool,
) -> Result<()> {
    if want.contains(Access::WRITE) && rdonly_mount {
        return Err(Errno::EROFS);
    }

    let uid = if use_real { cred.uid } else { cred.euid };
    if uid == 0 {
        // Root passes everything except exec on a file with no exec
        // bit at all.
        if want.contains(Access::EXEC) && inode.mode.perms() & 0o111 == 0 && !inode.mode.is_dir() {
            return Err(Errno::EACCES);
        }
        return Ok(());
    }

    let perms = inode.mode.perms();
    let class = if uid == inode.uid {
        (perms >> 6) & 0o7
    } else if cred.in_group(inode.gid, use_real) {
        (perms >> 3) & 0o7
    } else {
        perms & 0o7
    };

    if class & u16::from(want.bits()) == u16::from(want.bits()) {
        Ok(())
    } else {
        Err(Errno::EACCES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{FileMode, S_IFDIR, S_IFREG};

    fn inode(mode: FileMode, uid: u16, gid: u16) -> Inode {
        let mut i = Inode {
            mode,
            uid,
            gid,
            ..test_inode()
        };
        i.nlink = 1;
        i
    }

    fn test_inode() -> Inode {
        // A bare in-use record for permission checks only.
        let mut table = crate::inode::InodeTable::new(1);
        let idx = table
            .alloc(baryon_core::id::DevId::NONE, 1, None)
            .unwrap();
        table.get(idx).clone()
    }

    fn user(uid: u16, gid: u16) -> Cred {
        Cred {
            uid,
            euid: uid,
            gid,
            egid: gid,
            groups: [0; NGROUPS_MAX],
            ngroups: 0,
        }
    }

    #[test]
    fn owner_group_other_classes() {
        let i = inode(FileMode::new(S_IFREG, 0o640), 100, 50);

        // Owner: read+write, no exec.
        assert!(check_permission(&i, &user(100, 1), Access::READ | Access::WRITE, false, false).is_ok());
        assert!(check_permission(&i, &user(100, 1), Access::EXEC, false, false).is_err());

        // Group: read only.
        assert!(check_permission(&i, &user(7, 50), Access::READ, false, false).is_ok());
        assert!(check_permission(&i, &user(7, 50), Access::WRITE, false, false).is_err());

        // Other: nothing.
        assert_eq!(
            check_permission(&i, &user(7, 7), Access::READ, false, false).unwrap_err(),
            Errno::EACCES
        );
    }

    #[test]
    fn supplementary_groups_count() {
        let i = inode(FileMode::new(S_IFREG, 0o040), 100, 50);
        let mut c = user(7, 7);
        c.groups[0] = 50;
        c.ngroups = 1;
        assert!(check_permission(&i, &c, Access::READ, false, false).is_ok());
    }

    #[test]
    fn root_override_and_exec_exception() {
        let secret = inode(FileMode::new(S_IFREG, 0o000), 100, 100);
        assert!(check_permission(&secret, &Cred::root(), Access::READ | Access::WRITE, false, false).is_ok());
        // No exec bit anywhere: even root cannot exec a regular file.
        assert!(check_permission(&secret, &Cred::root(), Access::EXEC, false, false).is_err());
        // Directories search fine for root regardless.
        let dir = inode(FileMode::new(S_IFDIR, 0o000), 100, 100);
        assert!(check_permission(&dir, &Cred::root(), Access::EXEC, false, false).is_ok());
    }

    #[test]
    fn use_real_selects_real_ids() {
        let i = inode(FileMode::new(S_IFREG, 0o600), 100, 50);
        // euid matches the owner but the real uid does not.
        let mut c = user(7, 7);
        c.euid = 100;
        assert!(check_permission(&i, &c, Access::READ, false, false).is_ok());
        assert_eq!(
            check_permission(&i, &c, Access::READ, true, false).unwrap_err(),
            Errno::EACCES
        );
    }

    #[test]
    fn readonly_mount_blocks_writes() {
        let i = inode(FileMode::new(S_IFREG, 0o666), 100, 50);
        assert_eq!(
            check_permission(&i, &user(100, 50), Access::WRITE, false, true).unwrap_err(),
            Errno::EROFS
        );
        assert!(check_permission(&i, &user(100, 50), Access::READ, false, true).is_ok());
    }
}
