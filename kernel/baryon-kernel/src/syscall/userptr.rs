//! User-pointer validation and copying.
//!
//! Before a syscall touches a user buffer, the whole range must lie
//! inside the caller's mapped regions with the required protection —
//! kernel addresses and unmapped holes fail with `EFAULT` before any
//! dereference. The check itself is pure over the vma list; the raw
//! copies only exist on the bare-metal target, where user memory is
//! mapped through the current page directory.

use baryon_core::{Errno, Result};
use baryon_mm::vma::{Prot, VmaTable};

/// Verifies that `[addr, addr + len)` lies within the caller's vmas
/// with the required protection.
pub fn check_user_area(vmas: &VmaTable, addr: u32, len: u32, write: bool) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len).ok_or(Errno::EFAULT)?;
    if end > baryon_mm::vma::USER_TOP {
        return Err(Errno::EFAULT);
    }
    let need = if write { Prot::WRITE } else { Prot::READ };
    let mut at = addr;
    while at < end {
        let vma = vmas.find_region(at).ok_or(Errno::EFAULT)?;
        if !vma.prot.contains(need) {
            return Err(Errno::EFAULT);
        }
        at = vma.end;
    }
    Ok(())
}

/// Copies bytes in from user space.
///
/// On the target the range is validated against the current process's
/// vmas and read through the live mapping; the host build (tests)
/// reads the caller's own memory directly.
#[cfg(target_os = "none")]
pub fn copy_from_user(vmas: &VmaTable, addr: usize, buf: &mut [u8]) -> Result<()> {
    check_user_area(vmas, addr as u32, buf.len() as u32, false)?;
    // SAFETY: The range was just validated as mapped and readable in
    // the current address space.
    unsafe {
        core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
    }
    Ok(())
}

/// Copies bytes out to user space.
#[cfg(target_os = "none")]
pub fn copy_to_user(vmas: &VmaTable, addr: usize, buf: &[u8]) -> Result<()> {
    check_user_area(vmas, addr as u32, buf.len() as u32, true)?;
    // SAFETY: Validated as mapped and writable.
    unsafe {
        core::ptr::copy_nonoverlapping(buf.as_ptr(), addr as *mut u8, buf.len());
    }
    Ok(())
}

#[cfg(not(target_os = "none"))]
#[allow(clippy::missing_errors_doc, reason = "host shim")]
/// Host shim: reads the caller's own memory (tests pass host pointers).
pub fn copy_from_user(_vmas: &VmaTable, addr: usize, buf: &mut [u8]) -> Result<()> {
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    // SAFETY: Host tests pass pointers to live buffers they own.
    unsafe {
        core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
    }
    Ok(())
}

#[cfg(not(target_os = "none"))]
#[allow(clippy::missing_errors_doc, reason = "host shim")]
/// Host shim: writes the caller's own memory (tests pass host pointers).
pub fn copy_to_user(_vmas: &VmaTable, addr: usize, buf: &[u8]) -> Result<()> {
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    // SAFETY: Host tests pass pointers to live buffers they own.
    unsafe {
        core::ptr::copy_nonoverlapping(buf.as_ptr(), addr as *mut u8, buf.len());
    }
    Ok(())
}

/// Copies a NUL-terminated user string into an owned buffer, capped at
/// `max` bytes ([`ENAMETOOLONG`] beyond it).
///
/// [`ENAMETOOLONG`]: Errno::ENAMETOOLONG
pub fn string_from_user(vmas: &VmaTable, addr: usize, max: usize) -> Result<alloc::string::String> {
    let mut out = alloc::vec::Vec::new();
    let mut at = addr;
    loop {
        let mut byte = [0u8; 1];
        copy_from_user(vmas, at, &mut byte)?;
        if byte[0] == 0 {
            break;
        }
        if out.len() >= max {
            return Err(Errno::ENAMETOOLONG);
        }
        out.push(byte[0]);
        at += 1;
    }
    alloc::string::String::from_utf8(out).map_err(|_| Errno::EINVAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use baryon_mm::vma::{Section, Share, Vma};

    fn mapped(start: u32, end: u32, prot: Prot) -> VmaTable {
        let mut t = VmaTable::new();
        t.insert(Vma {
            start,
            end,
            prot,
            share: Share::Private,
            offset: 0,
            section: Section::Data,
            inode: None,
            open_mode: 0,
        })
        .unwrap();
        t
    }

    #[test]
    fn range_inside_a_region_passes() {
        let t = mapped(0x1000, 0x4000, Prot::READ | Prot::WRITE);
        assert!(check_user_area(&t, 0x1000, 0x3000, true).is_ok());
        assert!(check_user_area(&t, 0x2000, 1, false).is_ok());
    }

    #[test]
    fn unmapped_or_partial_range_faults() {
        let t = mapped(0x1000, 0x2000, Prot::READ);
        assert_eq!(
            check_user_area(&t, 0x0800, 0x100, false).unwrap_err(),
            Errno::EFAULT
        );
        // Runs off the end of the region.
        assert_eq!(
            check_user_area(&t, 0x1800, 0x1000, false).unwrap_err(),
            Errno::EFAULT
        );
    }

    #[test]
    fn write_needs_write_protection() {
        let t = mapped(0x1000, 0x2000, Prot::READ);
        assert!(check_user_area(&t, 0x1000, 4, false).is_ok());
        assert_eq!(
            check_user_area(&t, 0x1000, 4, true).unwrap_err(),
            Errno::EFAULT
        );
    }

    #[test]
    fn kernel_half_and_overflow_fault() {
        let t = mapped(0x1000, 0x2000, Prot::READ | Prot::WRITE);
        assert_eq!(
            check_user_area(&t, 0xC000_0000, 4, false).unwrap_err(),
            Errno::EFAULT
        );
        assert_eq!(
            check_user_area(&t, u32::MAX - 2, 8, false).unwrap_err(),
            Errno::EFAULT
        );
    }

    #[test]
    fn contiguous_regions_satisfy_a_spanning_range() {
        let mut t = mapped(0x1000, 0x2000, Prot::READ);
        t.insert(Vma {
            start: 0x2000,
            end: 0x3000,
            prot: Prot::READ,
            share: Share::Private,
            offset: 0,
            section: Section::Data,
            inode: None,
            open_mode: 0,
        })
        .unwrap();
        assert!(check_user_area(&t, 0x1800, 0x1000, false).is_ok());
    }

    #[test]
    fn string_copy_caps_length() {
        let t = VmaTable::new();
        let s = b"hello\0";
        let got = string_from_user(&t, s.as_ptr() as usize, 64).unwrap();
        assert_eq!(got, "hello");
        let long = b"abcdefgh\0";
        assert_eq!(
            string_from_user(&t, long.as_ptr() as usize, 4).unwrap_err(),
            Errno::ENAMETOOLONG
        );
    }
}
