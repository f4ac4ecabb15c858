//! Multiboot 1 boot-information parsing.
//!
//! The bootloader leaves an info structure in low memory: flags, the
//! memory bounds, the boot device, the command line, the module list
//! (the initrd arrives this way) and the BIOS memory map. Parsing
//! walks raw little-endian words out of a flat view of physical
//! memory, so it runs against a synthetic image on the host.

use alloc::string::String;
use alloc::vec::Vec;

use baryon_core::{Errno, Result};

/// `flags` bit: `mem_lower`/`mem_upper` are valid.
pub const MB_INFO_MEMORY: u32 = 1 << 0;
/// `flags` bit: `boot_device` is valid.
pub const MB_INFO_BOOTDEV: u32 = 1 << 1;
/// `flags` bit: `cmdline` is valid.
pub const MB_INFO_CMDLINE: u32 = 1 << 2;
/// `flags` bit: the module list is valid.
pub const MB_INFO_MODS: u32 = 1 << 3;
/// `flags` bit: the memory map is valid.
pub const MB_INFO_MMAP: u32 = 1 << 6;

/// An entry of the BIOS memory map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapEntry {
    /// Range base.
    pub base: u64,
    /// Range length in bytes.
    pub len: u64,
    /// BIOS type: 1 means available RAM.
    pub kind: u32,
}

impl MmapEntry {
    /// True for usable RAM.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.kind == 1
    }
}

/// A boot module (the initrd image).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Module {
    /// Physical start of the module.
    pub start: u32,
    /// Physical end (exclusive).
    pub end: u32,
    /// The module string the loader attached.
    pub string: String,
}

/// The parsed boot information.
#[derive(Debug, Default, Clone)]
pub struct MultibootInfo {
    /// Conventional memory below 1 MiB, in KiB.
    pub mem_lower: u32,
    /// Extended memory above 1 MiB, in KiB.
    pub mem_upper: u32,
    /// BIOS boot device, if reported.
    pub boot_device: Option<u32>,
    /// The kernel command line.
    pub cmdline: String,
    /// Boot modules.
    pub modules: Vec<Module>,
    /// The BIOS memory map.
    pub mmap: Vec<MmapEntry>,
}

/// A flat view of physical memory holding the info structure.
pub struct BootImage<'a> {
    bytes: &'a [u8],
    base: u32,
}

impl<'a> BootImage<'a> {
    /// Wraps `bytes`, which represent physical memory starting at
    /// `base`.
    #[must_use]
    pub fn new(bytes: &'a [u8], base: u32) -> Self {
        Self { bytes, base }
    }

    fn slice(&self, addr: u32, len: usize) -> Result<&'a [u8]> {
        let off = addr.checked_sub(self.base).ok_or(Errno::EFAULT)? as usize;
        self.bytes.get(off..off + len).ok_or(Errno::EFAULT)
    }

    fn u32_at(&self, addr: u32) -> Result<u32> {
        let b = self.slice(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64_at(&self, addr: u32) -> Result<u64> {
        Ok(u64::from(self.u32_at(addr)?) | (u64::from(self.u32_at(addr + 4)?) << 32))
    }

    fn cstr_at(&self, addr: u32) -> Result<String> {
        let off = addr.checked_sub(self.base).ok_or(Errno::EFAULT)? as usize;
        let tail = self.bytes.get(off..).ok_or(Errno::EFAULT)?;
        let len = tail.iter().position(|&b| b == 0).ok_or(Errno::EFAULT)?;
        core::str::from_utf8(&tail[..len])
            .map(String::from)
            .map_err(|_| Errno::EINVAL)
    }
}

impl MultibootInfo {
    /// Parses the info structure at `info_addr`.
    pub fn parse(image: &BootImage<'_>, info_addr: u32) -> Result<Self> {
        let flags = image.u32_at(info_addr)?;
        let mut info = Self::default();

        if flags & MB_INFO_MEMORY != 0 {
            info.mem_lower = image.u32_at(info_addr + 4)?;
            info.mem_upper = image.u32_at(info_addr + 8)?;
        }
        if flags & MB_INFO_BOOTDEV != 0 {
            info.boot_device = Some(image.u32_at(info_addr + 12)?);
        }
        if flags & MB_INFO_CMDLINE != 0 {
            let ptr = image.u32_at(info_addr + 16)?;
            info.cmdline = image.cstr_at(ptr)?;
        }
        if flags & MB_INFO_MODS != 0 {
            let count = image.u32_at(info_addr + 20)?;
            let addr = image.u32_at(info_addr + 24)?;
            for i in 0..count {
                let m = addr + i * 16;
                info.modules.push(Module {
                    start: image.u32_at(m)?,
                    end: image.u32_at(m + 4)?,
                    string: {
                        let p = image.u32_at(m + 8)?;
                        if p == 0 {
                            String::new()
                        } else {
                            image.cstr_at(p)?
                        }
                    },
                });
            }
        }
        if flags & MB_INFO_MMAP != 0 {
            let length = image.u32_at(info_addr + 44)?;
            let addr = image.u32_at(info_addr + 48)?;
            let mut at = addr;
            // Each entry is preceded by its own size word (not counting
            // the word itself).
            while at < addr + length {
                let size = image.u32_at(at)?;
                info.mmap.push(MmapEntry {
                    base: image.u64_at(at + 4)?,
                    len: image.u64_at(at + 12)?,
                    kind: image.u32_at(at + 20)?,
                });
                at += size + 4;
            }
        }
        Ok(info)
    }

    /// Total available RAM according to the memory map, falling back to
    /// the mem bounds when no map was passed.
    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        if self.mmap.is_empty() {
            return (u64::from(self.mem_lower) + u64::from(self.mem_upper)) * 1024;
        }
        self.mmap
            .iter()
            .filter(|e| e.is_available())
            .map(|e| e.len)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a synthetic multiboot info image at base 0x10000.
    fn build_image() -> (Vec<u8>, u32, u32) {
        const BASE: u32 = 0x10000;
        let mut img = alloc::vec![0u8; 4096];
        let put32 = |img: &mut Vec<u8>, addr: u32, v: u32| {
            let o = (addr - BASE) as usize;
            img[o..o + 4].copy_from_slice(&v.to_le_bytes());
        };
        let put_str = |img: &mut Vec<u8>, addr: u32, s: &str| {
            let o = (addr - BASE) as usize;
            img[o..o + s.len()].copy_from_slice(s.as_bytes());
            img[o + s.len()] = 0;
        };

        let info = BASE;
        let cmdline_at = BASE + 0x100;
        let mods_at = BASE + 0x140;
        let modstr_at = BASE + 0x180;
        let mmap_at = BASE + 0x200;

        put32(
            &mut img,
            info,
            MB_INFO_MEMORY | MB_INFO_CMDLINE | MB_INFO_MODS | MB_INFO_MMAP,
        );
        put32(&mut img, info + 4, 640); // mem_lower KiB
        put32(&mut img, info + 8, 31744); // mem_upper KiB
        put32(&mut img, info + 16, cmdline_at);
        put32(&mut img, info + 20, 1); // mods_count
        put32(&mut img, info + 24, mods_at);
        put32(&mut img, info + 44, 2 * 24); // mmap_length
        put32(&mut img, info + 48, mmap_at);

        put_str(&mut img, cmdline_at, "root=/dev/ram0 ro console=/dev/tty1");

        put32(&mut img, mods_at, 0x0080_0000);
        put32(&mut img, mods_at + 4, 0x0090_0000);
        put32(&mut img, mods_at + 8, modstr_at);
        put_str(&mut img, modstr_at, "initrd");

        // Two mmap entries: low RAM available, a hole reserved.
        let e = |img: &mut Vec<u8>, at: u32, base: u64, len: u64, kind: u32| {
            put32(img, at, 20); // entry size, excluding this word
            put32(img, at + 4, base as u32);
            put32(img, at + 8, (base >> 32) as u32);
            put32(img, at + 12, len as u32);
            put32(img, at + 16, (len >> 32) as u32);
            put32(img, at + 20, kind);
        };
        e(&mut img, mmap_at, 0, 640 * 1024, 1);
        e(&mut img, mmap_at + 24, 0x0010_0000, 31 * 1024 * 1024, 1);

        (img, BASE, info)
    }

    #[test]
    fn parses_a_full_info_block() {
        let (img, base, info_addr) = build_image();
        let image = BootImage::new(&img, base);
        let info = MultibootInfo::parse(&image, info_addr).unwrap();

        assert_eq!(info.mem_lower, 640);
        assert_eq!(info.mem_upper, 31744);
        assert_eq!(info.cmdline, "root=/dev/ram0 ro console=/dev/tty1");
        assert_eq!(info.modules.len(), 1);
        assert_eq!(info.modules[0].start, 0x0080_0000);
        assert_eq!(info.modules[0].string, "initrd");
        assert_eq!(info.mmap.len(), 2);
        assert!(info.mmap.iter().all(MmapEntry::is_available));
        assert_eq!(
            info.available_bytes(),
            640 * 1024 + 31 * 1024 * 1024
        );

        // And the cmdline feeds the option parser.
        let (opts, unknown) = crate::config::BootOptions::parse(&info.cmdline);
        assert_eq!(unknown, 0);
        assert!(opts.readonly);
        assert_eq!(opts.root.unwrap(), "/dev/ram0");
    }

    #[test]
    fn truncated_image_is_efault() {
        let (img, base, info_addr) = build_image();
        let image = BootImage::new(&img[..8], base);
        assert!(MultibootInfo::parse(&image, info_addr).is_err());
        // A pointer below the image base is caught too.
        let image = BootImage::new(&img, base);
        assert_eq!(image.u32_at(base - 4).unwrap_err(), Errno::EFAULT);
    }
}
