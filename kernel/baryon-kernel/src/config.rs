//! Kernel sizing constants and boot command-line parsing.

use baryon_core::id::DevId;

/// Timer frequency in ticks per second.
pub const HZ: u32 = 100;

/// Maximum processes.
pub const NR_PROCS: usize = 64;

/// PIDs wrap at this value.
pub const MAX_PID_VALUE: i32 = 32767;

/// Files one process can hold open.
pub const OPEN_MAX: usize = 256;

/// System-wide open-file slots.
pub const NR_OPENS: usize = 1024;

/// Inode table slots.
pub const NR_INODES: usize = 256;

/// Buffer cache slots.
pub const NR_BUFFERS: usize = 256;

/// Default scheduling quantum: 200 ms of ticks.
pub const DEF_PRIORITY: i32 = (20 * HZ / 100) as i32;

/// Load average sampling interval in ticks.
pub const LOAD_FREQ: u32 = 5 * HZ;

/// Dirty-buffer percentage that triggers the flush daemon.
pub const BDFLUSH_PCT: usize = 40;

/// Sleep hash buckets: 10% of the process slots.
pub const SLEEP_BUCKETS: usize = NR_PROCS * 10 / 100;

/// Per-process argv+envp budget for exec, in pages.
pub const ARG_MAX_PAGES: usize = 32;

/// Boot options recognized on the kernel command line.
///
/// Unknown keys are reported by the parser and otherwise ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOptions {
    /// `root=<device>` — root device name (e.g. `/dev/ram0`).
    pub root: Option<heapless_str::Str64>,
    /// `rootfstype=<name>` — filesystem type to mount the root with.
    pub rootfstype: Option<heapless_str::Str64>,
    /// `ro` — mount the root read-only.
    pub readonly: bool,
    /// `console=<tty>` — console device.
    pub console: Option<heapless_str::Str64>,
    /// `initrd=<device>` — initial ramdisk image device.
    pub initrd: Option<heapless_str::Str64>,
    /// `ramdisksize=<KB>` — ramdisk size in kilobytes.
    pub ramdisksize: Option<u32>,
    /// `bgaresolution=<WxHxD>` — framebuffer mode.
    pub bgaresolution: Option<(u32, u32, u32)>,
    /// `kexec_proto=<multiboot1|linux>` — kexec handoff protocol.
    pub kexec_proto: Option<KexecProto>,
    /// `kexec_size=<bytes>` — memory reserved for a kexec image.
    pub kexec_size: Option<u32>,
    /// `kexec_cmdline=<string>` — command line handed to the next
    /// kernel.
    pub kexec_cmdline: Option<heapless_str::Str64>,
}

/// Handoff protocol for `kexec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KexecProto {
    /// Multiboot 1 info structure.
    Multiboot1,
    /// Linux boot protocol.
    Linux,
}

/// Small owned strings for option values, bounded so parsing never
/// allocates.
pub mod heapless_str {
    /// A fixed-capacity string of up to 64 bytes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Str64 {
        buf: [u8; 64],
        len: u8,
    }

    impl Str64 {
        /// Copies `s`, truncating at 64 bytes.
        #[must_use]
        pub fn new(s: &str) -> Self {
            let mut buf = [0u8; 64];
            let len = s.len().min(64);
            buf[..len].copy_from_slice(&s.as_bytes()[..len]);
            Self {
                buf,
                len: len as u8,
            }
        }

        /// The string value.
        #[must_use]
        pub fn as_str(&self) -> &str {
            core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
        }
    }

    impl PartialEq<&str> for Str64 {
        fn eq(&self, other: &&str) -> bool {
            self.as_str() == *other
        }
    }
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            root: None,
            rootfstype: None,
            readonly: false,
            console: None,
            initrd: None,
            ramdisksize: None,
            bgaresolution: None,
            kexec_proto: None,
            kexec_size: None,
            kexec_cmdline: None,
        }
    }
}

impl BootOptions {
    /// Parses a kernel command line.
    ///
    /// Returns the options plus the number of unrecognized keys (the
    /// caller logs them once at boot).
    #[must_use]
    pub fn parse(cmdline: &str) -> (Self, usize) {
        use heapless_str::Str64;

        let mut opts = Self::default();
        let mut unknown = 0;
        for word in cmdline.split_whitespace() {
            let (key, value) = match word.split_once('=') {
                Some((k, v)) => (k, v),
                None => (word, ""),
            };
            match key {
                "root" => opts.root = Some(Str64::new(value)),
                "rootfstype" => opts.rootfstype = Some(Str64::new(value)),
                "ro" => opts.readonly = true,
                "console" => opts.console = Some(Str64::new(value)),
                "initrd" => opts.initrd = Some(Str64::new(value)),
                "ramdisksize" => opts.ramdisksize = value.parse().ok(),
                "bgaresolution" => {
                    let mut it = value.split('x').filter_map(|p| p.parse::<u32>().ok());
                    if let (Some(w), Some(h), Some(d)) = (it.next(), it.next(), it.next()) {
                        opts.bgaresolution = Some((w, h, d));
                    }
                }
                "kexec_proto" => {
                    opts.kexec_proto = match value {
                        "multiboot1" => Some(KexecProto::Multiboot1),
                        "linux" => Some(KexecProto::Linux),
                        _ => None,
                    };
                }
                "kexec_size" => opts.kexec_size = value.parse().ok(),
                "kexec_cmdline" => opts.kexec_cmdline = Some(Str64::new(value)),
                _ => unknown += 1,
            }
        }
        (opts, unknown)
    }

    /// Maps a `root=`/`initrd=` device name to a device number.
    ///
    /// Only the ramdisk devices are block devices the core registers
    /// itself; anything else is resolved by its driver at registration.
    #[must_use]
    pub fn device_for(name: &str) -> Option<DevId> {
        let name = name.strip_prefix("/dev/")?;
        if let Some(n) = name.strip_prefix("ram") {
            let minor: u8 = n.parse().ok()?;
            return Some(DevId::new(1, minor));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cmdline_parses() {
        let (o, unknown) = BootOptions::parse(
            "root=/dev/ram0 rootfstype=ramfs ro console=/dev/ttyS0 \
             ramdisksize=8192 bgaresolution=1024x768x32 \
             kexec_proto=multiboot1 kexec_size=4194304 kexec_cmdline=quiet",
        );
        assert_eq!(unknown, 0);
        assert_eq!(o.root.unwrap(), "/dev/ram0");
        assert_eq!(o.rootfstype.unwrap(), "ramfs");
        assert!(o.readonly);
        assert_eq!(o.console.unwrap(), "/dev/ttyS0");
        assert_eq!(o.ramdisksize, Some(8192));
        assert_eq!(o.bgaresolution, Some((1024, 768, 32)));
        assert_eq!(o.kexec_proto, Some(KexecProto::Multiboot1));
        assert_eq!(o.kexec_size, Some(4_194_304));
        assert_eq!(o.kexec_cmdline.unwrap(), "quiet");
    }

    #[test]
    fn unknown_keys_are_counted_not_fatal() {
        let (o, unknown) = BootOptions::parse("root=/dev/ram0 blink=on turbo");
        assert_eq!(unknown, 2);
        assert_eq!(o.root.unwrap(), "/dev/ram0");
    }

    #[test]
    fn ramdisk_device_names() {
        assert_eq!(BootOptions::device_for("/dev/ram0"), Some(DevId::new(1, 0)));
        assert_eq!(BootOptions::device_for("/dev/ram3"), Some(DevId::new(1, 3)));
        assert_eq!(BootOptions::device_for("/dev/hda"), None);
        assert_eq!(BootOptions::device_for("ram0"), None);
    }

    #[test]
    fn quantum_is_200ms() {
        assert_eq!(DEF_PRIORITY, 20);
        assert_eq!(SLEEP_BUCKETS, 6);
    }
}
