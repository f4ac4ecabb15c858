//! Anonymous pipes.
//!
//! A kernel-mounted pseudo-filesystem whose inodes are circular byte
//! buffers. `pipe(2)` allocates one inode and opens it twice — a read
//! end and a write end — so the reader/writer accounting hangs off the
//! open flags. Writes of up to [`PIPE_BUF`] bytes are atomic: they wait
//! for space for the whole chunk rather than interleave.
//!
//! [`PIPE_BUF`]: crate::PIPE_BUF

use baryon_core::id::DevId;
use baryon_core::sync::SpinLock;
use baryon_core::{Errno, Result};

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::PIPE_BUF;
use crate::file::OpenFlags;
use crate::fsops::{FsContext, FsDriver, FsFlags, FsType};
use crate::inode::{InodeIdx, iget};
use crate::mode::{FileMode, S_IFIFO};
use crate::superblock::MountIdx;
use crate::wait;

/// Pipe capacity in bytes.
const PIPE_SIZE: usize = 4096;

const _: () = assert!(PIPE_SIZE >= PIPE_BUF);

struct Pipe {
    data: Vec<u8>,
    read_pos: usize,
    count: usize,
    readers: u32,
    writers: u32,
}

impl Pipe {
    fn new() -> Self {
        Self {
            data: alloc::vec![0u8; PIPE_SIZE],
            read_pos: 0,
            count: 0,
            readers: 0,
            writers: 0,
        }
    }

    fn space(&self) -> usize {
        PIPE_SIZE - self.count
    }

    fn push(&mut self, buf: &[u8]) -> usize {
        let n = buf.len().min(self.space());
        for (i, &b) in buf[..n].iter().enumerate() {
            let pos = (self.read_pos + self.count + i) % PIPE_SIZE;
            self.data[pos] = b;
        }
        self.count += n;
        n
    }

    fn pull(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.count);
        for item in buf[..n].iter_mut() {
            *item = self.data[self.read_pos];
            self.read_pos = (self.read_pos + 1) % PIPE_SIZE;
        }
        self.count -= n;
        n
    }
}

/// The pipe pseudo-filesystem.
pub struct PipeFs {
    pipes: SpinLock<Vec<Option<Pipe>>>,
}

impl PipeFs {
    fn new() -> Self {
        Self {
            pipes: SpinLock::new(Vec::new()),
        }
    }

    /// The registration record.
    #[must_use]
    pub fn fstype() -> FsType {
        FsType {
            name: "pipefs",
            flags: FsFlags::KERN_MOUNT,
            create: || Ok(Arc::new(PipeFs::new())),
        }
    }

    fn with_pipe<R>(&self, num: u32, f: impl FnOnce(&mut Pipe) -> R) -> Result<R> {
        let mut pipes = self.pipes.lock();
        let p = pipes
            .get_mut(num.wrapping_sub(1) as usize)
            .and_then(|s| s.as_mut())
            .ok_or(Errno::ENXIO)?;
        Ok(f(p))
    }

    /// Wait-channel identity readers of pipe `num` sleep on.
    #[must_use]
    pub fn read_channel(num: u32) -> usize {
        wait::CHANNEL_PIPE_BASE + 2 * num as usize
    }

    /// Wait-channel identity writers of pipe `num` sleep on.
    #[must_use]
    pub fn write_channel(num: u32) -> usize {
        wait::CHANNEL_PIPE_BASE + 2 * num as usize + 1
    }
}

/// Creates a pipe inode on the pipefs mount, referenced once.
///
/// The caller opens it twice (read end, write end) and owns the
/// reference this call returns.
pub fn create_pipe(ctx: &mut FsContext<'_>, sb: MountIdx) -> Result<InodeIdx> {
    let driver = ctx.mounts.driver(sb)?;
    let num = driver.ialloc(ctx, sb, FileMode::new(S_IFIFO, 0o600))?;
    iget(ctx, sb, num)
}

impl FsDriver for PipeFs {
    fn name(&self) -> &'static str {
        "pipefs"
    }

    fn read_superblock(&self, ctx: &mut FsContext<'_>, sb: MountIdx) -> Result<()> {
        // No root directory: pipe inodes are reached only through fds.
        // A nameless volume still needs a root for the mount invariant,
        // so a zero-entry directory stands in.
        let root = ctx.inodes.alloc(ctx.mounts.get(sb)?.dev, u32::MAX, Some(sb))?;
        ctx.inodes.get_mut(root).mode = FileMode::new(crate::mode::S_IFDIR, 0o000);
        ctx.inodes.get_mut(root).nlink = 2;
        ctx.mounts.get_mut(sb)?.root = Some(root);
        Ok(())
    }

    fn read_inode(&self, ctx: &mut FsContext<'_>, ino: InodeIdx) -> Result<()> {
        let num = ctx.inodes.get(ino).num;
        self.with_pipe(num, |_| ())?;
        let i = ctx.inodes.get_mut(ino);
        i.mode = FileMode::new(S_IFIFO, 0o600);
        i.nlink = 1;
        Ok(())
    }

    fn ialloc(&self, _ctx: &mut FsContext<'_>, _sb: MountIdx, _mode: FileMode) -> Result<u32> {
        let mut pipes = self.pipes.lock();
        for (i, slot) in pipes.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(Pipe::new());
                return Ok((i + 1) as u32);
            }
        }
        pipes.push(Some(Pipe::new()));
        Ok(pipes.len() as u32)
    }

    fn ifree(&self, ctx: &mut FsContext<'_>, ino: InodeIdx) -> Result<()> {
        let num = ctx.inodes.get(ino).num;
        let mut pipes = self.pipes.lock();
        if let Some(slot) = pipes.get_mut(num.wrapping_sub(1) as usize) {
            *slot = None;
        }
        Ok(())
    }

    fn open(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, flags: OpenFlags) -> Result<()> {
        let num = ctx.inodes.get(ino).num;
        self.with_pipe(num, |p| {
            if flags.readable() {
                p.readers += 1;
            }
            if flags.writable() {
                p.writers += 1;
            }
        })
    }

    fn release(&self, ctx: &mut FsContext<'_>, ino: InodeIdx, flags: OpenFlags) -> Result<()> {
        let num = ctx.inodes.get(ino).num;
        let drained = self.with_pipe(num, |p| {
            if flags.readable() {
                p.readers = p.readers.saturating_sub(1);
            }
            if flags.writable() {
                p.writers = p.writers.saturating_sub(1);
            }
            p.readers == 0 && p.writers == 0
        })?;
        // Readers blocked on an empty pipe must see EOF; writers must
        // see EPIPE.
        wait::wake_up(Self::read_channel(num));
        wait::wake_up(Self::write_channel(num));
        wait::wake_up(wait::CHANNEL_SELECT);
        if drained {
            ctx.inodes.get_mut(ino).nlink = 0;
        }
        Ok(())
    }

    fn read(
        &self,
        ctx: &mut FsContext<'_>,
        ino: InodeIdx,
        _off: u64,
        buf: &mut [u8],
        flags: OpenFlags,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let num = ctx.inodes.get(ino).num;
        loop {
            enum State {
                Got(usize),
                Eof,
                Empty,
            }
            let state = self.with_pipe(num, |p| {
                if p.count > 0 {
                    State::Got(p.pull(buf))
                } else if p.writers == 0 {
                    State::Eof
                } else {
                    State::Empty
                }
            })?;
            match state {
                State::Got(n) => {
                    wait::wake_up(Self::write_channel(num));
                    wait::wake_up(wait::CHANNEL_SELECT);
                    return Ok(n);
                }
                State::Eof => return Ok(0),
                State::Empty => {
                    if flags.contains(OpenFlags::O_NONBLOCK) {
                        return Err(Errno::EAGAIN);
                    }
                    let sig = wait::sleep_on_interruptible(Self::read_channel(num));
                    if sig != 0 {
                        return Err(Errno::EINTR);
                    }
                }
            }
        }
    }

    fn write(
        &self,
        ctx: &mut FsContext<'_>,
        ino: InodeIdx,
        _off: u64,
        buf: &[u8],
        flags: OpenFlags,
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let num = ctx.inodes.get(ino).num;
        let atomic = buf.len() <= PIPE_BUF;
        let mut written = 0;
        loop {
            enum State {
                Wrote(usize),
                Broken,
                Full,
            }
            let state = self.with_pipe(num, |p| {
                if p.readers == 0 {
                    State::Broken
                } else if atomic && p.space() < buf.len() {
                    // The whole chunk must land in one piece.
                    State::Full
                } else if p.space() == 0 {
                    State::Full
                } else {
                    State::Wrote(p.push(&buf[written..]))
                }
            })?;
            match state {
                State::Broken => return Err(Errno::EPIPE),
                State::Wrote(n) => {
                    written += n;
                    wait::wake_up(Self::read_channel(num));
                    wait::wake_up(wait::CHANNEL_SELECT);
                    if written == buf.len() {
                        return Ok(written);
                    }
                }
                State::Full => {
                    if flags.contains(OpenFlags::O_NONBLOCK) {
                        return if written > 0 {
                            Ok(written)
                        } else {
                            Err(Errno::EAGAIN)
                        };
                    }
                    let sig = wait::sleep_on_interruptible(Self::write_channel(num));
                    if sig != 0 {
                        return if written > 0 {
                            Ok(written)
                        } else {
                            Err(Errno::EINTR)
                        };
                    }
                }
            }
        }
    }

    fn lseek(&self, _ctx: &mut FsContext<'_>, _ino: InodeIdx, _off: u64) -> Result<u64> {
        Err(Errno::ESPIPE)
    }

    fn select(
        &self,
        ctx: &mut FsContext<'_>,
        ino: InodeIdx,
        for_write: bool,
    ) -> Result<bool> {
        let num = ctx.inodes.get(ino).num;
        self.with_pipe(num, |p| {
            if for_write {
                p.space() > 0 || p.readers == 0
            } else {
                p.count > 0 || p.writers == 0
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ramfs::tests::Harness;
    use crate::superblock::{MountFlags, mount};

    fn pipe_harness() -> (Harness, MountIdx) {
        let mut h = Harness::new();
        let mut ctx = h.ctx_parts();
        ctx.mounts.register_fs(PipeFs::fstype()).unwrap();
        let sb = mount(
            &mut ctx,
            "pipefs",
            DevId::new(0xfd, 0),
            None,
            MountFlags::empty(),
        )
        .unwrap();
        (h, sb)
    }

    fn open_both(h: &mut Harness, sb: MountIdx) -> (InodeIdx, Arc<dyn FsDriver>) {
        let mut ctx = h.ctx_parts();
        let ino = create_pipe(&mut ctx, sb).unwrap();
        let driver = ctx.mounts.driver(sb).unwrap();
        driver.open(&mut ctx, ino, OpenFlags::empty()).unwrap();
        driver.open(&mut ctx, ino, OpenFlags::O_WRONLY).unwrap();
        (ino, driver)
    }

    #[test]
    fn bytes_round_trip_in_order() {
        let (mut h, sb) = pipe_harness();
        let (ino, driver) = open_both(&mut h, sb);
        let mut ctx = h.ctx_parts();

        let n = driver
            .write(&mut ctx, ino, 0, b"hello pipe", OpenFlags::O_WRONLY)
            .unwrap();
        assert_eq!(n, 10);
        let mut buf = [0u8; 32];
        let n = driver
            .read(&mut ctx, ino, 0, &mut buf, OpenFlags::empty())
            .unwrap();
        assert_eq!(&buf[..n], b"hello pipe");
    }

    #[test]
    fn atomic_chunk_fits_or_waits() {
        let (mut h, sb) = pipe_harness();
        let (ino, driver) = open_both(&mut h, sb);
        let mut ctx = h.ctx_parts();

        // Fill so that less than PIPE_BUF remains.
        let filler = alloc::vec![0u8; PIPE_SIZE - 100];
        driver
            .write(&mut ctx, ino, 0, &filler, OpenFlags::O_WRONLY | OpenFlags::O_NONBLOCK)
            .unwrap();
        // An atomic chunk larger than the space must not land partially.
        let chunk = [1u8; 200];
        assert_eq!(
            driver
                .write(&mut ctx, ino, 0, &chunk, OpenFlags::O_WRONLY | OpenFlags::O_NONBLOCK)
                .unwrap_err(),
            Errno::EAGAIN
        );

        // Drain and retry: the whole chunk lands.
        let mut sink = alloc::vec![0u8; PIPE_SIZE];
        driver
            .read(&mut ctx, ino, 0, &mut sink, OpenFlags::empty())
            .unwrap();
        assert_eq!(
            driver
                .write(&mut ctx, ino, 0, &chunk, OpenFlags::O_WRONLY | OpenFlags::O_NONBLOCK)
                .unwrap(),
            200
        );
    }

    #[test]
    fn eof_when_writers_close() {
        let (mut h, sb) = pipe_harness();
        let (ino, driver) = open_both(&mut h, sb);
        let mut ctx = h.ctx_parts();

        driver
            .write(&mut ctx, ino, 0, b"tail", OpenFlags::O_WRONLY)
            .unwrap();
        driver.release(&mut ctx, ino, OpenFlags::O_WRONLY).unwrap();

        // Buffered data still drains, then EOF.
        let mut buf = [0u8; 8];
        assert_eq!(
            driver
                .read(&mut ctx, ino, 0, &mut buf, OpenFlags::empty())
                .unwrap(),
            4
        );
        assert_eq!(
            driver
                .read(&mut ctx, ino, 0, &mut buf, OpenFlags::empty())
                .unwrap(),
            0,
            "writer gone and buffer empty means EOF"
        );
    }

    #[test]
    fn epipe_when_readers_close() {
        let (mut h, sb) = pipe_harness();
        let (ino, driver) = open_both(&mut h, sb);
        let mut ctx = h.ctx_parts();

        driver.release(&mut ctx, ino, OpenFlags::empty()).unwrap(); // read end
        assert_eq!(
            driver
                .write(&mut ctx, ino, 0, b"x", OpenFlags::O_WRONLY)
                .unwrap_err(),
            Errno::EPIPE
        );
    }

    #[test]
    fn seek_is_espipe_and_select_reports_state() {
        let (mut h, sb) = pipe_harness();
        let (ino, driver) = open_both(&mut h, sb);
        let mut ctx = h.ctx_parts();

        assert_eq!(driver.lseek(&mut ctx, ino, 0).unwrap_err(), Errno::ESPIPE);
        assert!(!driver.select(&mut ctx, ino, false).unwrap(), "empty: not readable");
        assert!(driver.select(&mut ctx, ino, true).unwrap(), "space: writable");
        driver
            .write(&mut ctx, ino, 0, b"z", OpenFlags::O_WRONLY)
            .unwrap();
        assert!(driver.select(&mut ctx, ino, false).unwrap());
    }

    #[test]
    fn nonblocking_empty_read_is_eagain() {
        let (mut h, sb) = pipe_harness();
        let (ino, driver) = open_both(&mut h, sb);
        let mut ctx = h.ctx_parts();
        let mut buf = [0u8; 4];
        assert_eq!(
            driver
                .read(&mut ctx, ino, 0, &mut buf, OpenFlags::O_NONBLOCK)
                .unwrap_err(),
            Errno::EAGAIN
        );
    }
}
