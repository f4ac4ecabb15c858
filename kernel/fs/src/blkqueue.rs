//! Per-device block request queues.
//!
//! Each block device owns a FIFO of requests. Submission appends;
//! draining hands each request to the driver callback, which either
//! completes it synchronously or later from its interrupt handler. A
//! completed request is detached and its waiter woken — the owning
//! buffer's channel, or for grouped read-ahead the group head's channel
//! once the group's outstanding counter reaches zero.

use baryon_core::id::DevId;
use baryon_core::{Errno, Result};

use alloc::vec::Vec;

use crate::buffer::{BufferCache, BufferIdx};
use crate::device::{BlkCmd, DeviceTable};
use crate::wait;

/// Completion state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrStatus {
    /// Waiting in the FIFO.
    Queued,
    /// Handed to the driver.
    Processing,
    /// Done; detached from the queue.
    Completed,
}

/// Index of a request in its queue's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqIdx(u32);

/// One block transfer request.
#[derive(Debug)]
pub struct BlkRequest {
    /// Transfer direction.
    pub cmd: BlkCmd,
    /// Target device.
    pub dev: DevId,
    /// Target block.
    pub block: u32,
    /// Transfer size in bytes.
    pub size: usize,
    /// Completion state.
    pub status: BrStatus,
    /// Error reported by the driver.
    pub errno: Option<Errno>,
    /// The buffer owning the data.
    pub buffer: BufferIdx,
    /// For a grouped read: the buffer of the group head, whose channel
    /// is woken when the whole group has landed.
    pub group_head: Option<BufferIdx>,
    next: Option<u32>,
}

/// A FIFO request queue over an index arena.
pub struct RequestQueue {
    slots: Vec<Option<BlkRequest>>,
    head: Option<u32>,
    tail: Option<u32>,
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Appends a request, returning its index.
    pub fn add(&mut self, req: BlkRequest) -> ReqIdx {
        let idx = match self.slots.iter().position(|s| s.is_none()) {
            Some(i) => {
                self.slots[i] = Some(req);
                i as u32
            }
            None => {
                self.slots.push(Some(req));
                (self.slots.len() - 1) as u32
            }
        };
        match self.tail {
            Some(t) => self.slots[t as usize].as_mut().unwrap().next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        ReqIdx(idx)
    }

    fn pop(&mut self) -> Option<u32> {
        let h = self.head?;
        self.head = self.slots[h as usize].as_ref().unwrap().next;
        if self.head.is_none() {
            self.tail = None;
        }
        Some(h)
    }

    /// Access to a request still in the arena.
    #[must_use]
    pub fn get(&self, idx: ReqIdx) -> Option<&BlkRequest> {
        self.slots.get(idx.0 as usize).and_then(|s| s.as_ref())
    }

    /// Number of requests not yet detached.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

/// Builds and enqueues one request.
///
/// The command and the target device are distinct fields filled from
/// their own parameters.
pub fn add_blk_request(
    devices: &mut DeviceTable,
    cmd: BlkCmd,
    dev: DevId,
    block: u32,
    size: usize,
    buffer: BufferIdx,
    group_head: Option<BufferIdx>,
) -> Result<ReqIdx> {
    let device = devices.block_dev_mut(dev)?;
    Ok(device.queue.add(BlkRequest {
        cmd,
        dev,
        block,
        size,
        status: BrStatus::Queued,
        errno: None,
        buffer,
        group_head,
        next: None,
    }))
}

/// Drains the device queue, invoking the driver callback for each
/// request and completing the synchronous ones in place.
pub fn run_blk_request(
    devices: &mut DeviceTable,
    buffers: &mut BufferCache,
    dev: DevId,
) -> Result<()> {
    // Clone the driver handle out so the queue borrow can drop while
    // the callback runs against the buffer data.
    let driver = alloc::sync::Arc::clone(&devices.block_dev(dev)?.driver);

    loop {
        let device = devices.block_dev_mut(dev)?;
        let Some(raw) = device.queue.pop() else {
            return Ok(());
        };
        let (cmd, block, size, buf_idx) = {
            let r = device.queue.slots[raw as usize].as_mut().unwrap();
            r.status = BrStatus::Processing;
            (r.cmd, r.block, r.size, r.buffer)
        };

        let outcome = driver.request(dev, cmd, block, &mut buffers.data_mut(buf_idx)[..size]);

        let device = devices.block_dev_mut(dev)?;
        match outcome {
            Ok(true) => {
                let mut r = device.queue.slots[raw as usize].take().unwrap();
                r.status = BrStatus::Completed;
                complete(buffers, &r, None);
            }
            Ok(false) => {
                // The driver kept it; its interrupt path calls
                // `end_blk_request`.
            }
            Err(e) => {
                let mut r = device.queue.slots[raw as usize].take().unwrap();
                r.status = BrStatus::Completed;
                complete(buffers, &r, Some(e));
            }
        }
    }
}

/// Completion entry point for interrupt-driven drivers: reports the
/// outcome of a request the driver kept.
pub fn end_blk_request(
    devices: &mut DeviceTable,
    buffers: &mut BufferCache,
    dev: DevId,
    idx: ReqIdx,
    errno: Option<Errno>,
) -> Result<()> {
    let device = devices.block_dev_mut(dev)?;
    let mut r = device
        .queue
        .slots
        .get_mut(idx.0 as usize)
        .and_then(Option::take)
        .ok_or(Errno::EINVAL)?;
    r.status = BrStatus::Completed;
    complete(buffers, &r, errno);
    Ok(())
}

/// Marks the owning buffer done and wakes the right waiter.
fn complete(buffers: &mut BufferCache, req: &BlkRequest, errno: Option<Errno>) {
    buffers.io_done(req.buffer, errno);
    match req.group_head {
        None => wait::wake_up(req.buffer.channel()),
        Some(head) => {
            if buffers.group_done(head) {
                wait::wake_up(head.channel());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_and_slot_reuse() {
        let mut q = RequestQueue::new();
        let mk = |block| BlkRequest {
            cmd: BlkCmd::Read,
            dev: DevId::new(1, 0),
            block,
            size: 512,
            status: BrStatus::Queued,
            errno: None,
            buffer: BufferIdx::new(0),
            group_head: None,
            next: None,
        };
        q.add(mk(1));
        q.add(mk(2));
        assert_eq!(q.pending(), 2);
        let a = q.pop().unwrap();
        assert_eq!(q.slots[a as usize].as_ref().unwrap().block, 1);
        q.slots[a as usize] = None;
        q.add(mk(3));
        // Freed slot is reused; FIFO order is 2 then 3.
        let b = q.pop().unwrap();
        assert_eq!(q.slots[b as usize].as_ref().unwrap().block, 2);
        let c = q.pop().unwrap();
        assert_eq!(q.slots[c as usize].as_ref().unwrap().block, 3);
        assert!(q.pop().is_none());
    }

    #[test]
    fn command_and_device_are_distinct() {
        // The classic transcription slip is storing the device number in
        // the command field; pin the two apart.
        let mut q = RequestQueue::new();
        let dev = DevId::new(9, 3);
        let idx = q.add(BlkRequest {
            cmd: BlkCmd::Write,
            dev,
            block: 5,
            size: 1024,
            status: BrStatus::Queued,
            errno: None,
            buffer: BufferIdx::new(1),
            group_head: None,
            next: None,
        });
        let r = q.get(idx).unwrap();
        assert_eq!(r.cmd, BlkCmd::Write);
        assert_eq!(r.dev, dev);
        assert_eq!(r.block, 5);
    }
}
