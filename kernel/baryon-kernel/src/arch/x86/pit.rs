//! The 8253/8254 programmable interval timer: channel 0 drives the
//! scheduler tick on IRQ 0.

use super::port::outb;
use crate::config::HZ;

const PIT_CH0: u16 = 0x40;
const PIT_MODE: u16 = 0x43;

/// Input clock of the PIT in Hz.
const PIT_HZ: u32 = 1_193_182;

/// Programs channel 0 as a rate generator at [`HZ`].
pub fn init() {
    let divisor = (PIT_HZ / HZ) as u16;
    // SAFETY: Mode 0x36 = channel 0, lo/hi byte, square wave; the two
    // data writes load the divisor.
    unsafe {
        outb(PIT_MODE, 0x36);
        outb(PIT_CH0, (divisor & 0xff) as u8);
        outb(PIT_CH0, (divisor >> 8) as u8);
    }
}
