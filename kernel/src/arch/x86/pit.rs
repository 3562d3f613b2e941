//! 8253/8254 programmable interval timer

use super::port::outb;

const PIT_CH0: u16 = 0x40;
const PIT_CMD: u16 = 0x43;
const PIT_HZ: u32 = 1_193_182;

/// Program channel 0 as a rate generator at `hz`.
pub fn init(hz: u32) {
    let divisor = (PIT_HZ / hz).clamp(1, 0xffff) as u16;
    unsafe {
        outb(PIT_CMD, 0x36); // channel 0, lo/hi, mode 3
        outb(PIT_CH0, divisor as u8);
        outb(PIT_CH0, (divisor >> 8) as u8);
    }
}
