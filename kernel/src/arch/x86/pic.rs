//! 8259 programmable interrupt controller

use super::port::{io_wait, outb};

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xa0;
const PIC2_DATA: u16 = 0xa1;

/// First vector of the remapped IRQ range.
pub const IRQ_BASE: u8 = 0x20;

/// Remap IRQs 0-15 to vectors 0x20-0x2f, leaving the CPU exception
/// range clean.
pub fn remap() {
    unsafe {
        outb(PIC1_CMD, 0x11);
        io_wait();
        outb(PIC2_CMD, 0x11);
        io_wait();
        outb(PIC1_DATA, IRQ_BASE);
        io_wait();
        outb(PIC2_DATA, IRQ_BASE + 8);
        io_wait();
        outb(PIC1_DATA, 4); // slave on IRQ2
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();
        outb(PIC1_DATA, 0x01); // 8086 mode
        io_wait();
        outb(PIC2_DATA, 0x01);
        io_wait();
        // Unmask timer and keyboard; the rest stay off until a driver
        // asks.
        outb(PIC1_DATA, !0b0000_0011);
        outb(PIC2_DATA, 0xff);
    }
}

/// Signal end-of-interrupt for the given IRQ.
pub fn eoi(irq: u8) {
    unsafe {
        if irq >= 8 {
            outb(PIC2_CMD, 0x20);
        }
        outb(PIC1_CMD, 0x20);
    }
}
