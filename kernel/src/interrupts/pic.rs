//! 8259 PIC pair: remap IRQs 0-15 to vectors 32-47, mask everything but the timer, EOI.

use crate::hardware::Hardware;
use crate::interrupts::vector;

const MASTER_COMMAND: u16 = 0x20;
const MASTER_DATA: u16 = 0x21;
const SLAVE_COMMAND: u16 = 0xA0;
const SLAVE_DATA: u16 = 0xA1;

const ICW1_INIT: u8 = 0x11;
const ICW4_8086: u8 = 0x01;
const MASTER_CASCADE: u8 = 0x04;
const SLAVE_CASCADE: u8 = 0x02;
const END_OF_INTERRUPT: u8 = 0x20;

pub const TIMER_IRQ: u8 = 0;
/// Raised by the master for a lost interrupt. Not acknowledged.
pub const SPURIOUS_IRQ: u8 = 7;

pub fn remap<H: Hardware>(hw: &mut H) {
    let master_vector = vector::IRQ_BASE as u8;
    let slave_vector = master_vector + 8;

    // SAFETY: these are the PICs' own ports and this is their documented init sequence
    unsafe {
        hw.port_write_u8(MASTER_COMMAND, ICW1_INIT);
        hw.port_write_u8(SLAVE_COMMAND, ICW1_INIT);
        hw.port_write_u8(MASTER_DATA, master_vector);
        hw.port_write_u8(SLAVE_DATA, slave_vector);
        hw.port_write_u8(MASTER_DATA, MASTER_CASCADE);
        hw.port_write_u8(SLAVE_DATA, SLAVE_CASCADE);
        hw.port_write_u8(MASTER_DATA, ICW4_8086);
        hw.port_write_u8(SLAVE_DATA, ICW4_8086);

        hw.port_write_u8(MASTER_DATA, !(1 << TIMER_IRQ));
        hw.port_write_u8(SLAVE_DATA, 0xFF);
    }

    debug!("pic: remapped to 0x{:x}", master_vector);
}

pub fn end_of_interrupt<H: Hardware>(hw: &mut H, irq: u8) {
    // SAFETY: EOI has no effect beyond re-arming the controller
    unsafe {
        if irq >= 8 {
            hw.port_write_u8(SLAVE_COMMAND, END_OF_INTERRUPT);
        }
        hw.port_write_u8(MASTER_COMMAND, END_OF_INTERRUPT);
    }
}
