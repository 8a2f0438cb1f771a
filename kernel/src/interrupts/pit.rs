//! 8253/8254 PIT channel 0, driving the scheduler tick on IRQ 0.

use crate::hardware::Hardware;

const CHANNEL0_DATA: u16 = 0x40;
const COMMAND: u16 = 0x43;

/// PIT input clock in Hz
const BASE_HZ: u32 = 1_193_182;

/// Channel 0, lo/hi bytes, mode 3 (square wave), binary
const COMMAND_CHANNEL0_SQUARE: u8 = 0x36;

/// Reload value for a tick rate of `hz`, clamped to what the counter can hold
pub fn divisor(hz: u32) -> u16 {
    assert!(hz > 0, "PIT frequency must be > 0");
    (BASE_HZ / hz).clamp(1, u32::from(u16::MAX)) as u16
}

pub fn init<H: Hardware>(hw: &mut H, hz: u32) {
    let [low, high] = divisor(hz).to_le_bytes();

    // SAFETY: programming channel 0 only changes the timer interrupt rate
    unsafe {
        hw.port_write_u8(COMMAND, COMMAND_CHANNEL0_SQUARE);
        hw.port_write_u8(CHANNEL0_DATA, low);
        hw.port_write_u8(CHANNEL0_DATA, high);
    }

    debug!("pit: ticking at {}Hz", hz);
}
