//! Process control and context switching for a 32-bit protected-mode x86 kernel.
//!
//! Everything above [hardware::Hardware] and [memory::PhysicalMemory] is plain Rust and runs
//! on the host under `cargo test`, against simulated hardware and memory. The `arch` module
//! binds it to a real i686 machine.

#![cfg_attr(target_os = "none", no_std)]

#[macro_use]
extern crate log;

use core::fmt;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod arch;
pub mod config;
pub mod elf;
pub mod gdt;
pub mod hardware;
pub mod interrupts;
pub mod kernel;
#[cfg(all(target_arch = "x86", target_os = "none"))]
mod lang;
pub mod logger;
pub mod memory;
pub mod process;
pub mod scheduler;
pub mod syscall;
pub mod tss;
pub mod util;

pub use crate::kernel::Kernel;

/// Writes a formatted string to the console, for the logger's use
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn console_print(args: fmt::Arguments) {
    use core::fmt::Write;

    let _ = arch::SERIAL_WRITER.lock().write_fmt(args);
}

#[cfg(not(target_os = "none"))]
pub fn console_print(args: fmt::Arguments) {
    eprint!("{}", args);
}
