//! Compile-time kernel configuration.
//!
//! # Linear address layout
//!
//! | Address range                   | Usage                                          |
//! |---------------------------------|------------------------------------------------|
//! | `0x00000000` ~ `IDENTITY_LIMIT` | Kernel identity map (supervisor only)          |
//! | `USER_BASE` ~ `USER_LIMIT`      | Process memory, image segments and user stack  |
//!
//! Physical memory handed out to processes always lies below `IDENTITY_LIMIT`, so every
//! kernel stack stays addressable whichever page directory is loaded.

use log::Level;

/// Number of slots in the process table
pub const MAX_PROCESSES: usize = 64;

pub const PAGE_SIZE: u32 = 4096;

/// Size of the private kernel stack embedded at the bottom of each process's memory region
pub const KERNEL_STACK_SIZE: u32 = 2 * PAGE_SIZE;
/// Size of the user stack placed after the highest loadable segment
pub const USER_STACK_SIZE: u32 = 16 * PAGE_SIZE;

/// Linear address at which a process's memory is mapped
pub const USER_BASE: u32 = 0x4000_0000;
/// Exclusive end of the user window
pub const USER_LIMIT: u32 = 0xC000_0000;

/// Exclusive end of the kernel's identity mapped window (64 MiB)
pub const IDENTITY_LIMIT: u32 = 0x0400_0000;

pub const TIMER_HZ: u32 = 100;

/// Longest string accepted by the print system call
pub const PRINT_BUFFER_SIZE: usize = 256;

/// Maximum number of loadable segments in a process image
pub const MAX_IMAGE_SEGMENTS: usize = 16;

// `return` statements and `#[allow]` required here because of the `cfg`s and how log levels work
#[allow(unreachable_code)]
pub const fn log_level() -> Level {
    #[cfg(feature = "trace")]
    return Level::Trace;

    #[cfg(feature = "debug")]
    return Level::Debug;

    Level::Info
}
