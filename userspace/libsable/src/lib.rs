#![no_std]

pub mod syscall;

use core::fmt::{self, Write};
use core::panic::PanicInfo;

pub use libsable_macros::*;

/// Exit status of a process that panicked
pub const PANIC_EXIT_CODE: i32 = 101;

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ({
        use ::core::fmt::Write;
        let mut out = $crate::Stdout::new();
        let _ = write!(out, $($arg)*);
    });
}

#[macro_export]
macro_rules! println {
    ($fmt:expr) => (print!(concat!($fmt, "\n")));
    ($fmt:expr, $($arg:tt)*) => (print!(concat!($fmt, "\n"), $($arg)*));
}

pub mod prelude {
    pub use crate::{print, println};
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut out = Stdout::new();
    let _ = write!(out, "pid {} panicked: {}", syscall::getpid(), info.message());
    if let Some(loc) = info.location() {
        let _ = write!(out, " at {}:{}", loc.file(), loc.line());
    }
    let _ = out.flush();

    syscall::exit(PANIC_EXIT_CODE)
}

/// Buffered output to the kernel log. The kernel turns each `print` call into one log record,
/// so text is sent a line at a time, or in `PRINT_MAX` chunks when a line is longer. Whatever
/// is left is sent on drop.
pub struct Stdout {
    buf: [u8; syscall::PRINT_MAX],
    len: usize,
}

impl Stdout {
    pub const fn new() -> Self {
        Stdout {
            buf: [0; syscall::PRINT_MAX],
            len: 0,
        }
    }

    pub fn flush(&mut self) -> fmt::Result {
        if self.len == 0 {
            return Ok(());
        }

        // Only whole characters are ever buffered
        let text = core::str::from_utf8(&self.buf[..self.len]).map_err(|_| fmt::Error)?;
        let result = syscall::print(text).map_err(|_| fmt::Error);
        self.len = 0;
        result
    }
}

impl Default for Stdout {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for Stdout {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for c in s.chars() {
            let mut encoded = [0; 4];
            let bytes = c.encode_utf8(&mut encoded).as_bytes();

            if self.len + bytes.len() > self.buf.len() {
                self.flush()?;
            }
            self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
            self.len += bytes.len();

            if c == '\n' {
                self.flush()?;
            }
        }

        Ok(())
    }
}

impl Drop for Stdout {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
