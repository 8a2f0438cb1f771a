//! Lang items

use core::fmt::Write;
use core::panic::PanicInfo;
use uart_16550::SerialPort;

#[panic_handler]
fn panic_fmt(info: &PanicInfo) -> ! {
    // A fresh port: the console lock may be held by whoever panicked
    let mut serial = unsafe { SerialPort::new(0x3f8) };

    // Ignore the errors because we can't afford to panic in the panic handler
    if let Some(loc) = info.location() {
        let _ = write!(
            &mut serial,
            "Panicked at \"{}\", {file}:{line}\n",
            info.message(),
            file = loc.file(),
            line = loc.line()
        );
    } else {
        let _ = write!(
            &mut serial,
            "Panicked at \"{}\" at an undefined location\n",
            info.message()
        );
    }

    crate::arch::halt()
}
