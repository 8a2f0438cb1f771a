//! Binding to a real i686 machine: the [Hardware](crate::hardware::Hardware) implementation,
//! identity-mapped physical memory, the trap entry stubs, and the boot entry point.

mod cpu;
mod memory;
mod trap;

pub use self::cpu::X86;
pub use self::memory::IdentityMemory;

use crate::config::{IDENTITY_LIMIT, PAGE_SIZE};
use crate::elf::ElfImage;
use crate::kernel::Kernel;
use crate::memory::RegionAllocator;
use crate::scheduler::Scheduler;
use crate::util::{align_down, checked_align_up};
use core::arch::asm;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use spin::Mutex;
use uart_16550::SerialPort;

pub static SERIAL_WRITER: Mutex<SerialPort> = Mutex::new(unsafe { SerialPort::new(0x3f8) });
static INIT_ELF: &[u8] = include_bytes!(env!("SABLE_INIT_PATH"));

/// SAFETY: written once by `kmain` before interrupts are enabled, then only used from the trap
/// entry, one trap at a time.
static KERNEL: AsmCell<MaybeUninit<Kernel<X86, IdentityMemory>>> =
    AsmCell(UnsafeCell::new(MaybeUninit::uninit()));

#[repr(transparent)]
struct AsmCell<T>(UnsafeCell<T>);
unsafe impl<T> Send for AsmCell<T> {}
unsafe impl<T> Sync for AsmCell<T> {}

/// # Safety
///
/// `kmain` must have run, and the caller must be the only user of the kernel.
unsafe fn kernel() -> &'static mut Kernel<X86, IdentityMemory> {
    (*KERNEL.0.get()).assume_init_mut()
}

/// Entered from the boot stub in protected mode, with flat segments, paging off and interrupts
/// disabled. Physical memory from `mem_start` to `mem_end` is free for the kernel to use.
#[no_mangle]
pub extern "C" fn kmain(mem_start: u32, mem_end: u32) -> ! {
    SERIAL_WRITER.lock().init();
    crate::logger::init();
    info!("sable: booting");

    let mut allocator = RegionAllocator::new();
    let start = checked_align_up(mem_start, PAGE_SIZE).expect("Memory map starts past 4 GiB");
    let end = align_down(mem_end.min(IDENTITY_LIMIT), PAGE_SIZE);
    allocator.add_range(start, end);
    info!("memory: 0x{:x}..0x{:x} available", start, end);

    let kernel = match Kernel::new(X86, IdentityMemory::new(allocator)) {
        Ok(kernel) => kernel,
        Err(e) => panic!("Could not build the kernel page tables: {}", e),
    };

    // SAFETY: interrupts are disabled and nothing else has touched the cell
    let kernel = unsafe { (*KERNEL.0.get()).write(kernel) };
    unsafe { kernel.start(&trap::IDT.pseudo_descriptor()) };

    info!("init: loading");
    let image = ElfImage::parse(INIT_ELF).unwrap_or_else(|e| panic!("Bad init image: {}", e));
    match kernel.spawn(&image) {
        Ok(handle) => info!("init: ready as {}", handle),
        Err(e) => panic!("Could not create init: {}", e),
    }

    // The boot thread becomes the idle context. It does not touch the kernel again: every
    // further entry is through a trap.
    Scheduler::idle_loop(&mut X86)
}

pub fn halt() -> ! {
    // Disable interrupts
    unsafe {
        asm!("cli", options(nomem, nostack));
    }

    // Halt forever...
    loop {
        unsafe {
            asm!("hlt", options(nomem, nostack));
        }
    }
}
