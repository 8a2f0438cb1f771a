//! The privileged-instruction boundary. Everything the kernel does to the CPU goes through
//! [Hardware], so the rest of the kernel runs unchanged against a simulation in tests.

#[cfg(test)]
pub mod sim;

use crate::gdt::{PseudoDescriptor, SegmentSelector};
use crate::memory::paging::LinearAddress;
use core::mem;

/// Callee-saved registers of a suspended kernel thread of control. The instruction pointer is
/// not stored: it is the return address on top of the suspended stack.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct Context {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub esp: u32,
}

// Offsets used by the switch routine
const _: () = assert!(mem::offset_of!(Context, edi) == 0);
const _: () = assert!(mem::offset_of!(Context, esi) == 4);
const _: () = assert!(mem::offset_of!(Context, ebx) == 8);
const _: () = assert!(mem::offset_of!(Context, ebp) == 12);
const _: () = assert!(mem::offset_of!(Context, esp) == 16);

bitflags::bitflags! {
    pub struct Cr0Flags: u32 {
        /// Protected mode
        const PROTECTED_MODE = 1;
        const MONITOR_COPROCESSOR = 1 << 1;
        const EMULATE_COPROCESSOR = 1 << 2;
        /// Supervisor writes honour read-only pages
        const WRITE_PROTECT = 1 << 16;
        const PAGING = 1 << 31;
    }
}

pub trait Hardware {
    /// # Safety
    ///
    /// Reading some ports has side effects on the device behind them.
    unsafe fn port_read_u8(&mut self, port: u16) -> u8;

    /// # Safety
    ///
    /// The write must be valid for the device behind `port`.
    unsafe fn port_write_u8(&mut self, port: u16, value: u8);

    fn read_cr0(&self) -> u32;

    /// # Safety
    ///
    /// Enabling paging requires `cr3` to hold a directory mapping the running code.
    unsafe fn write_cr0(&mut self, value: u32);

    /// The faulting address of the last page fault
    fn read_cr2(&self) -> u32;

    fn read_cr3(&self) -> u32;

    /// # Safety
    ///
    /// The directory must map the kernel and the current stack.
    unsafe fn write_cr3(&mut self, directory: u32);

    /// # Safety
    ///
    /// The table must stay alive and unmoved while it is loaded.
    unsafe fn load_gdt(&mut self, table: &PseudoDescriptor);

    /// Reload `cs` with `code` and every data segment register with `data`.
    ///
    /// # Safety
    ///
    /// Both selectors must index valid descriptors in the loaded table.
    unsafe fn load_segments(&mut self, code: SegmentSelector, data: SegmentSelector);

    /// # Safety
    ///
    /// `selector` must name an available task descriptor in the loaded table.
    unsafe fn load_task_register(&mut self, selector: SegmentSelector);

    /// # Safety
    ///
    /// The table must stay alive and unmoved while it is loaded.
    unsafe fn load_idt(&mut self, table: &PseudoDescriptor);

    fn invalidate_page(&mut self, addr: LinearAddress);

    fn interrupts_enabled(&self) -> bool;

    fn enable_interrupts(&mut self);

    fn disable_interrupts(&mut self);

    /// Wait for the next interrupt
    fn halt(&mut self);

    /// Save the callee-saved registers and stack pointer into `save`, then load `load` and
    /// return into the thread of control it was saved from. Returns when something switches
    /// back to `save`.
    ///
    /// # Safety
    ///
    /// `load` must have been written by an earlier switch, or seeded so its stack pointer
    /// addresses a valid return address.
    unsafe fn switch_context(&mut self, save: *mut Context, load: *const Context);

    /// Address of the trap resume path, which pops a trap frame off the stack and `iret`s
    fn trap_return_address(&self) -> u32;

    /// Run `f` with interrupts disabled, restoring the previous interrupt state afterwards
    fn without_interrupts<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R
    where
        Self: Sized,
    {
        let enabled = self.interrupts_enabled();
        if enabled {
            self.disable_interrupts();
        }

        let ret = f(self);

        if enabled {
            self.enable_interrupts();
        }

        ret
    }
}
