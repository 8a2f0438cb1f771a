use crate::gdt::{PseudoDescriptor, SegmentSelector};
use crate::hardware::{Context, Hardware};
use crate::interrupts::EFlags;
use crate::memory::paging::LinearAddress;
use core::arch::asm;

extern "C" {
    fn sable_switch_context(save: *mut Context, load: *const Context);
    fn sable_trap_return();
}

/// The CPU the kernel runs on
pub struct X86;

impl Hardware for X86 {
    unsafe fn port_read_u8(&mut self, port: u16) -> u8 {
        let value: u8;
        asm!("in al, dx", out("al") value, in("dx") port, options(nomem, nostack, preserves_flags));
        value
    }

    unsafe fn port_write_u8(&mut self, port: u16, value: u8) {
        asm!("out dx, al", in("dx") port, in("al") value, options(nomem, nostack, preserves_flags));
    }

    fn read_cr0(&self) -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    unsafe fn write_cr0(&mut self, value: u32) {
        asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags));
    }

    fn read_cr2(&self) -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    fn read_cr3(&self) -> u32 {
        let value: u32;
        unsafe { asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags)) };
        value
    }

    unsafe fn write_cr3(&mut self, directory: u32) {
        asm!("mov cr3, {}", in(reg) directory, options(nostack, preserves_flags));
    }

    unsafe fn load_gdt(&mut self, table: &PseudoDescriptor) {
        asm!("lgdt [{}]", in(reg) table, options(readonly, nostack, preserves_flags));
    }

    unsafe fn load_segments(&mut self, code: SegmentSelector, data: SegmentSelector) {
        // A far return is the only way to reload `cs` with a register operand
        asm!(
            "push {code}",
            "lea {tmp}, [55f]",
            "push {tmp}",
            "retf",
            "55:",
            "mov ds, {data:x}",
            "mov es, {data:x}",
            "mov fs, {data:x}",
            "mov gs, {data:x}",
            "mov ss, {data:x}",
            code = in(reg) u32::from(code.as_u16()),
            data = in(reg) u32::from(data.as_u16()),
            tmp = out(reg) _,
            options(preserves_flags),
        );
    }

    unsafe fn load_task_register(&mut self, selector: SegmentSelector) {
        asm!("ltr {0:x}", in(reg) u32::from(selector.as_u16()), options(nostack, preserves_flags));
    }

    unsafe fn load_idt(&mut self, table: &PseudoDescriptor) {
        asm!("lidt [{}]", in(reg) table, options(readonly, nostack, preserves_flags));
    }

    fn invalidate_page(&mut self, addr: LinearAddress) {
        unsafe { asm!("invlpg [{}]", in(reg) addr.as_u32(), options(nostack, preserves_flags)) };
    }

    fn interrupts_enabled(&self) -> bool {
        let flags: u32;
        unsafe { asm!("pushfd", "pop {}", out(reg) flags, options(nomem, preserves_flags)) };
        EFlags::from_bits_truncate(flags).contains(EFlags::INTERRUPT)
    }

    fn enable_interrupts(&mut self) {
        unsafe { asm!("sti", options(nomem, nostack)) };
    }

    fn disable_interrupts(&mut self) {
        unsafe { asm!("cli", options(nomem, nostack)) };
    }

    fn halt(&mut self) {
        unsafe { asm!("hlt", options(nomem, nostack, preserves_flags)) };
    }

    unsafe fn switch_context(&mut self, save: *mut Context, load: *const Context) {
        sable_switch_context(save, load);
    }

    fn trap_return_address(&self) -> u32 {
        sable_trap_return as usize as u32
    }
}
