use crate::gdt::{PrivilegeLevel, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use core::mem;

pub const TRAP_FRAME_SIZE: usize = 68;

/// General purpose registers in `pushad` order
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    /// Ignored by `popad`
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// The kernel stack at trap entry. Built by the CPU (from `err` up) and the entry stubs (up to
/// `trapno`); the resume path pops it and `iret`s. `esp` and `ss` are only meaningful when the
/// trap came from ring 3.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u16,
    _pad0: u16,
    pub ds: u16,
    _pad1: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    _pad2: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    _pad3: u16,
}

const _: () = assert!(mem::size_of::<TrapFrame>() == TRAP_FRAME_SIZE);
const _: () = assert!(mem::offset_of!(TrapFrame, es) == 32);
const _: () = assert!(mem::offset_of!(TrapFrame, ds) == 36);
const _: () = assert!(mem::offset_of!(TrapFrame, trapno) == 40);
const _: () = assert!(mem::offset_of!(TrapFrame, err) == 44);
const _: () = assert!(mem::offset_of!(TrapFrame, eip) == 48);
const _: () = assert!(mem::offset_of!(TrapFrame, cs) == 52);
const _: () = assert!(mem::offset_of!(TrapFrame, eflags) == 56);
const _: () = assert!(mem::offset_of!(TrapFrame, esp) == 60);
const _: () = assert!(mem::offset_of!(TrapFrame, ss) == 64);

bitflags::bitflags! {
    pub struct EFlags: u32 {
        const CARRY = 1;
        /// Always set
        const RESERVED = 1 << 1;
        const PARITY = 1 << 2;
        const ZERO = 1 << 6;
        const SIGN = 1 << 7;
        const TRAP = 1 << 8;
        const INTERRUPT = 1 << 9;
        const DIRECTION = 1 << 10;
        const OVERFLOW = 1 << 11;
        /// I/O privilege level
        const IOPL = 0b11 << 12;
        const NESTED_TASK = 1 << 14;
    }
}

bitflags::bitflags! {
    /// Error code pushed by a page fault
    pub struct PageFaultErrorCode: u32 {
        /// Set on a protection violation, clear if the page was not present
        const PROTECTION_VIOLATION = 1;
        const WRITE = 1 << 1;
        const USER_MODE = 1 << 2;
    }
}

impl TrapFrame {
    /// The frame that starts a process at `entry` with its stack at `stack_top`: ring 3 code and
    /// data selectors, interrupts enabled, and IOPL 0.
    pub fn new_user(entry: u32, stack_top: u32) -> Self {
        let data = USER_DATA_SELECTOR.as_u16();

        TrapFrame {
            es: data,
            ds: data,
            eip: entry,
            cs: USER_CODE_SELECTOR.as_u16(),
            eflags: (EFlags::RESERVED | EFlags::INTERRUPT).bits(),
            esp: stack_top,
            ss: data,
            ..TrapFrame::default()
        }
    }

    /// Whether the trap came from ring 3, i.e. crossed a privilege boundary
    pub fn is_from_user(&self) -> bool {
        PrivilegeLevel::from_low_bits(u64::from(self.cs)) == PrivilegeLevel::Ring3
    }

    pub fn syscall_number(&self) -> u32 {
        self.regs.eax
    }

    pub fn syscall_args(&self) -> [u32; 5] {
        let r = &self.regs;
        [r.edx, r.ecx, r.ebx, r.edi, r.esi]
    }

    pub fn set_return(&mut self, value: i32) {
        self.regs.eax = value as u32;
    }

    pub fn to_bytes(&self) -> [u8; TRAP_FRAME_SIZE] {
        let r = &self.regs;
        let words = [
            r.edi,
            r.esi,
            r.ebp,
            r.oesp,
            r.ebx,
            r.edx,
            r.ecx,
            r.eax,
            u32::from(self.es),
            u32::from(self.ds),
            self.trapno,
            self.err,
            self.eip,
            u32::from(self.cs),
            self.eflags,
            self.esp,
            u32::from(self.ss),
        ];

        let mut bytes = [0; TRAP_FRAME_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8; TRAP_FRAME_SIZE]) -> Self {
        let mut words = [0u32; TRAP_FRAME_SIZE / 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        TrapFrame {
            regs: PushRegs {
                edi: words[0],
                esi: words[1],
                ebp: words[2],
                oesp: words[3],
                ebx: words[4],
                edx: words[5],
                ecx: words[6],
                eax: words[7],
            },
            es: words[8] as u16,
            ds: words[9] as u16,
            trapno: words[10],
            err: words[11],
            eip: words[12],
            cs: words[13] as u16,
            eflags: words[14],
            esp: words[15],
            ss: words[16] as u16,
            ..TrapFrame::default()
        }
    }
}
