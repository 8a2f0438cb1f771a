//! Gate descriptors, the interrupt descriptor table, and classification of trap vectors.

pub mod pic;
pub mod pit;
mod trap_frame;

pub use self::trap_frame::{EFlags, PageFaultErrorCode, PushRegs, TrapFrame, TRAP_FRAME_SIZE};

use crate::gdt::{
    PrivilegeLevel, PseudoDescriptor, SegmentSelector, SystemType, DPL, KERNEL_CODE_SELECTOR,
    NOT_SYSTEM, PRESENT, TYPE,
};
use bit_field::BitField;
use core::ops::Range;
use core::{fmt, mem};

pub mod vector {
    pub const DIVIDE_ERROR: u32 = 0;
    pub const DEBUG: u32 = 1;
    pub const NMI: u32 = 2;
    pub const BREAKPOINT: u32 = 3;
    pub const OVERFLOW: u32 = 4;
    pub const BOUND_RANGE: u32 = 5;
    pub const INVALID_OPCODE: u32 = 6;
    pub const DEVICE_NOT_AVAILABLE: u32 = 7;
    pub const DOUBLE_FAULT: u32 = 8;
    pub const INVALID_TSS: u32 = 10;
    pub const SEGMENT_NOT_PRESENT: u32 = 11;
    pub const STACK_FAULT: u32 = 12;
    pub const GENERAL_PROTECTION: u32 = 13;
    pub const PAGE_FAULT: u32 = 14;
    pub const X87_FLOATING_POINT: u32 = 16;
    pub const ALIGNMENT_CHECK: u32 = 17;
    pub const MACHINE_CHECK: u32 = 18;
    pub const SIMD_FLOATING_POINT: u32 = 19;

    /// First vector of the remapped 8259 IRQs
    pub const IRQ_BASE: u32 = 32;
    pub const IRQ_COUNT: u32 = 16;

    pub const SYSCALL: u32 = 48;
}

/// Vectors with an entry stub: 0 up to and including [vector::SYSCALL]
pub const VECTOR_COUNT: usize = vector::SYSCALL as usize + 1;
pub const IDT_ENTRIES: usize = 256;

/// Whether the CPU pushes an error code for `vector`. The entry stubs push a zero for the
/// others so every trap frame has the same shape.
pub const fn pushes_error_code(vector: u32) -> bool {
    matches!(vector, 8 | 10..=14 | 17)
}

/// Why the kernel was entered
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TrapCause {
    /// A hardware interrupt, by IRQ line
    Interrupt(u8),
    PageFault,
    ProtectionFault,
    ArithmeticFault,
    Syscall,
    Undefined(u32),
}

impl TrapCause {
    pub fn from_vector(trapno: u32) -> Self {
        use self::vector::*;

        match trapno {
            PAGE_FAULT => TrapCause::PageFault,
            SYSCALL => TrapCause::Syscall,
            DIVIDE_ERROR | OVERFLOW | X87_FLOATING_POINT | SIMD_FLOATING_POINT => {
                TrapCause::ArithmeticFault
            }
            INVALID_TSS | SEGMENT_NOT_PRESENT | STACK_FAULT | GENERAL_PROTECTION
            | ALIGNMENT_CHECK => TrapCause::ProtectionFault,
            irq if irq >= IRQ_BASE && irq < IRQ_BASE + IRQ_COUNT => {
                TrapCause::Interrupt((irq - IRQ_BASE) as u8)
            }
            other => TrapCause::Undefined(other),
        }
    }
}

const OFFSET_LOW: Range<usize> = 0..16;
const SELECTOR: Range<usize> = 16..32;
const ARGS: Range<usize> = 32..37;
const OFFSET_HIGH: Range<usize> = 48..64;

/// A packed 8-byte interrupt, trap or call gate
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct GateDescriptor(u64);

impl GateDescriptor {
    pub const fn missing() -> Self {
        GateDescriptor(0)
    }

    /// Clears the interrupt flag on entry
    pub fn interrupt(selector: SegmentSelector, offset: u32, dpl: PrivilegeLevel) -> Self {
        Self::pack(SystemType::InterruptGate32, selector, offset, dpl, 0)
    }

    /// Leaves the interrupt flag alone on entry
    pub fn trap(selector: SegmentSelector, offset: u32, dpl: PrivilegeLevel) -> Self {
        Self::pack(SystemType::TrapGate32, selector, offset, dpl, 0)
    }

    /// A call gate copying `args` stack words to the new stack
    pub fn call(selector: SegmentSelector, offset: u32, dpl: PrivilegeLevel, args: u8) -> Self {
        assert!(args < 32, "Call gate argument count {} too large", args);
        Self::pack(SystemType::CallGate32, selector, offset, dpl, args)
    }

    fn pack(
        ty: SystemType,
        selector: SegmentSelector,
        offset: u32,
        dpl: PrivilegeLevel,
        args: u8,
    ) -> Self {
        let offset = u64::from(offset);
        let mut raw = 0u64;

        raw.set_bits(OFFSET_LOW, offset.get_bits(0..16));
        raw.set_bits(SELECTOR, u64::from(selector.as_u16()));
        raw.set_bits(ARGS, u64::from(args));
        raw.set_bits(TYPE, ty as u64);
        raw.set_bit(NOT_SYSTEM, false);
        raw.set_bits(DPL, dpl as u64);
        raw.set_bit(PRESENT, true);
        raw.set_bits(OFFSET_HIGH, offset.get_bits(16..32));

        GateDescriptor(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn offset(self) -> u32 {
        (self.0.get_bits(OFFSET_LOW) | (self.0.get_bits(OFFSET_HIGH) << 16)) as u32
    }

    pub fn selector(self) -> SegmentSelector {
        SegmentSelector::from_raw(self.0.get_bits(SELECTOR) as u16)
    }

    pub fn args(self) -> u8 {
        self.0.get_bits(ARGS) as u8
    }

    pub fn gate_type(self) -> Option<SystemType> {
        SystemType::from_bits(self.0.get_bits(TYPE) as u8)
    }

    pub fn dpl(self) -> PrivilegeLevel {
        PrivilegeLevel::from_low_bits(self.0.get_bits(DPL))
    }

    pub fn is_present(self) -> bool {
        self.0.get_bit(PRESENT)
    }
}

impl fmt::Debug for GateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "GateDescriptor(0x{:016x})", self.0)
    }
}

#[repr(C, align(8))]
pub struct InterruptTable {
    gates: [GateDescriptor; IDT_ENTRIES],
}

impl InterruptTable {
    /// Interrupt gates to each entry stub. Every gate disables interrupts, so the kernel is
    /// never re-entered; only the system call gate may be invoked from ring 3.
    pub fn new(stubs: &[u32; VECTOR_COUNT]) -> Self {
        let mut gates = [GateDescriptor::missing(); IDT_ENTRIES];

        for (index, &stub) in stubs.iter().enumerate() {
            let dpl = if index as u32 == vector::SYSCALL {
                PrivilegeLevel::Ring3
            } else {
                PrivilegeLevel::Ring0
            };

            gates[index] = GateDescriptor::interrupt(KERNEL_CODE_SELECTOR, stub, dpl);
        }

        InterruptTable { gates }
    }

    pub fn gate(&self, vector: u8) -> GateDescriptor {
        self.gates[vector as usize]
    }

    pub fn pseudo_descriptor(&self) -> PseudoDescriptor {
        PseudoDescriptor::new(
            self as *const _ as usize as u32,
            (mem::size_of::<Self>() - 1) as u16,
        )
    }
}
