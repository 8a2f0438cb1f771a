//! Segment descriptors and the six-entry descriptor table each process carries.

use crate::tss::TaskState;
use bit_field::BitField;
use core::ops::Range;
use core::{fmt, mem};

pub const SEG_NULL: usize = 0;
pub const SEG_KERNEL_CODE: usize = 1;
pub const SEG_KERNEL_DATA: usize = 2;
pub const SEG_USER_CODE: usize = 3;
pub const SEG_USER_DATA: usize = 4;
pub const SEG_TASK: usize = 5;
pub const DESCRIPTOR_COUNT: usize = 6;

pub const KERNEL_CODE_SELECTOR: SegmentSelector =
    SegmentSelector::new(SEG_KERNEL_CODE as u16, PrivilegeLevel::Ring0);
pub const KERNEL_DATA_SELECTOR: SegmentSelector =
    SegmentSelector::new(SEG_KERNEL_DATA as u16, PrivilegeLevel::Ring0);
pub const USER_CODE_SELECTOR: SegmentSelector =
    SegmentSelector::new(SEG_USER_CODE as u16, PrivilegeLevel::Ring3);
pub const USER_DATA_SELECTOR: SegmentSelector =
    SegmentSelector::new(SEG_USER_DATA as u16, PrivilegeLevel::Ring3);
pub const TASK_SELECTOR: SegmentSelector =
    SegmentSelector::new(SEG_TASK as u16, PrivilegeLevel::Ring0);

/// Limit of a flat segment covering all 4GiB
const FLAT_LIMIT: u32 = 0xFFFF_FFFF;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
#[repr(u8)]
pub enum PrivilegeLevel {
    Ring0 = 0,
    Ring1 = 1,
    Ring2 = 2,
    Ring3 = 3,
}

impl PrivilegeLevel {
    /// The level in the low two bits of `value`
    pub fn from_low_bits(value: u64) -> Self {
        match value & 0b11 {
            0 => PrivilegeLevel::Ring0,
            1 => PrivilegeLevel::Ring1,
            2 => PrivilegeLevel::Ring2,
            _ => PrivilegeLevel::Ring3,
        }
    }
}

/// An index into the descriptor table plus the requested privilege level
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct SegmentSelector(u16);

impl SegmentSelector {
    pub const fn new(index: u16, rpl: PrivilegeLevel) -> Self {
        SegmentSelector((index << 3) | rpl as u16)
    }

    pub const fn from_raw(raw: u16) -> Self {
        SegmentSelector(raw)
    }

    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    pub fn rpl(self) -> PrivilegeLevel {
        PrivilegeLevel::from_low_bits(self.0 as u64)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for SegmentSelector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SegmentSelector")
            .field("index", &self.index())
            .field("rpl", &self.rpl())
            .finish()
    }
}

bitflags::bitflags! {
    /// Type field of a code or data descriptor
    pub struct SegmentType: u8 {
        /// Set by the CPU when the segment is loaded
        const ACCESSED = 1;
        /// Readable for code segments, writable for data segments
        const READ_WRITE = 1 << 1;
        /// Conforming for code segments, expand down for data segments
        const CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
    }
}

/// Type field of a system descriptor
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SystemType {
    AvailableTask32 = 0x9,
    BusyTask32 = 0xB,
    CallGate32 = 0xC,
    InterruptGate32 = 0xE,
    TrapGate32 = 0xF,
}

impl SystemType {
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0x9 => Some(SystemType::AvailableTask32),
            0xB => Some(SystemType::BusyTask32),
            0xC => Some(SystemType::CallGate32),
            0xE => Some(SystemType::InterruptGate32),
            0xF => Some(SystemType::TrapGate32),
            _ => None,
        }
    }
}

// Bit positions shared by segment and gate descriptors
pub(crate) const TYPE: Range<usize> = 40..44;
pub(crate) const NOT_SYSTEM: usize = 44;
pub(crate) const DPL: Range<usize> = 45..47;
pub(crate) const PRESENT: usize = 47;

const LIMIT_LOW: Range<usize> = 0..16;
const BASE_LOW: Range<usize> = 16..40;
const LIMIT_HIGH: Range<usize> = 48..52;
const AVAILABLE: usize = 52;
const DEFAULT_32: usize = 54;
const GRANULARITY: usize = 55;
const BASE_HIGH: Range<usize> = 56..64;

/// A packed 8-byte segment descriptor
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct SegmentDescriptor(u64);

impl SegmentDescriptor {
    pub const fn null() -> Self {
        SegmentDescriptor(0)
    }

    /// Present, 32-bit, and otherwise empty. Any use of it faults.
    pub fn faulting() -> Self {
        let mut raw = 0u64;
        raw.set_bit(NOT_SYSTEM, true);
        raw.set_bit(PRESENT, true);
        raw.set_bit(DEFAULT_32, true);
        SegmentDescriptor(raw)
    }

    /// A page granular code or data segment. `limit` is in bytes; the low 12 bits are dropped.
    pub fn segment(ty: SegmentType, base: u32, limit: u32, dpl: PrivilegeLevel) -> Self {
        Self::pack(ty.bits(), true, base, limit >> 12, true, dpl)
    }

    /// A byte granular code or data segment. `limit` must fit in 20 bits.
    pub fn byte_granular(ty: SegmentType, base: u32, limit: u32, dpl: PrivilegeLevel) -> Self {
        assert!(limit <= 0xF_FFFF, "Byte granular limit 0x{:x} too large", limit);
        Self::pack(ty.bits(), true, base, limit, false, dpl)
    }

    /// An available 32-bit task descriptor for a task-state block at `base`
    pub fn task_state(base: u32, limit: u32) -> Self {
        assert!(limit <= 0xF_FFFF, "Task state limit 0x{:x} too large", limit);
        Self::pack(
            SystemType::AvailableTask32 as u8,
            false,
            base,
            limit,
            false,
            PrivilegeLevel::Ring0,
        )
    }

    pub const fn from_raw(raw: u64) -> Self {
        SegmentDescriptor(raw)
    }

    fn pack(ty: u8, application: bool, base: u32, limit: u32, granular: bool, dpl: PrivilegeLevel) -> Self {
        let base = u64::from(base);
        let limit = u64::from(limit);
        let mut raw = 0u64;

        raw.set_bits(LIMIT_LOW, limit.get_bits(0..16));
        raw.set_bits(BASE_LOW, base.get_bits(0..24));
        raw.set_bits(TYPE, u64::from(ty));
        raw.set_bit(NOT_SYSTEM, application);
        raw.set_bits(DPL, dpl as u64);
        raw.set_bit(PRESENT, true);
        raw.set_bits(LIMIT_HIGH, limit.get_bits(16..20));
        raw.set_bit(DEFAULT_32, true);
        raw.set_bit(GRANULARITY, granular);
        raw.set_bits(BASE_HIGH, base.get_bits(24..32));

        SegmentDescriptor(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn base(self) -> u32 {
        (self.0.get_bits(BASE_LOW) | (self.0.get_bits(BASE_HIGH) << 24)) as u32
    }

    /// The 20-bit limit field as stored
    pub fn raw_limit(self) -> u32 {
        (self.0.get_bits(LIMIT_LOW) | (self.0.get_bits(LIMIT_HIGH) << 16)) as u32
    }

    /// Offset of the last addressable byte
    pub fn limit(self) -> u32 {
        if self.is_page_granular() {
            (self.raw_limit() << 12) | 0xFFF
        } else {
            self.raw_limit()
        }
    }

    pub fn type_bits(self) -> u8 {
        self.0.get_bits(TYPE) as u8
    }

    pub fn is_system(self) -> bool {
        !self.0.get_bit(NOT_SYSTEM)
    }

    pub fn system_type(self) -> Option<SystemType> {
        if self.is_system() {
            SystemType::from_bits(self.type_bits())
        } else {
            None
        }
    }

    pub fn segment_type(self) -> Option<SegmentType> {
        if self.is_system() {
            None
        } else {
            Some(SegmentType::from_bits_truncate(self.type_bits()))
        }
    }

    pub fn dpl(self) -> PrivilegeLevel {
        PrivilegeLevel::from_low_bits(self.0.get_bits(DPL))
    }

    pub fn is_present(self) -> bool {
        self.0.get_bit(PRESENT)
    }

    pub fn is_available_bit_set(self) -> bool {
        self.0.get_bit(AVAILABLE)
    }

    pub fn is_32bit(self) -> bool {
        self.0.get_bit(DEFAULT_32)
    }

    pub fn is_page_granular(self) -> bool {
        self.0.get_bit(GRANULARITY)
    }

    fn set_type_bits(&mut self, ty: u8) {
        self.0.set_bits(TYPE, u64::from(ty));
    }
}

impl fmt::Debug for SegmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "SegmentDescriptor(0x{:016x})", self.0)
    }
}

/// Operand of `lgdt`/`lidt`: the limit and linear base of a descriptor table
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(C, packed)]
pub struct PseudoDescriptor {
    limit: u16,
    base: u32,
}

const _: () = assert!(mem::size_of::<PseudoDescriptor>() == 6);

impl PseudoDescriptor {
    pub const fn new(base: u32, limit: u16) -> Self {
        PseudoDescriptor { limit, base }
    }

    pub const fn base(&self) -> u32 {
        self.base
    }

    pub const fn limit(&self) -> u16 {
        self.limit
    }
}

impl fmt::Debug for PseudoDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (base, limit) = (self.base, self.limit);
        write!(f, "PseudoDescriptor {{ base: 0x{:x}, limit: 0x{:x} }}", base, limit)
    }
}

/// A descriptor table entry does not hold what was written there
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DescriptorCorruption {
    pub index: usize,
    pub found: SegmentDescriptor,
}

impl fmt::Display for DescriptorCorruption {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "descriptor {} corrupted: {:?}", self.index, self.found)
    }
}

/// Null, kernel code and data, user code and data, and the task descriptor, in that order
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(C, align(8))]
pub struct DescriptorTable {
    entries: [SegmentDescriptor; DESCRIPTOR_COUNT],
}

impl DescriptorTable {
    /// The flat kernel and user segments plus a task descriptor for `task`
    pub fn new(task: &TaskState) -> Self {
        Self::with_task_base(task.linear_address())
    }

    pub fn with_task_base(task_base: u32) -> Self {
        let code = SegmentType::EXECUTABLE | SegmentType::READ_WRITE;
        let data = SegmentType::READ_WRITE;

        let mut entries = [SegmentDescriptor::null(); DESCRIPTOR_COUNT];
        entries[SEG_KERNEL_CODE] =
            SegmentDescriptor::segment(code, 0, FLAT_LIMIT, PrivilegeLevel::Ring0);
        entries[SEG_KERNEL_DATA] =
            SegmentDescriptor::segment(data, 0, FLAT_LIMIT, PrivilegeLevel::Ring0);
        entries[SEG_USER_CODE] =
            SegmentDescriptor::segment(code, 0, FLAT_LIMIT, PrivilegeLevel::Ring3);
        entries[SEG_USER_DATA] =
            SegmentDescriptor::segment(data, 0, FLAT_LIMIT, PrivilegeLevel::Ring3);
        entries[SEG_TASK] = SegmentDescriptor::task_state(task_base, TaskState::SIZE - 1);

        DescriptorTable { entries }
    }

    pub fn entries(&self) -> &[SegmentDescriptor; DESCRIPTOR_COUNT] {
        &self.entries
    }

    pub fn pseudo_descriptor(&self) -> PseudoDescriptor {
        PseudoDescriptor::new(
            self as *const _ as usize as u32,
            (mem::size_of::<Self>() - 1) as u16,
        )
    }

    /// Rewrite the task descriptor for `task` at its current address, clearing the busy bit the
    /// previous `ltr` left behind. `ltr` faults on a busy descriptor.
    pub fn point_task_at(&mut self, task: &TaskState) {
        self.entries[SEG_TASK] =
            SegmentDescriptor::task_state(task.linear_address(), TaskState::SIZE - 1);
    }

    /// Check every entry against what [DescriptorTable::new] writes. The CPU may set the
    /// accessed bit of segments and the busy bit of the task descriptor.
    pub fn verify(&self, task: &TaskState) -> Result<(), DescriptorCorruption> {
        let expected = Self::with_task_base(task.linear_address());

        for (index, (found, expected)) in self.entries.iter().zip(expected.entries.iter()).enumerate() {
            let mut found_clean = *found;

            match found.system_type() {
                Some(SystemType::BusyTask32) if index == SEG_TASK => {
                    found_clean.set_type_bits(SystemType::AvailableTask32 as u8)
                }
                _ if !found.is_system() => {
                    found_clean.set_type_bits(found.type_bits() & !SegmentType::ACCESSED.bits())
                }
                _ => (),
            }

            if found_clean != *expected {
                return Err(DescriptorCorruption {
                    index,
                    found: *found,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selectors() {
        assert_eq!(KERNEL_CODE_SELECTOR.as_u16(), 0x08);
        assert_eq!(KERNEL_DATA_SELECTOR.as_u16(), 0x10);
        assert_eq!(USER_CODE_SELECTOR.as_u16(), 0x1B);
        assert_eq!(USER_DATA_SELECTOR.as_u16(), 0x23);
        assert_eq!(TASK_SELECTOR.as_u16(), 0x28);
        assert_eq!(USER_DATA_SELECTOR.rpl(), PrivilegeLevel::Ring3);
        assert_eq!(USER_DATA_SELECTOR.index(), 4);
    }

    #[test]
    fn flat_segments_pack_exactly() {
        let code = SegmentType::EXECUTABLE | SegmentType::READ_WRITE;
        let data = SegmentType::READ_WRITE;

        let kernel_code = SegmentDescriptor::segment(code, 0, FLAT_LIMIT, PrivilegeLevel::Ring0);
        let kernel_data = SegmentDescriptor::segment(data, 0, FLAT_LIMIT, PrivilegeLevel::Ring0);
        let user_code = SegmentDescriptor::segment(code, 0, FLAT_LIMIT, PrivilegeLevel::Ring3);
        let user_data = SegmentDescriptor::segment(data, 0, FLAT_LIMIT, PrivilegeLevel::Ring3);

        assert_eq!(kernel_code.raw(), 0x00CF_9A00_0000_FFFF);
        assert_eq!(kernel_data.raw(), 0x00CF_9200_0000_FFFF);
        assert_eq!(user_code.raw(), 0x00CF_FA00_0000_FFFF);
        assert_eq!(user_data.raw(), 0x00CF_F200_0000_FFFF);

        assert_eq!(kernel_code.limit(), FLAT_LIMIT);
        assert_eq!(user_code.to_bytes(), [0xFF, 0xFF, 0, 0, 0, 0xFA, 0xCF, 0]);
    }

    #[test]
    fn special_descriptors() {
        assert_eq!(SegmentDescriptor::null().raw(), 0);
        assert_eq!(SegmentDescriptor::faulting().raw(), 0x0040_9000_0000_0000);

        let task = SegmentDescriptor::task_state(0x1234_5678, 103);
        assert_eq!(task.raw(), 0x1240_8934_5678_0067);
        assert_eq!(task.base(), 0x1234_5678);
        assert_eq!(task.limit(), 103);
        assert_eq!(task.system_type(), Some(SystemType::AvailableTask32));
        assert_eq!(task.dpl(), PrivilegeLevel::Ring0);
    }

    #[test]
    fn byte_granular_segment() {
        let seg = SegmentDescriptor::byte_granular(
            SegmentType::READ_WRITE,
            0xDEAD_B000,
            0xF_FFFF,
            PrivilegeLevel::Ring3,
        );

        assert!(!seg.is_page_granular());
        assert!(seg.is_32bit());
        assert_eq!(seg.base(), 0xDEAD_B000);
        assert_eq!(seg.limit(), 0xF_FFFF);
        assert_eq!(seg.dpl(), PrivilegeLevel::Ring3);
        assert_eq!(seg.segment_type(), Some(SegmentType::READ_WRITE));
        assert!(!seg.is_available_bit_set());
    }

    #[test]
    fn table_is_well_formed() {
        let task = TaskState::default();
        let table = DescriptorTable::new(&task);
        let entries = table.entries();

        assert_eq!(entries.len(), DESCRIPTOR_COUNT);
        assert_eq!(entries[SEG_NULL], SegmentDescriptor::null());

        for &(index, dpl, executable) in &[
            (SEG_KERNEL_CODE, PrivilegeLevel::Ring0, true),
            (SEG_KERNEL_DATA, PrivilegeLevel::Ring0, false),
            (SEG_USER_CODE, PrivilegeLevel::Ring3, true),
            (SEG_USER_DATA, PrivilegeLevel::Ring3, false),
        ] {
            let ty = entries[index].segment_type().unwrap();
            assert_eq!(entries[index].dpl(), dpl);
            assert_eq!(ty.contains(SegmentType::EXECUTABLE), executable);
            assert!(ty.contains(SegmentType::READ_WRITE));
            assert!(entries[index].is_present());
        }

        assert_eq!(entries[SEG_TASK].base(), task.linear_address());
        assert_eq!(entries[SEG_TASK].limit(), TaskState::SIZE - 1);

        let pd = table.pseudo_descriptor();
        assert_eq!(pd.limit(), 47);
        assert_eq!(pd.base(), &table as *const _ as usize as u32);
        assert_eq!(table.verify(&task), Ok(()));
    }

    #[test]
    fn busy_task_is_made_available() {
        let task = TaskState::default();
        let mut table = DescriptorTable::new(&task);
        table.entries[SEG_TASK].set_type_bits(SystemType::BusyTask32 as u8);
        table.entries[SEG_KERNEL_DATA].set_type_bits(
            (SegmentType::READ_WRITE | SegmentType::ACCESSED).bits(),
        );

        // Both are changes the CPU makes itself
        assert_eq!(table.verify(&task), Ok(()));

        table.point_task_at(&task);
        assert_eq!(
            table.entries()[SEG_TASK].system_type(),
            Some(SystemType::AvailableTask32)
        );
    }

    #[test]
    fn task_descriptor_follows_a_moved_task() {
        let old = TaskState::default();
        let mut table = DescriptorTable::new(&old);

        let moved = Box::new(old);
        assert!(table.verify(&moved).is_err());

        table.point_task_at(&moved);
        assert_eq!(table.entries()[SEG_TASK].base(), moved.linear_address());
        assert_eq!(table.verify(&moved), Ok(()));
    }

    #[test]
    fn corruption_is_detected() {
        let task = TaskState::default();
        let mut table = DescriptorTable::new(&task);
        table.entries[SEG_USER_CODE] = SegmentDescriptor::faulting();

        let err = table.verify(&task).unwrap_err();
        assert_eq!(err.index, SEG_USER_CODE);

        let other = TaskState::default();
        let table = DescriptorTable::new(&other);
        assert_eq!(table.verify(&task).map_err(|e| e.index), Err(SEG_TASK));
    }
}
