use crate::gdt::SegmentSelector;
use core::mem;

/// The 32-bit task-state block. Only the ring 0 stack fields are used: the CPU loads them when
/// a trap raises the privilege level. Switching itself is done in software.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
#[repr(C)]
pub struct TaskState {
    pub link: u32,
    pub esp0: u32,
    pub ss0: u16,
    _pad0: u16,
    pub esp1: u32,
    pub ss1: u16,
    _pad1: u16,
    pub esp2: u32,
    pub ss2: u16,
    _pad2: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    _pad3: u16,
    pub cs: u16,
    _pad4: u16,
    pub ss: u16,
    _pad5: u16,
    pub ds: u16,
    _pad6: u16,
    pub fs: u16,
    _pad7: u16,
    pub gs: u16,
    _pad8: u16,
    pub ldt: u16,
    _pad9: u16,
    /// Raise a debug exception on task switch
    pub trap: u16,
    pub iomap_base: u16,
}

const _: () = assert!(mem::size_of::<TaskState>() == TaskState::SIZE as usize);
const _: () = assert!(mem::offset_of!(TaskState, esp0) == 4);
const _: () = assert!(mem::offset_of!(TaskState, ss0) == 8);
const _: () = assert!(mem::offset_of!(TaskState, cr3) == 28);
const _: () = assert!(mem::offset_of!(TaskState, iomap_base) == 102);

impl TaskState {
    pub const SIZE: u32 = 104;

    /// A task-state block whose ring 0 stack is `ss0:esp0`. The IO bitmap lies past the limit,
    /// so ring 3 has no port access.
    pub fn new(ss0: SegmentSelector, esp0: u32) -> Self {
        TaskState {
            ss0: ss0.as_u16(),
            esp0,
            iomap_base: Self::SIZE as u16,
            ..TaskState::default()
        }
    }

    pub fn linear_address(&self) -> u32 {
        self as *const _ as usize as u32
    }
}
