//! Two-level i386 paging structures: linear addresses, page table entries, and page tables
//! living in physical frames.

use super::PhysicalMemory;
use crate::config::PAGE_SIZE;
use core::fmt;

/// Entries in a page directory or page table
pub const ENTRY_COUNT: usize = 1024;
/// Bytes of linear address space covered by one page directory entry
pub const TABLE_SPAN: u32 = ENTRY_COUNT as u32 * PAGE_SIZE;

const DIRECTORY_SHIFT: u32 = 22;
const TABLE_SHIFT: u32 = 12;
const INDEX_MASK: u32 = 0x3FF;
const OFFSET_MASK: u32 = 0xFFF;

/// A 32-bit linear address. The MMU splits it into a directory index (bits 22-31), a table
/// index (bits 12-21) and an offset within the page (bits 0-11).
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct LinearAddress(u32);

impl LinearAddress {
    pub const fn new(addr: u32) -> Self {
        LinearAddress(addr)
    }

    /// Reassemble an address from its three components. Panics if a component is out of range.
    pub fn from_parts(directory: usize, table: usize, offset: u32) -> Self {
        assert!(directory < ENTRY_COUNT, "Directory index {} out of range", directory);
        assert!(table < ENTRY_COUNT, "Table index {} out of range", table);
        assert!(offset <= OFFSET_MASK, "Page offset 0x{:x} out of range", offset);

        LinearAddress(
            ((directory as u32) << DIRECTORY_SHIFT) | ((table as u32) << TABLE_SHIFT) | offset,
        )
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn directory_index(self) -> usize {
        ((self.0 >> DIRECTORY_SHIFT) & INDEX_MASK) as usize
    }

    pub const fn table_index(self) -> usize {
        ((self.0 >> TABLE_SHIFT) & INDEX_MASK) as usize
    }

    pub const fn page_offset(self) -> u32 {
        self.0 & OFFSET_MASK
    }

    /// The page number, i.e. both indices together
    pub const fn page_number(self) -> u32 {
        self.0 >> TABLE_SHIFT
    }

    pub const fn page_start(self) -> LinearAddress {
        LinearAddress(self.0 & !OFFSET_MASK)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    pub fn checked_add(self, bytes: u32) -> Option<LinearAddress> {
        self.0.checked_add(bytes).map(LinearAddress)
    }
}

impl fmt::Debug for LinearAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LinearAddress(0x{:08x})", self.0)
    }
}

/// An entry in a page directory or page table: a 20-bit frame number and 12 flag bits
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn unused() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: u32, flags: EntryFlags) -> Self {
        // Check that the physical address is page aligned
        assert_eq!(
            frame & OFFSET_MASK,
            0,
            "Physical address 0x{:x} not page aligned!",
            frame
        );

        PageTableEntry(frame | flags.bits())
    }

    pub const fn from_raw(raw: u32) -> Self {
        PageTableEntry(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    /// Physical address of the frame, if present
    pub fn frame(self) -> Option<u32> {
        if self.is_present() {
            Some(self.0 & !OFFSET_MASK) // Mask out the flag bits
        } else {
            None
        }
    }

    pub const fn frame_number(self) -> u32 {
        self.0 >> TABLE_SHIFT
    }

    pub fn set_unused(&mut self) {
        self.0 = 0;
    }

    /// Replace the flags, keeping the frame
    pub fn set_flags(&mut self, flags: EntryFlags) {
        self.0 = (self.0 & !OFFSET_MASK) | flags.bits();
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &format_args!("0x{:x}", self.0 & !OFFSET_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}

bitflags::bitflags! {
    pub struct EntryFlags: u32 {
        /// Whether the page is present in memory
        const PRESENT = 1;
        /// Whether the page is writable or read only
        const WRITABLE = 1 << 1;
        /// Whether ring 3 code can access this page
        const USER_ACCESSIBLE = 1 << 2;
        /// If this bit is set, writes to this page go directly to memory
        const WRITE_THROUGH = 1 << 3;
        /// Do not use cache for this page
        const NO_CACHE = 1 << 4;
        /// Set by the CPU when this page has been accessed
        const ACCESSED = 1 << 5;
        /// Set by the CPU when this page is written to
        const DIRTY = 1 << 6;
        /// 4MiB page in a directory entry. Must be zero in a table entry
        const LARGE_PAGE = 1 << 7;
        /// Ignored by the MMU and free for software use
        const AVAILABLE = 0b111 << 9;

        /// The only bits a request from user space may set
        const USER_REQUESTABLE = Self::AVAILABLE.bits
            | Self::PRESENT.bits
            | Self::WRITABLE.bits
            | Self::USER_ACCESSIBLE.bits;
    }
}

impl EntryFlags {
    /// Mask a raw flag word received from user space down to [EntryFlags::USER_REQUESTABLE]
    pub const fn from_user_request(bits: u32) -> EntryFlags {
        EntryFlags::from_bits_truncate(bits & EntryFlags::USER_REQUESTABLE.bits())
    }
}

/// A page directory or page table occupying one physical frame
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageTable {
    frame: u32,
}

impl PageTable {
    pub fn new(frame: u32) -> Self {
        assert_eq!(
            frame & OFFSET_MASK,
            0,
            "Page table 0x{:x} not page aligned!",
            frame
        );

        PageTable { frame }
    }

    pub const fn frame(self) -> u32 {
        self.frame
    }

    pub fn entry<M: PhysicalMemory + ?Sized>(self, memory: &M, index: usize) -> PageTableEntry {
        PageTableEntry(memory.read_u32(self.entry_address(index)))
    }

    pub fn set_entry<M: PhysicalMemory + ?Sized>(
        self,
        memory: &mut M,
        index: usize,
        entry: PageTableEntry,
    ) {
        memory.write_u32(self.entry_address(index), entry.raw());
    }

    /// Mark every entry unused
    pub fn clear<M: PhysicalMemory + ?Sized>(self, memory: &mut M) {
        memory.zero(self.frame, PAGE_SIZE as usize);
    }

    fn entry_address(self, index: usize) -> u32 {
        assert!(index < ENTRY_COUNT, "Page table index {} out of range", index);
        self.frame + index as u32 * 4
    }
}
