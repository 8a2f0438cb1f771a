//! Page directories for the kernel and for each process.
//!
//! Every address space shares the kernel's identity mapped page tables: the kernel's directory
//! entries are copied into each new directory, so the tables themselves are never duplicated
//! and must never be modified or freed through a process's address space.

use super::paging::{EntryFlags, LinearAddress, PageTable, PageTableEntry, ENTRY_COUNT, TABLE_SPAN};
use super::{OutOfMemory, PhysRegion, PhysicalMemory};
use crate::config::{PAGE_SIZE, USER_BASE};
use crate::util::round_up_divide;
use core::fmt;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MapError {
    /// A page table could not be allocated
    OutOfMemory,
    /// The page is already mapped
    AlreadyMapped(LinearAddress),
    /// The address is unaligned or lies in the shared kernel window
    InvalidAddress(LinearAddress),
}

impl MapError {
    pub fn description(&self) -> &'static str {
        match self {
            MapError::OutOfMemory => "out of memory for page tables",
            MapError::AlreadyMapped(_) => "page already mapped",
            MapError::InvalidAddress(_) => "invalid page address",
        }
    }
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::OutOfMemory => f.write_str(self.description()),
            MapError::AlreadyMapped(addr) | MapError::InvalidAddress(addr) => {
                write!(f, "{} at {:?}", self.description(), addr)
            }
        }
    }
}

impl From<OutOfMemory> for MapError {
    fn from(_: OutOfMemory) -> Self {
        MapError::OutOfMemory
    }
}

/// A linear range could not be accessed through an address space
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UserAccessError {
    NotMapped(LinearAddress),
    /// The page is mapped without the permissions the access needs
    NotPermitted(LinearAddress),
}

impl UserAccessError {
    pub fn description(&self) -> &'static str {
        match self {
            UserAccessError::NotMapped(_) => "address not mapped",
            UserAccessError::NotPermitted(_) => "access not permitted",
        }
    }
}

impl fmt::Display for UserAccessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (UserAccessError::NotMapped(addr) | UserAccessError::NotPermitted(addr)) = self;
        write!(f, "{} at {:?}", self.description(), addr)
    }
}

/// The kernel's identity mapping of `0..limit`, supervisor only
#[derive(Debug)]
pub struct KernelSpace {
    directory: PageTable,
    shared_entries: usize,
}

impl KernelSpace {
    pub fn new<M: PhysicalMemory>(memory: &mut M, limit: u32) -> Result<Self, OutOfMemory> {
        assert_eq!(limit % TABLE_SPAN, 0, "Identity limit must be 4MiB aligned");
        assert!(limit <= USER_BASE, "Identity map overlaps the user window");

        let directory = PageTable::new(memory.allocate_page()?);
        directory.clear(memory);

        let shared_entries = (limit / TABLE_SPAN) as usize;
        let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;

        for dir_index in 0..shared_entries {
            let table = match memory.allocate_page() {
                Ok(frame) => PageTable::new(frame),
                Err(e) => {
                    for built in 0..dir_index {
                        if let Some(frame) = directory.entry(memory, built).frame() {
                            memory.free_page(frame);
                        }
                    }
                    memory.free_page(directory.frame());
                    return Err(e);
                }
            };

            let base = dir_index as u32 * TABLE_SPAN;
            for table_index in 0..ENTRY_COUNT {
                let frame = base + table_index as u32 * PAGE_SIZE;
                table.set_entry(memory, table_index, PageTableEntry::new(frame, flags));
            }

            directory.set_entry(memory, dir_index, PageTableEntry::new(table.frame(), flags));
        }

        debug!(
            "paging: kernel identity map 0x0..0x{:x} in {} tables",
            limit, shared_entries
        );

        Ok(KernelSpace {
            directory,
            shared_entries,
        })
    }

    /// Physical address of the kernel's own page directory, loaded while idle
    pub fn directory_frame(&self) -> u32 {
        self.directory.frame()
    }

    /// Number of leading directory entries shared with every address space
    pub fn shared_entries(&self) -> usize {
        self.shared_entries
    }

    pub fn limit(&self) -> u32 {
        self.shared_entries as u32 * TABLE_SPAN
    }
}

/// A process's page directory. Owns its directory frame, every page table above the shared
/// kernel window, and any mapped frame that is not part of the process's own memory region.
#[derive(Debug, Eq, PartialEq)]
pub struct AddressSpace {
    directory: PageTable,
    shared_entries: usize,
}

impl AddressSpace {
    /// An address space containing only the kernel's identity mapping
    pub fn new<M: PhysicalMemory>(
        memory: &mut M,
        kernel: &KernelSpace,
    ) -> Result<Self, OutOfMemory> {
        let directory = PageTable::new(memory.allocate_page()?);
        directory.clear(memory);

        for index in 0..kernel.shared_entries() {
            let entry = kernel.directory.entry(memory, index);
            directory.set_entry(memory, index, entry);
        }

        Ok(AddressSpace {
            directory,
            shared_entries: kernel.shared_entries(),
        })
    }

    /// Build an address space mapping `user` read/write at [USER_BASE]. Nothing is left
    /// allocated on failure.
    pub fn build<M: PhysicalMemory>(
        memory: &mut M,
        kernel: &KernelSpace,
        user: PhysRegion,
    ) -> Result<Self, MapError> {
        let mut space = Self::new(memory, kernel)?;
        let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE;

        match space.map_range(
            memory,
            LinearAddress::new(USER_BASE),
            user.start(),
            user.size(),
            flags,
        ) {
            Ok(()) => Ok(space),
            Err(e) => {
                space.destroy(memory, user);
                Err(e)
            }
        }
    }

    /// Physical address of the page directory, for `cr3`
    pub fn directory_frame(&self) -> u32 {
        self.directory.frame()
    }

    pub fn map<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        addr: LinearAddress,
        frame: u32,
        flags: EntryFlags,
    ) -> Result<(), MapError> {
        if !addr.is_page_aligned() || addr.directory_index() < self.shared_entries {
            return Err(MapError::InvalidAddress(addr));
        }

        let dir_entry = self.directory.entry(memory, addr.directory_index());
        let table = match dir_entry.frame() {
            Some(frame) => PageTable::new(frame),
            None => {
                let table = PageTable::new(memory.allocate_page()?);
                table.clear(memory);

                // Permissions are enforced per page, so directory entries are permissive
                let dir_flags =
                    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE;
                self.directory.set_entry(
                    memory,
                    addr.directory_index(),
                    PageTableEntry::new(table.frame(), dir_flags),
                );
                table
            }
        };

        if table.entry(memory, addr.table_index()).is_present() {
            return Err(MapError::AlreadyMapped(addr));
        }

        let entry = PageTableEntry::new(frame, flags | EntryFlags::PRESENT);
        table.set_entry(memory, addr.table_index(), entry);
        Ok(())
    }

    /// Map `len` bytes of contiguous physical memory at `start`. On failure the pages mapped by
    /// this call are unmapped again.
    pub fn map_range<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        start: LinearAddress,
        phys: u32,
        len: u32,
        flags: EntryFlags,
    ) -> Result<(), MapError> {
        let pages = round_up_divide(len, PAGE_SIZE);

        for page in 0..pages {
            let offset = page * PAGE_SIZE;
            let result = match start.checked_add(offset) {
                Some(addr) => self.map(memory, addr, phys + offset, flags),
                None => Err(MapError::InvalidAddress(start)),
            };

            if let Err(e) = result {
                for mapped in 0..page {
                    self.unmap(memory, LinearAddress::new(start.as_u32() + mapped * PAGE_SIZE));
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Remove a mapping, returning the old entry. The caller invalidates the TLB entry and
    /// decides what happens to the frame.
    pub fn unmap<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        addr: LinearAddress,
    ) -> Option<PageTableEntry> {
        let (table, entry) = self.lookup(memory, addr)?;
        table.set_entry(memory, addr.table_index(), PageTableEntry::unused());
        Some(entry)
    }

    /// Replace the flags of a mapped page. Returns false if the page is not mapped.
    pub fn set_flags<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        addr: LinearAddress,
        flags: EntryFlags,
    ) -> bool {
        match self.lookup(memory, addr) {
            Some((table, mut entry)) => {
                entry.set_flags(flags | EntryFlags::PRESENT);
                table.set_entry(memory, addr.table_index(), entry);
                true
            }
            None => false,
        }
    }

    /// The physical address `addr` maps to, and the flags of its page
    pub fn translate<M: PhysicalMemory>(
        &self,
        memory: &M,
        addr: LinearAddress,
    ) -> Option<(u32, EntryFlags)> {
        let dir_entry = self.directory.entry(memory, addr.directory_index());
        let table = PageTable::new(dir_entry.frame()?);
        let entry = table.entry(memory, addr.table_index());

        entry
            .frame()
            .map(|frame| (frame + addr.page_offset(), entry.flags()))
    }

    /// Kernel-side write through the page tables, ignoring page protections
    pub fn write_user<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        addr: LinearAddress,
        bytes: &[u8],
    ) -> Result<(), UserAccessError> {
        let mut done = 0;

        while done < bytes.len() {
            let (phys, n) = self.resolve(memory, addr, done, bytes.len(), EntryFlags::PRESENT)?;
            memory
                .bytes_mut(phys, n)
                .copy_from_slice(&bytes[done..done + n]);
            done += n;
        }

        Ok(())
    }

    pub fn zero_user<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        addr: LinearAddress,
        len: usize,
    ) -> Result<(), UserAccessError> {
        let mut done = 0;

        while done < len {
            let (phys, n) = self.resolve(memory, addr, done, len, EntryFlags::PRESENT)?;
            memory.zero(phys, n);
            done += n;
        }

        Ok(())
    }

    /// Read user memory on behalf of a process. Every page must be user accessible.
    pub fn copy_from_user<M: PhysicalMemory>(
        &self,
        memory: &M,
        addr: LinearAddress,
        buf: &mut [u8],
    ) -> Result<(), UserAccessError> {
        let mut done = 0;
        let required = EntryFlags::PRESENT | EntryFlags::USER_ACCESSIBLE;

        while done < buf.len() {
            let (phys, n) = self.resolve(memory, addr, done, buf.len(), required)?;
            buf[done..done + n].copy_from_slice(memory.bytes(phys, n));
            done += n;
        }

        Ok(())
    }

    /// Copy every page mapped outside of `owned` into a fresh frame, mapped at the same address
    /// and with the same permissions in `child`.
    pub fn duplicate_foreign_pages<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        owned: PhysRegion,
        child: &mut AddressSpace,
    ) -> Result<(), MapError> {
        for dir_index in self.shared_entries..ENTRY_COUNT {
            let table = match self.directory.entry(memory, dir_index).frame() {
                Some(frame) => PageTable::new(frame),
                None => continue,
            };

            for table_index in 0..ENTRY_COUNT {
                let entry = table.entry(memory, table_index);
                let frame = match entry.frame() {
                    Some(frame) if !owned.contains(frame) => frame,
                    _ => continue,
                };

                let addr = LinearAddress::from_parts(dir_index, table_index, 0);
                let copy = memory.allocate_page()?;
                memory.copy(frame, copy, PAGE_SIZE as usize);

                let flags = entry.flags() - (EntryFlags::ACCESSED | EntryFlags::DIRTY);
                if let Err(e) = child.map(memory, addr, copy, flags) {
                    memory.free_page(copy);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Free the directory, every private page table, and every mapped frame outside of `owned`.
    /// `owned` itself stays with the caller.
    pub fn destroy<M: PhysicalMemory>(self, memory: &mut M, owned: PhysRegion) {
        for dir_index in self.shared_entries..ENTRY_COUNT {
            let table = match self.directory.entry(memory, dir_index).frame() {
                Some(frame) => PageTable::new(frame),
                None => continue,
            };

            for table_index in 0..ENTRY_COUNT {
                match table.entry(memory, table_index).frame() {
                    Some(frame) if !owned.contains(frame) => memory.free_page(frame),
                    _ => (),
                }
            }

            memory.free_page(table.frame());
        }

        memory.free_page(self.directory.frame());
    }

    fn lookup<M: PhysicalMemory>(
        &self,
        memory: &M,
        addr: LinearAddress,
    ) -> Option<(PageTable, PageTableEntry)> {
        if addr.directory_index() < self.shared_entries {
            return None;
        }

        let table = PageTable::new(self.directory.entry(memory, addr.directory_index()).frame()?);
        let entry = table.entry(memory, addr.table_index());

        if entry.is_present() {
            Some((table, entry))
        } else {
            None
        }
    }

    /// Physical address of byte `done` of an access starting at `start`, and how many bytes of
    /// the access fit in the rest of its page.
    fn resolve<M: PhysicalMemory>(
        &self,
        memory: &M,
        start: LinearAddress,
        done: usize,
        len: usize,
        required: EntryFlags,
    ) -> Result<(u32, usize), UserAccessError> {
        let addr = start
            .checked_add(done as u32)
            .ok_or(UserAccessError::NotMapped(start))?;
        let (phys, flags) = self
            .translate(memory, addr)
            .ok_or(UserAccessError::NotMapped(addr))?;

        if !flags.contains(required) {
            return Err(UserAccessError::NotPermitted(addr));
        }

        let n = (len - done).min((PAGE_SIZE - addr.page_offset()) as usize);
        Ok((phys, n))
    }
}
