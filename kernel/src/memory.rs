//! Physical memory and address spaces.
//!
//! The kernel never touches physical memory directly outside of a [PhysicalMemory]
//! implementation: on bare metal this is the identity map, in tests it is a byte arena.

pub mod address_space;
pub mod paging;
mod region_allocator;
#[cfg(test)]
pub mod sim;

pub use self::region_allocator::RegionAllocator;

use crate::config::PAGE_SIZE;
use core::fmt;

/// The physical allocator could not satisfy a request
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("out of physical memory")
    }
}

/// A page aligned, contiguous range of physical memory
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct PhysRegion {
    start: u32,
    size: u32,
}

impl PhysRegion {
    pub const fn new(start: u32, size: u32) -> Self {
        PhysRegion { start, size }
    }

    pub const fn start(&self) -> u32 {
        self.start
    }

    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Exclusive end address
    pub const fn end(&self) -> u32 {
        self.start + self.size
    }

    pub const fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Access to physical memory and to the allocator that hands it out.
///
/// Fresh allocations are never assumed to be zeroed.
pub trait PhysicalMemory {
    /// Allocate a page aligned region of at least `size` bytes
    fn allocate(&mut self, size: u32) -> Result<PhysRegion, OutOfMemory>;

    fn free(&mut self, region: PhysRegion);

    fn bytes(&self, addr: u32, len: usize) -> &[u8];

    fn bytes_mut(&mut self, addr: u32, len: usize) -> &mut [u8];

    fn allocate_page(&mut self) -> Result<u32, OutOfMemory> {
        self.allocate(PAGE_SIZE).map(|region| region.start())
    }

    fn free_page(&mut self, frame: u32) {
        self.free(PhysRegion::new(frame, PAGE_SIZE))
    }

    fn read_u32(&self, addr: u32) -> u32 {
        let mut word = [0; 4];
        word.copy_from_slice(self.bytes(addr, 4));
        u32::from_le_bytes(word)
    }

    fn write_u32(&mut self, addr: u32, value: u32) {
        self.bytes_mut(addr, 4).copy_from_slice(&value.to_le_bytes());
    }

    fn zero(&mut self, addr: u32, len: usize) {
        for byte in self.bytes_mut(addr, len) {
            *byte = 0;
        }
    }

    /// Copy `len` bytes between two non-overlapping physical ranges
    fn copy(&mut self, src: u32, dst: u32, len: usize) {
        let mut bounce = [0u8; 512];
        let mut done = 0;

        while done < len {
            let n = (len - done).min(bounce.len());
            bounce[..n].copy_from_slice(self.bytes(src + done as u32, n));
            self.bytes_mut(dst + done as u32, n).copy_from_slice(&bounce[..n]);
            done += n;
        }
    }
}
