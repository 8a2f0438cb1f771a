//! A simulated physical memory for host tests.

use super::{OutOfMemory, PhysRegion, PhysicalMemory, RegionAllocator};
use core::ops::Range;

/// Physical address of the first byte of the arena
pub const ARENA_BASE: u32 = 0x0010_0000;

/// Freshly allocated memory is filled with this byte
pub const GARBAGE: u8 = 0xA5;

/// A byte arena with a first-fit allocator on top. Allocations are filled with garbage and can be
/// made to fail on demand. Outstanding bytes are whatever the allocator does not hold as free,
/// so tests catch leaks in the allocator as well as in its callers.
pub struct SimulatedMemory {
    arena: Vec<u8>,
    allocator: RegionAllocator,
    fail_after: Option<usize>,
}

impl SimulatedMemory {
    pub fn new(size: u32) -> Self {
        let mut allocator = RegionAllocator::new();
        allocator.add_range(ARENA_BASE, ARENA_BASE + size);

        SimulatedMemory {
            arena: vec![GARBAGE; size as usize],
            allocator,
            fail_after: None,
        }
    }

    /// Bytes currently allocated and not yet freed
    pub fn outstanding(&self) -> u32 {
        self.arena.len() as u32 - self.allocator.free_bytes()
    }

    /// Let the next `allocations` allocations succeed and fail every one after that
    pub fn fail_after(&mut self, allocations: usize) {
        self.fail_after = Some(allocations);
    }

    pub fn stop_failing(&mut self) {
        self.fail_after = None;
    }

    fn range(&self, addr: u32, len: usize) -> Range<usize> {
        let start = addr
            .checked_sub(ARENA_BASE)
            .unwrap_or_else(|| panic!("Physical address 0x{:x} below the arena", addr))
            as usize;
        assert!(
            start + len <= self.arena.len(),
            "Physical range 0x{:x}+0x{:x} beyond the arena",
            addr,
            len
        );

        start..start + len
    }
}

impl PhysicalMemory for SimulatedMemory {
    fn allocate(&mut self, size: u32) -> Result<PhysRegion, OutOfMemory> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(OutOfMemory);
            }
            *remaining -= 1;
        }

        let region = self.allocator.allocate(size)?;
        let range = self.range(region.start(), region.size() as usize);
        for byte in &mut self.arena[range] {
            *byte = GARBAGE;
        }

        Ok(region)
    }

    fn free(&mut self, region: PhysRegion) {
        self.allocator.free(region);
    }

    fn bytes(&self, addr: u32, len: usize) -> &[u8] {
        let range = self.range(addr, len);
        &self.arena[range]
    }

    fn bytes_mut(&mut self, addr: u32, len: usize) -> &mut [u8] {
        let range = self.range(addr, len);
        &mut self.arena[range]
    }
}
