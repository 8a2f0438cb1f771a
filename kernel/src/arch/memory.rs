use crate::memory::{OutOfMemory, PhysRegion, PhysicalMemory, RegionAllocator};
use core::slice;

/// Physical memory reached through the identity map. Paging may be on or off: the allocator
/// only holds memory below the identity limit.
pub struct IdentityMemory {
    allocator: RegionAllocator,
}

impl IdentityMemory {
    pub fn new(allocator: RegionAllocator) -> Self {
        IdentityMemory { allocator }
    }
}

impl PhysicalMemory for IdentityMemory {
    fn allocate(&mut self, size: u32) -> Result<PhysRegion, OutOfMemory> {
        self.allocator.allocate(size)
    }

    fn free(&mut self, region: PhysRegion) {
        self.allocator.free(region)
    }

    fn bytes(&self, addr: u32, len: usize) -> &[u8] {
        // SAFETY: every address the kernel passes is identity mapped and owned by it
        unsafe { slice::from_raw_parts(addr as usize as *const u8, len) }
    }

    fn bytes_mut(&mut self, addr: u32, len: usize) -> &mut [u8] {
        // SAFETY: as above
        unsafe { slice::from_raw_parts_mut(addr as usize as *mut u8, len) }
    }
}
