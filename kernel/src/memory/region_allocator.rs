use super::{OutOfMemory, PhysRegion};
use crate::config::{IDENTITY_LIMIT, PAGE_SIZE};
use crate::util::{align_down, checked_align_up};
use bit_field::BitArray;

/// Frames the allocator can hand out: everything below the identity map limit
const FRAME_COUNT: usize = (IDENTITY_LIMIT / PAGE_SIZE) as usize;
const BITMAP_WORDS: usize = FRAME_COUNT / 64;

/// First-fit physical allocator with one bit per frame, set while the frame is free. Regions are
/// page granular and contiguous.
#[derive(Debug, Clone)]
pub struct RegionAllocator {
    free: [u64; BITMAP_WORDS],
    free_frames: usize,
}

impl Default for RegionAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionAllocator {
    pub fn new() -> Self {
        RegionAllocator {
            free: [0; BITMAP_WORDS],
            free_frames: 0,
        }
    }

    /// Hand the range `start..end` to the allocator. Partial pages at either end are dropped, as
    /// is anything above the identity map limit.
    pub fn add_range(&mut self, start: u32, end: u32) {
        let start = match checked_align_up(start, PAGE_SIZE) {
            Some(start) => start,
            None => return,
        };
        let end = align_down(end.min(IDENTITY_LIMIT), PAGE_SIZE);

        if start < end {
            self.release(start, end);
        }
    }

    pub fn allocate(&mut self, size: u32) -> Result<PhysRegion, OutOfMemory> {
        let size = checked_align_up(size.max(1), PAGE_SIZE).ok_or(OutOfMemory)?;
        let frames = (size / PAGE_SIZE) as usize;
        let first = self.find_run(frames).ok_or(OutOfMemory)?;

        for frame in first..first + frames {
            self.free.set_bit(frame, false);
        }
        self.free_frames -= frames;

        Ok(PhysRegion::new(first as u32 * PAGE_SIZE, size))
    }

    pub fn free(&mut self, region: PhysRegion) {
        assert_eq!(
            region.start() % PAGE_SIZE,
            0,
            "Freed region 0x{:x} not page aligned!",
            region.start()
        );

        if !region.is_empty() {
            let end = checked_align_up(region.end(), PAGE_SIZE)
                .expect("Freed region wraps the address space!");
            assert!(
                end <= IDENTITY_LIMIT,
                "Freed region 0x{:x}..0x{:x} was never managed",
                region.start(),
                end
            );
            self.release(region.start(), end);
        }
    }

    /// Total number of free bytes
    pub fn free_bytes(&self) -> u32 {
        self.free_frames as u32 * PAGE_SIZE
    }

    /// Lowest frame starting `frames` consecutive free frames
    fn find_run(&self, frames: usize) -> Option<usize> {
        if frames > self.free_frames {
            return None;
        }

        let mut run = 0;
        let mut frame = 0;
        while frame < FRAME_COUNT {
            // Whole words of allocated frames
            if frame % 64 == 0 && self.free[frame / 64] == 0 {
                run = 0;
                frame += 64;
                continue;
            }

            if self.free.get_bit(frame) {
                run += 1;
                if run == frames {
                    return Some(frame + 1 - frames);
                }
            } else {
                run = 0;
            }
            frame += 1;
        }

        None
    }

    fn release(&mut self, start: u32, end: u32) {
        let frames = (start / PAGE_SIZE) as usize..(end / PAGE_SIZE) as usize;

        assert!(
            frames.clone().all(|frame| !self.free.get_bit(frame)),
            "Double free of physical range 0x{:x}..0x{:x}",
            start,
            end
        );

        for frame in frames.clone() {
            self.free.set_bit(frame, true);
        }
        self.free_frames += frames.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> RegionAllocator {
        let mut allocator = RegionAllocator::new();
        allocator.add_range(0x10_0000, 0x20_0000);
        allocator
    }

    #[test]
    fn first_fit_and_rounding() {
        let mut allocator = allocator();
        let a = allocator.allocate(1).unwrap();
        let b = allocator.allocate(PAGE_SIZE + 1).unwrap();

        assert_eq!(a, PhysRegion::new(0x10_0000, PAGE_SIZE));
        assert_eq!(b, PhysRegion::new(0x10_1000, 2 * PAGE_SIZE));
        assert_eq!(allocator.free_bytes(), 0x10_0000 - 3 * PAGE_SIZE);
    }

    #[test]
    fn freed_neighbours_join_up() {
        let mut allocator = allocator();
        let a = allocator.allocate(PAGE_SIZE).unwrap();
        let b = allocator.allocate(PAGE_SIZE).unwrap();
        let c = allocator.allocate(PAGE_SIZE).unwrap();

        allocator.free(a);
        allocator.free(c);

        // The hole left by `a` is too small, the one starting at `c` is not
        let d = allocator.allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(d.start(), c.start());

        allocator.free(d);
        allocator.free(b);
        let all = allocator.allocate(0x10_0000).unwrap();
        assert_eq!(all.start(), 0x10_0000);
    }

    #[test]
    fn scattered_frees_are_all_returned() {
        let mut allocator = allocator();
        let pages: Vec<_> = (0..200).map(|_| allocator.allocate(PAGE_SIZE).unwrap()).collect();

        for page in pages.iter().step_by(2) {
            allocator.free(*page);
        }
        for page in pages.iter().skip(1).step_by(2) {
            allocator.free(*page);
        }

        assert_eq!(allocator.free_bytes(), 0x10_0000);
        assert!(allocator.allocate(0x10_0000).is_ok());
    }

    #[test]
    fn exhaustion() {
        let mut allocator = allocator();
        assert_eq!(allocator.allocate(0x20_0000), Err(OutOfMemory));
        let all = allocator.allocate(0x10_0000).unwrap();
        assert_eq!(allocator.allocate(1), Err(OutOfMemory));
        allocator.free(all);
        assert!(allocator.allocate(1).is_ok());
    }

    #[test]
    fn partial_pages_dropped() {
        let mut allocator = RegionAllocator::new();
        allocator.add_range(0x1001, 0x3fff);
        assert_eq!(allocator.free_bytes(), PAGE_SIZE);
    }

    #[test]
    fn memory_past_the_identity_map_is_ignored() {
        let mut allocator = RegionAllocator::new();
        allocator.add_range(IDENTITY_LIMIT - PAGE_SIZE, IDENTITY_LIMIT + 0x10_0000);
        assert_eq!(allocator.free_bytes(), PAGE_SIZE);

        allocator.add_range(IDENTITY_LIMIT, u32::MAX);
        assert_eq!(allocator.free_bytes(), PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "Double free")]
    fn double_free_is_fatal() {
        let mut allocator = allocator();
        let a = allocator.allocate(PAGE_SIZE).unwrap();
        allocator.free(a);
        allocator.free(a);
    }
}
