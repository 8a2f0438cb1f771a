//! The process table: a fixed-capacity arena of process control blocks.
//!
//! # Process memory
//!
//! Each process owns one contiguous physical region below the identity limit:
//!
//! | Region offset                    | Contents                                       |
//! |----------------------------------|------------------------------------------------|
//! | `0` ~ `KERNEL_STACK_SIZE`        | Private kernel stack, trap frame at the top    |
//! | `KERNEL_STACK_SIZE` ~ region end | User memory, mapped at `USER_BASE`             |
//!
//! The kernel stack is reached through the identity map, so it stays addressable under every
//! page directory and never moves while the process exists.

use crate::config::{KERNEL_STACK_SIZE, MAX_PROCESSES, PAGE_SIZE};
use crate::elf::{ElfImage, ImageError};
use crate::gdt::{DescriptorCorruption, DescriptorTable, PseudoDescriptor, KERNEL_DATA_SELECTOR};
use crate::hardware::Context;
use crate::interrupts::{TrapFrame, TRAP_FRAME_SIZE};
use crate::memory::address_space::{AddressSpace, KernelSpace, MapError};
use crate::memory::paging::{EntryFlags, LinearAddress};
use crate::memory::{OutOfMemory, PhysRegion, PhysicalMemory};
use crate::tss::TaskState;
use crate::util::align_down;
use core::fmt;
use core::ops::{Index, IndexMut};

/// Index of a slot in the process table
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProcessHandle(usize);

impl ProcessHandle {
    pub fn new(index: usize) -> Self {
        assert!(index < MAX_PROCESSES, "Process index {} out of range", index);
        ProcessHandle(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// The id user space sees. Never zero, since fork returns zero in the child.
    pub const fn pid(self) -> u32 {
        self.0 as u32 + 1
    }

    pub fn from_pid(pid: u32) -> Option<Self> {
        match pid.checked_sub(1) {
            Some(index) if (index as usize) < MAX_PROCESSES => Some(ProcessHandle(index as usize)),
            _ => None,
        }
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "pid {}", self.pid())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessState {
    Unused,
    Runnable,
    /// Blocked until a child exits
    Waiting,
}

impl Default for ProcessState {
    fn default() -> Self {
        ProcessState::Unused
    }
}

/// What a new process starts from
#[derive(Copy, Clone, Debug)]
pub enum Origin<'a> {
    /// A fresh process running an executable
    Image(&'a ElfImage<'a>),
    /// A copy of `parent`, resuming from `frame` with a zero return value
    Fork {
        parent: ProcessHandle,
        frame: &'a TrapFrame,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProcessError {
    /// No unused slot
    TableFull,
    OutOfMemory,
    /// The allocator returned memory the kernel cannot reach through its identity map
    OutsideIdentityMap,
    Image(ImageError),
    Map(MapError),
}

impl ProcessError {
    pub fn description(&self) -> &'static str {
        match self {
            ProcessError::TableFull => "process table full",
            ProcessError::OutOfMemory => "out of physical memory",
            ProcessError::OutsideIdentityMap => "process memory outside the identity map",
            ProcessError::Image(e) => e.description(),
            ProcessError::Map(e) => e.description(),
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessError::Image(e) => write!(f, "bad image: {}", e),
            ProcessError::Map(e) => write!(f, "mapping failed: {}", e),
            _ => f.write_str(self.description()),
        }
    }
}

impl From<OutOfMemory> for ProcessError {
    fn from(_: OutOfMemory) -> Self {
        ProcessError::OutOfMemory
    }
}

impl From<ImageError> for ProcessError {
    fn from(e: ImageError) -> Self {
        ProcessError::Image(e)
    }
}

impl From<MapError> for ProcessError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => ProcessError::OutOfMemory,
            e => ProcessError::Map(e),
        }
    }
}

/// A process control block
#[derive(Debug, Default)]
pub struct Process {
    state: ProcessState,
    /// Kernel stack followed by user memory
    memory: PhysRegion,
    /// Bytes of user memory mapped at `USER_BASE`
    user_size: u32,
    address_space: Option<AddressSpace>,
    pub(crate) tss: TaskState,
    pub(crate) gdt: DescriptorTable,
    pub(crate) gdt_pd: PseudoDescriptor,
    /// Saved while the process is not running
    pub(crate) context: Context,
    /// Physical (and kernel linear) address of the trap frame
    trap_frame: u32,
    parent: Option<ProcessHandle>,
    exited_child: Option<ProcessHandle>,
}

impl Process {
    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn memory(&self) -> PhysRegion {
        self.memory
    }

    pub fn user_memory(&self) -> PhysRegion {
        PhysRegion::new(self.memory.start() + KERNEL_STACK_SIZE, self.user_size)
    }

    pub fn kernel_stack_top(&self) -> u32 {
        self.memory.start() + KERNEL_STACK_SIZE
    }

    pub fn address_space(&self) -> Option<&AddressSpace> {
        self.address_space.as_ref()
    }

    pub(crate) fn address_space_mut(&mut self) -> Option<&mut AddressSpace> {
        self.address_space.as_mut()
    }

    /// Physical address of the page directory
    pub fn page_directory(&self) -> Option<u32> {
        self.address_space.as_ref().map(AddressSpace::directory_frame)
    }

    pub fn trap_frame_address(&self) -> u32 {
        self.trap_frame
    }

    pub fn task_state(&self) -> &TaskState {
        &self.tss
    }

    pub fn descriptor_table(&self) -> &DescriptorTable {
        &self.gdt
    }

    pub fn pseudo_descriptor(&self) -> PseudoDescriptor {
        self.gdt_pd
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn parent(&self) -> Option<ProcessHandle> {
        self.parent
    }

    /// Point the task-state block at the kernel stack and build the descriptor table around it
    fn setup_segments(&mut self) {
        self.tss = TaskState::new(KERNEL_DATA_SELECTOR, self.kernel_stack_top());
        self.gdt = DescriptorTable::new(&self.tss);
        self.gdt_pd = self.gdt.pseudo_descriptor();
    }

    /// Re-derive the task descriptor and pseudo-descriptor from where the slot sits now, then
    /// check the rest of the table. The table may have moved since the last switch.
    pub(crate) fn refresh_segments(&mut self) -> Result<(), DescriptorCorruption> {
        self.gdt.point_task_at(&self.tss);
        self.gdt.verify(&self.tss)?;
        self.gdt_pd = self.gdt.pseudo_descriptor();
        Ok(())
    }
}

pub struct ProcessTable {
    slots: [Process; MAX_PROCESSES],
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            slots: array_init::array_init(|_| Process::default()),
        }
    }

    pub fn state(&self, handle: ProcessHandle) -> ProcessState {
        self[handle].state
    }

    /// Handles of every slot in use
    pub fn live(&self) -> impl Iterator<Item = ProcessHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, p)| p.state != ProcessState::Unused)
            .map(|(index, _)| ProcessHandle(index))
    }

    /// Claim an unused slot and build a runnable process in it. On failure the table and the
    /// allocator are left as they were.
    pub fn create<M: PhysicalMemory>(
        &mut self,
        memory: &mut M,
        kernel: &KernelSpace,
        origin: Origin,
        trap_return: u32,
    ) -> Result<ProcessHandle, ProcessError> {
        let index = self
            .slots
            .iter()
            .position(|p| p.state == ProcessState::Unused)
            .ok_or(ProcessError::TableFull)?;

        let process = match origin {
            Origin::Image(image) => {
                Self::build(memory, kernel, image.memory_size(), trap_return, |memory, space, user| {
                    load_image(memory, space, user, image)
                })?
            }
            Origin::Fork { parent, frame } => {
                let parent_process = &self.slots[parent.0];
                assert_ne!(
                    parent_process.state,
                    ProcessState::Unused,
                    "Forking unused slot {}",
                    parent.0
                );

                let mut process = Self::build(
                    memory,
                    kernel,
                    parent_process.user_size,
                    trap_return,
                    |memory, space, user| fork_memory(memory, parent_process, space, user, frame),
                )?;
                process.parent = Some(parent);
                process
            }
        };

        let slot = &mut self.slots[index];
        *slot = process;
        slot.setup_segments();
        slot.state = ProcessState::Runnable;

        let handle = ProcessHandle(index);
        info!(
            "process: created {} with {} KiB at 0x{:x}",
            handle,
            slot.memory.size() / 1024,
            slot.memory.start()
        );

        Ok(handle)
    }

    /// Allocate the region and address space, let `fill` populate user memory and produce the
    /// first trap frame, then seed the kernel stack so the first switch lands in the trap
    /// resume path.
    fn build<M, F>(
        memory: &mut M,
        kernel: &KernelSpace,
        user_size: u32,
        trap_return: u32,
        fill: F,
    ) -> Result<Process, ProcessError>
    where
        M: PhysicalMemory,
        F: FnOnce(&mut M, &mut AddressSpace, PhysRegion) -> Result<TrapFrame, ProcessError>,
    {
        let size = user_size
            .checked_add(KERNEL_STACK_SIZE)
            .ok_or(ProcessError::OutOfMemory)?;
        let region = memory.allocate(size)?;

        if region.end() > kernel.limit() {
            memory.free(region);
            return Err(ProcessError::OutsideIdentityMap);
        }

        let user = PhysRegion::new(region.start() + KERNEL_STACK_SIZE, user_size);
        let mut space = match AddressSpace::build(memory, kernel, user) {
            Ok(space) => space,
            Err(e) => {
                memory.free(region);
                return Err(e.into());
            }
        };

        let frame = match fill(memory, &mut space, user) {
            Ok(frame) => frame,
            Err(e) => {
                space.destroy(memory, region);
                memory.free(region);
                return Err(e);
            }
        };

        let kernel_stack_top = region.start() + KERNEL_STACK_SIZE;
        let frame_addr = kernel_stack_top - TRAP_FRAME_SIZE as u32;
        memory
            .bytes_mut(frame_addr, TRAP_FRAME_SIZE)
            .copy_from_slice(&frame.to_bytes());

        // The first switch into this process "returns" into the resume path with the frame on
        // top of the stack
        let resume_slot = frame_addr - 4;
        memory.write_u32(resume_slot, trap_return);

        Ok(Process {
            memory: region,
            user_size,
            address_space: Some(space),
            context: Context {
                esp: resume_slot,
                ..Context::default()
            },
            trap_frame: frame_addr,
            ..Process::default()
        })
    }

    /// Release a process's memory and page tables and return its slot to the table. A waiting
    /// parent is made runnable.
    pub fn destroy<M: PhysicalMemory>(&mut self, memory: &mut M, handle: ProcessHandle) {
        let process = &mut self.slots[handle.0];
        assert_ne!(
            process.state,
            ProcessState::Unused,
            "Destroying unused process slot {}",
            handle.0
        );

        if let Some(space) = process.address_space.take() {
            space.destroy(memory, process.memory);
        }
        memory.free(process.memory);

        let parent = process.parent;
        *process = Process::default();

        for orphan in self.slots.iter_mut().filter(|p| p.parent == Some(handle)) {
            orphan.parent = None;
        }

        if let Some(parent) = parent {
            let parent = &mut self.slots[parent.0];
            parent.exited_child = Some(handle);

            if parent.state == ProcessState::Waiting {
                parent.state = ProcessState::Runnable;
            }
        }

        info!("process: destroyed {}", handle);
    }

    /// Move a live process between runnable and waiting
    pub fn set_state(&mut self, handle: ProcessHandle, state: ProcessState) {
        assert_ne!(state, ProcessState::Unused, "Only destroy releases a slot");

        let process = &mut self.slots[handle.0];
        assert_ne!(
            process.state,
            ProcessState::Unused,
            "Process slot {} is unused",
            handle.0
        );

        process.state = state;
    }

    /// The first runnable slot after `after`, wrapping around and ending with `after` itself
    pub fn next_runnable(&self, after: ProcessHandle) -> Option<ProcessHandle> {
        (1..=MAX_PROCESSES)
            .map(|step| (after.0 + step) % MAX_PROCESSES)
            .find(|&index| self.slots[index].state == ProcessState::Runnable)
            .map(ProcessHandle)
    }

    pub fn has_children(&self, handle: ProcessHandle) -> bool {
        self.slots.iter().any(|p| p.parent == Some(handle))
    }

    /// The most recently exited child, if it has not been collected yet
    pub fn take_exited_child(&mut self, handle: ProcessHandle) -> Option<ProcessHandle> {
        self.slots[handle.0].exited_child.take()
    }

    pub fn trap_frame<M: PhysicalMemory>(&self, memory: &M, handle: ProcessHandle) -> TrapFrame {
        let mut bytes = [0; TRAP_FRAME_SIZE];
        bytes.copy_from_slice(memory.bytes(self[handle].trap_frame, TRAP_FRAME_SIZE));
        TrapFrame::from_bytes(&bytes)
    }

    /// Edit the saved trap frame of a process that is not running
    pub fn update_trap_frame<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        handle: ProcessHandle,
        f: impl FnOnce(&mut TrapFrame),
    ) {
        let mut frame = self.trap_frame(memory, handle);
        f(&mut frame);
        memory
            .bytes_mut(self[handle].trap_frame, TRAP_FRAME_SIZE)
            .copy_from_slice(&frame.to_bytes());
    }

    pub(crate) fn slot_mut(&mut self, handle: ProcessHandle) -> &mut Process {
        &mut self.slots[handle.0]
    }
}

impl Index<ProcessHandle> for ProcessTable {
    type Output = Process;

    fn index(&self, handle: ProcessHandle) -> &Process {
        &self.slots[handle.0]
    }
}

impl IndexMut<ProcessHandle> for ProcessTable {
    fn index_mut(&mut self, handle: ProcessHandle) -> &mut Process {
        &mut self.slots[handle.0]
    }
}

/// Copy every segment into user memory, zero fill the rest, and write protect pages that only
/// read-only segments touch
fn load_image<M: PhysicalMemory>(
    memory: &mut M,
    space: &mut AddressSpace,
    user: PhysRegion,
    image: &ElfImage,
) -> Result<TrapFrame, ProcessError> {
    memory.zero(user.start(), user.size() as usize);

    for segment in image.segments() {
        let start = LinearAddress::new(segment.vaddr);
        let outside = ImageError::OutsideUserWindow {
            vaddr: segment.vaddr,
        };

        space
            .write_user(memory, start, image.file_bytes(segment))
            .map_err(|_| outside)?;

        let tail = LinearAddress::new(segment.vaddr + segment.file_size);
        space
            .zero_user(memory, tail, (segment.mem_size - segment.file_size) as usize)
            .map_err(|_| outside)?;

        trace!(
            "process: loaded segment 0x{:x}..0x{:x} ({:?})",
            segment.vaddr,
            segment.end(),
            segment.flags
        );
    }

    let read_only = EntryFlags::PRESENT | EntryFlags::USER_ACCESSIBLE;
    for segment in image.segments().iter().filter(|s| !s.is_writable()) {
        let mut page = align_down(segment.vaddr, PAGE_SIZE);

        while page < segment.end() {
            let shared_with_writable = image
                .segments()
                .iter()
                .any(|other| other.is_writable() && other.vaddr < page + PAGE_SIZE && other.end() > page);

            if !shared_with_writable {
                space.set_flags(memory, LinearAddress::new(page), read_only);
            }

            page += PAGE_SIZE;
        }
    }

    Ok(TrapFrame::new_user(image.entry(), image.stack_top()))
}

/// Copy the parent's user memory and any extra pages it has mapped. The child resumes from
/// the parent's frame with a zero return value.
fn fork_memory<M: PhysicalMemory>(
    memory: &mut M,
    parent: &Process,
    space: &mut AddressSpace,
    user: PhysRegion,
    frame: &TrapFrame,
) -> Result<TrapFrame, ProcessError> {
    memory.copy(parent.user_memory().start(), user.start(), user.size() as usize);

    if let Some(parent_space) = parent.address_space() {
        parent_space.duplicate_foreign_pages(memory, parent.memory, space)?;
    }

    let mut frame = *frame;
    frame.set_return(0);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IDENTITY_LIMIT, USER_BASE, USER_STACK_SIZE};
    use crate::elf::testing::{build, TestSegment};
    use crate::elf::SegmentFlags;
    use crate::hardware::sim::TRAP_RETURN;
    use crate::memory::sim::SimulatedMemory;

    struct Fixture {
        memory: SimulatedMemory,
        kernel: KernelSpace,
        table: ProcessTable,
        image: Vec<u8>,
    }

    impl Fixture {
        fn new() -> Self {
            let mut memory = SimulatedMemory::new(16 * 1024 * 1024);
            let kernel = KernelSpace::new(&mut memory, IDENTITY_LIMIT).unwrap();

            // One page of file data followed by one page of bss
            let image = build(
                USER_BASE,
                &[TestSegment {
                    vaddr: USER_BASE,
                    data: (0..4096).map(|i| (i % 251) as u8 + 1).collect(),
                    mem_size: 8192,
                    flags: SegmentFlags::READ | SegmentFlags::WRITE | SegmentFlags::EXECUTE,
                }],
            );

            Fixture {
                memory,
                kernel,
                table: ProcessTable::new(),
                image,
            }
        }

        fn spawn(&mut self) -> Result<ProcessHandle, ProcessError> {
            let image = ElfImage::parse(&self.image).unwrap();
            self.table.create(
                &mut self.memory,
                &self.kernel,
                Origin::Image(&image),
                TRAP_RETURN,
            )
        }

        fn states(&self) -> Vec<ProcessState> {
            self.table.slots.iter().map(Process::state).collect()
        }
    }

    #[test]
    fn create_builds_a_runnable_process() {
        let mut fx = Fixture::new();
        let handle = fx.spawn().unwrap();
        let process = &fx.table[handle];

        assert_eq!(handle.index(), 0);
        assert_eq!(handle.pid(), 1);
        assert_eq!(process.state(), ProcessState::Runnable);
        assert_eq!(process.user_memory().size(), 8192 + USER_STACK_SIZE);
        assert_eq!(process.memory().size(), KERNEL_STACK_SIZE + 8192 + USER_STACK_SIZE);

        // Segments
        let top = process.kernel_stack_top();
        assert_eq!(process.task_state().esp0, top);
        assert_eq!(process.task_state().ss0, KERNEL_DATA_SELECTOR.as_u16());
        assert_eq!(
            process.descriptor_table().entries()[crate::gdt::SEG_TASK].base(),
            process.task_state().linear_address()
        );
        assert_eq!(process.pseudo_descriptor(), process.descriptor_table().pseudo_descriptor());
        assert_eq!(process.pseudo_descriptor().limit(), 47);
        assert_eq!(process.descriptor_table().verify(process.task_state()), Ok(()));

        // First switch lands in the resume path with the frame on the stack
        assert_eq!(process.trap_frame_address(), top - TRAP_FRAME_SIZE as u32);
        assert_eq!(process.context().esp, process.trap_frame_address() - 4);
        assert_eq!(fx.memory.read_u32(process.context().esp), TRAP_RETURN);

        let frame = fx.table.trap_frame(&fx.memory, handle);
        assert_eq!(frame, TrapFrame::new_user(USER_BASE, USER_BASE + 8192 + USER_STACK_SIZE));
    }

    #[test]
    fn image_bytes_then_zeros() {
        let mut fx = Fixture::new();
        let handle = fx.spawn().unwrap();
        let space = fx.table[handle].address_space().unwrap();

        let mut loaded = vec![0u8; 8192];
        space
            .copy_from_user(&fx.memory, LinearAddress::new(USER_BASE), &mut loaded)
            .unwrap();

        let expected: Vec<u8> = (0..4096).map(|i| (i % 251) as u8 + 1).collect();
        assert_eq!(&loaded[..4096], &expected[..]);
        assert!(loaded[4096..].iter().all(|&b| b == 0));
    }

    #[test]
    fn read_only_pages_are_write_protected() {
        let mut fx = Fixture::new();
        fx.image = build(
            USER_BASE,
            &[
                TestSegment {
                    vaddr: USER_BASE,
                    data: vec![0xC3; 0x1800],
                    mem_size: 0x1800,
                    flags: SegmentFlags::READ | SegmentFlags::EXECUTE,
                },
                TestSegment {
                    vaddr: USER_BASE + 0x1800,
                    data: vec![7; 16],
                    mem_size: 0x1000,
                    flags: SegmentFlags::READ | SegmentFlags::WRITE,
                },
            ],
        );

        let handle = fx.spawn().unwrap();
        let space = fx.table[handle].address_space().unwrap();
        let flags_at = |offset| space.translate(&fx.memory, LinearAddress::new(USER_BASE + offset)).unwrap().1;

        // Text only
        assert!(!flags_at(0).contains(EntryFlags::WRITABLE));
        // Text and data share the second page
        assert!(flags_at(0x1000).contains(EntryFlags::WRITABLE));
        // Data and stack
        assert!(flags_at(0x2000).contains(EntryFlags::WRITABLE));
        assert!(flags_at(0).contains(EntryFlags::USER_ACCESSIBLE));
    }

    #[test]
    fn lifecycle() {
        let mut fx = Fixture::new();
        let baseline = fx.memory.outstanding();
        let handle = fx.spawn().unwrap();

        fx.table.set_state(handle, ProcessState::Waiting);
        assert_eq!(fx.table.state(handle), ProcessState::Waiting);
        fx.table.set_state(handle, ProcessState::Runnable);

        fx.table.destroy(&mut fx.memory, handle);
        assert_eq!(fx.table.state(handle), ProcessState::Unused);
        assert_eq!(fx.memory.outstanding(), baseline);
        assert_eq!(fx.table.live().count(), 0);

        // The slot is reused
        assert_eq!(fx.spawn().unwrap(), handle);
    }

    #[test]
    #[should_panic(expected = "Destroying unused process slot")]
    fn destroying_unused_slot_is_fatal() {
        let mut fx = Fixture::new();
        fx.table.destroy(&mut fx.memory, ProcessHandle::new(3));
    }

    #[test]
    #[should_panic(expected = "is unused")]
    fn unused_slot_cannot_become_runnable() {
        let mut fx = Fixture::new();
        fx.table.set_state(ProcessHandle::new(0), ProcessState::Runnable);
    }

    #[test]
    fn full_table_is_left_unchanged() {
        let mut fx = Fixture::new();
        for _ in 0..MAX_PROCESSES {
            fx.spawn().unwrap();
        }

        let states = fx.states();
        let outstanding = fx.memory.outstanding();

        assert_eq!(fx.spawn(), Err(ProcessError::TableFull));
        assert_eq!(fx.states(), states);
        assert_eq!(fx.memory.outstanding(), outstanding);
    }

    #[test]
    fn exhaustion_rolls_back_at_every_step() {
        let mut fx = Fixture::new();
        let baseline = fx.memory.outstanding();

        // Region, directory, one page table
        for allowed in 0..3 {
            fx.memory.fail_after(allowed);
            assert_eq!(fx.spawn(), Err(ProcessError::OutOfMemory));
            assert_eq!(fx.memory.outstanding(), baseline);
            assert!(fx.states().iter().all(|&s| s == ProcessState::Unused));
        }

        fx.memory.stop_failing();
        assert!(fx.spawn().is_ok());
    }

    #[test]
    fn round_robin_order() {
        let mut fx = Fixture::new();
        let handles: Vec<_> = (0..3).map(|_| fx.spawn().unwrap()).collect();

        let mut order = Vec::new();
        let mut current = handles[2];
        for _ in 0..6 {
            current = fx.table.next_runnable(current).unwrap();
            order.push(current.index());
        }
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2]);

        fx.table.set_state(handles[1], ProcessState::Waiting);
        assert_eq!(fx.table.next_runnable(handles[0]), Some(handles[2]));
        assert_eq!(fx.table.next_runnable(handles[2]), Some(handles[0]));

        // Only the current process is runnable: the scan ends on it
        fx.table.set_state(handles[2], ProcessState::Waiting);
        assert_eq!(fx.table.next_runnable(handles[0]), Some(handles[0]));

        fx.table.set_state(handles[0], ProcessState::Waiting);
        assert_eq!(fx.table.next_runnable(handles[0]), None);
    }

    #[test]
    fn fork_copies_memory_and_links_parent() {
        let mut fx = Fixture::new();
        let parent = fx.spawn().unwrap();

        let mut frame = fx.table.trap_frame(&fx.memory, parent);
        frame.regs.eax = 3;
        frame.eip = USER_BASE + 0x40;

        let child = fx
            .table
            .create(
                &mut fx.memory,
                &fx.kernel,
                Origin::Fork {
                    parent,
                    frame: &frame,
                },
                TRAP_RETURN,
            )
            .unwrap();

        assert_eq!(fx.table[child].parent(), Some(parent));
        assert!(fx.table.has_children(parent));

        let child_frame = fx.table.trap_frame(&fx.memory, child);
        assert_eq!(child_frame.regs.eax, 0);
        assert_eq!(child_frame.eip, USER_BASE + 0x40);

        let parent_user = fx.table[parent].user_memory();
        let child_user = fx.table[child].user_memory();
        assert_ne!(parent_user.start(), child_user.start());
        assert_eq!(
            fx.memory.bytes(parent_user.start(), parent_user.size() as usize),
            fx.memory.bytes(child_user.start(), child_user.size() as usize)
        );

        // Exiting child wakes a waiting parent
        fx.table.set_state(parent, ProcessState::Waiting);
        fx.table.destroy(&mut fx.memory, child);
        assert_eq!(fx.table.state(parent), ProcessState::Runnable);
        assert_eq!(fx.table.take_exited_child(parent), Some(child));
        assert_eq!(fx.table.take_exited_child(parent), None);
        assert!(!fx.table.has_children(parent));
    }

    #[test]
    fn fork_rolls_back_at_every_step() {
        let mut fx = Fixture::new();
        let parent = fx.spawn().unwrap();

        // Pages mapped outside the process region, spread over two extra page tables
        let extra = [
            USER_BASE + 0x40_0000,
            USER_BASE + 0x40_1000,
            USER_BASE + 0x80_0000,
        ];
        for (i, &addr) in extra.iter().enumerate() {
            let frame = fx.memory.allocate_page().unwrap();
            fx.memory.bytes_mut(frame, 1)[0] = i as u8 + 1;
            fx.table
                .slot_mut(parent)
                .address_space_mut()
                .unwrap()
                .map(
                    &mut fx.memory,
                    LinearAddress::new(addr),
                    frame,
                    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER_ACCESSIBLE,
                )
                .unwrap();
        }

        let frame = fx.table.trap_frame(&fx.memory, parent);
        let baseline = fx.memory.outstanding();
        let states = fx.states();

        let mut failures = 0;
        let child = loop {
            fx.memory.fail_after(failures);
            let result = fx.table.create(
                &mut fx.memory,
                &fx.kernel,
                Origin::Fork {
                    parent,
                    frame: &frame,
                },
                TRAP_RETURN,
            );

            match result {
                Ok(child) => break child,
                Err(e) => {
                    assert_eq!(e, ProcessError::OutOfMemory, "after {} allocations", failures);
                    assert_eq!(fx.memory.outstanding(), baseline, "after {} allocations", failures);
                    assert_eq!(fx.states(), states);
                    assert!(!fx.table.has_children(parent));
                }
            }

            failures += 1;
            assert!(failures < 32, "fork never succeeded");
        };
        fx.memory.stop_failing();

        // Region, directory, user page table, then the extra tables and page copies
        assert!(failures >= 8, "only {} allocations", failures);

        let child_space = fx.table[child].address_space().unwrap();
        let parent_space = fx.table[parent].address_space().unwrap();
        for (i, &addr) in extra.iter().enumerate() {
            let addr = LinearAddress::new(addr);
            let (copy, _) = child_space.translate(&fx.memory, addr).unwrap();
            let (original, _) = parent_space.translate(&fx.memory, addr).unwrap();

            assert_ne!(copy, original);
            assert_eq!(fx.memory.bytes(copy, 1)[0], i as u8 + 1);
        }
    }

    #[test]
    fn pids() {
        assert_eq!(ProcessHandle::from_pid(0), None);
        assert_eq!(ProcessHandle::from_pid(1), Some(ProcessHandle::new(0)));
        assert_eq!(ProcessHandle::from_pid(MAX_PROCESSES as u32 + 1), None);
        assert_eq!(ProcessHandle::new(4).to_string(), "pid 5");
    }
}
