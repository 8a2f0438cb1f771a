//! The kernel proper: process creation, the trap dispatcher, and the boot sequence, over any
//! [Hardware] and [PhysicalMemory]

use crate::config::{IDENTITY_LIMIT, TIMER_HZ};
use crate::elf::ElfImage;
use crate::gdt::PseudoDescriptor;
use crate::hardware::{Cr0Flags, Hardware};
use crate::interrupts::{pic, pit, PageFaultErrorCode, TrapCause, TrapFrame};
use crate::memory::address_space::KernelSpace;
use crate::memory::{OutOfMemory, PhysicalMemory};
use crate::process::{Origin, ProcessError, ProcessHandle, ProcessState, ProcessTable};
use crate::scheduler::Scheduler;
use core::fmt;

pub struct Kernel<H: Hardware, M: PhysicalMemory> {
    pub(crate) hw: H,
    pub(crate) memory: M,
    pub(crate) kernel_space: KernelSpace,
    pub(crate) processes: ProcessTable,
    pub(crate) scheduler: Scheduler,
    ticks: u64,
}

impl<H: Hardware, M: PhysicalMemory> Kernel<H, M> {
    /// Build the identity-mapped kernel page tables. Nothing is loaded into the CPU yet.
    pub fn new(hw: H, mut memory: M) -> Result<Self, OutOfMemory> {
        let kernel_space = KernelSpace::new(&mut memory, IDENTITY_LIMIT)?;
        let scheduler = Scheduler::new(kernel_space.directory_frame());

        Ok(Kernel {
            hw,
            memory,
            kernel_space,
            processes: ProcessTable::new(),
            scheduler,
            ticks: 0,
        })
    }

    /// Load the boot descriptor tables and the interrupt table, turn on paging, and program
    /// the interrupt controller and the timer. Interrupts stay disabled.
    ///
    /// # Safety
    ///
    /// Must run once, on the boot stack with interrupts disabled, with kernel code and data
    /// below the identity limit. The kernel and `idt` must not move afterwards.
    pub unsafe fn start(&mut self, idt: &PseudoDescriptor) {
        self.hw.disable_interrupts();
        self.scheduler.install_boot_segments(&mut self.hw);
        self.hw.load_idt(idt);
        info!("interrupts: table loaded");

        self.hw.write_cr3(self.kernel_space.directory_frame());
        let enable = Cr0Flags::PROTECTED_MODE | Cr0Flags::PAGING | Cr0Flags::WRITE_PROTECT;
        self.hw.write_cr0(self.hw.read_cr0() | enable.bits());
        info!(
            "paging: enabled, identity mapped up to 0x{:x}",
            self.kernel_space.limit()
        );

        pic::remap(&mut self.hw);
        pit::init(&mut self.hw, TIMER_HZ);
        info!("pit: ticking at {} Hz", TIMER_HZ);
    }

    /// Become the idle context: halt with interrupts enabled until the timer schedules
    /// something
    pub fn idle(&mut self) -> ! {
        Scheduler::idle_loop(&mut self.hw)
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn kernel_space(&self) -> &KernelSpace {
        &self.kernel_space
    }

    pub fn current(&self) -> Option<ProcessHandle> {
        self.scheduler.current()
    }

    /// Timer interrupts seen so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Create a runnable process from an executable
    pub fn spawn(&mut self, image: &ElfImage) -> Result<ProcessHandle, ProcessError> {
        let Kernel {
            hw,
            memory,
            kernel_space,
            processes,
            ..
        } = self;

        hw.without_interrupts(|hw| {
            let trap_return = hw.trap_return_address();
            processes.create(memory, kernel_space, Origin::Image(image), trap_return)
        })
    }

    /// Create a copy of `parent` that resumes from `frame` with a zero return value
    pub fn fork(
        &mut self,
        parent: ProcessHandle,
        frame: &TrapFrame,
    ) -> Result<ProcessHandle, ProcessError> {
        let Kernel {
            hw,
            memory,
            kernel_space,
            processes,
            ..
        } = self;

        hw.without_interrupts(|hw| {
            let trap_return = hw.trap_return_address();
            let origin = Origin::Fork { parent, frame };
            processes.create(memory, kernel_space, origin, trap_return)
        })
    }

    /// Destroy a process. A waiting parent receives the child's pid as the result of its
    /// `wait`. If the process was running, the CPU moves on to the next one.
    pub fn exit(&mut self, handle: ProcessHandle) {
        let Kernel {
            hw,
            memory,
            kernel_space,
            processes,
            scheduler,
            ..
        } = self;

        hw.without_interrupts(|hw| {
            let running = scheduler.current() == Some(handle);
            if running {
                // The page directory is about to be freed
                unsafe { hw.write_cr3(kernel_space.directory_frame()) };
            }

            let waiting_parent = processes[handle]
                .parent()
                .filter(|&parent| processes.state(parent) == ProcessState::Waiting);

            processes.destroy(memory, handle);

            if let Some(parent) = waiting_parent {
                if let Some(child) = processes.take_exited_child(parent) {
                    let pid = child.pid() as i32;
                    processes.update_trap_frame(memory, parent, |frame| frame.set_return(pid));
                }
            }

            if running {
                scheduler.tick(hw, processes);
            }
        })
    }

    /// Switch to the next runnable process, if any
    pub fn reschedule(&mut self) {
        self.scheduler.tick(&mut self.hw, &mut self.processes);
    }

    /// The single entry point from the trap stubs. On return the resume path restores `frame`,
    /// which by then may belong to a different process than the one that trapped.
    pub fn handle_trap(&mut self, frame: &mut TrapFrame) {
        let cause = TrapCause::from_vector(frame.trapno);
        trace!(
            "trap: {:?} from {} mode at eip 0x{:x}",
            cause,
            if frame.is_from_user() { "user" } else { "kernel" },
            frame.eip
        );

        match cause {
            TrapCause::Interrupt(irq) => self.interrupt(irq),
            TrapCause::Syscall => {
                let current = match self.scheduler.current() {
                    Some(current) if frame.is_from_user() => current,
                    _ => panic!("System call from kernel mode at eip 0x{:x}", frame.eip),
                };
                self.syscall(current, frame);
            }
            TrapCause::PageFault => {
                let addr = self.hw.read_cr2();
                let code = PageFaultErrorCode::from_bits_truncate(frame.err);
                self.fault(frame, format_args!("page fault at 0x{:x} ({:?})", addr, code));
            }
            other => self.fault(frame, format_args!("{:?} (error 0x{:x})", other, frame.err)),
        }
    }

    fn interrupt(&mut self, irq: u8) {
        if irq == pic::SPURIOUS_IRQ {
            debug!("pic: spurious IRQ {}", irq);
            return;
        }

        // Acknowledge first: the switch below may not return for a while
        pic::end_of_interrupt(&mut self.hw, irq);

        if irq == pic::TIMER_IRQ {
            self.ticks += 1;
            self.reschedule();
        } else {
            debug!("pic: unhandled IRQ {}", irq);
        }
    }

    /// Faults from user mode kill the process; anywhere else they are kernel bugs
    fn fault(&mut self, frame: &TrapFrame, what: fmt::Arguments) {
        match self.scheduler.current() {
            Some(current) if frame.is_from_user() => {
                warn!("trap: {} killed by {} at eip 0x{:x}", current, what, frame.eip);
                self.exit(current);
            }
            _ => panic!("Kernel {} at eip 0x{:x}", what, frame.eip),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{MAX_PROCESSES, USER_BASE};
    use crate::elf::testing::{build, TestSegment};
    use crate::elf::SegmentFlags;
    use crate::gdt::{KERNEL_CODE_SELECTOR, TASK_SELECTOR};
    use crate::hardware::sim::{Event, SimulatedHardware};
    use crate::interrupts::vector;
    use crate::memory::paging::LinearAddress;
    use crate::memory::sim::SimulatedMemory;

    pub type TestKernel = Kernel<SimulatedHardware, SimulatedMemory>;

    pub fn init_image() -> Vec<u8> {
        build(
            USER_BASE,
            &[TestSegment {
                vaddr: USER_BASE,
                data: vec![0x90; 0x200],
                mem_size: 0x1000,
                flags: SegmentFlags::READ | SegmentFlags::WRITE | SegmentFlags::EXECUTE,
            }],
        )
    }

    pub fn boot() -> TestKernel {
        Kernel::new(SimulatedHardware::new(), SimulatedMemory::new(16 * 1024 * 1024)).unwrap()
    }

    pub fn spawn(kernel: &mut TestKernel) -> ProcessHandle {
        let data = init_image();
        let image = ElfImage::parse(&data).unwrap();
        kernel.spawn(&image).unwrap()
    }

    pub fn kernel_frame(trapno: u32) -> TrapFrame {
        let mut frame = TrapFrame::default();
        frame.trapno = trapno;
        frame.cs = KERNEL_CODE_SELECTOR.as_u16();
        frame
    }

    pub fn user_frame(trapno: u32) -> TrapFrame {
        let mut frame = TrapFrame::new_user(USER_BASE, USER_BASE + 0x1000);
        frame.trapno = trapno;
        frame
    }

    pub fn timer(kernel: &mut TestKernel) {
        let mut frame = kernel_frame(vector::IRQ_BASE);
        kernel.handle_trap(&mut frame);
    }

    #[test]
    fn start_programs_the_machine() {
        let mut kernel = boot();
        let idt = PseudoDescriptor::new(0x0010_4000, 2047);
        unsafe { kernel.start(&idt) };

        let hw = kernel.hardware();
        assert!(hw.events.contains(&Event::Idt(idt)));
        assert_eq!(hw.last_task_register(), Some(TASK_SELECTOR));
        assert_eq!(hw.cr3, kernel.kernel_space().directory_frame());
        assert!(Cr0Flags::from_bits_truncate(hw.cr0).contains(Cr0Flags::PAGING | Cr0Flags::PROTECTED_MODE));
        assert!(!hw.interrupts);

        let ports = hw.port_writes();
        assert!(ports.contains(&(0x21, 0x20)));
        assert!(ports.contains(&(0x43, 0x36)));
    }

    #[test]
    fn timer_acknowledges_and_schedules() {
        let mut kernel = boot();
        let a = spawn(&mut kernel);
        let b = spawn(&mut kernel);

        timer(&mut kernel);
        assert_eq!(kernel.ticks(), 1);
        assert_eq!(kernel.current(), Some(a));
        assert_eq!(kernel.hardware().port_writes().last(), Some(&(0x20, 0x20)));

        timer(&mut kernel);
        assert_eq!(kernel.current(), Some(b));
        timer(&mut kernel);
        assert_eq!(kernel.current(), Some(a));
        assert_eq!(kernel.hardware().switches(), 3);
    }

    #[test]
    fn kernel_may_move_after_spawning() {
        let mut kernel = boot();
        let a = spawn(&mut kernel);
        let b = spawn(&mut kernel);

        let mut kernel = Box::new(kernel);
        timer(&mut kernel);
        assert_eq!(kernel.current(), Some(a));
        timer(&mut kernel);
        assert_eq!(kernel.current(), Some(b));

        let mut kernel = *kernel;
        timer(&mut kernel);
        assert_eq!(kernel.current(), Some(a));
    }

    #[test]
    fn spurious_interrupts_are_ignored() {
        let mut kernel = boot();
        spawn(&mut kernel);

        let mut frame = kernel_frame(vector::IRQ_BASE + pic::SPURIOUS_IRQ as u32);
        kernel.handle_trap(&mut frame);

        assert!(kernel.hardware().port_writes().is_empty());
        assert_eq!(kernel.hardware().switches(), 0);
    }

    #[test]
    fn other_interrupts_are_acknowledged() {
        let mut kernel = boot();

        // Keyboard, then a slave line
        kernel.handle_trap(&mut kernel_frame(vector::IRQ_BASE + 1));
        kernel.handle_trap(&mut kernel_frame(vector::IRQ_BASE + 12));

        assert_eq!(
            kernel.hardware().port_writes(),
            vec![(0x20, 0x20), (0xA0, 0x20), (0x20, 0x20)]
        );
        assert_eq!(kernel.ticks(), 0);
    }

    #[test]
    fn user_fault_kills_the_process() {
        let mut kernel = boot();
        let baseline = kernel.memory().outstanding();
        let a = spawn(&mut kernel);
        let b = spawn(&mut kernel);
        timer(&mut kernel);

        kernel.hardware_mut().cr2 = 0xDEAD_0000;
        let mut frame = user_frame(vector::PAGE_FAULT);
        frame.err = (PageFaultErrorCode::USER_MODE | PageFaultErrorCode::WRITE).bits();
        kernel.handle_trap(&mut frame);

        assert_eq!(kernel.processes().state(a), ProcessState::Unused);
        assert_eq!(kernel.current(), Some(b));

        // Protection faults too
        kernel.handle_trap(&mut user_frame(vector::GENERAL_PROTECTION));
        assert_eq!(kernel.processes().state(b), ProcessState::Unused);
        assert_eq!(kernel.current(), None);
        assert_eq!(kernel.hardware().cr3, kernel.kernel_space().directory_frame());
        assert_eq!(kernel.memory().outstanding(), baseline);
    }

    #[test]
    fn undefined_user_traps_kill_the_process() {
        let mut kernel = boot();
        let a = spawn(&mut kernel);
        timer(&mut kernel);

        kernel.handle_trap(&mut user_frame(vector::INVALID_OPCODE));
        assert_eq!(kernel.processes().state(a), ProcessState::Unused);
    }

    #[test]
    fn arithmetic_user_faults_kill_the_process() {
        let mut kernel = boot();
        let a = spawn(&mut kernel);
        timer(&mut kernel);

        kernel.handle_trap(&mut user_frame(vector::DIVIDE_ERROR));
        assert_eq!(kernel.processes().state(a), ProcessState::Unused);
    }

    #[test]
    #[should_panic(expected = "Kernel page fault at 0xc0ffee")]
    fn kernel_page_fault_is_fatal() {
        let mut kernel = boot();
        spawn(&mut kernel);
        timer(&mut kernel);

        kernel.hardware_mut().cr2 = 0x00C0_FFEE;
        kernel.handle_trap(&mut kernel_frame(vector::PAGE_FAULT));
    }

    #[test]
    #[should_panic(expected = "Kernel ProtectionFault")]
    fn kernel_protection_fault_is_fatal() {
        let mut kernel = boot();
        kernel.handle_trap(&mut kernel_frame(vector::GENERAL_PROTECTION));
    }

    #[test]
    #[should_panic(expected = "System call from kernel mode")]
    fn kernel_mode_syscall_is_fatal() {
        let mut kernel = boot();
        spawn(&mut kernel);
        timer(&mut kernel);
        kernel.handle_trap(&mut kernel_frame(vector::SYSCALL));
    }

    #[test]
    fn table_full() {
        let mut kernel = boot();
        for _ in 0..MAX_PROCESSES {
            spawn(&mut kernel);
        }

        let data = init_image();
        let image = ElfImage::parse(&data).unwrap();
        assert_eq!(kernel.spawn(&image), Err(ProcessError::TableFull));
        assert_eq!(kernel.processes().live().count(), MAX_PROCESSES);
    }

    #[test]
    fn first_resume_lands_in_the_trap_return_path() {
        let mut kernel = boot();
        let a = spawn(&mut kernel);
        timer(&mut kernel);

        let esp = kernel.hardware().cpu.esp;
        assert_eq!(kernel.memory().read_u32(esp), kernel.hardware().trap_return_address());

        let frame = kernel.processes().trap_frame(kernel.memory(), a);
        assert_eq!(frame.eip, USER_BASE);
        assert!(frame.is_from_user());
        assert_eq!(esp + 4, kernel.processes()[a].trap_frame_address());

        let space = kernel.processes()[a].address_space().unwrap();
        assert!(space.translate(kernel.memory(), LinearAddress::new(USER_BASE)).is_some());
    }
}
