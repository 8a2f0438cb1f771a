//! Round-robin scheduling and the context-switch engine

use crate::config::MAX_PROCESSES;
use crate::gdt::{DescriptorTable, KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR, TASK_SELECTOR};
use crate::hardware::{Context, Hardware};
use crate::process::{ProcessHandle, ProcessState, ProcessTable};
use crate::tss::TaskState;

/// Which process owns the CPU, and the boot thread of control that runs when none does
pub struct Scheduler {
    current: Option<ProcessHandle>,
    /// Where the next scan starts from while idle
    last: ProcessHandle,
    /// The boot thread, parked while a process runs
    idle: Context,
    /// Save target for a process that was destroyed while running
    discard: Context,
    boot_tss: TaskState,
    boot_gdt: DescriptorTable,
    kernel_directory: u32,
    switches: u64,
}

impl Scheduler {
    pub fn new(kernel_directory: u32) -> Self {
        Scheduler {
            current: None,
            last: ProcessHandle::new(MAX_PROCESSES - 1),
            idle: Context::default(),
            discard: Context::default(),
            boot_tss: TaskState::default(),
            boot_gdt: DescriptorTable::default(),
            kernel_directory,
            switches: 0,
        }
    }

    /// Build and load the descriptor table used by the idle context
    ///
    /// # Safety
    ///
    /// Must run with interrupts disabled, on the boot stack.
    pub unsafe fn install_boot_segments<H: Hardware>(&mut self, hw: &mut H) {
        self.boot_tss = TaskState::new(KERNEL_DATA_SELECTOR, 0);
        self.boot_gdt = DescriptorTable::new(&self.boot_tss);

        hw.load_gdt(&self.boot_gdt.pseudo_descriptor());
        hw.load_segments(KERNEL_CODE_SELECTOR, KERNEL_DATA_SELECTOR);
        hw.load_task_register(TASK_SELECTOR);
    }

    /// The process owning the CPU, `None` while idle
    pub fn current(&self) -> Option<ProcessHandle> {
        self.current
    }

    pub fn switches(&self) -> u64 {
        self.switches
    }

    pub fn idle_context(&self) -> &Context {
        &self.idle
    }

    /// Pick the next runnable process after the current one and switch to it. Keeps running
    /// the current process if nothing else is runnable, and parks the CPU in the idle context
    /// if nothing at all is.
    pub fn tick<H: Hardware>(&mut self, hw: &mut H, table: &mut ProcessTable) {
        hw.without_interrupts(|hw| {
            let next = table.next_runnable(self.current.unwrap_or(self.last));

            match (self.current, next) {
                (Some(current), Some(next)) if current == next => (),
                (_, Some(next)) => self.switch_to(hw, table, next),
                (Some(_), None) => self.switch_to_idle(hw, table),
                (None, None) => (),
            }
        })
    }

    /// Where the outgoing thread of control saves its registers
    fn outgoing(&mut self, table: &mut ProcessTable) -> *mut Context {
        match self.current {
            Some(current) if table.state(current) != ProcessState::Unused => {
                &mut table.slot_mut(current).context as *mut Context
            }
            Some(_) => &mut self.discard as *mut Context,
            None => &mut self.idle as *mut Context,
        }
    }

    fn switch_to<H: Hardware>(&mut self, hw: &mut H, table: &mut ProcessTable, next: ProcessHandle) {
        let incoming = table.slot_mut(next);

        if let Err(e) = incoming.refresh_segments() {
            panic!("Descriptor table of {} corrupted: {}", next, e);
        }

        let directory = incoming
            .page_directory()
            .expect("Runnable process without an address space");
        let load: *const Context = &incoming.context;

        unsafe {
            hw.load_gdt(&incoming.gdt_pd);
            hw.load_task_register(TASK_SELECTOR);
            hw.write_cr3(directory);
        }

        let save = self.outgoing(table);
        trace!("sched: switching to {}", next);

        self.current = Some(next);
        self.last = next;
        self.switches += 1;

        unsafe { hw.switch_context(save, load) };
    }

    fn switch_to_idle<H: Hardware>(&mut self, hw: &mut H, table: &mut ProcessTable) {
        self.boot_gdt.point_task_at(&self.boot_tss);

        unsafe {
            hw.load_gdt(&self.boot_gdt.pseudo_descriptor());
            hw.load_task_register(TASK_SELECTOR);
            hw.write_cr3(self.kernel_directory);
        }

        let save = self.outgoing(table);
        if let Some(current) = self.current.take() {
            self.last = current;
        }

        trace!("sched: nothing runnable, idling");
        self.switches += 1;

        let load: *const Context = &self.idle;
        unsafe { hw.switch_context(save, load) };
    }

    /// The idle loop: wait for interrupts forever. Runs on the boot stack.
    pub fn idle_loop<H: Hardware>(hw: &mut H) -> ! {
        loop {
            hw.enable_interrupts();
            hw.halt();
        }
    }
}
