//! A recording stand-in for the CPU, for host tests.

use super::{Context, Hardware};
use crate::gdt::{PseudoDescriptor, SegmentSelector};
use crate::memory::paging::LinearAddress;

/// Where a freshly created process's first switch "returns" to
pub const TRAP_RETURN: u32 = 0x0010_7E70;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    PortWrite(u16, u8),
    Cr0(u32),
    Cr3(u32),
    Gdt(PseudoDescriptor),
    Segments(SegmentSelector, SegmentSelector),
    TaskRegister(SegmentSelector),
    Idt(PseudoDescriptor),
    Invalidate(LinearAddress),
    Halt,
    Switch,
}

/// Records every privileged operation. The live register file is `cpu`: a switch stores it
/// into the outgoing context and replaces it with the incoming one.
#[derive(Debug, Default)]
pub struct SimulatedHardware {
    pub events: Vec<Event>,
    pub cpu: Context,
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub interrupts: bool,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn switches(&self) -> usize {
        self.events.iter().filter(|e| **e == Event::Switch).count()
    }

    pub fn last_task_register(&self) -> Option<SegmentSelector> {
        self.events.iter().rev().find_map(|e| match e {
            Event::TaskRegister(selector) => Some(*selector),
            _ => None,
        })
    }

    pub fn last_gdt(&self) -> Option<PseudoDescriptor> {
        self.events.iter().rev().find_map(|e| match e {
            Event::Gdt(pd) => Some(*pd),
            _ => None,
        })
    }

    pub fn port_writes(&self) -> Vec<(u16, u8)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::PortWrite(port, value) => Some((*port, *value)),
                _ => None,
            })
            .collect()
    }
}

impl Hardware for SimulatedHardware {
    unsafe fn port_read_u8(&mut self, _port: u16) -> u8 {
        0
    }

    unsafe fn port_write_u8(&mut self, port: u16, value: u8) {
        self.events.push(Event::PortWrite(port, value));
    }

    fn read_cr0(&self) -> u32 {
        self.cr0
    }

    unsafe fn write_cr0(&mut self, value: u32) {
        self.cr0 = value;
        self.events.push(Event::Cr0(value));
    }

    fn read_cr2(&self) -> u32 {
        self.cr2
    }

    fn read_cr3(&self) -> u32 {
        self.cr3
    }

    unsafe fn write_cr3(&mut self, directory: u32) {
        self.cr3 = directory;
        self.events.push(Event::Cr3(directory));
    }

    unsafe fn load_gdt(&mut self, table: &PseudoDescriptor) {
        self.events.push(Event::Gdt(*table));
    }

    unsafe fn load_segments(&mut self, code: SegmentSelector, data: SegmentSelector) {
        self.events.push(Event::Segments(code, data));
    }

    unsafe fn load_task_register(&mut self, selector: SegmentSelector) {
        self.events.push(Event::TaskRegister(selector));
    }

    unsafe fn load_idt(&mut self, table: &PseudoDescriptor) {
        self.events.push(Event::Idt(*table));
    }

    fn invalidate_page(&mut self, addr: LinearAddress) {
        self.events.push(Event::Invalidate(addr));
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts
    }

    fn enable_interrupts(&mut self) {
        self.interrupts = true;
    }

    fn disable_interrupts(&mut self) {
        self.interrupts = false;
    }

    fn halt(&mut self) {
        self.events.push(Event::Halt);
    }

    unsafe fn switch_context(&mut self, save: *mut Context, load: *const Context) {
        *save = self.cpu;
        self.cpu = *load;
        self.events.push(Event::Switch);
    }

    fn trap_return_address(&self) -> u32 {
        TRAP_RETURN
    }
}
