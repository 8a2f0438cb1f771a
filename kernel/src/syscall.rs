//! System calls
//!
//! # Syscall ABI
//!
//! `int 0x30`, the only gate user space may invoke directly. The call number is passed in
//! `eax` and arguments in `edx, ecx, ebx, edi, esi`. The result comes back in `eax`:
//! non-negative on success, a negative [SyscallError] code otherwise.

use crate::config::{PAGE_SIZE, PRINT_BUFFER_SIZE, USER_BASE, USER_LIMIT};
use crate::hardware::Hardware;
use crate::interrupts::TrapFrame;
use crate::kernel::Kernel;
use crate::memory::address_space::{MapError, UserAccessError};
use crate::memory::paging::{EntryFlags, LinearAddress};
use crate::memory::{OutOfMemory, PhysicalMemory};
use crate::process::{ProcessError, ProcessHandle, ProcessState};
use core::fmt;

#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Syscall {
    /// `exit(code)`. Never returns.
    Exit = 0,
    Yield = 1,
    GetPid = 2,
    /// Returns the child's pid in the parent and zero in the child
    Fork = 3,
    /// Block until a child exits, then return its pid
    Wait = 4,
    /// `print(ptr, len)`: write UTF-8 text to the kernel log
    Print = 5,
    /// `map(addr, flags)`: map a zeroed page. Only present, writable, user and the available
    /// bits of `flags` are honoured.
    Map = 6,
    /// `unmap(addr)`: remove a page added by `map`
    Unmap = 7,
}

impl Syscall {
    pub fn from_u32(v: u32) -> Option<Syscall> {
        match v {
            0 => Some(Syscall::Exit),
            1 => Some(Syscall::Yield),
            2 => Some(Syscall::GetPid),
            3 => Some(Syscall::Fork),
            4 => Some(Syscall::Wait),
            5 => Some(Syscall::Print),
            6 => Some(Syscall::Map),
            7 => Some(Syscall::Unmap),
            _ => None,
        }
    }
}

/// Failures reported to user space. The discriminants are the codes returned in `eax`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallError {
    InvalidBuffer = -1,
    InvalidUtf8 = -2,
    InvalidPage = -3,
    OutOfMemory = -4,
    NoChildren = -5,
    UnknownSyscall = -6,
    TableFull = -7,
}

impl SyscallError {
    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn description(&self) -> &'static str {
        match self {
            SyscallError::InvalidBuffer => "buffer not readable by the caller",
            SyscallError::InvalidUtf8 => "text is not valid UTF-8",
            SyscallError::InvalidPage => "address not an unused user page",
            SyscallError::OutOfMemory => "out of physical memory",
            SyscallError::NoChildren => "no children to wait for",
            SyscallError::UnknownSyscall => "unknown system call",
            SyscallError::TableFull => "process table full",
        }
    }
}

impl fmt::Display for SyscallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl From<UserAccessError> for SyscallError {
    fn from(_: UserAccessError) -> Self {
        SyscallError::InvalidBuffer
    }
}

impl From<OutOfMemory> for SyscallError {
    fn from(_: OutOfMemory) -> Self {
        SyscallError::OutOfMemory
    }
}

impl From<MapError> for SyscallError {
    fn from(e: MapError) -> Self {
        match e {
            MapError::OutOfMemory => SyscallError::OutOfMemory,
            MapError::AlreadyMapped(_) | MapError::InvalidAddress(_) => SyscallError::InvalidPage,
        }
    }
}

impl From<ProcessError> for SyscallError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::TableFull => SyscallError::TableFull,
            _ => SyscallError::OutOfMemory,
        }
    }
}

/// A page-aligned address in the user window
fn user_page(addr: u32) -> Result<LinearAddress, SyscallError> {
    let addr = LinearAddress::new(addr);

    if addr.is_page_aligned() && (USER_BASE..USER_LIMIT).contains(&addr.as_u32()) {
        Ok(addr)
    } else {
        Err(SyscallError::InvalidPage)
    }
}

impl<H: Hardware, M: PhysicalMemory> Kernel<H, M> {
    /// Run a system call for `current` and write its result into `frame`. Calls that leave
    /// the caller blocked or destroyed write nothing.
    pub(crate) fn syscall(&mut self, current: ProcessHandle, frame: &mut TrapFrame) {
        let number = frame.syscall_number();
        let args = frame.syscall_args();

        let syscall = match Syscall::from_u32(number) {
            Some(syscall) => syscall,
            None => {
                warn!("syscall: {} made unknown call {}", current, number);
                frame.set_return(SyscallError::UnknownSyscall.code());
                return;
            }
        };

        trace!("syscall: {} {:?} {:x?}", current, syscall, args);

        let result = match syscall {
            Syscall::Exit => {
                info!("syscall: {} exited with {}", current, args[0] as i32);
                self.exit(current);
                return;
            }
            Syscall::Yield => {
                self.reschedule();
                Ok(0)
            }
            Syscall::GetPid => Ok(current.pid()),
            Syscall::Fork => self
                .fork(current, frame)
                .map(ProcessHandle::pid)
                .map_err(SyscallError::from),
            Syscall::Wait => match self.wait(current) {
                Some(result) => result,
                None => return,
            },
            Syscall::Print => self.print(current, args[0], args[1]),
            Syscall::Map => self.map_page(current, args[0], args[1]),
            Syscall::Unmap => self.unmap_page(current, args[0]),
        };

        if let Err(e) = result {
            debug!("syscall: {:?} from {} failed: {}", syscall, current, e);
        }

        frame.set_return(match result {
            Ok(value) => value as i32,
            Err(e) => e.code(),
        });
    }

    /// `None` if the caller blocked. Its frame then receives the pid of the child whose exit
    /// wakes it.
    fn wait(&mut self, current: ProcessHandle) -> Option<Result<u32, SyscallError>> {
        if let Some(child) = self.processes.take_exited_child(current) {
            return Some(Ok(child.pid()));
        }

        if !self.processes.has_children(current) {
            return Some(Err(SyscallError::NoChildren));
        }

        let Kernel {
            hw,
            processes,
            scheduler,
            ..
        } = self;

        hw.without_interrupts(|hw| {
            processes.set_state(current, ProcessState::Waiting);
            scheduler.tick(hw, processes);
        });

        None
    }

    fn print(&mut self, current: ProcessHandle, ptr: u32, len: u32) -> Result<u32, SyscallError> {
        let len = len as usize;
        if len > PRINT_BUFFER_SIZE {
            return Err(SyscallError::InvalidBuffer);
        }

        let mut buffer = [0u8; PRINT_BUFFER_SIZE];
        self.processes[current]
            .address_space()
            .expect("Live process without an address space")
            .copy_from_user(&self.memory, LinearAddress::new(ptr), &mut buffer[..len])?;

        let text = core::str::from_utf8(&buffer[..len]).map_err(|_| SyscallError::InvalidUtf8)?;
        info!(target: "user", "{}: {}", current, text);

        Ok(len as u32)
    }

    fn map_page(&mut self, current: ProcessHandle, addr: u32, flags: u32) -> Result<u32, SyscallError> {
        let addr = user_page(addr)?;
        let flags =
            EntryFlags::from_user_request(flags) | EntryFlags::PRESENT | EntryFlags::USER_ACCESSIBLE;

        let Kernel {
            hw,
            memory,
            processes,
            ..
        } = self;

        hw.without_interrupts(|_| -> Result<u32, SyscallError> {
            let frame = memory.allocate_page()?;
            memory.zero(frame, PAGE_SIZE as usize);

            let space = processes
                .slot_mut(current)
                .address_space_mut()
                .expect("Live process without an address space");

            if let Err(e) = space.map(memory, addr, frame, flags) {
                memory.free_page(frame);
                return Err(e.into());
            }

            debug!("syscall: {} mapped {:?} as {:?}", current, addr, flags);
            Ok(0)
        })
    }

    fn unmap_page(&mut self, current: ProcessHandle, addr: u32) -> Result<u32, SyscallError> {
        let addr = user_page(addr)?;

        let Kernel {
            hw,
            memory,
            processes,
            ..
        } = self;

        hw.without_interrupts(|hw| {
            // Image and stack pages live in the process's own region and stay mapped
            let owned = processes[current].memory();
            let space = processes
                .slot_mut(current)
                .address_space_mut()
                .expect("Live process without an address space");

            match space.translate(memory, addr) {
                Some((frame, _)) if !owned.contains(frame) => {
                    space.unmap(memory, addr);
                    memory.free_page(frame);
                    hw.invalidate_page(addr);
                    Ok(0)
                }
                _ => Err(SyscallError::InvalidPage),
            }
        })
    }
}
