/// Longest string a single `print` accepts
pub const PRINT_MAX: usize = 256;

#[allow(dead_code)]
#[repr(u32)]
#[derive(Copy, Clone, Debug)]
pub enum Syscall {
    Exit = 0,
    Yield = 1,
    GetPid = 2,
    Fork = 3,
    Wait = 4,
    Print = 5,
    Map = 6,
    Unmap = 7,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SyscallError {
    InvalidBuffer,
    InvalidUtf8,
    InvalidPage,
    OutOfMemory,
    NoChildren,
    UnknownSyscall,
    TableFull,
    UnknownError(i32),
}

bitflags::bitflags! {
    /// Flags for [map]. The page is always present and user accessible.
    pub struct UserPageFlags: u32 {
        const WRITABLE = 1 << 1;
        /// Bits the kernel stores but ignores
        const AVAILABLE = 0b111 << 9;
    }
}

pub fn res_from_code(code: i32) -> Result<u32, SyscallError> {
    match code {
        x if x >= 0 => Ok(x as u32),
        -1 => Err(SyscallError::InvalidBuffer),
        -2 => Err(SyscallError::InvalidUtf8),
        -3 => Err(SyscallError::InvalidPage),
        -4 => Err(SyscallError::OutOfMemory),
        -5 => Err(SyscallError::NoChildren),
        -6 => Err(SyscallError::UnknownSyscall),
        -7 => Err(SyscallError::TableFull),
        unknown => Err(SyscallError::UnknownError(unknown)),
    }
}

/// # Syscall ABI
///
/// `int 0x30`. The call number is passed in `eax`, arguments in `edx, ecx, ebx, edi, esi`, and
/// the result comes back in `eax`.
macro_rules! syscall_raw {
    ($($name:ident($($reg:tt = $val:ident),*)),*) => {
        $(paste::paste! {
            #[allow(dead_code)]
            extern "C" fn [<$name _raw>](
                call: $crate::syscall::Syscall,
                $($val: u32),*
            ) -> i32 {
                let out: i32;
                unsafe {
                    asm!("int 0x30",
                    inlateout("eax") call as u32 => out,
                    $(in($reg) $val,)*
                    options(nostack)
                    );
                };
                out
            }

            #[allow(dead_code)]
            pub fn $name(
                call: $crate::syscall::Syscall,
                $($val: u32),*
            ) -> ::core::result::Result<u32, $crate::syscall::SyscallError> {
                $crate::syscall::res_from_code([<$name _raw>](call, $($val),*))
            }
        })*
    }
}

pub mod raw {
    use core::arch::asm;

    syscall_raw!(
        syscall_0(),
        syscall_1("edx" = arg1),
        syscall_2("edx" = arg1, "ecx" = arg2)
    );
}

pub fn exit(code: i32) -> ! {
    let _ = raw::syscall_1(Syscall::Exit, code as u32);
    unreachable!()
}

pub fn yield_now() {
    let _ = raw::syscall_0(Syscall::Yield);
}

pub fn getpid() -> u32 {
    raw::syscall_0(Syscall::GetPid).unwrap_or(0)
}

/// Returns the child's pid in the parent and zero in the child
pub fn fork() -> Result<u32, SyscallError> {
    raw::syscall_0(Syscall::Fork)
}

/// Block until a child exits and return its pid
pub fn wait() -> Result<u32, SyscallError> {
    raw::syscall_0(Syscall::Wait)
}

pub fn print(string: &str) -> Result<(), SyscallError> {
    let (ptr, len) = (string.as_ptr(), string.len());
    raw::syscall_2(Syscall::Print, ptr as u32, len as u32).map(|_| ())
}

/// Map a zeroed page at `addr`, which must be page aligned and not yet mapped
pub fn map(addr: usize, flags: UserPageFlags) -> Result<(), SyscallError> {
    raw::syscall_2(Syscall::Map, addr as u32, flags.bits()).map(|_| ())
}

pub fn unmap(addr: usize) -> Result<(), SyscallError> {
    raw::syscall_1(Syscall::Unmap, addr as u32).map(|_| ())
}
