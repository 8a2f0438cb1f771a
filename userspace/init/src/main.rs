#![no_std]
#![no_main]

use libsable::prelude::*;
use libsable::syscall::{self, UserPageFlags};

/// Above the image and stack, below the top of the user window
const SCRATCH_PAGE: usize = 0x8000_0000;

#[libsable::main]
fn main() {
    println!("Hello from pid {}!", syscall::getpid());

    match syscall::fork() {
        Ok(0) => child(),
        Ok(pid) => {
            println!("Forked pid {}, waiting...", pid);
            match syscall::wait() {
                Ok(pid) => println!("Pid {} exited", pid),
                Err(e) => println!("Wait failed: {:?}", e),
            }
        }
        Err(e) => println!("Fork failed: {:?}", e),
    }

    println!("Exiting...");
}

fn child() {
    println!("Child running as pid {}", syscall::getpid());

    if let Err(e) = syscall::map(SCRATCH_PAGE, UserPageFlags::WRITABLE) {
        println!("Map failed: {:?}", e);
        return;
    }

    let scratch = SCRATCH_PAGE as *mut u32;
    unsafe {
        // Fresh pages are zeroed
        assert_eq!(scratch.read_volatile(), 0);
        scratch.write_volatile(0xC0FFEE);
        println!("Scratch page holds 0x{:x}", scratch.read_volatile());
    }

    for _ in 0..3 {
        syscall::yield_now();
    }

    let _ = syscall::unmap(SCRATCH_PAGE);
}
