//! Trap entry stubs, the common trap path, and the context switch.
//!
//! Every vector's stub pushes a zero error code when the CPU does not push one, then the
//! vector number, so all trap frames share one layout. The common path saves the data
//! segments and general registers, loads the kernel data segment, and calls
//! [sable_trap_entry] with a pointer to the finished frame.

use crate::arch::{kernel, X86, IdentityMemory};
use crate::interrupts::{InterruptTable, TrapFrame, VECTOR_COUNT};
use crate::kernel::Kernel;
use core::arch::global_asm;

extern "C" {
    /// Addresses of the entry stubs, by vector
    static sable_vectors: [u32; VECTOR_COUNT];
}

lazy_static::lazy_static! {
    pub static ref IDT: InterruptTable = InterruptTable::new(unsafe { &sable_vectors });
}

global_asm!(
    r#"
.macro TRAP_NOERR num
sable_vector\num:
    push 0
    push \num
    jmp sable_alltraps
.endm

.macro TRAP_ERR num
sable_vector\num:
    push \num
    jmp sable_alltraps
.endm

.section .text
.irp num, 0,1,2,3,4,5,6,7,9,15,16,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48
    TRAP_NOERR \num
.endr
.irp num, 8,10,11,12,13,14,17
    TRAP_ERR \num
.endr

sable_alltraps:
    push ds
    push es
    pushad
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    push esp
    call sable_trap_entry
    add esp, 4

// A never-run process's first switch returns here, with its initial frame on the stack
.global sable_trap_return
sable_trap_return:
    popad
    pop es
    pop ds
    // Vector number and error code
    add esp, 8
    iretd

// sable_switch_context(save: *mut Context, load: *const Context)
.global sable_switch_context
sable_switch_context:
    mov eax, [esp + 4]
    mov edx, [esp + 8]
    mov [eax], edi
    mov [eax + 4], esi
    mov [eax + 8], ebx
    mov [eax + 12], ebp
    mov [eax + 16], esp
    mov edi, [edx]
    mov esi, [edx + 4]
    mov ebx, [edx + 8]
    mov ebp, [edx + 12]
    mov esp, [edx + 16]
    ret

.section .rodata
.balign 4
.global sable_vectors
sable_vectors:
.irp num, 0,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,22,23,24,25,26,27,28,29,30,31,32,33,34,35,36,37,38,39,40,41,42,43,44,45,46,47,48
    .long sable_vector\num
.endr

.section .text
"#
);

/// Called by the common trap path with interrupts disabled
#[no_mangle]
extern "C" fn sable_trap_entry(frame: *mut TrapFrame) {
    // SAFETY: the stub passes the frame it just built on the current kernel stack, and traps
    // never nest because every gate is an interrupt gate
    let kernel: &mut Kernel<X86, IdentityMemory> = unsafe { kernel() };
    kernel.handle_trap(unsafe { &mut *frame });
}
