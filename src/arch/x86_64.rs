use core::arch::naked_asm;

use super::Context;

// Bootstrap frame layout, low address (= Context.sp) to high:
//   +0  r15 = footer_addr
//   +8  r14 = entry (bootstrap fn pointer)
//   +16 r13 = 0
//   +24 r12 = 0
//   +32 rbx = 0
//   +40 rbp = 0
//   +48 return address = trampoline
//   +56 (8 bytes unused, keeps the frame a multiple of 16 below stack_top)
const FRAME_SIZE: usize = 64;

pub unsafe fn bootstrap(stack_top: usize, footer_addr: usize, entry: usize) -> Context {
    debug_assert_eq!(stack_top % 16, 0, "stack top must be 16-byte aligned");

    let frame_base = stack_top - FRAME_SIZE;
    unsafe {
        let w = |offset: usize, value: usize| {
            (frame_base as *mut usize).byte_add(offset).write(value)
        };
        w(0, footer_addr);
        w(8, entry);
        w(16, 0);
        w(24, 0);
        w(32, 0);
        w(40, 0);
        w(48, trampoline as usize);
    }

    Context { sp: frame_base }
}

pub unsafe fn switch(from: *mut Context, to: *const Context, transfer: usize) -> usize {
    unsafe { arch_switch(from, to, transfer) }
}

#[naked]
unsafe extern "C" fn arch_switch(_from: *mut Context, _to: *const Context, _transfer: usize) -> usize {
    // System V AMD64: from = rdi, to = rsi, transfer = rdx, return in rax.
    unsafe {
        naked_asm!(
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            "mov [rdi], rsp",
            "mov rsp, [rsi]",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "mov rax, rdx",
            "ret",
        )
    }
}

/// Entered by `ret` on a coroutine's first switch. Recovers the footer
/// pointer and the bootstrap entry point from the registers `bootstrap`
/// stashed in the synthetic frame, then tail-calls into it.
#[naked]
unsafe extern "C" fn trampoline() -> ! {
    unsafe {
        naked_asm!(
            "mov rdi, r15",
            "jmp r14",
        )
    }
}
