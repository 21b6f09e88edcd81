//! x86_64 (SysV) context switching.
//!
//! A saved context is six callee-saved GPRs plus a return address, laid out
//! exactly as [`swap_raw`] pushes them:
//!
//! ```text
//! sp+0x00: r15
//! sp+0x08: r14
//! sp+0x10: r13
//! sp+0x18: r12
//! sp+0x20: rbx
//! sp+0x28: rbp
//! sp+0x30: return address
//! ```
//!
//! [`init_stack`] seeds the same image by hand: the return address slot points
//! at [`trampoline`], the entry function rides in the `rbx` slot and its
//! argument in the `rbp` slot, so no extra stack words are needed to carry
//! them across the first switch. XMM registers are caller-saved in this ABI
//! and need no treatment here; x87/MXCSR control words are assumed to stay at
//! their platform defaults across tasks.

use core::arch::naked_asm;
use core::ptr;

pub const STACK_ALIGNMENT: usize = 16;

const FRAME_WORDS: usize = 7;

/// Saves the callee-saved set to the current stack, publishes the stack
/// pointer through `from`, adopts the stack pointer read from `to` and
/// restores its saved set. `arg` rides through untouched in `rdi` and is
/// returned (`rax`) to the resumed context.
#[unsafe(naked)]
pub(crate) unsafe extern "C" fn swap_raw(
    arg: usize,
    from: *mut usize,
    to: *const usize,
) -> usize {
    naked_asm! {
        // rdi = arg, rsi = from, rdx = to
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // Publish our snapshot, adopt the target's.
        "mov [rsi], rsp",
        "mov rsp, [rdx]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // The pass-through argument doubles as the return value.
        "mov rax, rdi",
        "ret",
    }
}

/// First-resume target of a prepared context. Register state on arrival:
/// `rbx` holds the entry function, `rbp` its argument, `rsp` the 16-byte
/// aligned stack top.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm! {
        "mov rdi, rbp",
        // Terminate the frame-pointer chain for unwinders and backtraces.
        "xor ebp, ebp",
        "call rbx",
        // Entry functions never return; park the stack if one does.
        "2:",
        "jmp 2b",
    }
}

/// Writes the initial context image below `top` and returns the seeded stack
/// pointer.
///
/// # Safety
///
/// `top` must be the 16-byte aligned top of a stack with at least
/// [`FRAME_WORDS`] words of room below it.
pub(crate) unsafe fn init_stack(top: usize, entry: usize, arg: usize) -> usize {
    let sp = top - FRAME_WORDS * size_of::<usize>();
    let slots = sp as *mut usize;
    // Safety: in bounds of the stack per the caller contract.
    unsafe {
        ptr::write(slots, 0); // r15
        ptr::write(slots.add(1), 0); // r14
        ptr::write(slots.add(2), 0); // r13
        ptr::write(slots.add(3), 0); // r12
        ptr::write(slots.add(4), entry); // rbx
        ptr::write(slots.add(5), arg); // rbp
        ptr::write(slots.add(6), trampoline as usize);
    }
    sp
}
