//! AArch64 (AAPCS64) context switching.
//!
//! A saved context is the integer callee-saved set x19-x28, the frame record
//! pair x29/x30, and the FP callee-saved set d8-d15, 160 bytes in total:
//!
//! ```text
//! sp+0x00: x29        sp+0x08: x30 (resume target)
//! sp+0x10: x19        sp+0x18: x20
//! sp+0x20: x21        sp+0x28: x22
//! sp+0x30: x23        sp+0x38: x24
//! sp+0x40: x25        sp+0x48: x26
//! sp+0x50: x27        sp+0x58: x28
//! sp+0x60: d8  … sp+0x98: d15
//! ```
//!
//! [`init_stack`] points the x30 slot at [`trampoline`] and smuggles the entry
//! function and its argument through the x19/x20 slots.

use core::arch::naked_asm;
use core::ptr;

pub const STACK_ALIGNMENT: usize = 16;

const FRAME_SIZE: usize = 160;

#[unsafe(naked)]
pub(crate) unsafe extern "C" fn swap_raw(
    arg: usize,
    from: *mut usize,
    to: *const usize,
) -> usize {
    naked_asm! {
        // x0 = arg, x1 = from, x2 = to
        "stp x29, x30, [sp, #-160]!",
        "stp x19, x20, [sp, #0x10]",
        "stp x21, x22, [sp, #0x20]",
        "stp x23, x24, [sp, #0x30]",
        "stp x25, x26, [sp, #0x40]",
        "stp x27, x28, [sp, #0x50]",
        "stp d8,  d9,  [sp, #0x60]",
        "stp d10, d11, [sp, #0x70]",
        "stp d12, d13, [sp, #0x80]",
        "stp d14, d15, [sp, #0x90]",
        // Publish our snapshot, adopt the target's.
        "mov x9, sp",
        "str x9, [x1]",
        "ldr x9, [x2]",
        "mov sp, x9",
        "ldp x19, x20, [sp, #0x10]",
        "ldp x21, x22, [sp, #0x20]",
        "ldp x23, x24, [sp, #0x30]",
        "ldp x25, x26, [sp, #0x40]",
        "ldp x27, x28, [sp, #0x50]",
        "ldp d8,  d9,  [sp, #0x60]",
        "ldp d10, d11, [sp, #0x70]",
        "ldp d12, d13, [sp, #0x80]",
        "ldp d14, d15, [sp, #0x90]",
        "ldp x29, x30, [sp], #160",
        // x0 rides through as the return value.
        "ret",
    }
}

/// First-resume target of a prepared context: `x19` holds the entry function,
/// `x20` its argument, `sp` the 16-byte aligned stack top.
#[unsafe(naked)]
unsafe extern "C" fn trampoline() {
    naked_asm! {
        "mov x0, x20",
        // Terminate the frame record chain.
        "mov x29, xzr",
        "mov x30, xzr",
        "blr x19",
        // Entry functions never return; park the stack if one does.
        "2:",
        "b 2b",
    }
}

/// Writes the initial context image below `top` and returns the seeded stack
/// pointer.
///
/// # Safety
///
/// `top` must be the 16-byte aligned top of a stack with at least
/// [`FRAME_SIZE`] bytes of room below it.
pub(crate) unsafe fn init_stack(top: usize, entry: usize, arg: usize) -> usize {
    let sp = top - FRAME_SIZE;
    let slots = sp as *mut usize;
    // Safety: in bounds of the stack per the caller contract.
    unsafe {
        ptr::write_bytes(slots, 0, FRAME_SIZE / size_of::<usize>());
        ptr::write(slots.add(1), trampoline as usize); // x30
        ptr::write(slots.add(2), entry); // x19
        ptr::write(slots.add(3), arg); // x20
    }
    sp
}
