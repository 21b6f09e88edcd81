//! Stackful context switching for the EventHub runtime.
//!
//! This crate provides the lowest layer of the cooperative scheduler: a saved
//! execution [`Context`] per task, the [`swap`] primitive that suspends the
//! running stack and resumes another, and [`prepare`], which seeds a fresh
//! stack so that the first swap into it enters a task entry function.
//!
//! The contract is deliberately small:
//!
//! * [`swap`] saves the ABI's callee-saved register set (integer and, where
//!   the ABI demands it, FP) of the caller into `from`, restores `to`, and
//!   resumes it. The `arg` value surfaces as the return value of the `swap`
//!   call that previously suspended `to`.
//! * [`prepare`] builds a context image at the top of a stack whose first
//!   resume runs a small trampoline; the trampoline forwards the seeded
//!   argument to the entry function. Entry functions must never return; if
//!   one does, the trampoline parks the stack in a spin loop.
//!
//! Scheduling policy, task lifecycles and wake-ups live above this crate; the
//! only thing it knows about is register state and stack memory.

#![cfg_attr(all(not(test), target_os = "none"), no_std)]

extern crate alloc;

mod arch;
pub mod stack;

use core::fmt;

pub use crate::arch::STACK_ALIGNMENT;
use crate::stack::Stack;

/// A task entry function. Receives the argument seeded by [`prepare`] and
/// must never return.
pub type Entry = unsafe extern "C" fn(usize) -> !;

/// A saved execution context.
///
/// The value is a stack pointer snapshot into a stack that holds the saved
/// callee-saved register set, either written by [`swap`] on suspension or
/// seeded by [`prepare`]. [`Context::IDLE`] marks a context that has not been
/// saved yet: the boot task starts out this way and gets a real snapshot the
/// first time it switches away.
#[repr(transparent)]
pub struct Context(usize);

impl Context {
    /// A context that has never been saved.
    pub const IDLE: Self = Self(0);

    /// Returns `true` if this context holds no snapshot yet.
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Context").field(&(self.0 as *const ())).finish()
    }
}

/// Suspends the current execution into `from` and resumes `to`.
///
/// Returns the `arg` of the `swap` call that later resumes `from`.
///
/// # Safety
///
/// * `to` must hold a live snapshot: either seeded by [`prepare`] on a stack
///   that is not currently executing, or written by an earlier `swap`.
/// * `from` and `to` must be distinct contexts.
/// * The stack `to` points into must outlive the suspension; nothing else may
///   resume it concurrently.
#[inline]
pub unsafe fn swap(arg: usize, from: &mut Context, to: &Context) -> usize {
    // Safety: forwarded to the caller; the arch routine only reads `to.0` and
    // overwrites `from.0` with the new snapshot.
    unsafe { arch::swap_raw(arg, &mut from.0, &to.0) }
}

/// Builds a context image at the top of `stack` so that the first [`swap`]
/// into the returned [`Context`] enters `entry` with `arg`.
///
/// The stack is 16-byte aligned at the entry of `entry`.
///
/// # Safety
///
/// * The memory of `stack` must stay valid and unused by anything else for as
///   long as the returned context (or the running task that grows out of it)
///   is alive.
/// * `stack` must be large enough for the context image plus whatever `entry`
///   executes; there is no guard page and no overflow detection at this layer.
pub unsafe fn prepare<S: Stack>(stack: &S, entry: Entry, arg: usize) -> Context {
    let top = stack.top().addr().get() & !(STACK_ALIGNMENT - 1);
    // Safety: `top` is in bounds of the caller-provided stack and aligned.
    let sp = unsafe { arch::init_stack(top, entry as usize, arg) };
    Context(sp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::OwnedStack;

    // Switch target for the tests below. The protocol mirrors the
    // scheduler's: the entry argument carries a pointer to the shared state,
    // every access goes through that raw pointer, and every suspension swaps
    // back to the context stored there.
    struct Shared {
        main: Context,
        task: Context,
        trace: u32,
    }

    unsafe extern "C" fn bouncer(arg: usize) -> ! {
        let shared = arg as *mut Shared;
        // Safety: `shared` was seeded by the test body, outlives the task
        // stack, and is only touched by whichever context is running.
        unsafe {
            (*shared).trace += 1;
            swap(7, &mut (*shared).task, &(*shared).main);
            (*shared).trace += 10;
            swap(8, &mut (*shared).task, &(*shared).main);
        }
        unreachable!("resumed a finished test task");
    }

    #[test]
    fn swap_round_trip() {
        let stack = OwnedStack::new(64 * 1024).unwrap();
        let mut shared = Shared {
            main: Context::IDLE,
            task: Context::IDLE,
            trace: 0,
        };
        let shared = &raw mut shared;
        // Safety: the stack outlives both resumes below; `shared` is only
        // accessed by the running context.
        unsafe {
            (*shared).task = prepare(&stack, bouncer, shared as usize);

            let first = swap(shared as usize, &mut (*shared).main, &(*shared).task);
            assert_eq!(first, 7);
            assert_eq!((*shared).trace, 1);

            let second = swap(0, &mut (*shared).main, &(*shared).task);
            assert_eq!(second, 8);
            assert_eq!((*shared).trace, 11);
        }
    }

    #[test]
    fn idle_context_is_marked() {
        assert!(Context::IDLE.is_idle());
        let stack = OwnedStack::new(32 * 1024).unwrap();
        // Safety: the context is never resumed, the image write alone is
        // harmless.
        let ctx = unsafe { prepare(&stack, bouncer, 0) };
        assert!(!ctx.is_idle());
    }
}
