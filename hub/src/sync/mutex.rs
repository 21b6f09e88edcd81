//! A task mutex.
//!
//! Cooperative tasks rarely need one (control only transfers at explicit
//! suspension points), but any critical region that *contains* a suspension
//! point (walking a shared list with waits inside, say) still needs mutual
//! exclusion. Task context only: never lock from an ISR or producer thread.

use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::scheduler;
use crate::task::Task;
use crate::time::Timeout;

/// Re-entrancy behavior of a [`Mutex`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MutexKind {
    /// A second lock by the owner deadlocks (waits on itself).
    Plain,
    /// A second lock by the owner nests; unlock count must match.
    Recursive,
}

struct MutexState {
    depth: u32,
    owner: Option<NonNull<Task>>,
}

/// A timeout-capable task mutex on top of the condition wait.
pub struct Mutex {
    wakeup: Event,
    kind: MutexKind,
    state: UnsafeCell<MutexState>,
}

// Safety: the state is only touched from task context (single-threaded by
// the cooperative model), under the wait protocol's critical section where
// it matters.
unsafe impl Send for Mutex {}
// Safety: as above.
unsafe impl Sync for Mutex {}

impl Mutex {
    #[must_use]
    pub const fn new(kind: MutexKind) -> Self {
        Self {
            wakeup: Event::named("mutex"),
            kind,
            state: UnsafeCell::new(MutexState {
                depth: 0,
                owner: None,
            }),
        }
    }

    /// Acquires the mutex, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the bound expires, [`Error::InvalidState`] on
    /// lock-count overflow or before `global_init`.
    pub fn lock(&self, timeout: Timeout) -> Result<()> {
        let me = scheduler::current_ptr()?;
        let kind = self.kind;
        let state = self.state.get();
        self.wakeup.wait_condition_timeout(
            // Safety: runs under the critical section; only task context
            // touches the state.
            || unsafe {
                (*state).depth == 0
                    || (kind == MutexKind::Recursive && (*state).owner == Some(me))
            },
            timeout,
        )?;
        // Safety: we are the running task; nobody else mutates the state
        // until we suspend again.
        unsafe {
            if (*state).depth == u32::MAX {
                return Err(Error::InvalidState);
            }
            (*state).owner = Some(me);
            (*state).depth += 1;
        }
        Ok(())
    }

    /// Releases the mutex; the last release wakes all contenders (the
    /// condition re-check picks the winner).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the caller is not the owner.
    pub fn unlock(&self) -> Result<()> {
        let me = scheduler::current_ptr()?;
        let state = self.state.get();
        // Safety: see `Mutex::lock`.
        unsafe {
            if (*state).depth == 0 {
                return Ok(());
            }
            if (*state).owner != Some(me) {
                return Err(Error::InvalidState);
            }
            (*state).depth -= 1;
            if (*state).depth > 0 {
                return Ok(());
            }
            (*state).owner = None;
        }
        self.wakeup.notify()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        self.wakeup.clean();
    }
}
