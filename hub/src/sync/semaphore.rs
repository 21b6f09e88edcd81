//! A counting semaphore.
//!
//! An event alone collapses any number of notifications into one wakeup; the
//! semaphore adds the counter that makes every post observable. Posts are
//! producer-safe (ISR / host thread); waits are task context only. The
//! consumed and posted counts are kept separately so the single consumer
//! side never contends with producers on one cell.

use core::cell::Cell;

use crate::error::{Error, Result};
use crate::event::Event;
use crate::scheduler::with_hub;
use crate::time::Timeout;

/// A counting semaphore on top of the condition wait.
pub struct Semaphore {
    wakeup: Event,
    /// Count consumed by `wait` (P side).
    taken: Cell<u32>,
    /// Count published by `post` (V side).
    posted: Cell<u32>,
}

// Safety: `posted` is only touched under the critical section; `taken` only
// from task context.
unsafe impl Send for Semaphore {}
// Safety: as above.
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Creates a semaphore holding `value` initial permits.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self {
            wakeup: Event::named("sem"),
            taken: Cell::new(0),
            posted: Cell::new(value),
        }
    }

    /// Takes one permit, waiting up to `timeout` for a post.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the bound expires, [`Error::InvalidState`]
    /// before `global_init`.
    pub fn wait(&self, timeout: Timeout) -> Result<()> {
        self.wakeup
            .wait_condition_timeout(|| self.taken.get() != self.posted.get(), timeout)?;
        self.taken.set(self.taken.get().wrapping_add(1));
        Ok(())
    }

    /// Releases one permit and wakes a waiter. Producer-safe.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] when the counter is saturated,
    /// [`Error::InvalidState`] before `global_init`.
    pub fn post(&self) -> Result<()> {
        with_hub(|hub, p| {
            let next = self.posted.get().wrapping_add(1);
            if next == self.taken.get() {
                return Err(Error::Busy);
            }
            self.posted.set(next);
            self.wakeup.notify_locked(hub, p);
            Ok(())
        })?
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.wakeup.clean();
    }
}
