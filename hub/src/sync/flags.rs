//! Bitmask notifications.
//!
//! One word of flag bits next to an event: setters OR bits in and notify,
//! waiters pass a wait mask, an optional clear mask, and receive the bits
//! that matched. Setting is producer-safe.

use core::cell::Cell;

use crate::error::Result;
use crate::event::Event;
use crate::scheduler::with_hub;
use crate::time::Timeout;

/// A word of wait-able flag bits.
pub struct EventFlags {
    event: Event,
    bits: Cell<usize>,
}

// Safety: `bits` is only touched under the critical section (setters lock,
// the wait condition runs locked).
unsafe impl Send for EventFlags {}
// Safety: as above.
unsafe impl Sync for EventFlags {}

impl EventFlags {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            event: Event::named("flags"),
            bits: Cell::new(0),
        }
    }

    /// Waits until any bit of `wait_mask` is set, then clears `clear_mask`
    /// and returns the bits that matched.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`](crate::Error::Timeout) when the bound expires,
    /// [`Error::InvalidState`](crate::Error::InvalidState) before
    /// `global_init`.
    pub fn wait(&self, wait_mask: usize, clear_mask: usize, timeout: Timeout) -> Result<usize> {
        let matched = Cell::new(0);
        self.event.wait_condition_timeout(
            || {
                let hit = self.bits.get() & wait_mask;
                if hit != 0 {
                    matched.set(hit);
                    self.bits.set(self.bits.get() & !clear_mask);
                    true
                } else {
                    false
                }
            },
            timeout,
        )?;
        Ok(matched.get())
    }

    /// ORs `bits` into the flags and wakes waiters. Producer-safe.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`](crate::Error::InvalidState) before
    /// `global_init`.
    pub fn set_bits(&self, bits: usize) -> Result<()> {
        with_hub(|hub, p| {
            self.bits.set(self.bits.get() | bits);
            self.event.notify_locked(hub, p);
        })
    }

    /// Replaces the flags wholesale and wakes waiters. Producer-safe.
    ///
    /// # Errors
    ///
    /// As [`Self::set_bits`].
    pub fn set(&self, bits: usize) -> Result<()> {
        with_hub(|hub, p| {
            self.bits.set(bits);
            self.event.notify_locked(hub, p);
        })
    }

    /// Current raw bits (racy outside the critical section; diagnostic use).
    #[must_use]
    pub fn peek(&self) -> usize {
        self.bits.get()
    }
}

impl Default for EventFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventFlags {
    fn drop(&mut self) {
        self.event.clean();
    }
}
