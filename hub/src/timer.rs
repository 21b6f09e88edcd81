//! The timer engine.
//!
//! Active timers live in an intrusive [`WAVLTree`] ordered by remaining time
//! to expire: deadlines compare by signed distance (see
//! [`Deadline`]), which sidesteps monotonic-counter wraparound. The leftmost
//! node is the next timer to fire, giving the idle path its deadline in
//! O(log n).
//!
//! A [`Timer`] is an [`Event`] in a tree node: firing is just a notify on the
//! embedded event, so everything that can wait on an event (the wait
//! protocol, epoll sets, the callback dispatcher) can wait on a timer.
//!
//! Tree keys are `(deadline, sequence)`: the per-insertion sequence makes
//! equal deadlines unique, so timers that expire on the same tick fire in
//! start order.

use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::pin::Pin;
use core::ptr::NonNull;

use wavltree::{Linked, WAVLTree};

use crate::config::IDLE_CEILING_MS;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::port::Platform;
use crate::scheduler::{Hub, with_hub};
use crate::time::{Deadline, Ticks, msec_to_ticks};

bitflags::bitflags! {
    /// Timer re-arm behavior.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct TimerAttrs: u32 {
        /// Re-arm automatically when the timer fires.
        const AUTO_CIRCULATION = 1 << 0;
        /// Measure the re-arm from the actual firing time instead of the
        /// scheduled deadline.
        const NOW_TIME_BASE = 1 << 1;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct TimerKey {
    deadline: Deadline,
    seq: u64,
}

/// A one-shot or auto-circulating timer around an embedded [`Event`].
///
/// The value must stay pinned while the timer is running, since the tree
/// holds a
/// pointer into it. Dropping a running timer stops it first.
pub struct Timer {
    event: Event,
    links: UnsafeCell<wavltree::Links<Timer>>,
    key: UnsafeCell<TimerKey>,
    interval: Cell<Ticks>,
    attrs: Cell<TimerAttrs>,
    /// In the tree right now. Kept separately from the links because a lone
    /// root node carries no link pointers.
    running: Cell<bool>,
    _pin: PhantomPinned,
}

// Safety: all mutable state is only touched inside the port critical section.
unsafe impl Send for Timer {}
// Safety: as above.
unsafe impl Sync for Timer {}

// === impl Timer ===

impl Timer {
    /// Creates a stopped timer with no interval.
    #[must_use]
    pub const fn new() -> Self {
        Self::named("timer")
    }

    /// Creates a stopped timer whose event carries `name` in trace output.
    #[must_use]
    pub const fn named(name: &'static str) -> Self {
        Self {
            event: Event::named(name),
            links: UnsafeCell::new(wavltree::Links::new()),
            key: UnsafeCell::new(TimerKey {
                deadline: Deadline(0),
                seq: 0,
            }),
            interval: Cell::new(Ticks(0)),
            attrs: Cell::new(TimerAttrs::empty()),
            running: Cell::new(false),
            _pin: PhantomPinned,
        }
    }

    /// The event notified when this timer fires.
    #[must_use]
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Sets the interval; takes effect on the next start.
    pub fn set_interval(&self, interval: Ticks) {
        self.interval.set(interval);
    }

    /// Sets the interval in milliseconds; takes effect on the next start.
    pub fn set_interval_ms(&self, ms: u64) {
        self.interval.set(msec_to_ticks(ms));
    }

    /// Replaces the re-arm attributes.
    pub fn set_attrs(&self, attrs: TimerAttrs) {
        self.attrs.set(attrs);
    }

    /// Arms the timer `interval` ticks from now.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] if already running, [`Error::InvalidParam`] for a zero
    /// interval, [`Error::InvalidState`] before `global_init`.
    pub fn start(self: Pin<&Self>) -> Result<()> {
        let tp = NonNull::from(self.get_ref());
        with_hub(|hub, p| start_locked(hub, p, tp))?
    }

    /// Stops the timer; idempotent.
    pub fn stop(self: Pin<&Self>) {
        let tp = NonNull::from(self.get_ref());
        let _ = with_hub(|hub, _| hub.timers.stop(tp));
    }

    /// Stops the timer if running, then arms it afresh, atomically.
    ///
    /// # Errors
    ///
    /// As [`Self::start`], minus [`Error::Busy`].
    pub fn restart(self: Pin<&Self>) -> Result<()> {
        let tp = NonNull::from(self.get_ref());
        with_hub(|hub, p| {
            hub.timers.stop(tp);
            start_locked(hub, p, tp)
        })?
    }

    /// Is the timer currently armed?
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Stops the timer and wakes any waiters on its event with an error.
    pub fn clean(self: Pin<&Self>) {
        self.stop();
        self.event.clean();
    }

    fn key(&self) -> TimerKey {
        // Safety: written only under the critical section; reads race at
        // worst with a stale snapshot, which every caller tolerates.
        unsafe { *self.key.get() }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if self.is_running() {
            let tp = NonNull::from(&*self);
            let _ = with_hub(|hub, _| hub.timers.stop(tp));
        }
    }
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("event", &self.event)
            .field("interval", &self.interval.get())
            .field("attrs", &self.attrs.get())
            .field("running", &self.is_running())
            .finish()
    }
}

// Safety: timers are pinned while linked (the tree holds pointers into them);
// handles are plain borrows, the tree never assumes ownership.
unsafe impl Linked for Timer {
    type Handle = NonNull<Timer>;
    type Key = TimerKey;

    fn into_ptr(handle: Self::Handle) -> NonNull<Self> {
        handle
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<wavltree::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }

    fn get_key(&self) -> &Self::Key {
        // Safety: the key is stable while the node is linked; the tree only
        // calls this under the critical section.
        unsafe { &*self.key.get() }
    }
}

/// Arms `tp` relative to the current clock and publishes the new idle
/// deadline when the leftmost timer changed.
pub(crate) fn start_locked(hub: &mut Hub, p: &Platform, tp: NonNull<Timer>) -> Result<()> {
    let now = p.now();
    if hub.timers.start(tp, now)? {
        p.expire_change(hub.timers.first_deadline().map(|d| Ticks(d.0)));
        p.idle_break();
    }
    Ok(())
}

// === impl TimerQueue ===

/// The ordered set of running timers.
pub(crate) struct TimerQueue {
    tree: WAVLTree<Timer>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            tree: WAVLTree::new(),
            seq: 0,
        }
    }

    /// Inserts `tp` with `deadline = base + interval`. Returns `Ok(true)`
    /// when the new timer became the soonest to expire.
    pub(crate) fn start(&mut self, tp: NonNull<Timer>, base: Ticks) -> Result<bool> {
        // Safety: callers pass a pinned, live timer; we are under the lock.
        let t = unsafe { tp.as_ref() };
        if t.is_running() {
            return Err(Error::Busy);
        }
        let interval = t.interval.get();
        if interval.0 == 0 {
            return Err(Error::InvalidParam);
        }
        let key = TimerKey {
            deadline: Deadline::after(base, interval),
            seq: self.seq,
        };
        self.seq = self.seq.wrapping_add(1);
        // Safety: the node is not linked, so nothing reads the key while we
        // replace it.
        unsafe { *t.key.get() = key };
        tracing::trace!(timer = t.event.name(), deadline = key.deadline.0, "timer start");
        self.tree.insert(tp);
        t.running.set(true);
        Ok(self.first_deadline() == Some(key.deadline))
    }

    /// Removes `tp` from the tree if present; idempotent.
    pub(crate) fn stop(&mut self, tp: NonNull<Timer>) {
        // Safety: see `TimerQueue::start`.
        let t = unsafe { tp.as_ref() };
        if !t.is_running() {
            return;
        }
        tracing::trace!(timer = t.event.name(), "timer stop");
        // Safety: the running bit says the node is in this tree (there is
        // only one timer tree per runtime).
        unsafe { self.tree.cursor_mut_from_ptr(tp) }.remove();
        t.running.set(false);
    }

    /// Removes and returns the soonest timer if it is due at `now`.
    pub(crate) fn pop_expired(&mut self, now: Ticks) -> Option<NonNull<Timer>> {
        let front = self.tree.front().get()?;
        if front.key().deadline.remaining(now) > 0 {
            return None;
        }
        let tp = NonNull::from(front);
        // Safety: `tp` was just observed as the tree's front node.
        unsafe {
            self.tree.cursor_mut_from_ptr(tp).remove();
            tp.as_ref().running.set(false);
        }
        Some(tp)
    }

    /// Deadline of the soonest timer, if any.
    pub(crate) fn first_deadline(&self) -> Option<Deadline> {
        self.tree.front().get().map(Timer::key).map(|k| k.deadline)
    }

    /// Non-negative ticks until the soonest expiration, clamped to the idle
    /// ceiling so the idle hook always wakes periodically.
    pub(crate) fn first_remaining(&self, now: Ticks) -> Ticks {
        let ceiling = msec_to_ticks(IDLE_CEILING_MS);
        let Some(deadline) = self.first_deadline() else {
            return ceiling;
        };
        let remaining = deadline.remaining(now).max(0).unsigned_abs();
        Ticks(remaining.min(ceiling.0))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

/// Fires every due timer: notify its event, and re-arm auto-circulating ones.
///
/// The re-arm base keeps catch-up semantics: a timer that has fallen behind
/// re-arms from `now` instead of accumulating phantom expirations.
pub(crate) fn check_locked(hub: &mut Hub, p: &Platform) {
    let now = p.now();
    while let Some(tp) = hub.timers.pop_expired(now) {
        // Safety: a timer in the tree is pinned and alive; firing happens
        // under the lock.
        let t = unsafe { tp.as_ref() };
        tracing::trace!(timer = t.event.name(), "timer fire");

        if t.attrs.get().contains(TimerAttrs::AUTO_CIRCULATION) {
            let base = if t.attrs.get().contains(TimerAttrs::NOW_TIME_BASE) {
                now
            } else {
                let scheduled = t.key().deadline;
                let next = Deadline::after(Ticks(scheduled.0), t.interval.get());
                if next.remaining(now) > 0 {
                    Ticks(scheduled.0)
                } else {
                    now
                }
            };
            if let Err(err) = hub.timers.start(tp, base) {
                tracing::warn!(timer = t.event.name(), ?err, "auto re-arm failed");
            }
        }

        t.event.notify_locked(hub, p);
    }
}
