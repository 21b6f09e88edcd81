//! The event / receptor notification primitive.
//!
//! An [`Event`] is level-less fan-out: it carries no payload queue, only an
//! intrusive list of [`Receptor`]s. Notifying walks the list, bumps every
//! receptor's notify counter and moves each unique waiter back to the ready
//! list. Receptors live on the *waiter's stack frame*; the event merely
//! borrows them for the duration of a wait, so no suspension point ever
//! allocates.
//!
//! The wait protocol below re-checks the notify counter after every resume:
//! a notification serialized after the receptor was attached is therefore
//! never lost, even if it lands before the waiter has actually suspended.
//! A receptor found detached without a pending notification means the event
//! was destroyed under the waiter ([`Error::EventClosed`]).

use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::pin::pin;
use core::ptr::NonNull;

use cordyceps::{Linked, List, list};

use crate::epoll::EpollInner;
use crate::error::{Error, Result};
use crate::port::Platform;
use crate::scheduler::{self, Hub, with_hub};
use crate::task::{Task, TaskState};
use crate::time::Timeout;
use crate::timer::Timer;

/// A fan-out notification primitive with no buffered payload.
pub struct Event {
    name: &'static str,
    receptors: UnsafeCell<List<Receptor>>,
}

// Safety: the receptor list is only touched inside the port critical section;
// producers on other threads funnel through the same lock.
unsafe impl Send for Event {}
// Safety: as above.
unsafe impl Sync for Event {}

/// Who a notification should wake.
#[derive(Copy, Clone)]
pub(crate) enum WakeTarget {
    /// Wake this task directly.
    Task(NonNull<Task>),
    /// Wake whichever task is currently waiting on this epoll set.
    Epoll(NonNull<EpollInner>),
}

/// A per-waiter attachment on an event.
///
/// Transient: allocated on the waiter's stack (or owned by an epoll set),
/// linked into at most one event's receptor list at a time. The notify
/// counter is the only evidence that a notification occurred between parking
/// and resuming.
pub(crate) struct Receptor {
    links: list::Links<Receptor>,
    target: WakeTarget,
    notify_cnt: Cell<u32>,
    /// The event this receptor is currently attached to, if any. Cleared on
    /// detach so the drop backstop knows there is nothing left to unlink.
    owner: Cell<Option<NonNull<Event>>>,
    _pin: PhantomPinned,
}

// === impl Event ===

impl Event {
    /// Creates an unnamed event.
    #[must_use]
    pub const fn new() -> Self {
        Self::named("event")
    }

    /// Creates an event with a name used in trace output.
    #[must_use]
    pub const fn named(name: &'static str) -> Self {
        Self {
            name,
            receptors: UnsafeCell::new(List::new()),
        }
    }

    /// The name given at construction.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wakes every receptor currently attached to this event.
    ///
    /// Callable from any producer context the port admits (task, ISR, host
    /// thread); runs entirely inside the critical section.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] before `global_init`.
    pub fn notify(&self) -> Result<()> {
        with_hub(|hub, p| self.notify_locked(hub, p))
    }

    /// Wakes all attached receptors with an error indication and detaches
    /// them; call before releasing the event instance.
    pub fn clean(&self) {
        let cleaned = with_hub(|hub, p| self.clean_locked(hub, p));
        if cleaned.is_err() {
            tracing::debug!(event = self.name, "clean with no runtime installed");
        }
    }

    /// Waits for a notification, with a bound.
    ///
    /// A notification that happened before this call is not observable (the
    /// event has no queue). [`Timeout::After`] of zero ticks is rejected: a
    /// zero-wait poll needs the epoll aggregator.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the bound expires first, [`Error::EventClosed`]
    /// when the event is destroyed under the waiter, [`Error::InvalidParam`]
    /// for a zero timeout.
    pub fn wait_timeout(&self, timeout: Timeout) -> Result<()> {
        self.wait_inner(None, timeout)
    }

    /// Waits until `condition` holds, re-arming on every notification.
    ///
    /// The condition runs inside the critical section: it must be quick and
    /// must not call runtime operations. It is evaluated once at attach time
    /// (a condition that already holds returns immediately) and then after
    /// every notification; a notification with a false condition re-parks
    /// the waiter.
    ///
    /// # Errors
    ///
    /// As [`Self::wait_timeout`].
    pub fn wait_condition_timeout<F>(&self, mut condition: F, timeout: Timeout) -> Result<()>
    where
        F: FnMut() -> bool,
    {
        self.wait_inner(Some(&mut condition), timeout)
    }

    fn wait_inner(
        &self,
        mut cond: Option<&mut dyn FnMut() -> bool>,
        timeout: Timeout,
    ) -> Result<()> {
        let me = scheduler::current_ptr()?;

        // The timeout timer and both receptors live on this frame; every exit
        // path below detaches and stops them inside one critical section.
        let timer = pin!(Timer::named("wait-timeout"));
        let timer = timer.as_ref();
        let use_timer = match timeout {
            Timeout::Forever => false,
            Timeout::After(t) => {
                if t.0 == 0 {
                    return Err(Error::InvalidParam);
                }
                timer.set_interval(t);
                true
            }
        };

        let receptor = pin!(Receptor::new(WakeTarget::Task(me)));
        let rp = NonNull::from(receptor.as_ref().get_ref());
        let timer_receptor = pin!(Receptor::new(WakeTarget::Task(me)));
        let trp = NonNull::from(timer_receptor.as_ref().get_ref());
        let tp = NonNull::from(timer.get_ref());

        enum Verdict {
            Satisfied,
            Park,
            TimedOut,
            Closed,
        }

        let cleanup = |hub: &mut Hub| {
            // Safety: both receptors and the timer are pinned on this frame
            // and outlive the wait; we are inside the critical section.
            unsafe {
                detach_locked(rp);
                (*me.as_ptr()).park.remove_receptor(rp);
                if use_timer {
                    detach_locked(trp);
                    (*me.as_ptr()).park.remove_receptor(trp);
                    hub.timers.stop(tp);
                    (*me.as_ptr()).park.remove_timer(tp);
                }
            }
        };

        let ready = with_hub(|hub, p| -> Result<bool> {
            // Safety: receptors and timer are pinned on this frame; every
            // exit path detaches them under the lock via `cleanup`, and the
            // park frame lets a reaper unhook them if this task never
            // resumes.
            unsafe {
                self.attach_locked(rp);
                (*me.as_ptr()).park.add_receptor(rp);
                if use_timer {
                    timer.event().attach_locked(trp);
                    (*me.as_ptr()).park.add_receptor(trp);
                    (*me.as_ptr()).park.add_timer(tp);
                }
            }
            if use_timer {
                if let Err(err) = crate::timer::start_locked(hub, p, tp) {
                    cleanup(hub);
                    return Err(err);
                }
            }
            if let Some(c) = cond.as_mut()
                && c()
            {
                cleanup(hub);
                return Ok(true);
            }
            Ok(false)
        })??;
        if ready {
            return Ok(());
        }

        loop {
            let parked = with_hub(|_, _| {
                // Safety: `rp`/`trp` are pinned on this frame and we hold the
                // critical section.
                let r = unsafe { rp.as_ref() };
                // Safety: as above.
                let tr = unsafe { trp.as_ref() };
                // A notification (or destruction, or timer fire) that landed
                // since the last check must not be slept through: park only
                // while nothing has happened yet.
                let undisturbed = r.notify_cnt.get() == 0
                    && r.is_attached()
                    && (!use_timer || (tr.notify_cnt.get() == 0 && tr.is_attached()));
                if undisturbed {
                    // Safety: `me` is the current task; flipping its state
                    // under the lock is the park half of the wait protocol.
                    unsafe { (*me.as_ptr()).state = TaskState::Waiting };
                }
                undisturbed
            })?;
            if parked {
                scheduler::schedule();
            }

            let verdict = with_hub(|hub, _| {
                // Safety: `rp`/`trp` are pinned on this frame and we hold the
                // critical section.
                let r = unsafe { rp.as_ref() };
                // Safety: as above.
                let tr = unsafe { trp.as_ref() };
                if r.notify_cnt.get() > 0 {
                    match cond.as_mut() {
                        Some(c) => {
                            if !c() {
                                r.notify_cnt.set(0);
                                Verdict::Park
                            } else {
                                cleanup(hub);
                                Verdict::Satisfied
                            }
                        }
                        None => {
                            cleanup(hub);
                            Verdict::Satisfied
                        }
                    }
                } else if use_timer && tr.notify_cnt.get() > 0 {
                    cleanup(hub);
                    Verdict::TimedOut
                } else if !r.is_attached() || (use_timer && !tr.is_attached()) {
                    // Detached without a notification: destroyed under us.
                    cleanup(hub);
                    Verdict::Closed
                } else {
                    // Spurious wakeup.
                    Verdict::Park
                }
            })?;

            match verdict {
                Verdict::Satisfied => return Ok(()),
                Verdict::TimedOut => return Err(Error::Timeout),
                Verdict::Closed => return Err(Error::EventClosed),
                Verdict::Park => {}
            }
        }
    }

    pub(crate) fn notify_locked(&self, hub: &mut Hub, p: &Platform) {
        tracing::trace!(event = self.name, "notify");
        // Safety: inside the critical section per the caller.
        let list = unsafe { &*self.receptors.get() };
        for r in list.iter() {
            r.notify_cnt.set(r.notify_cnt.get().saturating_add(1));
            r.wake(hub, p);
        }
    }

    pub(crate) fn clean_locked(&self, hub: &mut Hub, p: &Platform) {
        tracing::trace!(event = self.name, "clean");
        // Safety: inside the critical section per the caller.
        let list = unsafe { &mut *self.receptors.get() };
        while let Some(rp) = list.pop_front() {
            // Safety: the node was linked, so it is alive; waking without
            // bumping the counter is the destroyed-under-waiter signal.
            let r = unsafe { rp.as_ref() };
            r.owner.set(None);
            r.wake(hub, p);
        }
    }

    /// Links `receptor` onto this event's receptor list (at the tail, so
    /// wake order follows attach order).
    ///
    /// # Safety
    ///
    /// Must run inside the critical section; `receptor` must be pinned,
    /// currently unattached, and must be detached before it is freed.
    pub(crate) unsafe fn attach_locked(&self, receptor: NonNull<Receptor>) {
        // Safety: per this function's contract.
        let list = unsafe { &mut *self.receptors.get() };
        // Safety: as above.
        unsafe { receptor.as_ref() }
            .owner
            .set(Some(NonNull::from(self)));
        list.push_back(receptor);
    }

    pub(crate) fn has_receptors(&self) -> bool {
        // Safety: read-only peek used by Drop and tests; racing producers are
        // excluded by the caller holding (or being outside) the runtime.
        !unsafe { &*self.receptors.get() }.is_empty()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if self.has_receptors() {
            self.clean();
        }
    }
}

impl core::fmt::Debug for Event {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Event").field("name", &self.name).finish()
    }
}

// === impl Receptor ===

impl Receptor {
    pub(crate) const fn new(target: WakeTarget) -> Self {
        Self {
            links: list::Links::new(),
            target,
            notify_cnt: Cell::new(0),
            owner: Cell::new(None),
            _pin: PhantomPinned,
        }
    }

    /// Still linked on its event's receptor list?
    pub(crate) fn is_attached(&self) -> bool {
        self.owner.get().is_some()
    }

    pub(crate) fn notify_count(&self) -> u32 {
        self.notify_cnt.get()
    }

    pub(crate) fn reset(&self) {
        self.notify_cnt.set(0);
    }

    fn wake(&self, hub: &mut Hub, p: &Platform) {
        match self.target {
            WakeTarget::Task(task) => hub.wake_task(task, p),
            WakeTarget::Epoll(inner) => {
                // Safety: the epoll set owns this receptor and outlives it.
                if let Some(waiter) = unsafe { inner.as_ref() }.waiter() {
                    hub.wake_task(waiter, p);
                }
            }
        }
    }
}

/// Unlinks `receptor` from whatever event it is attached to, if any.
///
/// # Safety
///
/// Must run inside the critical section; `receptor` must point to a live
/// receptor.
pub(crate) unsafe fn detach_locked(receptor: NonNull<Receptor>) {
    // Safety: per this function's contract.
    let r = unsafe { receptor.as_ref() };
    if let Some(event) = r.owner.take() {
        // Safety: `owner` is only set while linked on exactly this event.
        unsafe {
            let list = &mut *event.as_ref().receptors.get();
            list.remove(receptor);
        }
    }
}

impl Drop for Receptor {
    fn drop(&mut self) {
        // Backstop for unwinding out of a wait: a linked receptor must never
        // outlive its frame.
        if self.is_attached() {
            let rp = NonNull::from(&*self);
            // Safety: detach under the lock; the receptor and (for a task
            // target) the task whose park frame recorded it are both still
            // alive here.
            let _ = with_hub(|_, _| unsafe {
                detach_locked(rp);
                if let WakeTarget::Task(task) = self.target {
                    (*task.as_ptr()).park.remove_receptor(rp);
                }
            });
        }
    }
}

// Safety: receptors are pinned while linked (wait protocol and epoll entries
// both guarantee it) and `links` is an ordinary field of the struct.
unsafe impl Linked<list::Links<Receptor>> for Receptor {
    type Handle = NonNull<Self>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        r
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        ptr
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}
