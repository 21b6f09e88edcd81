//! The epoll aggregator: one waiter, many events.
//!
//! An [`Epoll`] set owns one [`Receptor`] per attached event, so
//! notifications that land while nobody is waiting are not lost: the
//! receptor's counter holds them, and the next [`Epoll::wait`] coalesces any
//! number of notifications of one event into a single reported [`Slot`].
//!
//! Unlike the single-event wait protocol, a literal zero timeout is legal
//! here and means "poll, do not block".

use alloc::boxed::Box;
use core::cell::{Cell, UnsafeCell};
use core::mem::offset_of;
use core::pin::pin;
use core::ptr::NonNull;

use cordyceps::{Linked, List, list};

use crate::error::{Error, Result};
use crate::event::{Event, Receptor, WakeTarget, detach_locked};
use crate::scheduler::{self, Hub, with_hub};
use crate::task::{Task, TaskState};
use crate::time::Timeout;
use crate::timer::Timer;

/// What happened to an event reported by [`Epoll::wait`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Affair {
    /// The event was notified since the previous wait.
    EventTrigger,
    /// The event was destroyed while attached to the set.
    Error,
}

/// One fired event, as reported by [`Epoll::wait`].
#[derive(Copy, Clone, Debug)]
pub struct Slot {
    /// Identity of the event; only valid to dereference while the event is
    /// alive (it is not, after an [`Affair::Error`]).
    pub event: *const Event,
    /// The token given to [`Epoll::add`].
    pub userdata: usize,
    /// Trigger or destruction.
    pub affair: Affair,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            event: core::ptr::null(),
            userdata: 0,
            affair: Affair::EventTrigger,
        }
    }
}

/// An aggregation of events that lets one task wait on many at once.
///
/// Dropping the set detaches every receptor; membership otherwise survives
/// across waits (and wait timeouts) until [`Epoll::del`].
pub struct Epoll {
    inner: NonNull<EpollInner>,
}

/// Shared control block: the receptor wake path uses this to find the task
/// currently waiting on the set.
pub(crate) struct EpollInner {
    waiter: Cell<Option<NonNull<Task>>>,
    entries: UnsafeCell<List<EpollEntry>>,
}

/// A set-owned attachment to one event.
struct EpollEntry {
    links: list::Links<EpollEntry>,
    receptor: Receptor,
    event: *const Event,
    userdata: usize,
    /// Destruction already reported once.
    dead: Cell<bool>,
}

// === impl EpollInner ===

impl EpollInner {
    pub(crate) fn waiter(&self) -> Option<NonNull<Task>> {
        self.waiter.get()
    }

    /// Drops the waiter registration if it still names `task`. Used by the
    /// task reaper so a freed task can never be woken through this set.
    pub(crate) fn clear_waiter(&self, task: NonNull<Task>) {
        if self.waiter.get() == Some(task) {
            self.waiter.set(None);
        }
    }
}

/// Clears the waiter registration (and its park-frame entry) when the wait
/// frame unwinds; the normal return path has already done both by the time
/// this drops.
struct WaiterGuard {
    inner: NonNull<EpollInner>,
    me: NonNull<Task>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let me = self.me;
        let inner = self.inner;
        let _ = with_hub(|_, _| {
            // Safety: the set outlives this wait frame (it is borrowed for
            // the call) and `me` is the running task dropping this guard.
            unsafe {
                inner.as_ref().clear_waiter(me);
                (*me.as_ptr()).park.clear_epoll();
            }
        });
    }
}

// === impl Epoll ===

impl Epoll {
    /// Allocates an empty set.
    #[must_use]
    pub fn new() -> Self {
        let inner = Box::new(EpollInner {
            waiter: Cell::new(None),
            entries: UnsafeCell::new(List::new()),
        });
        Self {
            // Safety: `Box::into_raw` never returns null.
            inner: unsafe { NonNull::new_unchecked(Box::into_raw(inner)) },
        }
    }

    /// Attaches `event` to the set, tagging it with `userdata`.
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] if the event is already a member,
    /// [`Error::InvalidState`] before `global_init`.
    pub fn add(&self, event: &Event, userdata: usize) -> Result<()> {
        let entry = Box::new(EpollEntry {
            links: list::Links::new(),
            receptor: Receptor::new(WakeTarget::Epoll(self.inner)),
            event,
            userdata,
            dead: Cell::new(false),
        });
        // Safety: the entry box is kept alive by the set until `del` or drop,
        // which unlink it first.
        let ep = unsafe { NonNull::new_unchecked(Box::into_raw(entry)) };

        let added = with_hub(|_, _| {
            // Safety: under the lock; the inner box lives until `Epoll::drop`.
            let inner = unsafe { self.inner.as_ref() };
            // Safety: the entry list is only touched under the lock.
            let entries = unsafe { &mut *inner.entries.get() };
            if entries.iter().any(|e| core::ptr::eq(e.event, event)) {
                return Err(Error::Exists);
            }
            entries.push_back(ep);
            // Safety: the receptor is owned by the just-linked entry.
            unsafe { event.attach_locked(NonNull::from(&ep.as_ref().receptor)) };
            Ok(())
        });
        match added {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) | Err(err) => {
                // Safety: on failure the entry was never linked; reclaim it.
                drop(unsafe { Box::from_raw(ep.as_ptr()) });
                Err(err)
            }
        }
    }

    /// Removes `event` from the set.
    ///
    /// # Errors
    ///
    /// [`Error::NotExists`] if the event is not a member,
    /// [`Error::InvalidState`] before `global_init`.
    pub fn del(&self, event: &Event) -> Result<()> {
        self.del_ptr(event)
    }

    /// Removes an event from the set by identity. This is the only way to
    /// drop a membership whose event has already been destroyed (reported as
    /// [`Affair::Error`]).
    ///
    /// # Errors
    ///
    /// As [`Self::del`].
    pub fn del_ptr(&self, event: *const Event) -> Result<()> {
        let removed = with_hub(|_, _| {
            // Safety: under the lock; see `Epoll::add`.
            let inner = unsafe { self.inner.as_ref() };
            // Safety: the entry list is only touched under the lock.
            let entries = unsafe { &mut *inner.entries.get() };
            let found = entries
                .iter()
                .find(|e| core::ptr::eq(e.event, event))
                .map(NonNull::from)?;
            // Safety: `found` was just observed linked on this list and its
            // receptor is owned by the entry box.
            unsafe {
                entries.remove(found);
                detach_locked(NonNull::from(&found.as_ref().receptor));
            }
            Some(found)
        })?;
        match removed {
            // Safety: unlinked above; the box is ours again.
            Some(ep) => {
                drop(unsafe { Box::from_raw(ep.as_ptr()) });
                Ok(())
            }
            None => Err(Error::NotExists),
        }
    }

    /// Waits for members of the set to fire, reporting up to `slots.len()`
    /// distinct events.
    ///
    /// Returns the number of slots filled. A zero [`Timeout::After`] polls
    /// without blocking (possibly returning 0); [`Timeout::Forever`] blocks
    /// until at least one event fires.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when a non-zero bound expires with nothing fired,
    /// [`Error::InvalidParam`] for an empty slot buffer, [`Error::Busy`] if
    /// another task is already waiting on this set,
    /// [`Error::InvalidState`] before `global_init`.
    pub fn wait(&self, slots: &mut [Slot], timeout: Timeout) -> Result<usize> {
        if slots.is_empty() {
            return Err(Error::InvalidParam);
        }
        let me = scheduler::current_ptr()?;

        let timer = pin!(Timer::named("epoll-timeout"));
        let timer = timer.as_ref();
        let (use_timer, poll_only) = match timeout {
            Timeout::Forever => (false, false),
            Timeout::After(t) if t.0 == 0 => (false, true),
            Timeout::After(t) => {
                timer.set_interval(t);
                (true, false)
            }
        };
        let timer_receptor = pin!(Receptor::new(WakeTarget::Task(me)));
        let trp = NonNull::from(timer_receptor.as_ref().get_ref());
        let tp = NonNull::from(timer.get_ref());

        let cleanup = |hub: &mut Hub, inner: &EpollInner| {
            inner.waiter.set(None);
            // Safety: receptor and timer are pinned on this frame and `me`
            // is the task running this wait; we are under the lock.
            unsafe {
                (*me.as_ptr()).park.clear_epoll();
                if use_timer {
                    detach_locked(trp);
                    (*me.as_ptr()).park.remove_receptor(trp);
                    hub.timers.stop(tp);
                    (*me.as_ptr()).park.remove_timer(tp);
                }
            }
        };

        enum Verdict {
            Filled(usize),
            TimedOut,
            Park,
        }

        with_hub(|hub, p| -> Result<()> {
            // Safety: under the lock; see `Epoll::add`.
            let inner = unsafe { self.inner.as_ref() };
            if let Some(other) = inner.waiter.get()
                && other != me
            {
                return Err(Error::Busy);
            }
            inner.waiter.set(Some(me));
            // Safety: pinned on this frame, detached in `cleanup`; the park
            // frame lets a reaper unhook everything if this task never
            // resumes.
            unsafe {
                (*me.as_ptr()).park.set_epoll(self.inner);
                if use_timer {
                    timer.event().attach_locked(trp);
                    (*me.as_ptr()).park.add_receptor(trp);
                    (*me.as_ptr()).park.add_timer(tp);
                }
            }
            if use_timer {
                if let Err(err) = crate::timer::start_locked(hub, p, tp) {
                    cleanup(hub, inner);
                    return Err(err);
                }
            }
            Ok(())
        })??;
        let _waiter_guard = WaiterGuard {
            inner: self.inner,
            me,
        };

        loop {
            let verdict = with_hub(|hub, _| {
                // Safety: under the lock; see `Epoll::add`.
                let inner = unsafe { self.inner.as_ref() };
                let n = Self::harvest(inner, slots);
                if n > 0 {
                    cleanup(hub, inner);
                    return Verdict::Filled(n);
                }
                if poll_only {
                    cleanup(hub, inner);
                    return Verdict::Filled(0);
                }
                // Safety: pinned on this frame.
                if use_timer && unsafe { trp.as_ref() }.notify_count() > 0 {
                    cleanup(hub, inner);
                    return Verdict::TimedOut;
                }
                // Safety: `me` is the current task; park it.
                unsafe { (*me.as_ptr()).state = TaskState::Waiting };
                Verdict::Park
            })?;

            match verdict {
                Verdict::Filled(n) => return Ok(n),
                Verdict::TimedOut => return Err(Error::Timeout),
                Verdict::Park => scheduler::schedule(),
            };
        }
    }

    /// Collects fired entries into `slots`; runs under the lock.
    fn harvest(inner: &EpollInner, slots: &mut [Slot]) -> usize {
        let mut n = 0;
        // Safety: callers hold the lock.
        let entries = unsafe { &*inner.entries.get() };
        for entry in entries.iter() {
            if n == slots.len() {
                break;
            }
            if entry.receptor.notify_count() > 0 {
                entry.receptor.reset();
                slots[n] = Slot {
                    event: entry.event,
                    userdata: entry.userdata,
                    affair: Affair::EventTrigger,
                };
                n += 1;
            } else if !entry.receptor.is_attached() && !entry.dead.get() {
                entry.dead.set(true);
                slots[n] = Slot {
                    event: entry.event,
                    userdata: entry.userdata,
                    affair: Affair::Error,
                };
                n += 1;
            }
        }
        n
    }
}

impl Default for Epoll {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let inner = self.inner;
        let _ = with_hub(|_, _| {
            // Safety: under the lock; nothing else touches the set once its
            // handle is being dropped.
            let entries = unsafe { &mut *(*inner.as_ptr()).entries.get() };
            while let Some(ep) = entries.pop_front() {
                // Safety: the entry was linked and is alive; detach its
                // receptor before the box goes away.
                unsafe {
                    detach_locked(NonNull::from(&ep.as_ref().receptor));
                    drop(Box::from_raw(ep.as_ptr()));
                }
            }
        });
        // Safety: allocated in `Epoll::new`; all entries were freed above (or
        // leaked along with the runtime if it is already gone).
        drop(unsafe { Box::from_raw(inner.as_ptr()) });
    }
}

// Safety: entries are heap boxes owned by the set, unlinked before free.
unsafe impl Linked<list::Links<EpollEntry>> for EpollEntry {
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
