//! Signal-slot callbacks on top of events.
//!
//! A [`Trigger`] is registered for an event in the runtime-interior epoll
//! set; the *dispatcher* (the one [system task](crate::TaskFlags::SYSTEM)
//! of the runtime, created at `global_init`) waits on that set and runs
//! every [`CbSlot`] connected to the trigger when its event fires. Because
//! the dispatcher is the system task, callbacks run before application tasks
//! get the processor.
//!
//! Triggers and slots are caller-owned intrusive nodes, exactly like event
//! receptors: nothing here allocates per notification.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{Cell, UnsafeCell};
use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::pin::Pin;
use core::ptr::NonNull;

use cordyceps::{Linked, List, list};

use crate::config::{CALLBACK_DISPATCH_SLOTS, CALLBACK_DISPATCH_STACK_SIZE};
use crate::epoll::{Affair, Epoll, Slot};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::scheduler::with_hub;
use crate::task::{TaskFlags, TaskRef, spawn};
use crate::time::Timeout;

/// A callback function: receives the fired event and the slot's parameter.
pub type CbFn = fn(*const Event, usize);

/// The receiving end of an event registration: a list of connected slots.
pub struct Trigger {
    slots: UnsafeCell<List<CbSlot>>,
    _pin: PhantomPinned,
}

// Safety: the slot list is only touched under the critical section.
unsafe impl Send for Trigger {}
// Safety: as above.
unsafe impl Sync for Trigger {}

/// One connected callback.
pub struct CbSlot {
    links: list::Links<CbSlot>,
    func: CbFn,
    param: usize,
    owner: Cell<Option<NonNull<Trigger>>>,
    _pin: PhantomPinned,
}

// Safety: the owner cell and links are only touched under the critical
// section; slots are usually `static`s shared with the dispatcher task.
unsafe impl Send for CbSlot {}
// Safety: as above.
unsafe impl Sync for CbSlot {}

// === impl Trigger ===

impl Trigger {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: UnsafeCell::new(List::new()),
            _pin: PhantomPinned,
        }
    }
}

impl Default for Trigger {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        let _ = with_hub(|_, _| {
            // Safety: under the lock; disconnecting only touches our own
            // list and the slots linked on it.
            let slots = unsafe { &mut *self.slots.get() };
            while let Some(slot) = slots.pop_front() {
                // Safety: linked slots are alive per the connect contract.
                unsafe { slot.as_ref() }.owner.set(None);
            }
        });
    }
}

// === impl CbSlot ===

impl CbSlot {
    #[must_use]
    pub const fn new(func: CbFn, param: usize) -> Self {
        Self {
            links: list::Links::new(),
            func,
            param,
            owner: Cell::new(None),
            _pin: PhantomPinned,
        }
    }
}

impl Drop for CbSlot {
    fn drop(&mut self) {
        if self.owner.get().is_some() {
            // Safety: `self` is pinned until drop, so the pin obligation of
            // `disconnect` is met by construction.
            disconnect(unsafe { Pin::new_unchecked(&*self) });
        }
    }
}

// Safety: slots are pinned while linked (`connect` requires it) and unlink
// themselves on drop.
unsafe impl Linked<list::Links<CbSlot>> for CbSlot {
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

/// Registers `trigger` to run its slots whenever `event` is notified.
///
/// # Errors
///
/// [`Error::Exists`] if the event is already registered,
/// [`Error::InvalidState`] before `global_init`.
///
/// # Safety
///
/// Both `event` and `trigger` must stay pinned and alive until
/// [`unregister`] (or, for the event, until its destruction is reported and
/// dropped by the dispatcher).
pub unsafe fn register(event: &Event, trigger: &Trigger) -> Result<()> {
    dispatcher_epoll()?.add(event, core::ptr::from_ref(trigger) as usize)
}

/// Removes the registration of `event`.
///
/// # Errors
///
/// [`Error::NotExists`] if the event is not registered,
/// [`Error::InvalidState`] before `global_init`.
pub fn unregister(event: &Event) -> Result<()> {
    dispatcher_epoll()?.del(event)
}

/// Connects `slot` to `trigger`.
///
/// # Errors
///
/// [`Error::Busy`] if the slot is already connected somewhere.
///
/// # Safety
///
/// `trigger` must stay pinned and alive while any slot is connected to it;
/// `slot` unlinks itself on drop.
pub unsafe fn connect(trigger: &Trigger, slot: Pin<&CbSlot>) -> Result<()> {
    with_hub(|_, _| {
        let slot = slot.get_ref();
        if slot.owner.get().is_some() {
            return Err(Error::Busy);
        }
        slot.owner.set(Some(NonNull::from(trigger)));
        // Safety: under the lock; the caller vouches for both lifetimes.
        unsafe { (*trigger.slots.get()).push_back(NonNull::from(slot)) };
        Ok(())
    })?
}

/// Disconnects `slot` from its trigger, if connected.
pub fn disconnect(slot: Pin<&CbSlot>) {
    let _ = with_hub(|_, _| {
        let slot = slot.get_ref();
        if let Some(trigger) = slot.owner.take() {
            // Safety: `owner` is only set while linked on exactly this
            // trigger's list; we hold the lock.
            unsafe { (*trigger.as_ref().slots.get()).remove(NonNull::from(slot)) };
        }
    });
}

// === the dispatcher ===

/// Handle on the interior dispatcher, owned by the scheduler state.
pub(crate) struct CallbackCtl {
    epoll: NonNull<Epoll>,
    task: TaskRef,
}

// Safety: only created and torn down on the runtime thread; the pointer is
// a leaked box.
unsafe impl Send for CallbackCtl {}

impl CallbackCtl {
    pub(crate) fn teardown(self) {
        let _ = self.task.destroy();
        // Safety: the epoll box was leaked by `interior_init` and the
        // dispatcher task that borrowed it is gone.
        drop(unsafe { Box::from_raw(self.epoll.as_ptr()) });
    }
}

fn dispatcher_epoll() -> Result<&'static Epoll> {
    let ptr = with_hub(|hub, _| hub.callback.as_ref().map(|ctl| ctl.epoll))?
        .ok_or(Error::InvalidState)?;
    // Safety: the box lives until teardown, which also stops all users.
    Ok(unsafe { &*ptr.as_ptr() })
}

/// Creates the dispatcher epoll and the system task draining it.
pub(crate) fn interior_init() -> Result<CallbackCtl> {
    let epoll = NonNull::from(Box::leak(Box::new(Epoll::new())));
    let task = spawn(
        "event-cb",
        TaskFlags::SYSTEM | TaskFlags::DETACHED,
        CALLBACK_DISPATCH_STACK_SIZE,
        move || dispatch_loop(epoll),
    );
    match task {
        Ok(task) => Ok(CallbackCtl { epoll, task }),
        Err(err) => {
            // Safety: the task never existed, the box is still ours.
            drop(unsafe { Box::from_raw(epoll.as_ptr()) });
            Err(err)
        }
    }
}

fn dispatch_loop(epoll: NonNull<Epoll>) -> i32 {
    // Safety: the box outlives this task (teardown destroys us first).
    let epoll = unsafe { epoll.as_ref() };
    let mut slots = [Slot::default(); CALLBACK_DISPATCH_SLOTS];
    loop {
        let n = match epoll.wait(&mut slots, Timeout::Forever) {
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(?err, "callback dispatcher stopping");
                return 0;
            }
        };
        for slot in &slots[..n] {
            if slot.affair == Affair::Error || slot.userdata == 0 {
                let _ = epoll.del_ptr(slot.event);
                continue;
            }
            run_trigger(slot);
        }
    }
}

fn run_trigger(slot: &Slot) {
    let trigger = slot.userdata as *const Trigger;
    // Snapshot the connected callbacks under the lock, then run them outside
    // it so they may freely connect, disconnect and notify.
    let callbacks: Vec<(CbFn, usize)> = with_hub(|_, _| {
        // Safety: registration promised the trigger outlives it; the slot
        // list is only touched under the lock.
        unsafe { (*trigger).slots.get().as_ref() }
            .map(|slots| slots.iter().map(|s| (s.func, s.param)).collect())
            .unwrap_or_default()
    })
    .unwrap_or_default();

    for (func, param) in callbacks {
        func(slot.event, param);
    }
}
