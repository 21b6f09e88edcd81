//! The scheduler core.
//!
//! One process-wide [`Hub`] owns the ready/waiting/finished task lists, the
//! timer queue and the current-task pointer. Every touch of that state
//! happens inside the port's critical section, entered through [`with_hub`];
//! the actual context switch happens *outside* the lock, after the lists
//! have been updated.
//!
//! Scheduling is round-robin: [`schedule`] pops the ready-list head, files
//! the outgoing task according to its pending state, and swaps stacks. When
//! nothing is runnable and the caller cannot continue (it is waiting or
//! finished), [`schedule`] drives the timer check and the port idle hook
//! inline, so a blocked task keeps the world turning even when the boot
//! task itself is parked in a `join`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use cordyceps::List;
use costack::Context;

use crate::error::{Error, Result};
use crate::module::Module;
use crate::port::Platform;
use crate::task::{Task, TaskFlags, TaskState, free_task};
use crate::time::Ticks;
use crate::timer::TimerQueue;

/// The process-wide scheduler state.
pub(crate) struct Hub {
    pub(crate) ready: List<Task>,
    pub(crate) waiting: List<Task>,
    pub(crate) finished: List<Task>,
    pub(crate) timers: TimerQueue,
    pub(crate) current: NonNull<Task>,
    pub(crate) main: NonNull<Task>,
    pub(crate) exit_code: Option<i32>,
    pub(crate) callback: Option<crate::callback::CallbackCtl>,
    pub(crate) modules: Vec<&'static Module>,
}

struct Global {
    platform: UnsafeCell<Option<Platform>>,
    hub: UnsafeCell<Option<Hub>>,
}

// Safety: `platform` is written only by `global_init`/`global_exit` (guarded
// by INIT_LOCK, with no concurrent runtime users by contract); `hub` is only
// touched inside the port critical section.
unsafe impl Sync for Global {}

static GLOBAL: Global = Global {
    platform: UnsafeCell::new(None),
    hub: UnsafeCell::new(None),
};

static INIT_LOCK: spin::Mutex<()> = spin::Mutex::new(());

/// The installed port, if any.
pub(crate) fn platform_ref() -> Option<&'static Platform> {
    // Safety: see `Global`'s Sync justification; the reference stays valid
    // until `global_exit`, which the caller must not race with.
    unsafe { (*GLOBAL.platform.get()).as_ref() }
}

/// Runs `f` on the scheduler state inside the port critical section.
///
/// Internal code never calls this re-entrantly: everything that already
/// holds the `&mut Hub` threads it through instead, so exactly one exclusive
/// borrow exists at a time even though the lock itself is recursive.
pub(crate) fn with_hub<R>(f: impl FnOnce(&mut Hub, &Platform) -> R) -> Result<R> {
    let p = platform_ref().ok_or(Error::InvalidState)?;
    let state = p.enter_critical();
    // Safety: the critical section serializes all access; `hub` is Some
    // whenever a platform is installed.
    let hub = unsafe { (*GLOBAL.hub.get()).as_mut() };
    let result = match hub {
        Some(hub) => Ok(f(hub, p)),
        None => Err(Error::InvalidState),
    };
    p.exit_critical(state);
    result
}

/// Pointer to the current task's TCB.
pub(crate) fn current_ptr() -> Result<NonNull<Task>> {
    with_hub(|hub, _| hub.current)
}

enum Act {
    Switch {
        from: *mut Context,
        to: *const Context,
    },
    Stay,
    Service,
}

impl Hub {
    /// Moves a waiting task back to ready. Receptor notify paths land here.
    pub(crate) fn wake_task(&mut self, t: NonNull<Task>, p: &Platform) {
        // Safety: tasks reachable from receptors/lists are live TCBs; we are
        // inside the critical section.
        unsafe {
            if (*t.as_ptr()).state != TaskState::Waiting {
                return;
            }
            (*t.as_ptr()).state = TaskState::Ready;
            tracing::trace!(task = &*(*t.as_ptr()).name, "wake");
            if t != self.current {
                self.waiting.remove(t);
                if (*t.as_ptr()).flags.contains(TaskFlags::SYSTEM) {
                    self.ready.push_front(t);
                } else {
                    self.ready.push_back(t);
                }
            }
            // else: it parked but has not switched away yet; the state flip
            // alone keeps it running.
        }
        p.idle_break();
    }

    fn pick_next(&mut self) -> Act {
        if let Some(next) = self.ready.pop_front() {
            let cur = self.current;
            // Safety: `cur` and `next` are live TCBs; list surgery happens
            // under the lock, and the contexts stay valid across the switch
            // because TCBs are only freed once unlinked and not current.
            unsafe {
                match (*cur.as_ptr()).state {
                    TaskState::Running | TaskState::Ready => {
                        (*cur.as_ptr()).state = TaskState::Ready;
                        self.ready.push_back(cur);
                    }
                    TaskState::Waiting => self.waiting.push_back(cur),
                    TaskState::Finished => self.finished.push_back(cur),
                }
                (*next.as_ptr()).state = TaskState::Running;
                tracing::trace!(
                    from = &*(*cur.as_ptr()).name,
                    to = &*(*next.as_ptr()).name,
                    "switch"
                );
                self.current = next;
                Act::Switch {
                    from: &raw mut (*cur.as_ptr()).context,
                    to: &raw const (*next.as_ptr()).context,
                }
            }
        } else {
            // Safety: `current` is a live TCB.
            unsafe {
                match (*self.current.as_ptr()).state {
                    TaskState::Running => Act::Stay,
                    TaskState::Ready => {
                        (*self.current.as_ptr()).state = TaskState::Running;
                        Act::Stay
                    }
                    TaskState::Waiting | TaskState::Finished => Act::Service,
                }
            }
        }
    }
}

/// One round-robin scheduling step. Returns `true` when a context switch to
/// another task happened (and has since returned).
///
/// When the caller cannot continue and nothing is ready, this services the
/// timers and the idle hook in place until something becomes runnable.
pub(crate) fn schedule() -> bool {
    loop {
        let Ok(act) = with_hub(|hub, _| hub.pick_next()) else {
            return false;
        };
        match act {
            Act::Switch { from, to } => {
                // Safety: both contexts belong to live TCBs (see pick_next);
                // the swap runs outside the critical section, mirroring the
                // unlock-then-switch order of the whole runtime.
                unsafe { costack::swap(0, &mut *from, &*to) };
                return true;
            }
            Act::Stay => return false,
            Act::Service => service_blocked(),
        }
    }
}

/// Timer check + idle, used when the caller is parked with an empty ready
/// list. Returns once something might be runnable again.
fn service_blocked() {
    let runnable = with_hub(|hub, p| {
        crate::timer::check_locked(hub, p);
        // Safety: `current` is a live TCB.
        !hub.ready.is_empty() || unsafe { (*hub.current.as_ptr()).state } == TaskState::Ready
    })
    .unwrap_or(false);
    if runnable {
        return;
    }
    if let Some(p) = platform_ref() {
        p.idle(true);
    }
}

/// Ticks until the scheduler next needs the processor: zero when work is
/// ready, otherwise the (clamped) remaining time of the soonest timer. Idle
/// hooks call this to size their sleep.
#[must_use]
pub fn loop_idle_time() -> Ticks {
    with_hub(|hub, p| {
        if !hub.ready.is_empty() || hub.exit_code.is_some() {
            Ticks(0)
        } else {
            hub.timers.first_remaining(p.now())
        }
    })
    .unwrap_or(Ticks(0))
}

/// Marks the current task finished and leaves it to the scheduler. Never
/// returns; the TCB is freed by the joiner or the reaper.
pub(crate) fn finish_current(ret: i32) -> ! {
    let _ = with_hub(|hub, p| {
        let cur = hub.current;
        // Safety: the current TCB is live; the join event is notified under
        // the same lock that publishes the state change. Every wait has
        // returned by now (an unwinding one detached through drop glue), so
        // the park frame holds at most stale pointers and is only forgotten.
        unsafe {
            tracing::trace!(task = &*(*cur.as_ptr()).name, ret, "finish");
            (*cur.as_ptr()).ret = ret;
            (*cur.as_ptr()).state = TaskState::Finished;
            (*cur.as_ptr()).park.clear();
            let join_event = &raw const (*cur.as_ptr()).join_event;
            (*join_event).notify_locked(hub, p);
        }
    });
    loop {
        schedule();
    }
}

/// Frees finished tasks that nobody will join.
fn reap_finished() {
    loop {
        let victim = with_hub(|hub, p| {
            let found = hub
                .finished
                .iter()
                .find(|t| t.flags.contains(TaskFlags::DETACHED))
                .map(NonNull::from)?;
            // Safety: just observed on the finish list; under the lock.
            unsafe {
                hub.finished.remove(found);
                (*found.as_ptr()).join_event.clean_locked(hub, p);
            }
            Some(found)
        });
        match victim {
            Ok(Some(t)) => {
                // Safety: unlinked and cleaned above.
                unsafe { free_task(t) };
            }
            _ => return,
        }
    }
}

/// Runs the scheduler loop on the boot task until [`loop_exit`] is called.
/// Returns the exit code.
///
/// # Errors
///
/// [`Error::InvalidState`] before `global_init` or from a non-boot task.
pub fn loop_run() -> Result<i32> {
    if !with_hub(|hub, _| hub.current == hub.main)? {
        return Err(Error::InvalidState);
    }
    loop {
        with_hub(|hub, p| crate::timer::check_locked(hub, p))?;
        reap_finished();
        if let Some(code) = with_hub(|hub, _| hub.exit_code.take())? {
            return Ok(code);
        }
        let switched = schedule();
        if let Some(code) = with_hub(|hub, _| hub.exit_code.take())? {
            return Ok(code);
        }
        if let Some(p) = platform_ref() {
            p.idle(!switched);
        }
    }
}

/// Requests that [`loop_run`] return `code` at the next safe point.
/// Callable from any task (and, on hosted builds, any producer thread).
pub fn loop_exit(code: i32) {
    let _ = with_hub(|hub, p| {
        hub.exit_code = Some(code);
        p.idle_break();
    });
}

/// Installs the platform port, boots the scheduler state, and runs the
/// module registry (interior phase first, then `modules` in phase order).
///
/// # Errors
///
/// [`Error::InvalidState`] when already initialized; any error of a failed
/// module init, after tearing the already-initialized suffix back down.
pub fn global_init(platform: Platform, modules: &[&'static Module]) -> Result<()> {
    let _guard = INIT_LOCK.lock();
    // Safety: guarded by INIT_LOCK and by the no-running-runtime contract.
    unsafe {
        if (*GLOBAL.platform.get()).is_some() {
            return Err(Error::InvalidState);
        }
        *GLOBAL.platform.get() = Some(platform);
    }

    let main = NonNull::from(Box::leak(Box::new(Task::boot())));
    let hub = Hub {
        ready: List::new(),
        waiting: List::new(),
        finished: List::new(),
        timers: TimerQueue::new(),
        current: main,
        main,
        exit_code: None,
        callback: None,
        modules: Vec::new(),
    };
    // Safety: as above.
    unsafe { *GLOBAL.hub.get() = Some(hub) };

    match crate::callback::interior_init() {
        Ok(ctl) => {
            let _ = with_hub(|hub, _| hub.callback = Some(ctl));
        }
        Err(err) => {
            teardown();
            return Err(err);
        }
    }

    match crate::module::apply(modules) {
        Ok(applied) => {
            let _ = with_hub(|hub, _| hub.modules = applied);
            Ok(())
        }
        Err(err) => {
            if let Ok(Some(ctl)) = with_hub(|hub, _| hub.callback.take()) {
                ctl.teardown();
            }
            teardown();
            Err(err)
        }
    }
}

/// Tears the runtime back down: module exits in reverse order, the callback
/// dispatcher, every remaining task, then the port itself.
///
/// Must be called from the thread that ran `global_init`, with all producer
/// threads quiesced.
pub fn global_exit() {
    let _guard = INIT_LOCK.lock();
    if platform_ref().is_none() {
        return;
    }

    let modules = with_hub(|hub, _| core::mem::take(&mut hub.modules)).unwrap_or_default();
    for m in modules.iter().rev() {
        (m.exit)();
    }

    if let Ok(Some(ctl)) = with_hub(|hub, _| hub.callback.take()) {
        ctl.teardown();
    }

    teardown();
}

fn teardown() {
    // Destroy every remaining task. Parked tasks never ran to completion:
    // their wait-machinery receptors and timers are unhooked through the
    // park frame before the stack goes away; whatever else their stacks
    // owned is lost, as with any last-resort reaper.
    loop {
        let t = with_hub(|hub, _| {
            hub.ready
                .pop_front()
                .or_else(|| hub.waiting.pop_front())
                .or_else(|| hub.finished.pop_front())
        });
        match t {
            Ok(Some(t)) => {
                let _ = with_hub(|hub, p| {
                    // Safety: just unlinked; under the lock, and the stack
                    // (with everything the park frame points at) is still
                    // allocated until `free_task` below.
                    unsafe {
                        (*t.as_ptr()).park.release_locked(hub, t);
                        (*t.as_ptr()).join_event.clean_locked(hub, p);
                    }
                });
                // Safety: unlinked, unhooked and cleaned.
                unsafe { free_task(t) };
            }
            _ => break,
        }
    }

    // Safety: guarded by INIT_LOCK; no tasks or producers remain.
    unsafe {
        if let Some(hub) = (*GLOBAL.hub.get()).take() {
            free_task(hub.main);
            drop(hub);
        }
        *GLOBAL.platform.get() = None;
    }
}
