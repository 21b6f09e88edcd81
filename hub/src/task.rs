//! Tasks: units of cooperative execution.
//!
//! A task owns a stack (heap-allocated or caller-supplied), a saved
//! [`Context`] and an entry closure. Lifecycle runs
//! `Ready → Running → {Ready, Waiting, Finished}` under the scheduler; a
//! finished task notifies its embedded join event and lingers on the finish
//! list until it is joined, destroyed, or (when detached) reaped by the
//! scheduler loop.

use alloc::boxed::Box;
use alloc::string::String;
use core::cell::Cell;
use core::marker::PhantomPinned;
use core::mem::offset_of;
use core::ptr::NonNull;

use cordyceps::{Linked, list};
use costack::stack::{OwnedStack, RawStack, Stack};
use costack::Context;

use crate::config::STACK_FILL_PATTERN;
use crate::epoll::EpollInner;
use crate::error::{Error, Result};
use crate::event::{Event, Receptor, detach_locked};
use crate::scheduler::{self, Hub, with_hub};
use crate::time::Timeout;
use crate::timer::Timer;

bitflags::bitflags! {
    /// Task creation flags.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct TaskFlags: u32 {
        /// The single privileged task: its wake-ups go to the *head* of the
        /// ready list, so it runs before application tasks. Used by the
        /// event-callback dispatcher.
        const SYSTEM = 1 << 1;
        /// Never joined; the scheduler loop reaps it once finished.
        const DETACHED = 1 << 2;
    }
}

/// Lifecycle state of a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskState {
    /// On the ready list, runnable.
    Ready,
    /// The one task currently executing.
    Running,
    /// Parked on an event (or about to be).
    Waiting,
    /// Done; waiting to be joined or reaped.
    Finished,
}

pub(crate) enum StackKind {
    Owned(OwnedStack),
    Raw(RawStack),
    /// The boot task runs on the thread's own stack.
    Boot,
}

impl StackKind {
    fn region(&self) -> Option<(NonNull<u8>, usize)> {
        match self {
            StackKind::Owned(s) => Some((s.limit(), s.size())),
            StackKind::Raw(s) => Some((s.limit(), s.size())),
            StackKind::Boot => None,
        }
    }
}

/// The task control block.
pub(crate) struct Task {
    pub(crate) name: Box<str>,
    links: list::Links<Task>,
    pub(crate) context: Context,
    pub(crate) stack: StackKind,
    entry: Option<Box<dyn FnOnce() -> i32>>,
    pub(crate) ret: i32,
    pub(crate) state: TaskState,
    pub(crate) flags: TaskFlags,
    pub(crate) join_event: Event,
    pub(crate) park: ParkFrame,
    _pin: PhantomPinned,
}

impl Task {
    /// TCB of the boot task: no owned stack, context filled in by the first
    /// switch away from it.
    pub(crate) fn boot() -> Self {
        Self {
            name: "main".into(),
            links: list::Links::new(),
            context: Context::IDLE,
            stack: StackKind::Boot,
            entry: None,
            ret: 0,
            state: TaskState::Running,
            flags: TaskFlags::empty(),
            join_event: Event::named("task-join"),
            park: ParkFrame::new(),
            _pin: PhantomPinned,
        }
    }
}

/// What the runtime's wait machinery currently has pinned on this task's
/// stack: receptors linked into event lists, timeout/sleep timers in the
/// timer tree, and the epoll set whose waiter field names this task.
///
/// The wait paths register here (under the lock) when they attach and
/// unregister on their normal cleanup, so a reaper that frees the stack of a
/// task that never resumes can detach everything first; a receptor or tree
/// node must never outlive the frame it lives on. The slot counts cover the
/// deepest wait shape (event receptor + timeout receptor + timeout timer, or
/// a sleep timer under a forever-wait); waits do not nest beyond that.
pub(crate) struct ParkFrame {
    receptors: [Cell<Option<NonNull<Receptor>>>; 2],
    timers: [Cell<Option<NonNull<Timer>>>; 2],
    epoll: Cell<Option<NonNull<EpollInner>>>,
}

impl ParkFrame {
    pub(crate) const fn new() -> Self {
        Self {
            receptors: [Cell::new(None), Cell::new(None)],
            timers: [Cell::new(None), Cell::new(None)],
            epoll: Cell::new(None),
        }
    }

    pub(crate) fn add_receptor(&self, r: NonNull<Receptor>) {
        for slot in &self.receptors {
            if slot.get().is_none() {
                slot.set(Some(r));
                return;
            }
        }
        debug_assert!(false, "park frame receptor slots exhausted");
    }

    pub(crate) fn remove_receptor(&self, r: NonNull<Receptor>) {
        for slot in &self.receptors {
            if slot.get() == Some(r) {
                slot.set(None);
            }
        }
    }

    pub(crate) fn add_timer(&self, t: NonNull<Timer>) {
        for slot in &self.timers {
            if slot.get().is_none() {
                slot.set(Some(t));
                return;
            }
        }
        debug_assert!(false, "park frame timer slots exhausted");
    }

    pub(crate) fn remove_timer(&self, t: NonNull<Timer>) {
        for slot in &self.timers {
            if slot.get() == Some(t) {
                slot.set(None);
            }
        }
    }

    pub(crate) fn set_epoll(&self, inner: NonNull<EpollInner>) {
        self.epoll.set(Some(inner));
    }

    pub(crate) fn clear_epoll(&self) {
        self.epoll.set(None);
    }

    /// Forgets every entry without touching what it points at. Called when a
    /// task finishes: anything still recorded was already detached/stopped by
    /// drop glue on the way out, so only the (possibly stale) pointers remain.
    pub(crate) fn clear(&self) {
        for slot in &self.receptors {
            slot.set(None);
        }
        for slot in &self.timers {
            slot.set(None);
        }
        self.epoll.set(None);
    }

    /// Detaches every recorded receptor, stops every recorded timer and
    /// clears the epoll waiter registration, then forgets the entries.
    /// Reapers call this before freeing the stack the entries point into.
    ///
    /// # Safety
    ///
    /// Must run inside the critical section, while `owner`'s stack (and the
    /// events/timers the entries reference) is still allocated.
    pub(crate) unsafe fn release_locked(&self, hub: &mut Hub, owner: NonNull<Task>) {
        for slot in &self.receptors {
            if let Some(rp) = slot.take() {
                // Safety: per this function's contract the receptor and the
                // event it is linked on are still alive.
                unsafe { detach_locked(rp) };
            }
        }
        for slot in &self.timers {
            if let Some(tp) = slot.take() {
                hub.timers.stop(tp);
            }
        }
        if let Some(inner) = self.epoll.take() {
            // Safety: epoll control blocks are heap-owned by their set and
            // outlive any waiter registration.
            unsafe { inner.as_ref() }.clear_waiter(owner);
        }
    }
}

// Safety: TCBs are heap allocations that stay put until freed, and all list
// manipulation happens under the critical section.
unsafe impl Linked<list::Links<Task>> for Task {
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

/// A handle to a task.
///
/// Plain and copyable, like a task id: it does not keep the task alive.
/// Using a handle after the task was joined or destroyed is a contract
/// violation of the caller (exactly one owner may consume a task).
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct TaskRef(pub(crate) NonNull<Task>);

impl core::fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0).finish()
    }
}

/// A snapshot of task bookkeeping, as reported by [`TaskRef::stat`].
#[derive(Debug)]
pub struct TaskStat {
    pub name: String,
    pub state: TaskState,
    /// Lowest address of the stack; null for the boot task.
    pub stack_base: *const u8,
    pub stack_size: usize,
    /// Minimum-ever free stack, measured as the untouched fill-pattern
    /// prefix above the stack base.
    pub stack_free_min: usize,
}

/// Spawns a task with a heap-allocated stack of `stack_size` bytes.
///
/// The closure's return value becomes the task's exit code, observable
/// through [`TaskRef::join`].
///
/// # Errors
///
/// [`Error::Alloc`] when the stack cannot be allocated,
/// [`Error::InvalidState`] before `global_init`.
pub fn spawn<F>(name: &str, flags: TaskFlags, stack_size: usize, f: F) -> Result<TaskRef>
where
    F: FnOnce() -> i32 + 'static,
{
    let stack = OwnedStack::new(stack_size).ok_or(Error::Alloc)?;
    spawn_inner(name, flags, StackKind::Owned(stack), Box::new(f))
}

/// Spawns a task on a caller-managed stack region.
///
/// The region must stay valid and untouched for the task's whole lifetime
/// (see [`RawStack::new`]); the runtime fills it with the watermark pattern.
///
/// # Errors
///
/// As [`spawn`], minus the stack allocation.
pub fn spawn_static<F>(name: &str, flags: TaskFlags, stack: RawStack, f: F) -> Result<TaskRef>
where
    F: FnOnce() -> i32 + 'static,
{
    spawn_inner(name, flags, StackKind::Raw(stack), Box::new(f))
}

fn spawn_inner(
    name: &str,
    flags: TaskFlags,
    stack: StackKind,
    entry: Box<dyn FnOnce() -> i32>,
) -> Result<TaskRef> {
    if let Some((base, size)) = stack.region() {
        // Safety: the stack region is valid per StackKind construction; the
        // fill happens before any context lives on it.
        unsafe { core::ptr::write_bytes(base.as_ptr(), STACK_FILL_PATTERN, size) };
    }

    let task = Box::new(Task {
        name: name.into(),
        links: list::Links::new(),
        context: Context::IDLE,
        stack,
        entry: Some(entry),
        ret: 0,
        state: TaskState::Ready,
        flags,
        join_event: Event::named("task-join"),
        park: ParkFrame::new(),
        _pin: PhantomPinned,
    });
    let ptr = NonNull::from(Box::leak(task));

    // Safety: the TCB is live and leaked; the stack outlives the context by
    // ownership. The entry argument is the TCB pointer itself.
    unsafe {
        let ctx = match &(*ptr.as_ptr()).stack {
            StackKind::Owned(s) => costack::prepare(s, task_main, ptr.as_ptr() as usize),
            StackKind::Raw(s) => costack::prepare(s, task_main, ptr.as_ptr() as usize),
            StackKind::Boot => unreachable!("spawned task without a stack"),
        };
        (*ptr.as_ptr()).context = ctx;
    }

    let queued = with_hub(|hub, _| {
        tracing::trace!(task = name, "spawn");
        hub.ready.push_back(ptr);
    });
    if let Err(err) = queued {
        // Safety: never linked anywhere; reclaim the TCB.
        drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        return Err(err);
    }
    Ok(TaskRef(ptr))
}

/// Entry of every spawned task: runs the closure, records the exit code,
/// notifies joiners and hands control back to the scheduler.
unsafe extern "C" fn task_main(arg: usize) -> ! {
    let task = arg as *mut Task;
    // Safety: `arg` is the leaked TCB pointer seeded by `spawn_inner`.
    let body = unsafe { (*task).entry.take() };
    let ret = match body {
        Some(f) => run_body(f),
        None => {
            tracing::error!("task started without an entry closure");
            -1
        }
    };
    scheduler::finish_current(ret)
}

#[cfg(not(target_os = "none"))]
fn run_body(f: Box<dyn FnOnce() -> i32>) -> i32 {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(ret) => ret,
        Err(_) => {
            tracing::error!("task body panicked");
            i32::MIN
        }
    }
}

#[cfg(target_os = "none")]
fn run_body(f: Box<dyn FnOnce() -> i32>) -> i32 {
    f()
}

/// Handle of the calling task.
///
/// # Errors
///
/// [`Error::InvalidState`] before `global_init`.
pub fn current() -> Result<TaskRef> {
    Ok(TaskRef(scheduler::current_ptr()?))
}

/// Gives up the processor; the caller goes to the ready-list tail and runs
/// again once its turn comes back around.
pub fn yield_now() {
    scheduler::schedule();
}

/// Terminates the calling task with `code`.
///
/// Returns only when called from the boot task (which cannot exit) or
/// before `global_init`.
pub fn exit(code: i32) {
    let is_main = with_hub(|hub, _| hub.current == hub.main).unwrap_or(true);
    if is_main {
        tracing::warn!("exit() from the boot task is a no-op");
        return;
    }
    scheduler::finish_current(code);
}

impl TaskRef {
    /// Waits for the task to finish and consumes it, returning its exit
    /// code. The task is destroyed on success; on timeout it keeps running
    /// and the handle stays valid.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`] when the bound expires first,
    /// [`Error::EventClosed`] when the task is destroyed under the joiner,
    /// [`Error::InvalidParam`] for a self-join or zero timeout.
    pub fn join(self, timeout: Timeout) -> Result<i32> {
        let t = self.0;
        if scheduler::current_ptr()? == t {
            return Err(Error::InvalidParam);
        }
        // Safety: the handle contract keeps the TCB alive until the (single)
        // joiner consumes it; state reads happen under the lock inside the
        // wait protocol.
        let join_event = unsafe { &(*t.as_ptr()).join_event };
        join_event.wait_condition_timeout(
            // Safety: as above.
            || unsafe { (*t.as_ptr()).state } == TaskState::Finished,
            timeout,
        )?;

        let ret = with_hub(|hub, p| {
            // Safety: the task is finished, so it sits on the finish list.
            unsafe {
                hub.finished.remove(t);
                (*t.as_ptr()).join_event.clean_locked(hub, p);
                (*t.as_ptr()).ret
            }
        })?;
        // Safety: unlinked and cleaned above; the TCB is ours to free.
        unsafe { free_task(t) };
        Ok(ret)
    }

    /// Unconditionally reaps the task: removes it from the scheduler,
    /// detaches the receptors and stops the timers its pending wait left
    /// behind, wakes its joiners with an error, and frees its resources.
    /// The victim must not be running.
    ///
    /// A victim parked mid-wait never resumes, so its stack-resident
    /// receptors and timeout/sleep timers are unhooked through the task's
    /// [`ParkFrame`] before the stack is freed, so no event list or timer
    /// tree is left pointing into dead memory. Everything else the stack owned
    /// (heap the task allocated, timers it armed itself and never stopped)
    /// is beyond the reaper's knowledge: plain allocations leak, and a task
    /// that armed its own stack timers must stop them before it may be
    /// destroyed.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] when the task is currently running,
    /// [`Error::InvalidParam`] for the boot task.
    pub fn destroy(self) -> Result<()> {
        let t = self.0;
        with_hub(|hub, p| {
            if hub.current == t {
                return Err(Error::InvalidState);
            }
            if hub.main == t {
                return Err(Error::InvalidParam);
            }
            // Safety: a non-running task is linked on exactly the list its
            // state names; its park frame and stack stay alive until
            // `free_task` below.
            unsafe {
                match (*t.as_ptr()).state {
                    TaskState::Ready => hub.ready.remove(t),
                    TaskState::Waiting => hub.waiting.remove(t),
                    TaskState::Finished => hub.finished.remove(t),
                    TaskState::Running => return Err(Error::Fault),
                };
                (*t.as_ptr()).park.release_locked(hub, t);
                (*t.as_ptr()).join_event.clean_locked(hub, p);
            }
            Ok(())
        })??;
        // Safety: unlinked, unhooked and cleaned above.
        unsafe { free_task(t) };
        Ok(())
    }

    /// Reports name, state, stack region and the minimum-ever free stack
    /// (by scanning the untouched fill pattern).
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] before `global_init`.
    pub fn stat(self) -> Result<TaskStat> {
        let t = self.0;
        with_hub(|_, _| {
            // Safety: the handle contract keeps the TCB alive; the scan only
            // reads the stack region below the running watermark.
            unsafe {
                let task = t.as_ref();
                let (base, size) = match task.stack.region() {
                    Some((base, size)) => (base.as_ptr().cast_const(), size),
                    None => (core::ptr::null(), 0),
                };
                let mut free = 0;
                while free < size && *base.add(free) == STACK_FILL_PATTERN {
                    free += 1;
                }
                TaskStat {
                    name: task.name.clone().into(),
                    state: task.state,
                    stack_base: base,
                    stack_size: size,
                    stack_free_min: free,
                }
            }
        })
    }
}

/// Frees a TCB (and its owned stack) that is linked on no list.
///
/// # Safety
///
/// `t` must be unlinked from every scheduler list, its join event cleaned,
/// and no other handle may be used afterwards.
pub(crate) unsafe fn free_task(t: NonNull<Task>) {
    // Safety: per this function's contract the box is exclusively ours.
    let task = unsafe { Box::from_raw(t.as_ptr()) };
    tracing::trace!(task = &*task.name, "free");
    drop(task);
}
