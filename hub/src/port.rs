//! The platform port surface.
//!
//! Everything the runtime needs from the outside world is one [`Platform`]
//! record: the monotonic clock, the critical section, the idle hook and the
//! deadline-change hint. There is exactly one implementation per build, so
//! the record is a `data` pointer plus a vtable rather than a trait object;
//! the port installs it once at [`global_init`](crate::global_init).
//!
//! # Thread safety
//!
//! All vtable functions must be callable from any thread (or ISR) the port
//! admits as an event producer: `Platform` is handed across the runtime and
//! invoked by `&` reference. If `clone` and `drop` manage a reference count,
//! they must do so atomically.

use core::fmt;

use crate::time::Ticks;

/// The installed port: tick rate plus the raw hook record.
pub struct Platform {
    clocks_per_sec: u64,
    raw: RawPlatform,
}

/// A type-erased port implementation: arbitrary `data` plus the functions
/// that operate on it.
#[derive(Debug)]
pub struct RawPlatform {
    data: *const (),
    vtable: &'static RawPlatformVTable,
}

/// The function table of a [`RawPlatform`].
///
/// The `*const ()` passed to every function is the `data` pointer of the
/// enclosing [`RawPlatform`]; calling them with any other pointer is
/// undefined behavior.
#[derive(Copy, Clone, Debug)]
pub struct RawPlatformVTable {
    clone: unsafe fn(*const ()) -> RawPlatform,
    now: unsafe fn(*const ()) -> Ticks,
    enter_critical: unsafe fn(*const ()) -> usize,
    exit_critical: unsafe fn(*const (), usize),
    idle: unsafe fn(*const (), bool),
    idle_break: unsafe fn(*const ()),
    expire_change: unsafe fn(*const (), Option<Ticks>),
    drop: unsafe fn(*const ()),
}

// === impl Platform ===

// Safety: part of the `RawPlatformVTable` contract is that every function is
// callable from any producer context, so the record may be shared freely.
unsafe impl Send for Platform {}
// Safety: as above.
unsafe impl Sync for Platform {}

impl Platform {
    /// Creates a `Platform` from its tick rate, `data` pointer and vtable.
    ///
    /// # Safety
    ///
    /// The behavior of the runtime is undefined if the contract described in
    /// [`RawPlatformVTable`]'s documentation is not upheld.
    #[inline]
    #[must_use]
    pub const unsafe fn new(
        clocks_per_sec: u64,
        data: *const (),
        vtable: &'static RawPlatformVTable,
    ) -> Self {
        Self {
            clocks_per_sec,
            raw: RawPlatform { data, vtable },
        }
    }

    /// Ticks per second of the port's monotonic clock.
    #[inline]
    #[must_use]
    pub fn clocks_per_sec(&self) -> u64 {
        self.clocks_per_sec
    }

    /// Reads the monotonic clock.
    #[inline]
    pub fn now(&self) -> Ticks {
        // Safety: `Platform::new` is the only constructor and makes the
        // caller vouch for the vtable contract; same for the calls below.
        unsafe { (self.raw.vtable.now)(self.raw.data) }
    }

    /// Enters the scheduler critical section, returning the state token to
    /// pass to [`exit_critical`](Self::exit_critical). Recursive.
    #[inline]
    pub(crate) fn enter_critical(&self) -> usize {
        // Safety: see `Platform::now`.
        unsafe { (self.raw.vtable.enter_critical)(self.raw.data) }
    }

    /// Leaves the scheduler critical section.
    #[inline]
    pub(crate) fn exit_critical(&self, state: usize) {
        // Safety: see `Platform::now`.
        unsafe { (self.raw.vtable.exit_critical)(self.raw.data, state) }
    }

    /// Runs the idle / external-event hook. `blocked` is true when the
    /// scheduler has nothing runnable: the hook should then sleep until
    /// [`loop_idle_time`](crate::loop_idle_time) elapses or an external wake
    /// arrives.
    #[inline]
    pub(crate) fn idle(&self, blocked: bool) {
        // Safety: see `Platform::now`.
        unsafe { (self.raw.vtable.idle)(self.raw.data, blocked) };
    }

    /// Interrupts an idle hook that may currently be sleeping.
    #[inline]
    pub(crate) fn idle_break(&self) {
        // Safety: see `Platform::now`.
        unsafe { (self.raw.vtable.idle_break)(self.raw.data) };
    }

    /// Hints that the soonest timer deadline changed; `None` means no timer
    /// is armed at all.
    #[inline]
    pub(crate) fn expire_change(&self, deadline: Option<Ticks>) {
        // Safety: see `Platform::now`.
        unsafe { (self.raw.vtable.expire_change)(self.raw.data, deadline) };
    }
}

impl Clone for Platform {
    fn clone(&self) -> Self {
        Self {
            clocks_per_sec: self.clocks_per_sec,
            // Safety: see `Platform::now`.
            raw: unsafe { (self.raw.vtable.clone)(self.raw.data) },
        }
    }
}

impl Drop for Platform {
    fn drop(&mut self) {
        // Safety: see `Platform::now`.
        unsafe { (self.raw.vtable.drop)(self.raw.data) }
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("clocks_per_sec", &self.clocks_per_sec)
            .field("data", &self.raw.data)
            .field("vtable", &(self.raw.vtable as *const RawPlatformVTable))
            .finish()
    }
}

// === impl RawPlatform / RawPlatformVTable ===

impl RawPlatform {
    /// Creates a raw port record; see [`RawPlatformVTable`] for the contract.
    #[inline]
    #[must_use]
    pub const fn new(data: *const (), vtable: &'static RawPlatformVTable) -> Self {
        Self { data, vtable }
    }
}

impl RawPlatformVTable {
    /// Builds a vtable from the individual hooks.
    #[must_use]
    pub const fn new(
        clone: unsafe fn(*const ()) -> RawPlatform,
        now: unsafe fn(*const ()) -> Ticks,
        enter_critical: unsafe fn(*const ()) -> usize,
        exit_critical: unsafe fn(*const (), usize),
        idle: unsafe fn(*const (), bool),
        idle_break: unsafe fn(*const ()),
        expire_change: unsafe fn(*const (), Option<Ticks>),
        drop: unsafe fn(*const ()),
    ) -> Self {
        Self {
            clone,
            now,
            enter_critical,
            exit_critical,
            idle,
            idle_break,
            expire_change,
            drop,
        }
    }
}
