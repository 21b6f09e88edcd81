//! The hosted (POSIX / macOS) platform port.
//!
//! Reference [`Platform`] for builds with `std`:
//!
//! * monotonic clock: [`Instant`] since port creation, scaled to the tick
//!   rate;
//! * critical section: a process-wide *recursive* lock (owner thread +
//!   depth over a mutex/condvar pair), so producer threads and nested
//!   notify paths share one lock with the task world;
//! * idle: blocks on a condvar until the runtime's published deadline
//!   elapses or a wake arrives (`idle_break` from a notify, a timer start,
//!   or `loop_exit`).
//!
//! The vtable plumbing mirrors `RawPlatformVTable`'s contract: `data` is a
//! leaked `Arc<HostState>`, cloned and dropped through the strong count.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::Instant;

use crate::config::DEFAULT_CLOCKS_PER_SEC;
use crate::port::{Platform, RawPlatform, RawPlatformVTable};
use crate::time::{Ticks, ticks_to_duration};

/// Builder for the hosted port.
pub struct HostPlatform;

impl HostPlatform {
    /// A host platform ticking at [`DEFAULT_CLOCKS_PER_SEC`].
    #[must_use]
    pub fn new() -> Platform {
        Self::with_clock_rate(DEFAULT_CLOCKS_PER_SEC)
    }

    /// A host platform with an explicit tick rate.
    ///
    /// # Panics
    ///
    /// Panics on a zero `clocks_per_sec`.
    #[must_use]
    pub fn with_clock_rate(clocks_per_sec: u64) -> Platform {
        assert!(clocks_per_sec > 0, "tick rate must be non-zero");
        let state = Arc::new(HostState {
            start: Instant::now(),
            clocks_per_sec,
            crit: Mutex::new(CritState {
                owner: None,
                depth: 0,
            }),
            crit_cv: Condvar::new(),
            idle: Mutex::new(IdleState { wake: false }),
            idle_cv: Condvar::new(),
        });
        let data = Arc::into_raw(state).cast::<()>();
        // Safety: `data` is a live Arc and VTABLE's functions uphold the
        // RawPlatformVTable contract (atomic clone/drop, thread-safe hooks).
        unsafe { Platform::new(clocks_per_sec, data, &VTABLE) }
    }
}

struct CritState {
    owner: Option<ThreadId>,
    depth: u32,
}

struct IdleState {
    wake: bool,
}

struct HostState {
    start: Instant,
    clocks_per_sec: u64,
    crit: Mutex<CritState>,
    crit_cv: Condvar,
    idle: Mutex<IdleState>,
    idle_cv: Condvar,
}

impl HostState {
    fn now(&self) -> Ticks {
        let micros = self.start.elapsed().as_micros();
        let ticks = micros * u128::from(self.clocks_per_sec) / 1_000_000;
        Ticks(u64::try_from(ticks).unwrap_or(u64::MAX))
    }

    fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.crit.lock().expect("critical lock poisoned");
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            state = self.crit_cv.wait(state).expect("critical lock poisoned");
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    fn exit(&self) {
        let mut state = self.crit.lock().expect("critical lock poisoned");
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.crit_cv.notify_one();
        }
    }

    fn idle(&self, blocked: bool) {
        if !blocked {
            return;
        }
        // Compute the sleep budget before taking the idle mutex: the
        // runtime's lock is acquired inside, and producers call idle_break
        // while holding it.
        let budget = ticks_to_duration(crate::loop_idle_time());
        let mut state = self.idle.lock().expect("idle lock poisoned");
        if !state.wake && !budget.is_zero() {
            (state, _) = self
                .idle_cv
                .wait_timeout(state, budget)
                .expect("idle lock poisoned");
        }
        state.wake = false;
    }

    fn idle_break(&self) {
        let mut state = self.idle.lock().expect("idle lock poisoned");
        state.wake = true;
        self.idle_cv.notify_all();
    }
}

static VTABLE: RawPlatformVTable = RawPlatformVTable::new(
    vt_clone,
    vt_now,
    vt_enter,
    vt_exit,
    vt_idle,
    vt_idle_break,
    vt_expire_change,
    vt_drop,
);

/// Borrows the `HostState` behind a vtable `data` pointer for one call.
///
/// # Safety
///
/// `data` must come from `HostPlatform::with_clock_rate`'s leaked Arc and be
/// alive (strong count held by the enclosing `Platform`).
unsafe fn state<'a>(data: *const ()) -> &'a HostState {
    // Safety: per this function's contract.
    unsafe { &*data.cast::<HostState>() }
}

unsafe fn vt_clone(data: *const ()) -> RawPlatform {
    // Safety: `data` is a live leaked Arc per the vtable contract.
    unsafe { Arc::increment_strong_count(data.cast::<HostState>()) };
    RawPlatform::new(data, &VTABLE)
}

unsafe fn vt_now(data: *const ()) -> Ticks {
    // Safety: see `state`.
    unsafe { state(data) }.now()
}

unsafe fn vt_enter(data: *const ()) -> usize {
    // Safety: see `state`.
    unsafe { state(data) }.enter();
    0
}

unsafe fn vt_exit(data: *const (), _token: usize) {
    // Safety: see `state`.
    unsafe { state(data) }.exit();
}

unsafe fn vt_idle(data: *const (), blocked: bool) {
    // Safety: see `state`.
    unsafe { state(data) }.idle(blocked);
}

unsafe fn vt_idle_break(data: *const ()) {
    // Safety: see `state`.
    unsafe { state(data) }.idle_break();
}

unsafe fn vt_expire_change(data: *const (), _deadline: Option<Ticks>) {
    // A sleeping idle hook re-reads the deadline after any wake, so the
    // hint only needs to interrupt it.
    // Safety: see `state`.
    unsafe { state(data) }.idle_break();
}

unsafe fn vt_drop(data: *const ()) {
    // Safety: undoes the `Arc::into_raw` / `increment_strong_count` of the
    // matching constructor or clone.
    drop(unsafe { Arc::from_raw(data.cast::<HostState>()) });
}
