//! EventHub, an embedded cooperative multitasking runtime.
//!
//! A stackful-coroutine scheduler with an integrated event/notification
//! system, an ordered timer queue and an epoll-style aggregation primitive,
//! runnable on bare-metal targets as well as hosted POSIX/macOS builds.
//!
//! The moving parts:
//!
//! * [`task`]: per-task stacks and round-robin cooperative scheduling on
//!   top of the [`costack`] context-switch primitive; [`loop_run`] drives
//!   the world from the boot task.
//! * [`event`]: the [`Event`] fan-out notification primitive, with
//!   stack-allocated receptors and a conditional wait protocol.
//! * [`timer`]: [`Timer`]s in an intrusive ordered tree keyed by
//!   expiration; the soonest deadline feeds the port's idle hook.
//! * [`epoll`]: one task waiting on many events, without losing
//!   notifications that land between waits.
//! * [`sync`]: mutex, semaphore and flag bits built on the condition wait.
//! * [`callback`]: the signal-slot dispatcher running on the system task.
//! * [`module`]: ordered init/exit phases composing all of the above.
//!
//! Everything above the context switch is driven through a platform port
//! ([`Platform`]): monotonic clock, critical section, idle hook, deadline
//! hint. Hosted builds get a stock port in [`host`].
//!
//! ```no_run
//! use eventhub::{HostPlatform, TaskFlags, Timeout};
//!
//! eventhub::global_init(HostPlatform::new(), &[]).unwrap();
//! let worker = eventhub::spawn("worker", TaskFlags::empty(), 16 * 1024, || {
//!     eventhub::sleep_ms(50).unwrap();
//!     42
//! })
//! .unwrap();
//! let code = worker.join(Timeout::Forever).unwrap();
//! assert_eq!(code, 42);
//! eventhub::global_exit();
//! ```

#![cfg_attr(all(not(test), target_os = "none"), no_std)]

extern crate alloc;

pub mod callback;
pub mod config;
pub mod epoll;
mod error;
pub mod event;
pub mod module;
pub mod port;
mod scheduler;
mod sleep;
pub mod sync;
pub mod task;
pub mod time;
pub mod timer;

cfg_if::cfg_if! {
    if #[cfg(not(target_os = "none"))] {
        pub mod host;
        pub use host::HostPlatform;
    }
}

pub use costack::stack::{OwnedStack, RawStack};
pub use epoll::{Affair, Epoll, Slot};
pub use error::{Error, Result};
pub use event::Event;
pub use module::{Module, Phase};
pub use port::{Platform, RawPlatform, RawPlatformVTable};
pub use scheduler::{global_exit, global_init, loop_exit, loop_idle_time, loop_run};
pub use sleep::{sleep_ms, sleep_ticks, sleep_us};
pub use task::{TaskFlags, TaskRef, TaskStat, TaskState, current, exit, spawn, spawn_static, yield_now};
pub use time::{
    Deadline, Ticks, Timeout, msec_to_ticks, ticks_to_msec, ticks_to_usec, usec_to_ticks,
};
pub use timer::{Timer, TimerAttrs};
