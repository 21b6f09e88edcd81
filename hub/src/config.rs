//! Runtime tunables.
//!
//! Every knob is a single named constant with one documented effect. The tick
//! rate itself is not a constant: it comes from the installed
//! [`Platform`](crate::port::Platform) and these values only describe the
//! defaults the stock ports use.

pub use costack::stack::MIN_STACK_SIZE;

/// Tick rate assumed by the host port: one tick per microsecond.
pub const DEFAULT_CLOCKS_PER_SEC: u64 = 1_000_000;

/// Ceiling, in milliseconds, on the idle deadline reported by
/// [`loop_idle_time`](crate::loop_idle_time); the idle hook always wakes at
/// least this often for maintenance even with no armed timer.
pub const IDLE_CEILING_MS: u64 = 60_000;

/// Stack size of the event-callback dispatcher task.
pub const CALLBACK_DISPATCH_STACK_SIZE: usize = 32 * 1024;

/// How many epoll slots the callback dispatcher drains per wakeup.
pub const CALLBACK_DISPATCH_SLOTS: usize = 8;

/// Byte written over fresh task stacks; the high-water scan of
/// [`stat`](crate::task::TaskRef::stat) counts the untouched prefix.
pub const STACK_FILL_PATTERN: u8 = 0xa5;
