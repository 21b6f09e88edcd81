//! Synchronization primitives built on top of the event wait protocol.
//!
//! Everything here is sugar over [`Event::wait_condition_timeout`]
//! [(see `event`)](crate::event::Event::wait_condition_timeout): the state
//! lives next to an event, producers notify it, and waiters park with a
//! condition closure. None of these types add new suspension points.

mod flags;
mod mutex;
mod semaphore;

pub use flags::EventFlags;
pub use mutex::{Mutex, MutexKind};
pub use semaphore::Semaphore;
