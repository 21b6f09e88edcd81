use core::fmt;

/// Result type of every fallible runtime operation.
pub type Result<T> = core::result::Result<T, Error>;

/// Error tags of the runtime.
///
/// These are domain tags, not numeric codes: they travel up call chains as
/// plain `Err` values and panics stay reserved for genuine invariant
/// violations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// Internal invariant violated; unreachable with a correct runtime.
    Fault,
    /// Caller-supplied argument out of contract.
    InvalidParam,
    /// Operation is legal but not in the current state.
    InvalidState,
    /// Resource cannot service the operation without blocking.
    Busy,
    /// Heap exhausted.
    Alloc,
    /// The bounded wait expired without satisfaction.
    Timeout,
    /// The awaited event was destroyed under the waiter.
    EventClosed,
    /// Set membership: the element is already present.
    Exists,
    /// Set membership: the element is not present.
    NotExists,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Fault => f.write_str("internal fault"),
            Error::InvalidParam => f.write_str("invalid parameter"),
            Error::InvalidState => f.write_str("invalid state"),
            Error::Busy => f.write_str("resource busy"),
            Error::Alloc => f.write_str("memory allocation failed"),
            Error::Timeout => f.write_str("timed out"),
            Error::EventClosed => f.write_str("event destroyed while waiting"),
            Error::Exists => f.write_str("already a member"),
            Error::NotExists => f.write_str("not a member"),
        }
    }
}

impl core::error::Error for Error {}
