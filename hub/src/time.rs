//! The tick vocabulary.
//!
//! The monotonic clock of the installed port counts [`Ticks`] at
//! `clocks_per_sec`. Timers key on a [`Deadline`], an absolute tick value
//! ordered by *signed distance* so that counter wraparound cannot invert the
//! timer tree. Conversions to and from wall-clock units are lossy with a
//! documented floor: any non-zero duration converts to at least one tick.

use core::cmp::Ordering;
use core::time::Duration;

use crate::config::DEFAULT_CLOCKS_PER_SEC;

/// A count of monotonic clock ticks.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Ticks(pub u64);

/// An absolute point on the monotonic clock.
///
/// Ordering compares the signed difference of the raw counters, which keeps
/// deadlines ordered correctly across counter wraparound as long as all live
/// deadlines span less than half the counter range.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Deadline(pub u64);

impl Deadline {
    /// The deadline `interval` ticks after `now`.
    #[must_use]
    pub fn after(now: Ticks, interval: Ticks) -> Self {
        Self(now.0.wrapping_add(interval.0))
    }

    /// Signed ticks from `now` until this deadline; non-positive when due.
    #[must_use]
    pub fn remaining(&self, now: Ticks) -> i64 {
        self.0.wrapping_sub(now.0).cast_signed()
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.wrapping_sub(other.0).cast_signed().cmp(&0)
    }
}

/// How long a wait is allowed to take.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Timeout {
    /// Never give up.
    Forever,
    /// Give up after this many ticks.
    After(Ticks),
}

impl Timeout {
    /// A timeout of `ms` milliseconds.
    #[must_use]
    pub fn after_ms(ms: u64) -> Self {
        Self::After(msec_to_ticks(ms))
    }

    /// A timeout of `us` microseconds.
    #[must_use]
    pub fn after_us(us: u64) -> Self {
        Self::After(usec_to_ticks(us))
    }
}

fn clocks_per_sec() -> u64 {
    crate::scheduler::platform_ref()
        .map_or(DEFAULT_CLOCKS_PER_SEC, crate::port::Platform::clocks_per_sec)
}

fn scale(value: u64, num: u64, den: u64) -> u64 {
    let wide = u128::from(value / den) * u128::from(num)
        + u128::from(value % den) * u128::from(num) / u128::from(den);
    u64::try_from(wide).unwrap_or(u64::MAX)
}

/// Converts milliseconds to ticks; any non-zero input yields at least one tick.
#[must_use]
pub fn msec_to_ticks(ms: u64) -> Ticks {
    let t = scale(ms, clocks_per_sec(), 1000);
    Ticks(if t == 0 && ms != 0 { 1 } else { t })
}

/// Converts microseconds to ticks; any non-zero input yields at least one tick.
#[must_use]
pub fn usec_to_ticks(us: u64) -> Ticks {
    let t = scale(us, clocks_per_sec(), 1_000_000);
    Ticks(if t == 0 && us != 0 { 1 } else { t })
}

/// Converts ticks to milliseconds; any non-zero input yields at least 1 ms.
#[must_use]
pub fn ticks_to_msec(ticks: Ticks) -> u64 {
    let ms = scale(ticks.0, 1000, clocks_per_sec());
    if ms == 0 && ticks.0 != 0 { 1 } else { ms }
}

/// Converts ticks to microseconds; any non-zero input yields at least 1 µs.
#[must_use]
pub fn ticks_to_usec(ticks: Ticks) -> u64 {
    let us = scale(ticks.0, 1_000_000, clocks_per_sec());
    if us == 0 && ticks.0 != 0 { 1 } else { us }
}

/// Converts ticks to a [`Duration`].
#[must_use]
pub fn ticks_to_duration(ticks: Ticks) -> Duration {
    Duration::from_micros(ticks_to_usec(ticks))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_orders_across_wrap() {
        let near_wrap = Deadline(u64::MAX - 10);
        let wrapped = Deadline(5);
        assert!(near_wrap < wrapped);
        assert!(wrapped.remaining(Ticks(u64::MAX - 10)) > 0);
        assert!(near_wrap.remaining(Ticks(5)) < 0);
    }

    #[test]
    fn conversions_floor_at_one_tick() {
        // No platform installed in unit tests: 1 MHz default.
        assert_eq!(msec_to_ticks(0), Ticks(0));
        assert_eq!(msec_to_ticks(1), Ticks(1000));
        assert_eq!(usec_to_ticks(1), Ticks(1));
        assert_eq!(ticks_to_msec(Ticks(1)), 1);
        assert_eq!(ticks_to_msec(Ticks(0)), 0);
        assert_eq!(ticks_to_msec(Ticks(2500)), 2);
    }

    #[test]
    fn msec_round_trip_is_monotonic() {
        let mut last = 0;
        for ms in [1u64, 2, 10, 999, 1000, 1001, 60_000] {
            let rt = ticks_to_msec(msec_to_ticks(ms));
            assert!(rt >= last);
            last = rt;
        }
    }
}
