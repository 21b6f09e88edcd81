//! Blocking delays, built on a stack timer plus the event wait protocol.

use core::pin::pin;
use core::ptr::NonNull;

use crate::error::Result;
use crate::scheduler::{self, with_hub};
use crate::time::{Ticks, Timeout, msec_to_ticks, usec_to_ticks};
use crate::timer::Timer;

/// Parks the calling task for `ticks`; zero is a no-op.
///
/// # Errors
///
/// [`Error::InvalidState`](crate::Error::InvalidState) before `global_init`;
/// [`Error::EventClosed`](crate::Error::EventClosed) cannot occur (the timer
/// lives on this frame).
pub fn sleep_ticks(ticks: Ticks) -> Result<()> {
    if ticks.0 == 0 {
        return Ok(());
    }
    let me = scheduler::current_ptr()?;
    let timer = pin!(Timer::named("sleep"));
    let timer = timer.as_ref();
    timer.set_interval(ticks);
    let tp = NonNull::from(timer.get_ref());

    with_hub(|hub, p| {
        // Safety: the timer is pinned on this frame; the park frame entry
        // lets a reaper stop it if this task never resumes.
        unsafe { (*me.as_ptr()).park.add_timer(tp) };
        if let Err(err) = crate::timer::start_locked(hub, p, tp) {
            // Safety: as above.
            unsafe { (*me.as_ptr()).park.remove_timer(tp) };
            return Err(err);
        }
        Ok(())
    })??;

    let slept = timer.event().wait_timeout(Timeout::Forever);

    let _ = with_hub(|hub, _| {
        hub.timers.stop(tp);
        // Safety: as above.
        unsafe { (*me.as_ptr()).park.remove_timer(tp) };
    });
    slept
}

/// Parks the calling task for `ms` milliseconds.
///
/// # Errors
///
/// As [`sleep_ticks`].
pub fn sleep_ms(ms: u64) -> Result<()> {
    sleep_ticks(msec_to_ticks(ms))
}

/// Parks the calling task for `us` microseconds.
///
/// # Errors
///
/// As [`sleep_ticks`].
pub fn sleep_us(us: u64) -> Result<()> {
    sleep_ticks(usec_to_ticks(us))
}
