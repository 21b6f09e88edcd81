//! The module registry: ordered init/exit phases.
//!
//! A [`Module`] is a const record of one `(init, exit)` pair in a [`Phase`].
//! [`global_init`](crate::global_init) runs inits lowest phase first and, in
//! one phase, in declaration order; the first failure tears the
//! already-initialized entries down in reverse and propagates the error.
//! [`global_exit`](crate::global_exit) runs the same reverse tear-down.
//!
//! The early phases of the composition are built in: the allocator is the
//! global allocator, the coroutine primitive needs no init, the platform
//! arrives as the port record, and the interior subsystems (timer queue,
//! callback dispatcher) are brought up by `global_init` itself. What remains
//! here is the ordering and rollback machinery plus the application phases.

use alloc::vec::Vec;

use crate::error::Result;

/// Ordering bucket of a module; lower phases initialize first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Phase(pub u8);

impl Phase {
    /// Extra platform glue that must precede everything else.
    pub const PLATFORM: Phase = Phase(1);
    /// Runtime-interior extensions (dispatchers, services).
    pub const INTERIOR: Phase = Phase(2);
    /// Ordinary application modules.
    pub const APPLICATION: Phase = Phase(7);
}

/// One registered `(init, exit)` pair.
#[derive(Debug)]
pub struct Module {
    pub name: &'static str,
    pub phase: Phase,
    pub init: fn() -> Result<()>,
    pub exit: fn(),
}

/// Runs every module's init in phase order (declaration order within a
/// phase) and returns the applied order for later tear-down. On failure the
/// already-initialized entries are exited in reverse.
pub(crate) fn apply(modules: &[&'static Module]) -> Result<Vec<&'static Module>> {
    let mut sorted: Vec<&'static Module> = modules.to_vec();
    sorted.sort_by_key(|m| m.phase);

    let mut applied: Vec<&'static Module> = Vec::with_capacity(sorted.len());
    for module in sorted {
        tracing::trace!(module = module.name, phase = module.phase.0, "module init");
        match (module.init)() {
            Ok(()) => applied.push(module),
            Err(err) => {
                tracing::warn!(module = module.name, ?err, "module init failed, rolling back");
                for done in applied.iter().rev() {
                    (done.exit)();
                }
                return Err(err);
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static TRACE: AtomicUsize = AtomicUsize::new(0);

    fn push_digit(d: usize) {
        TRACE.store(TRACE.load(Ordering::SeqCst) * 10 + d, Ordering::SeqCst);
    }

    static FIRST: Module = Module {
        name: "first",
        phase: Phase::PLATFORM,
        init: || {
            push_digit(1);
            Ok(())
        },
        exit: || push_digit(8),
    };
    static SECOND: Module = Module {
        name: "second",
        phase: Phase::APPLICATION,
        init: || {
            push_digit(2);
            Ok(())
        },
        exit: || push_digit(9),
    };
    static FAILING: Module = Module {
        name: "failing",
        phase: Phase::APPLICATION,
        init: || Err(Error::Busy),
        exit: || unreachable!("exit of a module whose init failed"),
    };

    #[test]
    fn phases_order_inits_and_rollback_reverses() {
        TRACE.store(0, Ordering::SeqCst);
        // Declared out of phase order on purpose.
        let applied = apply(&[&SECOND, &FIRST]).unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(TRACE.load(Ordering::SeqCst), 12);

        TRACE.store(0, Ordering::SeqCst);
        let err = apply(&[&FIRST, &SECOND, &FAILING]).unwrap_err();
        assert_eq!(err, Error::Busy);
        // 1, 2 ran, then rollback 9, 8.
        assert_eq!(TRACE.load(Ordering::SeqCst), 1298);
    }
}
