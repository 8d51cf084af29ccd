//! Signal gate (component I).
//!
//! A `libc::signal` handler can only touch async-signal-safe state, so the
//! handler itself does nothing but flip a static `AtomicBool`. The run
//! loop drains that flag at each task's next checkpoint (never mid
//! bookkeeping), unless the task is inside `protect_from_interrupt`. Only
//! installed on Unix; elsewhere the gate is a documented no-op rather than
//! a silent miscompile.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static PROTECTED: Cell<u32> = Cell::new(0);
}

/// Drains the interrupt flag. Returns `true` exactly once per delivered
/// signal, and never while `protect_from_interrupt` is active.
pub(crate) fn take_interrupt() -> bool {
    if PROTECTED.with(|p| p.get()) > 0 {
        return false;
    }
    INTERRUPTED.swap(false, Ordering::AcqRel)
}

/// Test-only: fires the gate without going through an actual OS signal.
#[cfg(test)]
pub(crate) fn fire_for_test() {
    INTERRUPTED.store(true, Ordering::Release);
}

/// Guard suppressing interrupt delivery for the duration of its scope.
/// Nestable: interrupts resume only once every guard has been dropped.
pub struct InterruptShield;

impl InterruptShield {
    pub fn new() -> Self {
        PROTECTED.with(|p| p.set(p.get() + 1));
        InterruptShield
    }
}

impl Default for InterruptShield {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptShield {
    fn drop(&mut self) {
        PROTECTED.with(|p| p.set(p.get().saturating_sub(1)));
    }
}

/// Runs `f` with interrupt delivery suppressed.
pub fn protect_from_interrupt<T>(f: impl FnOnce() -> T) -> T {
    let _shield = InterruptShield::new();
    f()
}

#[cfg(unix)]
extern "C" fn handle_signal(_sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Release);
}

/// Installs the gate's `SIGINT` handler. A no-op on non-Unix targets.
#[cfg(unix)]
pub fn install() {
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
pub fn install() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shield_suppresses_interrupt() {
        INTERRUPTED.store(true, Ordering::Release);
        {
            let _shield = InterruptShield::new();
            assert!(!take_interrupt());
        }
        assert!(take_interrupt());
    }

    #[test]
    fn take_interrupt_is_edge_triggered() {
        INTERRUPTED.store(true, Ordering::Release);
        assert!(take_interrupt());
        assert!(!take_interrupt());
    }
}
