//! Instrumentation hooks (component J).
//!
//! `Instrument` mirrors the original's event set: observability call sites
//! at scheduler transitions, with empty default bodies so implementors
//! only override what they care about (the teacher's builder/trait-with-
//! defaults idiom, seen in `RuntimeConfig`). `run()` accepts a list of
//! instruments; a panicking or erroring instrument is caught, logged, and
//! discarded rather than allowed to take down the loop thread (§4.J).

use std::panic::{self, AssertUnwindSafe};

use crate::task::TaskId;

/// Observability events fired at scheduler transitions. All methods have
/// empty default bodies.
pub trait Instrument {
    fn before_run(&self) {}
    fn after_run(&self) {}
    fn task_spawned(&self, _task: TaskId) {}
    fn task_scheduled(&self, _task: TaskId) {}
    fn before_task_step(&self, _task: TaskId) {}
    fn after_task_step(&self, _task: TaskId) {}
    fn task_exited(&self, _task: TaskId) {}
    fn before_io_wait(&self, _timeout: Option<std::time::Duration>) {}
    fn after_io_wait(&self) {}
}

/// Invokes `f` on every instrument, catching and logging any panic so one
/// broken instrument cannot take down the run loop.
pub(crate) fn dispatch(instruments: &[Box<dyn Instrument + '_>], f: impl Fn(&dyn Instrument)) {
    for instrument in instruments {
        let instrument_ref = instrument.as_ref();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| f(instrument_ref))) {
            let message = crate::result::PanicPayload(payload).message();
            tracing::error!(panic = %message, "instrument callback panicked; discarding");
        }
    }
}
