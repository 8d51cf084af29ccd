//! kestrel-runtime - a single-threaded structured-concurrency scheduler.
//!
//! This crate provides nurseries and cancel scopes over a cooperative run
//! loop, in the shape of Python's Trio:
//! - [`run`] drives one root task (and everything it transitively spawns)
//!   to completion on the calling thread.
//! - [`open_nursery`] opens a scope that cannot exit until every task
//!   spawned into it (via `start_soon`/`start`) has terminated.
//! - [`open_cancel_scope`], [`move_on_after`] attach cooperative
//!   cancellation and deadlines to a block of code.
//! - [`checkpoint`] is where cancellation and rescheduling actually take
//!   effect; every wait primitive in this crate is built on the two traps
//!   defined in [`task`].
//! - [`spawn_system_task`] and [`reschedule`] are the lower-level public
//!   kernel entry points: a task spawned outside any nursery, and a
//!   directly-callable wake for custom waits built on
//!   [`task::wait_task_rescheduled`].
//!
//! # Design goals
//!
//! - Structured concurrency: a task cannot outlive the nursery it was
//!   spawned into.
//! - One scheduler thread; no work-stealing across kernel state (that
//!   would defeat the point of a single-owner `Rc<RefCell<_>>` kernel).
//!   [`spawn_blocking`] is the escape hatch for genuinely blocking work,
//!   backed by its own worker pool.
//! - Deterministic, test-friendly time via [`clock::MockClock`], with
//!   autojump so deadline-heavy tests never actually sleep.

pub mod blocking;
pub mod clock;
pub mod error;
pub mod instrument;
pub mod io;
pub mod nursery;
pub mod park;
pub mod result;
mod runloop;
pub mod scope;
pub mod signal;
pub mod task;

pub use blocking::spawn_blocking;
pub use clock::{sleep, sleep_until, Clock, MockClock, SystemClock};
pub use error::{RuntimeError, TaskError};
pub use instrument::Instrument;
pub use nursery::{open_nursery, Nursery, TaskStatus};
pub use result::Outcome;
pub use runloop::{foreign_handle, run, spawn_system_task, yield_now, ForeignHandle, RuntimeConfig};
pub use scope::{
    move_on_after, move_on_at, open_cancel_scope, CancelOutcome, CancelScopeBuilder, Deadline,
    ScopeHandle, ScopeId,
};
pub use task::{
    cancel_shielded_checkpoint, checkpoint, checkpoint_if_cancelled, current_task, reschedule,
    wait_task_rescheduled, Abort, TaskHandle, TaskId, TaskState,
};
