//! Result carrier (component A).
//!
//! `Outcome<T>` is the value that crosses the suspension boundary between
//! the kernel and a parked task: either the value a wait was waiting for, or
//! the `TaskError` that should be raised into the task instead. Named to
//! avoid colliding with `std::result::Result`, which it is built on top of.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::error::TaskError;

/// Either a value or the error that should be raised in its place once the
/// waiting task resumes.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Value(T),
    Error(TaskError),
}

impl<T> Outcome<T> {
    pub fn value(v: T) -> Self {
        Outcome::Value(v)
    }

    pub fn error(e: TaskError) -> Self {
        Outcome::Error(e)
    }

    /// Convert into the `Result` a resumed task actually sees.
    pub fn unwrap(self) -> Result<T, TaskError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(e) => Err(e),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

/// The payload of a caught panic, carried until it can be rendered into a
/// [`TaskError::Panicked`] message by whoever is in a position to log it.
pub struct PanicPayload(pub Box<dyn Any + Send + 'static>);

impl PanicPayload {
    /// Best-effort rendering of the panic message, matching the default
    /// panic hook's handling of `&str`/`String` payloads and falling back
    /// to a generic message for anything else.
    pub fn message(&self) -> String {
        if let Some(s) = self.0.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = self.0.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        }
    }
}

/// Runs `f`, catching any panic and converting it into an `Outcome::Error`
/// so a panicking user closure never takes down the loop thread. Mirrors
/// the teacher's `catch_unwind`-into-`TaskError::Panicked` pattern used
/// around spawned task bodies.
pub fn capture<T>(f: impl FnOnce() -> T) -> Outcome<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Outcome::Value(v),
        Err(payload) => Outcome::Error(TaskError::Panicked(PanicPayload(payload).message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_returns_value_on_success() {
        let outcome = capture(|| 1 + 1);
        match outcome {
            Outcome::Value(v) => assert_eq!(v, 2),
            Outcome::Error(_) => panic!("expected value"),
        }
    }

    #[test]
    fn capture_converts_panic_to_error() {
        let outcome: Outcome<()> = capture(|| panic!("kaboom"));
        match outcome {
            Outcome::Error(TaskError::Panicked(msg)) => assert_eq!(msg, "kaboom"),
            other => panic!("expected Panicked, got {other:?}"),
        }
    }

    #[test]
    fn unwrap_converts_to_result() {
        assert_eq!(Outcome::Value(5).unwrap(), Ok(5));
        assert!(Outcome::<i32>::Error(TaskError::Cancelled).unwrap().is_err());
    }
}
