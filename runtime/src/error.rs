//! Error taxonomy (§7).
//!
//! `TaskError` is the single type that crosses a checkpoint or is returned
//! from a task body; its variants wrap the individually-named error kinds
//! the spec calls out (`MultiError`, `ClosedResourceError`, ...) so each can
//! still be matched on its own when a caller only cares about one kind.

use std::time::Duration;

use thiserror::Error;

/// Two or more sibling tasks in the same nursery failed concurrently. Each
/// entry preserves the child's own error, in the order the nursery observed
/// them.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{} concurrent errors: {}", .0.len(), join_display(.0))]
pub struct MultiError(pub Vec<TaskError>);

/// A resource (fd, channel endpoint, parking-lot token) was closed while a
/// task was waiting on it.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("resource closed while a task was waiting on it")]
pub struct ClosedResourceError;

/// A second task tried to wait on a resource that already has a waiter.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("resource already has a waiter")]
pub struct BusyResourceError;

/// A public kernel API was called after `run()` had already returned.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("the run loop has already finished")]
pub struct RunFinishedError;

/// A kernel invariant was violated: a bug in the scheduler itself, not in
/// user task code. Equivalent to trio's `TrioInternalError` (§7) — these
/// unwind `run()` rather than surfacing as an ordinary nursery failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("kernel invariant violated: {0}")]
pub struct KernelError(pub String);

/// Errors that can cross a checkpoint or be returned from a task body.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// Injected by the scheduler when a task observes its effective
    /// cancellation at a checkpoint. Catchable only by the cancel scope
    /// whose `cancel_called` made it effective (§4.C); anything else must
    /// let it propagate unchanged.
    #[error("task was cancelled")]
    Cancelled,

    /// Aggregate of concurrent sibling failures. See [`MultiError`].
    #[error(transparent)]
    Multi(#[from] MultiError),

    /// See [`ClosedResourceError`].
    #[error(transparent)]
    ClosedResource(#[from] ClosedResourceError),

    /// See [`BusyResourceError`].
    #[error(transparent)]
    BusyResource(#[from] BusyResourceError),

    /// See [`RunFinishedError`].
    #[error(transparent)]
    RunFinished(#[from] RunFinishedError),

    /// See [`KernelError`].
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// The spawned task body panicked; message preserved where available.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A scope-backed timeout expired before the body completed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A host interrupt (§4.I, e.g. `SIGINT`) was delivered at this task's
    /// checkpoint. Not a cancellation: no cancel scope claims it, so it
    /// propagates like any other raised error unless a caller catches it.
    #[error("interrupted by signal")]
    Interrupted,
}

impl TaskError {
    /// True only for the scheduler-injected cancellation, as opposed to a
    /// user-raised error or a kernel bug.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    /// True for [`TaskError::Kernel`], the only variant that should unwind
    /// `run()` instead of surfacing as an ordinary error.
    pub fn is_kernel_bug(&self) -> bool {
        matches!(self, TaskError::Kernel(_))
    }

    /// Combine child errors per the nursery exit protocol (§4.E): no errors
    /// is `None`, one passes through unwrapped, two or more become `Multi`.
    pub fn combine(mut errors: Vec<TaskError>) -> Option<TaskError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(TaskError::Multi(MultiError(errors))),
        }
    }
}

fn join_display(errors: &[TaskError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runtime-scoped errors that aren't about a task's own control flow:
/// `run()` setup/teardown and the blocking pool's submission path. Kept
/// separate from `TaskError` the way the teacher crate split
/// `RuntimeError`/`TaskError`.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// `run()` was invoked while another `run()` was already active on this
    /// thread (Design Notes §9: re-entrant `run()` is forbidden).
    #[error("run() is already active on this thread")]
    ReentrantRun,

    /// The blocking pool could not accept more work.
    #[error("failed to submit blocking task: {0}")]
    SpawnFailed(String),

    /// Wraps a `TaskError` escaping the root task or a system task.
    #[error(transparent)]
    Task(#[from] TaskError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_error_display() {
        assert_eq!(TaskError::Cancelled.to_string(), "task was cancelled");
        assert_eq!(
            TaskError::Panicked("boom".into()).to_string(),
            "task panicked: boom"
        );
    }

    #[test]
    fn combine_empty_is_none() {
        assert!(TaskError::combine(vec![]).is_none());
    }

    #[test]
    fn combine_single_passes_through() {
        let combined = TaskError::combine(vec![TaskError::Cancelled]).unwrap();
        assert!(combined.is_cancelled());
    }

    #[test]
    fn combine_multiple_wraps() {
        let combined =
            TaskError::combine(vec![TaskError::Cancelled, TaskError::Panicked("x".into())])
                .unwrap();
        match combined {
            TaskError::Multi(MultiError(errs)) => assert_eq!(errs.len(), 2),
            other => panic!("expected Multi, got {other:?}"),
        }
    }
}
