//! Nursery (component E).
//!
//! A nursery owns a set of child tasks and cannot exit until every one of
//! them has terminated (§3 "Nursery"). `start_soon` never suspends: it
//! just registers a runnable child and returns. `start` suspends the
//! caller until the new child calls `task_status.started(value)`,
//! implemented here as a dedicated one-shot rendezvous rather than a
//! generic channel (channels are a named out-of-scope external
//! collaborator, §1).

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;

use crate::error::TaskError;
use crate::park::ParkingLot;
use crate::runloop;
use crate::scope::ScopeHandle;
use crate::task::{self, Abort, TaskId};

/// Kernel-internal nursery bookkeeping, shared between the nursery handle
/// user code holds and the run loop's child-completion hook.
pub(crate) struct NurseryInner {
    pub scope: ScopeHandle,
    pub host_task: TaskId,
    pending: Cell<usize>,
    /// The host task's own one-shot wait. At most one task ever parks here
    /// (the task that called `open_nursery`/`start`), but it's a real
    /// `ParkingLot` rather than a bespoke flag so the wake side is the same
    /// `unpark` + `reschedule` pairing every other waiter in this crate uses.
    host_wait: Rc<RefCell<ParkingLot>>,
    errors: RefCell<Vec<TaskError>>,
}

impl NurseryInner {
    fn new(scope: ScopeHandle, host_task: TaskId) -> Self {
        Self {
            scope,
            host_task,
            pending: Cell::new(0),
            host_wait: Rc::new(RefCell::new(ParkingLot::new())),
            errors: RefCell::new(Vec::new()),
        }
    }

    /// Called by the run loop when it registers a new child into this
    /// nursery, before the child is first polled.
    pub(crate) fn child_spawned(&self) {
        self.pending.set(self.pending.get() + 1);
    }

    /// Wakes the host task if it's currently parked on `host_wait`. A no-op
    /// if the host hasn't parked yet (e.g. a child finishes before the host
    /// reaches its wait).
    fn wake_host(&self) {
        if let Some(parked) = self.host_wait.borrow_mut().unpark() {
            task::reschedule(parked.task, crate::result::Outcome::Value(()));
        }
    }

    /// Parks the host task on `host_wait` and suspends it there until
    /// `wake_host` fires. Deliberately not `park_and_wait`: cancelling a
    /// nursery must not let the host skip past children that are still
    /// running, so this wait's abort function always reports `Failed` —
    /// the host only resumes once every child has actually finished, and
    /// picks up its pending cancellation at its very next checkpoint.
    async fn park_host_and_wait(self: &Rc<Self>) {
        let host = self.host_task;
        self.host_wait.borrow_mut().park(host, None);
        let _ = task::wait_task_rescheduled(Box::new(|_raise_cancel| Abort::Failed)).await;
    }

    /// Called by the run loop when one of this nursery's children
    /// finishes, successfully or not. A failing child cancels the
    /// nursery's own scope, which is how its siblings (and any further
    /// descendants sharing the scope) observe the failure at their next
    /// checkpoint (§4.E "cancel-on-child-error").
    pub(crate) fn child_finished(self: &Rc<Self>, error: Option<TaskError>) {
        if let Some(e) = error {
            self.errors.borrow_mut().push(e);
            self.scope.cancel();
        }
        let remaining = self.pending.get() - 1;
        self.pending.set(remaining);
        if remaining == 0 {
            self.wake_host();
        }
    }
}

/// Handle passed into a nursery's body, used to spawn children into it.
#[derive(Clone)]
pub struct Nursery {
    pub(crate) inner: Rc<NurseryInner>,
}

impl Nursery {
    /// Spawn a child that runs concurrently with the nursery body and its
    /// siblings. Never suspends the caller (§4.E).
    pub fn start_soon<F, Fut>(&self, f: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
    {
        runloop::spawn_child(self.inner.clone(), f());
    }

    /// Spawn a child and suspend the caller until it calls
    /// `task_status.started(value)`, then return that value. If the child
    /// finishes (successfully or with an error) without ever calling
    /// `started`, that is itself treated as the `start` call's error.
    pub async fn start<F, Fut, V>(&self, f: F) -> Result<V, TaskError>
    where
        F: FnOnce(TaskStatus<V>) -> Fut + 'static,
        Fut: Future<Output = Result<(), TaskError>> + 'static,
        V: 'static,
    {
        let resolution: Rc<RefCell<Option<Result<V, TaskError>>>> = Rc::new(RefCell::new(None));
        let host_wait = self.inner.host_wait.clone();
        let status = TaskStatus {
            resolution: resolution.clone(),
            host_wait: host_wait.clone(),
        };

        let fail_hook_resolution = resolution.clone();
        let fail_hook_wait = host_wait.clone();
        let fail_hook = Box::new(move |e: TaskError| {
            if fail_hook_resolution.borrow().is_none() {
                *fail_hook_resolution.borrow_mut() = Some(Err(e));
            }
            if let Some(parked) = fail_hook_wait.borrow_mut().unpark() {
                task::reschedule(parked.task, crate::result::Outcome::Value(()));
            }
        });

        runloop::spawn_child_with_start_hook(self.inner.clone(), f(status), fail_hook);

        self.inner.park_host_and_wait().await;

        let taken = resolution.borrow_mut().take();
        taken.unwrap_or_else(|| {
            Err(TaskError::Panicked(
                "child exited without calling task_status.started()".into(),
            ))
        })
    }
}

/// Passed to a `start`-spawned child's body so it can report back the
/// value its caller is waiting for.
pub struct TaskStatus<V> {
    resolution: Rc<RefCell<Option<Result<V, TaskError>>>>,
    host_wait: Rc<RefCell<ParkingLot>>,
}

impl<V> TaskStatus<V> {
    /// Report `value` to the task that called `nursery.start(...)`,
    /// waking it. After this call the child keeps running as an ordinary
    /// nursery child.
    pub fn started(self, value: V) {
        if self.resolution.borrow().is_none() {
            *self.resolution.borrow_mut() = Some(Ok(value));
        }
        if let Some(parked) = self.host_wait.borrow_mut().unpark() {
            task::reschedule(parked.task, crate::result::Outcome::Value(()));
        }
    }
}

/// Opens a nursery: runs `body` with a fresh `Nursery` handle, and does
/// not return until every child it spawned (directly or via `start`) has
/// terminated (§3, §4.E). Errors from the body and from children combine
/// per the exit protocol (§4.E): a child's `Cancelled` caused by this
/// nursery's own scope cancelling its siblings is not itself treated as a
/// nursery failure.
pub async fn open_nursery<F, Fut, T>(body: F) -> Result<T, TaskError>
where
    F: FnOnce(Nursery) -> Fut,
    Fut: Future<Output = Result<T, TaskError>>,
{
    let host_task = runloop::current_task_id();
    let outcome = crate::scope::open_cancel_scope()
        .run(|scope_handle| async move {
            let inner = Rc::new(NurseryInner::new(scope_handle.clone(), host_task));
            let nursery = Nursery {
                inner: inner.clone(),
            };

            let body_result = body(nursery).await;
            if body_result.is_err() {
                scope_handle.cancel();
            }

            if inner.pending.get() > 0 {
                inner.park_host_and_wait().await;
            }

            let self_cancelled = scope_handle.cancel_called();
            let mut errors: Vec<TaskError> = inner
                .errors
                .borrow_mut()
                .drain(..)
                .filter(|e| !(self_cancelled && e.is_cancelled()))
                .collect();

            match body_result {
                Ok(v) => match TaskError::combine(errors) {
                    None => Ok(v),
                    Some(combined) => Err(combined),
                },
                Err(e) => {
                    if !(self_cancelled && e.is_cancelled()) {
                        errors.insert(0, e);
                    }
                    Err(TaskError::combine(errors).unwrap_or(TaskError::Cancelled))
                }
            }
        })
        .await?;

    outcome.value.ok_or(TaskError::Cancelled)
}
