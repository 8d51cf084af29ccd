//! Task (component D).
//!
//! A task's body is an `async fn`; the kernel drives it with `Future::poll`
//! rather than resuming a generator, per the Rust-native mapping described
//! in SPEC_FULL.md §2. `TaskId`/`TaskState` keep the teacher's naming and
//! shape; `TaskRecord` replaces the teacher's OS-thread-backed `TaskInner`
//! with the bookkeeping a single poll-driven task needs: its scope stack,
//! its pending abort function, and the single-slot resume value a leaf
//! future reads back out after being woken.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use crate::error::TaskError;
use crate::nursery::NurseryInner;
use crate::result::Outcome;
use crate::runloop;
use crate::scope::ScopeId;

/// Opaque, monotonically increasing task identity. Used as the ordering
/// key for the deterministic cancellation walk (§4.F) as well as for
/// lookups in the kernel's task table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Construct a `TaskId` with an explicit value. Exposed for tests that
    /// need deterministic ids; never use this to fabricate ids that could
    /// collide with `next()`'s counter in production code.
    pub fn from_raw(id: u64) -> Self {
        TaskId(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// A task's position in the scheduling state machine (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// On the run queue, waiting for its turn.
    Runnable,
    /// Currently being polled by the run loop.
    Running,
    /// Suspended on `wait_task_rescheduled`, with an abort function
    /// installed.
    Parked,
    /// Finished: either completed, raised, or panicked.
    Done,
}

/// Return value of an abort function (§9 trap protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abort {
    /// The wait was torn down; the kernel will reschedule the task itself
    /// with a `Cancelled` error.
    Succeeded,
    /// The wait could not be aborted right now; the caller remains
    /// responsible for eventually calling `reschedule`.
    Failed,
}

/// Constructs the `TaskError` an abort function should inject if it
/// chooses option 2 from the trap's doc contract (deferred cancellation
/// delivery). Cheap to clone; always yields `TaskError::Cancelled`.
pub type RaiseCancel = Rc<dyn Fn() -> TaskError>;

/// Callback installed by `wait_task_rescheduled`. Invoked by the run loop's
/// cancellation walk (§4.F) at most once per park.
pub type AbortFunc = Box<dyn FnOnce(RaiseCancel) -> Abort>;

/// Which of the two traps a task's top-level future yielded. Recorded by
/// the leaf future just before it returns `Poll::Pending`, since `poll`'s
/// return carries no payload of its own (§2 `[FULL]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trap {
    CancelShieldedCheckpoint,
    WaitTaskRescheduled,
}

/// Type-erased handle to a task's top-level future plus whatever it needs
/// to hand its result back to its parent nursery. Generic over the task's
/// real output type `T`, erased behind this trait so heterogeneous tasks
/// can share one kernel-owned map.
pub(crate) trait PolledTask {
    /// Drives the task one step. `Poll::Ready` carries the error the task
    /// finished with, if any (nurseries only care about errors; a
    /// successful value is irrelevant to `start_soon`-spawned children).
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Option<TaskError>>;
}

/// Catches a panic from a single `poll` call, converting it into the same
/// `TaskError` a raised error would produce. A panic inside one `poll`
/// call does not poison later polls of other tasks, since `catch_unwind`
/// only guards this one call.
fn poll_catching_panics<Fut: Future + ?Sized>(
    fut: Pin<&mut Fut>,
    cx: &mut Context<'_>,
) -> Poll<Result<Fut::Output, TaskError>> {
    use std::panic::{self, AssertUnwindSafe};
    match panic::catch_unwind(AssertUnwindSafe(|| fut.poll(cx))) {
        Ok(Poll::Ready(v)) => Poll::Ready(Ok(v)),
        Ok(Poll::Pending) => Poll::Pending,
        Err(payload) => Poll::Ready(Err(TaskError::Panicked(
            crate::result::PanicPayload(payload).message(),
        ))),
    }
}

pub(crate) struct TaskFuture<Fut: Future<Output = Result<(), TaskError>>> {
    fut: Pin<Box<Fut>>,
}

impl<Fut: Future<Output = Result<(), TaskError>>> TaskFuture<Fut> {
    pub(crate) fn new(fut: Fut) -> Self {
        Self { fut: Box::pin(fut) }
    }
}

impl<Fut: Future<Output = Result<(), TaskError>>> PolledTask for TaskFuture<Fut> {
    fn poll_step(&mut self, cx: &mut Context<'_>) -> Poll<Option<TaskError>> {
        match poll_catching_panics(self.fut.as_mut(), cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(()))) => Poll::Ready(None),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Some(e)),
            Poll::Ready(Err(e)) => Poll::Ready(Some(e)),
        }
    }
}

/// Kernel-internal per-task bookkeeping. Never exposed directly to user
/// code; `TaskHandle` is the public identity callers get back.
pub(crate) struct TaskRecord {
    pub id: TaskId,
    pub name: Option<String>,
    pub state: Cell<TaskState>,
    pub scope_stack: RefCell<Vec<ScopeId>>,
    pub nursery: RefCell<Option<Weak<NurseryInner>>>,
    pub abort_func: RefCell<Option<AbortFunc>>,
    pub(crate) last_trap: Cell<Option<Trap>>,
    pub resume: RefCell<Option<Outcome<()>>>,
    pub custom_sleep_data: RefCell<Option<Box<dyn Any>>>,
    pub body: RefCell<Option<Box<dyn PolledTask>>>,
    /// Set when this task's error arrives after its nursery has already
    /// been torn down (trio's "ghostly death", §4.D `[FULL]`).
    pub ghostly: Cell<bool>,
    /// Invoked by the run loop if this task finishes before resolving a
    /// pending `nursery.start()` rendezvous it was spawned for.
    pub start_fail_hook: RefCell<Option<Box<dyn FnOnce(TaskError)>>>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        name: Option<String>,
        scope_stack: Vec<ScopeId>,
        body: Box<dyn PolledTask>,
    ) -> Self {
        Self {
            id,
            name,
            state: Cell::new(TaskState::Runnable),
            scope_stack: RefCell::new(scope_stack),
            nursery: RefCell::new(None),
            abort_func: RefCell::new(None),
            last_trap: Cell::new(None),
            resume: RefCell::new(None),
            custom_sleep_data: RefCell::new(None),
            body: RefCell::new(Some(body)),
            ghostly: Cell::new(false),
            start_fail_hook: RefCell::new(None),
        }
    }
}

/// Lightweight public identity for a task, returned by `current_task()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    id: TaskId,
}

impl TaskHandle {
    pub(crate) fn new(id: TaskId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn state(&self) -> TaskState {
        runloop::with_kernel(|k| {
            k.borrow()
                .tasks
                .get(&self.id)
                .map(|rec| rec.state.get())
                .unwrap_or(TaskState::Done)
        })
    }
}

/// Returns the identity of the task currently being polled. Panics if
/// called outside of a task body (a kernel invariant, not a user error).
pub fn current_task() -> TaskHandle {
    TaskHandle::new(runloop::current_task_id())
}

/// Introduces a schedule point but not a cancel point: yields the
/// `CancelShieldedCheckpoint` trap exactly once, then resumes
/// unconditionally. Combined with `checkpoint_if_cancelled` this makes a
/// full `checkpoint()`.
pub async fn cancel_shielded_checkpoint() {
    CancelShieldedCheckpointFuture { polled: false }.await
}

struct CancelShieldedCheckpointFuture {
    polled: bool,
}

impl Future for CancelShieldedCheckpointFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.polled {
            return Poll::Ready(());
        }
        self.polled = true;
        runloop::with_current_record(|rec| {
            rec.last_trap.set(Some(Trap::CancelShieldedCheckpoint));
        });
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}

/// Raises `Cancelled` immediately if the current task's effective
/// cancellation state (§4.C) is already true, without yielding to the
/// scheduler. Also the delivery point for a pending host interrupt (§4.I):
/// checked first, since it is edge-triggered and unrelated to any cancel
/// scope's own state. Does not introduce a schedule point by itself.
pub fn checkpoint_if_cancelled() -> Result<(), TaskError> {
    if crate::signal::take_interrupt() {
        return Err(TaskError::Interrupted);
    }
    if runloop::with_kernel(|k| k.borrow().effective_cancelled(runloop::current_task_id())) {
        Err(TaskError::Cancelled)
    } else {
        Ok(())
    }
}

/// A full checkpoint: both a cancel point and a schedule point, as defined
/// by the Glossary.
pub async fn checkpoint() -> Result<(), TaskError> {
    checkpoint_if_cancelled()?;
    cancel_shielded_checkpoint().await;
    Ok(())
}

/// The lowest-level wait primitive (§9): parks the current task, installing
/// `abort_func` so the cancellation walk can try to interrupt the wait.
/// Some "someone" is expected to call `reschedule` on this task later;
/// most callers should use `park.rs`, `clock.rs`'s sleep, or `io.rs`
/// instead of calling this directly.
pub async fn wait_task_rescheduled(abort_func: AbortFunc) -> Outcome<()> {
    WaitTaskRescheduledFuture {
        abort_func: Some(abort_func),
        polled: false,
    }
    .await
}

struct WaitTaskRescheduledFuture {
    abort_func: Option<AbortFunc>,
    polled: bool,
}

impl Future for WaitTaskRescheduledFuture {
    type Output = Outcome<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Outcome<()>> {
        if !self.polled {
            self.polled = true;
            let abort_func = self.abort_func.take().expect("abort_func polled twice");
            runloop::with_current_record(|rec| {
                *rec.abort_func.borrow_mut() = Some(abort_func);
                rec.last_trap.set(Some(Trap::WaitTaskRescheduled));
            });
            // The waker is installed implicitly: whatever woke this task
            // goes through `Kernel::reschedule`, which is what actually
            // re-enqueues the task id and fills `resume`. This future's
            // own waker is never invoked directly by scheduler code, only
            // by anything outside the kernel that holds a clone of it
            // (e.g. the foreign-thread queue).
            let _ = cx.waker();
            Poll::Pending
        } else {
            let outcome = runloop::with_current_record(|rec| {
                rec.resume
                    .borrow_mut()
                    .take()
                    .expect("task resumed without a resume value")
            });
            Poll::Ready(outcome)
        }
    }
}

/// Reschedules `task` directly from the loop thread (§6's public kernel
/// API): the synchronous counterpart to `ForeignHandle::reschedule` for
/// code that, unlike a foreign thread, is already running on the loop and
/// doesn't need to queue through the foreign-job channel. The primitive
/// any custom wait built on `wait_task_rescheduled` calls to wake the task
/// it parked — the way `io.rs`'s readiness dispatch and `clock.rs`'s
/// deadline firing already do internally, just made directly callable.
///
/// Always takes `Outcome<()>`: the resume slot `wait_task_rescheduled`
/// hands back is `()` for every waiter in this crate, so a real payload
/// travels through data the waiter captured before parking (a shared
/// `Rc<RefCell<_>>`, or `park.rs`'s own `custom_sleep_data`), never through
/// this call's `outcome` itself.
pub fn reschedule(task: TaskId, outcome: Outcome<()>) {
    runloop::with_kernel(|k| k.borrow_mut().reschedule(task, outcome));
}
