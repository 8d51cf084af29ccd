//! Run loop (component F).
//!
//! Drives runnable tasks, services traps, delivers cancellations. Keeps
//! the teacher's `executor.rs` entry points (`spawn`, `block_on`,
//! `yield_now`) in name and purpose, reimplemented around `Future` polling
//! on a single `Rc<RefCell<Kernel>>` instead of spawning an OS thread per
//! task (Non-goals, §1: no work-stealing across kernel threads).
//!
//! The one invariant every function in this module upholds: never hold
//! `Kernel`'s `RefCell` borrowed across a `Future::poll` call. A task's
//! body is polled with the borrow released, so the body's own checkpoints
//! and scope/nursery calls can re-borrow the kernel freely. Anything that
//! *does* try to re-borrow while already borrowed (an abort function
//! misbehaving, or a genuine kernel bug) hits `RefCell`'s own
//! double-borrow panic, caught at the top of `run()` and reported as
//! `TaskError::Kernel`.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
use std::time::Duration;

use crate::blocking::BlockingPool;
use crate::clock::{Clock, DeadlineHeap, SystemClock};
use crate::error::{KernelError, TaskError};
use crate::instrument::Instrument;
use crate::io::{Interest, NullBackend, ReadinessBackend};
use crate::nursery::NurseryInner;
use crate::result::Outcome;
use crate::scope::{CancelScopeState, Deadline, ScopeId};
use crate::task::{PolledTask, TaskFuture, TaskId, TaskRecord, TaskState};

thread_local! {
    static CURRENT_KERNEL: RefCell<Option<Rc<RefCell<Kernel>>>> = RefCell::new(None);
    static CURRENT_TASK: Cell<Option<TaskId>> = Cell::new(None);
}

/// Calls `f` with the active kernel. Panics if called outside `run()` — a
/// kernel bug if it ever happens, since every public API that reaches this
/// is only callable from within a task body.
pub(crate) fn with_kernel<R>(f: impl FnOnce(&Rc<RefCell<Kernel>>) -> R) -> R {
    CURRENT_KERNEL.with(|c| {
        let guard = c.borrow();
        let kernel = guard.as_ref().expect("no kernel active on this thread");
        f(kernel)
    })
}

pub(crate) fn current_task_id() -> TaskId {
    CURRENT_TASK
        .with(|c| c.get())
        .expect("current_task_id() called outside a task body")
}

/// Calls `f` with the `TaskRecord` of the task currently being polled.
pub(crate) fn with_current_record<R>(f: impl FnOnce(&TaskRecord) -> R) -> R {
    let id = current_task_id();
    with_kernel(|k| {
        let kernel = k.borrow();
        let rec = kernel.tasks.get(&id).expect("current task missing from table");
        f(rec)
    })
}

/// Registers a new child task into `nursery`, inheriting the spawning
/// task's current scope stack (§4.E: children see every scope open at the
/// call site, including the nursery's own internal scope).
pub(crate) fn spawn_child<Fut>(nursery: Rc<NurseryInner>, body: Fut)
where
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    let host = current_task_id();
    let scope_stack = with_kernel(|k| {
        k.borrow()
            .tasks
            .get(&host)
            .map(|rec| rec.scope_stack.borrow().clone())
            .unwrap_or_default()
    });

    let id = TaskId::next();
    let boxed: Box<dyn PolledTask> = Box::new(TaskFuture::new(body));
    let rec = Rc::new(TaskRecord::new(id, None, scope_stack, boxed));
    *rec.nursery.borrow_mut() = Some(Rc::downgrade(&nursery));
    nursery.child_spawned();

    with_kernel(|k| {
        let mut kernel = k.borrow_mut();
        kernel.instrument_task_spawned(id);
        kernel.tasks.insert(id, rec);
        kernel.run_queue.push_back(id);
        kernel.instrument_task_scheduled(id);
    });
}

/// As `spawn_child`, but additionally installs a fail hook invoked by the
/// run loop if the child finishes without resolving a pending `start()`
/// rendezvous (the child never called `task_status.started()`).
pub(crate) fn spawn_child_with_start_hook<Fut>(
    nursery: Rc<NurseryInner>,
    body: Fut,
    fail_hook: Box<dyn FnOnce(TaskError)>,
) where
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    let host = current_task_id();
    let scope_stack = with_kernel(|k| {
        k.borrow()
            .tasks
            .get(&host)
            .map(|rec| rec.scope_stack.borrow().clone())
            .unwrap_or_default()
    });

    let id = TaskId::next();
    let boxed: Box<dyn PolledTask> = Box::new(TaskFuture::new(body));
    let rec = Rc::new(TaskRecord::new(id, None, scope_stack, boxed));
    *rec.nursery.borrow_mut() = Some(Rc::downgrade(&nursery));
    *rec.start_fail_hook.borrow_mut() = Some(fail_hook);
    nursery.child_spawned();

    with_kernel(|k| {
        let mut kernel = k.borrow_mut();
        kernel.instrument_task_spawned(id);
        kernel.tasks.insert(id, rec);
        kernel.run_queue.push_back(id);
        kernel.instrument_task_scheduled(id);
    });
}

/// Spawns a task outside of any nursery (§6's public kernel API). A
/// system task has no parent scope to cancel into if it fails: an
/// escaping error is treated as a `KernelError` and unwinds the whole
/// `run()` call, the same as any other scheduler-internal invariant
/// violation (`Kernel::finish_task`'s root-or-system branch). Meant for
/// scheduler-adjacent bookkeeping tasks the host wants alive for the
/// whole run, not for ordinary application work (`open_nursery` is the
/// structured-concurrency entry point for that).
pub fn spawn_system_task<F, Fut>(body: F) -> crate::task::TaskHandle
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), TaskError>> + 'static,
{
    let host = current_task_id();
    let scope_stack = with_kernel(|k| {
        k.borrow()
            .tasks
            .get(&host)
            .map(|rec| rec.scope_stack.borrow().clone())
            .unwrap_or_default()
    });

    let id = TaskId::next();
    let boxed: Box<dyn PolledTask> = Box::new(TaskFuture::new(body()));
    let rec = Rc::new(TaskRecord::new(id, Some("system".to_string()), scope_stack, boxed));

    with_kernel(|k| {
        let mut kernel = k.borrow_mut();
        kernel.instrument_task_spawned(id);
        kernel.tasks.insert(id, rec);
        kernel.run_queue.push_back(id);
        kernel.instrument_task_scheduled(id);
    });

    crate::task::TaskHandle::new(id)
}

/// Builder-style runtime configuration: the clock override, instrument
/// list, I/O poll default timeout, and blocking-pool sizing that `run()`
/// accepts (ambient-stack note, §1).
pub struct RuntimeConfig {
    clock: Box<dyn Clock>,
    io: Box<dyn ReadinessBackend>,
    instruments: Vec<Box<dyn Instrument>>,
    default_poll_timeout: Duration,
    blocking_pool_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            clock: Box::new(SystemClock),
            io: Box::new(NullBackend),
            instruments: Vec::new(),
            default_poll_timeout: Duration::from_millis(100),
            blocking_pool_size: 4,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_io_backend(mut self, io: Box<dyn ReadinessBackend>) -> Self {
        self.io = io;
        self
    }

    pub fn with_instrument(mut self, instrument: Box<dyn Instrument>) -> Self {
        self.instruments.push(instrument);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.default_poll_timeout = timeout;
        self
    }

    pub fn with_blocking_pool_size(mut self, size: usize) -> Self {
        self.blocking_pool_size = size;
        self
    }

    pub(crate) fn blocking_pool_size(&self) -> usize {
        self.blocking_pool_size
    }
}

type ForeignJob = Box<dyn FnOnce(&mut Kernel) + Send>;

/// Kernel-internal scheduler state. Lives behind a single
/// `Rc<RefCell<_>>` local to the thread running `run()` (§3 `[FULL]`); the
/// only fields ever touched off that thread are `foreign_queue` and the
/// signal gate's flag (`signal.rs`), both with their own synchronization.
pub(crate) struct Kernel {
    pub tasks: HashMap<TaskId, Rc<TaskRecord>>,
    run_queue: VecDeque<TaskId>,
    pub scopes: HashMap<ScopeId, Rc<CancelScopeState>>,
    pub deadlines: DeadlineHeap,
    pub clock: Box<dyn Clock>,
    io: Box<dyn ReadinessBackend>,
    pub(crate) io_waiters: HashMap<(std::os::unix::io::RawFd, Interest), TaskId>,
    instruments: Vec<Box<dyn Instrument>>,
    foreign_queue: Arc<Mutex<VecDeque<ForeignJob>>>,
    blocking_pool: BlockingPool,
    default_poll_timeout: Duration,
    root_task: Option<TaskId>,
    fatal_error: Option<TaskError>,
}

impl Kernel {
    fn new(config: RuntimeConfig) -> Self {
        let blocking_pool = BlockingPool::new(config.blocking_pool_size());
        let default_poll_timeout = config.default_poll_timeout;
        Self {
            tasks: HashMap::new(),
            run_queue: VecDeque::new(),
            scopes: HashMap::new(),
            deadlines: DeadlineHeap::new(),
            clock: config.clock,
            io: config.io,
            io_waiters: HashMap::new(),
            instruments: config.instruments,
            foreign_queue: Arc::new(Mutex::new(VecDeque::new())),
            blocking_pool,
            default_poll_timeout,
            root_task: None,
            fatal_error: None,
        }
    }

    pub(crate) fn io(&mut self) -> &mut dyn ReadinessBackend {
        self.io.as_mut()
    }

    pub(crate) fn blocking_pool(&self) -> &BlockingPool {
        &self.blocking_pool
    }

    fn instrument_task_spawned(&self, task: TaskId) {
        crate::instrument::dispatch(&self.instruments, |i| i.task_spawned(task));
    }

    fn instrument_task_scheduled(&self, task: TaskId) {
        crate::instrument::dispatch(&self.instruments, |i| i.task_scheduled(task));
    }

    /// Marks `task` runnable and sets the value it should resume with.
    /// This is the kernel's half of "reschedule" (§9): "someone" who
    /// arranged to wake a parked task calls this.
    pub(crate) fn reschedule(&mut self, task: TaskId, outcome: Outcome<()>) {
        let Some(rec) = self.tasks.get(&task) else {
            return;
        };
        if rec.state.get() == TaskState::Done {
            return;
        }
        *rec.resume.borrow_mut() = Some(outcome);
        rec.state.set(TaskState::Runnable);
        self.run_queue.push_back(task);
        self.instrument_task_scheduled(task);
    }

    fn mark_runnable(&mut self, task: TaskId) {
        if let Some(rec) = self.tasks.get(&task) {
            if rec.state.get() != TaskState::Done && rec.state.get() != TaskState::Runnable {
                rec.state.set(TaskState::Runnable);
                self.run_queue.push_back(task);
                self.instrument_task_scheduled(task);
            }
        }
    }

    pub(crate) fn effective_cancelled(&self, task: TaskId) -> bool {
        let Some(rec) = self.tasks.get(&task) else {
            return false;
        };
        crate::scope::effective_cancelled(&self.scopes, &rec.scope_stack.borrow())
    }

    /// Attempts to abort one parked task's wait. Calls its abort function
    /// at most once (§9): `Succeeded` reschedules it with `Cancelled`
    /// immediately; `Failed` leaves it parked, "someone" still owes it a
    /// `reschedule`.
    fn try_abort(&mut self, task: TaskId) {
        let Some(rec) = self.tasks.get(&task).cloned() else {
            return;
        };
        if rec.state.get() != TaskState::Parked {
            return;
        }
        let Some(abort_func) = rec.abort_func.borrow_mut().take() else {
            return;
        };
        let raise_cancel: crate::task::RaiseCancel = Rc::new(|| TaskError::Cancelled);
        match abort_func(raise_cancel) {
            crate::task::Abort::Succeeded => {
                self.reschedule(task, Outcome::Error(TaskError::Cancelled));
            }
            crate::task::Abort::Failed => {
                // Wait continues; nothing left for the sweep to do until
                // whatever it's waiting on actually resolves.
            }
        }
    }

    /// Deterministic cancellation walk (§4.F): every parked task whose
    /// effective cancellation just became true gets its abort function
    /// invoked, in task-id order for reproducibility across runs.
    fn cancellation_sweep(&mut self) {
        let mut parked: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|(_, r)| r.state.get() == TaskState::Parked)
            .map(|(id, _)| *id)
            .collect();
        parked.sort();
        for task in parked {
            if self.effective_cancelled(task) {
                self.try_abort(task);
            }
        }
    }

    /// A scope's deadline has passed: cancel it, same as an explicit
    /// `scope.cancel()`. The next cancellation sweep (same tick) picks up
    /// any parked member tasks.
    fn fire_deadline(&mut self, scope: ScopeId) {
        if let Some(state) = self.scopes.get(&scope) {
            state.cancel_called.set(true);
        }
    }

    pub(crate) fn reindex_deadline(&mut self, scope: ScopeId, deadline: Deadline) {
        match deadline {
            Deadline::Never => self.deadlines.cancel(scope),
            Deadline::At(at) => {
                self.deadlines.set(scope, at);
            }
        }
    }

    fn drain_foreign_queue(&mut self) {
        let jobs: Vec<ForeignJob> = {
            let mut queue = self.foreign_queue.lock().unwrap();
            queue.drain(..).collect()
        };
        for job in jobs {
            job(self);
        }
    }

    /// Escalates a scheduler-internal invariant violation. Recorded as the
    /// run's fatal error rather than raised into any one task, mirroring
    /// trio's `TrioInternalError` treatment (§7): these unwind `run()`.
    pub(crate) fn fatal(&mut self, message: String) {
        tracing::error!(%message, "kernel invariant violated");
        self.fatal_error
            .get_or_insert_with(|| KernelError(message).into());
    }

    fn finish_task(&mut self, task: TaskId, error: Option<TaskError>) {
        crate::instrument::dispatch(&self.instruments, |i| i.task_exited(task));
        let Some(rec) = self.tasks.remove(&task) else {
            return;
        };

        if let Some(hook) = rec.start_fail_hook.borrow_mut().take() {
            if let Some(e) = &error {
                hook(e.clone());
            }
        }

        let nursery_weak = rec.nursery.borrow_mut().take();
        match nursery_weak {
            Some(weak) => match weak.upgrade() {
                Some(nursery) => nursery.child_finished(error),
                None => {
                    if let Some(e) = error {
                        rec.ghostly.set(true);
                        tracing::error!(%task, %e, "ghostly death: error after nursery teardown");
                    }
                }
            },
            None => {
                // Root or system task: any escaping error is fatal to the
                // whole run (§6 `[FULL]`), since there is no sibling scope
                // to cancel into.
                if let Some(e) = error {
                    if Some(task) == self.root_task {
                        self.fatal_error.get_or_insert(e);
                    } else {
                        self.fatal_error.get_or_insert_with(|| {
                            KernelError(format!("system task {task} failed: {e}")).into()
                        });
                    }
                }
            }
        }
    }
}

struct WakeData {
    kernel: Rc<RefCell<Kernel>>,
    task: TaskId,
}

static WAKER_VTABLE: RawWakerVTable =
    RawWakerVTable::new(waker_clone, waker_wake, waker_wake_by_ref, waker_drop);

unsafe fn waker_clone(ptr: *const ()) -> RawWaker {
    let rc = Rc::from_raw(ptr as *const WakeData);
    let cloned = rc.clone();
    std::mem::forget(rc);
    RawWaker::new(Rc::into_raw(cloned) as *const (), &WAKER_VTABLE)
}

unsafe fn waker_wake(ptr: *const ()) {
    let rc = Rc::from_raw(ptr as *const WakeData);
    rc.kernel.borrow_mut().mark_runnable(rc.task);
}

unsafe fn waker_wake_by_ref(ptr: *const ()) {
    let rc = Rc::from_raw(ptr as *const WakeData);
    rc.kernel.borrow_mut().mark_runnable(rc.task);
    std::mem::forget(rc);
}

unsafe fn waker_drop(ptr: *const ()) {
    drop(Rc::from_raw(ptr as *const WakeData));
}

/// Built exclusively for driving a task's own `poll` step; never handed to
/// code outside this crate. Safe only because every vtable function is
/// exclusively called from the loop thread (see module doc).
fn make_waker(kernel: Rc<RefCell<Kernel>>, task: TaskId) -> Waker {
    let data = Rc::new(WakeData { kernel, task });
    let raw = RawWaker::new(Rc::into_raw(data) as *const (), &WAKER_VTABLE);
    unsafe { Waker::from_raw(raw) }
}

fn run_task_step(kernel: &Rc<RefCell<Kernel>>, task_id: TaskId) {
    let rec = match kernel.borrow().tasks.get(&task_id).cloned() {
        Some(rec) => rec,
        None => return,
    };
    let Some(mut body) = rec.body.borrow_mut().take() else {
        return;
    };
    rec.state.set(TaskState::Running);

    crate::instrument::dispatch(&kernel.borrow().instruments, |i| i.before_task_step(task_id));

    let waker = make_waker(kernel.clone(), task_id);
    let mut cx = Context::from_waker(&waker);

    CURRENT_TASK.with(|c| c.set(Some(task_id)));
    let poll_result = body.poll_step(&mut cx);
    CURRENT_TASK.with(|c| c.set(None));

    crate::instrument::dispatch(&kernel.borrow().instruments, |i| i.after_task_step(task_id));

    match poll_result {
        Poll::Pending => {
            *rec.body.borrow_mut() = Some(body);
            let trap = rec.last_trap.take();
            match trap {
                Some(crate::task::Trap::CancelShieldedCheckpoint) => {
                    // The leaf future already called `wake_by_ref`, which
                    // ran `mark_runnable` synchronously (the kernel was
                    // not borrowed at that point). Nothing left to do.
                }
                Some(crate::task::Trap::WaitTaskRescheduled) => {
                    rec.state.set(TaskState::Parked);
                    let mut kernel_mut = kernel.borrow_mut();
                    if kernel_mut.effective_cancelled(task_id) {
                        kernel_mut.try_abort(task_id);
                    }
                }
                None => {
                    kernel.borrow_mut().fatal(format!(
                        "{task_id} yielded Pending without a recorded trap"
                    ));
                }
            }
        }
        Poll::Ready(error) => {
            rec.state.set(TaskState::Done);
            kernel.borrow_mut().finish_task(task_id, error);
        }
    }
}

fn step(kernel: &Rc<RefCell<Kernel>>) {
    let now = kernel.borrow().clock.now();
    let expired = kernel.borrow_mut().deadlines.pop_expired(now);
    for scope in expired {
        kernel.borrow_mut().fire_deadline(scope);
    }

    kernel.borrow_mut().cancellation_sweep();
    kernel.borrow_mut().drain_foreign_queue();

    let next = kernel.borrow_mut().run_queue.pop_front();
    if let Some(task_id) = next {
        run_task_step(kernel, task_id);
        return;
    }

    if kernel.borrow().clock.is_autojumping() {
        if let Some(next_deadline) = kernel.borrow().deadlines.next_deadline() {
            let now = kernel.borrow().clock.now();
            let delta = next_deadline.saturating_duration_since(now);
            kernel.borrow().clock.advance(delta);
            return;
        }
    }

    let timeout = {
        let k = kernel.borrow();
        k.deadlines
            .next_deadline()
            .map(|d| d.saturating_duration_since(k.clock.now()))
            .unwrap_or(k.default_poll_timeout)
    };

    crate::instrument::dispatch(&kernel.borrow().instruments, |i| {
        i.before_io_wait(Some(timeout))
    });
    let events = {
        let mut k = kernel.borrow_mut();
        k.io().poll(Some(timeout)).unwrap_or_default()
    };
    crate::instrument::dispatch(&kernel.borrow().instruments, |i| i.after_io_wait());

    for event in events {
        let mut k = kernel.borrow_mut();
        let key = (event.fd, event.interest);
        if let Some(task) = k.io_waiters.remove(&key) {
            if event.closed {
                k.reschedule(task, Outcome::Error(crate::io::closed()));
            } else {
                k.reschedule(task, Outcome::Value(()));
            }
        }
    }
}

fn drive(kernel: &Rc<RefCell<Kernel>>) -> Result<(), TaskError> {
    loop {
        {
            let k = kernel.borrow();
            if k.tasks.is_empty() {
                return Ok(());
            }
            if let Some(e) = &k.fatal_error {
                return Err(e.clone());
            }
        }
        step(kernel);
    }
}

/// Runs `root_body` as the root task to completion, returning its value or
/// its escaping error. Re-entrant calls on the same thread panic (Design
/// Notes §9).
pub fn run<F, Fut, T>(config: RuntimeConfig, root_body: F) -> Result<T, TaskError>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = Result<T, TaskError>> + 'static,
    T: 'static,
{
    let already_active = CURRENT_KERNEL.with(|c| c.borrow().is_some());
    if already_active {
        panic!("run() is already active on this thread");
    }

    crate::signal::install();

    let kernel = Rc::new(RefCell::new(Kernel::new(config)));
    CURRENT_KERNEL.with(|c| *c.borrow_mut() = Some(kernel.clone()));

    let result_slot: Rc<RefCell<Option<Result<T, TaskError>>>> = Rc::new(RefCell::new(None));
    let slot_for_body = result_slot.clone();
    let wrapped = async move {
        let r = root_body().await;
        *slot_for_body.borrow_mut() = Some(r);
        Ok(())
    };

    let root_id = TaskId::next();
    let boxed: Box<dyn PolledTask> = Box::new(TaskFuture::new(wrapped));
    let rec = Rc::new(TaskRecord::new(root_id, Some("root".to_string()), Vec::new(), boxed));
    {
        let mut k = kernel.borrow_mut();
        k.root_task = Some(root_id);
        k.tasks.insert(root_id, rec);
        k.run_queue.push_back(root_id);
        k.instrument_task_scheduled(root_id);
    }

    crate::instrument::dispatch(&kernel.borrow().instruments, |i| i.before_run());
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| drive(&kernel)));
    crate::instrument::dispatch(&kernel.borrow().instruments, |i| i.after_run());

    CURRENT_KERNEL.with(|c| *c.borrow_mut() = None);

    match outcome {
        Err(payload) => Err(TaskError::Kernel(KernelError(
            crate::result::PanicPayload(payload).message(),
        ))),
        Ok(Err(e)) => Err(e),
        Ok(Ok(())) => result_slot.borrow_mut().take().unwrap_or_else(|| {
            Err(TaskError::Kernel(KernelError(
                "run loop finished without a root result".to_string(),
            )))
        }),
    }
}

/// A way for code outside the loop thread to reschedule a task — the only
/// legitimate cross-thread mutation boundary (§5). Obtained once up front
/// (e.g. handed to a blocking-pool worker) and cheap to clone. Queued jobs
/// are drained at the start of every tick; a thread with nothing else to
/// do notices within one `default_poll_timeout` window.
#[derive(Clone)]
pub struct ForeignHandle {
    queue: Arc<Mutex<VecDeque<ForeignJob>>>,
}

impl ForeignHandle {
    pub(crate) fn new(kernel: &Kernel) -> Self {
        Self {
            queue: kernel.foreign_queue.clone(),
        }
    }

    /// Queue a reschedule of `task` to run on the loop thread at its next
    /// tick.
    pub fn reschedule(&self, task: TaskId, outcome: Outcome<()>) {
        self.queue
            .lock()
            .unwrap()
            .push_back(Box::new(move |k: &mut Kernel| k.reschedule(task, outcome)));
    }
}

/// Returns a handle other threads can use to reschedule tasks in the
/// currently-running kernel. Must be called from within a task body.
pub fn foreign_handle() -> ForeignHandle {
    with_kernel(|k| ForeignHandle::new(&k.borrow()))
}

/// Cooperative yield: a bare schedule point with no cancellation check,
/// kept under the teacher's `yield_now` name.
pub async fn yield_now() {
    crate::task::cancel_shielded_checkpoint().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_root_value() {
        let result = run(RuntimeConfig::new(), || async { Ok::<i32, TaskError>(7) });
        assert_eq!(result.unwrap(), 7);
    }

    #[test]
    fn run_propagates_root_error() {
        let result: Result<(), TaskError> =
            run(RuntimeConfig::new(), || async { Err(TaskError::Cancelled) });
        assert!(matches!(result, Err(TaskError::Cancelled)));
    }

    #[test]
    fn checkpoint_yields_and_resumes() {
        let result = run(RuntimeConfig::new(), || async {
            crate::task::checkpoint().await?;
            Ok::<i32, TaskError>(1)
        });
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn nursery_runs_children_to_completion() {
        use std::cell::Cell;
        use std::rc::Rc;

        let result = run(RuntimeConfig::new(), || async {
            let ran = Rc::new(Cell::new(0));
            crate::nursery::open_nursery(|nursery| {
                let ran = ran.clone();
                async move {
                    for _ in 0..3 {
                        let ran = ran.clone();
                        nursery.start_soon(move || async move {
                            crate::task::checkpoint().await?;
                            ran.set(ran.get() + 1);
                            Ok(())
                        });
                    }
                    Ok::<(), TaskError>(())
                }
            })
            .await?;
            Ok::<i32, TaskError>(ran.get())
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn task_scheduled_fires_on_spawn_and_on_every_reschedule() {
        use crate::instrument::Instrument;
        use std::cell::Cell;
        use std::rc::Rc;

        struct CountScheduled(Rc<Cell<u32>>);
        impl Instrument for CountScheduled {
            fn task_scheduled(&self, _task: TaskId) {
                self.0.set(self.0.get() + 1);
            }
        }

        let count = Rc::new(Cell::new(0));
        let config = RuntimeConfig::new().with_instrument(Box::new(CountScheduled(count.clone())));
        let result = run(config, || async {
            crate::task::checkpoint().await?;
            crate::task::checkpoint().await?;
            Ok::<(), TaskError>(())
        });
        assert!(result.is_ok());
        // Once for the root task's initial spawn, once per `checkpoint`'s
        // self-reschedule.
        assert!(count.get() >= 3, "expected at least 3 schedulings, got {}", count.get());
    }

    #[test]
    fn system_task_failure_aborts_the_run_as_a_kernel_error() {
        let result = run(RuntimeConfig::new(), || async {
            spawn_system_task(|| async { Err(TaskError::Panicked("boom".to_string())) });
            crate::task::checkpoint().await?;
            crate::task::checkpoint().await?;
            Ok::<(), TaskError>(())
        });
        assert!(matches!(result, Err(TaskError::Kernel(_))));
    }

    #[test]
    fn system_task_success_does_not_disturb_the_root_result() {
        let result = run(RuntimeConfig::new(), || async {
            spawn_system_task(|| async {
                crate::task::checkpoint().await?;
                Ok(())
            });
            Ok::<i32, TaskError>(5)
        });
        assert_eq!(result.unwrap(), 5);
    }

    #[test]
    fn direct_reschedule_wakes_a_parked_task() {
        use std::cell::Cell;
        use std::rc::Rc;

        let result = run(RuntimeConfig::new(), || async {
            let parked_id: Rc<Cell<Option<TaskId>>> = Rc::new(Cell::new(None));
            let parked_id_for_child = parked_id.clone();

            spawn_system_task(move || async move {
                parked_id_for_child.set(Some(crate::task::current_task().id()));
                crate::task::wait_task_rescheduled(Box::new(|_raise_cancel| {
                    crate::task::Abort::Failed
                }))
                .await
                .unwrap()
            });

            // Give the system task a chance to park before rescheduling it.
            crate::task::checkpoint().await?;
            crate::task::checkpoint().await?;

            let id = parked_id.get().expect("system task must have parked by now");
            crate::task::reschedule(id, Outcome::Value(()));

            Ok::<(), TaskError>(())
        });

        assert!(result.is_ok());
    }
}
