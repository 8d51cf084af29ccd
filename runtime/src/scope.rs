//! Cancel scope tree (component C).
//!
//! Scopes nest per-task: each task carries its own stack of the scope ids
//! it has entered, and cancellation is evaluated innermost-outward against
//! that stack (the effective-cancel rule, §4.C), stopping at the first
//! `shield`. Unlike Python's `with` statement, Rust has no implicit
//! exception channel for a block to propagate through, so a scope is
//! entered with a closure rather than a context manager: `CancelScope::run`
//! takes the body, runs it, and inspects the `Result` it returns to decide
//! whether to swallow a `Cancelled` this scope raised or let anything else
//! pass through untouched. Stack bookkeeping itself (push on entry, pop on
//! exit, membership) is still an RAII guard, so it runs on every exit path
//! including an early return or a panic unwinding through the closure.

use std::cell::Cell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::TaskError;
use crate::runloop;

/// Opaque, monotonically increasing scope identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(u64);

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

impl ScopeId {
    fn next() -> Self {
        ScopeId(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Construct a `ScopeId` with an explicit value, for tests.
    pub fn from_raw(id: u64) -> Self {
        ScopeId(id)
    }
}

/// When a scope's deadline fires, if at all.
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    Never,
    At(Instant),
}

impl Deadline {
    pub fn after(d: Duration, now: Instant) -> Self {
        Deadline::At(now + d)
    }
}

/// Kernel-internal state for one open cancel scope.
pub(crate) struct CancelScopeState {
    pub id: ScopeId,
    pub deadline: Cell<Deadline>,
    pub shield: Cell<bool>,
    pub cancel_called: Cell<bool>,
    pub cancelled_caught: Cell<bool>,
}

impl CancelScopeState {
    fn new(id: ScopeId, deadline: Deadline, shield: bool) -> Self {
        Self {
            id,
            deadline: Cell::new(deadline),
            shield: Cell::new(shield),
            cancel_called: Cell::new(false),
            cancelled_caught: Cell::new(false),
        }
    }
}

/// Handle given to a scope's body, letting it inspect or mutate the scope
/// it is running inside of. Cheap to clone; stays valid after `run`
/// returns so callers can inspect `cancelled_caught` afterwards the way
/// trio callers inspect `scope.cancelled_caught` after a `with` block.
#[derive(Clone)]
pub struct ScopeHandle {
    id: ScopeId,
}

impl ScopeHandle {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Request cancellation of everything inside this scope (§4.C). Takes
    /// effect at each member task's next checkpoint, not immediately.
    pub fn cancel(&self) {
        runloop::with_kernel(|k| {
            if let Some(state) = k.borrow().scopes.get(&self.id) {
                state.cancel_called.set(true);
            }
        });
    }

    pub fn cancel_called(&self) -> bool {
        runloop::with_kernel(|k| {
            k.borrow()
                .scopes
                .get(&self.id)
                .map(|s| s.cancel_called.get())
                .unwrap_or(false)
        })
    }

    pub fn cancelled_caught(&self) -> bool {
        runloop::with_kernel(|k| {
            k.borrow()
                .scopes
                .get(&self.id)
                .map(|s| s.cancelled_caught.get())
                .unwrap_or(false)
        })
    }

    pub fn set_shield(&self, shield: bool) {
        runloop::with_kernel(|k| {
            if let Some(state) = k.borrow().scopes.get(&self.id) {
                state.shield.set(shield);
            }
        });
    }

    pub fn shield(&self) -> bool {
        runloop::with_kernel(|k| {
            k.borrow()
                .scopes
                .get(&self.id)
                .map(|s| s.shield.get())
                .unwrap_or(false)
        })
    }

    /// Move the deadline, re-registering it with the deadline heap.
    pub fn set_deadline(&self, deadline: Deadline) {
        runloop::with_kernel(|k| {
            let mut kernel = k.borrow_mut();
            if let Some(state) = kernel.scopes.get(&self.id) {
                state.deadline.set(deadline);
            }
            kernel.reindex_deadline(self.id, deadline);
        });
    }
}

/// What `CancelScope::run` returns: either the body's own value, or a
/// record that this scope caught and swallowed its own `Cancelled`.
pub struct CancelOutcome<T> {
    pub value: Option<T>,
    pub cancelled_caught: bool,
}

/// RAII guard performing the scope's exit bookkeeping: pop from the
/// owning task's scope stack and remove the scope from the kernel's scope
/// table, on every exit path. Asserts the scope being dropped is the
/// innermost one on its owning task's stack (§4.C: "only in LIFO order"),
/// escalating a violation to a kernel bug rather than silently
/// misordering the stack.
struct ScopeGuard {
    id: ScopeId,
    owning_task: crate::task::TaskId,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        runloop::with_kernel(|k| {
            let mut k = k.borrow_mut();
            if let Some(rec) = k.tasks.get(&self.owning_task) {
                let mut stack = rec.scope_stack.borrow_mut();
                match stack.last() {
                    Some(top) if *top == self.id => {
                        stack.pop();
                    }
                    _ => {
                        drop(stack);
                        k.fatal(format!(
                            "scope {:?} dropped out of LIFO order on {:?}",
                            self.id, self.owning_task
                        ));
                        return;
                    }
                }
            }
            k.scopes.remove(&self.id);
            k.deadlines.cancel(self.id);
        });
    }
}

/// Builder for opening a cancel scope. Mirrors `open_cancel_scope`'s
/// keyword arguments (§6) as builder methods.
#[derive(Default)]
pub struct CancelScopeBuilder {
    deadline: Option<Deadline>,
    shield: bool,
}

impl CancelScopeBuilder {
    pub fn new() -> Self {
        Self {
            deadline: None,
            shield: false,
        }
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn shield(mut self, shield: bool) -> Self {
        self.shield = shield;
        self
    }

    /// Enter the scope, run `body`, and apply the exit rule (§4.C):
    ///
    /// - `body` returns `Ok(v)` → `CancelOutcome { value: Some(v), cancelled_caught: false }`.
    /// - `body` returns `Err(Cancelled)` and *this* scope's `cancel_called`
    ///   is set → swallowed: `CancelOutcome { value: None, cancelled_caught: true }`.
    /// - `body` returns `Err(Cancelled)` from an outer scope, or any other
    ///   error → passed through unchanged as `Err`.
    pub async fn run<F, Fut, T>(self, body: F) -> Result<CancelOutcome<T>, TaskError>
    where
        F: FnOnce(ScopeHandle) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
    {
        let deadline = self.deadline.unwrap_or(Deadline::Never);
        let id = ScopeId::next();
        let owning_task = runloop::current_task_id();

        runloop::with_kernel(|k| {
            let mut k = k.borrow_mut();
            let state = CancelScopeState::new(id, deadline, self.shield);
            if let Deadline::At(at) = deadline {
                k.deadlines.set(id, at);
            }
            k.scopes.insert(id, std::rc::Rc::new(state));
            if let Some(rec) = k.tasks.get(&owning_task) {
                rec.scope_stack.borrow_mut().push(id);
            }
        });

        let guard = ScopeGuard { id, owning_task };
        let handle = ScopeHandle { id };

        let result = body(handle.clone()).await;

        let cancel_called = handle.cancel_called();
        let outcome = match result {
            Ok(v) => CancelOutcome {
                value: Some(v),
                cancelled_caught: false,
            },
            Err(TaskError::Cancelled) if cancel_called => {
                runloop::with_kernel(|k| {
                    if let Some(state) = k.borrow().scopes.get(&id) {
                        state.cancelled_caught.set(true);
                    }
                });
                CancelOutcome {
                    value: None,
                    cancelled_caught: true,
                }
            }
            Err(other) => {
                drop(guard);
                return Err(other);
            }
        };

        drop(guard);
        Ok(outcome)
    }
}

/// Convenience constructor, mirroring `open_cancel_scope` (§6).
pub fn open_cancel_scope() -> CancelScopeBuilder {
    CancelScopeBuilder::new()
}

/// `move_on_after(d).run(...)`: a scope that cancels its body once `d` has
/// elapsed, silently swallowing the resulting `Cancelled` (§5 sugar).
pub fn move_on_after(d: Duration) -> CancelScopeBuilder {
    let now = runloop::with_kernel(|k| k.borrow().clock.now());
    CancelScopeBuilder::new().deadline(Deadline::after(d, now))
}

/// `move_on_at(instant)`: as `move_on_after`, but for an absolute deadline.
pub fn move_on_at(at: Instant) -> CancelScopeBuilder {
    CancelScopeBuilder::new().deadline(Deadline::At(at))
}

/// Returns true if `task`'s effective cancellation state is currently set:
/// walk its scope stack innermost-to-outermost, stopping at the first
/// shielded scope, looking for any `cancel_called` scope before that point
/// (§4.C).
pub(crate) fn effective_cancelled(
    scopes: &std::collections::HashMap<ScopeId, std::rc::Rc<CancelScopeState>>,
    scope_stack: &[ScopeId],
) -> bool {
    for &id in scope_stack.iter().rev() {
        let Some(state) = scopes.get(&id) else {
            continue;
        };
        if state.shield.get() {
            return false;
        }
        if state.cancel_called.get() {
            return true;
        }
    }
    false
}
