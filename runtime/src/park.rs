//! Parking lot (component B).
//!
//! An intrusive FIFO of parked tasks keyed by an opaque token. Higher-level
//! waits (deadline sleep, I/O readiness) are built on top of a `ParkingLot`
//! rather than reimplementing queuing themselves, per §4.B. Unlike the
//! teacher's condvar-based `ScopedTaskInner`, nothing here blocks a thread:
//! parking just records that a task is waiting and woke it means "make it
//! runnable again", both done from the single loop thread.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::TaskError;
use crate::task::{Abort, TaskId};

/// One parked task, plus whatever bookkeeping the waiter that parked it
/// wants to keep around without the lot needing to know its shape —
/// mirrors the original's `task.custom_sleep_data`.
pub struct Parked {
    pub task: TaskId,
    pub custom_sleep_data: Option<Box<dyn Any>>,
}

/// FIFO queue of parked tasks. Owned by whatever subsystem publishes it
/// (a scope's deadline wait, an I/O readiness entry, or a nursery's
/// `start` rendezvous) — the lot itself has no notion of what it's for.
#[derive(Default)]
pub struct ParkingLot {
    queue: VecDeque<Parked>,
}

impl ParkingLot {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
        }
    }

    /// Record that `task` is waiting here.
    pub fn park(&mut self, task: TaskId, custom_sleep_data: Option<Box<dyn Any>>) {
        self.queue.push_back(Parked {
            task,
            custom_sleep_data,
        });
    }

    /// Pop and return the longest-waiting parked task, if any.
    pub fn unpark(&mut self) -> Option<Parked> {
        self.queue.pop_front()
    }

    /// Pop and return every parked task, oldest first.
    pub fn unpark_all(&mut self) -> Vec<Parked> {
        self.queue.drain(..).collect()
    }

    /// Remove a specific task from the queue (used when a wait is aborted
    /// out from under the lot, e.g. by cancellation).
    pub fn remove(&mut self, task: TaskId) -> Option<Parked> {
        let pos = self.queue.iter().position(|p| p.task == task)?;
        self.queue.remove(pos)
    }

    /// Move every waiter in `self` onto the back of `other`, preserving
    /// FIFO order across the merge. Used when a resource is replaced but
    /// its waiters should carry over (§4.B "repark").
    pub fn repark_all(&mut self, other: &mut ParkingLot) {
        other.queue.extend(self.queue.drain(..));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Parks the current task in `lot` and actually suspends it there,
/// realizing the "`park(task, custom_data)` → suspends" half of §4.B's
/// contract that `ParkingLot::park` alone only bookkeeps. Cancelling the
/// wait removes the task from `lot` before the cancellation propagates, so
/// a torn-down wait never leaves a stale entry for a later `unpark` to
/// resolve into nothing. Whoever holds `lot` wakes this task the ordinary
/// way: `unpark()`/`unpark_all()` followed by `reschedule`.
pub async fn park_and_wait(
    lot: Rc<RefCell<ParkingLot>>,
    custom_sleep_data: Option<Box<dyn Any>>,
) -> Result<(), TaskError> {
    let task = crate::task::current_task().id();
    lot.borrow_mut().park(task, custom_sleep_data);

    let abort_lot = lot.clone();
    crate::task::wait_task_rescheduled(Box::new(move |_raise_cancel| {
        abort_lot.borrow_mut().remove(task);
        Abort::Succeeded
    }))
    .await
    .unwrap()
}
