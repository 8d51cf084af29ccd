//! Blocking pool.
//!
//! `spawn_blocking` is how a task body calls out to work that can't be
//! cooperative (hashing, a blocking filesystem call, compression). Unlike
//! the teacher's `ThreadPool::spawn`, the caller never condvar-blocks the
//! loop thread waiting for the result — that would stall every other task
//! in the kernel. Instead the submitted closure reports its result back
//! through `ForeignHandle`, the same cross-thread handoff the I/O backend's
//! self-pipe trick and any other foreign-thread caller use (§5), and the
//! waiting task is an ordinary parked task until that reschedule arrives.
//! The work-stealing queue structure itself — per-worker local deques
//! backed by a shared `Injector`, one condvar wakeup per submission — is
//! kept exactly as the teacher built it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::{self, JoinHandle as StdJoinHandle};

use crossbeam_deque::{Injector, Stealer, Worker};
use parking_lot::{Condvar, Mutex};

use crate::error::TaskError;
use crate::runloop;
use crate::task::{self, Abort};

type BoxedJob = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    global_queue: Injector<BoxedJob>,
    stealers: Vec<Stealer<BoxedJob>>,
    active_jobs: AtomicUsize,
    shutdown: AtomicBool,
    job_available: Condvar,
    job_mutex: Mutex<()>,
    num_workers: usize,
}

impl PoolInner {
    fn find_job(&self, local: &Worker<BoxedJob>, worker_id: usize) -> Option<BoxedJob> {
        if let Some(job) = local.pop() {
            return Some(job);
        }

        loop {
            match self.global_queue.steal() {
                crossbeam_deque::Steal::Success(job) => return Some(job),
                crossbeam_deque::Steal::Empty => break,
                crossbeam_deque::Steal::Retry => continue,
            }
        }

        for i in 0..self.stealers.len() {
            let idx = (worker_id + i + 1) % self.stealers.len();
            if idx == worker_id {
                continue;
            }
            loop {
                match self.stealers[idx].steal() {
                    crossbeam_deque::Steal::Success(job) => return Some(job),
                    crossbeam_deque::Steal::Empty => break,
                    crossbeam_deque::Steal::Retry => continue,
                }
            }
        }

        None
    }
}

/// The fixed-size worker pool a kernel owns for `spawn_blocking`. Sized at
/// `run()` time from `RuntimeConfig::with_blocking_pool_size`; never grows.
pub(crate) struct BlockingPool {
    inner: Arc<PoolInner>,
    workers: StdMutex<Vec<StdJoinHandle<()>>>,
}

impl BlockingPool {
    pub(crate) fn new(num_workers: usize) -> Self {
        let num_workers = num_workers.max(1);
        let local_queues: Vec<Worker<BoxedJob>> =
            (0..num_workers).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<BoxedJob>> =
            local_queues.iter().map(|w| w.stealer()).collect();

        let inner = Arc::new(PoolInner {
            global_queue: Injector::new(),
            stealers,
            active_jobs: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            job_available: Condvar::new(),
            job_mutex: Mutex::new(()),
            num_workers,
        });

        let mut workers = Vec::with_capacity(num_workers);
        for (worker_id, local_queue) in local_queues.into_iter().enumerate() {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("blocking-pool-{worker_id}"))
                .spawn(move || worker_loop(inner, local_queue, worker_id))
                .expect("failed to spawn blocking pool worker");
            workers.push(handle);
        }

        Self {
            inner,
            workers: StdMutex::new(workers),
        }
    }

    /// Queue `job` for execution on some worker thread. Never blocks the
    /// calling (loop) thread.
    pub(crate) fn submit(&self, job: BoxedJob) {
        self.inner.active_jobs.fetch_add(1, Ordering::AcqRel);
        self.inner.global_queue.push(job);
        self.inner.job_available.notify_one();
    }

    pub(crate) fn num_workers(&self) -> usize {
        self.inner.num_workers
    }

    pub(crate) fn active_jobs(&self) -> usize {
        self.inner.active_jobs.load(Ordering::Relaxed)
    }
}

impl Drop for BlockingPool {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.job_available.notify_all();
        let mut workers = self.workers.lock().unwrap();
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>, local: Worker<BoxedJob>, worker_id: usize) {
    loop {
        if let Some(job) = inner.find_job(&local, worker_id) {
            job();
            inner.active_jobs.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }

        let mut guard = inner.job_mutex.lock();
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        if let Some(job) = inner.find_job(&local, worker_id) {
            drop(guard);
            job();
            inner.active_jobs.fetch_sub(1, Ordering::AcqRel);
            continue;
        }
        inner
            .job_available
            .wait_for(&mut guard, std::time::Duration::from_millis(5));
    }
}

/// Runs `f` on the blocking pool and suspends the calling task until it
/// finishes. A panic inside `f` surfaces as `TaskError::Panicked`, the same
/// as a panic inside an ordinary task body. Not itself cancellable (§4's
/// blocking-pool note): the OS thread keeps running `f` to completion
/// either way, mirroring trio's `to_thread.run_sync(cancellable=False)`
/// default.
pub async fn spawn_blocking<F, T>(f: F) -> Result<T, TaskError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let waiting_task = runloop::current_task_id();
    let foreign = runloop::foreign_handle();
    let slot: Arc<StdMutex<Option<Result<T, TaskError>>>> = Arc::new(StdMutex::new(None));
    let slot_for_worker = slot.clone();

    let job: BoxedJob = Box::new(move || {
        let outcome = crate::result::capture(f);
        *slot_for_worker.lock().unwrap() = Some(outcome.unwrap());
        foreign.reschedule(waiting_task, crate::result::Outcome::Value(()));
    });

    runloop::with_kernel(|k| k.borrow().blocking_pool().submit(job));

    task::wait_task_rescheduled(Box::new(|_raise_cancel| Abort::Failed))
        .await
        .unwrap()?;

    let result = slot
        .lock()
        .unwrap()
        .take()
        .expect("blocking job finished without recording a result");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_executes_submitted_jobs() {
        let pool = BlockingPool::new(2);
        let slot = Arc::new(StdMutex::new(None));
        let slot_for_job = slot.clone();
        pool.submit(Box::new(move || {
            *slot_for_job.lock().unwrap() = Some(42);
        }));

        for _ in 0..200 {
            if slot.lock().unwrap().is_some() {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(*slot.lock().unwrap(), Some(42));
    }

    #[test]
    fn spawn_blocking_returns_value() {
        let result = runloop::run(runloop::RuntimeConfig::new(), || async {
            spawn_blocking(|| 2 + 2).await
        });
        assert_eq!(result.unwrap(), 4);
    }

    #[test]
    fn spawn_blocking_propagates_panics() {
        let result: Result<i32, TaskError> =
            runloop::run(runloop::RuntimeConfig::new(), || async {
                spawn_blocking(|| -> i32 { panic!("blocking boom") }).await
            });
        assert!(matches!(result, Err(TaskError::Panicked(_))));
    }
}
