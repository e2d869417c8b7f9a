//! Dependency-counted task scheduling.
//!
//! Tasks run either on the rayon worker pool or on the privileged thread,
//! which drains its queue from [`TaskScheduler::run_privileged_tasks`]. A
//! task spawned with dependencies is dispatched by whichever thread
//! resolves its last dependency.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use crossbeam_channel::{Receiver, Sender};

use crate::query::error::{TaskError, TaskResult};
use crate::query::future::{AnyFutureValue, FutureValue};
use crate::sync::lock;

/// Where a task must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskThread {
    /// The single-writer thread that owns executor caches and spawner state.
    Privileged,
    /// Any worker pool thread.
    Worker,
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct SyncQueue {
    tasks: VecDeque<Task>,
    /// Tasks created during the synchronous run whose dependencies have not
    /// resolved yet.
    waiting: Arc<AtomicUsize>,
}

thread_local! {
    static SYNC_QUEUE: RefCell<Option<SyncQueue>> = const { RefCell::new(None) };
}

fn queue_if_synchronous(task: Task) -> Option<Task> {
    SYNC_QUEUE.with(|q| match q.borrow_mut().as_mut() {
        Some(queue) => {
            queue.tasks.push_back(task);
            None
        }
        None => Some(task),
    })
}

fn sync_waiting_counter() -> Option<Arc<AtomicUsize>> {
    SYNC_QUEUE.with(|q| q.borrow().as_ref().map(|s| s.waiting.clone()))
}

struct SyncGuard;

impl Drop for SyncGuard {
    fn drop(&mut self) {
        SYNC_QUEUE.with(|q| *q.borrow_mut() = None);
    }
}

/// Counters for the status log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub worker_tasks: u64,
    pub privileged_tasks: u64,
    pub inline_tasks: u64,
}

struct SchedulerInner {
    pool: rayon::ThreadPool,
    privileged_tx: Sender<Task>,
    privileged_rx: Receiver<Task>,
    privileged_thread: Mutex<Option<ThreadId>>,
    worker_tasks: AtomicU64,
    privileged_tasks: AtomicU64,
    inline_tasks: AtomicU64,
}

#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskScheduler")
            .field("workers", &self.inner.pool.current_num_threads())
            .field("stats", &self.stats())
            .finish()
    }
}

impl TaskScheduler {
    /// `worker_threads == 0` lets rayon pick.
    pub fn new(worker_threads: usize) -> TaskResult<Self> {
        let mut builder = rayon::ThreadPoolBuilder::new().thread_name(|i| format!("voxelgraph-worker-{i}"));
        if worker_threads > 0 {
            builder = builder.num_threads(worker_threads);
        }
        let pool = builder.build()?;
        let (privileged_tx, privileged_rx) = crossbeam_channel::unbounded();
        tracing::debug!("Task scheduler started with {} workers", pool.current_num_threads());

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                pool,
                privileged_tx,
                privileged_rx,
                privileged_thread: Mutex::new(None),
                worker_tasks: AtomicU64::new(0),
                privileged_tasks: AtomicU64::new(0),
                inline_tasks: AtomicU64::new(0),
            }),
        })
    }

    /// Make the calling thread the privileged thread.
    pub fn bind_privileged_thread(&self) {
        let id = std::thread::current().id();
        let previous = lock(&self.inner.privileged_thread).replace(id);
        if previous.is_some_and(|p| p != id) {
            tracing::warn!("Privileged thread rebound from {:?} to {:?}", previous, id);
        }
    }

    pub fn is_privileged_thread(&self) -> bool {
        *lock(&self.inner.privileged_thread) == Some(std::thread::current().id())
    }

    pub fn is_worker_thread(&self) -> bool {
        self.inner.pool.current_thread_index().is_some()
    }

    pub fn num_workers(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            worker_tasks: self.inner.worker_tasks.load(Ordering::Relaxed),
            privileged_tasks: self.inner.privileged_tasks.load(Ordering::Relaxed),
            inline_tasks: self.inner.inline_tasks.load(Ordering::Relaxed),
        }
    }

    /// Run `task` on `thread` as soon as possible.
    pub fn dispatch(&self, thread: TaskThread, task: impl FnOnce() + Send + 'static) {
        let Some(task) = queue_if_synchronous(Box::new(task)) else {
            return;
        };
        match thread {
            TaskThread::Worker => {
                self.inner.worker_tasks.fetch_add(1, Ordering::Relaxed);
                self.inner.pool.spawn(task);
            }
            TaskThread::Privileged => {
                self.inner.privileged_tasks.fetch_add(1, Ordering::Relaxed);
                if self.inner.privileged_tx.send(task).is_err() {
                    tracing::error!("Privileged task queue closed, task dropped");
                }
            }
        }
    }

    /// Run `task` on `thread` once every dependency has resolved.
    pub fn spawn_after(
        &self,
        dependencies: &[&dyn AnyFutureValue],
        thread: TaskThread,
        task: impl FnOnce() + Send + 'static,
    ) {
        let pending: Vec<_> = dependencies.iter().filter(|d| !d.is_resolved()).collect();
        if pending.is_empty() {
            self.dispatch(thread, task);
            return;
        }

        let waiting = sync_waiting_counter();
        if let Some(w) = &waiting {
            w.fetch_add(1, Ordering::AcqRel);
        }

        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        let slot: Arc<Mutex<Option<Task>>> = Arc::new(Mutex::new(Some(Box::new(task))));
        let scheduler = self.clone();
        let fire: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                return;
            }
            if let Some(task) = lock(&slot).take() {
                if let Some(w) = &waiting {
                    w.fetch_sub(1, Ordering::AcqRel);
                }
                scheduler.dispatch(thread, task);
            }
        });

        for dependency in pending {
            let fire = fire.clone();
            dependency.subscribe(Box::new(move || fire()));
        }
    }

    /// Run `f` on `thread` once `input` resolves.
    pub fn then<T, U, F>(&self, input: &FutureValue<T>, thread: TaskThread, f: F) -> FutureValue<U>
    where
        T: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let (output, promise) = FutureValue::pending();
        let source = input.clone();
        self.spawn_after(&[input as &dyn AnyFutureValue], thread, move || {
            if let Some(v) = source.get() {
                promise.resolve(f(v));
            }
        });
        output
    }

    /// Run `f` on `thread` once every input resolves.
    pub fn join_then<T, U, F>(&self, inputs: Vec<FutureValue<T>>, thread: TaskThread, f: F) -> FutureValue<U>
    where
        T: Clone + Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&[T]) -> U + Send + 'static,
    {
        let joined = FutureValue::join_all(inputs);
        self.then(&joined, thread, move |values: &Vec<T>| f(values))
    }

    /// Run `f` on `thread` now.
    pub fn spawn<U, F>(&self, thread: TaskThread, f: F) -> FutureValue<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce() -> U + Send + 'static,
    {
        let (output, promise) = FutureValue::pending();
        self.dispatch(thread, move || {
            promise.resolve(f());
        });
        output
    }

    /// Drain continuations queued for the privileged thread. Binds the
    /// calling thread if none is bound yet.
    pub fn run_privileged_tasks(&self) -> usize {
        {
            let mut bound = lock(&self.inner.privileged_thread);
            let id = std::thread::current().id();
            match *bound {
                None => *bound = Some(id),
                Some(p) if p != id => {
                    tracing::warn!("run_privileged_tasks called off the privileged thread");
                    return 0;
                }
                Some(_) => {}
            }
        }

        let mut ran = 0;
        while let Ok(task) = self.inner.privileged_rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Run `f` and every task it transitively dispatches inline on the
    /// calling thread.
    ///
    /// Tasks whose dependencies are still pending when the queue empties
    /// (for example a compile waiting on the privileged tick) cannot make
    /// progress here; that is reported as [`TaskError::TasksLeft`].
    pub fn run_synchronously<R>(&self, f: impl FnOnce() -> R) -> TaskResult<R> {
        if self.is_worker_thread() {
            tracing::error!("run_synchronously called from a worker thread");
            return Err(TaskError::SynchronousOnWorker);
        }
        if SYNC_QUEUE.with(|q| q.borrow().is_some()) {
            return Ok(f());
        }

        let waiting = Arc::new(AtomicUsize::new(0));
        SYNC_QUEUE.with(|q| {
            *q.borrow_mut() = Some(SyncQueue {
                tasks: VecDeque::new(),
                waiting: waiting.clone(),
            })
        });
        let _guard = SyncGuard;

        let result = f();
        loop {
            let next = SYNC_QUEUE.with(|q| q.borrow_mut().as_mut().and_then(|s| s.tasks.pop_front()));
            let Some(task) = next else {
                break;
            };
            self.inner.inline_tasks.fetch_add(1, Ordering::Relaxed);
            task();
        }

        let left = waiting.load(Ordering::Acquire);
        if left > 0 {
            let err = TaskError::TasksLeft(left);
            tracing::error!("{}", err);
            return Err(err);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scheduler() -> TaskScheduler {
        TaskScheduler::new(2).unwrap()
    }

    #[test]
    fn test_worker_task_resolves() {
        let s = scheduler();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let future = s.spawn(TaskThread::Worker, || 40 + 2);
        future.on_resolved(move |v| {
            let _ = tx.send(*v);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        assert_eq!(s.stats().worker_tasks, 1);
    }

    #[test]
    fn test_privileged_tasks_wait_for_drain() {
        let s = scheduler();
        s.bind_privileged_thread();
        let future = s.spawn(TaskThread::Privileged, || "ran");
        assert!(!future.is_resolved());
        assert_eq!(s.run_privileged_tasks(), 1);
        assert_eq!(future.get(), Some(&"ran"));
    }

    #[test]
    fn test_spawn_after_waits_for_all_dependencies() {
        let s = scheduler();
        let (a, pa) = FutureValue::<i32>::pending();
        let (b, pb) = FutureValue::<i32>::pending();
        let sum = s.run_synchronously(|| {
            let out = s.join_then(vec![a.clone(), b.clone()], TaskThread::Worker, |v| v.iter().sum::<i32>());
            pa.resolve(1);
            pb.resolve(2);
            out
        });
        assert_eq!(sum.unwrap().get(), Some(&3));
    }

    #[test]
    fn test_synchronous_run_reports_tasks_left() {
        let s = scheduler();
        let (never, _promise) = FutureValue::<i32>::pending();
        let result = s.run_synchronously(|| s.then(&never, TaskThread::Worker, |v| *v));
        let err = result.unwrap_err();
        assert!(matches!(err, TaskError::TasksLeft(1)));
        assert_eq!(err.to_string(), "Failed to process tasks synchronously. Tasks left: 1");
    }

    #[test]
    fn test_synchronous_run_refused_on_worker() {
        let s = scheduler();
        let inner = s.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        s.dispatch(TaskThread::Worker, move || {
            let refused = matches!(inner.run_synchronously(|| ()), Err(TaskError::SynchronousOnWorker));
            let _ = tx.send(refused);
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_synchronous_chain_runs_inline() {
        let s = scheduler();
        let result = s
            .run_synchronously(|| {
                let first = s.spawn(TaskThread::Worker, || 2);
                let second = s.then(&first, TaskThread::Privileged, |v| v * 10);
                s.then(&second, TaskThread::Worker, |v| v + 1)
            })
            .unwrap();
        assert_eq!(result.get(), Some(&21));
        assert_eq!(s.stats().inline_tasks, 3);
        assert_eq!(s.stats().worker_tasks, 0);
    }
}
