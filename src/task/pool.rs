//! Fixed worker pool draining the lock-free task queue.
//!
//! Request handling runs here, never on the reactor: the networking layer
//! submits closures with [`WorkerPool::issue`] and resumes immediately.
//! Workers park on a condition variable with a one-second timeout; the
//! periodic wakeup guards against notifications lost between a drain sweep
//! and the wait.

use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use super::queue::{Consumer, TaskQueue};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    task: Task,
    fence: Option<Arc<FenceState>>,
}

// Pool lifecycle. Draining finishes queued work before stopping; Terminating
// stops at the next pop boundary and discards whatever is still queued.
const ACTIVE: u8 = 0;
const DRAINING: u8 = 1;
const TERMINATING: u8 = 2;
const INACTIVE: u8 = 3;

struct Signal {
    mutex: Mutex<()>,
    task_added: Condvar,
}

/// One-shot completion token returned by [`WorkerPool::issue_with_fence`].
pub struct Fence {
    state: Arc<FenceState>,
}

#[derive(Default)]
struct FenceState {
    complete: Mutex<bool>,
    on_complete: Condvar,
}

impl FenceState {
    fn signal(&self) {
        *self
            .complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = true;
        self.on_complete.notify_all();
    }
}

impl Fence {
    /// Block until the fenced task has returned.
    pub fn wait(&self) {
        let mut complete = self
            .state
            .complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*complete {
            complete = self
                .state
                .on_complete
                .wait(complete)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block up to `limit`; returns whether the task completed in time.
    ///
    /// A task discarded by a terminating pool never signals its fence, so
    /// shutdown paths should prefer this over [`Fence::wait`].
    pub fn wait_timeout(&self, limit: Duration) -> bool {
        let mut complete = self
            .state
            .complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let deadline = std::time::Instant::now() + limit;
        while !*complete {
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout) = self
                .state
                .on_complete
                .wait_timeout(complete, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            complete = guard;
        }
        true
    }
}

/// Fixed set of threads executing queued request handlers.
pub struct WorkerPool {
    queue: Arc<TaskQueue<Job>>,
    signal: Arc<Signal>,
    status: Arc<AtomicU8>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn a pool sized to the machine's hardware concurrency.
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4);
        Self::with_threads(threads)
    }

    /// Spawn a pool with an explicit thread count.
    pub fn with_threads(count: usize) -> Self {
        let queue = Arc::new(TaskQueue::new());
        let signal = Arc::new(Signal {
            mutex: Mutex::new(()),
            task_added: Condvar::new(),
        });
        let status = Arc::new(AtomicU8::new(ACTIVE));

        let mut handles = Vec::with_capacity(count.max(1));
        for index in 0..count.max(1) {
            let queue = queue.clone();
            let signal = signal.clone();
            let status = status.clone();
            let handle = std::thread::Builder::new()
                .name(format!("iris-worker-{index}"))
                .spawn(move || worker_loop(queue, signal, status))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            queue,
            signal,
            status,
            threads: Mutex::new(handles),
        }
    }

    /// Enqueue a task; returns immediately. Tasks issued against a pool that
    /// is draining or shut down are dropped with a log line.
    pub fn issue(&self, task: impl FnOnce() + Send + 'static) {
        if self.status.load(Ordering::Acquire) != ACTIVE {
            warn!("task issued against a non-active worker pool; dropping it");
            return;
        }
        self.queue.push(Job {
            task: Box::new(task),
            fence: None,
        });
        self.signal.task_added.notify_one();
    }

    /// Enqueue a task and return a fence that completes when it has run.
    pub fn issue_with_fence(&self, task: impl FnOnce() + Send + 'static) -> Option<Fence> {
        if self.status.load(Ordering::Acquire) != ACTIVE {
            warn!("fenced task issued against a non-active worker pool; dropping it");
            return None;
        }
        let state = Arc::new(FenceState::default());
        self.queue.push(Job {
            task: Box::new(task),
            fence: Some(state.clone()),
        });
        self.signal.task_added.notify_one();
        Some(Fence { state })
    }

    /// Stop accepting work, finish everything already queued, and join the
    /// workers.
    pub fn drain(&self) {
        self.shutdown(DRAINING);
    }

    /// Stop the workers at their next pop boundary, discarding queued work.
    pub fn terminate(&self) {
        self.shutdown(TERMINATING);
    }

    fn shutdown(&self, mode: u8) {
        self.status.store(mode, Ordering::Release);
        self.signal.task_added.notify_all();
        let current = std::thread::current().id();
        let handles = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            // Shutdown can be triggered from inside a worker (a task dropping
            // the last owner of the pool); that thread detaches rather than
            // joining itself.
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
        self.status.store(INACTIVE, Ordering::Release);
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.drain();
    }
}

fn worker_loop(queue: Arc<TaskQueue<Job>>, signal: Arc<Signal>, status: Arc<AtomicU8>) {
    let mut consumer = Consumer::new(queue);
    loop {
        while let Some(job) = consumer.pop() {
            if status.load(Ordering::Acquire) == TERMINATING {
                return;
            }
            // A panicking task never tears down the pool.
            if catch_unwind(AssertUnwindSafe(job.task)).is_err() {
                warn!("worker task panicked; the worker continues");
            }
            if let Some(fence) = job.fence {
                fence.signal();
            }
        }

        if status.load(Ordering::Acquire) != ACTIVE {
            return;
        }

        let guard = signal
            .mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _ = signal
            .task_added
            .wait_timeout(guard, Duration::from_secs(1))
            .unwrap_or_else(PoisonError::into_inner);
    }
}

// =============================================================================
// Tests
// =============================================================================
