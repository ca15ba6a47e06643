//! Bounded worker pool that runs async listeners.

use std::any::{Any, type_name};
use std::fmt;
use std::mem;
use std::num::NonZero;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::queue::SegQueue;
use event_listener::{Event, Listener};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::metrics::{ASYNC_EXECUTION_TIME_MS, ASYNC_PANICS};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    name_prefix: String,
    worker_count: NonZero<usize>,

    queue: SegQueue<Task>,
    wake_event: Event,
    shutdown_flag: AtomicBool,
    workers_spawned: AtomicBool,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolInner {
    fn ensure_workers_spawned(self: &Arc<Self>) {
        // AcqRel on success ensures later spawners see the flag and we see prior activity.
        let already_spawned = self
            .workers_spawned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err();

        if already_spawned {
            return;
        }

        let mut new_handles = Vec::with_capacity(self.worker_count.get());

        for worker_index in 0..self.worker_count.get() {
            let inner = Arc::clone(self);
            let handle = thread::Builder::new()
                .name(format!("{}-{worker_index}", self.name_prefix))
                .spawn(move || {
                    debug!(worker_index, "async worker started");
                    worker_loop(&inner);
                    debug!(worker_index, "async worker exiting");
                })
                .expect("failed to spawn worker thread: thread spawning failure is not supported");

            new_handles.push(handle);
        }

        self.worker_handles.lock().extend(new_handles);
    }

    fn signal_shutdown(&self) {
        // Release pairs with the Acquire in the worker loop, so a worker that observes the flag
        // also observes every task pushed before it was set.
        self.shutdown_flag.store(true, Ordering::Release);
        self.wake_event.notify(usize::MAX);
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        if let Some(task) = inner.queue.pop() {
            run_contained(task);
            continue;
        }

        // Workers only exit once the queue is empty, so accepted work is never abandoned.
        if inner.shutdown_flag.load(Ordering::Acquire) {
            break;
        }

        let listener = inner.wake_event.listen();

        // Re-check after registering the listener to avoid lost wakeups.
        if !inner.queue.is_empty() || inner.shutdown_flag.load(Ordering::Acquire) {
            continue;
        }

        listener.wait();
    }
}

/// Runs a task, containing any panic to the task itself.
fn run_contained(task: Task) {
    let result = ASYNC_EXECUTION_TIME_MS
        .with(|e| e.observe_duration_millis(|| panic::catch_unwind(AssertUnwindSafe(task))));

    if let Err(payload) = result {
        ASYNC_PANICS.with(|e| e.observe_once());
        error!(
            payload = panic_message(payload.as_ref()),
            "async listener panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

/// Executes fire-and-forget tasks on a fixed number of worker threads.
///
/// The worker threads are started on first use. When the pool is dropped, the workers finish
/// all tasks that were already queued and then exit; the drop waits for them.
pub(crate) struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub(crate) fn new(worker_count: NonZero<usize>, name_prefix: String) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name_prefix,
                worker_count,
                queue: SegQueue::new(),
                wake_event: Event::new(),
                shutdown_flag: AtomicBool::new(false),
                workers_spawned: AtomicBool::new(false),
                worker_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Queues a task for execution on one of the workers. Never blocks.
    ///
    /// A panic in the task is caught and logged; it does not affect other tasks or the worker.
    pub(crate) fn spawn_and_forget<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.ensure_workers_spawned();

        self.inner.queue.push(Box::new(task));
        trace!(pool = %self.inner.name_prefix, "task queued");

        self.inner.wake_event.notify(1);
    }

    #[cfg(test)]
    fn spawned_worker_count(&self) -> usize {
        self.inner.worker_handles.lock().len()
    }
}

impl Drop for WorkerPool {
    #[cfg_attr(test, mutants::skip)] // Removing this causes timeouts (workers never stop).
    fn drop(&mut self) {
        self.inner.signal_shutdown();

        let handles = mem::take(&mut *self.inner.worker_handles.lock());
        let current = thread::current().id();

        for handle in handles {
            // If the pool is dropped by one of its own tasks, that worker exits by itself
            // once the task returns.
            if handle.thread().id() == current {
                continue;
            }

            if let Err(payload) = handle.join() {
                // Tasks run inside a panic trap, so a worker panic is a defect in the pool.
                panic::resume_unwind(payload);
            }
        }
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("name_prefix", &self.inner.name_prefix)
            .field("worker_count", &self.inner.worker_count)
            .field("queued", &self.inner.queue.len())
            .finish_non_exhaustive()
    }
}
