//! Fixed worker pool for long-running tasks.
//!
//! Upload finalization renames a file and re-digests it end to end; that
//! work runs here so it never stalls connection handling. A fixed set of OS
//! threads drains one FIFO queue. Shutdown wakes every worker, joins them
//! and drops whatever was still queued.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Task>,
    stopping: bool,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Fixed-size pool draining a single FIFO task queue.
///
/// Completion order across tasks is unspecified; callers must not assume
/// FIFO completion.
pub struct TaskPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TaskPool {
    /// Starts `worker_count` workers (at least one).
    pub fn new(worker_count: usize) -> Self {
        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                stopping: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..worker_count.max(1))
            .map(|i| {
                let inner = Arc::clone(&inner);
                thread::Builder::new()
                    .name(format!("cumulus-worker-{i}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("spawn worker thread")
            })
            .collect();

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a task; tasks submitted after shutdown are dropped.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.inner.state.lock();
            if state.stopping {
                debug!("task pool stopping, dropping submitted task");
                return;
            }
            state.queue.push_back(Box::new(task));
        }
        self.inner.available.notify_one();
    }

    /// Stops the pool: wakes all workers, joins them, drops queued tasks.
    pub fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopping = true;
            state.queue.clear();
        }
        self.inner.available.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if state.stopping {
                    return;
                }
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                inner.available.wait(&mut state);
            }
        };

        // A task must never take its worker down with it.
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            warn!("worker task panicked");
        }
    }
}
