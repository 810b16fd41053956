//! Worker thread pool
//!
//! Executes submitted tasks with bounded concurrency and a bounded FIFO task
//! queue. Session relays run here; each task runs a session to completion.
//!
//! Dispatch is FIFO. There is no fairness guarantee across workers beyond
//! what the condition variable provides.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::PoolError;

/// Maximum queued tasks
const MAX_QUEUE_SIZE: usize = 10_000;

/// Lower bound on auto-sized worker counts
const MIN_THREADS: usize = 2;

/// Upper bound on worker counts
const MAX_THREADS: usize = 64;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Task>,
    active: usize,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work: Condvar,
    done: Condvar,
}

/// Fixed-size worker pool with a bounded task queue
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    num_threads: usize,
}

impl ThreadPool {
    /// Create a pool with `num_threads` workers
    ///
    /// A non-positive count auto-sizes to twice the CPU count, clamped to
    /// `[2, 64]`.
    #[must_use]
    pub fn new(num_threads: usize) -> Self {
        let num_threads = if num_threads == 0 {
            let cpus =
                std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
            (cpus * 2).clamp(MIN_THREADS, MAX_THREADS)
        } else {
            num_threads.min(MAX_THREADS)
        };

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        });

        info!(num_threads, "creating thread pool");

        let mut workers = Vec::with_capacity(num_threads);
        for i in 0..num_threads {
            let shared = Arc::clone(&shared);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("worker-{i}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawn worker thread"),
            );
        }

        Self {
            shared,
            workers: Mutex::new(workers),
            num_threads,
        }
    }

    /// Submit a task for execution
    ///
    /// Wakes one worker. The task is dropped unexecuted on failure.
    ///
    /// # Errors
    ///
    /// `PoolError::QueueFull` when the queue is at capacity,
    /// `PoolError::Shutdown` after [`ThreadPool::shutdown`].
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        if state.queue.len() >= MAX_QUEUE_SIZE {
            drop(state);
            warn!("thread pool queue full");
            return Err(PoolError::QueueFull);
        }
        state.queue.push_back(Box::new(task));
        drop(state);
        self.shared.work.notify_one();
        Ok(())
    }

    /// Block until the queue is empty and no task is executing
    pub fn wait_all(&self) {
        let mut state = self.shared.state.lock();
        while !state.queue.is_empty() || state.active > 0 {
            self.shared.done.wait(&mut state);
        }
    }

    /// Stop accepting work, join every worker and drain the queue
    ///
    /// Workers finish the tasks already queued before exiting; anything
    /// still left afterwards is dropped without running, releasing its
    /// captured state. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.shared.work.notify_all();

        debug!("destroying thread pool");

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }

        let dropped = {
            let mut state = self.shared.state.lock();
            let n = state.queue.len();
            state.queue.clear();
            n
        };
        if dropped > 0 {
            debug!(dropped, "thread pool: queued tasks dropped at shutdown");
        }
        info!("thread pool destroyed");
    }

    /// Number of worker threads
    #[must_use]
    pub const fn thread_count(&self) -> usize {
        self.num_threads
    }

    /// Current queue depth
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &PoolShared) {
    debug!("thread pool worker started");

    loop {
        let task = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() && !state.shutdown {
                shared.work.wait(&mut state);
            }
            if state.shutdown && state.queue.is_empty() {
                break;
            }
            let task = state.queue.pop_front();
            if task.is_some() {
                state.active += 1;
            }
            task
        };

        if let Some(task) = task {
            task();

            let mut state = shared.state.lock();
            state.active -= 1;
            if state.active == 0 && state.queue.is_empty() {
                shared.done.notify_all();
            }
        }
    }

    debug!("thread pool worker stopped");
}
