//! Fixed-size worker pool over a bounded FIFO queue.
//!
//! Submission blocks once the queue is at max depth, which is the explicit
//! backpressure mechanism: a flood of connections slows at submit rather
//! than growing an unbounded queue. Shutdown lets in-flight tasks finish
//! and drops anything still queued.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    not_empty: Condvar,
    not_full: Condvar,
    max_depth: usize,
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a submitted task's eventual result.
///
/// `wait` returns `Err(PoolShutdown)` when the task was dropped from the
/// queue by shutdown before a worker ran it.
pub struct TaskHandle<R> {
    rx: mpsc::Receiver<R>,
}

impl<R> TaskHandle<R> {
    pub fn wait(self) -> Result<R> {
        self.rx.recv().map_err(|_| Error::PoolShutdown)
    }
}

impl WorkerPool {
    pub fn new(threads: usize, max_depth: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            max_depth: max_depth.max(1),
        });
        let mut workers = Vec::with_capacity(threads.max(1));
        for _ in 0..threads.max(1) {
            let shared = Arc::clone(&shared);
            workers.push(std::thread::spawn(move || worker_loop(shared)));
        }
        WorkerPool {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues `task`, blocking while the queue is at max depth. Fails
    /// once the pool has shut down.
    pub fn submit<F, R>(&self, task: F) -> Result<TaskHandle<R>>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            // The submitter may have given up waiting; a dead receiver is
            // not this thread's problem.
            let _ = tx.send(task());
        });
        let mut state = self.shared.state.lock();
        while state.queue.len() >= self.shared.max_depth && !state.shutdown {
            self.shared.not_full.wait(&mut state);
        }
        if state.shutdown {
            return Err(Error::PoolShutdown);
        }
        state.queue.push_back(job);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(TaskHandle { rx })
    }

    /// Stops the pool: in-flight tasks complete, queued tasks are dropped,
    /// workers are joined. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let dropped = state.queue.len();
            state.queue.clear();
            if dropped > 0 {
                debug!(dropped, "queued tasks dropped at shutdown");
            }
        }
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            while state.queue.is_empty() && !state.shutdown {
                shared.not_empty.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
            state.queue.pop_front().expect("queue checked non-empty")
        };
        shared.not_full.notify_one();
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn submit_returns_the_task_result() {
        let pool = WorkerPool::new(2, 8);
        let handle = pool.submit(|| 21 * 2).unwrap();
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn tasks_run_on_all_workers() {
        let pool = WorkerPool::new(4, 64);
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.submit(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
            })
            .collect();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 32);
    }

    #[test]
    fn submit_blocks_until_capacity_frees_up() {
        // One worker, queue depth one: the third submit must wait for the
        // blocker to drain.
        let pool = Arc::new(WorkerPool::new(1, 1));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        let gate_worker = Arc::clone(&gate);
        let blocker = pool
            .submit(move || {
                let (lock, cv) = &*gate_worker;
                let mut open = lock.lock();
                while !*open {
                    cv.wait(&mut open);
                }
            })
            .unwrap();
        let queued = pool.submit(|| ()).unwrap();

        let pool2 = Arc::clone(&pool);
        let submitter = std::thread::spawn(move || {
            let handle = pool2.submit(|| 7).unwrap();
            handle.wait().unwrap()
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished(), "submit should be backpressured");

        {
            let (lock, cv) = &*gate;
            *lock.lock() = true;
            cv.notify_all();
        }
        blocker.wait().unwrap();
        queued.wait().unwrap();
        assert_eq!(submitter.join().unwrap(), 7);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let pool = WorkerPool::new(2, 8);
        pool.shutdown();
        assert!(matches!(pool.submit(|| ()), Err(Error::PoolShutdown)));
        // Shutdown twice is fine.
        pool.shutdown();
    }

    #[test]
    fn shutdown_drops_queued_tasks() {
        let pool = Arc::new(WorkerPool::new(1, 8));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        let gate_worker = Arc::clone(&gate);
        let blocker = pool
            .submit(move || {
                let (lock, cv) = &*gate_worker;
                let mut open = lock.lock();
                while !*open {
                    cv.wait(&mut open);
                }
            })
            .unwrap();
        let starved = pool.submit(|| ()).unwrap();

        let pool2 = Arc::clone(&pool);
        let stopper = std::thread::spawn(move || pool2.shutdown());
        std::thread::sleep(Duration::from_millis(20));
        {
            let (lock, cv) = &*gate;
            *lock.lock() = true;
            cv.notify_all();
        }
        stopper.join().unwrap();

        // The in-flight task completed; the queued one was dropped.
        blocker.wait().unwrap();
        assert!(matches!(starved.wait(), Err(Error::PoolShutdown)));
    }
}
