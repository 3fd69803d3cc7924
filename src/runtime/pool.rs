use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    running_jobs: usize,
    accepting: bool,
    /// Number of callers blocked in `wait_idle`.
    drain_waiters: usize,
}

struct Shared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    drain_done: Condvar,
}

/// Fixed set of OS worker threads consuming a shared FIFO of jobs.
///
/// The queue is unbounded. Dropping the pool blocks until every queued and
/// running job has finished, then joins the workers.
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    threads: usize,
}

impl WorkerPool {
    /// Spawns `threads` workers. Zero means one per available CPU.
    pub fn try_new(threads: usize) -> io::Result<Self> {
        let threads = match threads {
            0 => thread::available_parallelism().map(usize::from).unwrap_or(1),
            n => n,
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running_jobs: 0,
                accepting: true,
                drain_waiters: 0,
            }),
            work_available: Condvar::new(),
            drain_done: Condvar::new(),
        });
        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(threads),
            threads,
        };
        for index in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("riptide-worker-{index}"))
                .spawn(move || worker_loop(&shared))?;
            pool.workers.push(handle);
        }
        Ok(pool)
    }

    /// Enqueues a job and wakes exactly one idle worker.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state.lock();
            debug_assert!(state.accepting, "submit after shutdown began");
            state.queue.push_back(Box::new(job));
        }
        self.shared.work_available.notify_one();
    }

    /// Blocks until the queue is empty and no job is running.
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        state.drain_waiters += 1;
        while !state.queue.is_empty() || state.running_jobs > 0 {
            self.shared.drain_done.wait(&mut state);
        }
        state.drain_waiters -= 1;
    }

    pub fn thread_count(&self) -> usize {
        self.threads
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.wait_idle();
        self.shared.state.lock().accepting = false;
        self.shared.work_available.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked outside a job");
            }
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.running_jobs += 1;
                    break job;
                }
                if !state.accepting {
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };

        // A panicking job leaves whatever it touched in an unknown state;
        // that is fatal for the whole process.
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            let worker = thread::current();
            tracing::error!(
                worker = worker.name().unwrap_or("<unnamed>"),
                panic = panic_message(payload.as_ref()),
                "job panicked, aborting"
            );
            std::process::abort();
        }

        let mut state = shared.state.lock();
        state.running_jobs -= 1;
        if state.drain_waiters > 0 {
            shared.drain_done.notify_all();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<opaque payload>"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::Result;

    use super::*;

    #[test]
    fn test_jobs_run_concurrently() -> Result<()> {
        let pool = WorkerPool::try_new(4)?;
        let barrier = Arc::new(Barrier::new(4));
        let passed = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            let passed = Arc::clone(&passed);
            pool.submit(move || {
                // Only passes if all four jobs are in flight at once.
                barrier.wait();
                passed.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_idle();

        assert_eq!(passed.load(Ordering::SeqCst), 4);
        Ok(())
    }

    #[test]
    fn test_drop_drains_queued_jobs() -> Result<()> {
        let pool = WorkerPool::try_new(2)?;
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = Arc::clone(&done);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);

        assert_eq!(done.load(Ordering::SeqCst), 5);
        Ok(())
    }

    #[test]
    fn test_workers_are_named() -> Result<()> {
        let pool = WorkerPool::try_new(1)?;
        let name = Arc::new(Mutex::new(String::new()));
        {
            let name = Arc::clone(&name);
            pool.submit(move || {
                *name.lock() = thread::current().name().unwrap_or("").to_owned();
            });
        }
        pool.wait_idle();

        assert_eq!(*name.lock(), "riptide-worker-0");
        Ok(())
    }

    #[test]
    fn test_zero_threads_auto_detects() -> Result<()> {
        let pool = WorkerPool::try_new(0)?;
        assert!(pool.thread_count() >= 1);
        Ok(())
    }
}
