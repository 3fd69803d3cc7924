use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::runtime::pool::WorkerPool;

/// Moves coroutine execution onto the worker pool.
///
/// Awaiting [`Bridge::schedule`] always suspends, submits the continuation
/// as a pool job, and resumes on whichever worker dequeues it. Awaiting a
/// second time migrates again; execution never returns to the previous
/// thread on its own.
#[derive(Clone)]
pub struct Bridge {
    pool: Arc<WorkerPool>,
}

impl Bridge {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }

    pub fn schedule(&self) -> Schedule<'_> {
        Schedule {
            pool: &self.pool,
            submitted: false,
        }
    }
}

/// Future returned by [`Bridge::schedule`].
#[must_use = "futures do nothing unless awaited"]
pub struct Schedule<'a> {
    pool: &'a WorkerPool,
    submitted: bool,
}

impl Future for Schedule<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.submitted {
            // Resumed by the pool job; the migration already happened.
            return Poll::Ready(());
        }
        this.submitted = true;
        let waker = cx.waker().clone();
        this.pool.submit(move || waker.wake());
        Poll::Pending
    }
}
