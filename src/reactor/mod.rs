//! Per-thread io_uring reactor: ring, in-flight arena and shared buffers.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::task::Waker;
use std::time::Duration;

use io_uring::{cqueue, squeue};
use smallvec::SmallVec;

mod buffers;
mod errors;
mod pending;
mod ring;

pub use buffers::{BufView, BufferPool};
pub use errors::ReactorError;
pub use pending::CqeResult;
pub use ring::Reactor;

pub(crate) use buffers::BUFFER_GROUP;
pub(crate) use pending::{CompletionOutcome, InflightOp, PendingOps};
pub(crate) use ring::{Completion, CompletionBatch, DEFAULT_RING_ENTRIES};

pub(crate) type WakerBatch = SmallVec<[Waker; 8]>;

/// Everything one thread needs to issue and complete asynchronous I/O.
///
/// A context is owned by exactly one OS thread. It is either driven directly
/// (tests do this) or installed for the duration of an event loop via
/// [`enter`], after which operation futures reach it through [`with`].
pub struct IoContext {
    pub(crate) ring: Reactor,
    pub(crate) pending: PendingOps,
    pub(crate) buffers: BufferPool,
}

impl IoContext {
    pub fn try_new(entries: u32) -> Result<Self, ReactorError> {
        let ring = Reactor::try_new(entries)?;
        // The kernel sizes the completion queue at twice the submission
        // queue, so the arena tracks up to that many records.
        let pending = PendingOps::new(entries as usize * 2);
        Ok(Self {
            ring,
            pending,
            buffers: BufferPool::new(),
        })
    }

    pub fn register_buffers(&mut self, count: u16, size: u32) -> Result<(), ReactorError> {
        self.buffers.register(&self.ring, count, size)
    }

    /// Returns a borrowed buffer to the pool and republishes it to the
    /// kernel.
    pub fn release_buffer(&mut self, id: u16) {
        self.buffers.release(&self.ring, id);
    }

    /// Reserves an in-flight record, stamps its key on `entry` and stages the
    /// submission. The syscall happens at the next [`Self::wait_completions`].
    pub(crate) fn submit(
        &mut self,
        entry: squeue::Entry,
        waker: &Waker,
    ) -> Result<usize, ReactorError> {
        let reserved = self.pending.reserve()?;
        let key = reserved.key();
        let entry = entry.user_data(key as u64);
        self.ring.push(&entry)?;
        reserved.commit(InflightOp::new(waker.clone()));
        Ok(key)
    }

    pub(crate) fn poll_op(
        &mut self,
        key: usize,
        waker: &Waker,
    ) -> Result<Option<CqeResult>, ReactorError> {
        self.pending.poll_ready(key, waker)
    }

    /// Detaches a dropped operation future from its record. Outstanding
    /// submissions are never cancelled; the record is freed when the kernel
    /// eventually answers.
    pub(crate) fn drop_op(&mut self, key: usize) {
        if let Some(outcome) = self.pending.discard(key) {
            self.reclaim_kernel_buffer(outcome);
        }
    }

    /// Submits staged entries and waits up to `timeout` for completions,
    /// applying each to its record. Wakers are collected into `wakers`; the
    /// caller invokes them once it no longer borrows this context.
    pub(crate) fn wait_completions(
        &mut self,
        timeout: Duration,
        wakers: &mut WakerBatch,
    ) -> Result<usize, ReactorError> {
        self.ring.submit_and_wait(1, Some(timeout))?;
        let mut batch = CompletionBatch::new();
        self.ring.drain_completions(&mut batch);
        let reaped = batch.len();
        for completion in batch {
            self.apply(completion, wakers);
        }
        Ok(reaped)
    }

    fn apply(&mut self, completion: Completion, wakers: &mut WakerBatch) {
        let key = completion.key as usize;
        match self
            .pending
            .complete(key, completion.result, completion.flags)
        {
            Ok(CompletionOutcome::Advanced(Some(waker))) => wakers.push(waker),
            Ok(CompletionOutcome::Advanced(None)) => {}
            Ok(CompletionOutcome::Discarded(outcome)) => self.reclaim_kernel_buffer(outcome),
            Err(err) => {
                tracing::error!(key, error = %err, "dropping completion for an unknown record");
            }
        }
    }

    /// Buffers picked by the kernel for a completion nobody will consume go
    /// straight back to the free set.
    fn reclaim_kernel_buffer(&mut self, outcome: CqeResult) {
        if outcome.result >= 0
            && let Some(bid) = cqueue::buffer_select(outcome.flags)
        {
            self.buffers.requeue(&self.ring, bid);
        }
    }

    pub(crate) fn has_inflight(&self) -> bool {
        !self.pending.is_empty()
    }
}

impl Drop for IoContext {
    fn drop(&mut self) {
        self.buffers.unregister(&self.ring);
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<IoContext>> = const { RefCell::new(None) };
}

/// Installs `ctx` as this thread's reactor context until the guard drops.
///
/// Panics if a context is already installed; event loops do not nest.
pub(crate) fn enter(ctx: IoContext) -> ContextGuard {
    CONTEXT.with(|cell| {
        let prev = cell.borrow_mut().replace(ctx);
        assert!(
            prev.is_none(),
            "a reactor context is already installed on this thread"
        );
    });
    ContextGuard {
        _not_send: PhantomData,
    }
}

pub(crate) struct ContextGuard {
    _not_send: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CONTEXT.with(|cell| cell.borrow_mut().take());
    }
}

/// Runs `f` with the installed context.
///
/// Panics if no context is installed, which means an operation future was
/// polled outside a driving event loop.
#[track_caller]
#[inline(always)]
pub(crate) fn with<F, R>(f: F) -> R
where
    F: FnOnce(&mut IoContext) -> R,
{
    CONTEXT.with(|cell| {
        let mut borrow = cell.borrow_mut();
        let ctx = borrow
            .as_mut()
            .expect("no reactor context installed on this thread");
        f(ctx)
    })
}

/// Like [`with`], but a no-op when no context is installed or the context is
/// already borrowed. Safe to call from drop glue.
#[inline(always)]
pub(crate) fn try_with<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut IoContext) -> R,
{
    CONTEXT.with(|cell| {
        let mut borrow = cell.try_borrow_mut().ok()?;
        let ctx = borrow.as_mut()?;
        Some(f(ctx))
    })
}

/// Releases a borrowed shared buffer on the current thread's reactor.
///
/// Must run under a driving event loop, like the receive that borrowed the
/// buffer in the first place.
#[track_caller]
pub fn release_buffer(id: u16) {
    with(|ctx| ctx.release_buffer(id));
}
