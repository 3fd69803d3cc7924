use std::sync::Arc;
use std::time::Duration;

use crate::reactor::{self, IoContext, ReactorError, WakerBatch};
use crate::runtime::bridge::Bridge;
use crate::runtime::builder::Builder;
use crate::runtime::pool::WorkerPool;
use crate::task::Task;

/// How long one event-loop tick waits for completions before rechecking
/// whether the root frame finished on another thread.
const COMPLETION_TICK: Duration = Duration::from_millis(100);

/// A worker pool plus the configuration for per-thread reactors.
///
/// The runtime itself owns no ring. Each [`Runtime::block_on`] call builds a
/// reactor context for the calling thread, drives it, and tears it down.
pub struct Runtime {
    pool: Arc<WorkerPool>,
    ring_entries: u32,
    buffers: Option<(u16, u32)>,
}

impl Runtime {
    /// A runtime with default settings.
    pub fn try_new() -> Result<Self, ReactorError> {
        Builder::new().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    pub(crate) fn from_parts(
        pool: Arc<WorkerPool>,
        ring_entries: u32,
        buffers: Option<(u16, u32)>,
    ) -> Self {
        Self {
            pool,
            ring_entries,
            buffers,
        }
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// A bridge that submits continuations to this runtime's pool.
    pub fn bridge(&self) -> Bridge {
        Bridge::new(Arc::clone(&self.pool))
    }

    /// Drives `task` to completion and returns its value.
    ///
    /// A reactor context is installed on the calling thread for the duration
    /// of the call; I/O submitted by the task and everything it awaits is
    /// completed here. Frames that crossed the bridge finish on pool
    /// workers, and the loop picks that up within one tick. A panic stored
    /// by the task body is re-raised at the value read.
    ///
    /// Panics if called on a thread that is already inside `block_on`.
    pub fn block_on<T: Send + 'static>(&self, mut task: Task<T>) -> Result<T, ReactorError> {
        let mut ctx = IoContext::try_new(self.ring_entries)?;
        if let Some((count, size)) = self.buffers {
            ctx.register_buffers(count, size)?;
        }
        let _guard = reactor::enter(ctx);

        let frame = Arc::clone(task.frame());
        frame.resume();

        let mut wakers = WakerBatch::new();
        while !frame.is_completed() {
            let waited = reactor::with(|ctx| ctx.wait_completions(COMPLETION_TICK, &mut wakers));
            if let Err(err) = waited {
                // The frame may still be in flight; orphan it rather than
                // tripping the incomplete-drop check.
                task.detach();
                return Err(err);
            }
            for waker in wakers.drain(..) {
                waker.wake();
            }
        }

        Ok(task.take())
    }
}
