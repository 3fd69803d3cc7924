//! Lazy task execution over a fixed worker-thread pool and per-thread
//! io_uring reactors with kernel-provided receive buffers.
//!
//! The pieces compose bottom-up: a [`WorkerPool`] runs plain jobs on OS
//! threads; a [`Bridge`] migrates a suspended [`Task`] onto the pool; each
//! driving thread owns a reactor context that submits operations and resumes
//! their tasks as completions arrive; the reactor's [`BufferPool`] lets the
//! kernel pick receive buffers out of a registered set. [`Runtime::block_on`]
//! ties them together and drives a root task on the calling thread.

pub mod io;
pub mod reactor;
pub mod runtime;
pub mod task;

mod utils;

#[cfg(test)]
mod test_utils;

pub use io::Fd;
pub use reactor::{BufView, BufferPool, IoContext, Reactor, ReactorError};
pub use runtime::{Bridge, Builder, Runtime, WorkerPool};
pub use task::{FrameHandle, Task, live_detached};
