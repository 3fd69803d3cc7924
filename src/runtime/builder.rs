use std::sync::Arc;

use crate::reactor::{DEFAULT_RING_ENTRIES, ReactorError};
use crate::runtime::pool::WorkerPool;
use crate::runtime::runtime::Runtime;

/// Configures and constructs a [`Runtime`].
pub struct Builder {
    worker_threads: usize,
    ring_entries: u32,
    buffers: Option<(u16, u32)>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            worker_threads: 0,
            ring_entries: DEFAULT_RING_ENTRIES,
            buffers: None,
        }
    }

    /// Number of pool workers. Zero selects one per available CPU.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Submission ring depth for every event loop this runtime drives.
    pub fn ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }

    /// Shared receive buffers to register with each event loop's reactor:
    /// `count` buffers of `size` bytes. Count must be a power of two.
    pub fn provided_buffers(mut self, count: u16, size: u32) -> Self {
        self.buffers = Some((count, size));
        self
    }

    /// Validates the configuration and spawns the worker pool. Failure to
    /// acquire OS resources here is surfaced, not deferred.
    pub fn build(self) -> Result<Runtime, ReactorError> {
        if self.ring_entries == 0 {
            return Err(ReactorError::InvalidRingEntries);
        }
        if let Some((count, _)) = self.buffers
            && (count == 0 || !count.is_power_of_two())
        {
            return Err(ReactorError::InvalidBufferCount(count));
        }
        let pool = Arc::new(WorkerPool::try_new(self.worker_threads)?);
        Ok(Runtime::from_parts(pool, self.ring_entries, self.buffers))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
