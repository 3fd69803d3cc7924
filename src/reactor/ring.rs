use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use io_uring::types::{SubmitArgs, Timespec};
use io_uring::{IoUring, squeue};
use smallvec::SmallVec;

use crate::reactor::buffers::BufRingMem;
use crate::reactor::errors::ReactorError;

/// Default submission ring depth.
pub(crate) const DEFAULT_RING_ENTRIES: u32 = 2048;

/// One reaped completion queue entry, detached from the ring.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub(crate) key: u64,
    pub(crate) result: i32,
    pub(crate) flags: u32,
}

pub(crate) type CompletionBatch = SmallVec<[Completion; 32]>;

/// Thin wrapper around an `io_uring` instance owned by a single OS thread.
///
/// The ring is configured as single-issuer: every submission and wait must
/// happen on the thread that created it.
pub struct Reactor {
    ring: IoUring,
}

impl Reactor {
    pub fn try_new(entries: u32) -> io::Result<Self> {
        let ring = IoUring::builder()
            .setup_submit_all()
            .setup_single_issuer()
            .setup_coop_taskrun()
            .build(entries)?;
        Ok(Self { ring })
    }

    /// Stages a submission entry without issuing a syscall.
    ///
    /// The caller must have attached `user_data` identifying an in-flight
    /// record before pushing.
    pub(crate) fn push(&mut self, entry: &squeue::Entry) -> Result<(), ReactorError> {
        // SAFETY: callers keep every resource referenced by the entry alive
        // until its completion is reaped.
        unsafe { self.ring.submission().push(entry)? };
        Ok(())
    }

    /// Submits staged entries and waits for at least `want` completions.
    ///
    /// A `timeout` bounds the wait; expiry is not an error and reports zero
    /// completions.
    pub(crate) fn submit_and_wait(
        &self,
        want: usize,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        match timeout {
            Some(duration) => {
                let timespec = Timespec::from(duration);
                let args = SubmitArgs::new().timespec(&timespec);
                match self.ring.submitter().submit_with_args(want, &args) {
                    Ok(submitted) => Ok(submitted),
                    Err(err) if err.raw_os_error() == Some(libc::ETIME) => Ok(0),
                    Err(err) => Err(err),
                }
            }
            None => self.ring.submitter().submit_and_wait(want),
        }
    }

    /// Moves every posted completion out of the ring into `out`.
    pub(crate) fn drain_completions(&mut self, out: &mut CompletionBatch) {
        let mut cq = self.ring.completion();
        cq.sync();
        for cqe in &mut cq {
            out.push(Completion {
                key: cqe.user_data(),
                result: cqe.result(),
                flags: cqe.flags(),
            });
        }
        cq.sync();
    }

    /// Registers `ring` as a buffer group with the kernel, then seeds every
    /// slot with one buffer carved out of the backing region at `base` and
    /// publishes them all with a single tail advance.
    pub(crate) fn register_shared_buffers(
        &self,
        ring: &mut BufRingMem,
        group: u16,
        base: u64,
        buf_size: u32,
    ) -> io::Result<()> {
        // SAFETY: `ring` owns a page-aligned allocation that stays mapped
        // until after `unregister_shared_buffers`.
        unsafe {
            self.ring
                .submitter()
                .register_buf_ring(ring.as_addr(), ring.entries(), group)?;
        }
        let count = ring.entries();
        for id in 0..count {
            let addr = base + u64::from(id) * u64::from(buf_size);
            ring.write_entry(id, addr, buf_size, id);
        }
        ring.advance(count);
        Ok(())
    }

    /// Hands the buffer at `addr` back to the kernel under slot id `id`.
    ///
    /// Runs on the ring-owning thread.
    pub(crate) fn republish(&self, ring: &mut BufRingMem, addr: u64, len: u32, id: u16) {
        let tail = ring.tail_value();
        ring.write_entry(tail, addr, len, id);
        ring.advance(1);
    }

    pub(crate) fn unregister_shared_buffers(&self, group: u16) -> io::Result<()> {
        self.ring.submitter().unregister_buf_ring(group)
    }
}

impl AsRawFd for Reactor {
    fn as_raw_fd(&self) -> RawFd {
        self.ring.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use anyhow::Result;
    use io_uring::opcode;

    use super::*;
    use crate::test_utils::ring_available;

    #[test]
    fn test_wait_times_out_with_zero_completions() -> Result<()> {
        if !ring_available() {
            return Ok(());
        }
        let reactor = Reactor::try_new(8)?;
        let timeout = Duration::from_millis(50);

        let start = Instant::now();
        let reaped = reactor.submit_and_wait(1, Some(timeout))?;

        assert_eq!(reaped, 0);
        assert!(start.elapsed() >= timeout);
        Ok(())
    }

    #[test]
    fn test_nop_round_trip() -> Result<()> {
        if !ring_available() {
            return Ok(());
        }
        let mut reactor = Reactor::try_new(8)?;
        let nop = opcode::Nop::new().build().user_data(7);
        reactor.push(&nop)?;
        reactor.submit_and_wait(1, None)?;

        let mut batch = CompletionBatch::new();
        reactor.drain_completions(&mut batch);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, 7);
        assert_eq!(batch[0].result, 0);
        Ok(())
    }
}
