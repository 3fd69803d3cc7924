use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll};

use io_uring::{cqueue, opcode, squeue, types};

use crate::io::fd::Fd;
use crate::reactor::{self, BUFFER_GROUP, BufView, CqeResult, IoContext};

/// One single-shot submission: how to build its entry and how to read the
/// matching completion.
pub trait OpSpec: Unpin {
    type Ok;

    fn entry(&mut self) -> squeue::Entry;

    /// Interprets the completion. Runs on the ring-owning thread with the
    /// reactor context still borrowed.
    fn interpret(&mut self, outcome: CqeResult, ctx: &mut IoContext) -> io::Result<Self::Ok>;
}

/// Future for one submitted operation.
///
/// The first poll stages the entry on the calling thread's reactor; later
/// polls resolve the in-flight record once its completion has been reaped,
/// which happens on this same thread. Dropping the future mid-flight orphans
/// the record; the submission itself is never cancelled.
#[must_use = "operations do nothing unless awaited"]
pub struct Op<S: OpSpec> {
    spec: S,
    key: Option<usize>,
}

impl<S: OpSpec> Op<S> {
    pub(crate) fn new(spec: S) -> Self {
        Self { spec, key: None }
    }
}

impl<S: OpSpec> Future for Op<S> {
    type Output = io::Result<S::Ok>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        reactor::with(|ctx| match this.key {
            None => {
                let entry = this.spec.entry();
                match ctx.submit(entry, cx.waker()) {
                    Ok(key) => {
                        this.key = Some(key);
                        Poll::Pending
                    }
                    Err(err) => Poll::Ready(Err(err.into())),
                }
            }
            Some(key) => match ctx.poll_op(key, cx.waker()) {
                Ok(Some(outcome)) => {
                    this.key = None;
                    Poll::Ready(this.spec.interpret(outcome, ctx))
                }
                Ok(None) => Poll::Pending,
                Err(err) => {
                    this.key = None;
                    Poll::Ready(Err(err.into()))
                }
            },
        })
    }
}

impl<S: OpSpec> Drop for Op<S> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            reactor::try_with(|ctx| ctx.drop_op(key));
        }
    }
}

/// Kernel no-op. Exercises the full submit/complete cycle with no side
/// effects.
pub fn nop() -> Op<Nop> {
    Op::new(Nop)
}

pub struct Nop;

impl OpSpec for Nop {
    type Ok = ();

    fn entry(&mut self) -> squeue::Entry {
        opcode::Nop::new().build()
    }

    fn interpret(&mut self, outcome: CqeResult, _ctx: &mut IoContext) -> io::Result<()> {
        outcome.ok()?;
        Ok(())
    }
}

/// Receives from `fd` into a kernel-selected shared buffer.
///
/// Requires shared buffers registered on the driving reactor. Resolves to a
/// borrowed view of exactly the received bytes; the empty view means the
/// peer closed. The caller hands the view's id back through
/// [`reactor::release_buffer`] once the bytes are consumed.
pub fn recv(fd: &Fd) -> Op<Recv> {
    Op::new(Recv { fd: fd.raw() })
}

pub struct Recv {
    fd: RawFd,
}

impl OpSpec for Recv {
    type Ok = BufView;

    fn entry(&mut self) -> squeue::Entry {
        opcode::Recv::new(types::Fd(self.fd), std::ptr::null_mut(), 0)
            .buf_group(BUFFER_GROUP)
            .build()
            .flags(squeue::Flags::BUFFER_SELECT)
    }

    fn interpret(&mut self, outcome: CqeResult, ctx: &mut IoContext) -> io::Result<BufView> {
        let len = outcome.ok()? as usize;
        match cqueue::buffer_select(outcome.flags) {
            Some(id) if len > 0 => Ok(ctx.buffers.borrow(id, len)),
            Some(id) => {
                // A zero-length receive still consumed a slot on some
                // kernels; hand it straight back.
                ctx.buffers.requeue(&ctx.ring, id);
                Ok(BufView::empty())
            }
            None => Ok(BufView::empty()),
        }
    }
}

/// Moves up to `len` bytes from `fd_in` to `fd_out` without passing through
/// user space. At least one side must be a pipe.
pub fn splice(fd_in: &Fd, fd_out: &Fd, len: u32) -> Op<Splice> {
    Op::new(Splice {
        fd_in: fd_in.raw(),
        fd_out: fd_out.raw(),
        len,
    })
}

pub struct Splice {
    fd_in: RawFd,
    fd_out: RawFd,
    len: u32,
}

impl OpSpec for Splice {
    type Ok = usize;

    fn entry(&mut self) -> squeue::Entry {
        opcode::Splice::new(types::Fd(self.fd_in), -1, types::Fd(self.fd_out), -1, self.len).build()
    }

    fn interpret(&mut self, outcome: CqeResult, _ctx: &mut IoContext) -> io::Result<usize> {
        Ok(outcome.ok()? as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Result;

    use super::*;
    use crate::reactor::WakerBatch;
    use crate::test_utils::{mock_waker, poll_once, ring_available};

    const TICK: Duration = Duration::from_millis(100);

    #[test]
    fn test_nop_resolves_through_an_installed_context() -> Result<()> {
        if !ring_available() {
            return Ok(());
        }
        let _guard = reactor::enter(IoContext::try_new(8)?);
        let (waker, count) = mock_waker();

        let mut op = nop();
        assert!(poll_once(&mut op, &waker).is_pending());

        let mut wakers = WakerBatch::new();
        reactor::with(|ctx| ctx.wait_completions(TICK, &mut wakers))?;
        for waker in wakers.drain(..) {
            waker.wake();
        }
        assert_eq!(count.get(), 1);

        match poll_once(&mut op, &waker) {
            Poll::Ready(outcome) => outcome?,
            Poll::Pending => panic!("completion was already reaped"),
        }
        Ok(())
    }

    #[test]
    fn test_dropped_op_orphans_its_record() -> Result<()> {
        if !ring_available() {
            return Ok(());
        }
        let _guard = reactor::enter(IoContext::try_new(8)?);
        let (waker, count) = mock_waker();

        let mut op = nop();
        assert!(poll_once(&mut op, &waker).is_pending());
        drop(op);
        assert!(reactor::with(|ctx| ctx.has_inflight()));

        let mut wakers = WakerBatch::new();
        reactor::with(|ctx| ctx.wait_completions(TICK, &mut wakers))?;

        assert!(wakers.is_empty());
        assert_eq!(count.get(), 0);
        assert!(!reactor::with(|ctx| ctx.has_inflight()));
        Ok(())
    }

    #[test]
    fn test_poll_outside_a_context_panics() {
        let (waker, _) = mock_waker();
        let mut op = nop();

        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = poll_once(&mut op, &waker);
        }));
        assert!(res.is_err());
    }
}
