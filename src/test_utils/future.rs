use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// Polls `future` exactly once with `waker`.
pub(crate) fn poll_once<F>(future: &mut F, waker: &Waker) -> Poll<F::Output>
where
    F: Future + Unpin,
{
    let mut cx = Context::from_waker(waker);
    Pin::new(future).poll(&mut cx)
}

/// Suspends exactly once without scheduling a wake; the test re-polls by
/// hand.
pub(crate) fn yield_once() -> YieldOnce {
    YieldOnce { yielded: false }
}

pub(crate) struct YieldOnce {
    yielded: bool,
}

impl Future for YieldOnce {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock_waker;

    #[test]
    fn test_yield_once_is_pending_exactly_once() {
        let (waker, count) = mock_waker();
        let mut future = yield_once();

        assert!(poll_once(&mut future, &waker).is_pending());
        assert!(poll_once(&mut future, &waker).is_ready());
        assert_eq!(count.get(), 0);
    }
}
