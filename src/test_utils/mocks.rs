use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

/// Hit counter shared with the waker returned by [`mock_waker`].
pub(crate) struct WakeCount {
    hits: AtomicUsize,
}

impl WakeCount {
    pub(crate) fn get(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Wake for WakeCount {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

/// A waker whose only effect is counting how often it fires.
pub(crate) fn mock_waker() -> (Waker, Arc<WakeCount>) {
    let count = Arc::new(WakeCount {
        hits: AtomicUsize::new(0),
    });
    (Waker::from(Arc::clone(&count)), count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_waker_counts_wakes() {
        let (waker, count) = mock_waker();

        waker.wake_by_ref();
        assert_eq!(count.get(), 1);

        let clone = waker.clone();
        clone.wake();
        assert_eq!(count.get(), 2);

        drop(waker);
        assert_eq!(count.get(), 2);
    }
}
