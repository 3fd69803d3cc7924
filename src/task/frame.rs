use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::task::{Context, Poll, Wake, Waker};

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};

use crate::task::promise::{PanicPayload, Promise};
use crate::task::registry;

const CREATED: u8 = 0;
const RUNNING: u8 = 1;
/// A wake arrived while the body was being polled; re-poll before parking.
const RUNNING_WOKEN: u8 = 2;
const SUSPENDED: u8 = 3;
const COMPLETED: u8 = 4;

/// Sentinel for "not registered as detached".
const NOT_DETACHED: usize = usize::MAX;

struct FrameCore<T> {
    /// The suspended body. Taken while it is being polled and consumed for
    /// good at completion.
    body: Option<Pin<Box<dyn Future<Output = T> + Send>>>,
    promise: Promise<T>,
    /// Continuation to wake when the frame completes.
    parent: Option<Waker>,
}

/// Heap harness around one task body.
///
/// The frame's waker resumes the body in place on whichever thread invokes
/// it, so a frame woken from a pool job continues on that pool thread and
/// one woken by an I/O completion continues on the reactor thread.
pub(crate) struct Frame<T> {
    core: Mutex<FrameCore<T>>,
    state: AtomicU8,
    /// Key in the detached registry, or `NOT_DETACHED`.
    detached: AtomicUsize,
}

impl<T> Frame<T> {
    pub(crate) fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    pub(crate) fn has_started(&self) -> bool {
        self.state.load(Ordering::Acquire) != CREATED
    }

    /// Records the continuation to wake at completion, replacing any
    /// previous one unless it would wake the same place.
    pub(crate) fn set_parent(&self, waker: &Waker) {
        let mut core = self.core.lock();
        if let Some(existing) = &core.parent
            && existing.will_wake(waker)
        {
            return;
        }
        core.parent = Some(waker.clone());
    }

    /// Moves the completed result out. A body panic is re-raised here, at
    /// the read.
    pub(crate) fn take_value(&self) -> T {
        assert!(self.is_completed(), "task result read before completion");
        let result = self.core.lock().promise.take();
        match result {
            Some(Ok(value)) => value,
            Some(Err(payload)) => panic::resume_unwind(payload),
            None => missing_result(),
        }
    }

    /// Borrows the completed value in place. A body panic is re-raised at
    /// the first read, consuming the stored payload.
    pub(crate) fn result_ref(&self) -> MappedMutexGuard<'_, T> {
        assert!(self.is_completed(), "task result read before completion");
        {
            let mut core = self.core.lock();
            if matches!(core.promise, Promise::Error(_)) {
                let payload = match core.promise.take() {
                    Some(Err(payload)) => payload,
                    _ => missing_result(),
                };
                drop(core);
                panic::resume_unwind(payload);
            }
        }
        MutexGuard::map(self.core.lock(), |core| match &mut core.promise {
            Promise::Value(value) => value,
            _ => missing_result(),
        })
    }
}

impl<T: Send + 'static> Frame<T> {
    pub(crate) fn new<F>(body: F) -> Arc<Self>
    where
        F: Future<Output = T> + Send + 'static,
    {
        Arc::new(Self {
            core: Mutex::new(FrameCore {
                body: Some(Box::pin(body)),
                promise: Promise::Empty,
                parent: None,
            }),
            state: AtomicU8::new(CREATED),
            detached: AtomicUsize::new(NOT_DETACHED),
        })
    }

    /// Runs the body on the current thread until it suspends or completes.
    /// Concurrent resumes collapse into a single runner; extra wakes make
    /// that runner go around again instead of parking.
    pub(crate) fn resume(self: &Arc<Self>) {
        if !self.begin_running() {
            return;
        }
        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        loop {
            let Some(mut body) = self.core.lock().body.take() else {
                debug_assert!(false, "running frame has no body");
                return;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(&mut cx))) {
                Ok(Poll::Ready(value)) => return self.complete(Ok(value)),
                Err(payload) => return self.complete(Err(payload)),
                Ok(Poll::Pending) => {
                    self.core.lock().body = Some(body);
                    match self.state.compare_exchange(
                        RUNNING,
                        SUSPENDED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        // A wake landed mid-poll; absorb it and go again.
                        Err(_) => self.state.store(RUNNING, Ordering::Release),
                    }
                }
            }
        }
    }

    fn begin_running(&self) -> bool {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let (target, acquired) = match state {
                CREATED | SUSPENDED => (RUNNING, true),
                RUNNING => (RUNNING_WOKEN, false),
                RUNNING_WOKEN | COMPLETED => return false,
                _ => unreachable!("invalid frame state {state}"),
            };
            match self.state.compare_exchange_weak(
                state,
                target,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return acquired,
                Err(actual) => state = actual,
            }
        }
    }

    fn complete(self: &Arc<Self>, result: Result<T, PanicPayload>) {
        let parent = {
            let mut core = self.core.lock();
            match result {
                Ok(value) => core.promise.fulfill(value),
                Err(payload) => core.promise.fail(payload),
            }
            core.parent.take()
        };
        // SeqCst pairs with `detach`: whichever runs second observes the
        // other and performs the reclaim.
        self.state.store(COMPLETED, Ordering::SeqCst);
        let key = self.detached.load(Ordering::SeqCst);
        if key != NOT_DETACHED {
            registry::reclaim(key);
        }
        if let Some(parent) = parent {
            parent.wake();
        }
    }

    /// Hands ownership of the frame to the detached registry. The frame
    /// reclaims itself at its terminal step.
    pub(crate) fn detach(self: &Arc<Self>) {
        let key = registry::insert(Arc::clone(self) as Arc<dyn Any + Send + Sync>);
        self.detached.store(key, Ordering::SeqCst);
        if self.state.load(Ordering::SeqCst) == COMPLETED {
            registry::reclaim(key);
        }
    }
}

impl<T: Send + 'static> Wake for Frame<T> {
    fn wake(self: Arc<Self>) {
        self.resume();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.resume();
    }
}

#[cold]
fn missing_result() -> ! {
    panic!("task result already consumed")
}

/// Raw driving handle over a frame, independent of the owning [`Task`].
///
/// [`Task`]: crate::task::Task
pub struct FrameHandle<T> {
    frame: Arc<Frame<T>>,
}

impl<T: Send + 'static> FrameHandle<T> {
    pub(crate) fn new(frame: Arc<Frame<T>>) -> Self {
        Self { frame }
    }

    /// Runs the frame on the current thread until it suspends or completes.
    pub fn resume(&self) {
        self.frame.resume();
    }

    pub fn is_done(&self) -> bool {
        self.frame.is_completed()
    }
}

impl<T> Clone for FrameHandle<T> {
    fn clone(&self) -> Self {
        Self {
            frame: Arc::clone(&self.frame),
        }
    }
}
