//! Lazy tasks and the frames that run them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::MappedMutexGuard;

mod frame;
mod promise;
mod registry;

pub use frame::FrameHandle;
pub use registry::live_detached;

use frame::Frame;

/// A lazily started unit of asynchronous work.
///
/// Creating a task runs none of its body; the first poll (or a manual resume
/// through [`Task::raw`]) does. On completion the result is stored in the
/// frame: awaiting moves it out, [`Task::result`] borrows it in place, and a
/// panic from the body is re-raised at the first read.
///
/// A task that started must be driven to completion or detached. Dropping it
/// mid-flight is a contract violation and is logged.
#[must_use = "tasks are lazy and do nothing unless awaited, resumed or detached"]
pub struct Task<T> {
    frame: Option<Arc<Frame<T>>>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F>(body: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            frame: Some(Frame::new(body)),
        }
    }

    /// Whether the result is available without suspending.
    pub fn is_ready(&self) -> bool {
        self.frame().is_completed()
    }

    /// Severs this handle from the frame. The frame keeps running and
    /// destroys itself at its terminal step; [`live_detached`] counts the
    /// frames still waiting for that step.
    pub fn detach(mut self) {
        if let Some(frame) = self.frame.take() {
            frame.detach();
        }
    }

    /// A raw handle for driving the frame manually.
    pub fn raw(&self) -> FrameHandle<T> {
        FrameHandle::new(Arc::clone(self.frame()))
    }

    /// Borrows the completed value. Panics if the task has not completed.
    pub fn result(&self) -> MappedMutexGuard<'_, T> {
        self.frame().result_ref()
    }

    /// Moves the completed value out. Panics if the task has not completed
    /// or the value was already taken.
    pub fn take(&mut self) -> T {
        self.frame().take_value()
    }

    pub(crate) fn frame(&self) -> &Arc<Frame<T>> {
        match &self.frame {
            Some(frame) => frame,
            None => detached_handle(),
        }
    }
}

impl<T: Send + 'static> Future for Task<T> {
    type Output = T;

    /// Awaiting starts the frame if needed, handing the current thread to
    /// it until it suspends. The continuation then runs on whichever thread
    /// completes the frame.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        let frame = Arc::clone(this.frame());
        // Register the continuation before resuming, so a frame that
        // finishes on another thread mid-resume still finds it.
        frame.set_parent(cx.waker());
        if !frame.is_completed() {
            frame.resume();
        }
        if frame.is_completed() {
            Poll::Ready(frame.take_value())
        } else {
            Poll::Pending
        }
    }
}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Some(frame) = &self.frame
            && frame.has_started()
            && !frame.is_completed()
        {
            tracing::error!("dropping a started task that has not completed; detach it instead");
            debug_assert!(false, "dropped a started, incomplete task");
        }
    }
}

#[cold]
fn detached_handle() -> ! {
    panic!("task handle was detached")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use super::*;
    use crate::test_utils::yield_once;

    #[test]
    fn test_creation_runs_nothing() {
        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = Arc::clone(&ran);
            Task::new(async move {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!task.is_ready());

        task.raw().resume();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(task.is_ready());
        drop(task);
    }

    #[test]
    fn test_awaiting_a_child_returns_its_value() {
        let mut task = Task::new(async {
            let child = Task::new(async { 21 });
            child.await * 2
        });

        task.raw().resume();
        assert!(task.is_ready());
        assert_eq!(task.take(), 42);
    }

    #[test]
    fn test_child_await_is_a_same_thread_hand_off() {
        let mut task = Task::new(async {
            let parent = thread::current().id();
            let child = Task::new(async { thread::current().id() }).await;
            (parent, child)
        });

        task.raw().resume();
        let (parent, child) = task.take();
        assert_eq!(parent, child);
        assert_eq!(parent, thread::current().id());
    }

    #[test]
    fn test_result_borrows_without_consuming() {
        let mut task = Task::new(async { 7 });
        task.raw().resume();

        assert_eq!(*task.result(), 7);
        assert_eq!(*task.result(), 7);
        assert_eq!(task.take(), 7);
    }

    #[test]
    fn test_panic_is_deferred_to_the_first_read() {
        let mut task: Task<()> = Task::new(async {
            panic!("boom");
        });

        // The resume itself captures the panic instead of unwinding.
        task.raw().resume();
        assert!(task.is_ready());

        let err = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.take()))
            .expect_err("the stored panic must re-raise at the read");
        assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn test_detached_frame_destroys_itself_at_completion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let baseline = live_detached();

        let task = {
            let counter = Arc::clone(&counter);
            Task::new(async move {
                yield_once().await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        let handle = task.raw();

        handle.resume();
        assert!(!handle.is_done());

        task.detach();
        assert_eq!(live_detached(), baseline + 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        handle.resume();
        assert!(handle.is_done());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(live_detached(), baseline);
    }

    #[test]
    fn test_detach_after_completion_reclaims_immediately() {
        let baseline = live_detached();
        let task = Task::new(async { 3 });
        task.raw().resume();

        task.detach();
        assert_eq!(live_detached(), baseline);
    }

    #[test]
    #[should_panic(expected = "task result read before completion")]
    fn test_reading_an_unfinished_task_is_rejected() {
        let mut task = Task::new(async { 1 });
        let _ = task.take();
    }

    #[test]
    #[should_panic(expected = "task result already consumed")]
    fn test_taking_twice_is_rejected() {
        let mut task = Task::new(async { 1 });
        task.raw().resume();
        let _ = task.take();
        let _ = task.take();
    }
}
