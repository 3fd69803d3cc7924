use std::any::Any;
use std::fmt;

pub(crate) type PanicPayload = Box<dyn Any + Send + 'static>;

/// Result slot of a task frame. Written exactly once, at the frame's
/// terminal step.
pub(crate) enum Promise<T> {
    /// The body has not produced a result yet.
    Empty,
    /// Completed with a value. Consumed by the first move-out read.
    Value(T),
    /// The body panicked. The payload is re-raised at the first read.
    Error(PanicPayload),
}

impl<T> Promise<T> {
    pub(crate) fn fulfill(&mut self, value: T) {
        debug_assert!(self.is_empty(), "promise written twice");
        *self = Self::Value(value);
    }

    pub(crate) fn fail(&mut self, payload: PanicPayload) {
        debug_assert!(self.is_empty(), "promise written twice");
        *self = Self::Error(payload);
    }

    pub(crate) fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Moves the outcome out, leaving the slot empty.
    pub(crate) fn take(&mut self) -> Option<Result<T, PanicPayload>> {
        match std::mem::replace(self, Self::Empty) {
            Self::Empty => None,
            Self::Value(value) => Some(Ok(value)),
            Self::Error(payload) => Some(Err(payload)),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Empty => "Promise::Empty",
            Self::Value(_) => "Promise::Value",
            Self::Error(_) => "Promise::Error",
        })
    }
}
