use std::io;

use io_uring::squeue::PushError;

/// Errors surfaced by the per-thread reactor and its bookkeeping structures.
#[derive(thiserror::Error, Debug)]
pub enum ReactorError {
    /// The submission ring is full. Recoverable: reap completions before
    /// submitting more entries.
    #[error("submission ring is full, cannot submit IO")]
    RingFull(#[from] PushError),

    /// The in-flight operation arena is at capacity.
    #[error("in-flight arena is full, cannot track a new submission")]
    ArenaFull,

    /// A completion referenced a key the arena does not track.
    #[error("no in-flight operation for key {0}")]
    UnknownKey(usize),

    /// Shared buffer registration was given an unusable slot count.
    #[error("buffer count {0} must be a nonzero power of two")]
    InvalidBufferCount(u16),

    /// A ring was configured with no submission entries.
    #[error("ring depth must be nonzero")]
    InvalidRingEntries,

    /// A buffer group is already registered with the kernel for this ring.
    #[error("shared buffers are already registered")]
    BuffersAlreadyRegistered,

    /// The allocator refused a backing allocation.
    #[error("allocation failed for {0}")]
    AllocFailed(&'static str),

    #[error("io_uring error: {0}")]
    Io(#[from] io::Error),
}

impl ReactorError {
    /// Whether the same submission can be retried once completions have
    /// been reaped.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RingFull(_) | Self::ArenaFull => true,
            Self::Io(err) => err.raw_os_error() == Some(libc::EAGAIN),
            _ => false,
        }
    }
}

impl From<ReactorError> for io::Error {
    fn from(err: ReactorError) -> Self {
        match err {
            ReactorError::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ReactorError::ArenaFull.is_retryable());
        assert!(ReactorError::Io(io::Error::from_raw_os_error(libc::EAGAIN)).is_retryable());
        assert!(!ReactorError::UnknownKey(7).is_retryable());
        assert!(!ReactorError::InvalidBufferCount(3).is_retryable());
    }

    #[test]
    fn test_io_error_round_trip() {
        let inner = io::Error::from_raw_os_error(libc::EBADF);
        let err: io::Error = ReactorError::from(inner).into();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
