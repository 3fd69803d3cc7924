//! Shared helpers for unit tests.

use std::sync::OnceLock;

mod future;
mod mocks;

pub(crate) use future::{poll_once, yield_once};
pub(crate) use mocks::mock_waker;

/// Whether this kernel can create an io_uring instance. Ring-backed tests
/// skip themselves when it cannot (ENOSYS on old kernels, EPERM under
/// seccomp sandboxes).
pub(crate) fn ring_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| match io_uring::IoUring::new(2) {
        Ok(_) => true,
        Err(err) => {
            eprintln!("skipping ring-backed test: io_uring unavailable ({err})");
            false
        }
    })
}

/// Installs a test subscriber once; later calls are no-ops.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
