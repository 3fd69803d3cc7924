use std::any::Any;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use slab::Slab;

/// Frames severed from their owning handle. An entry keeps its frame alive
/// until the frame's terminal step reclaims it.
static DETACHED: LazyLock<Mutex<Slab<Arc<dyn Any + Send + Sync>>>> =
    LazyLock::new(|| Mutex::new(Slab::new()));

pub(crate) fn insert(frame: Arc<dyn Any + Send + Sync>) -> usize {
    DETACHED.lock().insert(frame)
}

/// Drops the registry's reference to a detached frame. Safe to call twice
/// for the same key; only the first call removes anything.
pub(crate) fn reclaim(key: usize) -> bool {
    DETACHED.lock().try_remove(key).is_some()
}

/// Number of detached frames that have not completed yet. Useful as a
/// shutdown diagnostic.
pub fn live_detached() -> usize {
    DETACHED.lock().len()
}
