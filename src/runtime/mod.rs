//! Worker pool, scheduling bridge and the blocking event-loop facade.

mod bridge;
mod builder;
mod pool;
mod runtime;

pub use bridge::{Bridge, Schedule};
pub use builder::Builder;
pub use pool::WorkerPool;
pub use runtime::Runtime;
