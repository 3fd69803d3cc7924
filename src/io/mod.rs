//! Descriptor ownership and the operation futures issued against the
//! per-thread reactor.

mod fd;
mod ops;

pub use fd::Fd;
pub use ops::{Nop, Op, OpSpec, Recv, Splice, nop, recv, splice};
