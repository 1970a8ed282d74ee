//! Worker pool: long-lived automation contexts and the scheduler that
//! serializes jobs onto them.
//!
//! - [`Worker`] - one automation context, runs exactly one job at a time
//! - [`WorkerPool`] - fixed-size pool with a FIFO queue and dispatch logic

mod pool;
mod session;

pub use pool::{JobHandle, WorkerPool};
pub use session::Worker;

pub(crate) use session::ExecutionContext;
