//! The worker pool.
//!
//! - [`WorkerPool`]: lifecycle and submission API.
//! - `dispatcher`: the actor that owns the queue and assigns tasks.
//! - `worker`: one codec per OS thread, processing a task at a time.
//! - [`PendingResponse`]: the future a caller awaits for its result.

mod dispatcher;
mod manager;
mod pending;
mod request;
mod worker;

#[cfg(test)]
mod tests;

pub use dispatcher::PoolStats;
pub use manager::WorkerPool;
pub use pending::PendingResponse;
