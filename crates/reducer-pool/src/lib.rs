#![doc = include_str!("../README.md")]

pub mod batch;
pub mod config;
pub mod pool;
pub mod telemetry;

pub use config::PoolConfig;
pub use pool::{PendingResponse, PoolStats, WorkerPool};
pub use reducer_core;
