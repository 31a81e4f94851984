//! Bounded worker pool draining command runnables.

pub mod pool;

pub use pool::{Command, WorkerPool};
