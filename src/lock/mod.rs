//! Table-granularity locking mechanism.

pub mod manager;

pub use manager::{LockHandle, LockManager, LockMode, TableKey};
