//! Storage-and-transaction core for a relational database engine.
//!
//! ## Layers
//! - `storage` — page store (row bytes) and index store (sorted slot lists)
//! - `master` — the master table combining both, plus its garbage collector
//! - `catalog` — the table registry mapping `(schema, name)` to a master table
//! - `txn` — transactions, their per-table journals, and the commit-id system
//! - `lock` — table-granularity locking
//! - `worker` — the bounded worker pool that runs submitted commands
//! - `recovery` — the legacy index-file upgrade path
//! - `security` — privilege bitmask checks
//! - `types` — cells, rows, slots, and table definitions shared everywhere

pub mod catalog;
pub mod config;
pub mod lock;
pub mod master;
pub mod recovery;
pub mod security;
pub mod storage;
pub mod txn;
pub mod types;
pub mod worker;

mod error;

pub use catalog::TableRegistry;
pub use config::{BlockSize, DBConfig, DurabilityLevel, LockConfig, WorkerPoolConfig};
pub use error::{ConstraintCode, Result, StorageError};
pub use lock::{LockHandle, LockManager, LockMode};
pub use master::{MasterTable, MasterTableGc, MasterTableListener};
pub use recovery::convert_legacy_table;
pub use security::Privileges;
pub use txn::{Transaction, TransactionSystem};
pub use types::{Cell, CellTag, ColumnDef, DataTableDef, RecordState, Row, Slot};
pub use worker::WorkerPool;
