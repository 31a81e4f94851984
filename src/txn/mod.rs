//! Transaction layer: the table journal, the shared commit-id system,
//! and the transaction that ties a per-table snapshot to its journal.

pub mod journal;
pub mod system;
pub mod transaction;

pub use journal::{JournalEntry, JournalEntryKind, TableJournal};
pub use system::TransactionSystem;
pub use transaction::Transaction;
