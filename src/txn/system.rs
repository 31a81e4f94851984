//! Transaction System: the commit-id counter and commit lock
//! every `Transaction` shares, plus bookkeeping of which commit ids are
//! still reachable from an open snapshot — the input master GC needs
//! to decide what's safe to reclaim.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct TransactionSystem {
    next_commit_id: AtomicU64,
    /// Serializes the check-then-apply step of every commit across the
    /// whole engine. Table-level concurrency for unrelated work still
    /// comes from the locking mechanism; this lock only guards
    /// the instant where visibility actually changes.
    commit_lock: Mutex<()>,
    open_start_ids: Mutex<BTreeSet<u64>>,
}

impl TransactionSystem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new transaction's snapshot and returns the commit id
    /// it should read as-of: the highest commit id visible so far.
    /// Commit id 0 means "nothing has committed yet".
    pub fn begin(&self) -> u64 {
        let id = self.next_commit_id.load(Ordering::SeqCst);
        self.open_start_ids.lock().insert(id);
        id
    }

    pub fn end(&self, start_commit_id: u64) {
        self.open_start_ids.lock().remove(&start_commit_id);
    }

    /// Acquires the global commit lock and allocates the next commit id
    /// under it, so the id handed to a committing transaction is always
    /// strictly greater than every id already visible to an open
    /// snapshot.
    pub fn acquire_commit_slot(&self) -> CommitSlot<'_> {
        let guard = self.commit_lock.lock();
        let id = self.next_commit_id.fetch_add(1, Ordering::SeqCst) + 1;
        CommitSlot { _guard: guard, id }
    }

    /// The smallest start-commit-id among currently open transactions,
    /// or the latest commit id if none are open (meaning everything
    /// committed so far is unconditionally reclaimable).
    pub fn oldest_open_commit_id(&self) -> u64 {
        self.open_start_ids
            .lock()
            .iter()
            .next()
            .copied()
            .unwrap_or_else(|| self.next_commit_id.load(Ordering::SeqCst))
    }
}

impl Default for TransactionSystem {
    fn default() -> Self {
        Self {
            next_commit_id: AtomicU64::new(0),
            commit_lock: Mutex::new(()),
            open_start_ids: Mutex::new(BTreeSet::new()),
        }
    }
}

/// RAII handle over the commit id allocated for one commit. Holding
/// this keeps the global commit lock held until the transaction either
/// applies its changes or gives up.
pub struct CommitSlot<'a> {
    _guard: parking_lot::MutexGuard<'a, ()>,
    id: u64,
}

impl CommitSlot<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }
}
