//! Master GC: reclaims `CommittedRemoved` slots once no open
//! transaction's snapshot predates the commit that removed them.
//!
//! Each pending slot is stamped with the commit id that removed it.
//! A slot is reclaimable once every currently open transaction started
//! at or after that commit id — meaning no snapshot still needs to see
//! the row in its pre-removal state.

use crate::master::table::MasterTable;
use crate::types::Slot;
use crate::Result;
use parking_lot::Mutex;

pub struct MasterTableGc {
    pending: Mutex<Vec<(Slot, u64)>>,
    full_sweep_threshold: usize,
}

impl MasterTableGc {
    pub fn new(full_sweep_threshold: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            full_sweep_threshold,
        }
    }

    /// Queues a slot that just transitioned to `CommittedRemoved` at
    /// `removed_at` (the commit id that performed the removal).
    pub fn mark_row_as_deleted(&self, slot: Slot, removed_at: u64) {
        self.pending.lock().push((slot, removed_at));
    }

    /// Whether the pending queue has grown past the point where an
    /// incremental sweep is worth it over a full one.
    pub fn mark_full_sweep(&self) -> bool {
        self.pending.lock().len() >= self.full_sweep_threshold
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sweeps the pending queue, reclaiming every slot removed strictly
    /// before `oldest_open_commit_id`. Returns the number reclaimed.
    pub fn perform_collection_event(
        &self,
        table: &MasterTable,
        oldest_open_commit_id: u64,
    ) -> Result<usize> {
        let mut pending = self.pending.lock();
        let before = pending.len();
        tracing::debug!(before, oldest_open_commit_id, "gc sweep start");
        let mut still_pending = Vec::with_capacity(pending.len());
        let mut reclaimed = 0;

        for (slot, removed_at) in pending.drain(..) {
            if removed_at < oldest_open_commit_id {
                table.mark_deleted(slot)?;
                reclaimed += 1;
            } else {
                still_pending.push((slot, removed_at));
            }
        }
        *pending = still_pending;
        tracing::debug!(reclaimed, still_pending = pending.len(), "gc sweep end");
        Ok(reclaimed)
    }
}
