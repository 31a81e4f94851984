//! Transaction: per-table journal plus a snapshot index set,
//! with optimistic conflict detection at commit and savepoint-based
//! partial rollback.
//!
//! A transaction never blocks other transactions while it runs — it
//! reads its own snapshot and writes into its own journal. Visibility
//! only changes for everyone else at `commit`, under the transaction
//! system's single commit lock, and only after every touched table's
//! journal has been checked against what's actually committed now.

use crate::master::MasterTable;
use crate::storage::IndexSet;
use crate::txn::journal::TableJournal;
use crate::txn::system::TransactionSystem;
use crate::types::{Row, Slot};
use crate::{Result, StorageError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

type TableKey = (String, String);

struct TouchedTable {
    table: Arc<MasterTable>,
    /// The committed index set as of this transaction's start — used
    /// only to let the transaction see its own prior writes layered on
    /// top of what was committed when it began; never written back.
    base_snapshot: Arc<IndexSet>,
    journal: TableJournal,
    /// Slots read from `base_snapshot` (not added by this transaction
    /// itself) whose continued presence this transaction's commit
    /// implicitly depends on, even though it never wrote to them.
    reads: HashSet<Slot>,
}

struct Savepoint {
    name: String,
    journal_lengths: HashMap<TableKey, usize>,
}

/// A single unit of work against one or more tables.
pub struct Transaction {
    system: Arc<TransactionSystem>,
    start_commit_id: u64,
    touched: HashMap<TableKey, TouchedTable>,
    savepoints: Vec<Savepoint>,
    finished: bool,
}

impl Transaction {
    pub fn begin(system: Arc<TransactionSystem>) -> Self {
        let start_commit_id = system.begin();
        tracing::debug!(start_commit_id, "transaction begin");
        Self {
            system,
            start_commit_id,
            touched: HashMap::new(),
            savepoints: Vec::new(),
            finished: false,
        }
    }

    pub fn start_commit_id(&self) -> u64 {
        self.start_commit_id
    }

    fn key_of(table: &MasterTable) -> TableKey {
        let def = table.def();
        (def.schema, def.name)
    }

    fn touch(&mut self, table: &Arc<MasterTable>) -> &mut TouchedTable {
        let key = Self::key_of(table);
        self.touched.entry(key).or_insert_with(|| TouchedTable {
            base_snapshot: table.index_store().snapshot(),
            journal: TableJournal::new(),
            reads: HashSet::new(),
            table: table.clone(),
        })
    }

    /// Reads a row under this transaction's snapshot, recording the read
    /// so that a concurrent removal of it conflicts at commit even when
    /// this transaction never itself writes to `slot` — without this,
    /// a transaction could read a row another one removes and commit an
    /// unrelated change as though the row were still there (write skew).
    ///
    /// Rows this transaction added itself are not tracked this way:
    /// their presence at commit depends only on this transaction's own
    /// journal, already covered by the removal-conflict check.
    pub fn read(&mut self, table: &Arc<MasterTable>, slot: Slot) -> Result<Row> {
        if !self.sees(table, slot) {
            return Err(StorageError::Invariant(format!(
                "slot {slot} not visible to this transaction's snapshot"
            )));
        }
        let touched = self.touch(table);
        let locally_added = touched
            .journal
            .entries()
            .iter()
            .any(|e| e.slot == slot && !e.is_removal());
        if !locally_added {
            touched.reads.insert(slot);
        }
        table.get_row(slot)
    }

    /// Inserts a row, visible to later reads/removals in this
    /// transaction immediately, to everyone else only after commit.
    pub fn insert(&mut self, table: &Arc<MasterTable>, row: &Row) -> Result<Slot> {
        let slot = table.add_row(row)?;
        self.touch(table).journal.add_row(slot);
        Ok(slot)
    }

    /// Marks `slot` for removal, provided this transaction's snapshot
    /// still considers it present.
    pub fn remove(&mut self, table: &Arc<MasterTable>, slot: Slot) -> Result<()> {
        if !self.sees(table, slot) {
            return Err(StorageError::Invariant(format!(
                "slot {slot} not visible to this transaction's snapshot"
            )));
        }
        self.touch(table).journal.remove_row(slot);
        Ok(())
    }

    /// Records an update as a remove of `old_slot` and an add of the
    /// freshly written `new_row`, returning its slot.
    pub fn update(&mut self, table: &Arc<MasterTable>, old_slot: Slot, new_row: &Row) -> Result<Slot> {
        if !self.sees(table, old_slot) {
            return Err(StorageError::Invariant(format!(
                "slot {old_slot} not visible to this transaction's snapshot"
            )));
        }
        let new_slot = table.add_row(new_row)?;
        self.touch(table).journal.update_row(old_slot, new_slot);
        Ok(new_slot)
    }

    /// Whether this transaction's view currently includes `slot`:
    /// present in the base snapshot and not yet removed by this
    /// transaction itself, or added earlier in this same transaction.
    pub fn sees(&self, table: &MasterTable, slot: Slot) -> bool {
        let key = Self::key_of(table);
        let locally_added = self
            .touched
            .get(&key)
            .map(|t| {
                t.journal
                    .entries()
                    .iter()
                    .any(|e| e.slot == slot && !e.is_removal())
            })
            .unwrap_or(false);
        let locally_removed = self
            .touched
            .get(&key)
            .map(|t| t.journal.entries().iter().any(|e| e.slot == slot && e.is_removal()))
            .unwrap_or(false);
        if locally_removed {
            return false;
        }
        if locally_added {
            return true;
        }
        let base = self
            .touched
            .get(&key)
            .map(|t| t.base_snapshot.clone())
            .unwrap_or_else(|| table.index_store().snapshot());
        base.list(0).map(|l| l.contains(slot as i64)).unwrap_or(false)
    }

    /// Names the current point in this transaction for later partial
    /// rollback.
    pub fn savepoint(&mut self, name: impl Into<String>) {
        let lengths = self
            .touched
            .iter()
            .map(|(k, t)| (k.clone(), t.journal.len()))
            .collect();
        self.savepoints.push(Savepoint {
            name: name.into(),
            journal_lengths: lengths,
        });
    }

    /// Rolls every touched table's journal back to the length it had
    /// when `name` was recorded, discarding rows added after it. Pops
    /// the named savepoint and everything recorded after it.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        let position = self
            .savepoints
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| StorageError::Usage(format!("no savepoint named {name}")))?;

        let target = self.savepoints.split_off(position);
        let lengths = &target[0].journal_lengths;

        for (key, touched) in self.touched.iter_mut() {
            let keep = lengths.get(key).copied().unwrap_or(0);
            for entry in touched.journal.entries()[keep..].iter() {
                if !entry.is_removal() {
                    touched.table.rollback_row(entry.slot)?;
                }
            }
            touched.journal.truncate(keep);
        }
        Ok(())
    }

    /// Validates every touched table's journal against what's actually
    /// committed now, then applies it. All-or-nothing across tables.
    pub fn commit(mut self) -> Result<u64> {
        let commit_slot = self.system.acquire_commit_slot();
        let commit_id = commit_slot.id();

        let conflict = self.touched.values().find_map(|touched| {
            let current = touched.table.index_store().snapshot();
            let presence = current.list(0);
            let still_present = |slot: Slot| presence.map(|l| l.contains(slot as i64)).unwrap_or(false);

            let removal_conflict = touched.journal.entries().iter().find_map(|entry| {
                if entry.is_removal() && !still_present(entry.slot) {
                    Some(entry.slot)
                } else {
                    None
                }
            });
            if removal_conflict.is_some() {
                return removal_conflict;
            }

            // A row this transaction only read must still be present —
            // otherwise another transaction removed it and committed
            // first, and this transaction's unrelated writes may have
            // been decided under a stale assumption (write skew).
            touched
                .reads
                .iter()
                .find_map(|&slot| if !still_present(slot) { Some(slot) } else { None })
        });

        if let Some(conflicting_slot) = conflict {
            drop(commit_slot);
            self.rollback_uncommitted()?;
            self.finished = true;
            tracing::warn!(
                start_commit_id = self.start_commit_id,
                slot = conflicting_slot,
                "transaction commit conflict"
            );
            return Err(StorageError::Conflict(format!(
                "slot {conflicting_slot} was removed by another transaction"
            )));
        }

        for touched in self.touched.values() {
            let mut set = (*touched.table.index_store().snapshot()).clone();
            {
                let presence = set.list_mut(0)?;
                for entry in touched.journal.entries() {
                    if entry.is_removal() {
                        presence.remove(entry.slot as i64);
                    } else {
                        presence.insert_sorted(entry.slot as i64);
                    }
                }
            }
            for entry in touched.journal.entries() {
                if entry.is_removal() {
                    touched.table.mark_committed_removed(entry.slot)?;
                    touched.table.gc().mark_row_as_deleted(entry.slot, commit_id);
                } else {
                    touched.table.mark_committed(entry.slot)?;
                }
            }
            touched.table.index_store().commit_index_set(Arc::new(set));
        }

        self.finished = true;
        self.system.end(self.start_commit_id);

        let oldest_open_commit_id = self.system.oldest_open_commit_id();
        for touched in self.touched.values() {
            let reclaimed = touched
                .table
                .gc()
                .perform_collection_event(&touched.table, oldest_open_commit_id)?;
            if reclaimed > 0 {
                tracing::debug!(commit_id, reclaimed, "gc reclaimed slots at commit");
            }
        }

        tracing::debug!(commit_id, "transaction commit");
        Ok(commit_id)
    }

    /// Discards every uncommitted write this transaction made.
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_uncommitted()?;
        self.finished = true;
        tracing::debug!(start_commit_id = self.start_commit_id, "transaction rollback");
        Ok(())
    }

    fn rollback_uncommitted(&mut self) -> Result<()> {
        for touched in self.touched.values() {
            for entry in touched.journal.entries() {
                if !entry.is_removal() {
                    touched.table.rollback_row(entry.slot)?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.system.end(self.start_commit_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cell, CellTag, ColumnDef, DataTableDef};
    use tempfile::tempdir;

    fn sample_table(dir: &std::path::Path) -> Arc<MasterTable> {
        let def = DataTableDef::new(
            "APP",
            "widgets",
            vec![ColumnDef::new("id", CellTag::Numeric).not_null()],
        );
        Arc::new(MasterTable::create(def, dir).unwrap())
    }

    #[test]
    fn insert_then_commit_is_visible_to_new_transactions() {
        let dir = tempdir().unwrap();
        let table = sample_table(dir.path());
        let system = TransactionSystem::new();

        let mut txn = Transaction::begin(system.clone());
        let slot = txn.insert(&table, &Row::new(vec![Cell::Numeric(1)])).unwrap();
        txn.commit().unwrap();

        assert!(table.is_row_valid(slot));
    }

    #[test]
    fn uncommitted_insert_is_invisible_to_others() {
        let dir = tempdir().unwrap();
        let table = sample_table(dir.path());
        let system = TransactionSystem::new();

        let mut txn = Transaction::begin(system.clone());
        let slot = txn.insert(&table, &Row::new(vec![Cell::Numeric(1)])).unwrap();
        assert!(!table.is_row_valid(slot));
        txn.rollback().unwrap();
        assert!(table.get_row(slot).is_err());
    }

    #[test]
    fn concurrent_remove_of_same_row_conflicts() {
        let dir = tempdir().unwrap();
        let table = sample_table(dir.path());
        let system = TransactionSystem::new();

        let mut setup = Transaction::begin(system.clone());
        let slot = setup.insert(&table, &Row::new(vec![Cell::Numeric(1)])).unwrap();
        setup.commit().unwrap();

        let mut txn_a = Transaction::begin(system.clone());
        let mut txn_b = Transaction::begin(system.clone());
        txn_a.remove(&table, slot).unwrap();
        txn_b.remove(&table, slot).unwrap();

        txn_a.commit().unwrap();
        let result = txn_b.commit();
        assert!(result.is_err());
    }

    #[test]
    fn savepoint_rollback_discards_only_later_writes() {
        let dir = tempdir().unwrap();
        let table = sample_table(dir.path());
        let system = TransactionSystem::new();

        let mut txn = Transaction::begin(system.clone());
        let first = txn.insert(&table, &Row::new(vec![Cell::Numeric(1)])).unwrap();
        txn.savepoint("sp1");
        let second = txn.insert(&table, &Row::new(vec![Cell::Numeric(2)])).unwrap();

        txn.rollback_to_savepoint("sp1").unwrap();
        assert!(table.get_row(second).is_err());
        assert!(table.get_row(first).is_ok());

        txn.commit().unwrap();
        assert!(table.is_row_valid(first));
    }

    #[test]
    fn update_conflicts_like_remove() {
        let dir = tempdir().unwrap();
        let table = sample_table(dir.path());
        let system = TransactionSystem::new();

        let mut setup = Transaction::begin(system.clone());
        let slot = setup.insert(&table, &Row::new(vec![Cell::Numeric(1)])).unwrap();
        setup.commit().unwrap();

        let mut txn_a = Transaction::begin(system.clone());
        let mut txn_b = Transaction::begin(system.clone());
        txn_a.update(&table, slot, &Row::new(vec![Cell::Numeric(2)])).unwrap();
        txn_b.remove(&table, slot).unwrap();

        txn_a.commit().unwrap();
        assert!(txn_b.commit().is_err());
    }

    #[test]
    fn reading_a_row_another_transaction_removes_conflicts_on_commit() {
        let dir = tempdir().unwrap();
        let table = sample_table(dir.path());
        let system = TransactionSystem::new();

        let mut setup = Transaction::begin(system.clone());
        let slot = setup.insert(&table, &Row::new(vec![Cell::Numeric(1)])).unwrap();
        setup.commit().unwrap();

        let mut reader = Transaction::begin(system.clone());
        let mut remover = Transaction::begin(system.clone());

        // `reader` never touches `slot`'s table otherwise, but its
        // decision elsewhere depends on having read it.
        reader.read(&table, slot).unwrap();
        let unrelated = reader
            .insert(&table, &Row::new(vec![Cell::Numeric(99)]))
            .unwrap();

        remover.remove(&table, slot).unwrap();
        remover.commit().unwrap();

        let result = reader.commit();
        assert!(result.is_err(), "read row was concurrently removed, should conflict");
        assert!(table.get_row(unrelated).is_err(), "rolled back insert should be discarded");
    }

    #[test]
    fn reading_a_row_this_transaction_added_itself_does_not_conflict() {
        let dir = tempdir().unwrap();
        let table = sample_table(dir.path());
        let system = TransactionSystem::new();

        let mut txn = Transaction::begin(system.clone());
        let slot = txn.insert(&table, &Row::new(vec![Cell::Numeric(1)])).unwrap();
        txn.read(&table, slot).unwrap();
        txn.commit().unwrap();

        assert!(table.is_row_valid(slot));
    }

    #[test]
    fn commit_feeds_gc_which_reclaims_once_no_snapshot_needs_the_row() {
        let dir = tempdir().unwrap();
        let table = sample_table(dir.path());
        let system = TransactionSystem::new();

        let mut setup = Transaction::begin(system.clone());
        let slot = setup.insert(&table, &Row::new(vec![Cell::Numeric(1)])).unwrap();
        setup.commit().unwrap();

        // Keep a reader open across the remove so the slot can't be
        // reclaimed yet.
        let reader = Transaction::begin(system.clone());

        let mut remover = Transaction::begin(system.clone());
        remover.remove(&table, slot).unwrap();
        remover.commit().unwrap();
        assert!(table.get_row(slot).is_ok(), "still needed by the open reader's snapshot");

        reader.rollback().unwrap();

        // A later commit's GC pass sees no open snapshot predates the
        // removal anymore and reclaims the slot.
        let mut trailing = Transaction::begin(system.clone());
        trailing.insert(&table, &Row::new(vec![Cell::Numeric(2)])).unwrap();
        trailing.commit().unwrap();

        assert!(table.get_row(slot).is_err(), "slot should have been reclaimed by now");
    }
}
