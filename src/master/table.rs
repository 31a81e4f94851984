//! Master Table: a page store (row bytes) plus an index store
//! (row presence and per-column sorted lists) combined behind the row
//! state machine.
//!
//! A row's `Slot` is the head sector id `PageStore::write_across`
//! returned for it — there is no separate slot→sector translation
//! table. The committed index set's list 0 is the presence list: the
//! set of slots currently in `CommittedAdded`.

use crate::master::gc::MasterTableGc;
use crate::master::listener::MasterTableListener;
use crate::storage::{IndexSet, IndexStore, PageStore};
use crate::types::{DataTableDef, RecordState, Row, Slot};
use crate::{Result, StorageError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// List index reserved for the row-presence list; column lists start at 1.
const PRESENCE_LIST: usize = 0;

pub struct MasterTable {
    def: parking_lot::RwLock<DataTableDef>,
    page_store: parking_lot::RwLock<PageStore>,
    index_store: IndexStore,
    states: DashMap<Slot, RecordState>,
    listeners: Mutex<Vec<Arc<dyn MasterTableListener>>>,
    /// Serializes row allocation against GC's slot reclamation so a
    /// freed sector can't be handed back out before its state entry is
    /// dropped.
    structural_lock: Mutex<()>,
    gc: MasterTableGc,
}

fn data_path(dir: &Path, def: &DataTableDef) -> PathBuf {
    dir.join(format!("{}.{}.dat", def.schema, def.name))
}

fn list_count_for(def: &DataTableDef) -> usize {
    1 + def.indexable_columns().count()
}

impl MasterTable {
    /// Creates the backing files for a brand-new table.
    pub fn create(def: DataTableDef, dir: &Path) -> Result<Self> {
        let path = data_path(dir, &def);
        let page_store = PageStore::create(&path, def.block_size())?;
        let index_store = IndexStore::new(list_count_for(&def));

        let table = Self {
            def: parking_lot::RwLock::new(def),
            page_store: parking_lot::RwLock::new(page_store),
            index_store,
            states: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
            structural_lock: Mutex::new(()),
            gc: MasterTableGc::new(crate::config::DBConfig::default().gc_full_sweep_threshold),
        };
        table.persist_index()?;
        Ok(table)
    }

    /// Opens an existing table, rebuilding in-memory row state from the
    /// persisted presence list. Anything not in `CommittedAdded` at the
    /// last flush was uncommitted and is gone — uncommitted work does
    /// not survive a crash.
    pub fn load(def: DataTableDef, dir: &Path) -> Result<Self> {
        let path = data_path(dir, &def);
        let page_store = PageStore::open(&path, false)?;
        let reserved = page_store.read_reserved_buffer()?;

        let head_sector = i32::from_be_bytes(reserved[0..4].try_into().unwrap());
        let unique_id = i64::from_be_bytes(reserved[8..16].try_into().unwrap());

        let index_set = if head_sector >= 0 {
            let bytes = page_store.read_across(head_sector as u64)?;
            bincode::deserialize::<IndexSet>(&bytes).map_err(|e| {
                StorageError::Corruption(format!("index set deserialization failed: {e}"))
            })?
        } else {
            IndexSet::with_list_count(list_count_for(&def))
        };

        let states = DashMap::new();
        if let Some(presence) = index_set.list(PRESENCE_LIST) {
            for &slot in presence.as_slice() {
                states.insert(slot as Slot, RecordState::CommittedAdded);
            }
        }

        let index_store = IndexStore::from_index_set(index_set, unique_id);

        Ok(Self {
            def: parking_lot::RwLock::new(def),
            page_store: parking_lot::RwLock::new(page_store),
            index_store,
            states,
            listeners: Mutex::new(Vec::new()),
            structural_lock: Mutex::new(()),
            gc: MasterTableGc::new(crate::config::DBConfig::default().gc_full_sweep_threshold),
        })
    }

    pub fn def(&self) -> DataTableDef {
        self.def.read().clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn MasterTableListener>) {
        self.listeners.lock().push(listener);
    }

    fn notify_added(&self, slot: Slot) {
        for l in self.listeners.lock().iter() {
            l.row_added(slot);
        }
    }

    fn notify_removed(&self, slot: Slot) {
        for l in self.listeners.lock().iter() {
            l.row_removed(slot);
        }
    }

    /// Acquires the lock that must be held while allocating a new row,
    /// to keep GC from recycling a slot mid-allocation.
    pub fn add_rows_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.structural_lock.lock()
    }

    /// Acquires the same structural lock from the collection side.
    pub fn remove_rows_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.structural_lock.lock()
    }

    /// Persists a row's bytes and marks it `Uncommitted`. Index
    /// placement and the `CommittedAdded` transition happen at commit
    /// time, driven by the transaction that owns this write.
    pub fn add_row(&self, row: &Row) -> Result<Slot> {
        let _guard = self.add_rows_lock();
        let bytes = bincode::serialize(row)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let slot = self.page_store.read().write_across(&bytes)?;
        self.states.insert(slot, RecordState::Uncommitted);
        Ok(slot)
    }

    pub fn get_cell_contents(&self, slot: Slot, column: usize) -> Result<crate::types::Cell> {
        let row = self.get_row(slot)?;
        row.get(column)
            .cloned()
            .ok_or_else(|| StorageError::Invariant(format!("no column {column} in row at slot {slot}")))
    }

    pub fn get_row(&self, slot: Slot) -> Result<Row> {
        let bytes = self.page_store.read().read_across(slot)?;
        bincode::deserialize(&bytes).map_err(|e| {
            StorageError::Corruption(format!("row deserialization failed at slot {slot}: {e}"))
        })
    }

    /// A reader-visible row is one currently in `CommittedAdded`. Callers
    /// doing snapshot-isolated reads instead consult their transaction's
    /// own `IndexSet` snapshot; this is the "latest committed" view.
    pub fn is_row_valid(&self, slot: Slot) -> bool {
        matches!(self.states.get(&slot).map(|s| *s), Some(RecordState::CommittedAdded))
    }

    pub fn row_count(&self) -> usize {
        self.index_store
            .snapshot()
            .list(PRESENCE_LIST)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    pub fn row_enumeration(&self) -> Vec<Slot> {
        self.index_store
            .snapshot()
            .list(PRESENCE_LIST)
            .map(|l| l.as_slice().iter().map(|&v| v as Slot).collect())
            .unwrap_or_default()
    }

    /// Transitions a freshly added row to `CommittedAdded` and fires the
    /// added-row listener hook. Index placement is the caller's
    /// responsibility (it holds the working `IndexSet`).
    pub fn mark_committed(&self, slot: Slot) -> Result<()> {
        self.transition(slot, RecordState::CommittedAdded)?;
        self.notify_added(slot);
        Ok(())
    }

    /// Transitions a live row to `CommittedRemoved`: still visible to
    /// snapshots predating this commit, invisible to new ones.
    pub fn mark_committed_removed(&self, slot: Slot) -> Result<()> {
        self.transition(slot, RecordState::CommittedRemoved)?;
        self.notify_removed(slot);
        Ok(())
    }

    /// Final reclamation once master GC has proven no snapshot can see
    /// this slot anymore. Frees its page-store storage.
    pub fn mark_deleted(&self, slot: Slot) -> Result<()> {
        let _guard = self.remove_rows_lock();
        self.transition(slot, RecordState::Deleted)?;
        self.page_store.read().free_chain(slot)?;
        self.states.remove(&slot);
        Ok(())
    }

    /// Rolls an uncommitted row straight back to reclaimable, per the
    /// state machine's rollback shortcut.
    pub fn rollback_row(&self, slot: Slot) -> Result<()> {
        let _guard = self.remove_rows_lock();
        self.transition(slot, RecordState::Deleted)?;
        self.page_store.read().free_chain(slot)?;
        self.states.remove(&slot);
        Ok(())
    }

    fn transition(&self, slot: Slot, next: RecordState) -> Result<()> {
        let mut entry = self
            .states
            .get_mut(&slot)
            .ok_or_else(|| StorageError::Invariant(format!("no row state at slot {slot}")))?;
        if !entry.can_transition_to(next) {
            return Err(StorageError::Invariant(format!(
                "illegal row transition {:?} -> {:?} at slot {slot}",
                *entry, next
            )));
        }
        *entry = next;
        Ok(())
    }

    pub fn index_store(&self) -> &IndexStore {
        &self.index_store
    }

    /// This table's own garbage collector, fed at commit time and swept
    /// once per commit against the oldest still-open snapshot.
    pub fn gc(&self) -> &MasterTableGc {
        &self.gc
    }

    pub fn next_unique_key(&self) -> i64 {
        self.index_store.next_unique_key()
    }

    /// Applies a topology change, rebuilding the index list count to
    /// match the new set of indexable columns.
    pub fn update(&self, new_columns: Vec<crate::types::ColumnDef>) -> Result<bool> {
        let mut def = self.def.write();
        let old_list_count = list_count_for(&def);
        let changed = def.apply_update(new_columns);
        if changed {
            let new_list_count = list_count_for(&def);
            if new_list_count != old_list_count {
                let mut set = (*self.index_store.snapshot()).clone();
                if new_list_count > old_list_count {
                    set.add_index_lists(new_list_count - old_list_count);
                } else {
                    set.truncate_lists(new_list_count);
                }
                self.index_store.commit_index_set(Arc::new(set));
            }
            drop(def);
            for l in self.listeners.lock().iter() {
                l.table_altered();
            }
        }
        Ok(changed)
    }

    /// Serializes the committed index set into the page store and
    /// repoints the reserved buffer at it, freeing the superseded chain.
    pub fn persist_index(&self) -> Result<()> {
        let page_store = self.page_store.read();
        let reserved_before = page_store.read_reserved_buffer()?;
        let old_head = i32::from_be_bytes(reserved_before[0..4].try_into().unwrap());

        let snapshot = self.index_store.snapshot();
        let bytes = bincode::serialize(&*snapshot)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let new_head = page_store.write_across(&bytes)?;

        let mut reserved = [0u8; crate::storage::RESERVED_BUFFER_SIZE];
        reserved[0..4].copy_from_slice(&(new_head as i32).to_be_bytes());
        reserved[8..16].copy_from_slice(&self.index_store.current_unique_key().to_be_bytes());
        page_store.write_reserved_buffer(&reserved)?;

        if old_head >= 0 {
            page_store.free_chain(old_head as u64)?;
        }
        Ok(())
    }

    /// Flushes the index set and fsyncs the backing file.
    pub fn do_maintenance(&self) -> Result<()> {
        self.persist_index()?;
        self.page_store.read().hard_synch()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.do_maintenance()
    }

    /// Updates the in-memory definition's name, ahead of `update_file`
    /// renaming the backing file to match.
    pub fn rename(&self, new_name: &str) {
        self.def.write().name = new_name.to_string();
    }

    /// Renames the backing file on disk to match the current
    /// definition, keeping the open handle valid.
    pub fn update_file(&self, new_dir: &Path) -> Result<()> {
        let def = self.def.read();
        let new_path = data_path(new_dir, &def);
        let mut page_store = self.page_store.write();
        std::fs::rename(page_store.path(), &new_path)?;
        page_store.set_path(new_path);
        Ok(())
    }

    /// Deletes the backing file entirely. Consumes the table.
    pub fn drop_table(self) -> Result<()> {
        self.page_store.into_inner().delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Cell, CellTag, ColumnDef};
    use tempfile::tempdir;

    fn sample_def() -> DataTableDef {
        DataTableDef::new(
            "APP",
            "widgets",
            vec![
                ColumnDef::new("id", CellTag::Numeric).not_null(),
                ColumnDef::new("name", CellTag::Text),
            ],
        )
    }

    #[test]
    fn add_row_then_read_back() {
        let dir = tempdir().unwrap();
        let table = MasterTable::create(sample_def(), dir.path()).unwrap();
        let row = Row::new(vec![Cell::Numeric(1), Cell::Text("widget".into())]);
        let slot = table.add_row(&row).unwrap();

        let read = table.get_row(slot).unwrap();
        assert_eq!(read.get(1), Some(&Cell::Text("widget".into())));
        assert!(!table.is_row_valid(slot), "uncommitted rows aren't valid yet");
    }

    #[test]
    fn commit_then_remove_then_reclaim() {
        let dir = tempdir().unwrap();
        let table = MasterTable::create(sample_def(), dir.path()).unwrap();
        let row = Row::new(vec![Cell::Numeric(7), Cell::Null]);
        let slot = table.add_row(&row).unwrap();

        table.mark_committed(slot).unwrap();
        assert!(table.is_row_valid(slot));

        table.mark_committed_removed(slot).unwrap();
        assert!(!table.is_row_valid(slot));

        table.mark_deleted(slot).unwrap();
        assert!(table.get_row(slot).is_err(), "storage should be freed");
    }

    #[test]
    fn rollback_discards_uncommitted_row() {
        let dir = tempdir().unwrap();
        let table = MasterTable::create(sample_def(), dir.path()).unwrap();
        let slot = table.add_row(&Row::new(vec![Cell::Numeric(1), Cell::Null])).unwrap();
        table.rollback_row(slot).unwrap();
        assert!(table.get_row(slot).is_err());
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let dir = tempdir().unwrap();
        let table = MasterTable::create(sample_def(), dir.path()).unwrap();
        let slot = table.add_row(&Row::new(vec![Cell::Numeric(1), Cell::Null])).unwrap();
        assert!(table.mark_committed_removed(slot).is_err());
    }

    #[test]
    fn persisted_index_survives_reload() {
        let dir = tempdir().unwrap();
        let def = sample_def();
        {
            let table = MasterTable::create(def.clone(), dir.path()).unwrap();
            let slot = table.add_row(&Row::new(vec![Cell::Numeric(1), Cell::Null])).unwrap();
            table.mark_committed(slot).unwrap();

            let mut set = (*table.index_store().snapshot()).clone();
            set.list_mut(0).unwrap().insert_sorted(slot as i64);
            table.index_store().commit_index_set(Arc::new(set));

            table.do_maintenance().unwrap();
        }

        let table = MasterTable::load(def, dir.path()).unwrap();
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn update_file_renames_on_disk() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let table = MasterTable::create(sample_def(), dir.path()).unwrap();
        table.update_file(other.path()).unwrap();
        assert!(other.path().join("APP.widgets.dat").exists());
    }
}
