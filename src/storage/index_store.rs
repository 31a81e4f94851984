//! Index Store: per-table collections of sorted integer lists
//! (one per indexable column, plus the master "row is present" list),
//! with copy-on-write snapshotting so a transaction's view is stable
//! while other transactions keep mutating their own working set.
//!
//! A snapshot is a cheap `Arc`-shared clone of the current index set;
//! mutating a list under an open snapshot clones that one list
//! (`Arc::make_mut`), not the whole set.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A sorted list of `i64` row slots, one per indexed column (or the
/// table's row-presence list). Sorted ascending; duplicates are allowed
/// unless the list backs a unique index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexList {
    entries: Vec<i64>,
}

impl IndexList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_sorted(entries: Vec<i64>) -> Self {
        debug_assert!(entries.windows(2).all(|w| w[0] <= w[1]));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<i64> {
        self.entries.get(position).copied()
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.entries
    }

    pub fn contains(&self, value: i64) -> bool {
        self.entries.binary_search(&value).is_ok()
    }

    /// Inserts `value`, keeping order; duplicates land adjacent to their
    /// equal neighbors.
    pub fn insert_sorted(&mut self, value: i64) {
        let pos = self
            .entries
            .binary_search(&value)
            .unwrap_or_else(|pos| pos);
        self.entries.insert(pos, value);
    }

    /// Inserts `value` only if absent; returns `false` on a duplicate
    /// (unique-index violation at the caller's discretion).
    pub fn unique_insert_sorted(&mut self, value: i64) -> bool {
        match self.entries.binary_search(&value) {
            Ok(_) => false,
            Err(pos) => {
                self.entries.insert(pos, value);
                true
            }
        }
    }

    /// Removes the first occurrence of `value`. Returns `false` if absent.
    pub fn remove(&mut self, value: i64) -> bool {
        match self.entries.binary_search(&value) {
            Ok(pos) => {
                self.entries.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Half-open range scan `[low, high)` over the sorted entries.
    pub fn range(&self, low: i64, high: i64) -> &[i64] {
        let start = self.entries.partition_point(|&v| v < low);
        let end = self.entries.partition_point(|&v| v < high);
        &self.entries[start..end]
    }
}

/// The full set of index lists for one table at one point in time.
/// Index `0` is reserved for the master row-presence list; the
/// rest map 1:1 to the table's indexable columns in column order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexSet {
    lists: Vec<Arc<IndexList>>,
}

impl IndexSet {
    pub fn with_list_count(count: usize) -> Self {
        Self {
            lists: (0..count).map(|_| Arc::new(IndexList::new())).collect(),
        }
    }

    pub fn list_count(&self) -> usize {
        self.lists.len()
    }

    pub fn list(&self, index: usize) -> Option<&IndexList> {
        self.lists.get(index).map(|a| a.as_ref())
    }

    /// Mutable access, cloning the individual list only if another
    /// snapshot still shares it.
    pub fn list_mut(&mut self, index: usize) -> Result<&mut IndexList> {
        let slot = self
            .lists
            .get_mut(index)
            .ok_or_else(|| StorageError::Invariant(format!("no index list at position {index}")))?;
        Ok(Arc::make_mut(slot))
    }

    pub fn add_index_lists(&mut self, additional: usize) {
        for _ in 0..additional {
            self.lists.push(Arc::new(IndexList::new()));
        }
    }

    /// Drops trailing lists down to `count`, used when a column is
    /// dropped and its scheme no longer exists.
    pub fn truncate_lists(&mut self, count: usize) {
        self.lists.truncate(count);
    }
}

/// Owns the canonical committed `IndexSet` for one table, handing out
/// cheap snapshots and accepting new committed sets atomically. Also
/// stores the monotonically increasing unique-key counter that row
/// insertion draws from.
pub struct IndexStore {
    committed: parking_lot::RwLock<Arc<IndexSet>>,
    next_unique_key: AtomicI64,
}

impl IndexStore {
    pub fn new(list_count: usize) -> Self {
        Self {
            committed: parking_lot::RwLock::new(Arc::new(IndexSet::with_list_count(list_count))),
            next_unique_key: AtomicI64::new(0),
        }
    }

    pub fn from_index_set(set: IndexSet, unique_id_seed: i64) -> Self {
        Self {
            committed: parking_lot::RwLock::new(Arc::new(set)),
            next_unique_key: AtomicI64::new(unique_id_seed),
        }
    }

    /// A point-in-time, `Arc`-cheap view a transaction can read and
    /// mutate locally without affecting other transactions.
    pub fn snapshot(&self) -> Arc<IndexSet> {
        self.committed.read().clone()
    }

    /// Installs `new_set` as the new committed state. Callers (the
    /// transaction commit path, under the table's commit lock) are
    /// responsible for conflict detection before calling this.
    pub fn commit_index_set(&self, new_set: Arc<IndexSet>) {
        *self.committed.write() = new_set;
    }

    pub fn set_unique_id(&self, value: i64) {
        self.next_unique_key.store(value, Ordering::SeqCst);
    }

    /// Atomically returns the next unique key and advances the counter.
    pub fn next_unique_key(&self) -> i64 {
        self.next_unique_key.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_unique_key(&self) -> i64 {
        self.next_unique_key.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_sorted_keeps_order() {
        let mut list = IndexList::new();
        for v in [5, 1, 3, 2, 4] {
            list.insert_sorted(v);
        }
        assert_eq!(list.as_slice(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn unique_insert_rejects_duplicate() {
        let mut list = IndexList::new();
        assert!(list.unique_insert_sorted(10));
        assert!(!list.unique_insert_sorted(10));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_absent_value_is_noop() {
        let mut list = IndexList::from_sorted(vec![1, 2, 3]);
        assert!(!list.remove(99));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn range_scan_is_half_open() {
        let list = IndexList::from_sorted(vec![1, 2, 2, 3, 5, 8]);
        assert_eq!(list.range(2, 5), &[2, 2, 3]);
        assert_eq!(list.range(8, 100), &[8]);
        assert_eq!(list.range(100, 200), &[] as &[i64]);
    }

    #[test]
    fn snapshot_is_isolated_from_later_commits() {
        let store = IndexStore::new(1);
        let snap1 = store.snapshot();
        assert_eq!(snap1.list(0).unwrap().len(), 0);

        let mut mutated = (*store.snapshot()).clone();
        mutated.list_mut(0).unwrap().insert_sorted(42);
        store.commit_index_set(Arc::new(mutated));

        // Snapshot taken before the commit still sees the old, empty list.
        assert_eq!(snap1.list(0).unwrap().len(), 0);
        let snap2 = store.snapshot();
        assert_eq!(snap2.list(0).unwrap().len(), 1);
    }

    #[test]
    fn unique_key_counter_is_monotonic() {
        let store = IndexStore::new(0);
        let a = store.next_unique_key();
        let b = store.next_unique_key();
        assert!(b > a);
    }

    #[test]
    fn add_index_lists_extends_in_place() {
        let mut set = IndexSet::with_list_count(2);
        set.add_index_lists(1);
        assert_eq!(set.list_count(), 3);
        assert_eq!(set.list(2).unwrap().len(), 0);
    }
}
