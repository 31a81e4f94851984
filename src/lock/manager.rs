//! Table-granularity locking: one FIFO wait queue per table,
//! READ/WRITE claims, and a stable acquisition order that rules out
//! deadlock by construction instead of detecting it after the fact.
//!
//! Every caller that needs more than one table sorts its claims by
//! `(schema, name)` before acquiring — as long as every caller does
//! that, two transactions can never hold-and-wait on each other in a
//! cycle. `LockManager::lock` does the sorting itself so callers can't
//! get this wrong.

use crate::Result;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

pub type TableKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

struct TableLock {
    state: Mutex<LockState>,
    condvar: Condvar,
}

#[derive(Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

impl LockState {
    fn available_for(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => !self.writer,
            LockMode::Write => !self.writer && self.readers == 0,
        }
    }
}

#[derive(Clone, Default)]
pub struct LockManager {
    tables: Arc<DashMap<TableKey, Arc<TableLock>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_for(&self, key: &TableKey) -> Arc<TableLock> {
        self.tables
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(TableLock {
                    state: Mutex::new(LockState::default()),
                    condvar: Condvar::new(),
                })
            })
            .clone()
    }

    fn acquire_one(&self, key: &TableKey, mode: LockMode) {
        let entry = self.entry_for(key);
        let mut state = entry.state.lock();
        while !state.available_for(mode) {
            tracing::trace!(schema = %key.0, table = %key.1, ?mode, "lock contention");
            entry.condvar.wait(&mut state);
        }
        match mode {
            LockMode::Read => state.readers += 1,
            LockMode::Write => state.writer = true,
        }
        tracing::trace!(schema = %key.0, table = %key.1, ?mode, "lock acquired");
    }

    fn release_one(&self, key: &TableKey, mode: LockMode) {
        let entry = self.entry_for(key);
        {
            let mut state = entry.state.lock();
            match mode {
                LockMode::Read => state.readers = state.readers.saturating_sub(1),
                LockMode::Write => state.writer = false,
            }
        }
        entry.condvar.notify_all();
        tracing::trace!(schema = %key.0, table = %key.1, ?mode, "lock released");
    }

    /// Acquires every requested table claim, in a stable sorted order,
    /// and returns a handle that must be unlocked explicitly.
    pub fn lock(&self, mut claims: Vec<(TableKey, LockMode)>) -> Result<LockHandle> {
        claims.sort_by(|a, b| a.0.cmp(&b.0));
        let mut held = Vec::with_capacity(claims.len());
        for (key, mode) in claims {
            self.acquire_one(&key, mode);
            held.push((key, mode));
        }
        Ok(LockHandle {
            manager: self.clone(),
            held,
            released: false,
        })
    }

    pub fn lock_one(&self, key: TableKey, mode: LockMode) -> Result<LockHandle> {
        self.lock(vec![(key, mode)])
    }
}

/// RAII handle over a set of table locks, released in reverse
/// (LIFO) acquisition order by `unlock_all`. If a caller drops this
/// without calling `unlock_all`, the locks are still released — but a
/// `tracing::error!` fires first, since that always indicates a bug in
/// the caller's exception path.
pub struct LockHandle {
    manager: LockManager,
    held: Vec<(TableKey, LockMode)>,
    released: bool,
}

impl LockHandle {
    pub fn unlock_all(mut self) {
        self.release_all();
        self.released = true;
    }

    fn release_all(&mut self) {
        for (key, mode) in self.held.drain(..).rev() {
            self.manager.release_one(&key, mode);
        }
    }

    pub fn holds(&self, key: &TableKey) -> Option<LockMode> {
        self.held.iter().find(|(k, _)| k == key).map(|(_, m)| *m)
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released && !self.held.is_empty() {
            tracing::error!(
                held = self.held.len(),
                "lock handle dropped without unlock_all; releasing as a safety net"
            );
            self.release_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    fn key(name: &str) -> TableKey {
        ("APP".to_string(), name.to_string())
    }

    #[test]
    fn read_locks_are_shared() {
        let manager = LockManager::new();
        let h1 = manager.lock_one(key("t"), LockMode::Read).unwrap();
        let h2 = manager.lock_one(key("t"), LockMode::Read).unwrap();
        h1.unlock_all();
        h2.unlock_all();
    }

    #[test]
    fn write_lock_excludes_readers() {
        let manager = LockManager::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let write_handle = manager.lock_one(key("t"), LockMode::Write).unwrap();

        let m2 = manager.clone();
        let c2 = counter.clone();
        let b2 = barrier.clone();
        let reader = thread::spawn(move || {
            b2.wait();
            let h = m2.lock_one(key("t"), LockMode::Read).unwrap();
            c2.fetch_add(1, Ordering::SeqCst);
            h.unlock_all();
        });

        barrier.wait();
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0, "reader should still be blocked");

        write_handle.unlock_all();
        reader.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn multi_table_claims_are_sorted_before_acquisition() {
        let manager = LockManager::new();
        let handle = manager
            .lock(vec![
                (key("zeta"), LockMode::Write),
                (key("alpha"), LockMode::Write),
            ])
            .unwrap();
        assert_eq!(handle.held[0].0, key("alpha"));
        assert_eq!(handle.held[1].0, key("zeta"));
        handle.unlock_all();
    }

    #[test]
    fn dropping_without_unlock_still_releases() {
        let manager = LockManager::new();
        {
            let _handle = manager.lock_one(key("t"), LockMode::Write).unwrap();
        }
        // If the drop safety net didn't release it, this would block forever.
        let handle = manager.lock_one(key("t"), LockMode::Write).unwrap();
        handle.unlock_all();
    }

    /// Hammers a handful of tables with random read/write claims across
    /// several threads; the only assertion is that every thread finishes
    /// — a deadlock here would hang the test instead of failing it.
    #[test]
    fn randomized_multi_table_claims_never_deadlock() {
        use rand::Rng;

        let manager = LockManager::new();
        let tables: Vec<TableKey> = (0..4).map(|i| key(&format!("t{i}"))).collect();

        let threads: Vec<_> = (0..6)
            .map(|_| {
                let manager = manager.clone();
                let tables = tables.clone();
                thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..20 {
                        let n = rng.gen_range(1..=tables.len());
                        let claims = tables[..n]
                            .iter()
                            .map(|t| {
                                let mode = if rng.gen_bool(0.5) { LockMode::Read } else { LockMode::Write };
                                (t.clone(), mode)
                            })
                            .collect();
                        let handle = manager.lock(claims).unwrap();
                        handle.unlock_all();
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }
    }
}
