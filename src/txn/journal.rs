//! Table Journal: the ordered per-table, per-transaction log of row
//! changes that the transaction commit path replays against the index
//! store's presence list.
//!
//! Four entry kinds, matching the row state machine: `Add` and
//! `UpdateAdd` both land a new slot in `CommittedAdded` at commit;
//! `Remove` and `UpdateRemove` both retire a slot to `CommittedRemoved`
//! and conflict identically if another transaction beat this one to it
//! — an update-then-remove conflicts exactly like a plain remove.

use crate::types::Slot;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntryKind {
    Add,
    Remove,
    UpdateRemove,
    UpdateAdd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub kind: JournalEntryKind,
    pub slot: Slot,
}

impl JournalEntry {
    /// Whether applying this entry at commit retires `slot` to
    /// `CommittedRemoved` (as opposed to landing it in `CommittedAdded`).
    pub fn is_removal(&self) -> bool {
        matches!(self.kind, JournalEntryKind::Remove | JournalEntryKind::UpdateRemove)
    }
}

/// The ordered log of changes one transaction made to one table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableJournal {
    entries: Vec<JournalEntry>,
}

impl TableJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_row(&mut self, slot: Slot) {
        self.entries.push(JournalEntry {
            kind: JournalEntryKind::Add,
            slot,
        });
    }

    pub fn remove_row(&mut self, slot: Slot) {
        self.entries.push(JournalEntry {
            kind: JournalEntryKind::Remove,
            slot,
        });
    }

    /// Records an update as the pair the legacy wire format expects:
    /// the old slot's removal, immediately followed by the new slot's
    /// addition.
    pub fn update_row(&mut self, old_slot: Slot, new_slot: Slot) {
        self.entries.push(JournalEntry {
            kind: JournalEntryKind::UpdateRemove,
            slot: old_slot,
        });
        self.entries.push(JournalEntry {
            kind: JournalEntryKind::UpdateAdd,
            slot: new_slot,
        });
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn entries_by_type(&self, kind: JournalEntryKind) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Discards every entry recorded after `len` — the mechanics behind
    /// rolling back to a savepoint.
    pub fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }
}
