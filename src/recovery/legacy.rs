//! Recovery / Legacy Upgrade: a one-shot converter from the old
//! v0.91 index-file layout — a header record pointing at a master
//! index sector, a pending-journal sector, and one scheme sector per
//! column — into this crate's unified `IndexSet`.
//!
//! The legacy file reuses the same page-store sector-chain primitives
//! as everything else (chained sectors, a caller-owned reserved buffer
//! pointing at a header chain), just with a layout this crate no
//! longer writes. Converting is a read of that old layout followed by
//! a normal `MasterTable::persist_index` write of the new one.

use crate::master::MasterTable;
use crate::storage::{IndexList, IndexSet, PageStore};
use crate::txn::journal::TableJournal;
use crate::{Result, StorageError};
use std::path::Path;
use std::sync::Arc;

const LEGACY_VERSION: i32 = 1;

/// Column index scheme kind in the v0.91 layout. `Insert` carries a
/// sorted slot list; `Blind` columns were never indexed and carry no
/// usable data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacySchemeType {
    Insert,
    Blind,
}

impl LegacySchemeType {
    fn from_i32(value: i32) -> Result<Self> {
        match value {
            1 => Ok(Self::Insert),
            2 => Ok(Self::Blind),
            other => Err(StorageError::Corruption(format!(
                "unknown legacy scheme type {other}"
            ))),
        }
    }
}

struct LegacyHeader {
    master_idx_sector: i32,
    journal_sector: i32,
    col_sectors: Vec<i32>,
}

fn parse_i32(bytes: &[u8], offset: usize) -> Result<i32> {
    bytes
        .get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(i32::from_be_bytes)
        .ok_or_else(|| StorageError::Corruption("legacy record truncated".into()))
}

fn parse_header(bytes: &[u8], column_count: usize) -> Result<LegacyHeader> {
    let expected = 8 + 4 + 4 + 4 * column_count;
    if bytes.len() != expected {
        return Err(StorageError::Corruption(format!(
            "legacy header record is {} bytes, expected {expected}",
            bytes.len()
        )));
    }
    let master_idx_sector = parse_i32(bytes, 8)?;
    let journal_sector = parse_i32(bytes, 12)?;
    let col_sectors = (0..column_count)
        .map(|i| parse_i32(bytes, 16 + 4 * i))
        .collect::<Result<Vec<_>>>()?;
    Ok(LegacyHeader {
        master_idx_sector,
        journal_sector,
        col_sectors,
    })
}

/// Reads `[version:i32][count:i32][count x i32]`, validating version and
/// strict ascending order of the ids.
fn parse_sorted_id_list(bytes: &[u8]) -> Result<Vec<i64>> {
    let version = parse_i32(bytes, 0)?;
    if version != LEGACY_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported legacy sector version {version}"
        )));
    }
    let count = parse_i32(bytes, 4)? as usize;
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        ids.push(parse_i32(bytes, 8 + 4 * i)? as i64);
    }
    for window in ids.windows(2) {
        if window[0] == window[1] {
            return Err(StorageError::Corruption("corrupt – double entry".into()));
        }
        if window[0] > window[1] {
            return Err(StorageError::Corruption("corrupt – not sorted".into()));
        }
    }
    Ok(ids)
}

/// Reads `[version:i32][count:i32]` followed by `count` length-prefixed
/// bincode-serialized `TableJournal`s.
fn parse_pending_journals(bytes: &[u8]) -> Result<Vec<TableJournal>> {
    let version = parse_i32(bytes, 0)?;
    if version != LEGACY_VERSION {
        return Err(StorageError::Corruption(format!(
            "unsupported legacy journal sector version {version}"
        )));
    }
    let count = parse_i32(bytes, 4)? as usize;
    let mut offset = 8;
    let mut journals = Vec::with_capacity(count);
    for _ in 0..count {
        let len = parse_i32(bytes, offset)? as usize;
        offset += 4;
        let slice = bytes.get(offset..offset + len).ok_or_else(|| {
            StorageError::Corruption("legacy journal record truncated".into())
        })?;
        let journal: TableJournal = bincode::deserialize(slice)
            .map_err(|e| StorageError::Corruption(format!("legacy journal decode failed: {e}")))?;
        journals.push(journal);
        offset += len;
    }
    Ok(journals)
}

/// Converts the v0.91 index file at `legacy_path` into `table`'s current
/// index set, commits and flushes it, then deletes the old file.
/// Returns the pending per-transaction journals the old engine had not
/// yet replayed, for the caller to apply.
pub fn convert(table: &MasterTable, legacy_path: &Path) -> Result<Vec<TableJournal>> {
    let def = table.def();
    let column_count = def.column_count();

    let legacy_store = PageStore::open(legacy_path, true)?;
    let reserved = legacy_store.read_reserved_buffer()?;
    let header_head = i32::from_be_bytes(reserved[0..4].try_into().unwrap());
    if header_head < 0 {
        return Err(StorageError::Corruption(
            "legacy file has no header record".into(),
        ));
    }

    let header_bytes = legacy_store.read_across(header_head as u64)?;
    let header = parse_header(&header_bytes, column_count)?;

    let master_ids = parse_sorted_id_list(&legacy_store.read_across(header.master_idx_sector as u64)?)?;

    let pending_journals = if header.journal_sector >= 0 {
        parse_pending_journals(&legacy_store.read_across(header.journal_sector as u64)?)?
    } else {
        Vec::new()
    };

    let indexable: Vec<(usize, &crate::types::ColumnDef)> = def.indexable_columns().collect();
    let mut index_set = IndexSet::with_list_count(1 + indexable.len());
    *index_set.list_mut(0)? = IndexList::from_sorted(master_ids);

    for (list_offset, (column_position, _column)) in indexable.iter().enumerate() {
        let sector = header.col_sectors[*column_position];
        if sector < 0 {
            continue;
        }
        let bytes = legacy_store.read_across(sector as u64)?;
        let scheme_type = LegacySchemeType::from_i32(parse_i32(&bytes, 0)?)?;
        if scheme_type == LegacySchemeType::Blind {
            continue;
        }
        let ids = parse_sorted_id_list(&bytes[4..])?;
        *index_set.list_mut(1 + list_offset)? = IndexList::from_sorted(ids);
    }

    let reserved_unique_id = i64::from_be_bytes(reserved[8..16].try_into().unwrap());

    table.index_store().commit_index_set(Arc::new(index_set));
    table.index_store().set_unique_id(reserved_unique_id);
    table.do_maintenance()?;

    drop(legacy_store);
    std::fs::remove_file(legacy_path)?;

    tracing::debug!(
        schema = %def.schema,
        table = %def.name,
        pending_journals = pending_journals.len(),
        "legacy index file converted"
    );

    Ok(pending_journals)
}
