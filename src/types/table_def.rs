//! Table definitions: columns, indexable-type flags, and topology diffs.

use super::cell::CellTag;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A column's declared cell type plus nullability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub cell_type: CellTag,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, cell_type: CellTag) -> Self {
        Self {
            name: name.into(),
            cell_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Whether this column gets a secondary scheme index: its per-column
    /// index contains a slot iff the column type is indexable and the
    /// cell is non-null.
    pub fn is_indexable(&self) -> bool {
        super::cell::Cell::is_indexable_type(self.cell_type)
    }
}

/// A table's physical definition: ordered columns plus the housekeeping
/// the page/index stores need.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataTableDef {
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// System-schema tables use the smaller 128-byte block size.
    pub is_system_table: bool,
    /// Bumped whenever `update()` changes topology; used to decide
    /// whether dependent schemes must be rebuilt.
    pub version: u32,

    #[serde(skip)]
    column_index: HashMap<String, usize>,
}

impl DataTableDef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let mut def = Self {
            schema: schema.into(),
            name: name.into(),
            columns,
            is_system_table: false,
            version: 0,
            column_index: HashMap::new(),
        };
        def.rebuild_column_index();
        def
    }

    pub fn system(schema: impl Into<String>, name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        let mut def = Self::new(schema, name, columns);
        def.is_system_table = true;
        def
    }

    pub fn rebuild_column_index(&mut self) {
        self.column_index.clear();
        for (i, col) in self.columns.iter().enumerate() {
            self.column_index.insert(col.name.clone(), i);
        }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.column_index.get(name).copied()
    }

    pub fn column(&self, position: usize) -> Option<&ColumnDef> {
        self.columns.get(position)
    }

    pub fn indexable_columns(&self) -> impl Iterator<Item = (usize, &ColumnDef)> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_indexable())
    }

    /// Block size the page store should use for this table: 128 for
    /// system-schema tables, 1024 otherwise.
    pub fn block_size(&self) -> u16 {
        if self.is_system_table {
            crate::config::BlockSize::SYSTEM.get()
        } else {
            crate::config::BlockSize::STANDARD.get()
        }
    }

    /// Case-sensitive identity used for lookups; case-insensitive match
    /// used only to reject ambiguous `CREATE TABLE` names.
    pub fn matches_case_insensitive(&self, schema: &str, name: &str) -> bool {
        self.schema.eq_ignore_ascii_case(schema) && self.name.eq_ignore_ascii_case(name)
    }

    /// Compares topology against a proposed new definition. Returns
    /// `true` (and bumps `version`) when columns were added, removed, or
    /// retyped — callers must then rebuild dependent schemes.
    pub fn apply_update(&mut self, new_columns: Vec<ColumnDef>) -> bool {
        let changed = self.columns != new_columns;
        if changed {
            self.columns = new_columns;
            self.version += 1;
            self.rebuild_column_index();
        }
        changed
    }
}
