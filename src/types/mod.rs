//! Core data types shared across the storage, index, and transaction layers.

mod cell;
mod row;
mod table_def;

pub use cell::{Cell, CellTag, LARGE_TEXT_THRESHOLD};
pub use row::{RecordState, Row, Slot};
pub use table_def::{ColumnDef, DataTableDef};
