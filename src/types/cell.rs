//! Opaque cell values.
//!
//! The storage core never interprets a column's SQL-level type — that
//! belongs to the excluded SQL layer. What it needs from a cell is the
//! ability to compare, size, and serialize it, which this enum provides
//! for the small set of physical representations cells arrive in.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single column value as the storage core sees it: a self-describing
/// tag plus a value, comparable when the tag is comparable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Cell {
    Null,
    Numeric(i64),
    Double(f64),
    Text(String),
    Date(i64),
    Binary(Vec<u8>),
    /// Opaque serialized object (e.g. a Java-object column). Comparable
    /// only for equality, never ordering.
    Object(Vec<u8>),
}

impl Cell {
    /// Tag used for index-key comparisons and the legacy wire format.
    pub fn tag(&self) -> CellTag {
        match self {
            Cell::Null => CellTag::Null,
            Cell::Numeric(_) => CellTag::Numeric,
            Cell::Double(_) => CellTag::Double,
            Cell::Text(_) => CellTag::Text,
            Cell::Date(_) => CellTag::Date,
            Cell::Binary(_) => CellTag::Binary,
            Cell::Object(_) => CellTag::Object,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Physical size in bytes, used by the page store to decide whether a
    /// record needs sector chaining.
    pub fn byte_size(&self) -> usize {
        match self {
            Cell::Null => 0,
            Cell::Numeric(_) | Cell::Date(_) => 8,
            Cell::Double(_) => 8,
            Cell::Text(s) => s.len(),
            Cell::Binary(b) | Cell::Object(b) => b.len(),
        }
    }

    /// A cell type is indexable when it admits a total order; `Object`
    /// cells are excluded from secondary indices.
    pub fn is_indexable_type(tag: CellTag) -> bool {
        !matches!(tag, CellTag::Object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellTag {
    Null,
    Numeric,
    Double,
    Text,
    Date,
    Binary,
    Object,
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

/// 32 KiB is the threshold past which text comparison switches from a
/// whole-string compare to a streamed, chunked compare — kept as a
/// distinct path so it can be exercised on its own.
pub const LARGE_TEXT_THRESHOLD: usize = 32 * 1024;

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Cell::Null, Cell::Null) => Some(Ordering::Equal),
            // SQL NULL sorts before every other value and is incomparable
            // for equality purposes by convention used here: ordering is
            // total for index purposes, so Null is simply least.
            (Cell::Null, _) => Some(Ordering::Less),
            (_, Cell::Null) => Some(Ordering::Greater),
            (Cell::Numeric(a), Cell::Numeric(b)) => a.partial_cmp(b),
            (Cell::Double(a), Cell::Double(b)) => a.partial_cmp(b),
            (Cell::Numeric(a), Cell::Double(b)) => (*a as f64).partial_cmp(b),
            (Cell::Double(a), Cell::Numeric(b)) => a.partial_cmp(&(*b as f64)),
            (Cell::Date(a), Cell::Date(b)) => a.partial_cmp(b),
            (Cell::Text(a), Cell::Text(b)) => Some(compare_text(a, b)),
            (Cell::Binary(a), Cell::Binary(b)) => a.partial_cmp(b),
            (Cell::Object(a), Cell::Object(b)) => {
                if a == b {
                    Some(Ordering::Equal)
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

/// Byte-wise comparison with the large-string path kept distinct so it
/// can be exercised and reasoned about on its own.
fn compare_text(a: &str, b: &str) -> Ordering {
    if a.len() > LARGE_TEXT_THRESHOLD || b.len() > LARGE_TEXT_THRESHOLD {
        compare_text_streaming(a, b)
    } else {
        a.cmp(b)
    }
}

/// Chunked compare that never materializes more than one comparison
/// window of either string at a time, modeling the streaming-Reader path
/// the source used for oversized text columns.
fn compare_text_streaming(a: &str, b: &str) -> Ordering {
    const CHUNK: usize = 4096;
    let (ab, bb) = (a.as_bytes(), b.as_bytes());
    let mut i = 0;
    loop {
        let a_chunk = &ab[i.min(ab.len())..(i + CHUNK).min(ab.len())];
        let b_chunk = &bb[i.min(bb.len())..(i + CHUNK).min(bb.len())];
        match a_chunk.cmp(b_chunk) {
            Ordering::Equal => {
                if a_chunk.is_empty() && b_chunk.is_empty() {
                    return ab.len().cmp(&bb.len());
                }
                i += CHUNK;
            }
            other => return other,
        }
    }
}
