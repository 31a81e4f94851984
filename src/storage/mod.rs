//! Storage layer: the page store's physical slot file and the index
//! store's copy-on-write sorted lists.

pub mod checksum;
pub mod index_store;
pub mod page_store;

pub use checksum::{Checksum, ChecksumError, ChecksumType};
pub use index_store::{IndexList, IndexSet, IndexStore};
pub use page_store::{PageStore, SectorId, RESERVED_BUFFER_SIZE};
