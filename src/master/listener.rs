//! Observer hook for row lifecycle events, used today by the
//! observability layer to log add/remove activity without the master
//! table itself knowing about logging.

use crate::types::Slot;

pub trait MasterTableListener: Send + Sync {
    fn row_added(&self, _slot: Slot) {}
    fn row_removed(&self, _slot: Slot) {}
    fn table_altered(&self) {}
}
