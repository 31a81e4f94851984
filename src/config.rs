//! Storage-core configuration and durability levels.
//!
//! Provides flexible configuration options for balancing performance and safety,
//! and the sizing knobs the rest of the crate otherwise hard-codes.

use serde::{Deserialize, Serialize};

/// Durability level.
///
/// Trades write latency against the window of data loss on crash:
/// - `Synchronous`: safest, fsyncs on every commit.
/// - `GroupCommit`: multiple concurrent commits share one fsync.
/// - `Periodic`: a background thread fsyncs on an interval.
/// - `NoSync`: never fsyncs; tests and scratch databases only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurabilityLevel {
    /// fsync on every transaction commit.
    Synchronous,

    /// Concurrent commits share a single fsync.
    GroupCommit {
        max_batch_size: usize,
        max_wait_us: u64,
    },

    /// A background thread fsyncs on a fixed interval; a crash can lose
    /// up to that interval's worth of committed-but-unflushed data.
    Periodic { interval_ms: u64 },

    /// Never fsync. Only the OS page cache backs durability.
    NoSync,
}

impl Default for DurabilityLevel {
    fn default() -> Self {
        DurabilityLevel::GroupCommit {
            max_batch_size: 1000,
            max_wait_us: 1000,
        }
    }
}

impl DurabilityLevel {
    pub fn synchronous() -> Self {
        Self::Synchronous
    }

    pub fn group_commit() -> Self {
        Self::default()
    }

    pub fn periodic(interval_ms: u64) -> Self {
        Self::Periodic { interval_ms }
    }

    pub fn no_sync() -> Self {
        Self::NoSync
    }

    pub fn requires_immediate_sync(&self) -> bool {
        matches!(self, Self::Synchronous)
    }

    pub fn is_no_sync(&self) -> bool {
        matches!(self, Self::NoSync)
    }
}

/// Page Store block size. Fixed at create time; the boundary case is the
/// smaller size used for system-schema tables (few, small rows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSize(u16);

impl BlockSize {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 1024;

    /// Default block size for ordinary user tables.
    pub const STANDARD: BlockSize = BlockSize(1024);

    /// Block size used for system-schema tables (smaller rows, more of them).
    pub const SYSTEM: BlockSize = BlockSize(128);

    pub fn new(size: u16) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&size) {
            Some(BlockSize(size))
        } else {
            None
        }
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// Locking-mechanism policy. Untimed waits are a deliberate choice, but
/// the wait point is isolated here so a timeout could be added later
/// without restructuring the FIFO.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LockConfig {
    /// `None` means lock acquisition blocks indefinitely (the source's
    /// behavior, and this crate's default).
    pub wait_timeout_ms: Option<u64>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: None,
        }
    }
}

/// Worker pool sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Maximum number of worker threads. Workers are spawned lazily up to
    /// this bound; beyond it, runnables queue.
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Top-level configuration for a storage core instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DBConfig {
    pub durability: DurabilityLevel,
    pub block_size: BlockSize,
    pub lock_config: LockConfig,
    pub worker_pool: WorkerPoolConfig,

    /// Row count threshold past which a GC sweep event is considered for
    /// a full scan rather than draining just the pending-removed list.
    pub gc_full_sweep_threshold: usize,
}

impl Default for DBConfig {
    fn default() -> Self {
        Self {
            durability: DurabilityLevel::default(),
            block_size: BlockSize::default(),
            lock_config: LockConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
            gc_full_sweep_threshold: 10_000,
        }
    }
}

impl DBConfig {
    /// Configuration for the engine's own system schema: smaller blocks,
    /// synchronous durability (catalog changes are rare and must stick).
    pub fn for_system_schema() -> Self {
        Self {
            durability: DurabilityLevel::Synchronous,
            block_size: BlockSize::SYSTEM,
            ..Default::default()
        }
    }

    /// Fast, unsafe configuration for tests.
    pub fn for_testing() -> Self {
        Self {
            durability: DurabilityLevel::NoSync,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_size_rejects_out_of_range() {
        assert!(BlockSize::new(0).is_none());
        assert!(BlockSize::new(1025).is_none());
        assert!(BlockSize::new(128).is_some());
        assert!(BlockSize::new(1024).is_some());
    }

    #[test]
    fn default_durability_is_group_commit() {
        assert!(matches!(
            DBConfig::default().durability,
            DurabilityLevel::GroupCommit { .. }
        ));
    }
}
