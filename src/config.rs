//! # Store Configuration
//!
//! Settings shared by every partition opened from one [`CommitDB`](crate::CommitDB).
//! All fields have defaults; construct with `StoreConfig::default()` and
//! override what you need with the `with_*` methods.

use std::time::Duration;

use crate::types::PartitionId;

// =============================================================================
// Defaults
// =============================================================================

/// Default prefix of every partition table name.
pub const DEFAULT_TABLE_PREFIX: &str = "tw";

/// Default time a connection waits on a locked database file, in milliseconds.
///
/// Partitions share one file, so a writer in one partition can briefly block
/// a writer in another.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Default size of each partition's request channel.
pub const DEFAULT_REQUEST_CHANNEL_SIZE: usize = 1024;

// =============================================================================
// StoreConfig
// =============================================================================

/// Configuration for a [`CommitDB`](crate::CommitDB).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Prefix of the per-partition table names (`<prefix>_<partition>_commits`).
    pub table_prefix: String,

    /// Partition used when `open_partition` gets no (or an empty) id.
    pub default_partition: String,

    /// How long a connection waits for a lock held by another connection.
    pub busy_timeout: Duration,

    /// Capacity of each partition's request channel.
    pub request_channel_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            table_prefix: DEFAULT_TABLE_PREFIX.to_string(),
            default_partition: PartitionId::MASTER.to_string(),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            request_channel_size: DEFAULT_REQUEST_CHANNEL_SIZE,
        }
    }
}

impl StoreConfig {
    /// Sets the table name prefix.
    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    /// Sets the default partition name.
    pub fn with_default_partition(mut self, partition: impl Into<String>) -> Self {
        self.default_partition = partition.into();
        self
    }

    /// Sets the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Sets the request channel capacity (minimum 1).
    pub fn with_request_channel_size(mut self, size: usize) -> Self {
        self.request_channel_size = size.max(1);
        self
    }
}
