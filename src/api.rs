//! # Async API for CommitDB
//!
//! [`CommitDB`] is the entry point: it owns the store location and hands out
//! one [`Partition`] per identifier, opening each lazily on first use.
//!
//! ## Registry
//!
//! ```text
//!                      CommitDB (Clone, shared)
//!   ┌──────────────────────────────────────────────────────────┐
//!   │  Mutex<HashMap<PartitionId, Arc<OnceCell<Partition>>>>   │
//!   │                                                          │
//!   │   "master" ──► OnceCell ──► Partition ──► worker thread  │
//!   │   "tenant-7" ─► OnceCell ──► Partition ──► worker thread │
//!   └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The map lock is held only to fetch or insert a cell, never across the
//! partition bootstrap. Concurrent first requests for the same id wait on the
//! same `OnceCell`, so exactly one worker is spawned per id. A failed open
//! leaves the cell empty and the next request tries again.
//!
//! An open that races with [`CommitDB::shutdown`] may finish initializing a
//! cell that is no longer in the map. It then shuts its partition down itself
//! and fails with `Error::Unavailable`, so no worker outlives the registry.
//!
//! ## Rust Concepts
//!
//! - **tokio::sync::OnceCell**: async one-time initialization
//! - **Arc::ptr_eq**: identity instead of equality for shared handles
//! - **Clone for handles**: every clone shares the same registry

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::partition::{Partition, StoreLocation};
use crate::schema::Database;
use crate::types::PartitionId;

type PartitionSlots = HashMap<PartitionId, Arc<OnceCell<Partition>>>;

/// The partition registry of one commit store.
///
/// # Example
///
/// ```rust,ignore
/// use commitdb::{CommitDB, Commit, Event, EventVersion};
/// use serde_json::json;
///
/// #[tokio::main]
/// async fn main() -> commitdb::Result<()> {
///     let db = CommitDB::open("commits.db").await?;
///     let partition = db.open_partition(None).await?; // "master"
///
///     let events = vec![Event::new("e-1", "OrderPlaced", json!({"total": 10})).with_version(0)];
///     partition.append(Commit::new("c-1", "master", "order-1", 0, events)).await?;
///
///     let history = partition.query_stream("order-1", EventVersion::START).await?;
///     println!("{} commits", history.len());
///
///     db.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CommitDB {
    location: StoreLocation,
    config: StoreConfig,
    partitions: Arc<Mutex<PartitionSlots>>,
}

impl CommitDB {
    /// Opens or creates a commit store in the given SQLite file.
    ///
    /// The file is created and its schema version checked right away; the
    /// partitions themselves open on demand.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, StoreConfig::default()).await
    }

    /// Opens a file-based store with custom settings.
    pub async fn open_with_config<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Database::open_with_busy_timeout(&path, config.busy_timeout)?;

        tracing::debug!(path = %path.display(), "commit store opened");
        Ok(Self::with_location(StoreLocation::File(path), config))
    }

    /// Creates a store whose partitions live in memory.
    ///
    /// Each partition gets its own private database. Nothing is persisted.
    pub fn open_in_memory() -> Self {
        Self::open_in_memory_with_config(StoreConfig::default())
    }

    /// Creates an in-memory store with custom settings.
    pub fn open_in_memory_with_config(config: StoreConfig) -> Self {
        Self::with_location(StoreLocation::Memory, config)
    }

    fn with_location(location: StoreLocation, config: StoreConfig) -> Self {
        Self {
            location,
            config,
            partitions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The settings this store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the partition for `id`, opening it on first use.
    ///
    /// `None` and `Some("")` both mean the default partition (`"master"`
    /// unless configured otherwise). Every call with the same id returns the
    /// same instance.
    ///
    /// # Errors
    ///
    /// - Bootstrap failures of the partition (connection, DDL, thread spawn).
    ///   The id stays unopened and a later call retries.
    /// - `Error::Unavailable` if the store was shut down while the partition
    ///   was opening.
    pub async fn open_partition(&self, id: Option<&str>) -> Result<Partition> {
        let id = PartitionId::resolve(id, &self.config.default_partition);
        let slot = self.slot(&id).await;

        let partition = slot
            .get_or_try_init(|| Partition::open(self.location.clone(), id.clone(), &self.config))
            .await?
            .clone();

        self.keep_if_registered(&id, &slot, partition).await
    }

    async fn slot(&self, id: &PartitionId) -> Arc<OnceCell<Partition>> {
        let mut partitions = self.partitions.lock().await;
        Arc::clone(partitions.entry(id.clone()).or_default())
    }

    /// Hands out `partition` only if its cell is still the registered one.
    async fn keep_if_registered(
        &self,
        id: &PartitionId,
        slot: &Arc<OnceCell<Partition>>,
        partition: Partition,
    ) -> Result<Partition> {
        let registered = {
            let partitions = self.partitions.lock().await;
            partitions
                .get(id)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
        };

        if registered {
            return Ok(partition);
        }

        tracing::debug!(partition = %id, "partition opened during shutdown, closing it");
        partition.shutdown().await;
        Err(Error::Unavailable(format!(
            "partition '{}' was shut down while opening",
            id
        )))
    }

    /// The identifiers of the partitions currently open, sorted.
    pub async fn partition_ids(&self) -> Vec<PartitionId> {
        let partitions = self.partitions.lock().await;
        let mut ids: Vec<PartitionId> = partitions
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Shuts down every open partition.
    ///
    /// Handles obtained earlier stop working. A later `open_partition` opens
    /// a fresh instance.
    pub async fn shutdown(&self) {
        let slots: Vec<Arc<OnceCell<Partition>>> = {
            let mut partitions = self.partitions.lock().await;
            partitions.drain().map(|(_, slot)| slot).collect()
        };

        for slot in slots {
            if let Some(partition) = slot.get() {
                partition.shutdown().await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
