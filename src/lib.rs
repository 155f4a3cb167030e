//! # CommitDB - Commit Log Persistence for Event Sourcing
//!
//! CommitDB stores immutable batches of domain events ("commits") per stream
//! in SQLite. It provides:
//!
//! - **Optimistic concurrency**: conflicting writers are detected by a unique
//!   index at insert time, never by locks
//! - **Idempotent retries**: resubmitting a stored commit is reported as a
//!   duplicate, not written twice
//! - **Snapshots**: one materialized state per stream to bound replay cost
//! - **Version-aware reads**: rebuild a stream from any event version, usually
//!   from the latest commit alone
//! - **Partitions**: isolated namespaces of streams sharing one database file
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     CommitDB (registry)                         │
//! │               open_partition(id) → Partition                    │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ one per partition id
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Partition worker thread                       │
//! │              (owns one SQLite connection)                       │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │ Commit Log  │  │  Snapshots  │  │  Stream Query Engine    │ │
//! │  │   Store     │  │   Store     │  │  (fast path/fallback)   │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite                                  │
//! │          tw_<partition>_commits / tw_<partition>_snapshots      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Slot uniqueness**: `(stream_id, commit_sequence)` is unique per
//!    partition; a second writer gets `Error::Concurrency`
//! 2. **Commit identity**: a commit id is stored at most once per partition;
//!    a resubmission gets `Error::DuplicateCommit`
//! 3. **Ordering**: a stream reads back in ascending `commit_sequence`
//! 4. **Isolation**: partitions never see each other's data
//!
//! ## Module Organization
//!
//! - [`error`]: the error enum and `Result` alias
//! - [`types`]: identifiers, sequences, versions, `Event`, `Commit`, `Snapshot`
//! - [`config`]: store settings
//! - [`schema`]: database initialization and per-partition DDL
//! - [`codec`]: event encoding, checksums, clock
//! - [`commits`]: the commit log store
//! - [`snapshots`]: the snapshot store
//! - [`query`]: stream reconstruction from a version
//! - [`partition`]: async handle and worker thread
//! - [`api`]: the partition registry (main entry point)
//!
//! ## Logging
//!
//! CommitDB emits `tracing` events (partition lifecycle at `info`, appends,
//! conflicts and truncations at `debug`, corruption at `warn`). It never
//! installs a subscriber; that is up to the application.

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for CommitDB operations.
pub mod error;

/// Domain types for the commit log.
///
/// Newtypes for identifiers and counters, plus the three persisted records.
pub mod types;

/// Store configuration.
pub mod config;

/// SQLite schema definitions and database initialization.
///
/// Contains the metadata table, the schema version check and the DDL that
/// bootstraps each partition's tables and indexes.
pub mod schema;

/// Event encoding, checksums and time.
pub mod codec;

/// The commit log store: append, latest commit, truncation, listing and
/// dispatch tracking.
pub mod commits;

/// The snapshot store.
pub mod snapshots;

/// Stream reconstruction from an event version.
///
/// The pure pieces ([`query::fast_path`], [`query::slice_from_version`]) are
/// public so their agreement can be checked directly.
pub mod query;

/// Partition handle and its dedicated worker thread.
pub mod partition;

/// Async API for CommitDB.
///
/// The main entry point is [`CommitDB`](api::CommitDB).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::CommitDB;
pub use commits::ConflictKind;
pub use config::StoreConfig;
pub use error::{Error, Result};
pub use partition::Partition;
pub use schema::Database;

pub use types::{
    Commit, CommitId, CommitSequence, Event, EventId, EventVersion, PartitionId, Snapshot,
    StreamId,
};
