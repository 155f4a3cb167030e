//! # SQLite Schema for CommitDB
//!
//! This module defines the database schema and handles initialization.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        One database file                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  commitdb_metadata     tw_<partition>_commits      tw_<partition>_snapshots
//! │  ┌──────────┐          ┌──────────────────────┐    ┌─────────────────┐  │
//! │  │ key (PK) │          │ commit_id       (U)  │    │ stream_id   (U) │  │
//! │  │ value    │          │ stream_id  ┐    (U)  │    │ version         │  │
//! │  └──────────┘          │ commit_sequence ┘    │    │ payload (JSON)  │  │
//! │                        │ event_count          │    └─────────────────┘  │
//! │                        │ events BLOB          │                         │
//! │                        │ checksum             │                         │
//! │                        │ is_dispatched        │                         │
//! │                        │ created_ms      (I)  │                         │
//! │                        └──────────────────────┘                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `(U)` unique index, `(I)` plain index. Every partition gets its own pair of
//! tables, so partitions never collide even with identical stream ids.
//!
//! ## Uniqueness Is the Concurrency Control
//!
//! The unique index on `(stream_id, commit_sequence)` is the only thing that
//! stops two writers from claiming the same slot of a stream. The unique index
//! on `commit_id` is what recognizes a retried commit. Both are created by
//! [`Database::ensure_partition`] before a partition accepts requests.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use crate::config::DEFAULT_BUSY_TIMEOUT_MS;
use crate::types::PartitionId;
use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
///
/// There are no migrations: a mismatch is reported as `Error::Schema`.
const SCHEMA_VERSION: i32 = 1;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS commitdb_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Partition Tables
// =============================================================================

/// Quotes an SQL identifier so any partition name is safe in DDL and queries.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The table and index names that belong to one partition.
///
/// Names are `<prefix>_<partition>_commits` and `<prefix>_<partition>_snapshots`.
/// The quoted forms are what goes into SQL text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTables {
    partition: PartitionId,
    commits_name: String,
    snapshots_name: String,
    commits: String,
    snapshots: String,
}

impl PartitionTables {
    /// Derives the table names of `partition`.
    pub fn new(prefix: &str, partition: &PartitionId) -> Self {
        let commits_name = format!("{}_{}_commits", prefix, partition.as_str());
        let snapshots_name = format!("{}_{}_snapshots", prefix, partition.as_str());
        Self {
            partition: partition.clone(),
            commits: quote_ident(&commits_name),
            snapshots: quote_ident(&snapshots_name),
            commits_name,
            snapshots_name,
        }
    }

    /// The partition these tables belong to.
    pub fn partition(&self) -> &PartitionId {
        &self.partition
    }

    /// Quoted commit table identifier, ready for SQL text.
    pub fn commits(&self) -> &str {
        &self.commits
    }

    /// Quoted snapshot table identifier, ready for SQL text.
    pub fn snapshots(&self) -> &str {
        &self.snapshots
    }

    /// Unquoted commit table name (as listed in `sqlite_master`).
    pub fn commits_name(&self) -> &str {
        &self.commits_name
    }

    /// Unquoted snapshot table name (as listed in `sqlite_master`).
    pub fn snapshots_name(&self) -> &str {
        &self.snapshots_name
    }

    fn index(&self, table_name: &str, suffix: &str) -> String {
        quote_ident(&format!("{}_{}", table_name, suffix))
    }

    /// The DDL statements for this partition, in execution order.
    ///
    /// Every statement uses `IF NOT EXISTS`, so running them again on an
    /// already bootstrapped partition is a no-op.
    fn ddl(&self) -> Vec<String> {
        let c = &self.commits;
        let s = &self.snapshots;
        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {c} (
                    commit_id       TEXT NOT NULL,
                    bucket_id       TEXT NOT NULL,
                    stream_id       TEXT NOT NULL,
                    commit_sequence INTEGER NOT NULL,
                    event_count     INTEGER NOT NULL,
                    events          BLOB NOT NULL,
                    checksum        BLOB NOT NULL,
                    is_dispatched   INTEGER NOT NULL DEFAULT 0,
                    created_ms      INTEGER NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {s} (
                    stream_id  TEXT NOT NULL,
                    version    INTEGER NOT NULL,
                    payload    TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {s}(stream_id)",
                self.index(&self.snapshots_name, "stream_id")
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {c}(commit_id)",
                self.index(&self.commits_name, "commit_id")
            ),
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {c}(stream_id, commit_sequence)",
                self.index(&self.commits_name, "stream_sequence")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {c}(created_ms)",
                self.index(&self.commits_name, "created_ms")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {c}(created_ms) WHERE is_dispatched = 0",
                self.index(&self.commits_name, "undispatched")
            ),
        ]
    }
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the CommitDB metadata initialized.
///
/// `Database` owns its `Connection`; dropping it closes the connection.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the schema version doesn't match
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use commitdb::Database;
    ///
    /// let db = Database::open("commits.db")?;
    /// # Ok::<(), commitdb::Error>(())
    /// ```
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_busy_timeout(path, Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
    }

    /// Opens a database file with a custom lock wait.
    ///
    /// The timeout is applied before initialization, so partitions that
    /// bootstrap the same fresh file at once wait for each other instead of
    /// failing with `SQLITE_BUSY`.
    pub fn open_with_busy_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates a private in-memory database.
    ///
    /// Nothing is shared with other connections and everything is lost when
    /// the connection closes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Sets pragmas, creates the metadata table, checks the schema version.
    fn initialize(&mut self) -> Result<()> {
        // WAL: readers on other partitions don't block the writer.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.verify_or_set_version()?;

        Ok(())
    }

    /// Verifies the schema version, or sets it if this is a new database.
    fn verify_or_set_version(&mut self) -> Result<()> {
        // Two partitions may bootstrap a fresh file at the same time.
        self.conn.execute(
            "INSERT OR IGNORE INTO commitdb_metadata (key, value) VALUES ('schema_version', ?)",
            [SCHEMA_VERSION.to_string()],
        )?;

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM commitdb_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing.as_deref().map(str::parse::<i32>) {
            Some(Ok(v)) if v == SCHEMA_VERSION => Ok(()),
            Some(Ok(v)) => Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but this CommitDB version requires {SCHEMA_VERSION}"
            ))),
            Some(Err(_)) | None => Err(Error::Schema(
                "schema version is missing or unreadable".to_string(),
            )),
        }
    }

    /// Creates the tables and indexes of a partition if they don't exist.
    ///
    /// Idempotent: an index that already exists is not an error. Any other
    /// failure is returned unchanged.
    pub fn ensure_partition(&self, tables: &PartitionTables) -> Result<()> {
        for statement in tables.ddl() {
            self.conn.execute_batch(&statement)?;
        }
        Ok(())
    }

    /// Consumes the wrapper and returns the raw connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Returns a reference to the underlying SQLite connection.
    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
