//! # Partition: Async Handle and Worker Thread
//!
//! A [`Partition`] is the caller-facing handle to one isolated namespace of
//! streams. All work happens on a dedicated OS thread that owns the
//! partition's SQLite connection.
//!
//! ## Why a Thread per Partition?
//!
//! `rusqlite::Connection` is `!Sync`, so it can't be shared between tasks.
//! The worker thread owns it outright and serves requests in arrival order:
//!
//! ```text
//!   task A ─┐                                   ┌──────────────────────────┐
//!   task B ─┼─ mpsc<PartitionRequest> ─────────►│ commitdb-partition thread│
//!   task C ─┘                                   │                          │
//!      ▲                                        │  Connection (owned)      │
//!      │                                        │  commits / snapshots /   │
//!      └──────────── oneshot<Result<T>> ◄───────│  query functions         │
//!                                               └──────────────────────────┘
//! ```
//!
//! There is no lock on the write path. Two appends to the same stream slot
//! are told apart by the unique index, whichever connection they arrive on.
//!
//! ## Startup
//!
//! The worker opens its connection and creates the partition's tables before
//! it accepts requests, reporting the outcome over a oneshot. A failed
//! bootstrap is returned from [`Partition::open`] and leaves no thread behind.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::commits;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::query;
use crate::schema::{Database, PartitionTables};
use crate::snapshots;
use crate::types::{Commit, CommitId, CommitSequence, EventVersion, PartitionId, Snapshot, StreamId};

// =============================================================================
// Storage Location
// =============================================================================

/// Where a partition's connection points.
#[derive(Debug, Clone)]
pub(crate) enum StoreLocation {
    /// A database file shared by every partition of the store.
    File(PathBuf),
    /// A private in-memory database per partition.
    Memory,
}

impl StoreLocation {
    fn connect(&self, config: &StoreConfig) -> Result<Database> {
        match self {
            StoreLocation::File(path) => Database::open_with_busy_timeout(path, config.busy_timeout),
            StoreLocation::Memory => Database::open_in_memory(),
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// A request to the partition worker.
///
/// Each variant carries a oneshot sender for its result.
#[derive(Debug)]
enum PartitionRequest {
    Append {
        commit: Commit,
        response: oneshot::Sender<Result<Commit>>,
    },
    LatestCommit {
        stream_id: StreamId,
        response: oneshot::Sender<Result<Option<Commit>>>,
    },
    TruncateStream {
        stream_id: StreamId,
        from: CommitSequence,
        response: oneshot::Sender<Result<()>>,
    },
    QueryAll {
        response: oneshot::Sender<Result<Vec<Commit>>>,
    },
    QueryStream {
        stream_id: StreamId,
        from: EventVersion,
        response: oneshot::Sender<Result<Vec<Commit>>>,
    },
    StoreSnapshot {
        stream_id: StreamId,
        payload: Value,
        version: i64,
        response: oneshot::Sender<Result<Snapshot>>,
    },
    LoadSnapshot {
        stream_id: StreamId,
        response: oneshot::Sender<Result<Option<Snapshot>>>,
    },
    RemoveSnapshot {
        stream_id: StreamId,
        response: oneshot::Sender<Result<()>>,
    },
    MarkDispatched {
        commit_id: CommitId,
        response: oneshot::Sender<Result<()>>,
    },
    Undispatched {
        response: oneshot::Sender<Result<Vec<Commit>>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

// =============================================================================
// Worker
// =============================================================================

/// Opens the connection and makes sure the partition's tables exist.
fn bootstrap(location: &StoreLocation, tables: &PartitionTables, config: &StoreConfig) -> Result<Connection> {
    let db = location.connect(config)?;
    db.ensure_partition(tables)?;
    Ok(db.into_connection())
}

/// Serves requests until shutdown or until every handle is dropped.
///
/// Runs on the partition's own thread, so blocking on the channel is fine.
fn run_partition_worker(
    mut conn: Connection,
    tables: PartitionTables,
    mut rx: mpsc::Receiver<PartitionRequest>,
) {
    let shutdown_ack = loop {
        let Some(request) = rx.blocking_recv() else {
            break None;
        };

        // A caller that stopped waiting dropped its receiver; nothing to do.
        match request {
            PartitionRequest::Append { commit, response } => {
                let _ = response.send(commits::append(&mut conn, &tables, commit));
            }
            PartitionRequest::LatestCommit { stream_id, response } => {
                let _ = response.send(commits::latest_commit(&conn, &tables, &stream_id));
            }
            PartitionRequest::TruncateStream {
                stream_id,
                from,
                response,
            } => {
                let result = commits::truncate_stream_from(&conn, &tables, &stream_id, from);
                let _ = response.send(result.map(|_| ()));
            }
            PartitionRequest::QueryAll { response } => {
                let _ = response.send(commits::query_all(&conn, &tables));
            }
            PartitionRequest::QueryStream {
                stream_id,
                from,
                response,
            } => {
                let _ = response.send(query::query_stream(&conn, &tables, &stream_id, from));
            }
            PartitionRequest::StoreSnapshot {
                stream_id,
                payload,
                version,
                response,
            } => {
                let _ = response.send(snapshots::store(&conn, &tables, &stream_id, payload, version));
            }
            PartitionRequest::LoadSnapshot { stream_id, response } => {
                let _ = response.send(snapshots::load(&conn, &tables, &stream_id));
            }
            PartitionRequest::RemoveSnapshot { stream_id, response } => {
                let _ = response.send(snapshots::remove(&conn, &tables, &stream_id));
            }
            PartitionRequest::MarkDispatched { commit_id, response } => {
                let _ = response.send(commits::mark_dispatched(&conn, &tables, &commit_id));
            }
            PartitionRequest::Undispatched { response } => {
                let _ = response.send(commits::undispatched(&conn, &tables));
            }
            PartitionRequest::Shutdown { response } => break Some(response),
        }
    };

    // Close the connection before acknowledging, so a caller that awaited
    // shutdown can reopen the file right away. Queued requests are dropped
    // with the receiver and their callers see `Error::Unavailable`.
    drop(rx);
    drop(conn);
    tracing::info!(partition = %tables.partition(), "partition closed");

    if let Some(ack) = shutdown_ack {
        let _ = ack.send(());
    }
}

// =============================================================================
// Partition Handle
// =============================================================================

#[derive(Debug)]
struct PartitionInner {
    id: PartitionId,
    tx: mpsc::Sender<PartitionRequest>,
}

/// Async handle to an open partition.
///
/// Cloning is cheap and every clone talks to the same worker. Handles
/// returned by [`CommitDB::open_partition`](crate::CommitDB::open_partition)
/// for the same id are clones of one instance (see [`Partition::same_instance`]).
///
/// # Example
///
/// ```rust,ignore
/// let partition = db.open_partition(Some("orders")).await?;
///
/// let commit = Commit::new(commit_id, "orders", "order-42", 0, events);
/// match partition.append(commit).await {
///     Ok(stored) => println!("stored at {}", stored.created_ms),
///     Err(Error::Concurrency { .. }) => { /* reload and retry */ }
///     Err(e) => return Err(e),
/// }
///
/// let history = partition.query_stream("order-42", EventVersion::START).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Partition {
    inner: Arc<PartitionInner>,
}

impl Partition {
    /// Spawns the worker thread, bootstraps the tables and returns the handle.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` / `Error::Schema` if the connection or DDL fails
    /// - `Error::Unavailable` if the thread can't be spawned
    pub(crate) async fn open(
        location: StoreLocation,
        id: PartitionId,
        config: &StoreConfig,
    ) -> Result<Self> {
        let tables = PartitionTables::new(&config.table_prefix, &id);
        let (tx, rx) = mpsc::channel(config.request_channel_size);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let worker_config = config.clone();

        thread::Builder::new()
            .name("commitdb-partition".to_string())
            .spawn(move || {
                let conn = match bootstrap(&location, &tables, &worker_config) {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!(partition = %tables.partition(), error = %e, "partition failed to start");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_partition_worker(conn, tables, rx);
            })
            .map_err(|e| Error::Unavailable(format!("failed to spawn partition thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| Error::Unavailable(format!("partition '{}' exited during startup", id)))??;

        tracing::info!(partition = %id, "partition opened");

        Ok(Self {
            inner: Arc::new(PartitionInner { id, tx }),
        })
    }

    /// The identifier of this partition.
    pub fn id(&self) -> &PartitionId {
        &self.inner.id
    }

    /// Returns true if both handles refer to the same opened partition.
    pub fn same_instance(&self, other: &Partition) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Sends a request and waits for its answer.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> PartitionRequest,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();

        self.inner
            .tx
            .send(build(response_tx))
            .await
            .map_err(|_| self.unavailable("has shut down"))?;

        response_rx
            .await
            .map_err(|_| self.unavailable("dropped response"))?
    }

    fn unavailable(&self, what: &str) -> Error {
        Error::Unavailable(format!("partition '{}' {}", self.inner.id, what))
    }

    // =========================================================================
    // Commit Log
    // =========================================================================

    /// Appends a commit to its stream.
    ///
    /// The stored commit is returned with `is_dispatched = false` and
    /// `created_ms` set by the store.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidArgument` for an empty stream id, no events, or
    ///   non-contiguous versions; raised before anything is sent
    /// - `Error::Concurrency` if another commit holds the stream slot
    /// - `Error::DuplicateCommit` if this commit id is already stored
    pub async fn append(&self, commit: Commit) -> Result<Commit> {
        commits::validate_commit(&commit)?;
        self.request(|response| PartitionRequest::Append { commit, response })
            .await
    }

    /// Returns the commit with the highest sequence in the stream, if any.
    pub async fn get_latest_commit(&self, stream_id: impl Into<StreamId>) -> Result<Option<Commit>> {
        let stream_id = stream_id.into();
        commits::require_stream(&stream_id)?;
        self.request(|response| PartitionRequest::LatestCommit { stream_id, response })
            .await
    }

    /// Deletes every commit of the stream at or after `from`.
    ///
    /// `CommitSequence::FIRST` deletes the whole stream.
    pub async fn truncate_stream_from(
        &self,
        stream_id: impl Into<StreamId>,
        from: CommitSequence,
    ) -> Result<()> {
        let stream_id = stream_id.into();
        commits::require_stream(&stream_id)?;
        self.request(|response| PartitionRequest::TruncateStream {
            stream_id,
            from,
            response,
        })
        .await
    }

    /// Returns every commit of the partition in approximate write order.
    ///
    /// For export and diagnostics only; see [`commits::query_all`].
    pub async fn query_all(&self) -> Result<Vec<Commit>> {
        self.request(|response| PartitionRequest::QueryAll { response })
            .await
    }

    /// Returns the stream's commits from event version `from` onward.
    ///
    /// The first commit may be trimmed to start at `from`. An unknown stream
    /// or a version past the end yields an empty vector.
    pub async fn query_stream(
        &self,
        stream_id: impl Into<StreamId>,
        from: EventVersion,
    ) -> Result<Vec<Commit>> {
        let stream_id = stream_id.into();
        commits::require_stream(&stream_id)?;
        self.request(|response| PartitionRequest::QueryStream {
            stream_id,
            from,
            response,
        })
        .await
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Stores (or replaces) the snapshot of a stream.
    pub async fn store_snapshot(
        &self,
        stream_id: impl Into<StreamId>,
        payload: Value,
        version: i64,
    ) -> Result<Snapshot> {
        let stream_id = stream_id.into();
        commits::require_stream(&stream_id)?;
        self.request(|response| PartitionRequest::StoreSnapshot {
            stream_id,
            payload,
            version,
            response,
        })
        .await
    }

    /// Loads the snapshot of a stream.
    ///
    /// A removed snapshot comes back as the sentinel record; check
    /// [`Snapshot::is_usable`] before replaying from it.
    pub async fn load_snapshot(&self, stream_id: impl Into<StreamId>) -> Result<Option<Snapshot>> {
        let stream_id = stream_id.into();
        commits::require_stream(&stream_id)?;
        self.request(|response| PartitionRequest::LoadSnapshot { stream_id, response })
            .await
    }

    /// Marks the snapshot of a stream as unusable.
    pub async fn remove_snapshot(&self, stream_id: impl Into<StreamId>) -> Result<()> {
        let stream_id = stream_id.into();
        commits::require_stream(&stream_id)?;
        self.request(|response| PartitionRequest::RemoveSnapshot { stream_id, response })
            .await
    }

    // =========================================================================
    // Dispatch Tracking
    // =========================================================================

    /// Flags a commit as delivered to downstream consumers.
    ///
    /// # Errors
    ///
    /// - `Error::CommitNotFound` if the id is unknown in this partition
    pub async fn mark_as_dispatched(&self, commit_id: impl Into<CommitId>) -> Result<()> {
        let commit_id = commit_id.into();
        self.request(|response| PartitionRequest::MarkDispatched { commit_id, response })
            .await
    }

    /// Returns the commits not yet marked as dispatched.
    pub async fn get_undispatched(&self) -> Result<Vec<Commit>> {
        self.request(|response| PartitionRequest::Undispatched { response })
            .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Stops the worker thread and closes its connection.
    ///
    /// Affects every clone of this handle. Later requests fail with
    /// `Error::Unavailable`. Shutting down twice is not an error.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .inner
            .tx
            .send(PartitionRequest::Shutdown { response: response_tx })
            .await
            .is_ok()
        {
            let _ = response_rx.await;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Event;
    use serde_json::json;

    async fn open_memory(id: &str) -> Partition {
        Partition::open(StoreLocation::Memory, PartitionId::new(id), &StoreConfig::default())
            .await
            .unwrap()
    }

    fn commit(id: &str, stream: &str, seq: u64, versions: std::ops::Range<u64>) -> Commit {
        let events = versions
            .map(|v| Event::new(format!("{id}-{v}"), "Tick", json!(v)).with_version(v))
            .collect();
        Commit::new(id, "master", stream, seq, events)
    }

    #[tokio::test]
    async fn test_open_and_append() {
        let partition = open_memory("master").await;
        assert_eq!(partition.id().as_str(), "master");

        let stored = partition.append(commit("c-1", "s-1", 0, 0..2)).await.unwrap();
        let latest = partition.get_latest_commit("s-1").await.unwrap();
        assert_eq!(latest, Some(stored));
    }

    #[tokio::test]
    async fn test_query_stream_through_worker() {
        let partition = open_memory("master").await;
        partition.append(commit("c-0", "s-1", 0, 0..3)).await.unwrap();
        partition.append(commit("c-1", "s-1", 1, 3..6)).await.unwrap();

        let from_four = partition.query_stream("s-1", EventVersion::from_raw(4)).await.unwrap();
        assert_eq!(from_four.len(), 1);
        assert_eq!(from_four[0].commit_sequence.as_raw(), 1);
        assert_eq!(from_four[0].events.len(), 2);

        let from_two = partition.query_stream("s-1", EventVersion::from_raw(2)).await.unwrap();
        assert_eq!(from_two.len(), 2);
        assert_eq!(from_two[0].events.len(), 1);

        assert!(partition
            .query_stream("s-1", EventVersion::from_raw(6))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_clones_are_same_instance() {
        let a = open_memory("master").await;
        let b = a.clone();
        let c = open_memory("master").await;

        assert!(a.same_instance(&b));
        assert!(!a.same_instance(&c));
    }

    #[tokio::test]
    async fn test_invalid_arguments_fail_fast() {
        let partition = open_memory("master").await;
        assert!(matches!(
            partition.get_latest_commit("").await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            partition.load_snapshot("").await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let partition = open_memory("master").await;
        let clone = partition.clone();

        partition.shutdown().await;
        partition.shutdown().await;

        let err = clone.query_all().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_open_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A directory is not a database file.
        let location = StoreLocation::File(dir.path().to_path_buf());

        let result = Partition::open(location, PartitionId::default(), &StoreConfig::default()).await;
        assert!(result.is_err());
    }
}
