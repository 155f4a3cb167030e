//! # Commit Log Store
//!
//! Synchronous operations on one partition's commit table. Everything here
//! runs on the partition's worker thread, against the connection it owns.
//!
//! ## Append Protocol
//!
//! ```text
//! validate (no I/O) ──► BEGIN IMMEDIATE ──► INSERT ──┬─► COMMIT ──► Ok(commit)
//!                                                    │
//!                                                    └─► constraint violation
//!                                                          │
//!                                                          ▼
//!                                            probe commit_id, then
//!                                            (stream_id, commit_sequence)
//!                                                          │
//!                                     ┌────────────────────┴───────────────┐
//!                                     ▼                                    ▼
//!                          Error::DuplicateCommit                Error::Concurrency
//! ```
//!
//! There is no read-before-write and no lock held while a caller prepares its
//! commit. The unique indexes decide which of two racing writers wins.
//!
//! ## Rust Pattern: Classifying Without Message Matching
//!
//! SQLite reports which constraint failed only inside the error message.
//! Instead of parsing it, we use the structured error code to learn that a
//! uniqueness violation happened and then probe both unique keys inside the
//! same transaction to learn which one.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};

use crate::codec::{current_time_ms, decode_events, encode_events};
use crate::error::{Error, Result};
use crate::schema::PartitionTables;
use crate::types::{Commit, CommitId, CommitSequence, StreamId};

/// Columns selected for every commit read, in `CommitRow::from_row` order.
const COMMIT_COLUMNS: &str =
    "commit_id, bucket_id, stream_id, commit_sequence, event_count, events, checksum, is_dispatched, created_ms";

// =============================================================================
// Conflict Classification
// =============================================================================

/// Which uniqueness rule a rejected append violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The commit id is already stored: a resubmitted commit.
    CommitId,
    /// The `(stream_id, commit_sequence)` slot is taken: a concurrent writer.
    StreamSequence,
}

impl ConflictKind {
    /// Converts the classification into the caller-facing error.
    pub fn into_error(self, commit: &Commit) -> Error {
        match self {
            ConflictKind::CommitId => Error::DuplicateCommit {
                commit_id: commit.id.to_string(),
                stream_id: commit.stream_id.to_string(),
            },
            ConflictKind::StreamSequence => Error::Concurrency {
                stream_id: commit.stream_id.to_string(),
                commit_sequence: commit.commit_sequence.as_raw(),
            },
        }
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Finds the stored row that collides with `commit`.
///
/// The commit id is checked first, so an identical resubmission is always a
/// duplicate even though it also occupies the same stream slot.
fn classify_conflict(
    conn: &Connection,
    tables: &PartitionTables,
    commit: &Commit,
) -> Result<Option<ConflictKind>> {
    let by_id = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE commit_id = ?1", tables.commits()),
            [commit.id.as_str()],
            |_| Ok(()),
        )
        .optional()?;
    if by_id.is_some() {
        return Ok(Some(ConflictKind::CommitId));
    }

    let by_slot = conn
        .query_row(
            &format!(
                "SELECT 1 FROM {} WHERE stream_id = ?1 AND commit_sequence = ?2",
                tables.commits()
            ),
            params![commit.stream_id.as_str(), sequence_column(commit.commit_sequence)?],
            |_| Ok(()),
        )
        .optional()?;
    if by_slot.is_some() {
        return Ok(Some(ConflictKind::StreamSequence));
    }

    Ok(None)
}

// =============================================================================
// Validation
// =============================================================================

/// Converts a sequence to its `INTEGER` column value.
///
/// SQLite integers are signed, so sequences above `i64::MAX` cannot be stored
/// without breaking the column's ordering.
fn sequence_column(sequence: CommitSequence) -> Result<i64> {
    i64::try_from(sequence.as_raw()).map_err(|_| {
        Error::InvalidArgument(format!(
            "commit sequence {} exceeds the largest storable sequence {}",
            sequence,
            i64::MAX
        ))
    })
}

/// Rejects an empty stream id before any I/O.
pub fn require_stream(stream_id: &StreamId) -> Result<()> {
    if stream_id.is_empty() {
        return Err(Error::InvalidArgument("stream id must not be empty".to_string()));
    }
    Ok(())
}

/// Checks the shape of a commit before it is written.
///
/// - stream id and commit id are non-empty
/// - at least one event
/// - commit sequence fits a SQLite integer
/// - event versions increase by exactly 1 inside the commit
///
/// Versions are not checked against earlier commits of the stream; that would
/// put a read on the write path.
pub fn validate_commit(commit: &Commit) -> Result<()> {
    require_stream(&commit.stream_id)?;

    if commit.id.as_str().is_empty() {
        return Err(Error::InvalidArgument("commit id must not be empty".to_string()));
    }

    if commit.events.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "commit '{}' has no events",
            commit.id
        )));
    }

    sequence_column(commit.commit_sequence)?;

    for pair in commit.events.windows(2) {
        if Some(pair[1].version) != pair[0].version.next() {
            return Err(Error::InvalidArgument(format!(
                "commit '{}' has non-contiguous event versions: {} followed by {}",
                commit.id, pair[0].version, pair[1].version
            )));
        }
    }

    Ok(())
}

// =============================================================================
// Row Decoding
// =============================================================================

/// A commit row as stored, before its events are verified and decoded.
struct CommitRow {
    commit_id: String,
    bucket_id: String,
    stream_id: String,
    commit_sequence: i64,
    event_count: i64,
    events: Vec<u8>,
    checksum: Vec<u8>,
    is_dispatched: bool,
    created_ms: i64,
}

impl CommitRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            commit_id: row.get(0)?,
            bucket_id: row.get(1)?,
            stream_id: row.get(2)?,
            commit_sequence: row.get(3)?,
            event_count: row.get(4)?,
            events: row.get(5)?,
            checksum: row.get(6)?,
            is_dispatched: row.get(7)?,
            created_ms: row.get(8)?,
        })
    }

    fn into_commit(self) -> Result<Commit> {
        let events = decode_events(&self.events, &self.checksum, &self.commit_id)?;
        if i64::try_from(events.len()).ok() != Some(self.event_count) {
            return Err(Error::Corruption(format!(
                "commit '{}' records {} events but holds {}",
                self.commit_id,
                self.event_count,
                events.len()
            )));
        }
        let commit_sequence = u64::try_from(self.commit_sequence).map_err(|_| {
            Error::Corruption(format!(
                "commit '{}' has negative sequence {}",
                self.commit_id, self.commit_sequence
            ))
        })?;

        Ok(Commit {
            id: CommitId::new(self.commit_id),
            bucket_id: self.bucket_id,
            stream_id: StreamId::new(self.stream_id),
            commit_sequence: CommitSequence::from_raw(commit_sequence),
            events,
            is_dispatched: self.is_dispatched,
            created_ms: self.created_ms as u64,
        })
    }
}

fn select_commits<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Commit>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, CommitRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(CommitRow::into_commit).collect()
}

// =============================================================================
// Operations
// =============================================================================

/// Appends a commit as one atomic insert.
///
/// The stored commit is returned with `is_dispatched = false` and
/// `created_ms` set to the time of the write.
///
/// # Errors
///
/// - `Error::InvalidArgument` if the commit fails validation (nothing written)
/// - `Error::DuplicateCommit` if the commit id is already stored
/// - `Error::Concurrency` if the stream slot is already taken
/// - `Error::Sqlite` for anything else
pub fn append(conn: &mut Connection, tables: &PartitionTables, mut commit: Commit) -> Result<Commit> {
    validate_commit(&commit)?;

    let sequence = sequence_column(commit.commit_sequence)?;
    let (blob, checksum) = encode_events(&commit.events)?;
    commit.is_dispatched = false;
    commit.created_ms = current_time_ms();

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let inserted = tx.execute(
        &format!(
            "INSERT INTO {} (commit_id, bucket_id, stream_id, commit_sequence, event_count, events, checksum, is_dispatched, created_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            tables.commits()
        ),
        params![
            commit.id.as_str(),
            commit.bucket_id,
            commit.stream_id.as_str(),
            sequence,
            commit.events.len() as i64,
            blob,
            checksum,
            commit.created_ms as i64,
        ],
    );

    match inserted {
        Ok(_) => {
            tx.commit()?;
            tracing::debug!(
                partition = %tables.partition(),
                stream_id = %commit.stream_id,
                commit_sequence = commit.commit_sequence.as_raw(),
                commit_id = %commit.id,
                events = commit.events.len(),
                "commit appended"
            );
            Ok(commit)
        }
        Err(err) if is_constraint_violation(&err) => {
            let kind = classify_conflict(&tx, tables, &commit)?;
            drop(tx);

            match kind {
                Some(kind) => {
                    tracing::debug!(
                        partition = %tables.partition(),
                        stream_id = %commit.stream_id,
                        commit_sequence = commit.commit_sequence.as_raw(),
                        commit_id = %commit.id,
                        ?kind,
                        "append rejected"
                    );
                    Err(kind.into_error(&commit))
                }
                // A constraint that is not one of ours (e.g. NOT NULL).
                None => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Returns the commit with the highest sequence in the stream, if any.
pub fn latest_commit(
    conn: &Connection,
    tables: &PartitionTables,
    stream_id: &StreamId,
) -> Result<Option<Commit>> {
    require_stream(stream_id)?;

    let row = conn
        .query_row(
            &format!(
                "SELECT {COMMIT_COLUMNS} FROM {} WHERE stream_id = ?1 ORDER BY commit_sequence DESC LIMIT 1",
                tables.commits()
            ),
            [stream_id.as_str()],
            CommitRow::from_row,
        )
        .optional()?;

    row.map(CommitRow::into_commit).transpose()
}

/// Returns every commit of the stream by ascending sequence.
pub fn load_stream(
    conn: &Connection,
    tables: &PartitionTables,
    stream_id: &StreamId,
) -> Result<Vec<Commit>> {
    require_stream(stream_id)?;

    select_commits(
        conn,
        &format!(
            "SELECT {COMMIT_COLUMNS} FROM {} WHERE stream_id = ?1 ORDER BY commit_sequence ASC",
            tables.commits()
        ),
        [stream_id.as_str()],
    )
}

/// Deletes every commit of the stream with `commit_sequence >= from`.
///
/// Returns the number of deleted commits. `CommitSequence::FIRST` removes the
/// whole stream. Deleting nothing is not an error, and a threshold above any
/// storable sequence deletes nothing.
pub fn truncate_stream_from(
    conn: &Connection,
    tables: &PartitionTables,
    stream_id: &StreamId,
    from: CommitSequence,
) -> Result<usize> {
    require_stream(stream_id)?;

    // No stored sequence can reach a threshold beyond the column range.
    let Ok(threshold) = i64::try_from(from.as_raw()) else {
        return Ok(0);
    };

    let deleted = conn.execute(
        &format!(
            "DELETE FROM {} WHERE stream_id = ?1 AND commit_sequence >= ?2",
            tables.commits()
        ),
        params![stream_id.as_str(), threshold],
    )?;

    tracing::debug!(
        partition = %tables.partition(),
        stream_id = %stream_id,
        from = from.as_raw(),
        deleted,
        "stream truncated"
    );

    Ok(deleted)
}

/// Returns every commit of the partition in approximate write order.
///
/// Ordered by `created_ms`, then by insertion order. Two partitions' clocks
/// are the same wall clock, but commits written in the same millisecond by
/// different connections have no defined order. Use for export and
/// diagnostics, never for correctness.
pub fn query_all(conn: &Connection, tables: &PartitionTables) -> Result<Vec<Commit>> {
    select_commits(
        conn,
        &format!(
            "SELECT {COMMIT_COLUMNS} FROM {} ORDER BY created_ms ASC, rowid ASC",
            tables.commits()
        ),
        [],
    )
}

/// Flags a commit as handed to downstream consumers.
///
/// Marking an already dispatched commit again succeeds.
///
/// # Errors
///
/// - `Error::CommitNotFound` if no commit has this id
pub fn mark_dispatched(conn: &Connection, tables: &PartitionTables, commit_id: &CommitId) -> Result<()> {
    let updated = conn.execute(
        &format!(
            "UPDATE {} SET is_dispatched = 1 WHERE commit_id = ?1",
            tables.commits()
        ),
        [commit_id.as_str()],
    )?;

    if updated == 0 {
        return Err(Error::CommitNotFound {
            commit_id: commit_id.to_string(),
        });
    }
    Ok(())
}

/// Returns the commits not yet dispatched, ordered like [`query_all`].
pub fn undispatched(conn: &Connection, tables: &PartitionTables) -> Result<Vec<Commit>> {
    select_commits(
        conn,
        &format!(
            "SELECT {COMMIT_COLUMNS} FROM {} WHERE is_dispatched = 0 ORDER BY created_ms ASC, rowid ASC",
            tables.commits()
        ),
        [],
    )
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::types::{Event, PartitionId};
    use serde_json::json;

    fn setup() -> (Connection, PartitionTables) {
        let db = Database::open_in_memory().unwrap();
        let tables = PartitionTables::new("tw", &PartitionId::default());
        db.ensure_partition(&tables).unwrap();
        (db.into_connection(), tables)
    }

    fn commit(id: &str, stream: &str, seq: u64, versions: std::ops::Range<u64>) -> Commit {
        let events = versions
            .map(|v| Event::new(format!("{id}-e{v}"), "Counted", json!({ "n": v })).with_version(v))
            .collect();
        Commit::new(id, "master", stream, seq, events)
    }

    #[test]
    fn test_append_returns_stored_commit() {
        let (mut conn, tables) = setup();

        let mut input = commit("c-1", "s-1", 0, 0..3);
        input.is_dispatched = true;
        let stored = append(&mut conn, &tables, input).unwrap();

        assert!(!stored.is_dispatched);
        assert!(stored.created_ms > 0);

        let latest = latest_commit(&conn, &tables, &StreamId::new("s-1")).unwrap().unwrap();
        assert_eq!(latest, stored);
    }

    #[test]
    fn test_append_same_sequence_is_concurrency_error() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-1", "s-1", 0, 0..1)).unwrap();

        let err = append(&mut conn, &tables, commit("c-2", "s-1", 0, 0..1)).unwrap_err();
        assert!(matches!(
            err,
            Error::Concurrency { ref stream_id, commit_sequence: 0 } if stream_id == "s-1"
        ));
    }

    #[test]
    fn test_append_same_commit_is_duplicate() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-1", "s-1", 0, 0..1)).unwrap();

        // Identical resubmission collides on both keys; the id wins.
        let err = append(&mut conn, &tables, commit("c-1", "s-1", 0, 0..1)).unwrap_err();
        assert!(matches!(err, Error::DuplicateCommit { ref commit_id, .. } if commit_id == "c-1"));

        // Same id on a free slot is still a duplicate.
        let err = append(&mut conn, &tables, commit("c-1", "s-2", 0, 0..1)).unwrap_err();
        assert!(matches!(err, Error::DuplicateCommit { .. }));
    }

    #[test]
    fn test_rejected_append_writes_nothing() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-1", "s-1", 0, 0..1)).unwrap();
        let _ = append(&mut conn, &tables, commit("c-2", "s-1", 0, 0..1));

        assert_eq!(query_all(&conn, &tables).unwrap().len(), 1);
    }

    #[test]
    fn test_validation_happens_before_io() {
        let (mut conn, tables) = setup();

        let empty_stream = commit("c-1", "", 0, 0..1);
        assert!(matches!(
            append(&mut conn, &tables, empty_stream),
            Err(Error::InvalidArgument(_))
        ));

        let no_events = Commit::new("c-2", "master", "s-1", 0, vec![]);
        assert!(matches!(
            append(&mut conn, &tables, no_events),
            Err(Error::InvalidArgument(_))
        ));

        let gap = Commit::new(
            "c-3",
            "master",
            "s-1",
            0,
            vec![
                Event::new("e-0", "a", json!(null)).with_version(0),
                Event::new("e-2", "a", json!(null)).with_version(2),
            ],
        );
        assert!(matches!(append(&mut conn, &tables, gap), Err(Error::InvalidArgument(_))));

        assert!(query_all(&conn, &tables).unwrap().is_empty());
    }

    #[test]
    fn test_version_overflow_is_rejected() {
        let (mut conn, tables) = setup();

        let wrapped = Commit::new(
            "c-1",
            "master",
            "s-1",
            0,
            vec![
                Event::new("e-max", "a", json!(null)).with_version(u64::MAX),
                Event::new("e-0", "a", json!(null)).with_version(0),
            ],
        );
        assert!(matches!(append(&mut conn, &tables, wrapped), Err(Error::InvalidArgument(_))));
        assert!(query_all(&conn, &tables).unwrap().is_empty());
    }

    #[test]
    fn test_unstorable_sequence_is_rejected() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-0", "s-1", 5, 0..1)).unwrap();

        let err = append(&mut conn, &tables, commit("c-1", "s-1", 1 << 63, 1..2)).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        // The largest storable sequence still sorts last.
        append(&mut conn, &tables, commit("c-2", "s-1", i64::MAX as u64, 1..2)).unwrap();
        let latest = latest_commit(&conn, &tables, &StreamId::new("s-1")).unwrap().unwrap();
        assert_eq!(latest.id.as_str(), "c-2");
        assert_eq!(latest.commit_sequence.as_raw(), i64::MAX as u64);
    }

    #[test]
    fn test_latest_commit_empty_stream() {
        let (conn, tables) = setup();
        assert!(latest_commit(&conn, &tables, &StreamId::new("nope")).unwrap().is_none());
        assert!(matches!(
            latest_commit(&conn, &tables, &StreamId::new("")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_latest_commit_picks_highest_sequence() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-0", "s-1", 0, 0..2)).unwrap();
        append(&mut conn, &tables, commit("c-1", "s-1", 1, 2..3)).unwrap();
        append(&mut conn, &tables, commit("c-x", "s-2", 5, 0..1)).unwrap();

        let latest = latest_commit(&conn, &tables, &StreamId::new("s-1")).unwrap().unwrap();
        assert_eq!(latest.id.as_str(), "c-1");
    }

    #[test]
    fn test_truncate_stream_from() {
        let (mut conn, tables) = setup();
        for seq in 0..4 {
            append(&mut conn, &tables, commit(&format!("c-{seq}"), "s-1", seq, seq..seq + 1)).unwrap();
        }
        append(&mut conn, &tables, commit("other", "s-2", 0, 0..1)).unwrap();

        let stream = StreamId::new("s-1");
        assert_eq!(truncate_stream_from(&conn, &tables, &stream, CommitSequence::from_raw(2)).unwrap(), 2);
        let remaining: Vec<u64> = load_stream(&conn, &tables, &stream)
            .unwrap()
            .iter()
            .map(|c| c.commit_sequence.as_raw())
            .collect();
        assert_eq!(remaining, vec![0, 1]);

        // Idempotent.
        assert_eq!(truncate_stream_from(&conn, &tables, &stream, CommitSequence::from_raw(2)).unwrap(), 0);

        // A threshold beyond the column range deletes nothing.
        assert_eq!(truncate_stream_from(&conn, &tables, &stream, CommitSequence::from_raw(u64::MAX)).unwrap(), 0);
        assert_eq!(load_stream(&conn, &tables, &stream).unwrap().len(), 2);

        truncate_stream_from(&conn, &tables, &stream, CommitSequence::FIRST).unwrap();
        assert!(load_stream(&conn, &tables, &stream).unwrap().is_empty());
        assert_eq!(load_stream(&conn, &tables, &StreamId::new("s-2")).unwrap().len(), 1);
    }

    #[test]
    fn test_truncated_slot_can_be_reused() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-0", "s-1", 0, 0..1)).unwrap();
        append(&mut conn, &tables, commit("c-1", "s-1", 1, 1..2)).unwrap();
        truncate_stream_from(&conn, &tables, &StreamId::new("s-1"), CommitSequence::from_raw(1)).unwrap();

        append(&mut conn, &tables, commit("c-1b", "s-1", 1, 1..2)).unwrap();
    }

    #[test]
    fn test_query_all_insertion_order() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("b", "s-2", 0, 0..1)).unwrap();
        append(&mut conn, &tables, commit("a", "s-1", 0, 0..1)).unwrap();
        append(&mut conn, &tables, commit("c", "s-2", 1, 1..2)).unwrap();

        let ids: Vec<String> = query_all(&conn, &tables)
            .unwrap()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_dispatch_tracking() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-1", "s-1", 0, 0..1)).unwrap();
        append(&mut conn, &tables, commit("c-2", "s-1", 1, 1..2)).unwrap();
        assert_eq!(undispatched(&conn, &tables).unwrap().len(), 2);

        mark_dispatched(&conn, &tables, &CommitId::new("c-1")).unwrap();
        mark_dispatched(&conn, &tables, &CommitId::new("c-1")).unwrap();

        let pending = undispatched(&conn, &tables).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id.as_str(), "c-2");

        let latest = latest_commit(&conn, &tables, &StreamId::new("s-1")).unwrap().unwrap();
        assert!(!latest.is_dispatched);
        let first = &load_stream(&conn, &tables, &StreamId::new("s-1")).unwrap()[0];
        assert!(first.is_dispatched);

        let err = mark_dispatched(&conn, &tables, &CommitId::new("missing")).unwrap_err();
        assert!(matches!(err, Error::CommitNotFound { .. }));
    }

    #[test]
    fn test_corrupted_events_detected() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-1", "s-1", 0, 0..2)).unwrap();

        conn.execute(
            &format!("UPDATE {} SET checksum = X'0000000000000000'", tables.commits()),
            [],
        )
        .unwrap();

        let err = latest_commit(&conn, &tables, &StreamId::new("s-1")).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_event_count_mismatch_detected() {
        let (mut conn, tables) = setup();
        append(&mut conn, &tables, commit("c-1", "s-1", 0, 0..2)).unwrap();

        conn.execute(&format!("UPDATE {} SET event_count = 3", tables.commits()), [])
            .unwrap();

        let err = load_stream(&conn, &tables, &StreamId::new("s-1")).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
