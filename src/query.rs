//! # Stream Query Engine
//!
//! Reconstructs the events of a stream from a given version onward.
//!
//! ## Two Tiers
//!
//! ```text
//!                 query_stream(stream, from)
//!                            │
//!              from == 0 ────┼──── yes ──► full scan, unmodified
//!                            │
//!                            ▼
//!                 fetch latest commit only
//!                            │
//!         ┌─────────────┬────┴─────────┬───────────────────┐
//!         ▼             ▼              ▼                   ▼
//!       none      last_v < from   first_v <= from     first_v > from
//!         │             │          <= last_v                │
//!       empty         empty      trimmed latest       full scan, then
//!                                                     slice_from_version
//! ```
//!
//! Most readers are close to the head of their stream (they hold a recent
//! snapshot), so the single-row fast path answers most queries.
//!
//! ## Version Arithmetic in the Fallback
//!
//! The fallback does not read event versions. It counts events from the start
//! of the stream, relying on versions being contiguous from 0. Writers that
//! leave gaps between commits get an approximate boundary.

use rusqlite::Connection;

use crate::commits::{latest_commit, load_stream, require_stream};
use crate::error::Result;
use crate::schema::PartitionTables;
use crate::types::{Commit, EventVersion, StreamId};

/// Outcome of the fast path.
#[derive(Debug, Clone, PartialEq)]
pub enum FastPath {
    /// The latest commit alone answered the query.
    Answered(Vec<Commit>),
    /// The requested version lies before the latest commit.
    Fallback,
}

/// Tries to answer a query from the stream's latest commit alone.
///
/// `from` must be greater than 0; a query from the start always needs the
/// whole stream.
pub fn fast_path(latest: Option<Commit>, from: EventVersion) -> FastPath {
    let Some(mut latest) = latest else {
        return FastPath::Answered(Vec::new());
    };

    // A commit without events proves nothing about where `from` lies.
    let (Some(first), Some(last)) = (latest.first_version(), latest.last_version()) else {
        return FastPath::Fallback;
    };

    if first > from {
        return FastPath::Fallback;
    }
    if last < from {
        return FastPath::Answered(Vec::new());
    }

    latest.events.retain(|event| event.version >= from);
    if latest.events.is_empty() {
        FastPath::Answered(Vec::new())
    } else {
        FastPath::Answered(vec![latest])
    }
}

/// Drops everything before version `from` from a stream's commits.
///
/// `commits` must be the whole stream in ascending sequence order. Commits
/// wholly before `from` are dropped and the commit containing `from` is
/// trimmed to its events at or after it.
///
/// ```text
/// commits: [0 1 2] [3 4 5]
/// from 2 → [2] [3 4 5]
/// from 3 → [3 4 5]
/// from 4 → [4 5]
/// from 6 → (empty)
/// ```
pub fn slice_from_version(commits: Vec<Commit>, from: EventVersion) -> Vec<Commit> {
    let from = from.as_raw();
    if from == 0 {
        return commits;
    }

    let mut seen: u64 = 0;
    let mut consumed = 0;
    for commit in &commits {
        seen += commit.events.len() as u64;
        consumed += 1;
        if seen >= from {
            break;
        }
    }

    if seen < from {
        return Vec::new();
    }

    // Events of the boundary commit that lie at or after `from`.
    let too_many = (seen - from) as usize;
    let start = if too_many > 0 { consumed - 1 } else { consumed };

    let mut sliced: Vec<Commit> = commits.into_iter().skip(start).collect();
    if too_many > 0 {
        if let Some(boundary) = sliced.first_mut() {
            let skip = boundary.events.len() - too_many;
            boundary.events.drain(..skip);
        }
    }
    sliced
}

/// Returns the commits of a stream from event version `from` onward.
///
/// Commits come back in ascending sequence order, the first one possibly
/// trimmed. An unknown stream or a version past the end yields an empty vector.
pub fn query_stream(
    conn: &Connection,
    tables: &PartitionTables,
    stream_id: &StreamId,
    from: EventVersion,
) -> Result<Vec<Commit>> {
    require_stream(stream_id)?;

    if from == EventVersion::START {
        return load_stream(conn, tables, stream_id);
    }

    match fast_path(latest_commit(conn, tables, stream_id)?, from) {
        FastPath::Answered(commits) => Ok(commits),
        FastPath::Fallback => {
            tracing::trace!(
                partition = %tables.partition(),
                stream_id = %stream_id,
                from = from.as_raw(),
                "query fell back to full stream scan"
            );
            Ok(slice_from_version(load_stream(conn, tables, stream_id)?, from))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
