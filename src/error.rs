//! # Error Handling for CommitDB
//!
//! This module defines the error type used throughout CommitDB. A single
//! [`Error`] enum represents every failure mode, so callers match on one type
//! regardless of which store produced the failure.
//!
//! ## Rust Pattern: thiserror
//!
//! We use the `thiserror` crate to derive `std::error::Error` implementations:
//! - `Display` comes from the `#[error(...)]` attributes
//! - `From` conversions come from the `#[from]` attributes
//! - Source chaining comes for free with `#[from]`
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Conflict | `Concurrency` | Reload the stream, re-sequence, retry |
//! | Duplicate | `DuplicateCommit` | Treat as already stored |
//! | Caller mistake | `InvalidArgument`, `CommitNotFound` | Fix the call |
//! | Infrastructure | `Sqlite`, `Serialization`, `Schema`, `Unavailable` | Propagate |
//! | Integrity | `Corruption` | Log and investigate |
//!
//! The two append outcomes (`Concurrency`, `DuplicateCommit`) are expected
//! results of the optimistic write protocol. CommitDB never retries them
//! internally.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in CommitDB operations.
///
/// # Example
///
/// ```rust,ignore
/// use commitdb::Error;
///
/// match partition.append(commit).await {
///     Ok(stored) => println!("stored at {}", stored.created_ms),
///     Err(Error::Concurrency { .. }) => { /* reload, re-sequence, retry */ }
///     Err(Error::DuplicateCommit { .. }) => { /* already durable */ }
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Append Outcomes (expected, caller decides)
    // =========================================================================

    /// Another writer already holds the `(stream_id, commit_sequence)` slot.
    ///
    /// # Systems Concept: Optimistic Concurrency Control
    ///
    /// No lock is taken while a caller builds its commit. The unique index on
    /// `(stream_id, commit_sequence)` detects the race at insert time, and
    /// exactly one of the competing writers wins.
    ///
    /// # Recovery
    ///
    /// 1. Load the latest commit of the stream
    /// 2. Re-apply business logic on top of it
    /// 3. Append again with the next commit sequence
    #[error("concurrency error on stream '{stream_id}': commit sequence {commit_sequence} is already taken")]
    Concurrency {
        /// The stream where the conflict occurred
        stream_id: String,
        /// The sequence number that was already taken
        commit_sequence: u64,
    },

    /// A commit with the same id was already stored.
    ///
    /// This is the idempotency signal for a retried write of the *same*
    /// commit: the first attempt reached disk, so nothing was lost.
    #[error("duplicate commit '{commit_id}' on stream '{stream_id}': already stored")]
    DuplicateCommit {
        /// The commit id that was already stored
        commit_id: String,
        /// The stream the commit was addressed to
        stream_id: String,
    },

    // =========================================================================
    // Caller Errors (detected before or without side effects)
    // =========================================================================

    /// A required argument was missing or malformed.
    ///
    /// Always raised before any I/O is performed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No commit with the given id exists in the partition.
    #[error("commit '{commit_id}' not found")]
    CommitNotFound {
        /// The commit id that was looked up
        commit_id: String,
    },

    // =========================================================================
    // Infrastructure Errors (surfaced unchanged)
    // =========================================================================

    /// SQLite operation failed.
    ///
    /// Wraps any error from the `rusqlite` crate that is not a classified
    /// uniqueness violation: locked database, full disk, I/O failure, etc.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Event or snapshot payload could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Schema bootstrap failed or the schema version doesn't match.
    #[error("schema error: {0}")]
    Schema(String),

    /// The partition worker is gone (shut down or failed to start).
    #[error("partition unavailable: {0}")]
    Unavailable(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================

    /// Stored data failed its integrity check.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl Error {
    /// Returns true for the two expected outcomes of a contended append.
    ///
    /// Both `Concurrency` and `DuplicateCommit` come from a uniqueness
    /// violation; neither indicates a broken store.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Concurrency { .. } | Error::DuplicateCommit { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
