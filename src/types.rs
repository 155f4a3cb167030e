//! # Domain Types for CommitDB
//!
//! This module defines the core types of the commit log: identifiers,
//! sequence numbers, versions, and the three records the store persists
//! ([`Event`], [`Commit`], [`Snapshot`]).
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Identifiers and counters are wrapped in single-field structs:
//!
//! - **Type safety**: a [`CommitSequence`] can't be passed where an
//!   [`EventVersion`] is expected, even though both are `u64`
//! - **Self-documenting code**: signatures say what they expect
//! - **Encapsulation**: validation lives next to the type
//!
//! ## Sequence vs Version
//!
//! ```text
//! stream "order-1"
//! ┌──────────────────────┐ ┌──────────────────────┐
//! │ commit_sequence = 0  │ │ commit_sequence = 1  │
//! │ events: v0 v1 v2     │ │ events: v3 v4 v5     │
//! └──────────────────────┘ └──────────────────────┘
//! ```
//!
//! - [`CommitSequence`]: position of a commit within its stream, from 0
//! - [`EventVersion`]: position of an event within its stream, from 0,
//!   assigned by the writer, contiguous across commit boundaries

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Partition Identification
// =============================================================================

/// The name of an isolated namespace of streams, commits and snapshots.
///
/// Two partitions never see each other's data, even when they use the same
/// stream ids.
///
/// # Example
///
/// ```rust
/// use commitdb::types::PartitionId;
///
/// assert_eq!(PartitionId::resolve(None, "master").as_str(), "master");
/// assert_eq!(PartitionId::resolve(Some(""), "master").as_str(), "master");
/// assert_eq!(PartitionId::resolve(Some("tenant-7"), "master").as_str(), "tenant-7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(String);

impl PartitionId {
    /// The well-known namespace used when no partition is named.
    pub const MASTER: &'static str = "master";

    /// Creates a partition id from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Maps an optional, possibly empty identifier to a partition id.
    ///
    /// `None` and `""` both resolve to `default`.
    pub fn resolve(id: Option<&str>, default: &str) -> Self {
        match id {
            Some(id) if !id.is_empty() => Self::new(id),
            _ => Self::new(default),
        }
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PartitionId {
    fn default() -> Self {
        Self::new(Self::MASTER)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for PartitionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Stream, Commit and Event Identification
// =============================================================================

/// A human-readable identifier for an event stream.
///
/// In event sourcing, a stream is the history of a single entity, e.g.
/// `"order-abc-123"` or `"user-12345"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(String);

impl StreamId {
    /// Creates a new stream ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this stream ID.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the id is the empty string.
    ///
    /// Empty stream ids are rejected by every store operation.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A globally unique identifier for a commit.
///
/// The client generates it (a UUID is typical). Appending the same id twice
/// is how the store recognizes a retried write.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitId(String);

impl CommitId {
    /// Creates a new commit ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommitId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CommitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An opaque identifier for a single event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates a new event ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Sequences and Versions
// =============================================================================

/// The position of a commit within its stream.
///
/// # Invariants
///
/// - Starts at 0 for the first commit of a stream
/// - Unique per `(partition, stream)`: enforced by a unique index, and a
///   collision is how concurrent writers are detected
/// - Readers assume no gaps; the store does not check for them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CommitSequence(u64);

impl CommitSequence {
    /// The first commit of a stream (0).
    ///
    /// Also the truncation threshold that deletes a whole stream.
    pub const FIRST: CommitSequence = CommitSequence(0);

    /// Creates a CommitSequence from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next sequence number, or `None` at `u64::MAX`.
    pub fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for CommitSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The version of an event within its stream.
///
/// Assigned by the writer before append. Each event is the previous event's
/// version + 1, starting at 0 for the stream's first event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventVersion(u64);

impl EventVersion {
    /// The first version of a stream (0).
    ///
    /// Querying from `START` replays the whole stream.
    pub const START: EventVersion = EventVersion(0);

    /// Creates an EventVersion from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next version, or `None` at `u64::MAX`.
    pub fn next(&self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for EventVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Events
// =============================================================================

/// A single domain event.
///
/// Events are stored inside their commit as a JSON array, so the payload can
/// be any JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque event identifier.
    pub id: EventId,

    /// The type tag of the event, e.g. `"OrderPlaced"`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// The event payload.
    pub data: Value,

    /// Stream-global version assigned by the writer.
    pub version: EventVersion,
}

impl Event {
    /// Creates a new event at version 0.
    pub fn new(id: impl Into<EventId>, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            data,
            version: EventVersion::START,
        }
    }

    /// Sets the version of this event (builder pattern).
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = EventVersion::from_raw(version);
        self
    }
}

// =============================================================================
// Commits
// =============================================================================

/// An immutable, atomically appended batch of events for one stream.
///
/// # Server-Assigned Fields
///
/// `is_dispatched` and `created_ms` are overwritten by
/// [`Partition::append`](crate::Partition::append): the stored commit always
/// starts undispatched and carries the time of the write.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    /// Globally unique commit id.
    pub id: CommitId,

    /// Logical grouping of the commit, carried through unchanged.
    pub bucket_id: String,

    /// The stream this commit belongs to.
    pub stream_id: StreamId,

    /// Position of this commit within the stream.
    pub commit_sequence: CommitSequence,

    /// The events of this commit, ordered by version. Never empty.
    pub events: Vec<Event>,

    /// Whether the commit was handed to downstream consumers.
    pub is_dispatched: bool,

    /// When the commit was stored (Unix milliseconds).
    pub created_ms: u64,
}

impl Commit {
    /// Creates a new, not yet stored commit.
    pub fn new(
        id: impl Into<CommitId>,
        bucket_id: impl Into<String>,
        stream_id: impl Into<StreamId>,
        commit_sequence: u64,
        events: Vec<Event>,
    ) -> Self {
        Self {
            id: id.into(),
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            commit_sequence: CommitSequence::from_raw(commit_sequence),
            events,
            is_dispatched: false,
            created_ms: 0,
        }
    }

    /// Version of the first event, if any.
    pub fn first_version(&self) -> Option<EventVersion> {
        self.events.first().map(|e| e.version)
    }

    /// Version of the last event, if any.
    pub fn last_version(&self) -> Option<EventVersion> {
        self.events.last().map(|e| e.version)
    }

    /// Number of events in this commit.
    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// The latest materialized state of a stream.
///
/// Only one snapshot is kept per stream; storing a new one replaces the old.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// The stream this snapshot belongs to (primary key).
    pub stream_id: StreamId,

    /// The stream version the snapshot was taken at.
    ///
    /// [`Snapshot::REMOVED_VERSION`] marks a removed snapshot.
    pub version: i64,

    /// The materialized state.
    pub snapshot: Value,
}

impl Snapshot {
    /// Sentinel version meaning "no usable snapshot".
    pub const REMOVED_VERSION: i64 = -1;

    /// Creates a snapshot record.
    pub fn new(stream_id: impl Into<StreamId>, snapshot: Value, version: i64) -> Self {
        Self {
            stream_id: stream_id.into(),
            version,
            snapshot,
        }
    }

    /// Creates the sentinel record written by a removal.
    pub fn removed(stream_id: impl Into<StreamId>) -> Self {
        Self::new(stream_id, Value::Null, Self::REMOVED_VERSION)
    }

    /// Returns true unless this is the removal sentinel.
    ///
    /// Callers must check this before replaying from a loaded snapshot.
    pub fn is_usable(&self) -> bool {
        self.version != Self::REMOVED_VERSION
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_id_resolve() {
        assert_eq!(PartitionId::resolve(None, "master"), PartitionId::default());
        assert_eq!(PartitionId::resolve(Some(""), "master"), PartitionId::default());
        assert_eq!(PartitionId::resolve(Some("1"), "master").as_str(), "1");
        assert_eq!(PartitionId::resolve(None, "other").as_str(), "other");
    }

    #[test]
    fn test_stream_id_from_conversions() {
        let from_str: StreamId = "test".into();
        let from_string: StreamId = String::from("test").into();
        assert_eq!(from_str, from_string);
        assert!(!from_str.is_empty());
        assert!(StreamId::new("").is_empty());
    }

    #[test]
    fn test_commit_sequence_ordering() {
        let first = CommitSequence::FIRST;
        assert_eq!(first.as_raw(), 0);
        assert!(Some(first) < first.next());
        assert_eq!(first.next(), Some(CommitSequence::from_raw(1)));
        assert_eq!(CommitSequence::from_raw(u64::MAX).next(), None);
        assert_eq!(EventVersion::from_raw(u64::MAX).next(), None);
    }

    #[test]
    fn test_event_builder() {
        let event = Event::new("e-1", "OrderPlaced", json!({"total": 10})).with_version(7);
        assert_eq!(event.id.as_str(), "e-1");
        assert_eq!(event.event_type, "OrderPlaced");
        assert_eq!(event.version, EventVersion::from_raw(7));
    }

    /// The stored JSON shape uses `type` as the tag field name.
    #[test]
    fn test_event_json_shape() {
        let event = Event::new("e-1", "OrderPlaced", json!({"total": 10})).with_version(2);
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(
            encoded,
            json!({"id": "e-1", "type": "OrderPlaced", "data": {"total": 10}, "version": 2})
        );
    }

    #[test]
    fn test_commit_versions() {
        let commit = Commit::new(
            "c-1",
            "master",
            "stream-1",
            0,
            vec![
                Event::new("e-1", "a", Value::Null).with_version(3),
                Event::new("e-2", "b", Value::Null).with_version(4),
            ],
        );
        assert_eq!(commit.first_version(), Some(EventVersion::from_raw(3)));
        assert_eq!(commit.last_version(), Some(EventVersion::from_raw(4)));
        assert_eq!(commit.event_count(), 2);
        assert!(!commit.is_dispatched);

        let empty = Commit::new("c-2", "master", "stream-1", 1, vec![]);
        assert_eq!(empty.first_version(), None);
    }

    #[test]
    fn test_snapshot_sentinel() {
        let snapshot = Snapshot::new("stream-1", json!({"count": 3}), 10);
        assert!(snapshot.is_usable());

        let removed = Snapshot::removed("stream-1");
        assert!(!removed.is_usable());
        assert_eq!(removed.version, -1);
        assert_eq!(removed.snapshot, Value::Null);
    }
}
