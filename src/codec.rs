//! # Event Encoding and Decoding
//!
//! This module provides the codec for storing a commit's events and a
//! snapshot's payload. Events are stored as one JSON array per commit, with an
//! integrity checksum next to it.
//!
//! ## Commit Format
//!
//! ```text
//! events   = JSON([{"id": .., "type": .., "data": .., "version": ..}, ...])
//! checksum = XXH3-64(events), little-endian
//! ```
//!
//! Commit metadata (stream_id, commit_sequence, created_ms, ...) lives in
//! table columns, not in the blob, so the indexes can use it directly.

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::Event;

// =============================================================================
// Events
// =============================================================================

/// Encodes a commit's events into a blob and its checksum.
pub fn encode_events(events: &[Event]) -> Result<(Vec<u8>, Vec<u8>)> {
    let blob = serde_json::to_vec(events)?;
    let checksum = compute_checksum(&blob);
    Ok((blob, checksum))
}

/// Verifies and decodes a commit's events.
///
/// # Errors
///
/// - `Error::Corruption` if the checksum doesn't match the blob
/// - `Error::Serialization` if the blob is not a valid event array
pub fn decode_events(blob: &[u8], checksum: &[u8], commit_id: &str) -> Result<Vec<Event>> {
    if compute_checksum(blob) != checksum {
        tracing::warn!(commit_id, "event checksum mismatch");
        return Err(Error::Corruption(format!(
            "checksum mismatch for events of commit '{}'",
            commit_id
        )));
    }
    Ok(serde_json::from_slice(blob)?)
}

// =============================================================================
// Snapshot Payloads
// =============================================================================

/// Encodes a snapshot payload as JSON text.
pub fn encode_payload(payload: &Value) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

/// Decodes a snapshot payload from JSON text.
pub fn decode_payload(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Computes a checksum for stored data.
///
/// Uses XXH3-64: extremely fast, with good distribution for integrity checks.
pub fn compute_checksum(data: &[u8]) -> Vec<u8> {
    let hash = xxhash_rust::xxh3::xxh3_64(data);
    hash.to_le_bytes().to_vec()
}

/// Returns the current time in milliseconds since Unix epoch.
///
/// A clock set before 1970 reads as 0.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// =============================================================================
// Tests
// =============================================================================
