//! # Snapshot Store
//!
//! One snapshot row per stream, upserted on every store. A removal is logical:
//! the row is overwritten with version `-1` and a `null` payload, so readers
//! must check [`Snapshot::is_usable`] before trusting what they load.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::codec::{decode_payload, encode_payload};
use crate::commits::require_stream;
use crate::error::Result;
use crate::schema::PartitionTables;
use crate::types::{Snapshot, StreamId};

/// Inserts or replaces the snapshot of a stream and returns what was stored.
pub fn store(
    conn: &Connection,
    tables: &PartitionTables,
    stream_id: &StreamId,
    payload: Value,
    version: i64,
) -> Result<Snapshot> {
    require_stream(stream_id)?;

    let text = encode_payload(&payload)?;
    conn.execute(
        &format!(
            "INSERT INTO {} (stream_id, version, payload) VALUES (?1, ?2, ?3)
             ON CONFLICT(stream_id) DO UPDATE SET
                version = excluded.version,
                payload = excluded.payload",
            tables.snapshots()
        ),
        params![stream_id.as_str(), version, text],
    )?;

    Ok(Snapshot::new(stream_id.clone(), payload, version))
}

/// Loads the snapshot of a stream.
///
/// A removed snapshot is returned as its sentinel record, not as `None`.
pub fn load(conn: &Connection, tables: &PartitionTables, stream_id: &StreamId) -> Result<Option<Snapshot>> {
    require_stream(stream_id)?;

    let row: Option<(i64, String)> = conn
        .query_row(
            &format!(
                "SELECT version, payload FROM {} WHERE stream_id = ?1",
                tables.snapshots()
            ),
            [stream_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((version, text)) => Ok(Some(Snapshot::new(
            stream_id.clone(),
            decode_payload(&text)?,
            version,
        ))),
        None => Ok(None),
    }
}

/// Marks the snapshot of a stream as unusable.
pub fn remove(conn: &Connection, tables: &PartitionTables, stream_id: &StreamId) -> Result<()> {
    let removed = Snapshot::removed(stream_id.clone());
    store(conn, tables, stream_id, removed.snapshot, removed.version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::types::PartitionId;
    use crate::Error;
    use serde_json::json;

    fn setup() -> (Connection, PartitionTables) {
        let db = Database::open_in_memory().unwrap();
        let tables = PartitionTables::new("tw", &PartitionId::default());
        db.ensure_partition(&tables).unwrap();
        (db.into_connection(), tables)
    }

    #[test]
    fn test_store_and_load() {
        let (conn, tables) = setup();
        let stream = StreamId::new("s-1");

        let stored = store(&conn, &tables, &stream, json!({"total": 5}), 7).unwrap();
        let loaded = load(&conn, &tables, &stream).unwrap().unwrap();

        assert_eq!(loaded, stored);
        assert_eq!(loaded.version, 7);
        assert!(loaded.is_usable());
    }

    #[test]
    fn test_store_replaces() {
        let (conn, tables) = setup();
        let stream = StreamId::new("s-1");

        store(&conn, &tables, &stream, json!({"total": 5}), 7).unwrap();
        store(&conn, &tables, &stream, json!({"total": 9}), 12).unwrap();

        let loaded = load(&conn, &tables, &stream).unwrap().unwrap();
        assert_eq!(loaded.snapshot, json!({"total": 9}));
        assert_eq!(loaded.version, 12);

        let rows: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", tables.snapshots()), [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_remove_leaves_sentinel() {
        let (conn, tables) = setup();
        let stream = StreamId::new("s-1");

        store(&conn, &tables, &stream, json!({"total": 5}), 7).unwrap();
        remove(&conn, &tables, &stream).unwrap();

        let loaded = load(&conn, &tables, &stream).unwrap().unwrap();
        assert!(!loaded.is_usable());
        assert_eq!(loaded.version, Snapshot::REMOVED_VERSION);
        assert_eq!(loaded.snapshot, Value::Null);
    }

    #[test]
    fn test_missing_and_invalid() {
        let (conn, tables) = setup();
        assert!(load(&conn, &tables, &StreamId::new("none")).unwrap().is_none());
        assert!(matches!(
            store(&conn, &tables, &StreamId::new(""), json!({}), 0),
            Err(Error::InvalidArgument(_))
        ));
    }
}
