#![allow(dead_code)]

use std::ops::Range;
use std::path::{Path, PathBuf};

use commitdb::{Commit, CommitDB, Database, Event, Partition};
use rusqlite::{Connection, OpenFlags};
use serde_json::json;

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

/// Opens a file-backed store and its default partition.
pub async fn open_master(path: &Path) -> (CommitDB, Partition) {
    let db = CommitDB::open(path).await.expect("open store");
    let partition = db.open_partition(None).await.expect("open master partition");
    (db, partition)
}

/// Builds a commit whose events carry the given versions.
pub fn commit(id: &str, stream: &str, sequence: u64, versions: Range<u64>) -> Commit {
    let events = versions
        .map(|v| {
            Event::new(
                format!("{}-{}", id, v),
                "CounterIncremented",
                json!({ "by": 1, "version": v }),
            )
            .with_version(v)
        })
        .collect();
    Commit::new(id, "default", stream, sequence, events)
}

/// Versions of every event, grouped by commit.
pub fn versions(commits: &[Commit]) -> Vec<Vec<u64>> {
    commits
        .iter()
        .map(|c| c.events.iter().map(|e| e.version.as_raw()).collect())
        .collect()
}

pub fn count_rows(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{}\"", table), [], |row| row.get(0))
        .expect("count rows")
}
