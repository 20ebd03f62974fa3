//! Local cache: the durable, per-collection record store.
//!
//! Source of truth for reads while disconnected. Writes replace the whole
//! payload for a `(collection, id)` pair, so readers never observe a
//! record with some fields updated and others stale. Superseded records
//! are tombstoned rather than removed so an in-flight read cannot race a
//! physical delete.
//!
//! All functions take a locked connection; the sync engine serializes
//! cache and outbox mutations under a single lock.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::SyncError;

/// Upsert a record payload. Durable before return (WAL journal).
pub fn put(conn: &Connection, collection: &str, id: &str, payload: &Value) -> Result<(), SyncError> {
    let json = serde_json::to_string(payload)
        .map_err(|e| SyncError::Invalid(format!("serialize cache payload: {e}")))?;
    conn.execute(
        "INSERT INTO local_cache (collection, record_id, payload, deleted, updated_at)
         VALUES (?1, ?2, ?3, 0, datetime('now'))
         ON CONFLICT(collection, record_id) DO UPDATE SET
            payload = excluded.payload,
            deleted = 0,
            updated_at = excluded.updated_at",
        params![collection, id, json],
    )
    .map_err(|e| SyncError::Storage(format!("cache put: {e}")))?;
    Ok(())
}

/// All non-tombstoned records in a collection, oldest write first.
pub fn get_all(conn: &Connection, collection: &str) -> Result<Vec<Value>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT payload FROM local_cache
             WHERE collection = ?1 AND deleted = 0
             ORDER BY updated_at ASC, record_id ASC",
        )
        .map_err(|e| SyncError::Storage(format!("cache get_all: {e}")))?;

    let rows = stmt
        .query_map(params![collection], |row| row.get::<_, String>(0))
        .map_err(|e| SyncError::Storage(format!("cache get_all: {e}")))?;

    let mut records = Vec::new();
    for row in rows {
        let json = row.map_err(|e| SyncError::Storage(format!("cache row: {e}")))?;
        match serde_json::from_str::<Value>(&json) {
            Ok(v) => records.push(v),
            Err(e) => {
                tracing::warn!(collection, error = %e, "skipping malformed cache payload");
            }
        }
    }
    Ok(records)
}

/// Single-record read; `None` when missing or tombstoned.
pub fn get(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>, SyncError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT payload FROM local_cache
             WHERE collection = ?1 AND record_id = ?2 AND deleted = 0",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("cache get: {e}")))?;

    match json {
        Some(j) => Ok(Some(serde_json::from_str(&j)?)),
        None => Ok(None),
    }
}

/// Tombstone a record: excluded from reads, row retained.
pub fn mark_deleted(conn: &Connection, collection: &str, id: &str) -> Result<(), SyncError> {
    conn.execute(
        "UPDATE local_cache SET deleted = 1, updated_at = datetime('now')
         WHERE collection = ?1 AND record_id = ?2",
        params![collection, id],
    )
    .map_err(|e| SyncError::Storage(format!("cache mark_deleted: {e}")))?;
    Ok(())
}

/// Ids of live rows in a collection. Used by the drain-cycle refresh to
/// find local-only entries superseded by the remote set.
pub fn live_ids(conn: &Connection, collection: &str) -> Result<Vec<String>, SyncError> {
    let mut stmt = conn
        .prepare("SELECT record_id FROM local_cache WHERE collection = ?1 AND deleted = 0")
        .map_err(|e| SyncError::Storage(format!("cache live_ids: {e}")))?;
    let rows = stmt
        .query_map(params![collection], |row| row.get::<_, String>(0))
        .map_err(|e| SyncError::Storage(format!("cache live_ids: {e}")))?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(|e| SyncError::Storage(format!("cache row: {e}")))?);
    }
    Ok(ids)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_put_overwrites_by_id() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        put(&conn, "payments", "r1", &serde_json::json!({"price": 100.0})).unwrap();
        put(&conn, "payments", "r1", &serde_json::json!({"price": 130.0})).unwrap();

        let all = get_all(&conn, "payments").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["price"], 130.0);
    }

    #[test]
    fn test_tombstone_excluded_from_reads() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        put(&conn, "payments", "r1", &serde_json::json!({"price": 1.0})).unwrap();
        put(&conn, "payments", "r2", &serde_json::json!({"price": 2.0})).unwrap();
        mark_deleted(&conn, "payments", "r1").unwrap();

        let all = get_all(&conn, "payments").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["price"], 2.0);
        assert!(get(&conn, "payments", "r1").unwrap().is_none());

        // Row is retained, not physically removed
        let raw: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM local_cache WHERE collection = 'payments'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(raw, 2);
    }

    #[test]
    fn test_put_revives_tombstoned_row() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        put(&conn, "payments", "r1", &serde_json::json!({"v": 1})).unwrap();
        mark_deleted(&conn, "payments", "r1").unwrap();
        put(&conn, "payments", "r1", &serde_json::json!({"v": 2})).unwrap();

        let rec = get(&conn, "payments", "r1").unwrap().expect("revived");
        assert_eq!(rec["v"], 2);
    }

    #[test]
    fn test_collections_are_isolated() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        put(&conn, "payments", "r1", &serde_json::json!({"v": 1})).unwrap();
        put(&conn, "products", "r1", &serde_json::json!({"v": 2})).unwrap();

        assert_eq!(get_all(&conn, "payments").unwrap().len(), 1);
        assert_eq!(get_all(&conn, "products").unwrap().len(), 1);
        assert_eq!(get(&conn, "products", "r1").unwrap().unwrap()["v"], 2);
    }
}
