//! Outbox: the durable log of pending mutation intents.
//!
//! One entry per `(collection, record id)`. A second local edit to a
//! not-yet-synced record replaces the pending payload instead of
//! appending, and a `create` keeps precedence over a later `update`
//! (the remote id does not exist yet, so the merged payload must replay
//! as a single create). Entries drain in enqueue order and are removed
//! only after confirmed remote application, so a crashed drain simply
//! replays from the same persisted state.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::SyncError;

/// Mutation intent recorded against the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxAction {
    Create,
    Update,
}

impl OutboxAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxAction::Create => "create",
            OutboxAction::Update => "update",
        }
    }

    fn from_str(s: &str) -> Result<Self, SyncError> {
        match s {
            "create" => Ok(OutboxAction::Create),
            "update" => Ok(OutboxAction::Update),
            other => Err(SyncError::Invalid(format!("unknown outbox action: {other}"))),
        }
    }
}

/// A pending entry as drained by the sync engine.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub collection: String,
    pub record_id: String,
    pub action: OutboxAction,
    pub payload: Value,
    pub idempotency_key: String,
    pub seq: i64,
    pub enqueued_at: String,
    /// Bumped on every payload replacement. The drain removes an entry
    /// only when the generation it replayed is still current, so an edit
    /// landing while the entry is in flight is never dropped unreplayed.
    pub generation: i64,
}

/// Enqueue a mutation intent, deduplicating by record id.
///
/// Replay dedup keys: `create:{id}` is stable across edits to an unsynced
/// record; updates key on the allocated sequence number so distinct edits
/// after a sync are distinct remote applications.
pub fn enqueue(
    conn: &Connection,
    action: OutboxAction,
    collection: &str,
    id: &str,
    payload: &Value,
) -> Result<(), SyncError> {
    let json = serde_json::to_string(payload)
        .map_err(|e| SyncError::Invalid(format!("serialize outbox payload: {e}")))?;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| SyncError::Storage(format!("begin enqueue: {e}")))?;

    let result = (|| -> Result<(), SyncError> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT action FROM outbox WHERE collection = ?1 AND record_id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| SyncError::Storage(format!("query outbox: {e}")))?;

        if let Some(prior) = existing {
            // Replace the payload; a pending create stays a create even
            // when the new intent is an update.
            let prior_action = OutboxAction::from_str(&prior)?;
            let kept = match (prior_action, action) {
                (OutboxAction::Create, _) => OutboxAction::Create,
                (OutboxAction::Update, a) => a,
            };
            conn.execute(
                "UPDATE outbox SET action = ?3, payload = ?4, generation = generation + 1
                 WHERE collection = ?1 AND record_id = ?2",
                params![collection, id, kept.as_str(), json],
            )
            .map_err(|e| SyncError::Storage(format!("replace outbox entry: {e}")))?;
            return Ok(());
        }

        let seq: i64 = conn
            .query_row("SELECT next_seq FROM outbox_seq WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(|e| SyncError::Storage(format!("read outbox seq: {e}")))?;
        conn.execute(
            "UPDATE outbox_seq SET next_seq = next_seq + 1 WHERE id = 1",
            [],
        )
        .map_err(|e| SyncError::Storage(format!("advance outbox seq: {e}")))?;

        let idempotency_key = match action {
            OutboxAction::Create => format!("create:{id}"),
            OutboxAction::Update => format!("update:{id}:{seq}"),
        };
        conn.execute(
            "INSERT INTO outbox
                (collection, record_id, action, payload, idempotency_key, seq, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                collection,
                id,
                action.as_str(),
                json,
                idempotency_key,
                seq,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| SyncError::Storage(format!("insert outbox entry: {e}")))?;
        Ok(())
    })();

    match result {
        Ok(()) => conn
            .execute_batch("COMMIT")
            .map_err(|e| SyncError::Storage(format!("commit enqueue: {e}"))),
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// All pending entries for a collection, in enqueue order.
pub fn pending(conn: &Connection, collection: &str) -> Result<Vec<OutboxEntry>, SyncError> {
    let mut stmt = conn
        .prepare(
            "SELECT collection, record_id, action, payload, idempotency_key, seq, enqueued_at,
                    generation
             FROM outbox WHERE collection = ?1 ORDER BY seq ASC",
        )
        .map_err(|e| SyncError::Storage(format!("prepare pending: {e}")))?;

    let rows = stmt
        .query_map(params![collection], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, i64>(7)?,
            ))
        })
        .map_err(|e| SyncError::Storage(format!("query pending: {e}")))?;

    let mut entries = Vec::new();
    for row in rows {
        let (collection, record_id, action, payload, idempotency_key, seq, enqueued_at, generation) =
            row.map_err(|e| SyncError::Storage(format!("outbox row: {e}")))?;
        entries.push(OutboxEntry {
            collection,
            record_id,
            action: OutboxAction::from_str(&action)?,
            payload: serde_json::from_str(&payload)?,
            idempotency_key,
            seq,
            enqueued_at,
            generation,
        });
    }
    Ok(entries)
}

/// Remove an entry after its remote application is confirmed.
pub fn remove(conn: &Connection, collection: &str, id: &str) -> Result<(), SyncError> {
    conn.execute(
        "DELETE FROM outbox WHERE collection = ?1 AND record_id = ?2",
        params![collection, id],
    )
    .map_err(|e| SyncError::Storage(format!("remove outbox entry: {e}")))?;
    Ok(())
}

/// Remove an entry only if its payload has not been replaced since the
/// given generation was read. Returns false when a newer payload is
/// pending; the caller must leave it to be replayed.
pub fn remove_if_unchanged(
    conn: &Connection,
    collection: &str,
    id: &str,
    generation: i64,
) -> Result<bool, SyncError> {
    let n = conn
        .execute(
            "DELETE FROM outbox
             WHERE collection = ?1 AND record_id = ?2 AND generation = ?3",
            params![collection, id, generation],
        )
        .map_err(|e| SyncError::Storage(format!("remove outbox entry: {e}")))?;
    Ok(n > 0)
}

/// Re-key a surviving entry after the create it superseded was confirmed
/// remotely: the record now exists under `remote_id`, so the pending
/// payload replays as an update addressed to it. Keeps the entry's seq
/// (drain order) and returns the re-keyed payload, or `None` when no
/// entry is pending.
pub fn rekey_to_update(
    conn: &Connection,
    collection: &str,
    local_id: &str,
    remote_id: &str,
) -> Result<Option<Value>, SyncError> {
    let row: Option<(String, i64)> = conn
        .query_row(
            "SELECT payload, seq FROM outbox WHERE collection = ?1 AND record_id = ?2",
            params![collection, local_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| SyncError::Storage(format!("query outbox for rekey: {e}")))?;

    let Some((json, seq)) = row else {
        return Ok(None);
    };
    let mut payload: Value = serde_json::from_str(&json)?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("id".to_string(), Value::String(remote_id.to_string()));
    }
    let rekeyed = serde_json::to_string(&payload)
        .map_err(|e| SyncError::Invalid(format!("serialize rekeyed payload: {e}")))?;

    conn.execute(
        "UPDATE outbox
         SET record_id = ?3, action = 'update', payload = ?4, idempotency_key = ?5
         WHERE collection = ?1 AND record_id = ?2",
        params![
            collection,
            local_id,
            remote_id,
            rekeyed,
            format!("update:{remote_id}:{seq}"),
        ],
    )
    .map_err(|e| SyncError::Storage(format!("rekey outbox entry: {e}")))?;
    Ok(Some(payload))
}

/// Total pending entries across all collections.
pub fn len(conn: &Connection) -> Result<i64, SyncError> {
    conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
        .map_err(|e| SyncError::Storage(format!("count outbox: {e}")))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn test_enqueue_dedups_by_id() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        enqueue(
            &conn,
            OutboxAction::Create,
            "payments",
            "offline-1",
            &serde_json::json!({"qty": 1}),
        )
        .unwrap();
        enqueue(
            &conn,
            OutboxAction::Update,
            "payments",
            "offline-1",
            &serde_json::json!({"qty": 3}),
        )
        .unwrap();

        let entries = pending(&conn, "payments").unwrap();
        assert_eq!(entries.len(), 1);
        // Create precedence: replayed as a single create with the merged payload
        assert_eq!(entries[0].action, OutboxAction::Create);
        assert_eq!(entries[0].payload["qty"], 3);
        assert_eq!(entries[0].idempotency_key, "create:offline-1");
    }

    #[test]
    fn test_pending_preserves_enqueue_order() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        for id in ["a", "b", "c"] {
            enqueue(
                &conn,
                OutboxAction::Create,
                "payments",
                id,
                &serde_json::json!({}),
            )
            .unwrap();
        }
        // Re-enqueueing "a" must not move it to the back
        enqueue(
            &conn,
            OutboxAction::Update,
            "payments",
            "a",
            &serde_json::json!({"edited": true}),
        )
        .unwrap();

        let order: Vec<String> = pending(&conn, "payments")
            .unwrap()
            .into_iter()
            .map(|e| e.record_id)
            .collect();
        assert_eq!(order, ["a", "b", "c"]);
    }

    #[test]
    fn test_remove_only_named_entry() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        enqueue(
            &conn,
            OutboxAction::Create,
            "payments",
            "a",
            &serde_json::json!({}),
        )
        .unwrap();
        enqueue(
            &conn,
            OutboxAction::Update,
            "payments",
            "b",
            &serde_json::json!({}),
        )
        .unwrap();

        remove(&conn, "payments", "a").unwrap();
        let entries = pending(&conn, "payments").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record_id, "b");
        assert_eq!(len(&conn).unwrap(), 1);
    }

    #[test]
    fn test_replace_bumps_generation() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        enqueue(
            &conn,
            OutboxAction::Create,
            "payments",
            "offline-1",
            &serde_json::json!({"v": 1}),
        )
        .unwrap();
        let first = pending(&conn, "payments").unwrap()[0].generation;

        enqueue(
            &conn,
            OutboxAction::Update,
            "payments",
            "offline-1",
            &serde_json::json!({"v": 2}),
        )
        .unwrap();
        let second = pending(&conn, "payments").unwrap()[0].generation;
        assert_eq!(second, first + 1);

        // A stale generation no longer deletes; the current one does
        assert!(!remove_if_unchanged(&conn, "payments", "offline-1", first).unwrap());
        assert_eq!(len(&conn).unwrap(), 1);
        assert!(remove_if_unchanged(&conn, "payments", "offline-1", second).unwrap());
        assert_eq!(len(&conn).unwrap(), 0);
    }

    #[test]
    fn test_rekey_to_update_after_confirmed_create() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        enqueue(
            &conn,
            OutboxAction::Create,
            "payments",
            "offline-1",
            &serde_json::json!({"id": "offline-1", "customerName": "Ana"}),
        )
        .unwrap();

        let payload = rekey_to_update(&conn, "payments", "offline-1", "rem-000007")
            .unwrap()
            .expect("entry pending");
        assert_eq!(payload["id"], "rem-000007");

        let entries = pending(&conn, "payments").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record_id, "rem-000007");
        assert_eq!(entries[0].action, OutboxAction::Update);
        assert!(entries[0].idempotency_key.starts_with("update:rem-000007:"));

        // Nothing pending for a record with no surviving entry
        assert!(rekey_to_update(&conn, "payments", "offline-2", "rem-000008")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_update_entries_get_distinct_idempotency_keys() {
        let db = db::open_in_memory_for_test();
        let conn = db.lock().unwrap();

        enqueue(
            &conn,
            OutboxAction::Update,
            "payments",
            "r1",
            &serde_json::json!({}),
        )
        .unwrap();
        let first = pending(&conn, "payments").unwrap()[0].idempotency_key.clone();
        remove(&conn, "payments", "r1").unwrap();

        enqueue(
            &conn,
            OutboxAction::Update,
            "payments",
            "r1",
            &serde_json::json!({}),
        )
        .unwrap();
        let second = pending(&conn, "payments").unwrap()[0].idempotency_key.clone();

        assert_ne!(first, second, "distinct edits are distinct applications");
    }
}
