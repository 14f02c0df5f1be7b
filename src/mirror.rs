//! Local mirror of server collections.
//!
//! One table per [`EntityKind`]; each row stores the sanitized document as
//! JSON plus its sort key and sync status. Reads return plain documents with
//! `syncStatus` attached so the UI can render pending rows differently.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::db;
use crate::entities::{EntityKind, SyncStatus};
use crate::error::StoreError;
use crate::queue;
use crate::sanitize::{placeholder_document, salvage_id, sanitize_document, Document};

pub const DEBUG_SETTINGS_CATEGORY: &str = "debug";
pub const LAST_SANITIZE_FAILURE_KEY: &str = "last_sanitize_failure";

const SNAPSHOT_PREVIEW_CHARS: usize = 2_000;

/// Outcome of refreshing one table from authoritative remote state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshCounts {
    pub upserted: usize,
    pub removed: usize,
    pub kept_pending: usize,
}

fn document_id(doc: &Document) -> Result<String, StoreError> {
    doc.get("_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidData("document has no _id".into()))
}

/// Sort keys are compared as text. Numbers are read as Unix epochs
/// (milliseconds from 1e11 up, seconds below) and stored in the same
/// timestamp format the producer writes, so they order chronologically.
fn sort_key(kind: EntityKind, doc: &Document) -> Option<String> {
    match doc.get(kind.sort_field())? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(
            n.as_i64()
                .and_then(epoch_sort_key)
                .unwrap_or_else(|| n.to_string()),
        ),
        _ => None,
    }
}

fn epoch_sort_key(epoch: i64) -> Option<String> {
    let millis = if epoch.abs() >= 100_000_000_000 {
        epoch
    } else {
        epoch.checked_mul(1_000)?
    };
    DateTime::<Utc>::from_timestamp_millis(millis).map(queue::timestamp)
}

fn record_sanitize_failure(conn: &Connection, kind: EntityKind, id: &str, error: &str, raw: &Value) {
    let preview: String = raw.to_string().chars().take(SNAPSHOT_PREVIEW_CHARS).collect();
    let snapshot = json!({
        "entity": kind.as_str(),
        "id": id,
        "error": error,
        "at": Utc::now().to_rfc3339(),
        "payloadPreview": preview,
    });
    if let Err(e) = db::set_setting(
        conn,
        DEBUG_SETTINGS_CATEGORY,
        LAST_SANITIZE_FAILURE_KEY,
        &snapshot.to_string(),
    ) {
        warn!(error = %e, "Failed to store sanitize failure snapshot");
    }
}

fn row_to_document(data: &str, status: &str) -> Result<Document, StoreError> {
    let mut doc: Document = serde_json::from_str(data)?;
    doc.insert("syncStatus".into(), Value::String(status.to_string()));
    Ok(doc)
}

/// Sanitize and upsert a document.
///
/// A payload that fails sanitization is stored as a placeholder keeping
/// only its identifier, and a debug snapshot is written to local settings.
/// Only a payload without any usable identifier is rejected.
pub fn put(
    conn: &Connection,
    kind: EntityKind,
    value: Value,
    status: SyncStatus,
) -> Result<Document, StoreError> {
    let mut doc = match sanitize_document(value.clone()) {
        Ok(doc) => doc,
        Err(err) => {
            let Some(id) = salvage_id(&value) else {
                return Err(StoreError::Sanitize(err));
            };
            warn!(entity = %kind, id = %id, error = %err, "Storing placeholder for unsanitizable document");
            record_sanitize_failure(conn, kind, &id, &err.to_string(), &value);
            placeholder_document(&id)
        }
    };
    doc.remove("syncStatus");

    let id = document_id(&doc)?;
    let data = serde_json::to_string(&doc)?;
    conn.execute(
        &format!(
            "INSERT INTO {table} (_id, data, sort_key, sync_status, updated_at)
             VALUES (?1, ?2, ?3, ?4, datetime('now'))
             ON CONFLICT(_id) DO UPDATE SET
                data = excluded.data,
                sort_key = excluded.sort_key,
                sync_status = excluded.sync_status,
                updated_at = excluded.updated_at",
            table = kind.table()
        ),
        params![id, data, sort_key(kind, &doc), status.as_str()],
    )?;

    doc.insert("syncStatus".into(), Value::String(status.as_str().into()));
    Ok(doc)
}

pub fn get(conn: &Connection, kind: EntityKind, id: &str) -> Result<Option<Document>, StoreError> {
    let row: Option<(String, String)> = conn
        .query_row(
            &format!(
                "SELECT data, sync_status FROM {} WHERE _id = ?1",
                kind.table()
            ),
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(data, status)| row_to_document(&data, &status))
        .transpose()
}

fn list_where(
    conn: &Connection,
    kind: EntityKind,
    filter: &str,
) -> Result<Vec<Document>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT data, sync_status FROM {table} {filter}
         ORDER BY sort_key DESC, _id ASC",
        table = kind.table()
    ))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    rows.iter()
        .map(|(data, status)| row_to_document(data, status))
        .collect()
}

/// All documents of a kind, newest first by the kind's sort field.
pub fn list(conn: &Connection, kind: EntityKind) -> Result<Vec<Document>, StoreError> {
    list_where(conn, kind, "")
}

pub fn list_pending(conn: &Connection, kind: EntityKind) -> Result<Vec<Document>, StoreError> {
    list_where(conn, kind, "WHERE sync_status = 'pending'")
}

pub fn remove(conn: &Connection, kind: EntityKind, id: &str) -> Result<bool, StoreError> {
    let n = conn.execute(
        &format!("DELETE FROM {} WHERE _id = ?1", kind.table()),
        params![id],
    )?;
    Ok(n > 0)
}

pub fn set_sync_status(
    conn: &Connection,
    kind: EntityKind,
    id: &str,
    status: SyncStatus,
) -> Result<bool, StoreError> {
    let n = conn.execute(
        &format!(
            "UPDATE {} SET sync_status = ?1, updated_at = datetime('now') WHERE _id = ?2",
            kind.table()
        ),
        params![status.as_str(), id],
    )?;
    Ok(n > 0)
}

/// Rewrite a locally created row from its temp id to the server-assigned id.
///
/// Fields from the server document are merged in. When `status` is still
/// `Pending` (later edits are queued) local values win over server values.
pub fn replace_id(
    conn: &Connection,
    kind: EntityKind,
    temp_id: &str,
    server_id: &str,
    server_doc: Option<&Document>,
    status: SyncStatus,
) -> Result<Document, StoreError> {
    let local = get(conn, kind, temp_id)?;
    let mut merged = match (local, server_doc) {
        (Some(local), Some(server)) if status == SyncStatus::Pending => {
            let mut merged = server.clone();
            merged.extend(local);
            merged
        }
        (Some(mut local), Some(server)) => {
            local.extend(server.clone());
            local
        }
        (Some(local), None) => local,
        (None, Some(server)) => server.clone(),
        (None, None) => {
            return Err(StoreError::NotFound {
                kind: kind.as_str().into(),
                id: temp_id.into(),
            })
        }
    };
    merged.insert("_id".into(), Value::String(server_id.to_string()));

    if temp_id != server_id {
        remove(conn, kind, temp_id)?;
    }
    debug!(entity = %kind, temp_id, server_id, "Rewrote temp id to server id");
    put(conn, kind, Value::Object(merged), status)
}

/// Refresh a table from remote documents, leaving pending local rows alone.
pub fn replace_all_synced(
    conn: &Connection,
    kind: EntityKind,
    docs: Vec<Value>,
) -> Result<RefreshCounts, StoreError> {
    let pending: HashSet<String> = list_ids(conn, kind, SyncStatus::Pending)?
        .into_iter()
        .collect();
    let mut counts = RefreshCounts::default();
    let mut incoming = HashSet::new();

    for doc in docs {
        let Some(id) = salvage_id(&doc) else {
            warn!(entity = %kind, "Skipping remote document without an id");
            continue;
        };
        incoming.insert(id.clone());
        if pending.contains(&id) {
            counts.kept_pending += 1;
            continue;
        }
        let mut doc = doc;
        if let Value::Object(map) = &mut doc {
            map.insert("_id".into(), Value::String(id.clone()));
        }
        put(conn, kind, doc, SyncStatus::Synced)?;
        counts.upserted += 1;
    }

    for id in list_ids(conn, kind, SyncStatus::Synced)? {
        if !incoming.contains(&id) {
            remove(conn, kind, &id)?;
            counts.removed += 1;
        }
    }

    Ok(counts)
}

fn list_ids(
    conn: &Connection,
    kind: EntityKind,
    status: SyncStatus,
) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT _id FROM {} WHERE sync_status = ?1",
        kind.table()
    ))?;
    let ids = stmt
        .query_map(params![status.as_str()], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

pub fn count(conn: &Connection, kind: EntityKind) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", kind.table()),
        [],
        |row| row.get(0),
    )?)
}

/// True when no mirror table holds any row.
pub fn is_empty(conn: &Connection) -> Result<bool, StoreError> {
    for kind in EntityKind::ALL {
        if count(conn, kind)? > 0 {
            return Ok(false);
        }
    }
    Ok(true)
}

pub fn clear_all(conn: &Connection) -> Result<(), StoreError> {
    for kind in EntityKind::ALL {
        conn.execute(&format!("DELETE FROM {}", kind.table()), [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_in_memory, DbState};

    fn test_db() -> DbState {
        open_in_memory().expect("in-memory db")
    }

    #[test]
    fn test_put_then_get_round_trips_minus_stripped_fields() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let input = json!({
            "_id": "inv-1",
            "issueDate": "2026-04-02",
            "total": 420.0,
            "lines": [{ "desc": "Water", "amount": 420.0, "$dirty": true }],
            "$uploadProgress": 0.5
        });

        put(&conn, EntityKind::Invoice, input, SyncStatus::Pending).unwrap();
        let doc = get(&conn, EntityKind::Invoice, "inv-1").unwrap().unwrap();

        assert_eq!(
            Value::Object(doc),
            json!({
                "_id": "inv-1",
                "issueDate": "2026-04-02",
                "total": 420.0,
                "lines": [{ "desc": "Water", "amount": 420.0 }],
                "syncStatus": "pending"
            })
        );
    }

    #[test]
    fn test_list_orders_by_sort_field_newest_first() {
        let db = test_db();
        let conn = db.lock().unwrap();
        for (id, date) in [("a", "2026-01-01"), ("b", "2026-03-01"), ("c", "2026-02-01")] {
            put(
                &conn,
                EntityKind::Record,
                json!({ "_id": id, "date": date }),
                SyncStatus::Synced,
            )
            .unwrap();
        }
        put(&conn, EntityKind::Record, json!({ "_id": "undated" }), SyncStatus::Synced).unwrap();

        let ids: Vec<String> = list(&conn, EntityKind::Record)
            .unwrap()
            .iter()
            .map(|d| d["_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c", "a", "undated"]);
    }

    #[test]
    fn test_numeric_epoch_sort_fields_order_chronologically() {
        let db = test_db();
        let conn = db.lock().unwrap();
        for (id, created) in [
            ("2001", json!(999_999_999)),
            ("2023", json!(1_700_000_000)),
            ("2025-ms", json!(1_750_000_000_000_i64)),
            ("2024-iso", json!("2024-05-01T00:00:00.000Z")),
        ] {
            put(
                &conn,
                EntityKind::Customer,
                json!({ "_id": id, "createdAt": created }),
                SyncStatus::Synced,
            )
            .unwrap();
        }

        let docs = list(&conn, EntityKind::Customer).unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d["_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["2025-ms", "2024-iso", "2023", "2001"]);
        assert_eq!(docs[3]["createdAt"], 999_999_999);
    }

    #[test]
    fn test_refresh_keeps_documents_with_numeric_server_ids() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let remote = vec![json!({ "_id": 42, "name": "Numeric" }), json!({ "id": 7 })];

        replace_all_synced(&conn, EntityKind::Customer, remote.clone()).unwrap();
        let counts = replace_all_synced(&conn, EntityKind::Customer, remote).unwrap();

        assert_eq!(counts.upserted, 2);
        assert_eq!(counts.removed, 0);
        let doc = get(&conn, EntityKind::Customer, "42").unwrap().unwrap();
        assert_eq!(doc["name"], "Numeric");
        assert!(doc.get("_placeholder").is_none());
        assert!(get(&conn, EntityKind::Customer, "7").unwrap().is_some());
    }

    #[test]
    fn test_unsanitizable_document_becomes_placeholder_with_snapshot() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let mut deep = json!("x");
        for _ in 0..40 {
            deep = json!({ "n": deep });
        }

        let stored = put(
            &conn,
            EntityKind::Customer,
            json!({ "_id": "cust-1", "tree": deep }),
            SyncStatus::Pending,
        )
        .unwrap();
        assert_eq!(stored.get("_placeholder"), Some(&Value::Bool(true)));
        assert!(stored.get("tree").is_none());

        let snapshot = db::get_setting(&conn, DEBUG_SETTINGS_CATEGORY, LAST_SANITIZE_FAILURE_KEY)
            .expect("snapshot written");
        let snapshot: Value = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(snapshot["id"], "cust-1");
        assert_eq!(snapshot["entity"], "customers");
    }

    #[test]
    fn test_put_without_any_id_is_rejected() {
        let db = test_db();
        let conn = db.lock().unwrap();
        assert!(put(&conn, EntityKind::Wallet, json!([1, 2, 3]), SyncStatus::Pending).is_err());
        assert!(put(&conn, EntityKind::Wallet, json!({ "balance": 3 }), SyncStatus::Pending).is_err());
    }

    #[test]
    fn test_replace_id_moves_row_and_marks_synced() {
        let db = test_db();
        let conn = db.lock().unwrap();
        put(
            &conn,
            EntityKind::Invoice,
            json!({ "_id": "tmp-1", "total": 10 }),
            SyncStatus::Pending,
        )
        .unwrap();
        let server: Document = serde_json::from_value(json!({
            "_id": "66f0c0ffee", "total": 10, "number": "INV-0007"
        }))
        .unwrap();

        let doc = replace_id(
            &conn,
            EntityKind::Invoice,
            "tmp-1",
            "66f0c0ffee",
            Some(&server),
            SyncStatus::Synced,
        )
        .unwrap();

        assert_eq!(doc["_id"], "66f0c0ffee");
        assert_eq!(doc["number"], "INV-0007");
        assert_eq!(doc["syncStatus"], "synced");
        assert!(get(&conn, EntityKind::Invoice, "tmp-1").unwrap().is_none());
        assert_eq!(count(&conn, EntityKind::Invoice).unwrap(), 1);
    }

    #[test]
    fn test_replace_id_keeps_local_edits_while_pending() {
        let db = test_db();
        let conn = db.lock().unwrap();
        put(
            &conn,
            EntityKind::Customer,
            json!({ "_id": "tmp-2", "name": "Edited offline" }),
            SyncStatus::Pending,
        )
        .unwrap();
        let server: Document =
            serde_json::from_value(json!({ "_id": "srv-2", "name": "Original", "code": "C2" }))
                .unwrap();

        let doc = replace_id(
            &conn,
            EntityKind::Customer,
            "tmp-2",
            "srv-2",
            Some(&server),
            SyncStatus::Pending,
        )
        .unwrap();
        assert_eq!(doc["name"], "Edited offline");
        assert_eq!(doc["code"], "C2");
        assert_eq!(doc["_id"], "srv-2");
    }

    #[test]
    fn test_replace_all_synced_keeps_pending_rows() {
        let db = test_db();
        let conn = db.lock().unwrap();
        put(&conn, EntityKind::Payment, json!({ "_id": "p-old" }), SyncStatus::Synced).unwrap();
        put(
            &conn,
            EntityKind::Payment,
            json!({ "_id": "p-local", "amount": 5 }),
            SyncStatus::Pending,
        )
        .unwrap();

        let counts = replace_all_synced(
            &conn,
            EntityKind::Payment,
            vec![
                json!({ "_id": "p-new", "amount": 1 }),
                json!({ "id": "p-alt", "amount": 2 }),
                json!({ "_id": "p-local", "amount": 999 }),
            ],
        )
        .unwrap();

        assert_eq!(
            counts,
            RefreshCounts {
                upserted: 2,
                removed: 1,
                kept_pending: 1
            }
        );
        let local = get(&conn, EntityKind::Payment, "p-local").unwrap().unwrap();
        assert_eq!(local["amount"], 5);
        assert!(get(&conn, EntityKind::Payment, "p-old").unwrap().is_none());
        assert_eq!(get(&conn, EntityKind::Payment, "p-alt").unwrap().unwrap()["_id"], "p-alt");
    }

    #[test]
    fn test_is_empty_and_clear_all() {
        let db = test_db();
        let conn = db.lock().unwrap();
        assert!(is_empty(&conn).unwrap());
        put(&conn, EntityKind::Wallet, json!({ "_id": "w1" }), SyncStatus::Synced).unwrap();
        assert!(!is_empty(&conn).unwrap());
        clear_all(&conn).unwrap();
        assert!(is_empty(&conn).unwrap());
    }
}
