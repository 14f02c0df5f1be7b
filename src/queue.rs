//! Durable sync queue.
//!
//! Every local mutation appends one row describing the remote call to make.
//! Only the sync engine mutates or deletes rows; the producer only appends.
//! Rows are removed on confirmed success and kept with `failed = 1` after
//! the retry ceiling so the user can inspect, retry or clear them.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::entities::{EntityKind, MutationAction};
use crate::error::StoreError;
use crate::retry::RetryPolicy;

const ENTRY_COLUMNS: &str = "id, entity, entity_id, action, payload, temp_id, idempotency_key,
     created_at, COALESCE(attempts, 0), next_attempt_at, last_error, failed";

/// A queued remote mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: i64,
    pub entity: EntityKind,
    pub entity_id: String,
    pub action: MutationAction,
    pub payload: Value,
    pub temp_id: Option<String>,
    pub idempotency_key: String,
    pub created_at: String,
    pub attempts: i64,
    pub next_attempt_at: Option<String>,
    pub last_error: Option<String>,
    pub failed: bool,
}

#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub entity: EntityKind,
    pub entity_id: String,
    pub action: MutationAction,
    pub payload: Value,
    pub temp_id: Option<String>,
    /// Natural de-dup key; a random per-mutation key is generated when absent.
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    pub attempts: i64,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: i64,
    pub failed: i64,
    pub oldest_pending_at: Option<String>,
}

pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

type RawEntry = (
    i64,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    i64,
);

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn into_entry(raw: RawEntry) -> Result<QueueEntry, StoreError> {
    let (
        id,
        entity,
        entity_id,
        action,
        payload,
        temp_id,
        idempotency_key,
        created_at,
        attempts,
        next_attempt_at,
        last_error,
        failed,
    ) = raw;
    Ok(QueueEntry {
        id,
        entity: EntityKind::parse(&entity)?,
        entity_id,
        action: MutationAction::parse(&action)?,
        payload: serde_json::from_str(&payload)?,
        temp_id,
        idempotency_key,
        created_at,
        attempts,
        next_attempt_at,
        last_error,
        failed: failed != 0,
    })
}

fn query_entries(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<QueueEntry>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ENTRY_COLUMNS} FROM sync_queue {filter}"
    ))?;
    let raws = stmt
        .query_map(params, read_raw)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(into_entry).collect()
}

/// Append a queue entry. Returns the new row id.
pub fn enqueue(conn: &Connection, entry: &NewQueueEntry) -> Result<i64, StoreError> {
    let key = entry.idempotency_key.clone().unwrap_or_else(|| {
        format!(
            "{}:{}:{}:{}",
            entry.entity,
            entry.entity_id,
            entry.action.as_str(),
            Uuid::new_v4()
        )
    });
    let now = timestamp(Utc::now());
    conn.execute(
        "INSERT INTO sync_queue (
             entity, entity_id, action, payload, temp_id, idempotency_key,
             created_at, updated_at, attempts, failed
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, 0, 0)",
        params![
            entry.entity.as_str(),
            entry.entity_id,
            entry.action.as_str(),
            serde_json::to_string(&entry.payload)?,
            entry.temp_id,
            key,
            now,
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(
        queue_id = id,
        entity = %entry.entity,
        entity_id = %entry.entity_id,
        action = entry.action.as_str(),
        "Enqueued sync mutation"
    );
    Ok(id)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<QueueEntry>, StoreError> {
    conn.query_row(
        &format!("SELECT {ENTRY_COLUMNS} FROM sync_queue WHERE id = ?1"),
        params![id],
        read_raw,
    )
    .optional()?
    .map(into_entry)
    .transpose()
}

pub fn find_by_idempotency_key(
    conn: &Connection,
    key: &str,
) -> Result<Option<QueueEntry>, StoreError> {
    Ok(query_entries(conn, "WHERE idempotency_key = ?1", params![key])?
        .into_iter()
        .next())
}

/// Non-failed entries that are due at `now`, in enqueue order.
///
/// An entry stays out while an earlier entry for the same entity is flagged
/// failed or still backing off, so a later mutation never overtakes an
/// earlier one across passes.
pub fn due_entries(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<QueueEntry>, StoreError> {
    query_entries(
        conn,
        "WHERE failed = 0
           AND (next_attempt_at IS NULL OR julianday(next_attempt_at) <= julianday(?1))
           AND NOT EXISTS (
               SELECT 1 FROM sync_queue earlier
               WHERE earlier.entity = sync_queue.entity
                 AND earlier.entity_id = sync_queue.entity_id
                 AND earlier.id < sync_queue.id
                 AND (earlier.failed = 1
                      OR julianday(earlier.next_attempt_at) > julianday(?1))
           )
         ORDER BY id ASC
         LIMIT ?2",
        params![timestamp(now), limit as i64],
    )
}

/// Every entry, in enqueue order.
pub fn list(conn: &Connection) -> Result<Vec<QueueEntry>, StoreError> {
    query_entries(conn, "ORDER BY id ASC", [])
}

pub fn list_failed(conn: &Connection) -> Result<Vec<QueueEntry>, StoreError> {
    query_entries(conn, "WHERE failed = 1 ORDER BY id ASC", [])
}

/// Whether any entry other than `except_id` still targets this entity.
pub fn has_other_entries_for(
    conn: &Connection,
    entity: EntityKind,
    entity_id: &str,
    except_id: i64,
) -> Result<bool, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE entity = ?1 AND entity_id = ?2 AND id != ?3",
        params![entity.as_str(), entity_id, except_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Whether an unsent create still owns this (temporary) id.
pub fn has_outstanding_create(
    conn: &Connection,
    entity: EntityKind,
    entity_id: &str,
) -> Result<bool, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue
         WHERE entity = ?1 AND entity_id = ?2 AND action = 'create'",
        params![entity.as_str(), entity_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Whether an unsent create of any kind still owns this id. Used for
/// foreign keys inside payloads, which do not name their entity kind.
pub fn has_outstanding_create_for_id(conn: &Connection, entity_id: &str) -> Result<bool, StoreError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE entity_id = ?1 AND action = 'create'",
        params![entity_id],
        |row| row.get(0),
    )?;
    Ok(n > 0)
}

/// Remove an entry after the server confirmed the mutation.
pub fn record_success(conn: &Connection, id: i64) -> Result<(), StoreError> {
    conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])?;
    Ok(())
}

/// Record a failed attempt: `attempts` goes up by one, the error is kept,
/// and either the next attempt is scheduled or the entry is flagged failed.
pub fn record_failure(
    conn: &Connection,
    id: i64,
    error: &str,
    policy: &RetryPolicy,
    retry_after_secs: Option<u64>,
    now: DateTime<Utc>,
) -> Result<FailureOutcome, StoreError> {
    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(attempts, 0) FROM sync_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound {
            kind: "sync_queue".into(),
            id: id.to_string(),
        })?;

    let attempts = current + 1;
    let failed = policy.is_exhausted(attempts);
    let next_attempt_at = if failed {
        None
    } else {
        Some(timestamp(policy.next_attempt_at(
            now,
            attempts,
            id,
            retry_after_secs,
        )))
    };

    conn.execute(
        "UPDATE sync_queue
         SET attempts = ?1,
             failed = ?2,
             next_attempt_at = ?3,
             last_error = ?4,
             updated_at = ?5
         WHERE id = ?6",
        params![attempts, failed as i64, next_attempt_at, error, timestamp(now), id],
    )?;

    if failed {
        warn!(queue_id = id, attempts, error, "Sync entry exhausted retries; marked failed");
    } else {
        debug!(queue_id = id, attempts, next_attempt_at = ?next_attempt_at, "Sync entry scheduled for retry");
    }
    Ok(FailureOutcome { attempts, failed })
}

/// Flag an entry failed right away. Used for rejections that no retry can
/// fix (validation, quota, permission).
pub fn mark_failed(
    conn: &Connection,
    id: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<FailureOutcome, StoreError> {
    let n = conn.execute(
        "UPDATE sync_queue
         SET attempts = COALESCE(attempts, 0) + 1,
             failed = 1,
             next_attempt_at = NULL,
             last_error = ?1,
             updated_at = ?2
         WHERE id = ?3",
        params![error, timestamp(now), id],
    )?;
    if n == 0 {
        return Err(StoreError::NotFound {
            kind: "sync_queue".into(),
            id: id.to_string(),
        });
    }
    let attempts: i64 = conn.query_row(
        "SELECT attempts FROM sync_queue WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    warn!(queue_id = id, attempts, error, "Sync entry rejected by server; marked failed");
    Ok(FailureOutcome {
        attempts,
        failed: true,
    })
}

/// Put failed entries back in line (one entry, or all when `id` is None).
/// `attempts` is left as is.
pub fn retry_failed(
    conn: &Connection,
    id: Option<i64>,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let now = timestamp(now);
    let n = match id {
        Some(id) => conn.execute(
            "UPDATE sync_queue SET failed = 0, next_attempt_at = ?1, updated_at = ?1
             WHERE failed = 1 AND id = ?2",
            params![now, id],
        )?,
        None => conn.execute(
            "UPDATE sync_queue SET failed = 0, next_attempt_at = ?1, updated_at = ?1
             WHERE failed = 1",
            params![now],
        )?,
    };
    Ok(n)
}

/// Delete only the entries flagged failed.
pub fn clear_failed(conn: &Connection) -> Result<usize, StoreError> {
    Ok(conn.execute("DELETE FROM sync_queue WHERE failed = 1", [])?)
}

pub fn clear_all(conn: &Connection) -> Result<usize, StoreError> {
    Ok(conn.execute("DELETE FROM sync_queue", [])?)
}

/// Point later entries for a temp entity at its server id.
pub fn rewrite_entity_id(
    conn: &Connection,
    entity: EntityKind,
    temp_id: &str,
    server_id: &str,
) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "UPDATE sync_queue SET entity_id = ?1 WHERE entity = ?2 AND entity_id = ?3",
        params![server_id, entity.as_str(), temp_id],
    )?)
}

/// Replace string values equal to `temp_id` inside queued payloads
/// (foreign keys such as an invoice's `customerId`).
pub fn rewrite_payload_references(
    conn: &Connection,
    temp_id: &str,
    server_id: &str,
) -> Result<usize, StoreError> {
    let pattern = format!("%{temp_id}%");
    let mut stmt = conn.prepare("SELECT id, payload FROM sync_queue WHERE payload LIKE ?1")?;
    let rows = stmt
        .query_map(params![pattern], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut rewritten = 0;
    for (id, payload) in rows {
        let mut value: Value = serde_json::from_str(&payload)?;
        if crate::replace_string_values(&mut value, temp_id, server_id) {
            conn.execute(
                "UPDATE sync_queue SET payload = ?1 WHERE id = ?2",
                params![serde_json::to_string(&value)?, id],
            )?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

pub fn stats(conn: &Connection) -> Result<QueueStats, StoreError> {
    let (pending, failed, oldest_pending_at): (i64, i64, Option<String>) = conn.query_row(
        "SELECT
             COALESCE(SUM(CASE WHEN failed = 0 THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN failed = 1 THEN 1 ELSE 0 END), 0),
             MIN(CASE WHEN failed = 0 THEN created_at END)
         FROM sync_queue",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(QueueStats {
        pending,
        failed,
        oldest_pending_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{open_in_memory, DbState};
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn test_db() -> DbState {
        open_in_memory().expect("in-memory db")
    }

    fn new_entry(entity_id: &str, action: MutationAction) -> NewQueueEntry {
        NewQueueEntry {
            entity: EntityKind::Invoice,
            entity_id: entity_id.to_string(),
            action,
            payload: json!({ "_id": entity_id, "total": 1 }),
            temp_id: None,
            idempotency_key: None,
        }
    }

    #[test]
    fn test_enqueue_and_due_entries_in_order() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let a = enqueue(&conn, &new_entry("a", MutationAction::Create)).unwrap();
        let b = enqueue(&conn, &new_entry("b", MutationAction::Update)).unwrap();
        let c = enqueue(&conn, &new_entry("c", MutationAction::Delete)).unwrap();

        let due = due_entries(&conn, Utc::now(), 10).unwrap();
        assert_eq!(due.iter().map(|e| e.id).collect::<Vec<_>>(), vec![a, b, c]);
        assert_eq!(due[0].attempts, 0);
        assert!(!due[0].failed);
        assert_eq!(due[1].action, MutationAction::Update);

        assert_eq!(due_entries(&conn, Utc::now(), 2).unwrap().len(), 2);
    }

    #[test]
    fn test_attempts_only_increase_across_failures() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let policy = RetryPolicy {
            max_attempts: 10,
            ..RetryPolicy::default()
        };
        let id = enqueue(&conn, &new_entry("x", MutationAction::Update)).unwrap();

        let mut last = 0;
        for round in 0..4 {
            let now = Utc::now() + ChronoDuration::hours(round);
            let outcome = record_failure(&conn, id, "HTTP 503", &policy, None, now).unwrap();
            assert!(outcome.attempts > last);
            last = outcome.attempts;
        }

        let entry = get(&conn, id).unwrap().unwrap();
        assert_eq!(entry.attempts, 4);
        assert_eq!(entry.last_error.as_deref(), Some("HTTP 503"));
        assert!(!entry.failed);
        assert!(entry.next_attempt_at.is_some());
    }

    #[test]
    fn test_failed_entry_is_not_due_until_backoff_elapses() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let id = enqueue(&conn, &new_entry("x", MutationAction::Update)).unwrap();
        let now = Utc::now();
        record_failure(&conn, id, "timeout", &RetryPolicy::default(), None, now).unwrap();

        assert!(due_entries(&conn, now, 10).unwrap().is_empty());
        let later = now + ChronoDuration::seconds(6);
        assert_eq!(due_entries(&conn, later, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_retry_ceiling_marks_failed_and_keeps_entry() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let id = enqueue(&conn, &new_entry("x", MutationAction::Update)).unwrap();
        let now = Utc::now();

        assert!(!record_failure(&conn, id, "e1", &policy, None, now).unwrap().failed);
        let outcome = record_failure(&conn, id, "e2", &policy, None, now).unwrap();
        assert!(outcome.failed);

        let entry = get(&conn, id).unwrap().unwrap();
        assert!(entry.failed);
        assert_eq!(entry.next_attempt_at, None);
        assert_eq!(entry.last_error.as_deref(), Some("e2"));
        assert!(due_entries(&conn, now + ChronoDuration::days(1), 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_retry_failed_keeps_attempts() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let id = enqueue(&conn, &new_entry("x", MutationAction::Update)).unwrap();
        let now = Utc::now();
        record_failure(&conn, id, "boom", &policy, None, now).unwrap();

        assert_eq!(retry_failed(&conn, Some(id), now).unwrap(), 1);
        let entry = get(&conn, id).unwrap().unwrap();
        assert!(!entry.failed);
        assert_eq!(entry.attempts, 1);
        assert_eq!(due_entries(&conn, now, 10).unwrap().len(), 1);

        let outcome = record_failure(&conn, id, "boom again", &policy, None, now).unwrap();
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.failed);
    }

    #[test]
    fn test_mark_failed_counts_the_attempt() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let id = enqueue(&conn, &new_entry("x", MutationAction::Create)).unwrap();
        let outcome = mark_failed(&conn, id, "amount is required (HTTP 422)", Utc::now()).unwrap();
        assert_eq!(outcome, FailureOutcome { attempts: 1, failed: true });
        assert_eq!(list_failed(&conn).unwrap().len(), 1);
        assert!(has_outstanding_create_for_id(&conn, "x").unwrap());
        assert!(!has_outstanding_create_for_id(&conn, "y").unwrap());
        assert!(mark_failed(&conn, 999, "gone", Utc::now()).is_err());
    }

    #[test]
    fn test_clear_failed_leaves_healthy_entries() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let policy = RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        };
        let bad = enqueue(&conn, &new_entry("bad", MutationAction::Update)).unwrap();
        let good = enqueue(&conn, &new_entry("good", MutationAction::Update)).unwrap();
        record_failure(&conn, bad, "validation failed", &policy, None, Utc::now()).unwrap();

        assert_eq!(clear_failed(&conn).unwrap(), 1);
        let remaining: Vec<i64> = list(&conn).unwrap().iter().map(|e| e.id).collect();
        assert_eq!(remaining, vec![good]);
    }

    #[test]
    fn test_rewrite_entity_id_and_payload_references() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let mut update = new_entry("tmp-c1", MutationAction::Update);
        update.entity = EntityKind::Customer;
        let update_id = enqueue(&conn, &update).unwrap();
        let invoice_id = enqueue(
            &conn,
            &NewQueueEntry {
                entity: EntityKind::Invoice,
                entity_id: "tmp-i1".into(),
                action: MutationAction::Create,
                payload: json!({ "_id": "tmp-i1", "customerId": "tmp-c1", "lines": [{"ref": "tmp-c1"}] }),
                temp_id: Some("tmp-i1".into()),
                idempotency_key: None,
            },
        )
        .unwrap();

        assert_eq!(
            rewrite_entity_id(&conn, EntityKind::Customer, "tmp-c1", "srv-c1").unwrap(),
            1
        );
        assert_eq!(rewrite_payload_references(&conn, "tmp-c1", "srv-c1").unwrap(), 2);

        assert_eq!(get(&conn, update_id).unwrap().unwrap().entity_id, "srv-c1");
        let invoice = get(&conn, invoice_id).unwrap().unwrap();
        assert_eq!(invoice.payload["customerId"], "srv-c1");
        assert_eq!(invoice.payload["lines"][0]["ref"], "srv-c1");
        assert_eq!(invoice.entity_id, "tmp-i1");
    }

    #[test]
    fn test_stats_and_idempotency_lookup() {
        let db = test_db();
        let conn = db.lock().unwrap();
        let mut keyed = new_entry("r1", MutationAction::Create);
        keyed.idempotency_key = Some("scan:abc".into());
        enqueue(&conn, &keyed).unwrap();
        enqueue(&conn, &new_entry("r2", MutationAction::Create)).unwrap();

        assert!(enqueue(&conn, &keyed).is_err());
        let found = find_by_idempotency_key(&conn, "scan:abc").unwrap().unwrap();
        assert_eq!(found.entity_id, "r1");

        let stats = stats(&conn).unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.failed, 0);
        assert!(stats.oldest_pending_at.is_some());
    }
}
