//! Optimistic local writes.
//!
//! Every mutation updates the mirror first (marked `pending`) and appends
//! exactly one sync queue entry, both inside one SQLite transaction, so the
//! UI sees the change immediately and the change survives a restart.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::entities::{EntityKind, MutationAction, SyncStatus};
use crate::error::StoreError;
use crate::mirror;
use crate::queue::{self, NewQueueEntry};
use crate::sanitize::{sanitize_document, Document, SanitizeError};

pub const TEMP_ID_PREFIX: &str = "tmp-";

pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Idempotency key for an uploaded scan, derived from the file bytes so the
/// same upload replayed twice maps to one server record.
pub fn scan_idempotency_key(bytes: &[u8]) -> String {
    format!("scan:{:x}", Sha256::digest(bytes))
}

fn into_object(value: Value) -> Result<Document, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(SanitizeError::NotAnObject.into()),
    }
}

/// Write side of the offline store.
#[derive(Clone)]
pub struct Producer {
    db: Arc<DbState>,
}

impl Producer {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Create a document locally and queue it for the server.
    pub fn create(&self, kind: EntityKind, payload: Value) -> Result<Document, StoreError> {
        self.create_inner(kind, payload, None)
    }

    /// Create with a natural de-dup key. When an entry with the same key is
    /// still queued, the already stored document is returned instead.
    pub fn create_with_idempotency_key(
        &self,
        kind: EntityKind,
        payload: Value,
        key: &str,
    ) -> Result<Document, StoreError> {
        self.create_inner(kind, payload, Some(key))
    }

    fn create_inner(
        &self,
        kind: EntityKind,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> Result<Document, StoreError> {
        let mut doc = sanitize_document(payload)?;
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;

        if let Some(key) = idempotency_key {
            if let Some(existing) = queue::find_by_idempotency_key(&tx, key)? {
                if let Some(stored) = mirror::get(&tx, existing.entity, &existing.entity_id)? {
                    info!(entity = %kind, key, queue_id = existing.id, "Create already queued; reusing");
                    return Ok(stored);
                }
                // The row was deleted locally while its create is still queued.
                return Err(StoreError::DuplicateKey {
                    key: key.to_string(),
                    kind: existing.entity.as_str().into(),
                    id: existing.entity_id,
                });
            }
        }

        let id = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => new_temp_id(),
        };
        let now = queue::timestamp(Utc::now());
        doc.insert("_id".into(), Value::String(id.clone()));
        doc.entry("createdAt")
            .or_insert_with(|| Value::String(now.clone()));
        doc.insert("updatedAt".into(), Value::String(now));

        let mut remote_payload = doc.clone();
        remote_payload.remove("_id");

        let stored = mirror::put(&tx, kind, Value::Object(doc), SyncStatus::Pending)?;
        queue::enqueue(
            &tx,
            &NewQueueEntry {
                entity: kind,
                entity_id: id.clone(),
                action: MutationAction::Create,
                payload: Value::Object(remote_payload),
                temp_id: Some(id),
                idempotency_key: idempotency_key.map(str::to_string),
            },
        )?;
        tx.commit()?;
        Ok(stored)
    }

    /// Shallow-merge `patch` into an existing document and queue the patch.
    pub fn update(&self, kind: EntityKind, id: &str, patch: Value) -> Result<Document, StoreError> {
        let mut patch = into_object(patch)?;
        patch.remove("_id");
        patch.remove("syncStatus");
        let mut patch = sanitize_document(Value::Object(patch))?;
        patch.insert(
            "updatedAt".into(),
            Value::String(queue::timestamp(Utc::now())),
        );

        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        let mut doc = mirror::get(&tx, kind, id)?.ok_or_else(|| StoreError::NotFound {
            kind: kind.as_str().into(),
            id: id.into(),
        })?;
        doc.remove("syncStatus");
        doc.extend(patch.clone());

        let stored = mirror::put(&tx, kind, Value::Object(doc), SyncStatus::Pending)?;
        queue::enqueue(
            &tx,
            &NewQueueEntry {
                entity: kind,
                entity_id: id.to_string(),
                action: MutationAction::Update,
                payload: Value::Object(patch),
                temp_id: is_temp_id(id).then(|| id.to_string()),
                idempotency_key: None,
            },
        )?;
        tx.commit()?;
        Ok(stored)
    }

    /// Remove a document locally and queue the remote delete.
    pub fn delete(&self, kind: EntityKind, id: &str) -> Result<(), StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        if !mirror::remove(&tx, kind, id)? {
            return Err(StoreError::NotFound {
                kind: kind.as_str().into(),
                id: id.into(),
            });
        }
        queue::enqueue(
            &tx,
            &NewQueueEntry {
                entity: kind,
                entity_id: id.to_string(),
                action: MutationAction::Delete,
                payload: Value::Null,
                temp_id: is_temp_id(id).then(|| id.to_string()),
                idempotency_key: None,
            },
        )?;
        tx.commit()?;
        Ok(())
    }
}
