//! Sync engine: drains the durable queue against the remote API.
//!
//! Entries are sent one at a time in enqueue order. A successful create
//! rewrites the temp id everywhere it is still referenced; failures go
//! through the retry policy and hold back later entries for the same entity
//! for the rest of the pass. Delivery is at-least-once: an acknowledgement
//! lost on the wire replays the entry, and only creates carrying a natural
//! idempotency key are de-duplicated by the server.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{self, ApiError, RemoteApi};
use crate::config::SyncConfig;
use crate::db::DbState;
use crate::entities::{EntityKind, MutationAction, SyncStatus};
use crate::error::{StoreError, SyncError};
use crate::mirror;
use crate::producer::is_temp_id;
use crate::queue::{self, QueueEntry, QueueStats};
use crate::resync::{self, ResyncReport};
use crate::sanitize::{sanitize_document, Document};

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Runtime state of the sync engine, shared with the host.
#[derive(Debug, Default)]
pub struct SyncState {
    pub is_running: AtomicBool,
    pub online: AtomicBool,
    pub last_sync: Mutex<Option<String>>,
    pub last_pull: Mutex<Option<String>>,
    pub last_error: Mutex<Option<String>>,
    wake: Notify,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to run a pass now instead of waiting for the next tick.
    /// Call this on user actions and connectivity events.
    pub fn request_sync(&self) {
        self.wake.notify_one();
    }

    fn set_last_sync(&self) {
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
    }

    fn set_last_pull(&self) {
        if let Ok(mut guard) = self.last_pull.lock() {
            *guard = Some(Utc::now().to_rfc3339());
        }
    }

    fn set_last_error(&self, error: Option<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = error;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub pending: i64,
    pub failed: i64,
    pub oldest_pending_at: Option<String>,
    pub last_sync: Option<String>,
    pub last_pull: Option<String>,
    pub online: bool,
    pub last_error: Option<String>,
    pub is_running: bool,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Entries confirmed by the server and removed from the queue.
    pub synced: usize,
    /// Entries flagged failed during this pass.
    pub failed: usize,
    /// Entries that failed and were rescheduled.
    pub deferred: usize,
    /// Entries held back to keep per-entity ordering.
    pub skipped: usize,
}

enum Pushed {
    Created { server_id: String, doc: Value },
    Updated(Option<Value>),
    Deleted,
}

/// Server copy keyed by the id the engine already resolved, so numeric or
/// `id`-only server ids still pass sanitization.
fn server_document(mut doc: Value, id: &str) -> Option<Document> {
    if let Value::Object(map) = &mut doc {
        map.insert("_id".into(), Value::String(id.to_string()));
    }
    sanitize_document(doc).ok()
}

fn temp_references(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if is_temp_id(s) => out.push(s.clone()),
        Value::Array(items) => items.iter().for_each(|v| temp_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| temp_references(v, out)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine<R> {
    db: Arc<DbState>,
    remote: Arc<R>,
    config: SyncConfig,
    state: Arc<SyncState>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl<R: RemoteApi> SyncEngine<R> {
    pub fn new(db: Arc<DbState>, remote: Arc<R>, config: SyncConfig, state: Arc<SyncState>) -> Self {
        Self {
            db,
            remote,
            config: config.normalized(),
            state,
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> &Arc<SyncState> {
        &self.state
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Send every due entry (up to the batch size) to the server.
    ///
    /// A 401 aborts the pass without consuming an attempt. A connectivity
    /// error ends the pass after recording the attempt for the entry that
    /// hit it.
    pub async fn drain_queue(&self) -> Result<DrainReport, SyncError> {
        let _drain = self.drain_lock.lock().await;
        let mut report = DrainReport::default();
        let mut blocked: HashSet<(EntityKind, String)> = HashSet::new();
        let mut last_failure: Option<String> = None;

        let due = {
            let conn = self.db.lock()?;
            queue::due_entries(&conn, Utc::now(), self.config.batch_size)?
        };
        if due.is_empty() {
            return Ok(report);
        }
        debug!(count = due.len(), "Draining sync queue");

        for due_entry in due {
            // Re-read: an earlier create in this pass may have rewritten
            // the entity id or payload references.
            let entry = {
                let conn = self.db.lock()?;
                match queue::get(&conn, due_entry.id)? {
                    Some(entry) => entry,
                    None => continue,
                }
            };

            if blocked.contains(&(entry.entity, entry.entity_id.clone()))
                || self.waits_on_create(&entry)?
            {
                debug!(queue_id = entry.id, entity = %entry.entity, entity_id = %entry.entity_id, "Holding back entry");
                blocked.insert((entry.entity, entry.entity_id.clone()));
                report.skipped += 1;
                continue;
            }

            match self.push(&entry).await {
                Ok(pushed) => {
                    self.state.online.store(true, Ordering::SeqCst);
                    self.apply_success(&entry, pushed)?;
                    report.synced += 1;
                }
                Err(ApiError::NotFound) if entry.action == MutationAction::Delete => {
                    debug!(queue_id = entry.id, "Delete target already gone on server");
                    let conn = self.db.lock()?;
                    queue::record_success(&conn, entry.id)?;
                    report.synced += 1;
                }
                Err(ApiError::Unauthorized) => {
                    warn!(queue_id = entry.id, "Session rejected by server; pausing sync");
                    self.state
                        .set_last_error(Some(ApiError::Unauthorized.to_string()));
                    return Err(SyncError::SessionExpired);
                }
                Err(err) => {
                    let message = err.to_string();
                    let outcome = {
                        let conn = self.db.lock()?;
                        if err.is_transient() {
                            queue::record_failure(
                                &conn,
                                entry.id,
                                &message,
                                &self.config.retry,
                                err.retry_after_secs(),
                                Utc::now(),
                            )?
                        } else {
                            queue::mark_failed(&conn, entry.id, &message, Utc::now())?
                        }
                    };
                    warn!(
                        queue_id = entry.id,
                        entity = %entry.entity,
                        action = entry.action.as_str(),
                        attempts = outcome.attempts,
                        error = %message,
                        "Sync entry failed"
                    );
                    if outcome.failed {
                        report.failed += 1;
                    } else {
                        report.deferred += 1;
                    }
                    blocked.insert((entry.entity, entry.entity_id.clone()));
                    last_failure = Some(message);

                    if matches!(err, ApiError::Network(_) | ApiError::Timeout(_)) {
                        self.state.online.store(false, Ordering::SeqCst);
                        info!("Lost connectivity during drain; stopping pass");
                        break;
                    }
                }
            }
        }

        self.state.set_last_error(last_failure);
        Ok(report)
    }

    /// True when the entry targets an id whose create has not reached the
    /// server yet, or references a temp id in the same state.
    fn waits_on_create(&self, entry: &QueueEntry) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        if entry.action != MutationAction::Create
            && queue::has_outstanding_create(&conn, entry.entity, &entry.entity_id)?
        {
            return Ok(true);
        }
        let mut refs = Vec::new();
        temp_references(&entry.payload, &mut refs);
        for id in refs.iter().filter(|id| **id != entry.entity_id) {
            if queue::has_outstanding_create_for_id(&conn, id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn push(&self, entry: &QueueEntry) -> Result<Pushed, ApiError> {
        match entry.action {
            MutationAction::Create => {
                let doc = self
                    .remote
                    .create(entry.entity, &entry.payload, &entry.idempotency_key)
                    .await
                    .map(api::unwrap_document)?;
                let server_id = api::server_id(&doc).ok_or_else(|| {
                    ApiError::InvalidResponse("create response carries no id".into())
                })?;
                Ok(Pushed::Created { server_id, doc })
            }
            MutationAction::Update => self
                .remote
                .update(entry.entity, &entry.entity_id, &entry.payload)
                .await
                .map(Pushed::Updated),
            MutationAction::Delete => self
                .remote
                .delete(entry.entity, &entry.entity_id)
                .await
                .map(|_| Pushed::Deleted),
        }
    }

    fn apply_success(&self, entry: &QueueEntry, pushed: Pushed) -> Result<(), StoreError> {
        let kind = entry.entity;
        let mut conn = self.db.lock()?;
        let tx = conn.transaction()?;
        queue::record_success(&tx, entry.id)?;

        match pushed {
            Pushed::Created { server_id, doc } => {
                let temp_id = entry.temp_id.as_deref().unwrap_or(&entry.entity_id);
                if temp_id != server_id {
                    queue::rewrite_entity_id(&tx, kind, temp_id, &server_id)?;
                    queue::rewrite_payload_references(&tx, temp_id, &server_id)?;
                }
                // A row deleted locally in the meantime stays deleted; its
                // queued delete now targets the server id.
                if mirror::get(&tx, kind, temp_id)?.is_some() {
                    let status = if queue::has_other_entries_for(&tx, kind, &server_id, entry.id)? {
                        SyncStatus::Pending
                    } else {
                        SyncStatus::Synced
                    };
                    let server_doc = server_document(doc, &server_id);
                    mirror::replace_id(&tx, kind, temp_id, &server_id, server_doc.as_ref(), status)?;
                }
                info!(entity = %kind, temp_id, server_id = %server_id, "Created on server");
            }
            Pushed::Updated(doc) => {
                if !queue::has_other_entries_for(&tx, kind, &entry.entity_id, entry.id)? {
                    let server_doc = doc.and_then(|d| server_document(d, &entry.entity_id));
                    match (mirror::get(&tx, kind, &entry.entity_id)?, server_doc) {
                        (Some(mut local), Some(server)) => {
                            local.remove("syncStatus");
                            local.extend(server);
                            local.insert("_id".into(), Value::String(entry.entity_id.clone()));
                            mirror::put(&tx, kind, Value::Object(local), SyncStatus::Synced)?;
                        }
                        _ => {
                            mirror::set_sync_status(&tx, kind, &entry.entity_id, SyncStatus::Synced)?;
                        }
                    }
                }
            }
            Pushed::Deleted => {}
        }

        tx.commit()?;
        Ok(())
    }

    /// Run a pass now and record the sync time.
    pub async fn force_sync(&self) -> Result<DrainReport, SyncError> {
        let report = self.drain_queue().await?;
        if report.synced > 0 || report.failed > 0 || report.deferred > 0 {
            info!(
                synced = report.synced,
                failed = report.failed,
                deferred = report.deferred,
                skipped = report.skipped,
                "Sync pass complete"
            );
        }
        self.state.set_last_sync();
        Ok(report)
    }

    /// Refresh every mirror table from the server. Holds the drain lock so
    /// a pull never interleaves with queue processing.
    pub async fn pull_remote(&self) -> Result<ResyncReport, SyncError> {
        let _drain = self.drain_lock.lock().await;
        let report = resync::pull_all(self.remote.as_ref(), &self.db, &EntityKind::ALL).await?;
        self.note_pull(&report);
        Ok(report)
    }

    /// Same as [`SyncEngine::pull_remote`], but only when the mirror is empty.
    pub async fn pull_if_empty(&self) -> Result<Option<ResyncReport>, SyncError> {
        let _drain = self.drain_lock.lock().await;
        let report = resync::resync_if_empty(self.remote.as_ref(), &self.db).await?;
        if let Some(report) = &report {
            self.note_pull(report);
        }
        Ok(report)
    }

    fn note_pull(&self, report: &ResyncReport) {
        if report.is_complete() {
            self.state.set_last_pull();
        } else {
            let failed: Vec<&str> = report.errors.keys().map(String::as_str).collect();
            warn!(collections = ?failed, "Remote refresh incomplete");
        }
    }

    pub fn status(&self) -> Result<SyncStatusSnapshot, StoreError> {
        let QueueStats {
            pending,
            failed,
            oldest_pending_at,
        } = {
            let conn = self.db.lock()?;
            queue::stats(&conn)?
        };
        Ok(SyncStatusSnapshot {
            pending,
            failed,
            oldest_pending_at,
            last_sync: self.state.last_sync.lock().ok().and_then(|g| g.clone()),
            last_pull: self.state.last_pull.lock().ok().and_then(|g| g.clone()),
            online: self.state.online.load(Ordering::SeqCst),
            last_error: self.state.last_error.lock().ok().and_then(|g| g.clone()),
            is_running: self.state.is_running.load(Ordering::SeqCst),
        })
    }

    /// User action: put failed entries back in line and wake the loop.
    pub fn retry_failed(&self, id: Option<i64>) -> Result<usize, StoreError> {
        let n = {
            let conn = self.db.lock()?;
            queue::retry_failed(&conn, id, Utc::now())?
        };
        info!(count = n, "Re-queued failed sync entries");
        self.state.request_sync();
        Ok(n)
    }

    /// User action: drop entries flagged failed. Pending ones are kept.
    pub fn clear_failed(&self) -> Result<usize, StoreError> {
        let conn = self.db.lock()?;
        let n = queue::clear_failed(&conn)?;
        info!(count = n, "Cleared failed sync entries");
        Ok(n)
    }

    pub fn queue_entries(&self) -> Result<Vec<QueueEntry>, StoreError> {
        let conn = self.db.lock()?;
        queue::list(&conn)
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background sync loop.
///
/// Each tick (every configured interval, or earlier on
/// [`SyncState::request_sync`]) checks connectivity and drains the queue
/// when online. After a clean drain it refreshes the mirror from the server
/// on the first online tick, after coming back online, once the pull
/// interval has passed, or whenever the mirror is empty. The loop ends on
/// cancellation or when the session expires.
pub fn start_sync_loop<R>(engine: Arc<SyncEngine<R>>, cancel: CancellationToken) -> JoinHandle<()>
where
    R: RemoteApi + 'static,
{
    let state = engine.state.clone();
    let interval = engine.config.interval();
    let pull_interval = engine.config.pull_interval();
    state.is_running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", interval.as_secs());
        let mut previous_online: Option<bool> = None;
        let mut last_pull: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
                _ = state.wake.notified() => debug!("Sync requested"),
            }

            let online = engine.remote.health().await.is_ok();
            state.online.store(online, Ordering::SeqCst);
            if !online {
                if previous_online != Some(false) {
                    info!("Network offline; deferring remote sync and keeping queue pending");
                }
                previous_online = Some(false);
                continue;
            }
            if previous_online == Some(false) {
                info!("Network restored; resuming queued sync");
            }
            let came_online = previous_online != Some(true);
            previous_online = Some(true);

            match engine.force_sync().await {
                Ok(_) => {}
                Err(SyncError::SessionExpired) => {
                    warn!("Sync loop stopped: session expired, sign in again to resume");
                    break;
                }
                Err(e) => {
                    warn!("Sync pass failed: {e}");
                    continue;
                }
            }

            let pull_due = came_online
                || last_pull.map_or(true, |at: tokio::time::Instant| at.elapsed() >= pull_interval);
            let pulled = if pull_due {
                engine.pull_remote().await.map(Some)
            } else {
                engine.pull_if_empty().await
            };
            match pulled {
                Ok(Some(report)) => {
                    debug!(collections = report.refreshed.len(), "Mirror refreshed from server");
                    if report.is_complete() {
                        last_pull = Some(tokio::time::Instant::now());
                    }
                }
                Ok(None) => {}
                Err(SyncError::SessionExpired) => {
                    warn!("Sync loop stopped: session expired, sign in again to resume");
                    break;
                }
                Err(e) => warn!("Remote refresh failed: {e}"),
            }
        }

        state.is_running.store(false, Ordering::SeqCst);
        info!("Sync loop stopped");
    })
}
