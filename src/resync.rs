//! Full resync from the server and the account-switch guard.
//!
//! The mirror belongs to one signed-in user, recorded in `local_settings`.
//! Signing in as someone else never silently mixes data: the host must
//! choose to discard local state or to flush the queue first.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{info, warn};

use crate::api::{ApiError, RemoteApi};
use crate::db::{self, DbState};
use crate::entities::{EntityKind, MutationAction};
use crate::error::{StoreError, SyncError};
use crate::mirror::{self, RefreshCounts};
use crate::queue;
use crate::sanitize::salvage_id;
use crate::sync::SyncEngine;

pub const ACCOUNT_SETTINGS_CATEGORY: &str = "account";
const OWNER_KEY: &str = "owner_user_id";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResyncReport {
    /// Per collection (wire name), what the refresh changed.
    pub refreshed: BTreeMap<String, RefreshCounts>,
    /// Per collection, why it could not be fetched.
    pub errors: BTreeMap<String, String>,
}

impl ResyncReport {
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AccountCheck {
    FirstSignIn,
    SameUser,
    #[serde(rename_all = "camelCase")]
    DifferentUser {
        previous_user_id: String,
        pending: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountSwitch {
    /// Drop local mirror and queue, unsynced changes included.
    DiscardLocal,
    /// Drain the queue with the previous session, then wipe. Refuses to
    /// wipe while anything is left in the queue.
    SyncPendingFirst,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    /// Local data belongs to this user and was refreshed from the server.
    Ready { resync: ResyncReport },
    /// Local data belongs to another user; the host must pick an
    /// [`AccountSwitch`].
    NeedsDecision(AccountCheck),
}

/// Refresh each collection from the server. A failing collection is
/// recorded in the report and the others continue.
pub async fn pull_all<R: RemoteApi>(
    remote: &R,
    db: &DbState,
    kinds: &[EntityKind],
) -> Result<ResyncReport, SyncError> {
    let mut report = ResyncReport::default();

    for &kind in kinds {
        let docs = match remote.list(kind).await {
            Ok(docs) => docs,
            Err(ApiError::Unauthorized) => return Err(SyncError::SessionExpired),
            Err(e) => {
                warn!(entity = %kind, error = %e, "Resync of collection failed");
                report.errors.insert(kind.as_str().to_string(), e.to_string());
                continue;
            }
        };

        let mut conn = db.lock()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        // Rows deleted locally but not yet on the server stay deleted.
        let queued_deletes: HashSet<String> = queue::list(&tx)?
            .into_iter()
            .filter(|e| e.entity == kind && e.action == MutationAction::Delete)
            .map(|e| e.entity_id)
            .collect();
        let docs = docs
            .into_iter()
            .filter(|d| salvage_id(d).map_or(true, |id| !queued_deletes.contains(&id)))
            .collect();
        let counts = mirror::replace_all_synced(&tx, kind, docs)?;
        tx.commit().map_err(StoreError::from)?;

        info!(
            entity = %kind,
            upserted = counts.upserted,
            removed = counts.removed,
            kept_pending = counts.kept_pending,
            "Collection resynced"
        );
        report.refreshed.insert(kind.as_str().to_string(), counts);
    }

    Ok(report)
}

/// Pull everything, but only when no mirror table holds any row.
pub async fn resync_if_empty<R: RemoteApi>(
    remote: &R,
    db: &DbState,
) -> Result<Option<ResyncReport>, SyncError> {
    let empty = {
        let conn = db.lock()?;
        mirror::is_empty(&conn)?
    };
    if !empty {
        return Ok(None);
    }
    info!("Local mirror is empty; running full resync");
    pull_all(remote, db, &EntityKind::ALL).await.map(Some)
}

pub fn owner(db: &DbState) -> Result<Option<String>, StoreError> {
    let conn = db.lock()?;
    Ok(db::get_setting(&conn, ACCOUNT_SETTINGS_CATEGORY, OWNER_KEY))
}

pub fn record_owner(db: &DbState, user_id: &str) -> Result<(), StoreError> {
    let conn = db.lock()?;
    db::set_setting(&conn, ACCOUNT_SETTINGS_CATEGORY, OWNER_KEY, user_id)
}

pub fn check_account(db: &DbState, user_id: &str) -> Result<AccountCheck, StoreError> {
    let conn = db.lock()?;
    let check = match db::get_setting(&conn, ACCOUNT_SETTINGS_CATEGORY, OWNER_KEY) {
        None => AccountCheck::FirstSignIn,
        Some(previous) if previous == user_id => AccountCheck::SameUser,
        Some(previous_user_id) => {
            let stats = queue::stats(&conn)?;
            AccountCheck::DifferentUser {
                previous_user_id,
                pending: stats.pending + stats.failed,
            }
        }
    };
    Ok(check)
}

/// Hand the local store over to `user_id` and pull their data.
///
/// `previous` is the engine still holding the previous user's session; it
/// is required for [`AccountSwitch::SyncPendingFirst`].
pub async fn switch_account<R, P>(
    db: &DbState,
    remote: &R,
    previous: Option<&SyncEngine<P>>,
    user_id: &str,
    mode: AccountSwitch,
) -> Result<ResyncReport, SyncError>
where
    R: RemoteApi,
    P: RemoteApi,
{
    if mode == AccountSwitch::SyncPendingFirst {
        let engine = previous.ok_or_else(|| {
            SyncError::NotConfigured("no session for the previous account".into())
        })?;
        loop {
            let report = engine.drain_queue().await?;
            if report.synced == 0 {
                break;
            }
        }
        let remaining = {
            let conn = db.lock()?;
            let stats = queue::stats(&conn)?;
            stats.pending + stats.failed
        };
        if remaining > 0 {
            warn!(remaining, "Refusing account switch with unsynced changes");
            return Err(SyncError::PendingEntriesRemain(remaining as usize));
        }
    }

    {
        let mut conn = db.lock()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        let dropped = queue::clear_all(&tx)?;
        mirror::clear_all(&tx)?;
        db::set_setting(&tx, ACCOUNT_SETTINGS_CATEGORY, OWNER_KEY, user_id)?;
        tx.commit().map_err(StoreError::from)?;
        info!(user_id, dropped_entries = dropped, "Local store handed to new account");
    }

    pull_all(remote, db, &EntityKind::ALL).await
}

/// Sign-in flow: claim the store for a first or returning user and pull
/// their data; report a different previous owner back to the host.
pub async fn sign_in<R: RemoteApi>(
    db: &DbState,
    remote: &R,
    user_id: &str,
) -> Result<SignInOutcome, SyncError> {
    match check_account(db, user_id)? {
        check @ AccountCheck::DifferentUser { .. } => {
            info!(user_id, "Signed-in user differs from local data owner");
            Ok(SignInOutcome::NeedsDecision(check))
        }
        AccountCheck::FirstSignIn | AccountCheck::SameUser => {
            record_owner(db, user_id)?;
            let resync = pull_all(remote, db, &EntityKind::ALL).await?;
            Ok(SignInOutcome::Ready { resync })
        }
    }
}
