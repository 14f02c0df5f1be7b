//! Recordbook offline data layer.
//!
//! Local SQLite mirror of the records/invoicing collections, a durable
//! mutation queue fed by optimistic writes, and a background engine that
//! drains the queue against the REST API. [`OfflineSync`] wires the pieces
//! together for a host process; the `recordbook` binary is the thin
//! headless host.

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod api;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod entities;
pub mod error;
pub mod mirror;
pub mod producer;
pub mod queue;
pub mod resync;
pub mod retry;
pub mod sanitize;
pub mod storage;
pub mod sync;
#[cfg(test)]
mod testing;

use crate::api::{HttpApi, RemoteApi};
use crate::config::SyncConfig;
use crate::db::DbState;
use crate::entities::EntityKind;
use crate::error::{DiagnosticsError, StoreError, SyncError};
use crate::producer::Producer;
use crate::resync::SignInOutcome;
use crate::sanitize::Document;
use crate::sync::{SyncEngine, SyncState, SyncStatusSnapshot};

/// Replace every string equal to `from` inside `value` with `to`.
/// Returns whether anything changed.
pub(crate) fn replace_string_values(value: &mut Value, from: &str, to: &str) -> bool {
    match value {
        Value::String(s) if s.as_str() == from => {
            *s = to.to_string();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, v| replace_string_values(v, from, to) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, v| replace_string_values(v, from, to) || changed),
        _ => false,
    }
}

/// Install the global subscriber: console plus a daily rolling file in
/// `log_dir`. Keep the returned guard alive; dropping it flushes the file.
pub fn init_logging(log_dir: &Path) -> std::io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    diagnostics::prune_old_logs(log_dir);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,recordbook_lib=debug"));
    let file_appender = tracing_appender::rolling::daily(log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .is_err()
    {
        warn!("Global tracing subscriber already installed; keeping it");
    }
    Ok(guard)
}

// ============================================================================
// Service object
// ============================================================================

/// Everything a host needs to read, write and sync offline data.
pub struct OfflineSync<R> {
    db: Arc<DbState>,
    producer: Producer,
    engine: Arc<SyncEngine<R>>,
    cancel: CancellationToken,
}

impl<R: RemoteApi + 'static> OfflineSync<R> {
    pub fn new(db: Arc<DbState>, remote: Arc<R>, config: SyncConfig) -> Self {
        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            remote,
            config,
            Arc::new(SyncState::new()),
        ));
        Self {
            producer: Producer::new(db.clone()),
            db,
            engine,
            cancel: CancellationToken::new(),
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    pub fn list(&self, kind: EntityKind) -> Result<Vec<Document>, StoreError> {
        let conn = self.db.lock()?;
        mirror::list(&conn, kind)
    }

    pub fn get(&self, kind: EntityKind, id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.db.lock()?;
        mirror::get(&conn, kind, id)
    }

    pub fn status(&self) -> Result<SyncStatusSnapshot, StoreError> {
        self.engine.status()
    }

    pub async fn sign_in(&self, user_id: &str) -> Result<SignInOutcome, SyncError> {
        resync::sign_in(&self.db, self.engine.remote().as_ref(), user_id).await
    }

    /// Start the background loop. It runs until [`OfflineSync::shutdown`].
    pub fn start(&self) -> JoinHandle<()> {
        sync::start_sync_loop(self.engine.clone(), self.cancel.clone())
    }

    pub fn shutdown(&self) {
        info!("Stopping sync loop");
        self.cancel.cancel();
    }

    pub fn export_diagnostics(
        &self,
        output_dir: &Path,
        log_dir: Option<&Path>,
    ) -> Result<PathBuf, DiagnosticsError> {
        let status = self.status()?;
        diagnostics::export_diagnostics(
            &self.db,
            Some(&status),
            output_dir,
            log_dir,
            diagnostics::DiagnosticsExportOptions::default(),
        )
    }
}

// ============================================================================
// Headless host entry point
// ============================================================================

pub async fn run() -> anyhow::Result<()> {
    use anyhow::Context as _;

    let log_dir = diagnostics::default_log_dir();
    let _guard = init_logging(&log_dir).context("failed to set up logging")?;
    info!("Starting Recordbook sync v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = diagnostics::default_data_dir();
    let db = Arc::new(db::init(&data_dir).context("failed to open local database")?);
    let config = {
        let conn = db.lock()?;
        SyncConfig::load(&conn)
    };
    info!(
        interval_secs = config.interval_secs,
        batch_size = config.batch_size,
        max_attempts = config.retry.max_attempts,
        pull_interval_secs = config.pull_interval_secs,
        "Sync configuration loaded"
    );

    let session = storage::Session::load()
        .context("no stored session; sign in from the app before starting sync")?;
    if let Some(claims) = session.claims() {
        if claims.is_expired(chrono::Utc::now().timestamp()) {
            warn!(user_id = %claims.user_id, "Stored session token has expired; requests will be rejected");
        }
        info!(user_id = %claims.user_id, admin = claims.is_admin(), "Session loaded");
    }

    let remote = Arc::new(HttpApi::new(
        session.base_url(),
        session.clone(),
        config.request_timeout(),
    )?);
    let app = OfflineSync::new(db, remote, config);

    if let Some(user_id) = session.user_id() {
        if let SignInOutcome::NeedsDecision(check) = app.sign_in(user_id).await? {
            anyhow::bail!(
                "local data belongs to another account ({check:?}); switch accounts from the app first"
            );
        }
    }

    let handle = app.start();
    app.engine().state().request_sync();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    app.shutdown();
    handle.await.context("sync loop task panicked")?;
    info!("Recordbook sync stopped");
    Ok(())
}
