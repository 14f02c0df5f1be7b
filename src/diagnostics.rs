//! Diagnostics for support requests.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Queue snapshot**: queue stats, per-entity backlog, entry metadata and
//!   mirror row counts
//! - **Diagnostics export**: a zip bundle with the above, recent sync
//!   errors, the last sanitize failure and the log files
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files

use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fs;
use std::io::{Read as _, Write as _};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::entities::EntityKind;
use crate::error::DiagnosticsError;
use crate::mirror::{self, DEBUG_SETTINGS_CATEGORY, LAST_SANITIZE_FAILURE_KEY};
use crate::queue;
use crate::sync::SyncStatusSnapshot;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Maximum bytes copied per log file into a bundle (5 MB).
pub const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "recordbook.log";

const RECENT_ERROR_LIMIT: i64 = 20;

#[derive(Debug, Clone, Copy)]
pub struct DiagnosticsExportOptions {
    pub include_logs: bool,
    pub redact_sensitive: bool,
}

impl Default for DiagnosticsExportOptions {
    fn default() -> Self {
        Self {
            include_logs: true,
            redact_sensitive: true,
        }
    }
}

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
        "schemaVersion": db::CURRENT_SCHEMA_VERSION,
    })
}

// ---------------------------------------------------------------------------
// Queue snapshot
// ---------------------------------------------------------------------------

fn backlog_by_entity(conn: &Connection) -> Result<Value, rusqlite::Error> {
    let mut result = serde_json::Map::new();
    let mut stmt = conn.prepare(
        "SELECT entity, action, failed, COUNT(*) FROM sync_queue
         GROUP BY entity, action, failed",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;
    for row in rows {
        let (entity, action, failed, count) = row?;
        let bucket = if failed != 0 { "failed" } else { "pending" };
        let entry = result.entry(entity).or_insert_with(|| json!({}));
        entry[format!("{action}_{bucket}")] = json!(count);
    }
    Ok(Value::Object(result))
}

/// Queue and mirror state for the support screen. Payloads are left out.
pub fn queue_snapshot(conn: &Connection) -> Result<Value, DiagnosticsError> {
    let stats = queue::stats(conn)?;
    let entries: Vec<Value> = queue::list(conn)?
        .into_iter()
        .map(|e| {
            json!({
                "id": e.id,
                "entity": e.entity.as_str(),
                "entityId": e.entity_id,
                "action": e.action.as_str(),
                "attempts": e.attempts,
                "failed": e.failed,
                "lastError": e.last_error,
                "nextAttemptAt": e.next_attempt_at,
                "createdAt": e.created_at,
            })
        })
        .collect();

    let mut mirror_counts = serde_json::Map::new();
    for kind in EntityKind::ALL {
        let pending = mirror::list_pending(conn, kind)?.len();
        mirror_counts.insert(
            kind.as_str().to_string(),
            json!({ "total": mirror::count(conn, kind)?, "pending": pending }),
        );
    }

    Ok(json!({
        "schemaVersion": db::schema_version(conn),
        "stats": stats,
        "backlog": backlog_by_entity(conn).map_err(crate::error::StoreError::from)?,
        "entries": entries,
        "mirror": mirror_counts,
    }))
}

fn recent_sync_errors(conn: &Connection, limit: i64) -> Vec<Value> {
    let mut errors = Vec::new();
    if let Ok(mut stmt) = conn.prepare(
        "SELECT id, entity, entity_id, action, last_error, attempts, failed, updated_at
         FROM sync_queue
         WHERE last_error IS NOT NULL AND last_error != ''
         ORDER BY COALESCE(updated_at, created_at) DESC LIMIT ?1",
    ) {
        if let Ok(rows) = stmt.query_map(params![limit], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "entity": row.get::<_, String>(1)?,
                "entityId": row.get::<_, String>(2)?,
                "action": row.get::<_, String>(3)?,
                "lastError": row.get::<_, String>(4)?,
                "attempts": row.get::<_, i64>(5)?,
                "failed": row.get::<_, i64>(6)? != 0,
                "updatedAt": row.get::<_, Option<String>>(7)?,
            }))
        }) {
            errors.extend(rows.flatten());
        }
    }
    errors
}

// ---------------------------------------------------------------------------
// Diagnostics export (zip bundle)
// ---------------------------------------------------------------------------

/// Write a diagnostics zip into `output_dir` and return its path.
pub fn export_diagnostics(
    db: &DbState,
    sync_status: Option<&SyncStatusSnapshot>,
    output_dir: &Path,
    log_dir: Option<&Path>,
    options: DiagnosticsExportOptions,
) -> Result<PathBuf, DiagnosticsError> {
    let (snapshot, errors, sanitize_failure) = {
        let conn = db.lock()?;
        let sanitize_failure = db::get_setting(&conn, DEBUG_SETTINGS_CATEGORY, LAST_SANITIZE_FAILURE_KEY)
            .map(|raw| serde_json::from_str(&raw).unwrap_or(Value::String(raw)))
            .unwrap_or(Value::Null);
        (
            queue_snapshot(&conn)?,
            json!(recent_sync_errors(&conn, RECENT_ERROR_LIMIT)),
            sanitize_failure,
        )
    };

    fs::create_dir_all(output_dir)?;
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let zip_path = output_dir.join(format!("recordbook-diagnostics-{timestamp}.zip"));
    let mut zip = zip::ZipWriter::new(fs::File::create(&zip_path)?);
    let zip_options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let documents = [
        ("about.json", about_info()),
        ("sync_status.json", serde_json::to_value(sync_status)?),
        ("queue.json", snapshot),
        ("sync_errors.json", errors),
        ("last_sanitize_failure.json", sanitize_failure),
    ];
    for (name, value) in documents {
        let value = if options.redact_sensitive {
            redact_sensitive_fields(value)
        } else {
            value
        };
        zip.start_file(name, zip_options)?;
        zip.write_all(serde_json::to_string_pretty(&value)?.as_bytes())?;
    }

    if let Some(log_dir) = log_dir.filter(|_| options.include_logs) {
        for path in log_files(log_dir) {
            let Some(fname) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            let mut buf = Vec::new();
            match fs::File::open(&path) {
                Ok(f) => {
                    // Cap per file to keep the bundle manageable
                    if let Err(e) = f.take(MAX_LOG_SIZE).read_to_end(&mut buf) {
                        warn!("Skipping unreadable log file {}: {e}", path.display());
                        continue;
                    }
                }
                Err(e) => {
                    warn!("Skipping unreadable log file {}: {e}", path.display());
                    continue;
                }
            }
            zip.start_file(format!("logs/{fname}"), zip_options)?;
            zip.write_all(&buf)?;
        }
    }

    zip.finish()?;
    info!(path = %zip_path.display(), "Diagnostics bundle written");
    Ok(zip_path)
}

fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if should_redact_key(&key) {
                        (key, Value::String("[REDACTED]".to_string()))
                    } else {
                        (key, redact_sensitive_fields(value))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact_sensitive_fields).collect()),
        Value::String(s) => Value::String(redact_bearer(&s)),
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
        "cookie",
        "iban",
        "email",
        "payloadpreview",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

/// Mask bearer tokens that ended up inside free-text error messages.
fn redact_bearer(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("Bearer ") {
        let (head, tail) = rest.split_at(pos + "Bearer ".len());
        out.push_str(head);
        out.push_str("[REDACTED]");
        rest = tail.trim_start_matches(|c: char| !c.is_whitespace() && c != '"');
    }
    out.push_str(rest);
    out
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Default log directory under the platform's local data dir.
pub fn default_log_dir() -> PathBuf {
    default_data_dir().join("logs")
}

/// Default data directory holding `recordbook.db`.
pub fn default_data_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("app.recordbook.client")
}

/// Log files in `log_dir`, newest first.
fn log_files(log_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(LOG_FILE_PREFIX));
            if path.is_file() && is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                files.push((path, modified));
            }
        }
    }
    files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    files.into_iter().map(|(path, _)| path).collect()
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    let mut removed = 0;
    for path in log_files(log_dir).iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
